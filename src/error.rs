//! Engine error taxonomy
//!
//! Errors are grouped by recovery policy rather than by origin:
//! transport errors retry, protocol errors fail the bundle, adapter errors
//! drop the offending quote, validation errors mark the bundle Failed,
//! config errors prevent startup, invariant errors kill the current cycle.

use thiserror::Error;

/// RPC / relay connectivity failures. Recoverable; retried with exponential
/// backoff inside the rate-limited transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http error: {0}")]
    Http(String),

    #[error("request timed out after {0}ms")]
    Timeout(u64),

    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },

    #[error("all {0} endpoints exhausted")]
    EndpointsExhausted(usize),

    #[error("rate limiter rejected request (backoff exceeded {0}s)")]
    BackoffExceeded(u64),

    #[error("request cancelled")]
    Cancelled,
}

impl TransportError {
    /// Transient errors are worth retrying on the same or a backup endpoint.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Http(_) | TransportError::Timeout(_) => true,
            TransportError::ServerError { status, .. } => *status >= 500,
            TransportError::EndpointsExhausted(_)
            | TransportError::BackoffExceeded(_)
            | TransportError::Cancelled => false,
        }
    }
}

/// Malformed responses, auth failures, unknown methods. Non-recoverable for
/// the current bundle.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("signing failed: {0}")]
    Signing(String),
}

impl ProtocolError {
    /// Permanent errors abort the bundle rather than re-entering the retry
    /// window (spec: auth, malformed, unknown method).
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ProtocolError::AuthRejected(_)
                | ProtocolError::UnknownMethod(_)
                | ProtocolError::MalformedResponse(_)
        )
    }
}

/// Venue-level quoting failures. Localized: the offending quote is dropped
/// and path search continues.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("no pool for pair on venue {venue}")]
    NoPool { venue: String },

    #[error("stale pool state for {pool} (reserves empty or block behind)")]
    Stale { pool: String },

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("venue {venue} does not support {operation}")]
    Unsupported { venue: String, operation: String },

    #[error("numeric overflow in {0}")]
    Numeric(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Simulation predicate failures. The failing check is carried so the cycle
/// outcome can name it.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
pub enum ValidationError {
    #[error("realized profit below minimum")]
    ProfitBelowMinimum,

    #[error("gas used exceeds envelope")]
    GasEnvelopeExceeded,

    #[error("unexpected balance change at {0}")]
    UnexpectedBalanceChange(String),

    #[error("swap sub-call reverted: {0}")]
    SubCallReverted(String),

    #[error("step slippage exceeded tolerance at hop {0}")]
    StepSlippage(usize),

    #[error("simulation did not complete: {0}")]
    SimulationIncomplete(String),
}

/// Configuration problems detected at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("invalid address for {field}: {value}")]
    InvalidAddress { field: String, value: String },

    #[error("venue {venue}: {reason}")]
    Venue { venue: String, reason: String },

    #[error("failed to read config: {0}")]
    Io(String),

    #[error("failed to parse config: {0}")]
    Parse(String),
}

/// Internal consistency violations. Logged and terminates the current cycle
/// only; the engine keeps running.
#[derive(Debug, Error)]
pub enum InvariantError {
    #[error("path is not closed: starts {start}, ends {end}")]
    OpenPath { start: String, end: String },

    #[error("step amounts do not chain at hop {0}")]
    BrokenStepChain(usize),

    #[error("allocations do not sum to capital: {sum} vs {capital}")]
    AllocationSum { sum: String, capital: String },

    #[error("{0}")]
    Other(String),
}

/// Top-level engine error, carrying the taxonomy.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Invariant(#[from] InvariantError),

    #[error("no profitable paths")]
    NoPaths,

    #[error("cycle budget exhausted")]
    CycleTimeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(TransportError::Http("reset".into()).is_transient());
        assert!(TransportError::Timeout(5000).is_transient());
        assert!(TransportError::ServerError { status: 503, body: String::new() }.is_transient());
        assert!(!TransportError::ServerError { status: 400, body: String::new() }.is_transient());
        assert!(!TransportError::EndpointsExhausted(3).is_transient());
    }

    #[test]
    fn test_permanent_classification() {
        assert!(ProtocolError::AuthRejected("bad sig".into()).is_permanent());
        assert!(ProtocolError::UnknownMethod("eth_foo".into()).is_permanent());
        assert!(!ProtocolError::Rpc { code: -32000, message: "busy".into() }.is_permanent());
    }
}
