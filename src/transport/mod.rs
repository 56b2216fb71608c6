//! Transport layer
//!
//! The engine talks to the chain through a rate-limited JSON-RPC client with
//! endpoint failover, and to the block builder through a separately
//! authenticated relay client. The HTTP hop itself sits behind the
//! [`JsonRpcConnection`] trait so tests inject canned responses.

pub mod rate_limiter;
pub mod relay;
pub mod rpc;

pub use rate_limiter::RateLimiter;
pub use relay::{RelayClient, RelaySimResponse};
pub use rpc::{HttpConnection, RpcClient};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{ProtocolError, TransportError};

/// One HTTP POST of a JSON-RPC payload (single object or batch array) to one
/// endpoint. Production impl is reqwest; tests use scripted mocks.
#[async_trait]
pub trait JsonRpcConnection: Send + Sync {
    async fn send(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: Value,
    ) -> Result<Value, TransportError>;
}

/// Build a JSON-RPC 2.0 request object.
pub fn build_request(id: u64, method: &str, params: Value) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    })
}

/// Unwrap a JSON-RPC envelope: exactly one of `result` / `error` is present.
pub fn unwrap_envelope(response: Value) -> Result<Value, ProtocolError> {
    if let Some(error) = response.get("error") {
        let code = error.get("code").and_then(|c| c.as_i64()).unwrap_or(0);
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown")
            .to_string();
        return Err(classify_rpc_error(code, message));
    }
    match response.get("result") {
        Some(result) => Ok(result.clone()),
        None => Err(ProtocolError::MalformedResponse(
            "envelope missing both result and error".into(),
        )),
    }
}

/// Map JSON-RPC error codes onto the taxonomy: method-not-found and auth
/// failures are permanent, the rest stay generic.
fn classify_rpc_error(code: i64, message: String) -> ProtocolError {
    match code {
        -32601 => ProtocolError::UnknownMethod(message),
        -32600 | -32602 | -32700 => ProtocolError::MalformedResponse(message),
        _ if message.to_ascii_lowercase().contains("unauthorized")
            || message.to_ascii_lowercase().contains("forbidden")
            || message.to_ascii_lowercase().contains("signature") =>
        {
            ProtocolError::AuthRejected(message)
        }
        _ => ProtocolError::Rpc { code, message },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_request_shape() {
        let req = build_request(7, "eth_blockNumber", serde_json::json!([]));
        assert_eq!(req["jsonrpc"], "2.0");
        assert_eq!(req["id"], 7);
        assert_eq!(req["method"], "eth_blockNumber");
    }

    #[test]
    fn test_unwrap_result() {
        let value = unwrap_envelope(serde_json::json!({"jsonrpc": "2.0", "id": 1, "result": "0x10"}))
            .unwrap();
        assert_eq!(value, serde_json::json!("0x10"));
    }

    #[test]
    fn test_unwrap_method_not_found() {
        let err = unwrap_envelope(serde_json::json!({
            "jsonrpc": "2.0", "id": 1,
            "error": {"code": -32601, "message": "method eth_foo not found"}
        }))
        .unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownMethod(_)));
        assert!(err.is_permanent());
    }

    #[test]
    fn test_unwrap_auth_rejected() {
        let err = unwrap_envelope(serde_json::json!({
            "error": {"code": -32000, "message": "invalid signature header"}
        }))
        .unwrap_err();
        assert!(matches!(err, ProtocolError::AuthRejected(_)));
    }

    #[test]
    fn test_unwrap_missing_both() {
        let err = unwrap_envelope(serde_json::json!({"jsonrpc": "2.0", "id": 1})).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedResponse(_)));
    }
}
