//! On-chain DEX arbitrage engine
//!
//! Observes liquidity across AMM venues, discovers circular price
//! discrepancies, allocates capital over the best paths, and executes the
//! trades atomically as private bundles through a block-builder relay.

pub mod arbitrage;
pub mod bundle;
pub mod config;
pub mod encoding;
pub mod engine;
pub mod error;
pub mod numeric;
pub mod quoting;
pub mod records;
pub mod risk;
pub mod signer;
pub mod transport;
pub mod types;
pub mod venues;

// Re-export the pieces a host binary wires together
pub use config::EngineConfig;
pub use engine::ArbEngine;
pub use error::EngineError;
pub use signer::{LocalSigner, SigningOracle};
pub use types::{ArbitragePath, Bundle, CycleOutcome, RiskAssessment, RiskLevel};
