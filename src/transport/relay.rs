//! Authenticated relay client
//!
//! JSON-RPC to the block-builder relay with a signed identity header: the
//! header value is `"{address}:{signature_hex}"` where the signature is
//! ECDSA over the Keccak-256 hash of the exact JSON body, produced by a
//! reserved auth key distinct from the trading key.

use alloy::primitives::{hex, keccak256, Address, U256};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::rate_limiter::RateLimiter;
use super::{build_request, unwrap_envelope, JsonRpcConnection};
use crate::error::{EngineError, ProtocolError};
use crate::numeric;
use crate::signer::SigningOracle;

/// Header carrying the relay identity signature.
pub const AUTH_HEADER: &str = "X-Flashbots-Signature";

/// Bundle wire object for send/simulate calls.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleParams {
    pub txs: Vec<String>,
    pub block_number: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_block_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_timestamp: Option<String>,
}

impl BundleParams {
    pub fn new(raw_txs: &[impl AsRef<[u8]>], target_block: u64) -> Self {
        Self {
            txs: raw_txs
                .iter()
                .map(|tx| format!("0x{}", hex::encode(tx.as_ref())))
                .collect(),
            block_number: numeric::to_hex_quantity(target_block),
            state_block_number: None,
            timestamp: None,
            min_timestamp: None,
            max_timestamp: None,
        }
    }

    pub fn with_state_block(mut self, state_block: u64) -> Self {
        self.state_block_number = Some(numeric::to_hex_quantity(state_block));
        self
    }
}

/// Per-transaction entry in a simulation response.
#[derive(Debug, Clone)]
pub struct RelayTxResult {
    pub gas_used: u64,
    pub success: bool,
    pub revert: Option<String>,
    pub amount_out: Option<U256>,
}

/// Balance delta reported by the relay's state-diff summary.
#[derive(Debug, Clone)]
pub struct RelayBalanceChange {
    pub address: Address,
    pub delta_wei: i128,
}

/// Parsed simulate-bundle response.
#[derive(Debug, Clone)]
pub struct RelaySimResponse {
    pub bundle_hash: String,
    pub total_gas_used: u64,
    pub bundle_gas_price: U256,
    pub coinbase_diff: U256,
    pub gas_fees: U256,
    pub state_block: u64,
    pub results: Vec<RelayTxResult>,
    pub balance_changes: Vec<RelayBalanceChange>,
}

/// Relay inclusion status for a submitted bundle.
#[derive(Debug, Clone)]
pub struct BundleStats {
    pub included: bool,
    pub considered: bool,
    pub simulated: bool,
}

pub struct RelayClient {
    conn: Arc<dyn JsonRpcConnection>,
    relay_url: String,
    auth_signer: Arc<dyn SigningOracle>,
    limiter: Arc<RateLimiter>,
    id_counter: AtomicU64,
}

impl RelayClient {
    pub fn new(
        conn: Arc<dyn JsonRpcConnection>,
        relay_url: String,
        auth_signer: Arc<dyn SigningOracle>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            conn,
            relay_url,
            auth_signer,
            limiter,
            id_counter: AtomicU64::new(1),
        }
    }

    /// Sign the canonical body and produce the auth header value.
    fn auth_header(&self, body: &Value) -> Result<String, ProtocolError> {
        let canonical = serde_json::to_string(body)
            .map_err(|e| ProtocolError::MalformedResponse(format!("body encode: {}", e)))?;
        let digest = keccak256(canonical.as_bytes());
        let signature = self.auth_signer.sign_hash(digest)?;
        Ok(format!(
            "{}:0x{}",
            numeric::checksum(self.auth_signer.address()),
            hex::encode(signature)
        ))
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, EngineError> {
        self.limiter.acquire().await?;
        let body = build_request(
            self.id_counter.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        );
        let header = self.auth_header(&body).map_err(EngineError::Protocol)?;
        debug!(method, "relay call");
        let response = self
            .conn
            .send(
                &self.relay_url,
                &[(AUTH_HEADER.to_string(), header)],
                body,
            )
            .await
            .map_err(EngineError::Transport)?;
        unwrap_envelope(response).map_err(EngineError::Protocol)
    }

    fn params_value(params: &BundleParams) -> Result<Value, EngineError> {
        serde_json::to_value(params)
            .map_err(|e| EngineError::Protocol(ProtocolError::MalformedResponse(e.to_string())))
    }

    /// Submit a bundle for a target block; returns the relay's bundle hash.
    pub async fn send_bundle(&self, params: &BundleParams) -> Result<String, EngineError> {
        let result = self
            .call("eth_sendBundle", json!([Self::params_value(params)?]))
            .await?;
        result
            .get("bundleHash")
            .and_then(|h| h.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                EngineError::Protocol(ProtocolError::MalformedResponse(
                    "sendBundle response missing bundleHash".into(),
                ))
            })
    }

    /// Simulate a bundle against a state block.
    pub async fn call_bundle(&self, params: &BundleParams) -> Result<RelaySimResponse, EngineError> {
        let result = self
            .call("eth_callBundle", json!([Self::params_value(params)?]))
            .await?;
        parse_sim_response(&result).map_err(EngineError::Protocol)
    }

    /// Inclusion/consideration status for a submitted bundle.
    pub async fn bundle_stats(
        &self,
        bundle_hash: &str,
        target_block: u64,
    ) -> Result<BundleStats, EngineError> {
        let result = self
            .call(
                "flashbots_getBundleStats",
                json!([{
                    "bundleHash": bundle_hash,
                    "blockNumber": numeric::to_hex_quantity(target_block),
                }]),
            )
            .await?;
        Ok(BundleStats {
            included: result
                .get("isIncluded")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            considered: result
                .get("isConsidered")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            simulated: result
                .get("isSimulated")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }

    /// Relay-side reputation counters for this identity.
    pub async fn user_stats(&self, recent_block: u64) -> Result<Value, EngineError> {
        self.call(
            "flashbots_getUserStats",
            json!([numeric::to_hex_quantity(recent_block)]),
        )
        .await
    }
}

/// Parse the simulate response, tolerating hex-or-int numerics throughout.
fn parse_sim_response(value: &Value) -> Result<RelaySimResponse, ProtocolError> {
    let results_json = value
        .get("results")
        .and_then(Value::as_array)
        .ok_or_else(|| ProtocolError::MalformedResponse("simulation missing results".into()))?;

    let mut results = Vec::with_capacity(results_json.len());
    for entry in results_json {
        let revert = entry
            .get("error")
            .or_else(|| entry.get("revert"))
            .and_then(Value::as_str)
            .map(str::to_string);
        results.push(RelayTxResult {
            gas_used: entry
                .get("gasUsed")
                .and_then(numeric::parse_hex_or_int)
                .unwrap_or(0),
            success: revert.is_none(),
            revert,
            amount_out: entry.get("amountOut").and_then(numeric::parse_hex_or_u256),
        });
    }

    let mut balance_changes = Vec::new();
    if let Some(changes) = value.get("balanceChanges").and_then(Value::as_array) {
        for change in changes {
            let Some(address) = change
                .get("address")
                .and_then(Value::as_str)
                .and_then(|s| numeric::parse_address(s).ok())
            else {
                continue;
            };
            let delta_wei = change
                .get("delta")
                .map(|d| match d {
                    Value::Number(n) => n.as_i64().map(i128::from).unwrap_or(0),
                    Value::String(s) => s.parse::<i128>().unwrap_or_else(|_| {
                        numeric::parse_hex_or_u256(d)
                            .map(|u| i128::try_from(u).unwrap_or(i128::MAX))
                            .unwrap_or(0)
                    }),
                    _ => 0,
                })
                .unwrap_or(0);
            balance_changes.push(RelayBalanceChange { address, delta_wei });
        }
    }

    Ok(RelaySimResponse {
        bundle_hash: value
            .get("bundleHash")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        total_gas_used: value
            .get("totalGasUsed")
            .and_then(numeric::parse_hex_or_int)
            .unwrap_or_else(|| results.iter().map(|r| r.gas_used).sum()),
        bundle_gas_price: value
            .get("bundleGasPrice")
            .and_then(numeric::parse_hex_or_u256)
            .unwrap_or(U256::ZERO),
        coinbase_diff: value
            .get("coinbaseDiff")
            .and_then(numeric::parse_hex_or_u256)
            .unwrap_or(U256::ZERO),
        gas_fees: value
            .get("gasFees")
            .and_then(numeric::parse_hex_or_u256)
            .unwrap_or(U256::ZERO),
        state_block: value
            .get("stateBlockNumber")
            .and_then(numeric::parse_hex_or_int)
            .unwrap_or(0),
        results,
        balance_changes,
    })
}
