//! Bundle simulation and validation
//!
//! Simulates a bundle against its target block through the relay, then runs
//! the validation predicates: realized profit over threshold, gas inside
//! the envelope, no stray balance changes, every sub-call successful, and
//! per-step slippage within its risk-adjusted tolerance. The first failing
//! check aborts submission and is carried on the outcome record.

use alloy::primitives::{Address, U256};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{EngineError, TransportError, ValidationError};
use crate::transport::relay::{BundleParams, RelaySimResponse};
use crate::transport::RelayClient;
use crate::types::{BalanceDiff, Bundle, SimulatedTx, SimulationResult};

/// Gas envelope factor over the summed step estimates, in halves (3/2).
const GAS_ENVELOPE_NUM: u64 = 3;
const GAS_ENVELOPE_DENOM: u64 = 2;

pub struct BundleSimulator {
    relay: Arc<RelayClient>,
    timeout: Duration,
    max_attempts: u32,
}

impl BundleSimulator {
    pub fn new(relay: Arc<RelayClient>, timeout: Duration, max_attempts: u32) -> Self {
        Self {
            relay,
            timeout,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Simulate against the bundle's target block with the state of the
    /// block before it. Transient failures retry up to the attempt budget.
    pub async fn simulate(&self, bundle: &Bundle) -> Result<SimulationResult, EngineError> {
        let raw_txs: Vec<&[u8]> = bundle.txs.iter().map(|tx| tx.raw.as_ref()).collect();
        let params = BundleParams::new(&raw_txs, bundle.target_block)
            .with_state_block(bundle.target_block.saturating_sub(1));

        let mut last_error: Option<EngineError> = None;
        for attempt in 0..self.max_attempts {
            match tokio::time::timeout(self.timeout, self.relay.call_bundle(&params)).await {
                Ok(Ok(response)) => return Ok(convert(response)),
                Ok(Err(EngineError::Transport(e))) if e.is_transient() => {
                    debug!(attempt, error = %e, "simulation transport retry");
                    last_error = Some(EngineError::Transport(e));
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    warn!(attempt, "simulation timed out");
                    last_error = Some(EngineError::Transport(TransportError::Timeout(
                        self.timeout.as_millis() as u64,
                    )));
                }
            }
        }
        Err(last_error.unwrap_or(EngineError::Transport(TransportError::Timeout(0))))
    }

    /// All five checks, in order; the first failure wins.
    pub fn validate(
        &self,
        bundle: &Bundle,
        sim: &SimulationResult,
        min_profit_wei: U256,
        coinbase: Option<Address>,
    ) -> Result<(), ValidationError> {
        if !sim.success {
            let reason = sim
                .txs
                .iter()
                .find_map(|tx| tx.revert_reason.clone())
                .unwrap_or_else(|| "simulation unsuccessful".to_string());
            return Err(ValidationError::SimulationIncomplete(reason));
        }

        // 1. Realized profit over the configured minimum
        if sim.realized_profit < min_profit_wei {
            return Err(ValidationError::ProfitBelowMinimum);
        }

        // 2. Gas within 1.5x of the summed step estimates
        let envelope = bundle.gas_estimate * GAS_ENVELOPE_NUM / GAS_ENVELOPE_DENOM;
        if sim.total_gas_used > envelope {
            return Err(ValidationError::GasEnvelopeExceeded);
        }

        // 3. Balance changes only where expected: the engine wallet, the
        // involved pools, and the builder's coinbase
        let mut allowed: HashSet<Address> = bundle.involved_pools.iter().copied().collect();
        if let Some(tx) = bundle.txs.first() {
            allowed.insert(tx.from);
        }
        if let Some(coinbase) = coinbase {
            allowed.insert(coinbase);
        }
        for diff in &sim.balance_diffs {
            if !allowed.contains(&diff.address) {
                return Err(ValidationError::UnexpectedBalanceChange(
                    crate::numeric::checksum(diff.address),
                ));
            }
        }

        // 4. Every sub-call succeeded
        for (index, tx) in sim.txs.iter().enumerate() {
            if !tx.success {
                let reason = tx
                    .revert_reason
                    .clone()
                    .unwrap_or_else(|| format!("tx {} reverted", index));
                return Err(ValidationError::SubCallReverted(reason));
            }
        }

        // 5. Observed slippage within each step's adjusted tolerance
        for (index, (bundle_tx, sim_tx)) in bundle.txs.iter().zip(&sim.txs).enumerate() {
            let (Some(min_out), Some(observed)) = (bundle_tx.min_out, sim_tx.amount_out) else {
                continue;
            };
            if observed < min_out {
                return Err(ValidationError::StepSlippage(index));
            }
        }

        Ok(())
    }
}

fn convert(response: RelaySimResponse) -> SimulationResult {
    let success = response.results.iter().all(|r| r.success);
    SimulationResult {
        success,
        txs: response
            .results
            .into_iter()
            .map(|r| SimulatedTx {
                gas_used: r.gas_used,
                success: r.success,
                revert_reason: r.revert,
                amount_out: r.amount_out,
            })
            .collect(),
        total_gas_used: response.total_gas_used,
        effective_gas_price: response.bundle_gas_price,
        realized_profit: response.coinbase_diff.saturating_sub(response.gas_fees),
        balance_diffs: response
            .balance_changes
            .into_iter()
            .map(|c| BalanceDiff {
                address: c.address,
                delta_wei: c.delta_wei,
            })
            .collect(),
        state_block: response.state_block,
    }
}
