//! Submission controller
//!
//! Drives a bundle through its state machine against the relay: simulate,
//! validate, submit for the target block, watch for inclusion, and walk the
//! target forward across a bounded window of future blocks. Between
//! retries the bundle is re-simulated only when the base fee moved more
//! than ten percent or the risk level changed; gas is re-optimized against
//! the new base fee either way.

use alloy::primitives::U256;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::assembler::BundleAssembler;
use super::simulation::BundleSimulator;
use crate::error::{EngineError, TransportError, ValidationError};
use crate::risk::RiskAnalyzer;
use crate::transport::relay::BundleParams;
use crate::transport::{RelayClient, RpcClient};
use crate::types::{BlockSummary, Bundle, BundleState, RiskAssessment};

/// Base-fee move that forces a fresh simulation, in tenths.
const RESIM_BASE_FEE_TENTHS: u64 = 1; // 10%

#[derive(Debug, Clone)]
pub enum SubmissionOutcome {
    Included {
        bundle_hash: String,
        realized_profit: U256,
    },
    Expired,
    Failed(ValidationError),
    Rejected(String),
}

pub struct SubmissionController {
    relay: Arc<RelayClient>,
    rpc: Arc<RpcClient>,
    simulator: BundleSimulator,
    risk: Arc<RiskAnalyzer>,
    max_blocks_ahead: u64,
    submit_timeout: Duration,
    block_poll: Duration,
}

impl SubmissionController {
    pub fn new(
        relay: Arc<RelayClient>,
        rpc: Arc<RpcClient>,
        simulator: BundleSimulator,
        risk: Arc<RiskAnalyzer>,
        max_blocks_ahead: u64,
        submit_timeout: Duration,
        block_poll: Duration,
    ) -> Self {
        Self {
            relay,
            rpc,
            simulator,
            risk,
            max_blocks_ahead: max_blocks_ahead.max(1),
            submit_timeout,
            block_poll,
        }
    }

    /// Drive one bundle to a terminal state.
    pub async fn drive(
        &self,
        bundle: &mut Bundle,
        assembler: &BundleAssembler,
        initial_risk: &RiskAssessment,
        min_profit_wei: U256,
        cancel: &CancellationToken,
    ) -> Result<SubmissionOutcome, EngineError> {
        let target0 = bundle.target_block;
        let mut sim_base_fee = initial_risk.base_fee;
        let mut last_level = initial_risk.level;

        // Draft -> Simulating -> Ready | Failed
        bundle.state = BundleState::Simulating;
        let mut sim = self.simulator.simulate(bundle).await?;
        if let Err(check) = self
            .simulator
            .validate(bundle, &sim, min_profit_wei, None)
        {
            return Ok(self.fail(bundle, assembler, check));
        }
        bundle.state = BundleState::Ready;

        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Transport(TransportError::Cancelled));
            }

            // Ready -> Submitting -> Pending
            bundle.state = BundleState::Submitting;
            let raw_txs: Vec<&[u8]> = bundle.txs.iter().map(|tx| tx.raw.as_ref()).collect();
            let params = BundleParams::new(&raw_txs, bundle.target_block)
                .with_state_block(bundle.target_block.saturating_sub(1));

            let bundle_hash = match tokio::time::timeout(
                self.submit_timeout,
                self.relay.send_bundle(&params),
            )
            .await
            {
                Ok(Ok(hash)) => hash,
                Ok(Err(EngineError::Protocol(p))) if p.is_permanent() => {
                    warn!(error = %p, "relay rejected bundle permanently");
                    bundle.state = BundleState::Rejected;
                    assembler.release_nonces(bundle);
                    return Ok(SubmissionOutcome::Rejected(p.to_string()));
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    return Err(EngineError::Transport(TransportError::Timeout(
                        self.submit_timeout.as_millis() as u64,
                    )))
                }
            };
            bundle.state = BundleState::Pending;
            info!(
                hash = %bundle_hash,
                target = bundle.target_block,
                "bundle pending"
            );

            // Wait for the target block to be mined, then ask the relay
            self.wait_for_block(bundle.target_block, cancel).await?;
            let stats = self
                .relay
                .bundle_stats(&bundle_hash, bundle.target_block)
                .await;
            let included = match stats {
                Ok(stats) => stats.included,
                Err(EngineError::Protocol(p)) if p.is_permanent() => {
                    bundle.state = BundleState::Rejected;
                    assembler.release_nonces(bundle);
                    return Ok(SubmissionOutcome::Rejected(p.to_string()));
                }
                Err(e) => return Err(e),
            };
            if included {
                bundle.state = BundleState::Included;
                info!(hash = %bundle_hash, block = bundle.target_block, "bundle included");
                return Ok(SubmissionOutcome::Included {
                    bundle_hash,
                    realized_profit: sim.realized_profit,
                });
            }

            // Pending -> Submitting for T+1 while the window allows
            if bundle.target_block - target0 >= self.max_blocks_ahead {
                debug!(target = bundle.target_block, "retry window exhausted");
                bundle.state = BundleState::Expired;
                assembler.release_nonces(bundle);
                return Ok(SubmissionOutcome::Expired);
            }
            bundle.target_block += 1;

            // Fresh view of the fee environment for the next attempt
            let head = self.rpc.block_number().await?;
            let (_, new_base_fee) = self.rpc.block_base_fee(head).await?;
            let gas_price = self.rpc.gas_price().await?;
            self.risk.observe(BlockSummary {
                number: head,
                base_fee: new_base_fee,
                avg_priority_fee: gas_price.saturating_sub(new_base_fee),
            });
            let new_risk = self.risk.assess(gas_price);

            let fee_moved = base_fee_moved(sim_base_fee, new_base_fee);
            let level_changed = new_risk.level != last_level;
            // Gas re-optimizes against the new base fee on every retry
            assembler.reprice(bundle, &new_risk)?;

            if fee_moved || level_changed {
                debug!(
                    fee_moved,
                    level_changed,
                    target = bundle.target_block,
                    "re-simulating before retry"
                );
                bundle.state = BundleState::Simulating;
                sim = self.simulator.simulate(bundle).await?;
                if let Err(check) =
                    self.simulator.validate(bundle, &sim, min_profit_wei, None)
                {
                    return Ok(self.fail(bundle, assembler, check));
                }
                bundle.state = BundleState::Ready;
                sim_base_fee = new_base_fee;
                last_level = new_risk.level;
            } else {
                debug!(target = bundle.target_block, "reusing prior simulation");
                bundle.state = BundleState::Ready;
            }
        }
    }

    fn fail(
        &self,
        bundle: &mut Bundle,
        assembler: &BundleAssembler,
        check: ValidationError,
    ) -> SubmissionOutcome {
        warn!(check = %check, "bundle validation failed");
        bundle.state = BundleState::Failed;
        assembler.release_nonces(bundle);
        SubmissionOutcome::Failed(check)
    }

    async fn wait_for_block(
        &self,
        target: u64,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let deadline = tokio::time::Instant::now() + self.submit_timeout;
        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Transport(TransportError::Cancelled));
            }
            let head = self.rpc.block_number().await?;
            if head >= target {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::Transport(TransportError::Timeout(
                    self.submit_timeout.as_millis() as u64,
                )));
            }
            tokio::time::sleep(self.block_poll).await;
        }
    }
}

fn base_fee_moved(old: U256, new: U256) -> bool {
    if old.is_zero() {
        return !new.is_zero();
    }
    let diff = if new > old { new - old } else { old - new };
    diff * U256::from(10u64) > old * U256::from(RESIM_BASE_FEE_TENTHS)
}
