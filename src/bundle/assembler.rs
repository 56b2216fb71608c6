//! Bundle assembler
//!
//! Transforms a selected allocation into an ordered, signed transaction
//! bundle: optional flash-loan borrow, the swap legs with risk-scaled
//! slippage, the repay leg, and an optional backrun guard. Gas parameters
//! adapt to the risk level and are clamped so the bundle never spends more
//! than the configured fraction of its own expected profit.

use alloy::primitives::{keccak256, Address, Bytes, U256};
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, InvariantError, ValidationError};
use crate::numeric;
use crate::signer::{NonceManager, SigningOracle, TxRequest};
use crate::types::{
    AllocationPlan, ArbitragePath, Bundle, BundleState, BundleTx, GasProfile, RiskAssessment,
    RiskLevel, TokenRef,
};
use crate::venues::VenueRegistry;

/// Swap deadline horizon, seconds past assembly time.
const DEADLINE_SECS: i64 = 300;

/// Gas budgeted for the backrun guard transaction.
const BACKRUN_GAS: u64 = 30_000;

/// Slippage ceiling after risk scaling.
const SLIPPAGE_CAP: Decimal = Decimal::from_parts(5, 0, 0, false, 1); // 0.5

/// Optional flash-loan wrapper: one borrow call before the swaps, one repay
/// call after. Provider selection (Aave, Balancer, ...) lives behind this
/// trait.
pub trait FlashLoanProvider: Send + Sync {
    fn wrap(&self, token: TokenRef, amount: U256) -> FlashLoanCalls;
}

#[derive(Debug, Clone)]
pub struct FlashLoanCalls {
    pub borrow_to: Address,
    pub borrow_data: Bytes,
    pub repay_to: Address,
    pub repay_data: Bytes,
    pub gas_each: u64,
}

pub struct BundleAssembler {
    registry: Arc<VenueRegistry>,
    signer: Arc<dyn SigningOracle>,
    nonces: Arc<NonceManager>,
    chain_id: u64,
    wallet: Address,
    base_slippage: Decimal,
    min_profit_threshold: Decimal,
    min_priority_fee_wei: U256,
    max_priority_fee_wei: U256,
    max_profit_fraction: Decimal,
    max_bundle_size: usize,
    backrun_enabled: bool,
    /// Whole units of each token per one whole native token
    native_prices: HashMap<Address, Decimal>,
    flash_loan: Option<Arc<dyn FlashLoanProvider>>,
}

impl BundleAssembler {
    pub fn new(
        registry: Arc<VenueRegistry>,
        signer: Arc<dyn SigningOracle>,
        nonces: Arc<NonceManager>,
        config: &EngineConfig,
        wallet: Address,
        flash_loan: Option<Arc<dyn FlashLoanProvider>>,
    ) -> Self {
        let native_prices = config
            .tokens
            .iter()
            .filter_map(|t| {
                let address = numeric::parse_address(&t.address).ok()?;
                Some((address, t.native_price))
            })
            .collect();
        Self {
            registry,
            signer,
            nonces,
            chain_id: config.chain_id,
            wallet,
            base_slippage: config.slippage_tolerance,
            min_profit_threshold: config.min_profit_threshold,
            min_priority_fee_wei: gwei_to_wei(config.gas.min_priority_fee),
            max_priority_fee_wei: gwei_to_wei(config.gas.max_priority_fee),
            max_profit_fraction: config.gas.max_profit_fraction,
            max_bundle_size: config.mev.max_bundle_size,
            backrun_enabled: config.mev.backrun_detection,
            native_prices,
            flash_loan,
        }
    }

    /// Per-step slippage after risk scaling, capped at 0.5.
    pub fn risk_slippage(&self, level: RiskLevel) -> Decimal {
        (self.base_slippage * level.slippage_scale()).min(SLIPPAGE_CAP)
    }

    /// Priority fee for the risk level: floor plus the risk-scaled gwei
    /// bump, clamped into the configured band.
    pub fn priority_fee(&self, level: RiskLevel) -> U256 {
        let bump = gwei_to_wei(level.priority_scale());
        let fee = self.min_priority_fee_wei + bump;
        fee.clamp(self.min_priority_fee_wei, self.max_priority_fee_wei)
    }

    /// Backrun guard attaches for large transactions or whenever the
    /// environment is not calm.
    pub fn wants_backrun(&self, plan: &AllocationPlan, level: RiskLevel) -> bool {
        if !self.backrun_enabled {
            return false;
        }
        if level != RiskLevel::Low {
            return true;
        }
        let capital = numeric::amount_to_decimal(plan.total_capital, plan.start_token.decimals)
            .unwrap_or(Decimal::ZERO);
        capital >= self.min_profit_threshold * Decimal::from(10u64)
    }

    /// Build and sign the bundle for one plan against the current risk
    /// assessment. Target block is the next one; the submission controller
    /// may shift it forward.
    pub fn assemble(
        &self,
        plan: &AllocationPlan,
        risk: &RiskAssessment,
        current_block: u64,
    ) -> Result<Bundle, EngineError> {
        let slippage = self.risk_slippage(risk.level);
        let deadline = (Utc::now().timestamp() + DEADLINE_SECS).max(0) as u64;

        // Swap calls, path by path, steps scaled to the allocated size
        let mut swap_calls = Vec::new();
        let mut involved_pools = Vec::new();
        for (path, allocation) in &plan.allocations {
            if !path.is_closed() {
                return Err(EngineError::Invariant(InvariantError::OpenPath {
                    start: path.start_token().map(|t| t.checksummed()).unwrap_or_default(),
                    end: path.end_token().map(|t| t.checksummed()).unwrap_or_default(),
                }));
            }
            for (hop, pair) in path.steps.windows(2).enumerate() {
                if pair[0].amount_out != pair[1].amount_in {
                    return Err(EngineError::Invariant(InvariantError::BrokenStepChain(
                        hop + 1,
                    )));
                }
            }
            for step in scale_steps(path, *allocation) {
                let adapter = self.registry.get(&step.venue).ok_or_else(|| {
                    EngineError::Invariant(InvariantError::Other(format!(
                        "venue {} vanished from registry",
                        step.venue
                    )))
                })?;
                let call = adapter
                    .build_swap(&step, self.wallet, deadline, slippage)
                    .map_err(EngineError::Adapter)?;
                if !involved_pools.contains(&step.pool.address) {
                    involved_pools.push(step.pool.address);
                }
                swap_calls.push((step, call));
            }
        }
        if swap_calls.is_empty() {
            return Err(EngineError::NoPaths);
        }

        let wants_backrun = self.wants_backrun(plan, risk.level);
        let flash = self
            .flash_loan
            .as_ref()
            .map(|p| p.wrap(plan.start_token, plan.total_capital));

        // Respect the bundle size cap: swaps are trimmed from the tail
        // (whole paths lose their later steps first) before optional parts
        let overhead = usize::from(wants_backrun) + if flash.is_some() { 2 } else { 0 };
        let max_swaps = self.max_bundle_size.saturating_sub(overhead).max(1);
        if swap_calls.len() > max_swaps {
            warn!(
                swaps = swap_calls.len(),
                max_swaps, "trimming bundle to size cap"
            );
            swap_calls.truncate(max_swaps);
        }

        // Gas totals before pricing
        let swap_gas: u64 = swap_calls.iter().map(|(_, c)| c.gas_limit).sum();
        let flash_gas = flash.as_ref().map(|f| f.gas_each * 2).unwrap_or(0);
        let backrun_gas = if wants_backrun { BACKRUN_GAS } else { 0 };
        let gas_estimate = swap_gas + flash_gas + backrun_gas;

        let expected_profit_wei = self.to_wei(plan.start_token, plan.expected_profit)?;
        let gas_profile = self.gas_profile(
            risk,
            gas_estimate,
            expected_profit_wei,
        )?;

        // Sign everything with a contiguous nonce run
        let tx_count = swap_calls.len() + overhead;
        let nonces = self.nonces.acquire_run(tx_count);
        let mut txs: Vec<BundleTx> = Vec::with_capacity(tx_count);
        let mut nonce_iter = nonces.iter().copied();

        if let Some(f) = &flash {
            txs.push(self.sign_tx(
                f.borrow_to,
                f.borrow_data.clone(),
                U256::ZERO,
                f.gas_each,
                nonce_iter.next().expect("nonce run sized"),
                &gas_profile,
                None,
                None,
            )?);
        }
        for (step, call) in &swap_calls {
            txs.push(self.sign_tx(
                call.to,
                call.calldata.clone(),
                call.value,
                call.gas_limit,
                nonce_iter.next().expect("nonce run sized"),
                &gas_profile,
                Some(step.amount_out),
                Some(call.min_out),
            )?);
        }
        if let Some(f) = &flash {
            txs.push(self.sign_tx(
                f.repay_to,
                f.repay_data.clone(),
                U256::ZERO,
                f.gas_each,
                nonce_iter.next().expect("nonce run sized"),
                &gas_profile,
                None,
                None,
            )?);
        }
        if wants_backrun {
            let fingerprint = backrun_fingerprint(&involved_pools);
            txs.push(self.sign_tx(
                self.wallet,
                fingerprint,
                U256::ZERO,
                BACKRUN_GAS,
                nonce_iter.next().expect("nonce run sized"),
                &gas_profile,
                None,
                None,
            )?);
        }

        let bundle_cost = gas_profile.max_fee_per_gas * U256::from(gas_estimate);
        info!(
            txs = txs.len(),
            target = current_block + 1,
            backrun = wants_backrun,
            risk = %risk.level,
            "bundle assembled"
        );

        Ok(Bundle {
            txs,
            target_block: current_block + 1,
            gas_profile,
            bundle_cost,
            expected_profit: expected_profit_wei,
            state: BundleState::Draft,
            involved_pools,
            start_token: plan.start_token,
            has_backrun: wants_backrun,
            gas_estimate,
        })
    }

    /// Re-price an existing bundle against a new base fee and risk level,
    /// re-signing every transaction with its original nonce.
    pub fn reprice(
        &self,
        bundle: &mut Bundle,
        risk: &RiskAssessment,
    ) -> Result<(), EngineError> {
        let gas_profile = self.gas_profile(risk, bundle.gas_estimate, bundle.expected_profit)?;
        let old_txs = std::mem::take(&mut bundle.txs);
        for tx in old_txs {
            bundle.txs.push(self.sign_tx(
                tx.to,
                tx.input.clone(),
                tx.value,
                tx.gas_limit,
                tx.nonce,
                &gas_profile,
                tx.quoted_out,
                tx.min_out,
            )?);
        }
        bundle.gas_profile = gas_profile;
        bundle.bundle_cost = gas_profile.max_fee_per_gas * U256::from(bundle.gas_estimate);
        debug!(
            max_fee = %gas_profile.max_fee_per_gas,
            priority = %gas_profile.priority_fee_per_gas,
            "bundle repriced"
        );
        Ok(())
    }

    /// Release a bundle's nonces back to the manager (permanent rejection
    /// path); they re-issue FIFO.
    pub fn release_nonces(&self, bundle: &Bundle) {
        let nonces: Vec<u64> = bundle.txs.iter().map(|tx| tx.nonce).collect();
        self.nonces.release_run(&nonces);
    }

    /// `max_fee = base_fee * 1.1 + priority`, clamped so the whole bundle
    /// spends at most `max_profit_fraction` of its expected profit.
    fn gas_profile(
        &self,
        risk: &RiskAssessment,
        gas_estimate: u64,
        expected_profit_wei: U256,
    ) -> Result<GasProfile, EngineError> {
        let priority = self.priority_fee(risk.level);
        let base_floor = risk.base_fee * U256::from(11u64) / U256::from(10u64);
        let mut max_fee = base_floor + priority;

        let budget = mul_fraction(expected_profit_wei, self.max_profit_fraction);
        if !budget.is_zero() && gas_estimate > 0 {
            let ceiling = budget / U256::from(gas_estimate);
            if max_fee > ceiling {
                max_fee = ceiling;
            }
        }
        if max_fee < base_floor {
            // The profit cannot buy its way past the base fee; this bundle
            // is not economical to land
            return Err(EngineError::Validation(ValidationError::ProfitBelowMinimum));
        }

        Ok(GasProfile {
            max_fee_per_gas: max_fee,
            priority_fee_per_gas: priority.min(max_fee),
            gas_limit: gas_estimate + gas_estimate / 5,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn sign_tx(
        &self,
        to: Address,
        input: Bytes,
        value: U256,
        gas_limit: u64,
        nonce: u64,
        gas: &GasProfile,
        quoted_out: Option<U256>,
        min_out: Option<U256>,
    ) -> Result<BundleTx, EngineError> {
        let request = TxRequest {
            chain_id: self.chain_id,
            nonce,
            to,
            value,
            input: input.clone(),
            gas_limit,
            max_fee_per_gas: u256_to_u128(gas.max_fee_per_gas),
            max_priority_fee_per_gas: u256_to_u128(gas.priority_fee_per_gas),
        };
        let raw = self
            .signer
            .sign_transaction(&request)
            .map_err(EngineError::Protocol)?;
        Ok(BundleTx {
            raw,
            from: self.signer.address(),
            to,
            value,
            input,
            nonce,
            gas_limit,
            quoted_out,
            min_out,
        })
    }

    /// Expected profit in wei via the start token's native price.
    fn to_wei(&self, token: TokenRef, amount: U256) -> Result<U256, EngineError> {
        let price = self
            .native_prices
            .get(&token.address)
            .copied()
            .unwrap_or(Decimal::ONE);
        if price <= Decimal::ZERO {
            return Ok(U256::ZERO);
        }
        let whole = numeric::amount_to_decimal(amount, token.decimals)
            .map_err(EngineError::Adapter)?;
        numeric::decimal_to_amount(whole / price, 18).map_err(EngineError::Adapter)
    }
}

/// Scale a path's steps to an allocated size, preserving the amount chain.
fn scale_steps(path: &ArbitragePath, allocation: U256) -> Vec<crate::types::PathStep> {
    if path.amount_in.is_zero() || allocation == path.amount_in {
        return path.steps.clone();
    }
    path.steps
        .iter()
        .map(|step| {
            let mut scaled = step.clone();
            scaled.amount_in = step.amount_in * allocation / path.amount_in;
            scaled.amount_out = step.amount_out * allocation / path.amount_in;
            scaled
        })
        .collect()
}

/// The backrun guard carries a fingerprint of the protected pools so the
/// bundle's tail is unique to this opportunity.
fn backrun_fingerprint(pools: &[Address]) -> Bytes {
    let mut preimage = Vec::with_capacity(pools.len() * 20);
    for pool in pools {
        preimage.extend_from_slice(pool.as_slice());
    }
    Bytes::from(keccak256(&preimage).to_vec())
}

fn gwei_to_wei(gwei: Decimal) -> U256 {
    let wei = (gwei * Decimal::from(1_000_000_000u64)).trunc();
    U256::from(wei.to_u128().unwrap_or(0))
}

fn u256_to_u128(value: U256) -> u128 {
    value.try_into().unwrap_or(u128::MAX)
}

fn mul_fraction(value: U256, fraction: Decimal) -> U256 {
    let ppm = (fraction * Decimal::from(1_000_000u64))
        .trunc()
        .to_u128()
        .unwrap_or(0);
    value * U256::from(ppm) / U256::from(1_000_000u64)
}
