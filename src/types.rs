//! Core data structures for the arbitrage engine
//!
//! Raw token amounts are always `U256` in the token's smallest unit; ratios
//! (margins, impact, slippage, volatility) are `Decimal`. Entities here are
//! owned by the transient cycle that produced them unless noted otherwise.

use alloy::primitives::{Address, Bytes, U256};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ValidationError;
use crate::numeric;

/// A token as the engine sees it: normalized address plus display scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenRef {
    pub address: Address,
    pub decimals: u8,
}

impl TokenRef {
    /// Decimals outside 0..=36 are rejected at construction.
    pub fn new(address: Address, decimals: u8) -> Option<Self> {
        if decimals > 36 {
            return None;
        }
        Some(Self { address, decimals })
    }

    /// EIP-55 checksummed form, used wherever an address reaches a wire or a
    /// log line.
    pub fn checksummed(&self) -> String {
        numeric::checksum(self.address)
    }
}

impl fmt::Display for TokenRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.checksummed())
    }
}

/// Stable venue tag, e.g. `"aerodrome-v2"`. Unique within the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VenueId(pub String);

impl VenueId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VenueId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for VenueId {
    fn from(s: &str) -> Self {
        VenueId(s.to_string())
    }
}

/// AMM families the engine can quote. Closed set; adapters dispatch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolKind {
    /// Constant product x*y=k with a basis-point fee
    V2,
    /// Concentrated liquidity (sqrtPrice, liquidity, tick)
    V3,
    /// Stableswap invariant with amplification coefficient
    Stable,
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PoolKind::V2 => write!(f, "v2"),
            PoolKind::V3 => write!(f, "v3"),
            PoolKind::Stable => write!(f, "stable"),
        }
    }
}

/// A discovered pool. Token set is fixed at discovery; venue params are
/// opaque to everything except the owning adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pool {
    pub venue: VenueId,
    pub address: Address,
    pub tokens: Vec<TokenRef>,
    /// Fee in the venue's native unit: parts of 10_000 for V2/stable,
    /// the tier value (100/500/3000/10000) for V3
    pub fee: u32,
    pub kind: PoolKind,
    /// Venue-specific extras (e.g. stable pool token indices); only the
    /// adapter that created the pool interprets this
    #[serde(default)]
    pub venue_params: serde_json::Value,
}

impl Pool {
    pub fn token_index(&self, address: Address) -> Option<usize> {
        self.tokens.iter().position(|t| t.address == address)
    }
}

/// On-chain state snapshot for a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolStateData {
    V2 {
        reserve0: U256,
        reserve1: U256,
    },
    V3 {
        sqrt_price_x96: U256,
        liquidity: u128,
        tick: i32,
    },
    Stable {
        balances: Vec<U256>,
        amp: u64,
    },
}

/// Pool state tagged with the block it was read at. Block height only moves
/// forward for a given pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolState {
    pub pool_address: Address,
    pub data: PoolStateData,
    pub block_number: u64,
}

impl PoolState {
    /// A state is unusable when its liquidity figures are empty.
    pub fn is_empty(&self) -> bool {
        match &self.data {
            PoolStateData::V2 { reserve0, reserve1 } => reserve0.is_zero() || reserve1.is_zero(),
            PoolStateData::V3 { liquidity, .. } => *liquidity == 0,
            PoolStateData::Stable { balances, .. } => balances.iter().any(|b| b.is_zero()),
        }
    }
}

/// A single venue quote for one direction and size.
#[derive(Debug, Clone)]
pub struct Quote {
    pub pool: Pool,
    pub token_in: TokenRef,
    pub token_out: TokenRef,
    pub amount_in: U256,
    pub amount_out: U256,
    /// Relative deviation from the pre-trade marginal price, in [0, 1]
    pub price_impact: Decimal,
    pub gas_estimate: u64,
    pub block_number: u64,
}

/// One hop of an arbitrage path. `amount_in` always equals the previous
/// step's `amount_out`.
#[derive(Debug, Clone)]
pub struct PathStep {
    pub venue: VenueId,
    pub pool: Pool,
    pub token_in: TokenRef,
    pub token_out: TokenRef,
    pub amount_in: U256,
    pub amount_out: U256,
    pub fee: u32,
}

/// A closed sequence of swaps: starts and ends in the same token.
#[derive(Debug, Clone)]
pub struct ArbitragePath {
    pub steps: Vec<PathStep>,
    pub amount_in: U256,
    pub amount_out: U256,
    /// amount_out - amount_in in start-token raw units; zero when negative
    pub gross_profit: U256,
    /// gross minus gas cost converted to start-token units
    pub net_profit: U256,
    /// amount_out / amount_in - 1
    pub profit_margin: Decimal,
    pub gas_estimate: u64,
}

impl ArbitragePath {
    pub fn start_token(&self) -> Option<&TokenRef> {
        self.steps.first().map(|s| &s.token_in)
    }

    pub fn end_token(&self) -> Option<&TokenRef> {
        self.steps.last().map(|s| &s.token_out)
    }

    pub fn is_closed(&self) -> bool {
        match (self.start_token(), self.end_token()) {
            (Some(a), Some(b)) => a.address == b.address,
            _ => false,
        }
    }

    /// Venue tags in hop order, used for deterministic tie-breaking.
    pub fn venue_key(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.venue.as_str()).collect()
    }

    /// Pools touched by this path, deduplicated by address.
    pub fn pool_addresses(&self) -> Vec<Address> {
        let mut seen = Vec::new();
        for step in &self.steps {
            if !seen.contains(&step.pool.address) {
                seen.push(step.pool.address);
            }
        }
        seen
    }
}

/// Capital split across the selected paths. Produced by the optimizer.
#[derive(Debug, Clone)]
pub struct AllocationPlan {
    pub start_token: TokenRef,
    /// (path, allocated amount in start-token raw units); zero-allocation
    /// paths are not listed
    pub allocations: Vec<(ArbitragePath, U256)>,
    pub total_capital: U256,
    /// Recomputed under the quadratic slippage model
    pub expected_profit: U256,
}

/// EIP-1559 gas parameters attached to a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasProfile {
    pub max_fee_per_gas: U256,
    pub priority_fee_per_gas: U256,
    pub gas_limit: u64,
}

/// Bundle lifecycle states. Terminal: Included, Expired, Rejected, Failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BundleState {
    Draft,
    Simulating,
    Ready,
    Submitting,
    Pending,
    Included,
    Expired,
    Rejected,
    Failed,
}

impl BundleState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BundleState::Included
                | BundleState::Expired
                | BundleState::Rejected
                | BundleState::Failed
        )
    }
}

impl fmt::Display for BundleState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            BundleState::Draft => "draft",
            BundleState::Simulating => "simulating",
            BundleState::Ready => "ready",
            BundleState::Submitting => "submitting",
            BundleState::Pending => "pending",
            BundleState::Included => "included",
            BundleState::Expired => "expired",
            BundleState::Rejected => "rejected",
            BundleState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// One signed transaction inside a bundle. The unsigned fields stay
/// alongside the raw encoding so a retry can re-price gas and re-sign with
/// the same nonce; the quoting context lets the validator check realized
/// slippage.
#[derive(Debug, Clone)]
pub struct BundleTx {
    pub raw: Bytes,
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub input: Bytes,
    pub nonce: u64,
    pub gas_limit: u64,
    /// For swap txs: quoted output and the risk-adjusted minimum accepted
    pub quoted_out: Option<U256>,
    pub min_out: Option<U256>,
}

/// An ordered, atomic group of signed transactions aimed at a target block.
#[derive(Debug, Clone)]
pub struct Bundle {
    pub txs: Vec<BundleTx>,
    /// First block the bundle was aimed at; retries may shift forward
    pub target_block: u64,
    pub gas_profile: GasProfile,
    /// max_fee * gas_estimate, in wei; same unit as expected_profit
    pub bundle_cost: U256,
    /// Expected profit in wei
    pub expected_profit: U256,
    pub state: BundleState,
    /// Pools the bundle touches; used for overlap serialization and the
    /// balance-diff whitelist
    pub involved_pools: Vec<Address>,
    pub start_token: TokenRef,
    pub has_backrun: bool,
    pub gas_estimate: u64,
}

/// Per-transaction simulation outcome.
#[derive(Debug, Clone)]
pub struct SimulatedTx {
    pub gas_used: u64,
    pub success: bool,
    pub revert_reason: Option<String>,
    /// Realized output for swap txs, when the relay reports it
    pub amount_out: Option<U256>,
}

/// A balance delta observed in the simulated state diff.
#[derive(Debug, Clone)]
pub struct BalanceDiff {
    pub address: Address,
    pub delta_wei: i128,
}

/// Result of simulating a bundle against a target block.
#[derive(Debug, Clone)]
pub struct SimulationResult {
    pub success: bool,
    pub txs: Vec<SimulatedTx>,
    pub total_gas_used: u64,
    pub effective_gas_price: U256,
    /// Value delta credited to the bundle (coinbase diff minus gas fees)
    pub realized_profit: U256,
    pub balance_diffs: Vec<BalanceDiff>,
    pub state_block: u64,
}

/// Discrete inclusion-environment risk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// Priority-fee scaling used by the assembler.
    pub fn priority_scale(&self) -> Decimal {
        match self {
            RiskLevel::Low => Decimal::new(10, 1),
            RiskLevel::Medium => Decimal::new(15, 1),
            RiskLevel::High => Decimal::new(20, 1),
        }
    }

    /// Slippage multiplier used by the assembler.
    pub fn slippage_scale(&self) -> Decimal {
        match self {
            RiskLevel::Low => Decimal::ONE,
            RiskLevel::Medium => Decimal::new(15, 1),
            RiskLevel::High => Decimal::TWO,
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
        }
    }
}

/// Snapshot of the inclusion environment, refreshed each cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    pub gas_price: U256,
    pub avg_gas_price: U256,
    pub gas_volatility: Decimal,
    pub base_fee: U256,
    pub factors: Vec<String>,
    pub block_number: u64,
}

/// Condensed view of one observed block, kept in the risk analyzer's ring
/// buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSummary {
    pub number: u64,
    pub base_fee: U256,
    pub avg_priority_fee: U256,
}

/// One structured record per cycle; the only user-visible outcome surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    Ok {
        bundle_hash: String,
        target_block: u64,
        realized_profit_wei: String,
    },
    NoOpportunity,
    ValidationFailed {
        check: ValidationError,
    },
    Expired,
    TransportAborted,
}

impl CycleOutcome {
    pub fn tag(&self) -> &'static str {
        match self {
            CycleOutcome::Ok { .. } => "ok",
            CycleOutcome::NoOpportunity => "no_opportunity",
            CycleOutcome::ValidationFailed { .. } => "validation_failed",
            CycleOutcome::Expired => "expired",
            CycleOutcome::TransportAborted => "transport_aborted",
        }
    }
}
