//! Engine configuration
//!
//! Loaded once at startup from a TOML file, with `.env` support for secrets
//! (RPC endpoints, key material identifiers stay out of the file). Every
//! recognized option is validated here; a bad config prevents engine start.

use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::ConfigError;
use crate::numeric;
use crate::types::PoolKind;

/// Top-level engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub chain_id: u64,

    /// Primary endpoint first, ordered backups after
    #[serde(default)]
    pub rpc_urls: Vec<String>,
    #[serde(default)]
    pub relay_url: String,

    /// Engine wallet (the trading account). Checked, not custodied.
    pub wallet_address: String,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_records_dir")]
    pub records_dir: PathBuf,

    /// Tokens the path finder may route through
    pub tokens: Vec<TokenConfig>,
    /// Start tokens for arbitrage cycles (subset of `tokens` by address)
    pub start_tokens: Vec<String>,

    /// Capital per cycle, in whole units of the start token
    pub capital: Decimal,

    #[serde(default = "default_max_path_length")]
    pub max_path_length: usize,
    #[serde(default = "default_max_paths")]
    pub max_paths: usize,
    #[serde(default = "default_min_allocation_share")]
    pub min_allocation_share: Decimal,
    #[serde(default = "default_min_profit_threshold")]
    pub min_profit_threshold: Decimal,
    /// Minimum profit margin for a path to survive scoring
    #[serde(default = "default_min_margin")]
    pub min_margin: Decimal,
    #[serde(default = "default_slippage_tolerance")]
    pub slippage_tolerance: Decimal,
    #[serde(default = "default_max_concurrent_trades")]
    pub max_concurrent_trades: usize,
    #[serde(default = "default_max_parallel_requests")]
    pub max_parallel_requests: usize,

    /// Gas cost model for path scoring
    #[serde(default = "default_base_gas")]
    pub base_gas: u64,
    #[serde(default = "default_per_hop_gas")]
    pub per_hop_gas: u64,

    #[serde(default)]
    pub gas: GasConfig,
    #[serde(default)]
    pub mev: MevConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(rename = "venues")]
    pub venues: Vec<VenueConfig>,
}

/// A token the engine may hold or route through.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    pub address: String,
    pub decimals: u8,
    #[serde(default)]
    pub symbol: String,
    /// Whole units of this token per one whole native token; used to price
    /// gas costs in path-profit terms. The wrapped native token keeps the
    /// default of 1.
    #[serde(default = "default_native_price")]
    pub native_price: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GasConfig {
    /// Priority fee floor, gwei
    #[serde(default = "default_min_priority_fee")]
    pub min_priority_fee: Decimal,
    /// Priority fee ceiling, gwei
    #[serde(default = "default_max_priority_fee")]
    pub max_priority_fee: Decimal,
    /// Fraction of expected profit the bundle may spend on gas
    #[serde(default = "default_max_profit_fraction")]
    pub max_profit_fraction: Decimal,
}

impl Default for GasConfig {
    fn default() -> Self {
        Self {
            min_priority_fee: default_min_priority_fee(),
            max_priority_fee: default_max_priority_fee(),
            max_profit_fraction: default_max_profit_fraction(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MevConfig {
    #[serde(default = "default_true")]
    pub sandwich_detection: bool,
    #[serde(default = "default_true")]
    pub frontrun_detection: bool,
    #[serde(default = "default_true")]
    pub backrun_detection: bool,
    #[serde(default = "default_max_bundle_size")]
    pub max_bundle_size: usize,
    #[serde(default = "default_max_blocks_ahead")]
    pub max_blocks_ahead: u64,
}

impl Default for MevConfig {
    fn default() -> Self {
        Self {
            sandwich_detection: true,
            frontrun_detection: true,
            backrun_detection: true,
            max_bundle_size: default_max_bundle_size(),
            max_blocks_ahead: default_max_blocks_ahead(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rps")]
    pub rps: u32,
    #[serde(default = "default_max_backoff_s")]
    pub max_backoff_s: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rps: default_rps(),
            max_backoff_s: default_max_backoff_s(),
            batch_size: default_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_ttl_blocks")]
    pub ttl_blocks: u64,
    #[serde(default = "default_cache_entries")]
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_blocks: default_ttl_blocks(),
            max_entries: default_cache_entries(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_risk_window")]
    pub window_blocks: usize,
    #[serde(default = "default_medium_threshold")]
    pub medium_threshold: Decimal,
    #[serde(default = "default_high_threshold")]
    pub high_threshold: Decimal,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            window_blocks: default_risk_window(),
            medium_threshold: default_medium_threshold(),
            high_threshold: default_high_threshold(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_simulation_timeout_ms")]
    pub simulation_ms: u64,
    #[serde(default = "default_max_simulations")]
    pub max_simulations: u32,
    #[serde(default = "default_submit_timeout_ms")]
    pub submit_ms: u64,
    #[serde(default = "default_cycle_budget_ms")]
    pub cycle_budget_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            simulation_ms: default_simulation_timeout_ms(),
            max_simulations: default_max_simulations(),
            submit_ms: default_submit_timeout_ms(),
            cycle_budget_ms: default_cycle_budget_ms(),
        }
    }
}

/// Per-venue configuration. Addresses stay strings here; the registry
/// validates and parses them.
#[derive(Debug, Clone, Deserialize)]
pub struct VenueConfig {
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub kind: PoolKind,
    pub router: Option<String>,
    pub factory: Option<String>,
    pub quoter: Option<String>,
    /// Single fee tier, parts of 10_000 for V2/stable
    pub fee: Option<u32>,
    /// Multiple fee tiers (V3-family)
    pub fees: Option<Vec<u32>>,
    /// QuoterV2 struct-param ABI instead of the flat QuoterV1 ABI
    #[serde(default)]
    pub quoter_v2: bool,
    /// Pre-registered pools for venues without on-chain discovery (stable)
    #[serde(default)]
    pub pools: Vec<StaticPoolConfig>,
}

/// A statically configured pool (stableswap venues have no factory lookup).
#[derive(Debug, Clone, Deserialize)]
pub struct StaticPoolConfig {
    pub address: String,
    pub tokens: Vec<String>,
    #[serde(default = "default_stable_amp")]
    pub amp: u64,
}

fn default_true() -> bool { true }
fn default_poll_interval() -> u64 { 2_000 }
fn default_records_dir() -> PathBuf { PathBuf::from("data/records") }
fn default_max_path_length() -> usize { 3 }
fn default_max_paths() -> usize { 5 }
fn default_min_allocation_share() -> Decimal { Decimal::new(10, 2) } // 0.10
fn default_min_profit_threshold() -> Decimal { Decimal::new(1, 2) } // 0.01
fn default_min_margin() -> Decimal { Decimal::new(2, 3) } // 0.002
fn default_slippage_tolerance() -> Decimal { Decimal::new(5, 3) } // 0.005
fn default_max_concurrent_trades() -> usize { 3 }
fn default_max_parallel_requests() -> usize { 10 }
fn default_base_gas() -> u64 { 150_000 }
fn default_per_hop_gas() -> u64 { 100_000 }
fn default_min_priority_fee() -> Decimal { Decimal::ONE } // 1 gwei
fn default_max_priority_fee() -> Decimal { Decimal::from(50) } // 50 gwei
fn default_max_profit_fraction() -> Decimal { Decimal::new(1, 1) } // 0.1
fn default_max_bundle_size() -> usize { 10 }
fn default_max_blocks_ahead() -> u64 { 3 }
fn default_rps() -> u32 { 20 }
fn default_max_backoff_s() -> u64 { 30 }
fn default_batch_size() -> usize { 10 }
fn default_ttl_blocks() -> u64 { 1 }
fn default_cache_entries() -> usize { 4_096 }
fn default_risk_window() -> usize { 10 }
fn default_medium_threshold() -> Decimal { Decimal::new(25, 2) } // 0.25
fn default_high_threshold() -> Decimal { Decimal::new(35, 2) } // 0.35
fn default_simulation_timeout_ms() -> u64 { 5_000 }
fn default_max_simulations() -> u32 { 3 }
fn default_submit_timeout_ms() -> u64 { 30_000 }
fn default_cycle_budget_ms() -> u64 { 60_000 }
fn default_stable_amp() -> u64 { 100 }
fn default_native_price() -> Decimal { Decimal::ONE }

impl EngineConfig {
    /// Load from a TOML file, apply env overrides, validate.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.as_ref().display(), e)))?;
        let mut config: Self =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        // Endpoints usually come from the environment so the file can be
        // committed without secrets
        if let Ok(urls) = std::env::var("ARB_RPC_URLS") {
            config.rpc_urls = urls.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(url) = std::env::var("ARB_RELAY_URL") {
            config.relay_url = url;
        }

        config.validate()?;
        Ok(config)
    }

    /// Startup validation: a failure here prevents the engine from starting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rpc_urls.is_empty() {
            return Err(ConfigError::MissingField("rpc_urls".into()));
        }
        if self.relay_url.is_empty() {
            return Err(ConfigError::MissingField("relay_url".into()));
        }
        check_address("wallet_address", &self.wallet_address)?;

        if self.tokens.is_empty() {
            return Err(ConfigError::MissingField("tokens".into()));
        }
        for token in &self.tokens {
            check_address("tokens[].address", &token.address)?;
            if token.decimals > 36 {
                return Err(ConfigError::InvalidValue {
                    field: format!("tokens[{}].decimals", token.address),
                    reason: "must be 0..=36".into(),
                });
            }
        }
        if self.start_tokens.is_empty() {
            return Err(ConfigError::MissingField("start_tokens".into()));
        }
        for start in &self.start_tokens {
            let addr = check_address("start_tokens[]", start)?;
            let known = self
                .tokens
                .iter()
                .any(|t| numeric::parse_address(&t.address).map(|a| a == addr).unwrap_or(false));
            if !known {
                return Err(ConfigError::InvalidValue {
                    field: "start_tokens".into(),
                    reason: format!("{} not present in tokens list", start),
                });
            }
        }

        if self.capital <= Decimal::ZERO {
            return Err(ConfigError::InvalidValue {
                field: "capital".into(),
                reason: "must be positive".into(),
            });
        }
        if self.max_path_length < 2 {
            return Err(ConfigError::InvalidValue {
                field: "max_path_length".into(),
                reason: "must be >= 2".into(),
            });
        }
        if self.max_paths < 1 {
            return Err(ConfigError::InvalidValue {
                field: "max_paths".into(),
                reason: "must be >= 1".into(),
            });
        }
        if self.min_allocation_share <= Decimal::ZERO || self.min_allocation_share > Decimal::ONE {
            return Err(ConfigError::InvalidValue {
                field: "min_allocation_share".into(),
                reason: "must be in (0, 1]".into(),
            });
        }
        if self.slippage_tolerance < Decimal::ZERO
            || self.slippage_tolerance > Decimal::new(5, 1)
        {
            return Err(ConfigError::InvalidValue {
                field: "slippage_tolerance".into(),
                reason: "must be in [0, 0.5]".into(),
            });
        }
        if self.gas.min_priority_fee > self.gas.max_priority_fee {
            return Err(ConfigError::InvalidValue {
                field: "gas.min_priority_fee".into(),
                reason: "exceeds gas.max_priority_fee".into(),
            });
        }
        if self.cache.ttl_blocks < 1 {
            return Err(ConfigError::InvalidValue {
                field: "cache.ttl_blocks".into(),
                reason: "must be >= 1".into(),
            });
        }

        let enabled = self.venues.iter().filter(|v| v.enabled).count();
        if enabled == 0 {
            return Err(ConfigError::InvalidValue {
                field: "venues".into(),
                reason: "no enabled venues".into(),
            });
        }
        let mut seen_ids: Vec<&str> = Vec::new();
        for venue in &self.venues {
            if seen_ids.contains(&venue.id.as_str()) {
                return Err(ConfigError::Venue {
                    venue: venue.id.clone(),
                    reason: "duplicate venue id".into(),
                });
            }
            seen_ids.push(&venue.id);
        }

        Ok(())
    }

    /// Enabled venues only, in config order.
    pub fn enabled_venues(&self) -> impl Iterator<Item = &VenueConfig> {
        self.venues.iter().filter(|v| v.enabled)
    }
}

impl VenueConfig {
    /// Fee tiers to consider, whichever of `fee`/`fees` was given.
    pub fn fee_tiers(&self) -> Vec<u32> {
        if let Some(fees) = &self.fees {
            fees.clone()
        } else if let Some(fee) = self.fee {
            vec![fee]
        } else {
            Vec::new()
        }
    }
}

/// Length + hex check on a configured address.
pub fn check_address(field: &str, value: &str) -> Result<alloy::primitives::Address, ConfigError> {
    let stripped = value.trim().trim_start_matches("0x");
    if stripped.len() != 40 || !stripped.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ConfigError::InvalidAddress {
            field: field.to_string(),
            value: value.to_string(),
        });
    }
    alloy::primitives::Address::from_str(value.trim()).map_err(|_| ConfigError::InvalidAddress {
        field: field.to_string(),
        value: value.to_string(),
    })
}
