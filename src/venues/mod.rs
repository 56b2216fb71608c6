//! Venue registry
//!
//! Owns one adapter per enabled venue, validated from configuration at
//! startup. The registry is read-only after construction and shared across
//! the engine behind an `Arc`; paths refer to venues by id, never by
//! pointer.

pub mod adapter;
pub mod stable;
pub mod v2;
pub mod v3;

pub use adapter::{PoolAdapter, QuoteOutcome, SwapCall};

use alloy::primitives::Address;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::{check_address, EngineConfig, VenueConfig};
use crate::error::ConfigError;
use crate::transport::RpcClient;
use crate::types::{PoolKind, TokenRef, VenueId};

pub struct VenueRegistry {
    adapters: BTreeMap<VenueId, PoolAdapter>,
    /// Known tokens by address, used to resolve decimals during discovery
    tokens: BTreeMap<Address, TokenRef>,
}

impl std::fmt::Debug for VenueRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VenueRegistry")
            .field("adapter_count", &self.adapters.len())
            .field("token_count", &self.tokens.len())
            .finish()
    }
}

impl VenueRegistry {
    /// Build adapters for every enabled venue. Any validation failure here
    /// prevents engine start.
    pub fn from_config(config: &EngineConfig, rpc: Arc<RpcClient>) -> Result<Self, ConfigError> {
        let mut tokens = BTreeMap::new();
        for token in &config.tokens {
            let address = check_address("tokens[].address", &token.address)?;
            let token_ref = TokenRef::new(address, token.decimals).ok_or_else(|| {
                ConfigError::InvalidValue {
                    field: format!("tokens[{}].decimals", token.address),
                    reason: "must be 0..=36".into(),
                }
            })?;
            tokens.insert(address, token_ref);
        }

        let mut adapters = BTreeMap::new();
        for venue in config.enabled_venues() {
            let id = VenueId(venue.id.clone());
            let adapter = build_adapter(venue, &tokens, Arc::clone(&rpc))?;
            adapters.insert(id, adapter);
        }
        Ok(Self { adapters, tokens })
    }

    pub fn get(&self, id: &VenueId) -> Option<&PoolAdapter> {
        self.adapters.get(id)
    }

    /// Enabled venue ids in stable (lexicographic) order.
    pub fn venue_ids(&self) -> Vec<VenueId> {
        self.adapters.keys().cloned().collect()
    }

    pub fn token(&self, address: Address) -> Option<&TokenRef> {
        self.tokens.get(&address)
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Head advanced: drop per-block pool-existence entries so discovery
    /// re-checks at the new height.
    pub fn on_new_block(&self, block: u64) {
        for adapter in self.adapters.values() {
            adapter.on_new_block(block);
        }
    }
}

/// Validate one venue's configuration and construct its adapter.
fn build_adapter(
    venue: &VenueConfig,
    tokens: &BTreeMap<Address, TokenRef>,
    rpc: Arc<RpcClient>,
) -> Result<PoolAdapter, ConfigError> {
    let venue_err = |reason: &str| ConfigError::Venue {
        venue: venue.id.clone(),
        reason: reason.to_string(),
    };

    let router = venue
        .router
        .as_deref()
        .ok_or_else(|| venue_err("missing router"))?;
    let router = check_address(&format!("venues[{}].router", venue.id), router)?;

    let factory = venue
        .factory
        .as_deref()
        .ok_or_else(|| venue_err("missing factory"))?;
    let factory = check_address(&format!("venues[{}].factory", venue.id), factory)?;

    if let Some(fee) = venue.fee {
        if fee > 10_000 {
            return Err(venue_err("fee outside [0, 10000]"));
        }
    }

    let id = VenueId(venue.id.clone());
    match venue.kind {
        PoolKind::V2 => {
            let fee = venue.fee.unwrap_or(30);
            Ok(PoolAdapter::V2(v2::V2Adapter::new(
                id, router, factory, fee, rpc,
            )))
        }
        PoolKind::V3 => {
            let quoter = venue
                .quoter
                .as_deref()
                .ok_or_else(|| venue_err("missing quoter"))?;
            let quoter = check_address(&format!("venues[{}].quoter", venue.id), quoter)?;
            let tiers = venue.fee_tiers();
            if tiers.is_empty() {
                return Err(venue_err("no fee tiers configured"));
            }
            Ok(PoolAdapter::V3(v3::V3Adapter::new(
                id,
                router,
                factory,
                quoter,
                tiers,
                venue.quoter_v2,
                rpc,
            )))
        }
        PoolKind::Stable => {
            if venue.pools.is_empty() {
                return Err(venue_err("stable venue needs at least one pool"));
            }
            let fee = venue.fee.unwrap_or(4);
            let mut pools = Vec::with_capacity(venue.pools.len());
            for static_pool in &venue.pools {
                let address = check_address(
                    &format!("venues[{}].pools[].address", venue.id),
                    &static_pool.address,
                )?;
                if static_pool.tokens.len() < 2 {
                    return Err(venue_err("stable pool needs two or more tokens"));
                }
                let mut refs = Vec::with_capacity(static_pool.tokens.len());
                for token in &static_pool.tokens {
                    let addr = check_address(
                        &format!("venues[{}].pools[].tokens[]", venue.id),
                        token,
                    )?;
                    let token_ref = tokens.get(&addr).ok_or_else(|| {
                        venue_err(&format!("pool token {} not in tokens list", token))
                    })?;
                    refs.push(*token_ref);
                }
                pools.push((address, refs, static_pool.amp));
            }
            Ok(PoolAdapter::Stable(stable::StableAdapter::new(
                id, router, fee, pools, rpc,
            )))
        }
    }
}
