//! Canonical adapter surface
//!
//! A closed sum over the venue families the engine understands. Every
//! canonical operation dispatches to the family implementation; callers
//! never match on the family themselves.

use alloy::primitives::{Address, Bytes, U256};
use rust_decimal::Decimal;

use super::{stable::StableAdapter, v2::V2Adapter, v3::V3Adapter};
use crate::error::AdapterError;
use crate::types::{PathStep, Pool, PoolKind, PoolState, Quote, TokenRef, VenueId};

/// Outcome of a quote request. `NoPool` and `Stale` are expected conditions,
/// not errors; the quoting engine simply omits them from its result map.
#[derive(Debug, Clone)]
pub enum QuoteOutcome {
    Quote(Quote),
    NoPool,
    Stale,
}

impl QuoteOutcome {
    pub fn into_quote(self) -> Option<Quote> {
        match self {
            QuoteOutcome::Quote(q) => Some(q),
            _ => None,
        }
    }
}

/// A swap ready to become a bundle transaction.
#[derive(Debug, Clone)]
pub struct SwapCall {
    /// Router the calldata targets
    pub to: Address,
    pub calldata: Bytes,
    pub value: U256,
    /// Minimum acceptable output after slippage adjustment
    pub min_out: U256,
    pub gas_limit: u64,
}

/// One adapter per venue family; the set is fixed at compile time.
pub enum PoolAdapter {
    V2(V2Adapter),
    V3(V3Adapter),
    Stable(StableAdapter),
}

impl PoolAdapter {
    pub fn venue_id(&self) -> &VenueId {
        match self {
            PoolAdapter::V2(a) => a.venue_id(),
            PoolAdapter::V3(a) => a.venue_id(),
            PoolAdapter::Stable(a) => a.venue_id(),
        }
    }

    pub fn kind(&self) -> PoolKind {
        match self {
            PoolAdapter::V2(_) => PoolKind::V2,
            PoolAdapter::V3(_) => PoolKind::V3,
            PoolAdapter::Stable(_) => PoolKind::Stable,
        }
    }

    /// Best output for the given direction and size at the given block.
    /// Multi-tier venues consider every configured tier and keep the best.
    pub async fn quote(
        &self,
        token_in: TokenRef,
        token_out: TokenRef,
        amount_in: U256,
        block: u64,
    ) -> Result<QuoteOutcome, AdapterError> {
        match self {
            PoolAdapter::V2(a) => a.quote(token_in, token_out, amount_in, block).await,
            PoolAdapter::V3(a) => a.quote(token_in, token_out, amount_in, block).await,
            PoolAdapter::Stable(a) => a.quote(token_in, token_out, amount_in, block).await,
        }
    }

    /// Venue path encoding: packed 20/3/20-byte form for V3-family,
    /// concatenated addresses for the rest.
    pub fn encode_path(&self, tokens: &[TokenRef], fees: &[u32]) -> Result<Bytes, AdapterError> {
        match self {
            PoolAdapter::V3(a) => a.encode_path(tokens, fees),
            PoolAdapter::V2(_) | PoolAdapter::Stable(_) => {
                if tokens.len() < 2 {
                    return Err(AdapterError::Decode("path needs two tokens".into()));
                }
                let mut out = Vec::with_capacity(20 * tokens.len());
                for token in tokens {
                    out.extend_from_slice(token.address.as_slice());
                }
                Ok(Bytes::from(out))
            }
        }
    }

    /// Fresh on-chain state for a pool, or None when the pool is gone.
    pub async fn pool_state(&self, pool: &Pool) -> Result<Option<PoolState>, AdapterError> {
        match self {
            PoolAdapter::V2(a) => a.pool_state(pool).await,
            PoolAdapter::V3(a) => a.pool_state(pool).await,
            PoolAdapter::Stable(a) => a.pool_state(pool).await,
        }
    }

    /// Price impact of a quote against a pre-trade state, in [0, 1].
    pub fn price_impact(&self, quote: &Quote, state: &PoolState) -> Result<Decimal, AdapterError> {
        match self {
            PoolAdapter::V2(a) => a.price_impact(quote, state),
            PoolAdapter::V3(a) => a.price_impact(quote, state),
            PoolAdapter::Stable(a) => a.price_impact(quote, state),
        }
    }

    /// Build the venue swap call for one path step.
    pub fn build_swap(
        &self,
        step: &PathStep,
        recipient: Address,
        deadline: u64,
        slippage: Decimal,
    ) -> Result<SwapCall, AdapterError> {
        match self {
            PoolAdapter::V2(a) => a.build_swap(step, recipient, deadline, slippage),
            PoolAdapter::V3(a) => a.build_swap(step, recipient, deadline, slippage),
            PoolAdapter::Stable(a) => a.build_swap(step, recipient, deadline, slippage),
        }
    }

    /// Drop per-block discovery caches at a new head.
    pub fn on_new_block(&self, block: u64) {
        match self {
            PoolAdapter::V2(a) => a.on_new_block(block),
            PoolAdapter::V3(a) => a.on_new_block(block),
            PoolAdapter::Stable(_) => {}
        }
    }
}

/// Shared by adapters: minimum output after applying a slippage tolerance.
pub fn min_out_with_slippage(quoted: U256, slippage: Decimal) -> U256 {
    use rust_decimal::prelude::ToPrimitive;

    let slippage = slippage.clamp(Decimal::ZERO, Decimal::new(5, 1));
    // quoted * (1 - slippage) in integer math: the tolerance moves to parts
    // per million so the multiply stays exact
    let ppm = (slippage * Decimal::from(1_000_000u64))
        .trunc()
        .to_u64()
        .unwrap_or(500_000);
    let keep = 1_000_000u64.saturating_sub(ppm);
    quoted * U256::from(keep) / U256::from(1_000_000u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_min_out_with_slippage() {
        let quoted = U256::from(1_000_000u64);
        assert_eq!(min_out_with_slippage(quoted, dec!(0)), quoted);
        assert_eq!(
            min_out_with_slippage(quoted, dec!(0.005)),
            U256::from(995_000u64)
        );
        assert_eq!(
            min_out_with_slippage(quoted, dec!(0.5)),
            U256::from(500_000u64)
        );
        // Values above the cap clamp to the cap
        assert_eq!(
            min_out_with_slippage(quoted, dec!(0.9)),
            U256::from(500_000u64)
        );
    }

    #[test]
    fn test_quote_outcome_into_quote() {
        assert!(QuoteOutcome::NoPool.into_quote().is_none());
        assert!(QuoteOutcome::Stale.into_quote().is_none());
    }
}
