//! Quoting engine
//!
//! Fans quote requests out across venue adapters with bounded parallelism,
//! batching larger inputs, and serves repeats from the short-TTL cache.
//! Missing results are absent from the output map, never zero. Adapter
//! failures are absorbed here; they never travel past the path finder.

pub mod cache;

pub use cache::{QuoteCache, QuoteKey};

use alloy::primitives::{Address, U256};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, trace};

use crate::config::EngineConfig;
use crate::types::{Quote, TokenRef, VenueId};
use crate::venues::{QuoteOutcome, VenueRegistry};

/// One quote request: venue and direction. The size comes per-call.
pub type QuoteRequest = (VenueId, TokenRef, TokenRef);

/// Result map key: venue and direction by address.
pub type QuoteMapKey = (VenueId, Address, Address);

#[derive(Debug, Default, Clone, Copy)]
pub struct QuoteStats {
    pub requested: u64,
    pub cache_hits: u64,
    pub fetched: u64,
    pub unavailable: u64,
}

pub struct QuotingEngine {
    registry: Arc<VenueRegistry>,
    cache: QuoteCache,
    max_parallel: usize,
    batch_size: usize,
    stats: Mutex<QuoteStats>,
}

impl QuotingEngine {
    pub fn new(registry: Arc<VenueRegistry>, config: &EngineConfig) -> Self {
        Self {
            registry,
            cache: QuoteCache::new(config.cache.max_entries, config.cache.ttl_blocks),
            max_parallel: config.max_parallel_requests.max(1),
            batch_size: config.rate_limit.batch_size.max(1),
            stats: Mutex::new(QuoteStats::default()),
        }
    }

    /// Resolve quotes for every (venue, pair) at one size and block
    /// snapshot. Unavailable quotes (no pool, stale state, adapter error)
    /// are simply absent.
    pub async fn quotes(
        &self,
        requests: &[QuoteRequest],
        amount_in: U256,
        block: u64,
    ) -> HashMap<QuoteMapKey, Quote> {
        let mut results: HashMap<QuoteMapKey, Quote> = HashMap::with_capacity(requests.len());
        let mut misses: Vec<QuoteRequest> = Vec::new();

        {
            let mut stats = self.stats.lock().expect("stats mutex poisoned");
            stats.requested += requests.len() as u64;
        }

        for request in requests {
            match self
                .cache
                .lookup(&request.0, request.1.address, request.2.address, amount_in, block)
            {
                Some(quote) => {
                    results.insert(
                        (request.0.clone(), request.1.address, request.2.address),
                        quote,
                    );
                }
                None => misses.push(request.clone()),
            }
        }
        {
            let mut stats = self.stats.lock().expect("stats mutex poisoned");
            stats.cache_hits += (requests.len() - misses.len()) as u64;
        }
        if misses.is_empty() {
            return results;
        }

        // Fan out in batches; within a batch, up to max_parallel adapter
        // calls run concurrently and join at the batch boundary
        let chunk = self.max_parallel.min(self.batch_size).max(1);
        for batch in misses.chunks(chunk) {
            let mut tasks: JoinSet<(QuoteRequest, Option<Quote>)> = JoinSet::new();
            for request in batch.iter().cloned() {
                let registry = Arc::clone(&self.registry);
                tasks.spawn(async move {
                    let Some(adapter) = registry.get(&request.0) else {
                        return (request, None);
                    };
                    match adapter.quote(request.1, request.2, amount_in, block).await {
                        Ok(QuoteOutcome::Quote(quote)) => (request, Some(quote)),
                        Ok(QuoteOutcome::NoPool) | Ok(QuoteOutcome::Stale) => (request, None),
                        Err(e) => {
                            debug!(venue = %request.0, error = %e, "quote dropped");
                            (request, None)
                        }
                    }
                });
            }

            while let Some(joined) = tasks.join_next().await {
                let Ok((request, maybe_quote)) = joined else { continue };
                let mut stats = self.stats.lock().expect("stats mutex poisoned");
                match maybe_quote {
                    Some(quote) => {
                        stats.fetched += 1;
                        drop(stats);
                        let key = QuoteKey {
                            venue: request.0.clone(),
                            token_in: request.1.address,
                            token_out: request.2.address,
                            amount_in,
                            block_bucket: block,
                        };
                        self.cache.insert(key, quote.clone());
                        results.insert(
                            (request.0, request.1.address, request.2.address),
                            quote,
                        );
                    }
                    None => stats.unavailable += 1,
                }
            }
        }

        trace!(
            requested = requests.len(),
            resolved = results.len(),
            "quote fan-out complete"
        );
        results
    }

    /// One quote, cached.
    pub async fn quote_one(
        &self,
        venue: &VenueId,
        token_in: TokenRef,
        token_out: TokenRef,
        amount_in: U256,
        block: u64,
    ) -> Option<Quote> {
        let request = vec![(venue.clone(), token_in, token_out)];
        self.quotes(&request, amount_in, block)
            .await
            .remove(&(venue.clone(), token_in.address, token_out.address))
    }

    /// Price impact of a hypothetical trade, from a fresh quote.
    pub async fn price_impact(
        &self,
        venue: &VenueId,
        token_in: TokenRef,
        token_out: TokenRef,
        amount_in: U256,
        block: u64,
    ) -> Option<Decimal> {
        self.quote_one(venue, token_in, token_out, amount_in, block)
            .await
            .map(|q| q.price_impact)
    }

    /// Liquidity depth: the largest probed size whose impact stays at or
    /// under the threshold. Doubles from the seed size; quotes come through
    /// the cache like any other.
    pub async fn liquidity_depth(
        &self,
        venue: &VenueId,
        token_in: TokenRef,
        token_out: TokenRef,
        seed_amount: U256,
        impact_threshold: Decimal,
        block: u64,
    ) -> Option<U256> {
        const MAX_DOUBLINGS: usize = 16;

        let mut depth: Option<U256> = None;
        let mut probe = seed_amount;
        for _ in 0..MAX_DOUBLINGS {
            let quote = self
                .quote_one(venue, token_in, token_out, probe, block)
                .await?;
            if quote.price_impact > impact_threshold {
                break;
            }
            depth = Some(probe);
            probe = probe.checked_mul(U256::from(2u64))?;
        }
        depth
    }

    /// Head advanced: expired buckets leave the cache, per-block adapter
    /// caches reset.
    pub fn on_new_block(&self, block: u64) {
        self.cache.invalidate_stale(block);
        self.registry.on_new_block(block);
    }

    pub fn stats(&self) -> QuoteStats {
        *self.stats.lock().expect("stats mutex poisoned")
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}
