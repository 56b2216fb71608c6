//! Short-lived quote cache
//!
//! Keyed by (venue, direction, size, block bucket). TTL is measured in block
//! buckets; capacity is LRU-bounded. All writes serialize through a single
//! mutex, and a later write for the same key wins.

use alloy::primitives::{Address, U256};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::types::{Quote, VenueId};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuoteKey {
    pub venue: VenueId,
    pub token_in: Address,
    pub token_out: Address,
    pub amount_in: U256,
    pub block_bucket: u64,
}

struct CacheState {
    entries: HashMap<QuoteKey, Quote>,
    /// Recency order, oldest first; refreshed on hit
    order: VecDeque<QuoteKey>,
}

pub struct QuoteCache {
    state: Mutex<CacheState>,
    max_entries: usize,
    ttl_blocks: u64,
}

impl QuoteCache {
    pub fn new(max_entries: usize, ttl_blocks: u64) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            max_entries: max_entries.max(1),
            ttl_blocks: ttl_blocks.max(1),
        }
    }

    /// Look up a quote valid at `current_bucket`: the stored bucket must be
    /// within TTL. Hits refresh recency.
    pub fn get(&self, key: &QuoteKey, current_bucket: u64) -> Option<Quote> {
        let mut state = self.state.lock().expect("quote cache mutex poisoned");
        let quote = match state.entries.get(key) {
            Some(quote) if key.block_bucket + self.ttl_blocks > current_bucket => quote.clone(),
            Some(_) => {
                state.entries.remove(key);
                state.order.retain(|k| k != key);
                return None;
            }
            None => return None,
        };
        state.order.retain(|k| k != key);
        state.order.push_back(key.clone());
        Some(quote)
    }

    /// Probe every bucket still inside the TTL window, newest first. This
    /// is the read path callers use when they only know the current bucket.
    pub fn lookup(
        &self,
        venue: &VenueId,
        token_in: Address,
        token_out: Address,
        amount_in: U256,
        current_bucket: u64,
    ) -> Option<Quote> {
        for offset in 0..self.ttl_blocks {
            let Some(bucket) = current_bucket.checked_sub(offset) else {
                break;
            };
            let key = QuoteKey {
                venue: venue.clone(),
                token_in,
                token_out,
                amount_in,
                block_bucket: bucket,
            };
            if let Some(quote) = self.get(&key, current_bucket) {
                return Some(quote);
            }
        }
        None
    }

    pub fn insert(&self, key: QuoteKey, quote: Quote) {
        let mut state = self.state.lock().expect("quote cache mutex poisoned");
        if state.entries.insert(key.clone(), quote).is_some() {
            state.order.retain(|k| k != &key);
        }
        state.order.push_back(key);
        while state.entries.len() > self.max_entries {
            let Some(evicted) = state.order.pop_front() else { break };
            state.entries.remove(&evicted);
        }
    }

    /// Drop every entry whose bucket has fallen out of the TTL window at the
    /// new head.
    pub fn invalidate_stale(&self, current_bucket: u64) {
        let mut state = self.state.lock().expect("quote cache mutex poisoned");
        let ttl = self.ttl_blocks;
        state
            .entries
            .retain(|key, _| key.block_bucket + ttl > current_bucket);
        let live: Vec<QuoteKey> = state.entries.keys().cloned().collect();
        state.order.retain(|k| live.contains(k));
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("quote cache mutex poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
