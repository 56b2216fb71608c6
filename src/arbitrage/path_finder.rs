//! Arbitrage path finder
//!
//! Enumerates closed token cycles (start token to itself, length 2 to
//! `max_path_length`, distinct intermediates) across every assignment of
//! enabled venues to hops, resolves the required quotes through the quoting
//! engine level by level so step amounts chain exactly, and ranks surviving
//! candidates by net profit. Any missing quote eliminates its candidate;
//! nothing here fails globally.

use alloy::primitives::U256;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::numeric;
use crate::quoting::{QuoteRequest, QuotingEngine};
use crate::types::{ArbitragePath, PathStep, TokenRef, VenueId};
use crate::venues::VenueRegistry;

/// Running totals across cycles, logged with each scan.
#[derive(Debug, Default, Clone, Copy)]
pub struct PathFinderStats {
    pub scans: u64,
    pub candidates_examined: u64,
    pub profitable_found: u64,
    pub best_margin_seen: Decimal,
}

/// A candidate mid-composition: its token cycle, venue assignment, and the
/// steps resolved so far.
struct Candidate {
    tokens: Vec<TokenRef>,
    venues: Vec<VenueId>,
    steps: Vec<PathStep>,
    current_amount: U256,
}

pub struct PathFinder {
    quoting: Arc<QuotingEngine>,
    supported_tokens: Vec<TokenRef>,
    venue_ids: Vec<VenueId>,
    max_path_length: usize,
    min_margin: Decimal,
    base_gas: u64,
    per_hop_gas: u64,
    /// Whole units of each token per one whole native token, for pricing
    /// gas into start-token terms
    native_prices: HashMap<alloy::primitives::Address, Decimal>,
    stats: Mutex<PathFinderStats>,
}

impl PathFinder {
    pub fn new(
        quoting: Arc<QuotingEngine>,
        registry: &VenueRegistry,
        config: &EngineConfig,
    ) -> Self {
        let supported_tokens: Vec<TokenRef> = config
            .tokens
            .iter()
            .filter_map(|t| {
                let address = numeric::parse_address(&t.address).ok()?;
                registry.token(address).copied()
            })
            .collect();
        let native_prices = config
            .tokens
            .iter()
            .filter_map(|t| {
                let address = numeric::parse_address(&t.address).ok()?;
                Some((address, t.native_price))
            })
            .collect();
        Self {
            quoting,
            supported_tokens,
            venue_ids: registry.venue_ids(),
            max_path_length: config.max_path_length,
            min_margin: config.min_margin,
            base_gas: config.base_gas,
            per_hop_gas: config.per_hop_gas,
            native_prices,
            stats: Mutex::new(PathFinderStats::default()),
        }
    }

    /// Find the top-K paths for one start token at one block snapshot.
    pub async fn find_paths(
        &self,
        start: TokenRef,
        amount_in: U256,
        gas_price: U256,
        block: u64,
        top_k: usize,
    ) -> Vec<ArbitragePath> {
        let mut candidates = self.enumerate_candidates(start, amount_in);
        let examined = candidates.len();

        // Resolve quotes one hop level at a time: every candidate's next
        // hop is batched together, grouped by input amount so chained
        // amounts stay exact
        for level in 0..self.max_path_length {
            let mut groups: HashMap<U256, Vec<usize>> = HashMap::new();
            for (idx, candidate) in candidates.iter().enumerate() {
                if candidate.hops_remaining() > 0 && candidate.steps.len() == level {
                    groups.entry(candidate.current_amount).or_default().push(idx);
                }
            }
            if groups.is_empty() {
                break;
            }

            for (amount, indices) in groups {
                let mut requests: Vec<QuoteRequest> = Vec::new();
                for &idx in &indices {
                    let candidate = &candidates[idx];
                    requests.push((
                        candidate.venues[level].clone(),
                        candidate.tokens[level],
                        candidate.tokens[level + 1],
                    ));
                }
                requests.sort_by(|a, b| (a.0.as_str(), a.1.address, a.2.address)
                    .cmp(&(b.0.as_str(), b.1.address, b.2.address)));
                requests.dedup_by(|a, b| a.0 == b.0 && a.1 == b.1 && a.2 == b.2);

                let quotes = self.quoting.quotes(&requests, amount, block).await;

                for &idx in &indices {
                    let candidate = &mut candidates[idx];
                    let venue = candidate.venues[level].clone();
                    let token_in = candidate.tokens[level];
                    let token_out = candidate.tokens[level + 1];
                    match quotes.get(&(venue.clone(), token_in.address, token_out.address)) {
                        Some(quote) if !quote.amount_out.is_zero() => {
                            candidate.steps.push(PathStep {
                                venue,
                                pool: quote.pool.clone(),
                                token_in,
                                token_out,
                                amount_in: candidate.current_amount,
                                amount_out: quote.amount_out,
                                fee: quote.pool.fee,
                            });
                            candidate.current_amount = quote.amount_out;
                        }
                        // Missing or empty quote: the candidate dies here
                        _ => candidate.kill(),
                    }
                }
            }
        }

        let mut paths: Vec<ArbitragePath> = candidates
            .into_iter()
            .filter(|c| c.is_complete())
            .filter_map(|c| self.score(c, amount_in, start, gas_price))
            .collect();

        // Net profit descending; ties break to the shorter path, then to
        // lexicographic venue ids
        paths.sort_by(|a, b| {
            b.net_profit
                .cmp(&a.net_profit)
                .then(a.steps.len().cmp(&b.steps.len()))
                .then_with(|| a.venue_key().cmp(&b.venue_key()))
        });
        paths.truncate(top_k);

        let mut stats = self.stats.lock().expect("stats mutex poisoned");
        stats.scans += 1;
        stats.candidates_examined += examined as u64;
        stats.profitable_found += paths.len() as u64;
        if let Some(best) = paths.first() {
            if best.profit_margin > stats.best_margin_seen {
                stats.best_margin_seen = best.profit_margin;
            }
        }
        info!(
            examined,
            found = paths.len(),
            block,
            "path scan complete"
        );
        paths
    }

    /// All (cycle, venue-assignment) candidates for the start token.
    fn enumerate_candidates(&self, start: TokenRef, amount_in: U256) -> Vec<Candidate> {
        let intermediates: Vec<TokenRef> = self
            .supported_tokens
            .iter()
            .filter(|t| t.address != start.address)
            .copied()
            .collect();

        let mut candidates = Vec::new();
        for hops in 2..=self.max_path_length {
            for middle in ordered_subsequences(&intermediates, hops - 1) {
                let mut tokens = Vec::with_capacity(hops + 1);
                tokens.push(start);
                tokens.extend(middle);
                tokens.push(start);

                for venues in venue_assignments(&self.venue_ids, hops) {
                    candidates.push(Candidate {
                        tokens: tokens.clone(),
                        venues,
                        steps: Vec::with_capacity(hops),
                        current_amount: amount_in,
                    });
                }
            }
        }
        debug!(candidates = candidates.len(), "candidates enumerated");
        candidates
    }

    /// Gross, gas and net for a completed candidate; None when it fails the
    /// margin gate.
    fn score(
        &self,
        candidate: Candidate,
        amount_in: U256,
        start: TokenRef,
        gas_price: U256,
    ) -> Option<ArbitragePath> {
        let amount_out = candidate.current_amount;
        if amount_out <= amount_in {
            return None;
        }
        let gross = amount_out - amount_in;
        let margin = numeric::ratio(amount_out, amount_in).ok()? - Decimal::ONE;
        if margin < self.min_margin {
            return None;
        }

        let hops = candidate.steps.len() as u64;
        let gas_estimate = self.base_gas + self.per_hop_gas * (hops.saturating_sub(1));
        let gas_cost_start = self.gas_cost_in(start, gas_estimate, gas_price)?;
        let net_profit = gross.saturating_sub(gas_cost_start);

        Some(ArbitragePath {
            steps: candidate.steps,
            amount_in,
            amount_out,
            gross_profit: gross,
            net_profit,
            profit_margin: margin,
            gas_estimate,
        })
    }

    /// Convert a native-denominated gas cost into raw start-token units via
    /// the configured native price.
    fn gas_cost_in(&self, token: TokenRef, gas: u64, gas_price: U256) -> Option<U256> {
        let wei = U256::from(gas).checked_mul(gas_price)?;
        let native = numeric::amount_to_decimal(wei, 18).ok()?;
        let price = self
            .native_prices
            .get(&token.address)
            .copied()
            .unwrap_or(Decimal::ONE);
        numeric::decimal_to_amount(native * price, token.decimals).ok()
    }

    pub fn stats(&self) -> PathFinderStats {
        *self.stats.lock().expect("stats mutex poisoned")
    }
}

impl Candidate {
    fn hops_remaining(&self) -> usize {
        if self.tokens.is_empty() {
            return 0;
        }
        (self.tokens.len() - 1).saturating_sub(self.steps.len())
    }

    fn is_complete(&self) -> bool {
        !self.tokens.is_empty() && self.steps.len() == self.tokens.len() - 1
    }

    fn kill(&mut self) {
        self.tokens.clear();
    }
}

/// Ordered k-element subsequences with distinct elements.
fn ordered_subsequences(items: &[TokenRef], k: usize) -> Vec<Vec<TokenRef>> {
    if k == 0 {
        return vec![Vec::new()];
    }
    let mut out = Vec::new();
    for (i, item) in items.iter().enumerate() {
        let mut rest: Vec<TokenRef> = items.to_vec();
        rest.remove(i);
        for mut tail in ordered_subsequences(&rest, k - 1) {
            let mut seq = Vec::with_capacity(k);
            seq.push(*item);
            seq.append(&mut tail);
            out.push(seq);
        }
    }
    out
}

/// Cartesian product of venue choices per hop.
fn venue_assignments(venues: &[VenueId], hops: usize) -> Vec<Vec<VenueId>> {
    if hops == 0 {
        return vec![Vec::new()];
    }
    let mut out = Vec::new();
    for venue in venues {
        for mut tail in venue_assignments(venues, hops - 1) {
            let mut assignment = Vec::with_capacity(hops);
            assignment.push(venue.clone());
            assignment.append(&mut tail);
            out.push(assignment);
        }
    }
    out
}
