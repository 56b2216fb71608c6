//! Multi-path capital allocator
//!
//! Splits the cycle's capital across the top paths in proportion to each
//! path's marginal profit rate, with a minimum-share floor for every path
//! that receives anything at all. Expected profit is recomputed under the
//! quadratic slippage model, so oversized allocations pay for themselves.
//! Deterministic, and monotone in the profit rates.

use alloy::primitives::U256;
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::{EngineError, InvariantError};
use crate::numeric;
use crate::types::{AllocationPlan, ArbitragePath, TokenRef};

/// Slippage never exceeds half the allocation, however oversized.
const SLIPPAGE_CAP: Decimal = Decimal::from_parts(5, 0, 0, false, 1); // 0.5

pub struct MultiPathOptimizer {
    max_paths: usize,
    min_allocation_share: Decimal,
    slippage_tolerance: Decimal,
}

impl MultiPathOptimizer {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            max_paths: config.max_paths,
            min_allocation_share: config.min_allocation_share,
            slippage_tolerance: config.slippage_tolerance,
        }
    }

    pub fn with_params(
        max_paths: usize,
        min_allocation_share: Decimal,
        slippage_tolerance: Decimal,
    ) -> Self {
        Self {
            max_paths: max_paths.max(1),
            min_allocation_share,
            slippage_tolerance,
        }
    }

    /// Quadratic slippage for one path at one allocation:
    /// `tolerance * (allocation / required)^2`, capped at 0.5.
    pub fn slippage_factor(&self, allocation: Decimal, required: Decimal) -> Decimal {
        if required <= Decimal::ZERO {
            return SLIPPAGE_CAP;
        }
        let ratio = allocation / required;
        (self.slippage_tolerance * ratio * ratio).min(SLIPPAGE_CAP)
    }

    /// Allocate `capital` (raw start-token units) across the given paths.
    pub fn optimize(
        &self,
        mut paths: Vec<ArbitragePath>,
        capital: U256,
        start_token: TokenRef,
    ) -> Result<AllocationPlan, EngineError> {
        if paths.is_empty() {
            return Err(EngineError::NoPaths);
        }

        // Cap the path count: keep the top max_paths by quoted profit
        if paths.len() > self.max_paths {
            debug!(
                provided = paths.len(),
                kept = self.max_paths,
                "limiting paths for allocation"
            );
            paths.sort_by(|a, b| b.net_profit.cmp(&a.net_profit));
            paths.truncate(self.max_paths);
        }

        let capital_dec = numeric::amount_to_decimal(capital, start_token.decimals)
            .map_err(EngineError::Adapter)?;

        // Marginal profit rate at the quoted size
        let rates: Vec<Decimal> = paths
            .iter()
            .map(|path| profit_rate(path, start_token))
            .collect::<Result<_, _>>()?;

        let weights = self.floored_weights(&rates);

        // Raw allocations; the largest weight absorbs the rounding
        // remainder so the sum is exactly the capital
        let mut allocations: Vec<U256> = Vec::with_capacity(paths.len());
        for weight in &weights {
            let amount = numeric::decimal_to_amount(*weight * capital_dec, start_token.decimals)
                .map_err(EngineError::Adapter)?;
            allocations.push(amount);
        }
        let allocated: U256 = allocations.iter().fold(U256::ZERO, |acc, a| acc + a);
        if allocated != capital {
            let biggest = weights
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
                .map(|(i, _)| i)
                .unwrap_or(0);
            if allocated < capital {
                allocations[biggest] += capital - allocated;
            } else {
                allocations[biggest] = allocations[biggest].saturating_sub(allocated - capital);
            }
        }
        let total: U256 = allocations.iter().fold(U256::ZERO, |acc, a| acc + a);
        if total != capital {
            return Err(EngineError::Invariant(InvariantError::AllocationSum {
                sum: total.to_string(),
                capital: capital.to_string(),
            }));
        }

        // Expected profit under the slippage model
        let mut expected = Decimal::ZERO;
        for ((path, allocation), rate) in paths.iter().zip(&allocations).zip(&rates) {
            if allocation.is_zero() {
                continue;
            }
            let allocation_dec = numeric::amount_to_decimal(*allocation, start_token.decimals)
                .map_err(EngineError::Adapter)?;
            let required_dec = numeric::amount_to_decimal(path.amount_in, start_token.decimals)
                .map_err(EngineError::Adapter)?;
            let slip = self.slippage_factor(allocation_dec, required_dec);
            expected += *rate * allocation_dec * (Decimal::ONE - slip);
        }
        let expected_profit = numeric::decimal_to_amount(expected, start_token.decimals)
            .map_err(EngineError::Adapter)?;

        let allocations: Vec<(ArbitragePath, U256)> = paths
            .into_iter()
            .zip(allocations)
            .filter(|(_, amount)| !amount.is_zero())
            .collect();

        info!(
            paths = allocations.len(),
            expected_profit = %expected,
            "allocation plan ready"
        );

        Ok(AllocationPlan {
            start_token,
            allocations,
            total_capital: capital,
            expected_profit,
        })
    }

    /// Rate-proportional weights with the minimum-share floor applied to
    /// every path that stays funded. Paths whose proportional share falls
    /// under the floor are lifted to it; the rest renormalize over the
    /// remaining mass. If the floor cannot fit every path, the lowest-rate
    /// paths drop to zero.
    fn floored_weights(&self, rates: &[Decimal]) -> Vec<Decimal> {
        let n = rates.len();
        let floor = self.min_allocation_share;

        // Feasibility: at most 1/floor paths can be funded
        let mut funded: Vec<usize> = (0..n).collect();
        if floor > Decimal::ZERO {
            use rust_decimal::prelude::ToPrimitive;
            let max_funded = (Decimal::ONE / floor)
                .floor()
                .to_u64()
                .map(|v| v as usize)
                .unwrap_or(n)
                .max(1);
            if n > max_funded {
                let mut order: Vec<usize> = (0..n).collect();
                order.sort_by(|&a, &b| {
                    rates[b]
                        .partial_cmp(&rates[a])
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(a.cmp(&b))
                });
                funded = order[..max_funded].to_vec();
                funded.sort_unstable();
            }
        }

        let mut weights = vec![Decimal::ZERO; n];
        let mut floored: Vec<usize> = Vec::new();
        let mut free: Vec<usize> = funded.clone();

        loop {
            let free_rate_sum: Decimal = free.iter().map(|&i| rates[i]).sum();
            let floored_mass = floor * Decimal::from(floored.len() as u64);
            let remaining = (Decimal::ONE - floored_mass).max(Decimal::ZERO);

            let mut violators = Vec::new();
            for &i in &free {
                let weight = if free_rate_sum > Decimal::ZERO {
                    remaining * rates[i] / free_rate_sum
                } else {
                    remaining / Decimal::from(free.len().max(1) as u64)
                };
                if weight < floor {
                    violators.push(i);
                } else {
                    weights[i] = weight;
                }
            }
            if violators.is_empty() {
                for &i in &floored {
                    weights[i] = floor;
                }
                break;
            }
            for i in violators {
                floored.push(i);
                free.retain(|&j| j != i);
            }
            if free.is_empty() {
                // Everything sits at the floor; spread any leftover mass
                // evenly so the weights still sum to one
                let floored_mass = floor * Decimal::from(floored.len() as u64);
                let leftover =
                    (Decimal::ONE - floored_mass).max(Decimal::ZERO) / Decimal::from(floored.len() as u64);
                for &i in &floored {
                    weights[i] = floor + leftover;
                }
                break;
            }
        }
        weights
    }
}

/// Expected profit per unit of capital at the quoted size.
fn profit_rate(path: &ArbitragePath, start_token: TokenRef) -> Result<Decimal, EngineError> {
    let profit = numeric::amount_to_decimal(path.net_profit, start_token.decimals)
        .map_err(EngineError::Adapter)?;
    let required = numeric::amount_to_decimal(path.amount_in, start_token.decimals)
        .map_err(EngineError::Adapter)?;
    if required <= Decimal::ZERO {
        return Ok(Decimal::ZERO);
    }
    Ok(profit / required)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PathStep, Pool, PoolKind, VenueId};
    use alloy::primitives::Address;
    use rust_decimal_macros::dec;

    fn e18(units: u64) -> U256 {
        U256::from(units) * U256::from(10u64).pow(U256::from(18))
    }

    fn start_token() -> TokenRef {
        TokenRef::new(Address::repeat_byte(1), 18).unwrap()
    }

    /// A closed two-hop path with the given required amount and net profit.
    fn path_with(required: U256, net_profit: U256) -> ArbitragePath {
        let start = start_token();
        let mid = TokenRef::new(Address::repeat_byte(2), 6).unwrap();
        let pool = Pool {
            venue: VenueId::from("venue-a"),
            address: Address::repeat_byte(0xcc),
            tokens: vec![start, mid],
            fee: 30,
            kind: PoolKind::V2,
            venue_params: serde_json::Value::Null,
        };
        let amount_out = required + net_profit;
        ArbitragePath {
            steps: vec![
                PathStep {
                    venue: VenueId::from("venue-a"),
                    pool: pool.clone(),
                    token_in: start,
                    token_out: mid,
                    amount_in: required,
                    amount_out: U256::from(1u64),
                    fee: 30,
                },
                PathStep {
                    venue: VenueId::from("venue-b"),
                    pool,
                    token_in: mid,
                    token_out: start,
                    amount_in: U256::from(1u64),
                    amount_out,
                    fee: 30,
                },
            ],
            amount_in: required,
            amount_out,
            gross_profit: net_profit,
            net_profit,
            profit_margin: numeric::ratio(amount_out, required).unwrap() - Decimal::ONE,
            gas_estimate: 250_000,
        }
    }

    fn optimizer() -> MultiPathOptimizer {
        MultiPathOptimizer::with_params(5, dec!(0.10), dec!(0.005))
    }

    #[test]
    fn test_empty_is_no_paths() {
        let err = optimizer()
            .optimize(Vec::new(), e18(10), start_token())
            .unwrap_err();
        assert!(matches!(err, EngineError::NoPaths));
    }

    #[test]
    fn test_single_path_gets_everything() {
        let plan = optimizer()
            .optimize(vec![path_with(e18(1), e18(1) / U256::from(100u64))], e18(10), start_token())
            .unwrap();
        assert_eq!(plan.allocations.len(), 1);
        assert_eq!(plan.allocations[0].1, e18(10));
        assert_eq!(plan.total_capital, e18(10));
        assert!(plan.expected_profit > U256::ZERO);
    }

    #[test]
    fn test_three_path_proportional_split() {
        // Rates 0.010 / 0.008 / 0.002 over equal required amounts: weights
        // 0.5 / 0.4 / 0.1; the floor of 0.10 is exactly met by the third
        let paths = vec![
            path_with(e18(1), e18(1) / U256::from(100u64)),  // 1.0%
            path_with(e18(1), e18(8) / U256::from(1000u64)), // 0.8%
            path_with(e18(1), e18(2) / U256::from(1000u64)), // 0.2%
        ];
        let plan = optimizer().optimize(paths, e18(10), start_token()).unwrap();
        assert_eq!(plan.allocations.len(), 3);
        assert_eq!(plan.allocations[0].1, e18(5));
        assert_eq!(plan.allocations[1].1, e18(4));
        assert_eq!(plan.allocations[2].1, e18(1));

        let total: U256 = plan
            .allocations
            .iter()
            .fold(U256::ZERO, |acc, (_, a)| acc + a);
        assert_eq!(total, e18(10));
        assert!(plan.expected_profit > U256::ZERO);
    }

    #[test]
    fn test_floor_lifts_small_path() {
        // Rates 0.02 / 0.0004: proportional shares 0.98 / 0.02; the small
        // path lifts to the 10% floor and the big one takes the rest
        let paths = vec![
            path_with(e18(1), e18(2) / U256::from(100u64)),
            path_with(e18(1), e18(4) / U256::from(10_000u64)),
        ];
        let plan = optimizer().optimize(paths, e18(10), start_token()).unwrap();
        assert_eq!(plan.allocations[1].1, e18(1));
        assert_eq!(plan.allocations[0].1, e18(9));
    }

    #[test]
    fn test_allocations_sum_exactly_to_capital() {
        // Awkward rates that do not divide the capital evenly
        let paths = vec![
            path_with(e18(1), U256::from(3_333_333_333_333_333u64)),
            path_with(e18(1), U256::from(7_777_777_777_777_777u64)),
            path_with(e18(1), U256::from(1_111_111_111_111_111u64)),
        ];
        let capital = U256::from(10_000_000_000_000_000_007u128);
        let plan = optimizer()
            .optimize(paths, capital, start_token())
            .unwrap();
        let total: U256 = plan
            .allocations
            .iter()
            .fold(U256::ZERO, |acc, (_, a)| acc + a);
        assert_eq!(total, capital);
    }

    #[test]
    fn test_each_allocation_meets_floor() {
        let paths = vec![
            path_with(e18(1), e18(1) / U256::from(100u64)),
            path_with(e18(1), e18(1) / U256::from(200u64)),
            path_with(e18(1), e18(1) / U256::from(400u64)),
            path_with(e18(1), e18(1) / U256::from(800u64)),
        ];
        let capital = e18(10);
        let plan = optimizer().optimize(paths, capital, start_token()).unwrap();
        let floor = e18(1); // 0.10 * 10
        for (_, allocation) in &plan.allocations {
            assert!(*allocation >= floor, "allocation {} under floor", allocation);
        }
    }

    #[test]
    fn test_max_paths_cap_keeps_best() {
        let optimizer = MultiPathOptimizer::with_params(2, dec!(0.10), dec!(0.005));
        let paths = vec![
            path_with(e18(1), e18(1) / U256::from(100u64)),
            path_with(e18(1), e18(1) / U256::from(50u64)),
            path_with(e18(1), e18(1) / U256::from(1000u64)),
        ];
        let plan = optimizer.optimize(paths, e18(10), start_token()).unwrap();
        assert_eq!(plan.allocations.len(), 2);
        // The strongest path (2%) leads the plan
        assert_eq!(plan.allocations[0].0.net_profit, e18(1) / U256::from(50u64));
    }

    #[test]
    fn test_monotone_in_rate() {
        let base = vec![
            path_with(e18(1), e18(5) / U256::from(1000u64)),
            path_with(e18(1), e18(5) / U256::from(1000u64)),
        ];
        let bumped = vec![
            path_with(e18(1), e18(8) / U256::from(1000u64)),
            path_with(e18(1), e18(5) / U256::from(1000u64)),
        ];
        let capital = e18(10);
        let before = optimizer().optimize(base, capital, start_token()).unwrap();
        let after = optimizer().optimize(bumped, capital, start_token()).unwrap();
        // Raising path 0's rate never shrinks its allocation
        assert!(after.allocations[0].1 >= before.allocations[0].1);
    }

    #[test]
    fn test_slippage_clamped_at_half() {
        let opt = optimizer();
        assert_eq!(opt.slippage_factor(dec!(100), dec!(1)), dec!(0.5));
        assert_eq!(opt.slippage_factor(dec!(1), dec!(1)), dec!(0.005));
        // Zero required amount degrades to the cap, not a panic
        assert_eq!(opt.slippage_factor(dec!(1), dec!(0)), dec!(0.5));
    }

    #[test]
    fn test_expected_profit_accounts_for_slippage() {
        // One path, capital 10x the quoted size: slippage saturates at 0.5
        // and halves the linear projection
        let rate = dec!(0.01);
        let paths = vec![path_with(e18(1), e18(1) / U256::from(100u64))];
        let plan = optimizer().optimize(paths, e18(10), start_token()).unwrap();
        let linear = rate * dec!(10);
        let expected = numeric::amount_to_decimal(plan.expected_profit, 18).unwrap();
        assert_eq!(expected, linear * dec!(0.5));
    }
}
