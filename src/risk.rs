//! Inclusion-environment risk analyzer
//!
//! Keeps a bounded ring buffer of recent block summaries and condenses them
//! into a discrete risk level plus a quantified gas-volatility statistic.
//! The level feeds the bundle assembler's slippage and priority-fee scaling
//! and the submission controller's re-simulation policy.

use alloy::primitives::U256;
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::info;

use crate::config::RiskConfig;
use crate::numeric;
use crate::types::{BlockSummary, RiskAssessment, RiskLevel};

/// Gas spike factor: current price beyond this multiple of the average is a
/// risk factor on its own.
const SPIKE_FACTOR: Decimal = Decimal::from_parts(18, 0, 0, false, 1); // 1.8

pub struct RiskAnalyzer {
    window_blocks: usize,
    medium_threshold: Decimal,
    high_threshold: Decimal,
    state: Mutex<AnalyzerState>,
}

struct AnalyzerState {
    blocks: VecDeque<BlockSummary>,
    last_level: Option<RiskLevel>,
}

impl RiskAnalyzer {
    pub fn new(config: &RiskConfig) -> Self {
        Self {
            window_blocks: config.window_blocks.max(1),
            medium_threshold: config.medium_threshold,
            high_threshold: config.high_threshold,
            state: Mutex::new(AnalyzerState {
                blocks: VecDeque::new(),
                last_level: None,
            }),
        }
    }

    /// Record one block summary. Re-observing a block number replaces the
    /// older summary; the buffer keeps only the configured window.
    pub fn observe(&self, summary: BlockSummary) {
        let mut state = self.state.lock().expect("risk mutex poisoned");
        state.blocks.retain(|b| b.number != summary.number);
        state.blocks.push_back(summary);
        while state.blocks.len() > self.window_blocks {
            state.blocks.pop_front();
        }
    }

    /// Blocks currently in the window, oldest first.
    pub fn window_len(&self) -> usize {
        self.state.lock().expect("risk mutex poisoned").blocks.len()
    }

    /// Assess the environment given the current fast gas price.
    pub fn assess(&self, gas_price: U256) -> RiskAssessment {
        let mut state = self.state.lock().expect("risk mutex poisoned");
        let blocks: Vec<BlockSummary> = state.blocks.iter().copied().collect();

        let (avg_gas_price, base_fee, block_number) = match blocks.last() {
            Some(latest) => (average_gas_price(&blocks), latest.base_fee, latest.number),
            None => (U256::ZERO, U256::ZERO, 0),
        };

        let volatility = gas_volatility(gas_price, avg_gas_price);

        let mut factors = Vec::new();
        if volatility > self.medium_threshold {
            factors.push("high gas volatility".to_string());
        }
        if !avg_gas_price.is_zero() {
            let ratio = numeric::ratio(gas_price, avg_gas_price).unwrap_or(Decimal::ZERO);
            if ratio > SPIKE_FACTOR {
                factors.push("gas price spike".to_string());
            }
        }
        if base_fee_trending_up(&blocks) {
            factors.push("base-fee trend up".to_string());
        }

        // Ordered rules: high before medium before low
        let level = if volatility > self.high_threshold || factors.len() >= 2 {
            RiskLevel::High
        } else if volatility > self.medium_threshold || factors.len() == 1 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };

        if state.last_level != Some(level) {
            info!(%level, %volatility, factors = ?factors, "risk level changed");
            state.last_level = Some(level);
        }

        RiskAssessment {
            level,
            gas_price,
            avg_gas_price,
            gas_volatility: volatility,
            base_fee,
            factors,
            block_number,
        }
    }
}

/// `|current - average| / average`; zero average reads as zero volatility.
fn gas_volatility(current: U256, average: U256) -> Decimal {
    if average.is_zero() {
        return Decimal::ZERO;
    }
    let diff = if current > average {
        current - average
    } else {
        average - current
    };
    numeric::ratio(diff, average).unwrap_or(Decimal::ZERO)
}

fn average_gas_price(blocks: &[BlockSummary]) -> U256 {
    if blocks.is_empty() {
        return U256::ZERO;
    }
    let sum = blocks
        .iter()
        .fold(U256::ZERO, |acc, b| acc + b.base_fee + b.avg_priority_fee);
    sum / U256::from(blocks.len() as u64)
}

/// Average of the newest 3 base fees against the prior 7. With fewer than
/// 4 observed blocks there is no trend to speak of.
fn base_fee_trending_up(blocks: &[BlockSummary]) -> bool {
    if blocks.len() < 4 {
        return false;
    }
    let split = blocks.len().saturating_sub(3);
    let older = &blocks[..split];
    let newest = &blocks[split..];

    let avg = |slice: &[BlockSummary]| -> U256 {
        let sum = slice.iter().fold(U256::ZERO, |acc, b| acc + b.base_fee);
        sum / U256::from(slice.len() as u64)
    };
    avg(newest) > avg(older)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gwei(n: u64) -> U256 {
        U256::from(n) * U256::from(1_000_000_000u64)
    }

    fn summary(number: u64, base_fee_gwei: u64) -> BlockSummary {
        BlockSummary {
            number,
            base_fee: gwei(base_fee_gwei),
            avg_priority_fee: gwei(2),
        }
    }

    fn analyzer() -> RiskAnalyzer {
        RiskAnalyzer::new(&RiskConfig::default())
    }

    fn fill_flat(analyzer: &RiskAnalyzer, base_fee_gwei: u64) {
        for i in 0..10 {
            analyzer.observe(summary(i, base_fee_gwei));
        }
    }

    #[test]
    fn test_window_bounded() {
        let analyzer = analyzer();
        for i in 0..25 {
            analyzer.observe(summary(i, 30));
        }
        assert_eq!(analyzer.window_len(), 10);
    }

    #[test]
    fn test_reobserved_block_replaces() {
        let analyzer = analyzer();
        analyzer.observe(summary(5, 30));
        analyzer.observe(summary(5, 40));
        assert_eq!(analyzer.window_len(), 1);
        let assessment = analyzer.assess(gwei(42));
        assert_eq!(assessment.base_fee, gwei(40));
    }

    #[test]
    fn test_low_risk_flat_market() {
        let analyzer = analyzer();
        fill_flat(&analyzer, 30);
        // Average is 32 gwei (30 base + 2 priority); 33 is well within band
        let assessment = analyzer.assess(gwei(33));
        assert_eq!(assessment.level, RiskLevel::Low);
        assert!(assessment.factors.is_empty());
        assert!(assessment.gas_volatility < Decimal::new(25, 2));
    }

    #[test]
    fn test_medium_on_volatility() {
        let analyzer = analyzer();
        fill_flat(&analyzer, 30);
        // avg = 32; 42 gwei is ~0.31 volatility: over medium, under high,
        // and volatility itself adds the single factor
        let assessment = analyzer.assess(gwei(42));
        assert_eq!(assessment.level, RiskLevel::Medium);
        assert_eq!(assessment.factors, vec!["high gas volatility".to_string()]);
    }

    #[test]
    fn test_high_on_volatility_alone() {
        let analyzer = analyzer();
        fill_flat(&analyzer, 30);
        // avg = 32; 45 gwei is ~0.41 volatility > 0.35
        let assessment = analyzer.assess(gwei(45));
        assert_eq!(assessment.level, RiskLevel::High);
        assert_eq!(assessment.gas_volatility, Decimal::new(40625, 5));
    }

    #[test]
    fn test_high_on_two_factors() {
        let analyzer = analyzer();
        // Rising base fees plus a spike: two factors force high even if
        // volatility alone is borderline
        for i in 0..10 {
            analyzer.observe(summary(i, 20 + i * 4));
        }
        let assessment = analyzer.assess(gwei(90));
        assert!(assessment.factors.len() >= 2);
        assert_eq!(assessment.level, RiskLevel::High);
    }

    #[test]
    fn test_spike_factor() {
        let analyzer = analyzer();
        fill_flat(&analyzer, 30);
        // avg = 32; 1.9x avg trips the spike factor and with it medium
        let assessment = analyzer.assess(gwei(61));
        assert!(assessment
            .factors
            .iter()
            .any(|f| f == "gas price spike"));
    }

    #[test]
    fn test_trend_up_factor() {
        let analyzer = analyzer();
        for i in 0..10 {
            analyzer.observe(summary(i, if i < 7 { 30 } else { 50 }));
        }
        // Current price right at the (raised) average: no volatility, the
        // trend is the only factor
        let assessment = analyzer.assess(assessment_avg(&analyzer));
        assert!(assessment.factors.iter().any(|f| f == "base-fee trend up"));
        assert_eq!(assessment.level, RiskLevel::Medium);
    }

    fn assessment_avg(analyzer: &RiskAnalyzer) -> U256 {
        analyzer.assess(U256::ZERO).avg_gas_price
    }

    #[test]
    fn test_level_monotone_in_volatility() {
        let analyzer = analyzer();
        fill_flat(&analyzer, 30);
        let mut last = RiskLevel::Low;
        for price in [33u64, 38, 41, 44, 50, 70, 100] {
            let level = analyzer.assess(gwei(price)).level;
            assert!(level >= last, "level dropped at {} gwei", price);
            last = level;
        }
    }

    #[test]
    fn test_empty_window() {
        let analyzer = analyzer();
        let assessment = analyzer.assess(gwei(50));
        assert_eq!(assessment.level, RiskLevel::Low);
        assert_eq!(assessment.avg_gas_price, U256::ZERO);
        assert_eq!(assessment.gas_volatility, Decimal::ZERO);
    }

    #[test]
    fn test_scenario_forty_percent_volatility_is_high() {
        let analyzer = analyzer();
        fill_flat(&analyzer, 50);
        // avg = 52 gwei; 0.40 volatility above it
        let current = gwei(52) + gwei(52) * U256::from(40u64) / U256::from(100u64);
        let assessment = analyzer.assess(current);
        assert_eq!(assessment.gas_volatility, Decimal::new(40, 2));
        assert_eq!(assessment.level, RiskLevel::High);
    }
}
