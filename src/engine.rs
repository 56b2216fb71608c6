//! Engine orchestration
//!
//! One engine instance owns one event loop: each poll tick runs an
//! arbitrage cycle per start token, capped by `max_concurrent_trades`.
//! A cycle quotes against a single block snapshot (restarting if the head
//! moves mid-cycle), allocates capital, assembles and drives one bundle,
//! and emits exactly one structured outcome record.

use alloy::primitives::{Address, U256};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::arbitrage::{MultiPathOptimizer, PathFinder};
use crate::bundle::{BundleAssembler, BundleSimulator, FlashLoanProvider, SubmissionController, SubmissionOutcome};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::numeric;
use crate::quoting::QuotingEngine;
use crate::records::RecordStore;
use crate::risk::RiskAnalyzer;
use crate::signer::{NonceManager, SigningOracle};
use crate::transport::{JsonRpcConnection, RateLimiter, RelayClient, RpcClient};
use crate::types::{BlockSummary, CycleOutcome, TokenRef};
use crate::venues::VenueRegistry;

/// How many times a cycle may restart after the head advances under it.
const MAX_SNAPSHOT_RESTARTS: u32 = 2;

/// In-flight trade claims: submissions for the same start token or
/// overlapping pools serialize by skipping the later cycle.
struct ActiveTrades {
    inner: Mutex<Vec<(u64, Address, Vec<Address>)>>,
    counter: Mutex<u64>,
}

impl ActiveTrades {
    fn new() -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
            counter: Mutex::new(0),
        }
    }

    fn try_claim(self: &Arc<Self>, start: Address, pools: Vec<Address>) -> Option<TradeClaim> {
        let mut inner = self.inner.lock().expect("trade claims mutex poisoned");
        let conflict = inner.iter().any(|(_, active_start, active_pools)| {
            *active_start == start || active_pools.iter().any(|p| pools.contains(p))
        });
        if conflict {
            return None;
        }
        let mut counter = self.counter.lock().expect("trade claims mutex poisoned");
        *counter += 1;
        let id = *counter;
        inner.push((id, start, pools));
        Some(TradeClaim {
            trades: Arc::clone(self),
            id,
        })
    }
}

struct TradeClaim {
    trades: Arc<ActiveTrades>,
    id: u64,
}

impl Drop for TradeClaim {
    fn drop(&mut self) {
        let mut inner = self
            .trades
            .inner
            .lock()
            .expect("trade claims mutex poisoned");
        inner.retain(|(id, _, _)| *id != self.id);
    }
}

pub struct ArbEngine {
    config: EngineConfig,
    rpc: Arc<RpcClient>,
    quoting: Arc<QuotingEngine>,
    finder: Arc<PathFinder>,
    optimizer: MultiPathOptimizer,
    risk: Arc<RiskAnalyzer>,
    assembler: Arc<BundleAssembler>,
    controller: Arc<SubmissionController>,
    records: Arc<RecordStore>,
    start_tokens: Vec<TokenRef>,
    native_prices: HashMap<Address, Decimal>,
    trade_slots: Arc<Semaphore>,
    active: Arc<ActiveTrades>,
    cancel: CancellationToken,
}

impl ArbEngine {
    /// Wire the full pipeline from configuration and the injected
    /// collaborators (transport connection, signing oracles, optional
    /// flash-loan provider).
    pub fn new(
        config: EngineConfig,
        conn: Arc<dyn JsonRpcConnection>,
        trading_signer: Arc<dyn SigningOracle>,
        auth_signer: Arc<dyn SigningOracle>,
        starting_nonce: u64,
        flash_loan: Option<Arc<dyn FlashLoanProvider>>,
    ) -> Result<Self, EngineError> {
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit.rps,
            Duration::from_secs(config.rate_limit.max_backoff_s),
        ));
        let rpc = Arc::new(RpcClient::new(
            Arc::clone(&conn),
            config.rpc_urls.clone(),
            Arc::clone(&limiter),
        ));
        let relay = Arc::new(RelayClient::new(
            conn,
            config.relay_url.clone(),
            auth_signer,
            limiter,
        ));

        let registry = Arc::new(VenueRegistry::from_config(&config, Arc::clone(&rpc))?);
        let quoting = Arc::new(QuotingEngine::new(Arc::clone(&registry), &config));
        let finder = Arc::new(PathFinder::new(
            Arc::clone(&quoting),
            &registry,
            &config,
        ));
        let optimizer = MultiPathOptimizer::new(&config);
        let risk = Arc::new(RiskAnalyzer::new(&config.risk));

        let wallet = trading_signer.address();
        let nonces = Arc::new(NonceManager::new(starting_nonce));
        let assembler = Arc::new(BundleAssembler::new(
            Arc::clone(&registry),
            trading_signer,
            nonces,
            &config,
            wallet,
            flash_loan,
        ));
        let simulator = BundleSimulator::new(
            Arc::clone(&relay),
            Duration::from_millis(config.timeouts.simulation_ms),
            config.timeouts.max_simulations,
        );
        let controller = Arc::new(SubmissionController::new(
            relay,
            Arc::clone(&rpc),
            simulator,
            Arc::clone(&risk),
            config.mev.max_blocks_ahead,
            Duration::from_millis(config.timeouts.submit_ms),
            Duration::from_millis(config.poll_interval_ms.min(500)),
        ));
        let records = Arc::new(
            RecordStore::new(&config.records_dir)
                .map_err(|e| EngineError::Config(crate::error::ConfigError::Io(e.to_string())))?,
        );

        let start_tokens = config
            .start_tokens
            .iter()
            .filter_map(|s| {
                let address = numeric::parse_address(s).ok()?;
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

        let trade_slots = Arc::new(Semaphore::new(config.max_concurrent_trades.max(1)));
        Ok(Self {
            config,
            rpc,
            quoting,
            finder,
            optimizer,
            risk,
            assembler,
            controller,
            records,
            start_tokens,
            native_prices,
            trade_slots,
            active: Arc::new(ActiveTrades::new()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn quoting(&self) -> &Arc<QuotingEngine> {
        &self.quoting
    }

    pub fn records(&self) -> &Arc<RecordStore> {
        &self.records
    }

    /// Poll loop: one cycle per start token per tick, until cancelled.
    pub async fn run(self: Arc<Self>) -> Result<(), EngineError> {
        info!(
            venues = self.start_tokens.len(),
            poll_ms = self.config.poll_interval_ms,
            "engine started"
        );
        let mut last_block = 0u64;
        loop {
            if self.cancel.is_cancelled() {
                info!("engine stopping");
                return Ok(());
            }

            match self.rpc.block_number().await {
                Ok(block) if block != last_block => {
                    last_block = block;
                    self.quoting.on_new_block(block);
                    for start in self.start_tokens.clone() {
                        let engine = Arc::clone(&self);
                        let Ok(permit) =
                            Arc::clone(&self.trade_slots).acquire_owned().await
                        else {
                            continue;
                        };
                        tokio::spawn(async move {
                            let _permit = permit;
                            let outcome = engine.cycle(start).await;
                            debug!(outcome = outcome.tag(), token = %start, "cycle finished");
                        });
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "head poll failed"),
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms)) => {}
            }
        }
    }

    /// One complete cycle for one start token. Always records exactly one
    /// outcome.
    pub async fn cycle(&self, start: TokenRef) -> CycleOutcome {
        let cycle_cancel = self.cancel.child_token();
        let budget = Duration::from_millis(self.config.timeouts.cycle_budget_ms);
        let outcome = match tokio::time::timeout(budget, self.cycle_inner(start, &cycle_cancel))
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(token = %start, "cycle budget exhausted");
                cycle_cancel.cancel();
                CycleOutcome::TransportAborted
            }
        };
        if let Err(e) = self
            .records
            .record_outcome(&start.checksummed(), &outcome)
        {
            error!(error = %e, "failed to persist outcome record");
        }
        outcome
    }

    async fn cycle_inner(&self, start: TokenRef, cancel: &CancellationToken) -> CycleOutcome {
        for _ in 0..=MAX_SNAPSHOT_RESTARTS {
            match self.cycle_at_snapshot(start, cancel).await {
                Ok(Some(outcome)) => return outcome,
                // Head moved under the cycle: restart on a fresh snapshot
                Ok(None) => {
                    debug!(token = %start, "head advanced mid-cycle, restarting");
                    continue;
                }
                Err(EngineError::NoPaths) => return CycleOutcome::NoOpportunity,
                Err(EngineError::Validation(check)) => {
                    return CycleOutcome::ValidationFailed { check }
                }
                Err(EngineError::Invariant(e)) => {
                    error!(error = %e, "invariant violation, cycle terminated");
                    return CycleOutcome::TransportAborted;
                }
                Err(e) => {
                    warn!(error = %e, "cycle aborted");
                    return CycleOutcome::TransportAborted;
                }
            }
        }
        warn!(token = %start, "snapshot kept moving, giving up this cycle");
        CycleOutcome::NoOpportunity
    }

    /// Run the pipeline against one block snapshot. `Ok(None)` means the
    /// head advanced mid-cycle and the caller should restart.
    async fn cycle_at_snapshot(
        &self,
        start: TokenRef,
        cancel: &CancellationToken,
    ) -> Result<Option<CycleOutcome>, EngineError> {
        let block = self.rpc.block_number().await?;
        let (_, base_fee) = self.rpc.block_base_fee(block).await?;
        let gas_price = self.rpc.gas_price().await?;

        self.risk.observe(BlockSummary {
            number: block,
            base_fee,
            avg_priority_fee: gas_price.saturating_sub(base_fee),
        });
        let assessment = self.risk.assess(gas_price);
        if let Err(e) = self.records.record_risk(&assessment) {
            warn!(error = %e, "failed to persist risk snapshot");
        }

        let capital = numeric::decimal_to_amount(self.config.capital, start.decimals)
            .map_err(EngineError::Adapter)?;
        let paths = self
            .finder
            .find_paths(
                start,
                capital,
                gas_price,
                block,
                self.config.max_paths,
            )
            .await;

        // Consistent-snapshot rule: all quotes must come from one block
        if self.rpc.block_number().await? != block {
            return Ok(None);
        }
        if paths.is_empty() {
            return Ok(Some(CycleOutcome::NoOpportunity));
        }

        let plan = self.optimizer.optimize(paths, capital, start)?;

        let pools: Vec<Address> = plan
            .allocations
            .iter()
            .flat_map(|(path, _)| path.pool_addresses())
            .collect();
        let Some(_claim) = self.active.try_claim(start.address, pools) else {
            debug!(token = %start, "overlapping submission in flight, yielding");
            return Ok(Some(CycleOutcome::NoOpportunity));
        };

        let mut bundle = self.assembler.assemble(&plan, &assessment, block)?;
        let min_profit_wei = self.min_profit_wei(start)?;

        match self
            .controller
            .drive(&mut bundle, &self.assembler, &assessment, min_profit_wei, cancel)
            .await?
        {
            SubmissionOutcome::Included {
                bundle_hash,
                realized_profit,
            } => Ok(Some(CycleOutcome::Ok {
                bundle_hash,
                target_block: bundle.target_block,
                realized_profit_wei: realized_profit.to_string(),
            })),
            SubmissionOutcome::Expired => Ok(Some(CycleOutcome::Expired)),
            SubmissionOutcome::Failed(check) => {
                Ok(Some(CycleOutcome::ValidationFailed { check }))
            }
            SubmissionOutcome::Rejected(reason) => {
                warn!(%reason, "relay rejected bundle");
                Ok(Some(CycleOutcome::TransportAborted))
            }
        }
    }

    /// The validator's minimum profit, converted to wei through the start
    /// token's native price.
    fn min_profit_wei(&self, start: TokenRef) -> Result<U256, EngineError> {
        let price = self
            .native_prices
            .get(&start.address)
            .copied()
            .unwrap_or(Decimal::ONE);
        if price <= Decimal::ZERO {
            return Ok(U256::ZERO);
        }
        numeric::decimal_to_amount(self.config.min_profit_threshold / price, 18)
            .map_err(EngineError::Adapter)
    }
}

impl Drop for ArbEngine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError as VErr;
    use crate::signer::testing::MockSigner;
    use crate::transport::rpc::testing::MockConnection;
    use alloy::primitives::hex;
    use serde_json::json;

    fn e18(units: u64) -> U256 {
        U256::from(units) * U256::from(10u64).pow(U256::from(18))
    }

    fn e6(units: u64) -> U256 {
        U256::from(units) * U256::from(10u64).pow(U256::from(6))
    }

    /// Base-fee 0.05 gwei, gas price 0.1 gwei: cheap-gas chain so the test
    /// books' margins clear the gas budget comfortably.
    fn engine_config(records_tag: &str) -> EngineConfig {
        let records_dir = std::env::temp_dir().join(format!(
            "arb-engine-{}-{}",
            records_tag,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&records_dir);
        let toml_str = format!(
            r#"
            chain_id = 8453
            rpc_urls = ["https://rpc.example"]
            relay_url = "https://relay.example"
            wallet_address = "0x1111111111111111111111111111111111111111"
            capital = 1.0
            start_tokens = ["0x0101010101010101010101010101010101010101"]
            max_path_length = 2
            max_paths = 5
            min_margin = 0.002
            min_profit_threshold = 0.2
            slippage_tolerance = 0.005
            max_parallel_requests = 1
            records_dir = "{}"

            [mev]
            max_blocks_ahead = 3

            [[tokens]]
            address = "0x0101010101010101010101010101010101010101"
            decimals = 18
            symbol = "WETH"

            [[tokens]]
            address = "0x0202020202020202020202020202020202020202"
            decimals = 6
            symbol = "USDC"
            native_price = 2000.0

            [[venues]]
            id = "venue-a"
            kind = "V2"
            router = "0x4444444444444444444444444444444444444444"
            factory = "0x5555555555555555555555555555555555555555"
            fee = 30

            [[venues]]
            id = "venue-b"
            kind = "V2"
            router = "0x6666666666666666666666666666666666666666"
            factory = "0x7777777777777777777777777777777777777777"
            fee = 30
        "#,
            records_dir.display()
        );
        toml::from_str(&toml_str).unwrap()
    }

    fn word_result(words: &[U256]) -> serde_json::Value {
        let mut data = Vec::new();
        for w in words {
            data.extend_from_slice(&w.to_be_bytes::<32>());
        }
        json!(format!("0x{}", hex::encode(data)))
    }

    fn engine(config: EngineConfig, conn: Arc<MockConnection>) -> ArbEngine {
        ArbEngine::new(
            config,
            conn,
            Arc::new(MockSigner::new(0x11)),
            Arc::new(MockSigner::new(0xaa)),
            0,
            None,
        )
        .unwrap()
    }

    fn weth() -> TokenRef {
        TokenRef::new(Address::repeat_byte(1), 18).unwrap()
    }

    /// Base environment: block 100, base fee 0.05 gwei, gas 0.1 gwei.
    fn seed_chain(conn: &MockConnection) {
        conn.set_default("eth_blockNumber", json!("0x64"));
        conn.set_default(
            "eth_getBlockByNumber",
            json!({"number": "0x64", "baseFeePerGas": "0x2faf080"}),
        );
        conn.set_default("eth_gasPrice", json!("0x5f5e100"));
        conn.route_call(
            "e6a43905",
            word_result(&[U256::from_be_slice(Address::repeat_byte(0xcc).as_slice())]),
        );
    }

    /// Scenario books: venue-a at 2.000M USDC per 1000 WETH, venue-b at
    /// 2.050M. Reserve reads happen venue-a-then-venue-b within every quote
    /// group (requests are venue-sorted and sequential), so an alternating
    /// queue keeps each venue on its own book for both hops. Only the
    /// sell-on-B-buy-on-A cycle closes positive.
    fn seed_discrepancy(conn: &MockConnection) {
        let book_a = word_result(&[e18(1_000), e6(2_000_000), U256::ZERO]);
        let book_b = word_result(&[e18(1_000), e6(2_050_000), U256::ZERO]);
        for _ in 0..3 {
            conn.push("eth_call", book_a.clone());
            conn.push("eth_call", book_b.clone());
        }
        conn.set_default("eth_call", book_a);
    }

    fn good_sim_response() -> serde_json::Value {
        json!({
            "bundleHash": "0xsim",
            "totalGasUsed": 230000,
            "bundleGasPrice": "0x5f5e100",
            "coinbaseDiff": "0x3782dace9d90000",
            "gasFees": "0x5af3107a4000",
            "stateBlockNumber": 100,
            "results": [{"gasUsed": 115000}, {"gasUsed": 115000}]
        })
    }

    #[tokio::test]
    async fn test_scenario_single_two_hop_opportunity() {
        let config = engine_config("s1");
        let conn = Arc::new(MockConnection::new());
        seed_chain(&conn);
        seed_discrepancy(&conn);
        conn.push("eth_callBundle", good_sim_response());
        conn.push("eth_sendBundle", json!({"bundleHash": "0xbeef"}));
        // Target block mined right away
        conn.push("eth_blockNumber", json!("0x64"));
        conn.push("eth_blockNumber", json!("0x64"));
        conn.set_default("eth_blockNumber", json!("0x65"));
        conn.push(
            "flashbots_getBundleStats",
            json!({"isIncluded": true, "isConsidered": true, "isSimulated": true}),
        );

        let engine = engine(config, conn.clone());
        let outcome = engine.cycle(weth()).await;

        match &outcome {
            CycleOutcome::Ok {
                bundle_hash,
                target_block,
                ..
            } => {
                assert_eq!(bundle_hash, "0xbeef");
                assert_eq!(*target_block, 101);
            }
            other => panic!("expected ok outcome, got {:?}", other),
        }
        assert_eq!(conn.count("eth_sendBundle"), 1);
        // Two swap sub-calls in the submitted bundle
        let calls = conn.calls.lock().unwrap();
        let send = calls
            .iter()
            .find(|(m, _)| m == "eth_sendBundle")
            .unwrap();
        assert_eq!(send.1[0]["txs"].as_array().unwrap().len(), 2);

        drop(calls);
        let records = engine
            .records()
            .read_outcomes(chrono::Utc::now().date_naive())
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome.tag(), "ok");
    }

    #[tokio::test]
    async fn test_scenario_no_opportunity() {
        let config = engine_config("s6");
        let conn = Arc::new(MockConnection::new());
        seed_chain(&conn);
        // Identical books: margins never clear the fee
        conn.set_default(
            "eth_call",
            word_result(&[e18(1_000), e6(2_000_000), U256::ZERO]),
        );

        let engine = engine(config, conn.clone());
        let outcome = engine.cycle(weth()).await;

        assert!(matches!(outcome, CycleOutcome::NoOpportunity));
        // Zero relay traffic
        assert_eq!(conn.count("eth_sendBundle"), 0);
        assert_eq!(conn.count("eth_callBundle"), 0);
        // Quote cache populated for this block, invalidated at the next
        assert!(engine.quoting().cache_len() > 0);
        engine.quoting().on_new_block(101);
        assert_eq!(engine.quoting().cache_len(), 0);

        let records = engine
            .records()
            .read_outcomes(chrono::Utc::now().date_naive())
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome.tag(), "no_opportunity");
    }

    #[tokio::test]
    async fn test_scenario_simulation_slippage_failure() {
        let config = engine_config("s3");
        let conn = Arc::new(MockConnection::new());
        seed_chain(&conn);
        seed_discrepancy(&conn);
        // Relay reports the second swap under its minimum at sim time
        conn.push(
            "eth_callBundle",
            json!({
                "totalGasUsed": 230000,
                "coinbaseDiff": "0x3782dace9d90000",
                "gasFees": "0x5af3107a4000",
                "stateBlockNumber": 100,
                "results": [
                    {"gasUsed": 115000},
                    {"gasUsed": 115000, "amountOut": "0x1"}
                ]
            }),
        );

        let engine = engine(config, conn.clone());
        let outcome = engine.cycle(weth()).await;

        match outcome {
            CycleOutcome::ValidationFailed { check } => {
                assert_eq!(check, VErr::StepSlippage(1));
            }
            other => panic!("expected validation failure, got {:?}", other),
        }
        // Validation failure aborts before any submission
        assert_eq!(conn.count("eth_sendBundle"), 0);
    }

    #[tokio::test]
    async fn test_snapshot_restart_on_head_advance() {
        let config = engine_config("restart");
        let conn = Arc::new(MockConnection::new());
        seed_chain(&conn);
        // First snapshot at block 100; by the consistency check the head
        // reads 101, forcing a restart that then finds nothing
        conn.push("eth_blockNumber", json!("0x64"));
        conn.push("eth_blockNumber", json!("0x65"));
        conn.set_default("eth_blockNumber", json!("0x65"));
        conn.set_default(
            "eth_call",
            word_result(&[e18(1_000), e6(2_000_000), U256::ZERO]),
        );

        let engine = engine(config, conn.clone());
        let outcome = engine.cycle(weth()).await;
        assert!(matches!(outcome, CycleOutcome::NoOpportunity));
        // The restarted cycle re-read the head at least four times
        assert!(conn.count("eth_blockNumber") >= 4);
    }

    #[tokio::test]
    async fn test_transport_abort_recorded() {
        let config = engine_config("abort");
        let conn = Arc::new(MockConnection::new());
        seed_chain(&conn);
        seed_discrepancy(&conn);
        // Simulation endpoint is down hard
        conn.push(
            "eth_callBundle",
            json!({"error": {"code": -32601, "message": "method eth_callBundle not found"}}),
        );

        let engine = engine(config, conn.clone());
        let outcome = engine.cycle(weth()).await;
        assert!(matches!(outcome, CycleOutcome::TransportAborted));

        let records = engine
            .records()
            .read_outcomes(chrono::Utc::now().date_naive())
            .unwrap();
        assert_eq!(records[0].outcome.tag(), "transport_aborted");
    }

    #[tokio::test]
    async fn test_risk_snapshots_persisted() {
        let config = engine_config("risk");
        let conn = Arc::new(MockConnection::new());
        seed_chain(&conn);
        conn.set_default(
            "eth_call",
            word_result(&[e18(1_000), e6(2_000_000), U256::ZERO]),
        );

        let engine = engine(config, conn);
        let _ = engine.cycle(weth()).await;
        assert!(engine.records().risk_snapshot_count().unwrap() >= 1);
    }
}
