//! Persisted outcome and risk records
//!
//! One rolling JSONL file per day for executed-bundle records, plus a
//! single append-only file of risk snapshots. No databases; each line is a
//! self-contained JSON object.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::types::{CycleOutcome, RiskAssessment};

/// One line of the daily bundle record file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub timestamp: String,
    pub start_token: String,
    #[serde(flatten)]
    pub outcome: CycleOutcome,
}

pub struct RecordStore {
    base_dir: PathBuf,
    /// Serializes appends so records from concurrent cycles interleave at
    /// line granularity
    write_lock: Mutex<()>,
}

impl RecordStore {
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir)
            .with_context(|| format!("failed to create records dir: {:?}", base_dir))?;
        Ok(Self {
            base_dir,
            write_lock: Mutex::new(()),
        })
    }

    fn bundles_path_for(&self, date: chrono::NaiveDate) -> PathBuf {
        self.base_dir
            .join(format!("bundles_{}.jsonl", date.format("%Y-%m-%d")))
    }

    fn risk_path(&self) -> PathBuf {
        self.base_dir.join("risk_snapshots.jsonl")
    }

    /// Append one cycle outcome to today's bundle file.
    pub fn record_outcome(&self, start_token: &str, outcome: &CycleOutcome) -> Result<()> {
        let record = OutcomeRecord {
            timestamp: Utc::now().to_rfc3339(),
            start_token: start_token.to_string(),
            outcome: outcome.clone(),
        };
        let path = self.bundles_path_for(Utc::now().date_naive());
        self.append_line(&path, &serde_json::to_string(&record)?)
    }

    /// Append one risk snapshot.
    pub fn record_risk(&self, assessment: &RiskAssessment) -> Result<()> {
        let mut line = serde_json::to_value(assessment)?;
        line["timestamp"] = serde_json::Value::String(Utc::now().to_rfc3339());
        self.append_line(&self.risk_path(), &line.to_string())
    }

    fn append_line(&self, path: &Path, line: &str) -> Result<()> {
        let _guard = self.write_lock.lock().expect("record mutex poisoned");
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open record file: {:?}", path))?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    /// Read back one day's outcome records.
    pub fn read_outcomes(&self, date: chrono::NaiveDate) -> Result<Vec<OutcomeRecord>> {
        let path = self.bundles_path_for(date);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(&path)?);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }

    /// Count of risk snapshots on disk.
    pub fn risk_snapshot_count(&self) -> Result<usize> {
        let path = self.risk_path();
        if !path.exists() {
            return Ok(0);
        }
        let reader = BufReader::new(File::open(&path)?);
        Ok(reader.lines().count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;
    use crate::types::RiskLevel;
    use alloy::primitives::U256;
    use rust_decimal::Decimal;

    fn temp_store(tag: &str) -> RecordStore {
        let dir = std::env::temp_dir().join(format!(
            "arb-records-{}-{}",
            tag,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        RecordStore::new(dir).unwrap()
    }

    #[test]
    fn test_outcome_roundtrip() {
        let store = temp_store("outcome");
        store
            .record_outcome(
                "0x1111",
                &CycleOutcome::Ok {
                    bundle_hash: "0xbeef".into(),
                    target_block: 101,
                    realized_profit_wei: "90000000000000000".into(),
                },
            )
            .unwrap();
        store.record_outcome("0x1111", &CycleOutcome::NoOpportunity).unwrap();
        store
            .record_outcome(
                "0x1111",
                &CycleOutcome::ValidationFailed {
                    check: ValidationError::StepSlippage(1),
                },
            )
            .unwrap();

        let records = store.read_outcomes(Utc::now().date_naive()).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].outcome.tag(), "ok");
        assert_eq!(records[1].outcome.tag(), "no_opportunity");
        match &records[2].outcome {
            CycleOutcome::ValidationFailed { check } => {
                assert_eq!(*check, ValidationError::StepSlippage(1));
            }
            other => panic!("wrong outcome: {:?}", other),
        }
    }

    #[test]
    fn test_risk_snapshots_append() {
        let store = temp_store("risk");
        let assessment = RiskAssessment {
            level: RiskLevel::Medium,
            gas_price: U256::from(42_000_000_000u64),
            avg_gas_price: U256::from(32_000_000_000u64),
            gas_volatility: Decimal::new(3125, 4),
            base_fee: U256::from(30_000_000_000u64),
            factors: vec!["high gas volatility".into()],
            block_number: 100,
        };
        store.record_risk(&assessment).unwrap();
        store.record_risk(&assessment).unwrap();
        assert_eq!(store.risk_snapshot_count().unwrap(), 2);
    }

    #[test]
    fn test_empty_day_reads_empty() {
        let store = temp_store("empty");
        let records = store
            .read_outcomes(chrono::NaiveDate::from_ymd_opt(2020, 1, 1).unwrap())
            .unwrap();
        assert!(records.is_empty());
    }
}
