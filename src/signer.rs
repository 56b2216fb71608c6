//! Signing oracle and nonce management
//!
//! The engine never holds raw key material beyond constructing the local
//! signer; everything downstream talks to the [`SigningOracle`] trait. Two
//! oracles exist per instance: the trading key (signs bundle transactions)
//! and a reserved auth key (signs relay headers only).

use alloy::consensus::{SignableTransaction, TxEip1559, TxEnvelope};
use alloy::eips::eip2718::Encodable2718;
use alloy::primitives::{Address, Bytes, TxKind, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::Mutex;

use crate::error::ProtocolError;

/// Canonical transaction shape the assembler hands to the oracle.
#[derive(Debug, Clone)]
pub struct TxRequest {
    pub chain_id: u64,
    pub nonce: u64,
    pub to: Address,
    pub value: U256,
    pub input: Bytes,
    pub gas_limit: u64,
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
}

/// Produces ECDSA signatures for a key identifier.
pub trait SigningOracle: Send + Sync {
    fn address(&self) -> Address;

    /// Sign a 32-byte hash, returning the 65-byte r||s||v signature.
    fn sign_hash(&self, hash: B256) -> Result<[u8; 65], ProtocolError>;

    /// Sign an EIP-1559 transaction and return the raw EIP-2718 encoding
    /// ready for a bundle.
    fn sign_transaction(&self, tx: &TxRequest) -> Result<Bytes, ProtocolError>;
}

/// Local in-process signer. Construction is the only place key material is
/// touched.
pub struct LocalSigner {
    inner: PrivateKeySigner,
}

impl LocalSigner {
    pub fn from_hex_key(key: &str) -> Result<Self, ProtocolError> {
        let inner = PrivateKeySigner::from_str(key.trim())
            .map_err(|e| ProtocolError::Signing(format!("bad key material: {}", e)))?;
        Ok(Self { inner })
    }
}

impl SigningOracle for LocalSigner {
    fn address(&self) -> Address {
        self.inner.address()
    }

    fn sign_hash(&self, hash: B256) -> Result<[u8; 65], ProtocolError> {
        let signature = self
            .inner
            .sign_hash_sync(&hash)
            .map_err(|e| ProtocolError::Signing(e.to_string()))?;
        Ok(signature.as_bytes())
    }

    fn sign_transaction(&self, tx: &TxRequest) -> Result<Bytes, ProtocolError> {
        let typed = TxEip1559 {
            chain_id: tx.chain_id,
            nonce: tx.nonce,
            gas_limit: tx.gas_limit,
            max_fee_per_gas: tx.max_fee_per_gas,
            max_priority_fee_per_gas: tx.max_priority_fee_per_gas,
            to: TxKind::Call(tx.to),
            value: tx.value,
            access_list: Default::default(),
            input: tx.input.clone(),
        };
        let signature = self
            .inner
            .sign_hash_sync(&typed.signature_hash())
            .map_err(|e| ProtocolError::Signing(e.to_string()))?;
        let envelope = TxEnvelope::Eip1559(typed.into_signed(signature));
        Ok(Bytes::from(envelope.encoded_2718()))
    }
}

/// Monotonic per-wallet nonce counter. Permanently rejected submissions hand
/// their nonce back; released nonces are re-issued FIFO before new ones.
pub struct NonceManager {
    state: Mutex<NonceState>,
}

struct NonceState {
    next: u64,
    released: VecDeque<u64>,
}

impl NonceManager {
    pub fn new(start: u64) -> Self {
        Self {
            state: Mutex::new(NonceState {
                next: start,
                released: VecDeque::new(),
            }),
        }
    }

    pub fn acquire(&self) -> u64 {
        let mut state = self.state.lock().expect("nonce mutex poisoned");
        if let Some(nonce) = state.released.pop_front() {
            nonce
        } else {
            let nonce = state.next;
            state.next += 1;
            nonce
        }
    }

    /// Acquire a consecutive run of nonces for a multi-tx bundle. Released
    /// singles are not mixed into runs; bundles need contiguity.
    pub fn acquire_run(&self, count: usize) -> Vec<u64> {
        let mut state = self.state.lock().expect("nonce mutex poisoned");
        let start = state.next;
        state.next += count as u64;
        (start..start + count as u64).collect()
    }

    pub fn release(&self, nonce: u64) {
        let mut state = self.state.lock().expect("nonce mutex poisoned");
        state.released.push_back(nonce);
    }

    pub fn release_run(&self, nonces: &[u64]) {
        let mut state = self.state.lock().expect("nonce mutex poisoned");
        for &nonce in nonces {
            state.released.push_back(nonce);
        }
    }
}
