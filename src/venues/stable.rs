//! Stableswap adapter
//!
//! Pools are registered statically (no factory discovery); balances are read
//! on demand and outputs come from the stableswap invariant, solved with
//! bounded Newton iteration in integer math. Balances are normalized to
//! 18-decimal precision before entering the solvers.

use alloy::primitives::{Address, Bytes, U256};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::debug;

use super::adapter::{min_out_with_slippage, QuoteOutcome, SwapCall};
use crate::encoding::{decode_uint, encode_call, Word};
use crate::error::AdapterError;
use crate::numeric;
use crate::transport::RpcClient;
use crate::types::{PathStep, Pool, PoolKind, PoolState, PoolStateData, Quote, TokenRef, VenueId};

/// balances(uint256)
const BALANCES_SELECTOR: [u8; 4] = [0x49, 0x03, 0xb0, 0xd1];
/// A()
const AMP_SELECTOR: [u8; 4] = [0xf4, 0x46, 0xc1, 0xd0];
/// exchange(int128,int128,uint256,uint256)
const EXCHANGE_SELECTOR: [u8; 4] = [0x3d, 0xf0, 0x21, 0x24];

const FEE_DENOM: u64 = 10_000;
const STABLE_SWAP_GAS: u64 = 180_000;
const MAX_ITERATIONS: usize = 255;
const PRECISION_DECIMALS: u8 = 18;

pub struct StableAdapter {
    id: VenueId,
    router: Address,
    /// Fee numerator over 10_000
    fee: u32,
    pools: Vec<Pool>,
    rpc: Arc<RpcClient>,
}

impl StableAdapter {
    pub fn new(
        id: VenueId,
        router: Address,
        fee: u32,
        pools: Vec<(Address, Vec<TokenRef>, u64)>,
        rpc: Arc<RpcClient>,
    ) -> Self {
        let pools = pools
            .into_iter()
            .map(|(address, tokens, amp)| Pool {
                venue: id.clone(),
                address,
                tokens,
                fee,
                kind: PoolKind::Stable,
                venue_params: serde_json::json!({ "amp": amp }),
            })
            .collect();
        Self {
            id,
            router,
            fee,
            pools,
            rpc,
        }
    }

    pub fn venue_id(&self) -> &VenueId {
        &self.id
    }

    fn configured_amp(pool: &Pool) -> u64 {
        pool.venue_params
            .get("amp")
            .and_then(|a| a.as_u64())
            .unwrap_or(100)
    }

    fn find_pool(&self, token_a: Address, token_b: Address) -> Option<&Pool> {
        self.pools.iter().find(|pool| {
            pool.token_index(token_a).is_some() && pool.token_index(token_b).is_some()
        })
    }

    /// Read balances (one batched call per pool) and the live amplification
    /// coefficient; the configured amp is the fallback.
    async fn fetch_state(&self, pool: &Pool) -> Result<(Vec<U256>, u64), AdapterError> {
        let mut calls: Vec<(&str, serde_json::Value)> = Vec::with_capacity(pool.tokens.len() + 1);
        let balance_calls: Vec<Bytes> = (0..pool.tokens.len())
            .map(|i| encode_call(BALANCES_SELECTOR, &[Word::Uint(U256::from(i as u64))]))
            .collect();
        for calldata in &balance_calls {
            calls.push(("eth_call", RpcClient::eth_call_params(pool.address, calldata)));
        }
        let amp_call = encode_call(AMP_SELECTOR, &[]);
        calls.push(("eth_call", RpcClient::eth_call_params(pool.address, &amp_call)));

        let results = self
            .rpc
            .batch(&calls)
            .await
            .map_err(|e| AdapterError::Decode(e.to_string()))?;

        let mut balances = Vec::with_capacity(pool.tokens.len());
        for (i, result) in results.iter().take(pool.tokens.len()).enumerate() {
            let hex = result
                .as_ref()
                .map_err(|e| AdapterError::Decode(format!("balances({}) failed: {}", i, e)))?
                .as_str()
                .ok_or_else(|| AdapterError::Decode("balance result not hex".into()))?
                .trim_start_matches("0x")
                .to_string();
            let raw = alloy::primitives::hex::decode(&hex)
                .map_err(|e| AdapterError::Decode(e.to_string()))?;
            balances.push(decode_uint(&raw, 0)?);
        }

        let amp = results
            .last()
            .and_then(|r| r.as_ref().ok())
            .and_then(|v| v.as_str())
            .and_then(|s| alloy::primitives::hex::decode(s.trim_start_matches("0x")).ok())
            .and_then(|raw| decode_uint(&raw, 0).ok())
            .and_then(|a| a.try_into().ok())
            .unwrap_or_else(|| Self::configured_amp(pool));

        Ok((balances, amp))
    }

    pub async fn quote(
        &self,
        token_in: TokenRef,
        token_out: TokenRef,
        amount_in: U256,
        block: u64,
    ) -> Result<QuoteOutcome, AdapterError> {
        let Some(pool) = self.find_pool(token_in.address, token_out.address) else {
            return Ok(QuoteOutcome::NoPool);
        };
        if pool.address == Address::ZERO {
            return Ok(QuoteOutcome::NoPool);
        }
        let i = pool.token_index(token_in.address).expect("checked in find_pool");
        let j = pool.token_index(token_out.address).expect("checked in find_pool");

        let (balances, amp) = self.fetch_state(pool).await?;
        if balances.iter().any(|b| b.is_zero()) {
            debug!(venue = %self.id, pool = %pool.address, "empty stable balances");
            return Ok(QuoteOutcome::Stale);
        }

        if amount_in.is_zero() {
            return Ok(QuoteOutcome::Quote(Quote {
                pool: pool.clone(),
                token_in,
                token_out,
                amount_in,
                amount_out: U256::ZERO,
                price_impact: Decimal::ZERO,
                gas_estimate: STABLE_SWAP_GAS,
                block_number: block,
            }));
        }

        let xp = normalize_balances(&balances, &pool.tokens)?;
        let dx = normalize_amount(amount_in, token_in.decimals)?;
        let (dy_normalized, impact) = swap_output(&xp, i, j, dx, amp, self.fee)?;
        let amount_out = denormalize_amount(dy_normalized, token_out.decimals);

        Ok(QuoteOutcome::Quote(Quote {
            pool: pool.clone(),
            token_in,
            token_out,
            amount_in,
            amount_out,
            price_impact: impact,
            gas_estimate: STABLE_SWAP_GAS,
            block_number: block,
        }))
    }

    pub async fn pool_state(&self, pool: &Pool) -> Result<Option<PoolState>, AdapterError> {
        if pool.address == Address::ZERO {
            return Ok(None);
        }
        let (balances, amp) = self.fetch_state(pool).await?;
        let block = self
            .rpc
            .block_number()
            .await
            .map_err(|e| AdapterError::Decode(e.to_string()))?;
        Ok(Some(PoolState {
            pool_address: pool.address,
            data: PoolStateData::Stable { balances, amp },
            block_number: block,
        }))
    }

    /// Invariant residual of the executed trade against the pre-trade state.
    pub fn price_impact(&self, quote: &Quote, state: &PoolState) -> Result<Decimal, AdapterError> {
        let PoolStateData::Stable { balances, amp } = &state.data else {
            return Err(AdapterError::Decode("state kind mismatch".into()));
        };
        let i = quote
            .pool
            .token_index(quote.token_in.address)
            .ok_or_else(|| AdapterError::Decode("token not in pool".into()))?;
        let j = quote
            .pool
            .token_index(quote.token_out.address)
            .ok_or_else(|| AdapterError::Decode("token not in pool".into()))?;

        let xp = normalize_balances(balances, &quote.pool.tokens)?;
        let dx = normalize_amount(quote.amount_in, quote.token_in.decimals)?;
        let dy = normalize_amount(quote.amount_out, quote.token_out.decimals)?;
        invariant_residual(&xp, i, j, dx, dy, *amp)
    }

    pub fn build_swap(
        &self,
        step: &PathStep,
        _recipient: Address,
        _deadline: u64,
        slippage: Decimal,
    ) -> Result<SwapCall, AdapterError> {
        let i = step
            .pool
            .token_index(step.token_in.address)
            .ok_or_else(|| AdapterError::Decode("token not in pool".into()))?;
        let j = step
            .pool
            .token_index(step.token_out.address)
            .ok_or_else(|| AdapterError::Decode("token not in pool".into()))?;
        let min_out = min_out_with_slippage(step.amount_out, slippage);
        // exchange settles to the caller; recipient/deadline have no slot in
        // this interface
        let calldata = encode_call(
            EXCHANGE_SELECTOR,
            &[
                Word::Uint(U256::from(i as u64)),
                Word::Uint(U256::from(j as u64)),
                Word::Uint(step.amount_in),
                Word::Uint(min_out),
            ],
        );
        Ok(SwapCall {
            to: step.pool.address,
            calldata,
            value: U256::ZERO,
            min_out,
            gas_limit: STABLE_SWAP_GAS,
        })
    }
}

fn normalize_amount(amount: U256, decimals: u8) -> Result<U256, AdapterError> {
    if decimals > PRECISION_DECIMALS {
        Ok(amount / numeric::pow10(decimals - PRECISION_DECIMALS))
    } else {
        amount
            .checked_mul(numeric::pow10(PRECISION_DECIMALS - decimals))
            .ok_or_else(|| AdapterError::Numeric("balance normalization".into()))
    }
}

fn denormalize_amount(amount: U256, decimals: u8) -> U256 {
    if decimals > PRECISION_DECIMALS {
        amount * numeric::pow10(decimals - PRECISION_DECIMALS)
    } else {
        amount / numeric::pow10(PRECISION_DECIMALS - decimals)
    }
}

fn normalize_balances(balances: &[U256], tokens: &[TokenRef]) -> Result<Vec<U256>, AdapterError> {
    if balances.len() != tokens.len() {
        return Err(AdapterError::Decode(format!(
            "balance count {} does not match token count {}",
            balances.len(),
            tokens.len()
        )));
    }
    balances
        .iter()
        .zip(tokens)
        .map(|(balance, token)| normalize_amount(*balance, token.decimals))
        .collect()
}

/// The invariant D for normalized balances: Newton iteration on
/// `Ann*S + n*D_P = (Ann-1)*D + (n+1)*D_P` with
/// `D_P = D^(n+1) / (n^n * prod(x))`.
pub fn compute_d(xp: &[U256], amp: u64) -> Result<U256, AdapterError> {
    let n = U256::from(xp.len() as u64);
    let s: U256 = xp.iter().fold(U256::ZERO, |acc, x| acc + x);
    if s.is_zero() {
        return Ok(U256::ZERO);
    }
    let ann = U256::from(amp) * n;

    let mut d = s;
    for _ in 0..MAX_ITERATIONS {
        // D_P = D^(n+1) / (n^n * prod(x)), staged to avoid overflow
        let mut d_p = d;
        for x in xp {
            let denom = x
                .checked_mul(n)
                .ok_or_else(|| AdapterError::Numeric("d_p denom".into()))?;
            d_p = d_p
                .checked_mul(d)
                .ok_or_else(|| AdapterError::Numeric("d_p".into()))?
                / denom;
        }
        let d_prev = d;
        let numerator = (ann * s + d_p * n)
            .checked_mul(d)
            .ok_or_else(|| AdapterError::Numeric("d numerator".into()))?;
        let denominator = (ann - U256::from(1u64)) * d + (n + U256::from(1u64)) * d_p;
        d = numerator / denominator;

        let diff = if d > d_prev { d - d_prev } else { d_prev - d };
        if diff <= U256::from(1u64) {
            return Ok(d);
        }
    }
    Err(AdapterError::Numeric("invariant D did not converge".into()))
}

/// Solve for the post-trade balance of coin j given coin i moved to `x`.
pub fn compute_y(xp: &[U256], i: usize, j: usize, x: U256, amp: u64) -> Result<U256, AdapterError> {
    if i == j || i >= xp.len() || j >= xp.len() {
        return Err(AdapterError::Numeric("bad coin indices".into()));
    }
    let n = U256::from(xp.len() as u64);
    let ann = U256::from(amp) * n;
    let d = compute_d(xp, amp)?;

    let mut c = d;
    let mut s = U256::ZERO;
    for (k, balance) in xp.iter().enumerate() {
        let x_k = if k == i {
            x
        } else if k == j {
            continue;
        } else {
            *balance
        };
        s += x_k;
        let denom = x_k
            .checked_mul(n)
            .ok_or_else(|| AdapterError::Numeric("y c denom".into()))?;
        c = c
            .checked_mul(d)
            .ok_or_else(|| AdapterError::Numeric("y c".into()))?
            / denom;
    }
    c = c
        .checked_mul(d)
        .ok_or_else(|| AdapterError::Numeric("y c final".into()))?
        / (ann * n);
    let b = s + d / ann;

    let mut y = d;
    for _ in 0..MAX_ITERATIONS {
        let y_prev = y;
        let numerator = y
            .checked_mul(y)
            .ok_or_else(|| AdapterError::Numeric("y sq".into()))?
            + c;
        let denominator = y * U256::from(2u64) + b - d;
        if denominator.is_zero() {
            return Err(AdapterError::Numeric("y denominator zero".into()));
        }
        y = numerator / denominator;
        let diff = if y > y_prev { y - y_prev } else { y_prev - y };
        if diff <= U256::from(1u64) {
            return Ok(y);
        }
    }
    Err(AdapterError::Numeric("y did not converge".into()))
}

/// Output and impact for a normalized swap: dy before fee from the y-solve,
/// fee applied on output, impact as the invariant residual.
fn swap_output(
    xp: &[U256],
    i: usize,
    j: usize,
    dx: U256,
    amp: u64,
    fee: u32,
) -> Result<(U256, Decimal), AdapterError> {
    let x_new = xp[i] + dx;
    let y_new = compute_y(xp, i, j, x_new, amp)?;
    if y_new >= xp[j] {
        return Err(AdapterError::Numeric("stable output non-positive".into()));
    }
    let dy = xp[j] - y_new - U256::from(1u64);
    let fee_num = U256::from(u64::from(fee.min(FEE_DENOM as u32 - 1)));
    let dy_after_fee = dy * (U256::from(FEE_DENOM) - fee_num) / U256::from(FEE_DENOM);

    let impact = invariant_residual(xp, i, j, dx, dy_after_fee, amp)?;
    Ok((dy_after_fee, impact))
}

/// Residual of the invariant after applying the trade: |D' - D| / D.
fn invariant_residual(
    xp: &[U256],
    i: usize,
    j: usize,
    dx: U256,
    dy: U256,
    amp: u64,
) -> Result<Decimal, AdapterError> {
    let d_before = compute_d(xp, amp)?;
    if d_before.is_zero() {
        return Ok(Decimal::ONE);
    }
    let mut after: Vec<U256> = xp.to_vec();
    after[i] += dx;
    after[j] = after[j].saturating_sub(dy);
    let d_after = compute_d(&after, amp)?;
    let diff = if d_after > d_before {
        d_after - d_before
    } else {
        d_before - d_after
    };
    let residual = numeric::ratio(diff, d_before)?;
    Ok(residual.clamp(Decimal::ZERO, Decimal::ONE))
}
