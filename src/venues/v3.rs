//! Concentrated-liquidity (V3 family) adapter
//!
//! Quotes come from the venue's quoter contract rather than local math.
//! Both quoter ABIs are supported: the flat QuoterV1 signature and the
//! QuoterV2 struct form that also reports the post-trade sqrtPrice and a
//! gas estimate. Every configured fee tier is quoted and the best output
//! wins. Pool existence is cached per `(t0, t1, fee)` for at most one block.

use alloy::primitives::{Address, Bytes, U256};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use super::adapter::{min_out_with_slippage, QuoteOutcome, SwapCall};
use crate::encoding::{
    decode_address, decode_int32, decode_uint, encode_call, encode_v3_path, Word,
};
use crate::error::AdapterError;
use crate::transport::RpcClient;
use crate::types::{PathStep, Pool, PoolKind, PoolState, PoolStateData, Quote, TokenRef, VenueId};

/// getPool(address,address,uint24)
const GET_POOL_SELECTOR: [u8; 4] = [0x16, 0x98, 0xee, 0x82];
/// slot0()
const SLOT0_SELECTOR: [u8; 4] = [0x38, 0x50, 0xc7, 0xbd];
/// liquidity()
const LIQUIDITY_SELECTOR: [u8; 4] = [0x1a, 0x68, 0x65, 0x02];
/// quoteExactInputSingle(address,address,uint24,uint256,uint160) - QuoterV1
const QUOTER_V1_SELECTOR: [u8; 4] = [0xf7, 0x72, 0x9d, 0x43];
/// quoteExactInputSingle((address,address,uint256,uint24,uint160)) - QuoterV2
const QUOTER_V2_SELECTOR: [u8; 4] = [0xc6, 0xa5, 0x02, 0x6a];
/// exactInput((bytes,address,uint256,uint256,uint256))
const EXACT_INPUT_SELECTOR: [u8; 4] = [0xc0, 0x4b, 0x8d, 0x59];

/// Fallback swap gas per hop when the quoter does not report one.
const V3_SWAP_GAS: u64 = 150_000;

#[derive(Clone, Copy)]
struct CachedPool {
    address: Address,
    block: u64,
}

pub struct V3Adapter {
    id: VenueId,
    router: Address,
    factory: Address,
    quoter: Address,
    fee_tiers: Vec<u32>,
    /// QuoterV2 struct ABI; V1 flat params otherwise
    quoter_v2: bool,
    rpc: Arc<RpcClient>,
    /// Keyed by (lower, higher, fee), order-invariant in the token pair
    pool_cache: DashMap<(Address, Address, u32), CachedPool>,
}

impl V3Adapter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: VenueId,
        router: Address,
        factory: Address,
        quoter: Address,
        fee_tiers: Vec<u32>,
        quoter_v2: bool,
        rpc: Arc<RpcClient>,
    ) -> Self {
        Self {
            id,
            router,
            factory,
            quoter,
            fee_tiers,
            quoter_v2,
            rpc,
            pool_cache: DashMap::new(),
        }
    }

    pub fn venue_id(&self) -> &VenueId {
        &self.id
    }

    pub fn on_new_block(&self, block: u64) {
        self.pool_cache.retain(|_, cached| cached.block >= block);
    }

    pub fn encode_path(&self, tokens: &[TokenRef], fees: &[u32]) -> Result<Bytes, AdapterError> {
        encode_v3_path(tokens, fees)
    }

    async fn find_pool(
        &self,
        token_a: Address,
        token_b: Address,
        fee: u32,
        block: u64,
    ) -> Result<Option<Address>, AdapterError> {
        let (lower, higher) = if token_a < token_b {
            (token_a, token_b)
        } else {
            (token_b, token_a)
        };
        let key = (lower, higher, fee);
        if let Some(cached) = self.pool_cache.get(&key) {
            if cached.block == block {
                return Ok(non_zero(cached.address));
            }
        }

        let calldata = encode_call(
            GET_POOL_SELECTOR,
            &[
                Word::Addr(lower),
                Word::Addr(higher),
                Word::Uint(U256::from(fee)),
            ],
        );
        let response = self.rpc.eth_call(self.factory, calldata).await?;
        let address = decode_address(&response, 0)?;
        self.pool_cache.insert(key, CachedPool { address, block });
        Ok(non_zero(address))
    }

    /// One quoter round-trip. Returns (amount_out, sqrt_after, gas_estimate);
    /// V1 only reports the amount.
    async fn quoter_call(
        &self,
        token_in: Address,
        token_out: Address,
        fee: u32,
        amount_in: U256,
    ) -> Result<(U256, Option<U256>, Option<u64>), AdapterError> {
        let calldata = if self.quoter_v2 {
            encode_call(
                QUOTER_V2_SELECTOR,
                &[
                    Word::Addr(token_in),
                    Word::Addr(token_out),
                    Word::Uint(amount_in),
                    Word::Uint(U256::from(fee)),
                    Word::Uint(U256::ZERO), // sqrtPriceLimitX96 = 0, no limit
                ],
            )
        } else {
            encode_call(
                QUOTER_V1_SELECTOR,
                &[
                    Word::Addr(token_in),
                    Word::Addr(token_out),
                    Word::Uint(U256::from(fee)),
                    Word::Uint(amount_in),
                    Word::Uint(U256::ZERO),
                ],
            )
        };

        let response = self.rpc.eth_call(self.quoter, calldata).await?;
        let amount_out = decode_uint(&response, 0)?;
        if self.quoter_v2 && response.len() >= 4 * 32 {
            let sqrt_after = decode_uint(&response, 1)?;
            let gas: u64 = decode_uint(&response, 3)?
                .try_into()
                .unwrap_or(V3_SWAP_GAS);
            Ok((amount_out, Some(sqrt_after), Some(gas)))
        } else {
            Ok((amount_out, None, None))
        }
    }

    async fn slot0(&self, pool: Address) -> Result<(U256, i32), AdapterError> {
        let response = self
            .rpc
            .eth_call(pool, encode_call(SLOT0_SELECTOR, &[]))
            .await?;
        let sqrt_price = decode_uint(&response, 0)?;
        let tick = decode_int32(&response, 1)?;
        Ok((sqrt_price, tick))
    }

    async fn liquidity(&self, pool: Address) -> Result<u128, AdapterError> {
        let response = self
            .rpc
            .eth_call(pool, encode_call(LIQUIDITY_SELECTOR, &[]))
            .await?;
        let value = decode_uint(&response, 0)?;
        value
            .try_into()
            .map_err(|_| AdapterError::Decode("liquidity exceeds u128".into()))
    }

    pub async fn quote(
        &self,
        token_in: TokenRef,
        token_out: TokenRef,
        amount_in: U256,
        block: u64,
    ) -> Result<QuoteOutcome, AdapterError> {
        // Best tier wins; tiers without a pool are skipped, quoter failures
        // on one tier do not kill the others
        let mut best: Option<(u32, Address, U256, Option<U256>, Option<u64>)> = None;
        let mut any_pool = false;

        for &fee in &self.fee_tiers {
            let Some(pool) = self
                .find_pool(token_in.address, token_out.address, fee, block)
                .await?
            else {
                continue;
            };
            any_pool = true;

            if amount_in.is_zero() {
                best = Some((fee, pool, U256::ZERO, None, None));
                break;
            }

            match self
                .quoter_call(token_in.address, token_out.address, fee, amount_in)
                .await
            {
                Ok((amount_out, sqrt_after, gas)) => {
                    if best.as_ref().map_or(true, |(_, _, prev, _, _)| amount_out > *prev) {
                        best = Some((fee, pool, amount_out, sqrt_after, gas));
                    }
                }
                Err(e) => {
                    debug!(venue = %self.id, fee, error = %e, "tier quote failed");
                }
            }
        }

        if !any_pool {
            return Ok(QuoteOutcome::NoPool);
        }
        let Some((fee, pool_address, amount_out, sqrt_after, gas)) = best else {
            return Ok(QuoteOutcome::Stale);
        };

        let price_impact = if amount_in.is_zero() {
            Decimal::ZERO
        } else {
            let (sqrt_before, _tick) = self.slot0(pool_address).await?;
            if sqrt_before.is_zero() {
                return Ok(QuoteOutcome::Stale);
            }
            match sqrt_after {
                Some(after) => sqrt_price_impact(sqrt_before, after)?,
                // V1 quoter path: spot expectation from the pre-trade price
                None => spot_impact(
                    sqrt_before,
                    token_in,
                    token_out,
                    amount_in,
                    amount_out,
                )?,
            }
        };

        let pool = self.pool_record(pool_address, fee, token_in, token_out);
        Ok(QuoteOutcome::Quote(Quote {
            pool,
            token_in,
            token_out,
            amount_in,
            amount_out,
            price_impact,
            gas_estimate: gas.unwrap_or(V3_SWAP_GAS),
            block_number: block,
        }))
    }

    fn pool_record(&self, address: Address, fee: u32, token_in: TokenRef, token_out: TokenRef) -> Pool {
        let tokens = if token_in.address < token_out.address {
            vec![token_in, token_out]
        } else {
            vec![token_out, token_in]
        };
        Pool {
            venue: self.id.clone(),
            address,
            tokens,
            fee,
            kind: PoolKind::V3,
            venue_params: serde_json::Value::Null,
        }
    }

    pub async fn pool_state(&self, pool: &Pool) -> Result<Option<PoolState>, AdapterError> {
        if pool.address == Address::ZERO {
            return Ok(None);
        }
        let (sqrt_price_x96, tick) = self.slot0(pool.address).await?;
        let liquidity = self.liquidity(pool.address).await?;
        let block = self
            .rpc
            .block_number()
            .await
            .map_err(|e| AdapterError::Decode(e.to_string()))?;
        Ok(Some(PoolState {
            pool_address: pool.address,
            data: PoolStateData::V3 {
                sqrt_price_x96,
                liquidity,
                tick,
            },
            block_number: block,
        }))
    }

    /// Impact from the sqrt-price move implied by re-deriving the spot
    /// expectation against the quote.
    pub fn price_impact(&self, quote: &Quote, state: &PoolState) -> Result<Decimal, AdapterError> {
        let PoolStateData::V3 { sqrt_price_x96, .. } = &state.data else {
            return Err(AdapterError::Decode("state kind mismatch".into()));
        };
        spot_impact(
            *sqrt_price_x96,
            quote.token_in,
            quote.token_out,
            quote.amount_in,
            quote.amount_out,
        )
    }

    pub fn build_swap(
        &self,
        step: &PathStep,
        recipient: Address,
        deadline: u64,
        slippage: Decimal,
    ) -> Result<SwapCall, AdapterError> {
        let min_out = min_out_with_slippage(step.amount_out, slippage);
        let path = encode_v3_path(&[step.token_in, step.token_out], &[step.fee])?;

        // exactInput(ExactInputParams): one dynamic tuple argument. Outer
        // word points at the tuple; within it the packed path is the only
        // dynamic member, trailing the five head words.
        let mut data = Vec::with_capacity(4 + 32 * 8 + path.len());
        data.extend_from_slice(&EXACT_INPUT_SELECTOR);
        for word in [
            Word::Uint(U256::from(32u64)),
            Word::Uint(U256::from(160u64)),
            Word::Addr(recipient),
            Word::Uint(U256::from(deadline)),
            Word::Uint(step.amount_in),
            Word::Uint(min_out),
        ] {
            push_word(&mut data, word);
        }
        push_word(&mut data, Word::Uint(U256::from(path.len())));
        data.extend_from_slice(&path);
        let pad = (32 - path.len() % 32) % 32;
        data.extend_from_slice(&vec![0u8; pad]);

        Ok(SwapCall {
            to: self.router,
            calldata: Bytes::from(data),
            value: U256::ZERO,
            min_out,
            gas_limit: V3_SWAP_GAS,
        })
    }
}

fn push_word(out: &mut Vec<u8>, word: Word) {
    let encoded = encode_call([0, 0, 0, 0], &[word]);
    out.extend_from_slice(&encoded[4..]);
}

fn non_zero(address: Address) -> Option<Address> {
    if address == Address::ZERO {
        None
    } else {
        Some(address)
    }
}

/// Impact from the sqrtPrice ratio before/after: |1 - (after/before)^2|.
/// The ratio sits near one, so a fixed 1e18 scaling keeps full precision in
/// Decimal range regardless of the absolute sqrtPrice magnitude.
fn sqrt_price_impact(before: U256, after: U256) -> Result<Decimal, AdapterError> {
    if before.is_zero() {
        return Ok(Decimal::ONE);
    }
    let scale = U256::from(10u64).pow(U256::from(18));
    let ratio_scaled = after
        .checked_mul(scale)
        .ok_or_else(|| AdapterError::Numeric("sqrt ratio".into()))?
        / before;
    let ratio = Decimal::from_str(&ratio_scaled.to_string())
        .map_err(|_| AdapterError::Numeric("sqrt ratio range".into()))?
        / Decimal::from(1_000_000_000_000_000_000u64);
    let price_ratio = ratio * ratio;
    let impact = (Decimal::ONE - price_ratio).abs();
    Ok(impact.clamp(Decimal::ZERO, Decimal::ONE))
}

/// V1-quoter fallback: expected output from the pre-trade marginal price,
/// compared with the realized quote. Price direction follows token0 < token1
/// address ordering.
fn spot_impact(
    sqrt_price_x96: U256,
    token_in: TokenRef,
    token_out: TokenRef,
    amount_in: U256,
    amount_out: U256,
) -> Result<Decimal, AdapterError> {
    if sqrt_price_x96.is_zero() || amount_in.is_zero() {
        return Ok(Decimal::ZERO);
    }
    let q96 = U256::from(1u64) << 96;
    let zero_for_one = token_in.address < token_out.address;

    // expected_out at the marginal price, integer math against Q96
    let expected = if zero_for_one {
        // price token1/token0 = (sqrt/Q96)^2; stage the two multiplies to
        // stay inside 256 bits for realistic sqrt values
        let first: U256 = amount_in
            .checked_mul(sqrt_price_x96)
            .ok_or_else(|| AdapterError::Numeric("spot impact".into()))?
            / q96;
        first
            .checked_mul(sqrt_price_x96)
            .ok_or_else(|| AdapterError::Numeric("spot impact".into()))?
            / q96
    } else {
        let first: U256 = amount_in
            .checked_mul(q96)
            .ok_or_else(|| AdapterError::Numeric("spot impact".into()))?
            / sqrt_price_x96;
        first
            .checked_mul(q96)
            .ok_or_else(|| AdapterError::Numeric("spot impact".into()))?
            / sqrt_price_x96
    };

    if expected.is_zero() {
        return Ok(Decimal::ONE);
    }
    let deviation = if expected > amount_out {
        expected - amount_out
    } else {
        amount_out - expected
    };
    let impact = crate::numeric::ratio(deviation, expected)?;
    Ok(impact.clamp(Decimal::ZERO, Decimal::ONE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::rpc::testing::{test_client, MockConnection};
    use alloy::primitives::hex;

    fn token(byte: u8, decimals: u8) -> TokenRef {
        TokenRef::new(Address::repeat_byte(byte), decimals).unwrap()
    }

    fn adapter_with(conn: Arc<MockConnection>, tiers: Vec<u32>, quoter_v2: bool) -> V3Adapter {
        V3Adapter::new(
            VenueId::from("aerodrome-v3"),
            Address::repeat_byte(0xee),
            Address::repeat_byte(0xfa),
            Address::repeat_byte(0xfb),
            tiers,
            quoter_v2,
            Arc::new(test_client(conn)),
        )
    }

    fn word_result(words: &[U256]) -> serde_json::Value {
        let mut data = Vec::new();
        for w in words {
            data.extend_from_slice(&w.to_be_bytes::<32>());
        }
        serde_json::json!(format!("0x{}", hex::encode(data)))
    }

    fn address_word(addr: Address) -> U256 {
        U256::from_be_slice(addr.as_slice())
    }

    fn q96() -> U256 {
        U256::from(1u64) << 96
    }

    #[test]
    fn test_sqrt_price_impact_small_move() {
        // after/before = 1.001 -> price moved ~0.2%
        let before = q96();
        let after = q96() + q96() / U256::from(1000u64);
        let impact = sqrt_price_impact(before, after).unwrap();
        assert!(impact > Decimal::new(19, 4)); // > 0.0019
        assert!(impact < Decimal::new(21, 4)); // < 0.0021
    }

    #[test]
    fn test_sqrt_price_impact_no_move() {
        assert_eq!(sqrt_price_impact(q96(), q96()).unwrap(), Decimal::ZERO);
    }

    #[test]
    fn test_spot_impact_directionality() {
        // sqrtPrice = Q96 means price 1:1; a fair-but-fee quote shows a
        // small impact either direction
        let t_low = token(1, 18);
        let t_high = token(2, 18);
        let amount_in = U256::from(10u64).pow(U256::from(18));
        let amount_out = amount_in - amount_in / U256::from(200u64); // 0.5% worse

        let impact_a = spot_impact(q96(), t_low, t_high, amount_in, amount_out).unwrap();
        let impact_b = spot_impact(q96(), t_high, t_low, amount_in, amount_out).unwrap();
        assert_eq!(impact_a, Decimal::new(5, 3));
        assert_eq!(impact_b, Decimal::new(5, 3));
    }

    #[tokio::test]
    async fn test_quote_no_pool_any_tier() {
        let conn = Arc::new(MockConnection::new());
        conn.route_call("1698ee82", word_result(&[U256::ZERO]));
        let adapter = adapter_with(conn, vec![500, 3000], false);
        let outcome = adapter
            .quote(token(1, 18), token(2, 6), U256::from(100u64), 5)
            .await
            .unwrap();
        assert!(matches!(outcome, QuoteOutcome::NoPool));
    }

    /// Route a QuoterV2 call for one specific fee tier by constructing the
    /// exact calldata the adapter will send.
    fn route_quoter_v2(
        conn: &MockConnection,
        token_in: TokenRef,
        token_out: TokenRef,
        amount_in: U256,
        fee: u32,
        amount_out: U256,
        sqrt_after: U256,
        gas: u64,
    ) {
        let calldata = encode_call(
            QUOTER_V2_SELECTOR,
            &[
                Word::Addr(token_in.address),
                Word::Addr(token_out.address),
                Word::Uint(amount_in),
                Word::Uint(U256::from(fee)),
                Word::Uint(U256::ZERO),
            ],
        );
        conn.route_call(
            &hex::encode(&calldata),
            word_result(&[amount_out, sqrt_after, U256::from(1u64), U256::from(gas)]),
        );
    }

    #[tokio::test]
    async fn test_quote_best_tier_wins_v2_quoter() {
        let conn = Arc::new(MockConnection::new());
        conn.route_call(
            "1698ee82",
            word_result(&[address_word(Address::repeat_byte(0xcc))]),
        );
        conn.route_call(
            "3850c7bd",
            word_result(&[q96(), U256::ZERO, U256::ZERO, U256::ZERO, U256::ZERO, U256::ZERO, U256::ZERO]),
        );

        let token_in = token(1, 18);
        let token_out = token(2, 6);
        let amount_in = U256::from(10u64).pow(U256::from(18));
        let drift = q96() + q96() / U256::from(500u64);
        // Tier 500 pays less than tier 3000; the better output must win
        route_quoter_v2(&conn, token_in, token_out, amount_in, 500, U256::from(1_900_000u64), drift, 80_000);
        route_quoter_v2(&conn, token_in, token_out, amount_in, 3000, U256::from(2_000_000u64), drift, 90_000);

        let adapter = adapter_with(conn, vec![500, 3000], true);
        let quote = adapter
            .quote(token_in, token_out, amount_in, 5)
            .await
            .unwrap()
            .into_quote()
            .unwrap();
        assert_eq!(quote.amount_out, U256::from(2_000_000u64));
        assert_eq!(quote.pool.fee, 3000);
        assert_eq!(quote.gas_estimate, 90_000);
        assert!(quote.price_impact > Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_quote_v1_quoter_uses_spot_fallback() {
        let conn = Arc::new(MockConnection::new());
        conn.route_call(
            "1698ee82",
            word_result(&[address_word(Address::repeat_byte(0xcc))]),
        );
        let amount_in = U256::from(10u64).pow(U256::from(18));
        let amount_out = amount_in - amount_in / U256::from(100u64);
        conn.route_call("f7729d43", word_result(&[amount_out]));
        conn.route_call(
            "3850c7bd",
            word_result(&[q96(), U256::ZERO, U256::ZERO, U256::ZERO, U256::ZERO, U256::ZERO, U256::ZERO]),
        );

        let adapter = adapter_with(conn, vec![3000], false);
        let quote = adapter
            .quote(token(1, 18), token(2, 18), amount_in, 5)
            .await
            .unwrap()
            .into_quote()
            .unwrap();
        assert_eq!(quote.amount_out, amount_out);
        assert_eq!(quote.gas_estimate, V3_SWAP_GAS);
        assert_eq!(quote.price_impact, Decimal::new(1, 2));
    }

    #[tokio::test]
    async fn test_pool_state() {
        let conn = Arc::new(MockConnection::new());
        conn.route_call(
            "3850c7bd",
            word_result(&[q96(), U256::ZERO, U256::ZERO, U256::ZERO, U256::ZERO, U256::ZERO, U256::ZERO]),
        );
        conn.route_call("1a686502", word_result(&[U256::from(777u64)]));
        conn.set_default("eth_blockNumber", serde_json::json!("0x10"));

        let adapter = adapter_with(conn, vec![500], false);
        let pool = Pool {
            venue: VenueId::from("aerodrome-v3"),
            address: Address::repeat_byte(0xcc),
            tokens: vec![token(1, 18), token(2, 6)],
            fee: 500,
            kind: PoolKind::V3,
            venue_params: serde_json::Value::Null,
        };
        let state = adapter.pool_state(&pool).await.unwrap().unwrap();
        match state.data {
            PoolStateData::V3 {
                sqrt_price_x96,
                liquidity,
                tick,
            } => {
                assert_eq!(sqrt_price_x96, q96());
                assert_eq!(liquidity, 777);
                assert_eq!(tick, 0);
            }
            _ => panic!("wrong state kind"),
        }
        assert_eq!(state.block_number, 16);
    }

    #[test]
    fn test_build_swap_packs_path() {
        let conn = Arc::new(MockConnection::new());
        let adapter = adapter_with(conn, vec![500], false);
        let token_in = token(1, 18);
        let token_out = token(2, 6);
        let step = PathStep {
            venue: VenueId::from("aerodrome-v3"),
            pool: Pool {
                venue: VenueId::from("aerodrome-v3"),
                address: Address::repeat_byte(0xcc),
                tokens: vec![token_in, token_out],
                fee: 500,
                kind: PoolKind::V3,
                venue_params: serde_json::Value::Null,
            },
            token_in,
            token_out,
            amount_in: U256::from(1_000u64),
            amount_out: U256::from(2_000u64),
            fee: 500,
        };
        let call = adapter
            .build_swap(&step, Address::repeat_byte(0xee), 1_700_000_000, Decimal::ZERO)
            .unwrap();
        assert_eq!(&call.calldata[..4], &EXACT_INPUT_SELECTOR);
        // Path bytes length word sits after the six head words
        assert_eq!(
            decode_uint(&call.calldata[4..], 6).unwrap(),
            U256::from(43u64)
        );
        assert_eq!(call.min_out, U256::from(2_000u64));
        // Calldata is word-aligned
        assert_eq!((call.calldata.len() - 4) % 32, 0);
    }
}
