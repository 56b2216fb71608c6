//! Constant-product (V2 family) adapter
//!
//! Output amounts come from the closed form
//! `y_out = (dx * r * R_y) / (R_x * fee_denom + dx * r)` with
//! `r = fee_denom - fee_num` and fees in parts of 10_000. Pool discovery
//! goes through the factory's `getPair` and is cached per unordered token
//! pair for at most one block.

use alloy::primitives::{Address, U256};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::debug;

use super::adapter::{min_out_with_slippage, QuoteOutcome, SwapCall};
use crate::encoding::{decode_address, decode_uint, encode_call, Word};
use crate::error::AdapterError;
use crate::numeric;
use crate::transport::RpcClient;
use crate::types::{PathStep, Pool, PoolKind, PoolState, PoolStateData, Quote, TokenRef, VenueId};

/// getPair(address,address)
const GET_PAIR_SELECTOR: [u8; 4] = [0xe6, 0xa4, 0x39, 0x05];
/// getReserves()
const GET_RESERVES_SELECTOR: [u8; 4] = [0x09, 0x02, 0xf1, 0xac];
/// swapExactTokensForTokens(uint256,uint256,address[],address,uint256)
const SWAP_SELECTOR: [u8; 4] = [0x38, 0xed, 0x17, 0x39];

const FEE_DENOM: u64 = 10_000;

/// Swap gas on a constant-product router, per hop.
const V2_SWAP_GAS: u64 = 120_000;

/// Pool-existence cache entry: resolved address (zero-word means no pool)
/// tagged with the block it was resolved at.
#[derive(Clone, Copy)]
struct CachedPair {
    address: Address,
    block: u64,
}

pub struct V2Adapter {
    id: VenueId,
    router: Address,
    factory: Address,
    /// Fee numerator over 10_000
    fee: u32,
    rpc: Arc<RpcClient>,
    /// Keyed by (lower, higher) token address, order-invariant
    pair_cache: DashMap<(Address, Address), CachedPair>,
}

impl V2Adapter {
    pub fn new(id: VenueId, router: Address, factory: Address, fee: u32, rpc: Arc<RpcClient>) -> Self {
        Self {
            id,
            router,
            factory,
            fee,
            rpc,
            pair_cache: DashMap::new(),
        }
    }

    pub fn venue_id(&self) -> &VenueId {
        &self.id
    }

    pub fn on_new_block(&self, block: u64) {
        self.pair_cache.retain(|_, cached| cached.block >= block);
    }

    /// Closed-form output with basis-point fee.
    pub fn amount_out(amount_in: U256, reserve_in: U256, reserve_out: U256, fee: u32) -> U256 {
        if amount_in.is_zero() || reserve_in.is_zero() || reserve_out.is_zero() {
            return U256::ZERO;
        }
        let r = U256::from(FEE_DENOM - u64::from(fee.min(FEE_DENOM as u32 - 1)));
        let amount_with_fee = amount_in * r;
        let numerator = amount_with_fee * reserve_out;
        let denominator = reserve_in * U256::from(FEE_DENOM) + amount_with_fee;
        numerator / denominator
    }

    /// Inverse: input required for an exact output. Returns MAX when the
    /// pool cannot cover the requested output.
    pub fn amount_in(amount_out: U256, reserve_in: U256, reserve_out: U256, fee: u32) -> U256 {
        if amount_out.is_zero() || reserve_in.is_zero() || reserve_out.is_zero() {
            return U256::ZERO;
        }
        if amount_out >= reserve_out {
            return U256::MAX;
        }
        let r = U256::from(FEE_DENOM - u64::from(fee.min(FEE_DENOM as u32 - 1)));
        let numerator = reserve_in * amount_out * U256::from(FEE_DENOM);
        let denominator = (reserve_out - amount_out) * r;
        numerator / denominator + U256::from(1)
    }

    /// Resolve the pair address, consulting the per-block existence cache.
    async fn find_pair(
        &self,
        token_a: Address,
        token_b: Address,
        block: u64,
    ) -> Result<Option<Address>, AdapterError> {
        let key = ordered_pair(token_a, token_b);
        if let Some(cached) = self.pair_cache.get(&key) {
            if cached.block == block {
                return Ok(non_zero(cached.address));
            }
        }

        let calldata = encode_call(
            GET_PAIR_SELECTOR,
            &[Word::Addr(key.0), Word::Addr(key.1)],
        );
        let response = self.rpc.eth_call(self.factory, calldata).await?;
        let address = decode_address(&response, 0)?;
        self.pair_cache.insert(key, CachedPair { address, block });
        Ok(non_zero(address))
    }

    async fn fetch_reserves(&self, pair: Address) -> Result<(U256, U256), AdapterError> {
        let response = self
            .rpc
            .eth_call(pair, encode_call(GET_RESERVES_SELECTOR, &[]))
            .await?;
        let reserve0 = decode_uint(&response, 0)?;
        let reserve1 = decode_uint(&response, 1)?;
        Ok((reserve0, reserve1))
    }

    pub async fn quote(
        &self,
        token_in: TokenRef,
        token_out: TokenRef,
        amount_in: U256,
        block: u64,
    ) -> Result<QuoteOutcome, AdapterError> {
        let Some(pair) = self.find_pair(token_in.address, token_out.address, block).await? else {
            return Ok(QuoteOutcome::NoPool);
        };

        let (reserve0, reserve1) = self.fetch_reserves(pair).await?;
        if reserve0.is_zero() || reserve1.is_zero() {
            debug!(venue = %self.id, %pair, "empty reserves, treating as stale");
            return Ok(QuoteOutcome::Stale);
        }

        // token0 is the lower address by value
        let (lower, _) = ordered_pair(token_in.address, token_out.address);
        let (reserve_in, reserve_out) = if token_in.address == lower {
            (reserve0, reserve1)
        } else {
            (reserve1, reserve0)
        };

        let amount_out = Self::amount_out(amount_in, reserve_in, reserve_out, self.fee);
        let price_impact = if amount_in.is_zero() {
            Decimal::ZERO
        } else {
            impact_from_reserves(amount_in, amount_out, reserve_in, reserve_out)?
        };

        let pool = self.pool_record(pair, token_in, token_out);
        Ok(QuoteOutcome::Quote(Quote {
            pool,
            token_in,
            token_out,
            amount_in,
            amount_out,
            price_impact,
            gas_estimate: V2_SWAP_GAS,
            block_number: block,
        }))
    }

    fn pool_record(&self, pair: Address, token_in: TokenRef, token_out: TokenRef) -> Pool {
        let (lower, _) = ordered_pair(token_in.address, token_out.address);
        let tokens = if token_in.address == lower {
            vec![token_in, token_out]
        } else {
            vec![token_out, token_in]
        };
        Pool {
            venue: self.id.clone(),
            address: pair,
            tokens,
            fee: self.fee,
            kind: PoolKind::V2,
            venue_params: serde_json::Value::Null,
        }
    }

    pub async fn pool_state(&self, pool: &Pool) -> Result<Option<PoolState>, AdapterError> {
        if pool.address == Address::ZERO {
            return Ok(None);
        }
        let (reserve0, reserve1) = self.fetch_reserves(pool.address).await?;
        let block = self
            .rpc
            .block_number()
            .await
            .map_err(|e| AdapterError::Decode(e.to_string()))?;
        Ok(Some(PoolState {
            pool_address: pool.address,
            data: PoolStateData::V2 { reserve0, reserve1 },
            block_number: block,
        }))
    }

    /// `|expected - actual| / expected` against pre-trade reserves.
    pub fn price_impact(&self, quote: &Quote, state: &PoolState) -> Result<Decimal, AdapterError> {
        let PoolStateData::V2 { reserve0, reserve1 } = &state.data else {
            return Err(AdapterError::Decode("state kind mismatch".into()));
        };
        let (lower, _) = ordered_pair(quote.token_in.address, quote.token_out.address);
        let (reserve_in, reserve_out) = if quote.token_in.address == lower {
            (*reserve0, *reserve1)
        } else {
            (*reserve1, *reserve0)
        };
        impact_from_reserves(quote.amount_in, quote.amount_out, reserve_in, reserve_out)
    }

    pub fn build_swap(
        &self,
        step: &PathStep,
        recipient: Address,
        deadline: u64,
        slippage: Decimal,
    ) -> Result<SwapCall, AdapterError> {
        let min_out = min_out_with_slippage(step.amount_out, slippage);
        // swapExactTokensForTokens: the address[] head offset is the fifth
        // word, path tail follows inline
        let calldata = encode_call(
            SWAP_SELECTOR,
            &[
                Word::Uint(step.amount_in),
                Word::Uint(min_out),
                Word::Uint(U256::from(160u64)),
                Word::Addr(recipient),
                Word::Uint(U256::from(deadline)),
                Word::Uint(U256::from(2u64)),
                Word::Addr(step.token_in.address),
                Word::Addr(step.token_out.address),
            ],
        );
        Ok(SwapCall {
            to: self.router,
            calldata,
            value: U256::ZERO,
            min_out,
            gas_limit: V2_SWAP_GAS,
        })
    }
}

/// Spot-vs-execution impact: expected = dx * R_out / R_in (pre-trade
/// marginal), actual = amount_out.
fn impact_from_reserves(
    amount_in: U256,
    amount_out: U256,
    reserve_in: U256,
    reserve_out: U256,
) -> Result<Decimal, AdapterError> {
    if reserve_in.is_zero() || reserve_out.is_zero() || amount_in.is_zero() {
        return Ok(Decimal::ZERO);
    }
    let expected = amount_in
        .checked_mul(reserve_out)
        .ok_or_else(|| AdapterError::Numeric("impact expected".into()))?
        / reserve_in;
    if expected.is_zero() {
        return Ok(Decimal::ONE);
    }
    let deviation = if expected > amount_out {
        expected - amount_out
    } else {
        amount_out - expected
    };
    let impact = numeric::ratio(deviation, expected)?;
    Ok(impact.clamp(Decimal::ZERO, Decimal::ONE))
}

fn ordered_pair(a: Address, b: Address) -> (Address, Address) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

fn non_zero(address: Address) -> Option<Address> {
    if address == Address::ZERO {
        None
    } else {
        Some(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::rpc::testing::{test_client, MockConnection};
    use alloy::primitives::hex;

    fn token(byte: u8, decimals: u8) -> TokenRef {
        TokenRef::new(Address::repeat_byte(byte), decimals).unwrap()
    }

    fn adapter(conn: Arc<MockConnection>) -> V2Adapter {
        V2Adapter::new(
            VenueId::from("swapbased-v2"),
            Address::repeat_byte(0xee),
            Address::repeat_byte(0xfa),
            30,
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

    #[test]
    fn test_amount_out_matches_classic_fee() {
        // 0.30% fee: identical to the 997/1000 formula
        let amount_in = U256::from(1_000_000_000_000_000_000u64);
        let reserve_in = U256::from(100u64) * U256::from(10u64).pow(U256::from(18));
        let reserve_out = U256::from(200_000_000_000u64);

        let out = V2Adapter::amount_out(amount_in, reserve_in, reserve_out, 30);
        let classic = (amount_in * U256::from(997) * reserve_out)
            / (reserve_in * U256::from(1000) + amount_in * U256::from(997));
        assert_eq!(out, classic);
    }

    #[test]
    fn test_amount_out_zero_cases() {
        let r = U256::from(1_000u64);
        assert_eq!(V2Adapter::amount_out(U256::ZERO, r, r, 30), U256::ZERO);
        assert_eq!(V2Adapter::amount_out(r, U256::ZERO, r, 30), U256::ZERO);
        assert_eq!(V2Adapter::amount_out(r, r, U256::ZERO, 30), U256::ZERO);
    }

    #[test]
    fn test_amount_in_inverts_amount_out() {
        let reserve_in = U256::from(100u64) * U256::from(10u64).pow(U256::from(18));
        let reserve_out = U256::from(200_000_000_000u64);
        let want_out = U256::from(1_000_000_000u64);

        let need_in = V2Adapter::amount_in(want_out, reserve_in, reserve_out, 30);
        let got_out = V2Adapter::amount_out(need_in, reserve_in, reserve_out, 30);
        assert!(got_out >= want_out);
    }

    #[test]
    fn test_amount_in_insufficient_liquidity() {
        let reserve = U256::from(1_000u64);
        assert_eq!(
            V2Adapter::amount_in(U256::from(1_000u64), reserve, reserve, 30),
            U256::MAX
        );
    }

    #[test]
    fn test_impact_grows_with_size() {
        let reserve_in = U256::from(1_000u64) * U256::from(10u64).pow(U256::from(18));
        let reserve_out = U256::from(2_000_000u64) * U256::from(10u64).pow(U256::from(6));

        let small_in = U256::from(10u64).pow(U256::from(18));
        let large_in = U256::from(100u64) * U256::from(10u64).pow(U256::from(18));

        let small_out = V2Adapter::amount_out(small_in, reserve_in, reserve_out, 30);
        let large_out = V2Adapter::amount_out(large_in, reserve_in, reserve_out, 30);

        let small = impact_from_reserves(small_in, small_out, reserve_in, reserve_out).unwrap();
        let large = impact_from_reserves(large_in, large_out, reserve_in, reserve_out).unwrap();
        assert!(small < large);
        assert!(large <= Decimal::ONE);
    }

    #[tokio::test]
    async fn test_quote_no_pool() {
        let conn = Arc::new(MockConnection::new());
        // Factory returns the zero word
        conn.route_call("e6a43905", word_result(&[U256::ZERO]));
        let adapter = adapter(conn);
        let outcome = adapter
            .quote(token(1, 18), token(2, 6), U256::from(100u64), 10)
            .await
            .unwrap();
        assert!(matches!(outcome, QuoteOutcome::NoPool));
    }

    #[tokio::test]
    async fn test_quote_stale_on_empty_reserves() {
        let conn = Arc::new(MockConnection::new());
        conn.route_call(
            "e6a43905",
            word_result(&[address_word(Address::repeat_byte(0xcc))]),
        );
        conn.route_call(
            "0902f1ac",
            word_result(&[U256::ZERO, U256::from(5u64), U256::ZERO]),
        );
        let adapter = adapter(conn);
        let outcome = adapter
            .quote(token(1, 18), token(2, 6), U256::from(100u64), 10)
            .await
            .unwrap();
        assert!(matches!(outcome, QuoteOutcome::Stale));
    }

    #[tokio::test]
    async fn test_quote_happy_path_and_pair_cache() {
        let conn = Arc::new(MockConnection::new());
        conn.route_call(
            "e6a43905",
            word_result(&[address_word(Address::repeat_byte(0xcc))]),
        );
        let reserve0 = U256::from(1_000u64) * U256::from(10u64).pow(U256::from(18));
        let reserve1 = U256::from(2_000_000u64) * U256::from(10u64).pow(U256::from(6));
        conn.route_call(
            "0902f1ac",
            word_result(&[reserve0, reserve1, U256::ZERO]),
        );

        let adapter = adapter(conn.clone());
        let token_in = token(1, 18);
        let token_out = token(2, 6);
        let amount_in = U256::from(10u64).pow(U256::from(18));

        let outcome = adapter
            .quote(token_in, token_out, amount_in, 10)
            .await
            .unwrap();
        let quote = outcome.into_quote().unwrap();
        assert!(quote.amount_out > U256::ZERO);
        assert_eq!(quote.block_number, 10);
        assert!(quote.price_impact > Decimal::ZERO);

        // Second quote at the same block resolves the pair from cache:
        // only one getPair eth_call in total
        let _ = adapter.quote(token_in, token_out, amount_in, 10).await.unwrap();
        let getpair_calls = conn
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, p)| {
                m == "eth_call"
                    && p[0]["data"].as_str().unwrap_or("").starts_with("0xe6a43905")
            })
            .count();
        assert_eq!(getpair_calls, 1);
    }

    #[tokio::test]
    async fn test_pair_cache_expires_with_block() {
        let conn = Arc::new(MockConnection::new());
        conn.route_call(
            "e6a43905",
            word_result(&[address_word(Address::repeat_byte(0xcc))]),
        );
        let reserve = U256::from(10u64).pow(U256::from(18));
        conn.route_call("0902f1ac", word_result(&[reserve, reserve, U256::ZERO]));

        let adapter = adapter(conn.clone());
        let _ = adapter
            .quote(token(1, 18), token(2, 6), U256::from(100u64), 10)
            .await
            .unwrap();
        let _ = adapter
            .quote(token(1, 18), token(2, 6), U256::from(100u64), 11)
            .await
            .unwrap();
        let getpair_calls = conn
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, p)| {
                m == "eth_call"
                    && p[0]["data"].as_str().unwrap_or("").starts_with("0xe6a43905")
            })
            .count();
        assert_eq!(getpair_calls, 2);
    }

    #[test]
    fn test_build_swap_calldata() {
        let conn = Arc::new(MockConnection::new());
        let adapter = adapter(conn);
        let token_in = token(1, 18);
        let token_out = token(2, 6);
        let pool = Pool {
            venue: VenueId::from("swapbased-v2"),
            address: Address::repeat_byte(0xcc),
            tokens: vec![token_in, token_out],
            fee: 30,
            kind: PoolKind::V2,
            venue_params: serde_json::Value::Null,
        };
        let step = PathStep {
            venue: VenueId::from("swapbased-v2"),
            pool,
            token_in,
            token_out,
            amount_in: U256::from(1_000_000u64),
            amount_out: U256::from(2_000_000u64),
            fee: 30,
        };
        let call = adapter
            .build_swap(
                &step,
                Address::repeat_byte(0xee),
                1_700_000_000,
                Decimal::new(5, 3),
            )
            .unwrap();
        assert_eq!(&call.calldata[..4], &SWAP_SELECTOR);
        assert_eq!(call.min_out, U256::from(1_990_000u64));
        // amountIn is the first argument word
        assert_eq!(
            decode_uint(&call.calldata[4..], 0).unwrap(),
            U256::from(1_000_000u64)
        );
        // path length 2 at the tail
        assert_eq!(
            decode_uint(&call.calldata[4..], 5).unwrap(),
            U256::from(2u64)
        );
    }
}
