//! Calldata and path encoding
//!
//! Hand-rolled ABI encoding for the handful of fixed-shape calls the engine
//! makes: 4-byte selector followed by 32-byte words. Decoding validates
//! length and distinguishes `Error(string)` / `Panic(uint256)` reverts from
//! data-bearing responses.

use alloy::primitives::{Address, Bytes, U256};

use crate::error::AdapterError;
use crate::types::TokenRef;

/// Error(string) selector: a real revert rather than returned data.
pub const ERROR_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];

/// Panic(uint256) selector.
pub const PANIC_SELECTOR: [u8; 4] = [0x4e, 0x48, 0x7b, 0x71];

/// An ABI word: address / uint / bool widened to 32 bytes.
#[derive(Debug, Clone)]
pub enum Word {
    Addr(Address),
    Uint(U256),
    Bool(bool),
}

impl Word {
    fn write(&self, out: &mut Vec<u8>) {
        match self {
            Word::Addr(a) => {
                out.extend_from_slice(&[0u8; 12]);
                out.extend_from_slice(a.as_slice());
            }
            Word::Uint(u) => out.extend_from_slice(&u.to_be_bytes::<32>()),
            Word::Bool(b) => {
                out.extend_from_slice(&[0u8; 31]);
                out.push(*b as u8);
            }
        }
    }
}

/// Encode a static call: selector plus fixed-width words.
pub fn encode_call(selector: [u8; 4], words: &[Word]) -> Bytes {
    let mut data = Vec::with_capacity(4 + 32 * words.len());
    data.extend_from_slice(&selector);
    for word in words {
        word.write(&mut data);
    }
    Bytes::from(data)
}

/// Encode a call whose last parameter is a dynamic `bytes` value (V3
/// `exactInput` takes the packed path this way). Head words first, then the
/// offset, then length-prefixed padded tail.
pub fn encode_call_with_bytes(selector: [u8; 4], words: &[Word], tail: &[u8]) -> Bytes {
    let head_words = words.len() + 1;
    let mut data = Vec::with_capacity(4 + 32 * head_words + 64 + tail.len());
    data.extend_from_slice(&selector);
    // Offset of the bytes payload, measured from the start of the arguments
    Word::Uint(U256::from(32 * head_words)).write(&mut data);
    for word in words {
        word.write(&mut data);
    }
    Word::Uint(U256::from(tail.len())).write(&mut data);
    data.extend_from_slice(tail);
    let pad = (32 - tail.len() % 32) % 32;
    data.extend_from_slice(&vec![0u8; pad]);
    Bytes::from(data)
}

/// Read the n-th 32-byte word of a response as U256.
pub fn decode_uint(data: &[u8], index: usize) -> Result<U256, AdapterError> {
    let start = index * 32;
    let end = start + 32;
    if data.len() < end {
        return Err(AdapterError::Decode(format!(
            "response too short: {} bytes, wanted word {}",
            data.len(),
            index
        )));
    }
    Ok(U256::from_be_slice(&data[start..end]))
}

/// Read the n-th word as an address (right-aligned 20 bytes).
pub fn decode_address(data: &[u8], index: usize) -> Result<Address, AdapterError> {
    let word = decode_uint(data, index)?;
    let bytes = word.to_be_bytes::<32>();
    Ok(Address::from_slice(&bytes[12..32]))
}

/// Read the n-th word as a signed 32-bit value (int24 ticks arrive
/// sign-extended to the full word).
pub fn decode_int32(data: &[u8], index: usize) -> Result<i32, AdapterError> {
    let start = index * 32;
    if data.len() < start + 32 {
        return Err(AdapterError::Decode("response too short for int".into()));
    }
    let word = &data[start..start + 32];
    let negative = word[0] & 0x80 != 0;
    let mut value = i64::from(word[28]) << 24
        | i64::from(word[29]) << 16
        | i64::from(word[30]) << 8
        | i64::from(word[31]);
    if negative {
        // Sign-extend from the low 4 bytes
        value |= !0xffff_ffffi64;
    }
    Ok(value as i32)
}

/// Classify a revert payload: `Error(string)` carries a message,
/// `Panic(uint256)` a code, anything else is opaque.
pub fn decode_revert(data: &[u8]) -> String {
    if data.len() >= 4 && data[..4] == ERROR_SELECTOR {
        if let Ok(offset) = decode_uint(&data[4..], 0) {
            let offset: usize = offset.try_into().unwrap_or(usize::MAX);
            if offset < data.len() && offset % 32 == 0 {
                if let Ok(len) = decode_uint(&data[4..], offset / 32) {
                    let len: usize = len.try_into().unwrap_or(usize::MAX);
                    let start = 4 + offset + 32;
                    if len < data.len() && data.len() >= start + len {
                        if let Ok(s) = std::str::from_utf8(&data[start..start + len]) {
                            return s.to_string();
                        }
                    }
                }
            }
        }
        return "unreadable Error(string)".to_string();
    }
    if data.len() >= 4 && data[..4] == PANIC_SELECTOR {
        let code = decode_uint(&data[4..], 0).unwrap_or(U256::ZERO);
        return format!("panic 0x{:x}", code);
    }
    if data.is_empty() {
        return "empty revert".to_string();
    }
    format!("0x{}", hex_lower(&data[..data.len().min(36)]))
}

fn hex_lower(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// V3-family packed path: token[20] (fee[3] token[20])*.
///
/// Requires at least two tokens and exactly one fee per hop; fees must fit
/// in 24 bits.
pub fn encode_v3_path(tokens: &[TokenRef], fees: &[u32]) -> Result<Bytes, AdapterError> {
    if tokens.len() < 2 || fees.len() != tokens.len() - 1 {
        return Err(AdapterError::Decode(format!(
            "path shape invalid: {} tokens, {} fees",
            tokens.len(),
            fees.len()
        )));
    }
    let mut out = Vec::with_capacity(20 + 23 * fees.len());
    out.extend_from_slice(tokens[0].address.as_slice());
    for (token, fee) in tokens[1..].iter().zip(fees) {
        if *fee > 0xff_ffff {
            return Err(AdapterError::Decode(format!("fee {} exceeds uint24", fee)));
        }
        out.extend_from_slice(&fee.to_be_bytes()[1..4]);
        out.extend_from_slice(token.address.as_slice());
    }
    Ok(Bytes::from(out))
}

/// Inverse of `encode_v3_path`. Token decimals are not carried on the wire,
/// so the caller supplies a lookup.
pub fn decode_v3_path(
    data: &[u8],
    decimals_of: impl Fn(Address) -> Option<u8>,
) -> Result<(Vec<TokenRef>, Vec<u32>), AdapterError> {
    if data.len() < 20 || (data.len() - 20) % 23 != 0 {
        return Err(AdapterError::Decode(format!(
            "packed path length {} invalid",
            data.len()
        )));
    }
    let hops = (data.len() - 20) / 23;
    let mut tokens = Vec::with_capacity(hops + 1);
    let mut fees = Vec::with_capacity(hops);

    let first = Address::from_slice(&data[..20]);
    tokens.push(resolve_token(first, &decimals_of)?);

    let mut cursor = 20;
    for _ in 0..hops {
        let fee = u32::from(data[cursor]) << 16
            | u32::from(data[cursor + 1]) << 8
            | u32::from(data[cursor + 2]);
        cursor += 3;
        let addr = Address::from_slice(&data[cursor..cursor + 20]);
        cursor += 20;
        fees.push(fee);
        tokens.push(resolve_token(addr, &decimals_of)?);
    }
    Ok((tokens, fees))
}

fn resolve_token(
    addr: Address,
    decimals_of: &impl Fn(Address) -> Option<u8>,
) -> Result<TokenRef, AdapterError> {
    let decimals = decimals_of(addr)
        .ok_or_else(|| AdapterError::Decode(format!("unknown token in path: {}", addr)))?;
    TokenRef::new(addr, decimals).ok_or_else(|| AdapterError::Decode("bad decimals".into()))
}

/// V2-family path: plain `[token_in, token_out]` address array.
pub fn v2_path(token_in: &TokenRef, token_out: &TokenRef) -> Vec<Address> {
    vec![token_in.address, token_out.address]
}
