//! Numeric primitives
//!
//! One place for every conversion between raw token amounts (`U256` in the
//! token's smallest unit) and fixed-point ratios (`Decimal` with explicit
//! scale). Profit, margin, slippage and volatility math all route through
//! here; native floats are confined to log lines.

use alloy::primitives::{Address, U256};
use once_cell::sync::Lazy;
use rust_decimal::Decimal;
use std::str::FromStr;

use crate::error::AdapterError;

/// Decimal's maximum supported scale. Token decimals above this are reduced
/// by integer division before conversion.
const MAX_DECIMAL_SCALE: u32 = 28;

/// Powers of ten up to the widest token scale plus wei precision.
static POW10: Lazy<[U256; 77]> = Lazy::new(|| {
    let mut table = [U256::from(1u64); 77];
    for i in 1..77 {
        table[i] = table[i - 1] * U256::from(10u64);
    }
    table
});

/// Convert a raw amount to a Decimal in whole-token units.
///
/// Amounts wider than Decimal's 96-bit mantissa are reported as overflow
/// rather than silently truncated.
pub fn amount_to_decimal(amount: U256, decimals: u8) -> Result<Decimal, AdapterError> {
    let (reduced, effective_scale) = if decimals as u32 > MAX_DECIMAL_SCALE {
        let excess = decimals as u32 - MAX_DECIMAL_SCALE;
        (amount / pow10(excess as u8), MAX_DECIMAL_SCALE)
    } else {
        (amount, decimals as u32)
    };

    let mut d = Decimal::from_str(&reduced.to_string())
        .map_err(|_| AdapterError::Numeric(format!("amount {} exceeds decimal range", amount)))?;
    d.set_scale(effective_scale)
        .map_err(|_| AdapterError::Numeric(format!("scale {} out of range", effective_scale)))?;
    Ok(d)
}

/// Convert a whole-token Decimal back to a raw amount, truncating any
/// precision beyond the token's smallest unit. Negative values clamp to zero.
pub fn decimal_to_amount(value: Decimal, decimals: u8) -> Result<U256, AdapterError> {
    if value.is_sign_negative() {
        return Ok(U256::ZERO);
    }
    let scale = (decimals as u32).min(MAX_DECIMAL_SCALE);
    let mut scaled = value.trunc_with_scale(scale);
    scaled.rescale(scale);
    let mantissa = scaled.mantissa();
    let raw = U256::from_str(&mantissa.to_string())
        .map_err(|_| AdapterError::Numeric("mantissa conversion".into()))?;
    if decimals as u32 > MAX_DECIMAL_SCALE {
        let excess = decimals as u32 - MAX_DECIMAL_SCALE;
        raw.checked_mul(pow10(excess as u8))
            .ok_or_else(|| AdapterError::Numeric("amount overflow".into()))
    } else {
        Ok(raw)
    }
}

/// Ratio of two raw amounts sharing a unit, as a Decimal. Zero denominator
/// yields zero (matches the reserve-ratio convention for empty pools).
pub fn ratio(numerator: U256, denominator: U256) -> Result<Decimal, AdapterError> {
    if denominator.is_zero() {
        return Ok(Decimal::ZERO);
    }
    // Same unit on both sides, so the token scale cancels; 18 keeps plenty
    // of relative precision without overflowing the mantissa.
    let n = amount_to_decimal(numerator, 18)?;
    let d = amount_to_decimal(denominator, 18)?;
    if d.is_zero() {
        return Ok(Decimal::ZERO);
    }
    Ok(n / d)
}

/// 10^exp as U256, from the precomputed table. Exponents beyond any token
/// scale saturate at the table's top entry.
pub fn pow10(exp: u8) -> U256 {
    POW10[(exp as usize).min(POW10.len() - 1)]
}

/// Normalize an address to its EIP-55 checksummed form.
pub fn checksum(address: Address) -> String {
    address.to_checksum(None)
}

/// Parse an address from a hex string, accepting any capitalization.
pub fn parse_address(s: &str) -> Result<Address, AdapterError> {
    Address::from_str(s.trim())
        .map_err(|_| AdapterError::Decode(format!("invalid address: {}", s)))
}

/// Parse a JSON value that may be a `0x`-prefixed hex string, a decimal
/// string, or a plain number, into u64. RPC gas fields arrive in all three
/// forms.
pub fn parse_hex_or_int(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => {
            let s = s.trim();
            if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                u64::from_str_radix(hex, 16).ok()
            } else {
                s.parse().ok()
            }
        }
        _ => None,
    }
}

/// Same tolerance for U256-wide fields (wei amounts).
pub fn parse_hex_or_u256(value: &serde_json::Value) -> Option<U256> {
    match value {
        serde_json::Value::Number(n) => n.as_u64().map(U256::from),
        serde_json::Value::String(s) => {
            let s = s.trim();
            if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                U256::from_str_radix(hex, 16).ok()
            } else {
                U256::from_str(s).ok()
            }
        }
        _ => None,
    }
}

/// Format a u64 as a 0x-prefixed hex string (JSON-RPC quantity encoding).
pub fn to_hex_quantity(value: u64) -> String {
    format!("0x{:x}", value)
}

/// Format a U256 as a 0x-prefixed hex string.
pub fn to_hex_u256(value: U256) -> String {
    format!("0x{:x}", value)
}
