//! Hex quantity helpers for the handful of numbers the stages reason about
//! (block numbers, nonces, gas).

use serde_json::Value;

pub fn to_hex(n: u64) -> String {
    format!("{:#x}", n)
}

/// Accepts `"0x.."` strings, decimal strings and JSON numbers.
pub fn parse(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some("") => Some(0),
            Some(hex) => u64::from_str_radix(hex, 16).ok(),
            None => s.parse().ok(),
        },
        _ => None,
    }
}

/// True for block parameters that pin a specific block.
pub fn is_block_number(value: &Value) -> bool {
    match value {
        Value::String(s) => s.starts_with("0x") && parse(value).is_some(),
        Value::Number(_) => true,
        _ => false,
    }
}
