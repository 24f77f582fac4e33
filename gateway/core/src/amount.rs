// Copyright (c) 2024 The Botho Foundation

//! Exact monetary amounts in a coin's smallest unit.
//!
//! Amounts never pass through floating point. They are stored as `u128`
//! base units (wei) and persisted as decimal strings so JSON readers that
//! only know IEEE doubles cannot truncate them.

use thiserror::Error;

/// An amount in the coin's smallest unit.
pub type Amount = u128;

/// Errors from parsing a human-readable amount.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AmountError {
    #[error("invalid amount format: {0}")]
    InvalidFormat(String),

    #[error("amount {0} has more than {1} decimal places")]
    TooPrecise(String, u32),

    #[error("amount {0} overflows")]
    Overflow(String),
}

/// Parse a decimal string such as `"0.27942715"` into base units.
pub fn parse_amount(value: &str, decimals: u32) -> Result<Amount, AmountError> {
    let value = value.trim();
    let (whole, frac) = match value.split_once('.') {
        Some((w, f)) => (w, f),
        None => (value, ""),
    };

    if whole.is_empty() && frac.is_empty() {
        return Err(AmountError::InvalidFormat(value.to_string()));
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
        return Err(AmountError::InvalidFormat(value.to_string()));
    }
    if frac.len() > decimals as usize {
        return Err(AmountError::TooPrecise(value.to_string(), decimals));
    }

    let scale = 10u128
        .checked_pow(decimals)
        .ok_or_else(|| AmountError::Overflow(value.to_string()))?;
    let whole_units: u128 = if whole.is_empty() {
        0
    } else {
        whole
            .parse()
            .map_err(|_| AmountError::Overflow(value.to_string()))?
    };

    let mut frac_units: u128 = 0;
    if !frac.is_empty() {
        let padded = format!("{:0<width$}", frac, width = decimals as usize);
        frac_units = padded
            .parse()
            .map_err(|_| AmountError::Overflow(value.to_string()))?;
    }

    whole_units
        .checked_mul(scale)
        .and_then(|w| w.checked_add(frac_units))
        .ok_or_else(|| AmountError::Overflow(value.to_string()))
}

/// Format base units as a decimal string without trailing zeros.
pub fn format_amount(amount: Amount, decimals: u32) -> String {
    let scale = 10u128.pow(decimals);
    let whole = amount / scale;
    let frac = amount % scale;
    if frac == 0 {
        return whole.to_string();
    }
    let frac = format!("{:0>width$}", frac, width = decimals as usize);
    format!("{}.{}", whole, frac.trim_end_matches('0'))
}

/// Convert base units to a float of native units, for valuation only.
pub fn to_native_f64(amount: Amount, decimals: u32) -> f64 {
    amount as f64 / 10f64.powi(decimals as i32)
}

/// Serde adapter persisting an [`Amount`] as a decimal string of base units.
pub mod amount_serde {
    use super::Amount;
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(amount: &Amount, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&amount.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Amount, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for an optional [`Amount`].
pub mod option_amount_serde {
    use super::Amount;
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(amount: &Option<Amount>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match amount {
            Some(a) => serializer.serialize_some(&a.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Amount>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: Option<String> = Option::deserialize(deserializer)?;
        match s {
            Some(s) => s.parse().map(Some).map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
