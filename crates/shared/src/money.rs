//! Money helpers
//!
//! Amounts are stored in the currency's minor unit (cents for USD). The API
//! speaks decimal amounts, so conversion happens once at the boundary.

/// Currencies without a minor unit (amount 100 means 100 yen, not 1 yen).
const ZERO_DECIMAL_CURRENCIES: &[&str] = &[
    "bif", "clp", "djf", "gnf", "jpy", "kmf", "krw", "mga", "pyg", "rwf", "ugx", "vnd", "vuv",
    "xaf", "xof", "xpf",
];

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MoneyError {
    #[error("amount must be a finite, non-negative number")]
    InvalidAmount,
    #[error("amount is too large")]
    Overflow,
    #[error("invalid currency code: {0}")]
    InvalidCurrency(String),
}

/// Lowercase a three-letter ISO 4217 code, rejecting anything else.
pub fn normalize_currency(code: &str) -> Result<String, MoneyError> {
    let code = code.trim();
    if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(MoneyError::InvalidCurrency(code.to_string()));
    }
    Ok(code.to_ascii_lowercase())
}

pub fn minor_unit_exponent(currency: &str) -> u32 {
    let lower = currency.to_ascii_lowercase();
    if ZERO_DECIMAL_CURRENCIES.contains(&lower.as_str()) {
        0
    } else {
        2
    }
}

/// Convert a decimal amount to minor units, rounding half away from zero.
pub fn to_minor_units(amount: f64, currency: &str) -> Result<i64, MoneyError> {
    if !amount.is_finite() || amount < 0.0 {
        return Err(MoneyError::InvalidAmount);
    }

    let scale = 10_i64.pow(minor_unit_exponent(currency)) as f64;
    let scaled = (amount * scale).round();
    if scaled > i64::MAX as f64 {
        return Err(MoneyError::Overflow);
    }
    Ok(scaled as i64)
}

pub fn from_minor_units(minor: i64, currency: &str) -> f64 {
    let scale = 10_i64.pow(minor_unit_exponent(currency)) as f64;
    minor as f64 / scale
}
