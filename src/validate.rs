// src/validate.rs
//
// Input parsing for form fields. Runs before any lookup or database access;
// queries are parameterized regardless, so the symbol check is a format
// filter only.
use crate::error::AppError;
use rust_decimal::Decimal;
use std::str::FromStr;

pub const MAX_SYMBOL_LEN: usize = 10;

/// A validated trade request: upper-cased ticker and a positive share count.
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub symbol: String,
    pub shares: i64,
}

impl Order {
    pub fn parse(symbol: Option<&str>, shares: Option<&str>) -> Result<Self, AppError> {
        let symbol_raw = present(symbol).ok_or_else(|| AppError::validation("must enter stock symbol"))?;
        let shares_raw =
            present(shares).ok_or_else(|| AppError::validation("must enter amount of shares"))?;
        Ok(Order {
            symbol: ticker(symbol_raw)?,
            shares: share_count(shares_raw)?,
        })
    }
}

fn present(raw: Option<&str>) -> Option<&str> {
    raw.map(str::trim).filter(|s| !s.is_empty())
}

pub fn symbol(raw: Option<&str>) -> Result<String, AppError> {
    let raw = present(raw).ok_or_else(|| AppError::validation("must enter stock symbol"))?;
    ticker(raw)
}

fn ticker(raw: &str) -> Result<String, AppError> {
    if raw.len() > MAX_SYMBOL_LEN {
        return Err(AppError::validation("stock symbol is too long"));
    }
    if !raw
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
    {
        return Err(AppError::validation(
            "stock symbol cannot contain special characters",
        ));
    }
    Ok(raw.to_ascii_uppercase())
}

fn share_count(raw: &str) -> Result<i64, AppError> {
    let invalid = || AppError::validation("shares must be a positive whole number");
    if !raw.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    match raw.parse::<i64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(invalid()),
    }
}

pub fn required<'a>(raw: Option<&'a str>, message: &str) -> Result<&'a str, AppError> {
    raw.filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::validation(message))
}

/// Parses a deposit amount: a positive decimal with at most two places.
pub fn deposit_amount(raw: Option<&str>) -> Result<Decimal, AppError> {
    let raw = present(raw).ok_or_else(|| AppError::validation("must enter an amount"))?;
    let amount = Decimal::from_str(raw)
        .map_err(|_| AppError::validation("amount must be a number"))?;
    if amount <= Decimal::ZERO {
        return Err(AppError::validation("must enter a value greater than 0"));
    }
    if amount.normalize().scale() > 2 {
        return Err(AppError::validation("amount cannot include fractions of a cent"));
    }
    Ok(amount)
}
