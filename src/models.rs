// src/models.rs
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};

pub struct User {
    pub id: i64,
    pub username: String,
    pub hash: String,
    pub cash: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct Holding {
    pub id: i64,
    pub user_id: i64,
    pub symbol: String,
    pub name: String,
    pub shares: i64,
    /// Price paid on the most recent purchase.
    pub price: Decimal,
    pub total_cost: Decimal,
}

/// One row of the append-only trade log. `shares` is signed: positive for a
/// purchase, negative for a sale.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub symbol: String,
    pub shares: i64,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Quote {
    pub symbol: String,
    pub name: String,
    pub price: Decimal,
}

#[derive(Debug, Serialize)]
pub struct TradeReceipt {
    pub symbol: String,
    pub name: String,
    pub shares: i64,
    pub price: Decimal,
    pub total: Decimal,
    pub cash: Decimal,
}

#[derive(Debug, Serialize)]
pub struct PortfolioLine {
    pub symbol: String,
    pub name: String,
    pub shares: i64,
    pub price: Decimal,
    pub price_usd: String,
    pub value: Decimal,
    pub value_usd: String,
    /// Set when the live price could not be fetched and the stored purchase
    /// price was used instead.
    pub stale: bool,
}

#[derive(Debug, Serialize)]
pub struct PortfolioView {
    pub cash: Decimal,
    pub cash_usd: String,
    pub holdings: Vec<PortfolioLine>,
    pub total: Decimal,
    pub total_usd: String,
}

#[derive(Debug, Serialize)]
pub struct SessionGrant {
    pub user_id: i64,
}

#[derive(Debug, Serialize)]
pub struct Position {
    pub symbol: String,
    pub shares: i64,
}

#[derive(Debug, Serialize)]
pub struct Balance {
    pub cash: Decimal,
    pub cash_usd: String,
}

// Form bodies arrive either url-encoded or as JSON. Every field is optional
// so that a missing field reaches validation instead of failing decoding.

#[derive(Debug, Default, Deserialize)]
pub struct TradeForm {
    #[serde(default, deserialize_with = "lenient_string")]
    pub symbol: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub shares: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct QuoteForm {
    #[serde(default, deserialize_with = "lenient_string")]
    pub symbol: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CredentialsForm {
    #[serde(default, deserialize_with = "lenient_string")]
    pub username: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub password: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub confirmation: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FundsForm {
    #[serde(default, deserialize_with = "lenient_string")]
    pub funds: Option<String>,
}

/// Accepts a JSON number where a form would carry text.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Int(i64),
        Float(f64),
    }

    Ok(Option::<Raw>::deserialize(deserializer)?.map(|raw| match raw {
        Raw::Text(text) => text,
        Raw::Int(n) => n.to_string(),
        Raw::Float(f) => f.to_string(),
    }))
}

/// Formats an amount as US dollars, e.g. `$1,234.56`.
pub fn usd(amount: Decimal) -> String {
    let rounded = amount.round_dp(2);
    let sign = if rounded.is_sign_negative() && !rounded.is_zero() {
        "-"
    } else {
        ""
    };
    let text = format!("{:.2}", rounded.abs());
    let (whole, cents) = match text.split_once('.') {
        Some(parts) => parts,
        None => (text.as_str(), "00"),
    };

    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, ch) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    format!("{}${}.{}", sign, grouped, cents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn usd_groups_thousands() {
        assert_eq!(usd(dec!(0)), "$0.00");
        assert_eq!(usd(dec!(940)), "$940.00");
        assert_eq!(usd(dec!(1234.5)), "$1,234.50");
        assert_eq!(usd(dec!(10000)), "$10,000.00");
        assert_eq!(usd(dec!(1234567.891)), "$1,234,567.89");
        assert_eq!(usd(dec!(-12.3)), "-$12.30");
    }

    #[test]
    fn forms_accept_numbers_and_text() {
        let form: TradeForm = serde_json::from_str(r#"{"symbol":"abc","shares":5}"#).unwrap();
        assert_eq!(form.symbol.as_deref(), Some("abc"));
        assert_eq!(form.shares.as_deref(), Some("5"));

        let form: TradeForm = serde_json::from_str(r#"{"shares":"1.5"}"#).unwrap();
        assert!(form.symbol.is_none());
        assert_eq!(form.shares.as_deref(), Some("1.5"));
    }
}
