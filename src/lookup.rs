// src/lookup.rs
use crate::models::Quote;
use async_trait::async_trait;
use log::{debug, info};
use reqwest::{Client, StatusCode};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider answered HTTP {0}")]
    Status(u16),

    #[error("provider returned an unusable price for {0}")]
    Malformed(String),
}

/// Resolves a ticker to its current name and price. `Ok(None)` means the
/// provider does not know the symbol.
#[async_trait]
pub trait PriceLookup: Send + Sync {
    async fn lookup(&self, symbol: &str) -> Result<Option<Quote>, LookupError>;
}

#[derive(Deserialize)]
struct IexQuote {
    #[serde(rename = "companyName")]
    company_name: String,
    #[serde(rename = "latestPrice")]
    latest_price: f64,
    symbol: String,
}

/// IEX Cloud style quote endpoint: `{base}/stock/{symbol}/quote?token=...`.
pub struct IexLookup {
    client: Client,
    base_url: String,
    api_key: String,
}

impl IexLookup {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, LookupError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(IexLookup {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }
}

#[async_trait]
impl PriceLookup for IexLookup {
    async fn lookup(&self, symbol: &str) -> Result<Option<Quote>, LookupError> {
        let url = format!("{}/stock/{}/quote", self.base_url, symbol);
        debug!("Looking up {} at {}", symbol, url);

        let response = self
            .client
            .get(&url)
            .query(&[("token", self.api_key.as_str())])
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                info!("Provider does not know symbol {}", symbol);
                return Ok(None);
            }
            status if !status.is_success() => return Err(LookupError::Status(status.as_u16())),
            _ => {}
        }

        let quote = response.json::<IexQuote>().await?;
        let price = Decimal::from_f64(quote.latest_price)
            .filter(|p| *p > Decimal::ZERO)
            .ok_or_else(|| LookupError::Malformed(symbol.to_string()))?;

        Ok(Some(Quote {
            symbol: quote.symbol.to_ascii_uppercase(),
            name: quote.company_name,
            price,
        }))
    }
}

#[cfg(test)]
pub(crate) use fixed::StaticLookup;
