// src/pricing.rs
//
// Fiat display prices for the fixed satoshi subscription price.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

pub const DEFAULT_PRICE_SATS: u64 = 50_000;
pub const SATS_PER_BTC: u64 = 100_000_000;
pub const DEFAULT_REFRESH_SECS: u64 = 300;
pub const COINGECKO_API_BASE: &str = "https://api.coingecko.com";
pub const COINBASE_API_BASE: &str = "https://api.coinbase.com";

#[derive(Error, Debug)]
pub enum PricingError {
    #[error("HTTP request failed")]
    Request(#[from] reqwest::Error),

    #[error("{source_name} returned status {status}")]
    Status {
        source_name: &'static str,
        status: reqwest::StatusCode,
    },

    #[error("{source_name} has no BTC rate for {currency}")]
    MissingRate {
        source_name: &'static str,
        currency: String,
    },

    #[error("Unparseable rate '{0}'")]
    InvalidRate(String),

    #[error("All price sources failed for {0}")]
    AllSourcesFailed(String),
}

/// Converts a satoshi amount into fiat at `btc_price` per bitcoin, to cents.
pub fn sats_to_fiat(sats: u64, btc_price: Decimal) -> Decimal {
    (Decimal::from(sats) * btc_price / Decimal::from(SATS_PER_BTC)).round_dp(2)
}

#[async_trait]
pub trait PriceSource: Send + Sync {
    fn name(&self) -> &'static str;
    async fn btc_price(&self, currency: &str) -> Result<Decimal, PricingError>;
}

fn http_client() -> Result<Client, PricingError> {
    Ok(Client::builder().timeout(Duration::from_secs(10)).build()?)
}

pub struct CoinGeckoSource {
    base_url: String,
    http_client: Client,
}

impl CoinGeckoSource {
    pub fn new(base_url: &str) -> Result<Self, PricingError> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client: http_client()?,
        })
    }
}

#[async_trait]
impl PriceSource for CoinGeckoSource {
    fn name(&self) -> &'static str {
        "coingecko"
    }

    async fn btc_price(&self, currency: &str) -> Result<Decimal, PricingError> {
        let vs_currency = currency.to_ascii_lowercase();
        let url = format!("{}/api/v3/simple/price", self.base_url);
        let response = self
            .http_client
            .get(&url)
            .query(&[("ids", "bitcoin"), ("vs_currencies", vs_currency.as_str())])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PricingError::Status {
                source_name: self.name(),
                status: response.status(),
            });
        }

        // {"bitcoin": {"usd": 60000.12}}
        let body: HashMap<String, HashMap<String, f64>> = response.json().await?;
        let rate = body
            .get("bitcoin")
            .and_then(|rates| rates.get(&vs_currency))
            .copied()
            .ok_or_else(|| PricingError::MissingRate {
                source_name: self.name(),
                currency: currency.to_string(),
            })?;
        Decimal::from_f64(rate).ok_or_else(|| PricingError::InvalidRate(rate.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct CoinbaseRates {
    data: CoinbaseRateData,
}

#[derive(Debug, Deserialize)]
struct CoinbaseRateData {
    rates: HashMap<String, String>,
}

pub struct CoinbaseSource {
    base_url: String,
    http_client: Client,
}

impl CoinbaseSource {
    pub fn new(base_url: &str) -> Result<Self, PricingError> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client: http_client()?,
        })
    }
}

#[async_trait]
impl PriceSource for CoinbaseSource {
    fn name(&self) -> &'static str {
        "coinbase"
    }

    async fn btc_price(&self, currency: &str) -> Result<Decimal, PricingError> {
        let url = format!("{}/v2/exchange-rates", self.base_url);
        let response = self
            .http_client
            .get(&url)
            .query(&[("currency", "BTC")])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PricingError::Status {
                source_name: self.name(),
                status: response.status(),
            });
        }

        let body: CoinbaseRates = response.json().await?;
        let rate = body
            .data
            .rates
            .get(&currency.to_ascii_uppercase())
            .ok_or_else(|| PricingError::MissingRate {
                source_name: self.name(),
                currency: currency.to_string(),
            })?;
        Decimal::from_str(rate).map_err(|_| PricingError::InvalidRate(rate.clone()))
    }
}

/// Sources tried in order; the first that answers wins.
pub struct PriceFeed {
    sources: Vec<Arc<dyn PriceSource>>,
}

impl PriceFeed {
    pub fn new(sources: Vec<Arc<dyn PriceSource>>) -> Self {
        Self { sources }
    }

    pub fn public_apis() -> Result<Self, PricingError> {
        Ok(Self::new(vec![
            Arc::new(CoinGeckoSource::new(COINGECKO_API_BASE)?),
            Arc::new(CoinbaseSource::new(COINBASE_API_BASE)?),
        ]))
    }

    pub async fn btc_price(&self, currency: &str) -> Result<(Decimal, &'static str), PricingError> {
        for source in &self.sources {
            match source.btc_price(currency).await {
                Ok(price) => {
                    debug!("BTC/{} = {} from {}", currency, price, source.name());
                    return Ok((price, source.name()));
                }
                Err(e) => warn!("Price source {} failed for {}: {}", source.name(), currency, e),
            }
        }
        Err(PricingError::AllSourcesFailed(currency.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    pub currency: String,
    pub btc_price: Decimal,
    pub price_sats: u64,
    pub fiat_price: Decimal,
    pub source: String,
    pub fetched_at: DateTime<Utc>,
}

/// Last known quote per currency.
pub struct PriceBoard {
    price_sats: u64,
    quotes: RwLock<HashMap<String, Quote>>,
}

impl PriceBoard {
    pub fn new(price_sats: u64) -> Self {
        Self {
            price_sats,
            quotes: RwLock::new(HashMap::new()),
        }
    }

    pub fn price_sats(&self) -> u64 {
        self.price_sats
    }

    /// Refreshes each currency. A failed currency keeps its previous quote.
    /// Returns how many currencies were updated.
    pub async fn refresh(&self, feed: &PriceFeed, currencies: &[String]) -> usize {
        let mut updated = 0;
        for currency in currencies {
            let currency = currency.to_ascii_uppercase();
            match feed.btc_price(&currency).await {
                Ok((btc_price, source)) => {
                    let quote = Quote {
                        currency: currency.clone(),
                        btc_price,
                        price_sats: self.price_sats,
                        fiat_price: sats_to_fiat(self.price_sats, btc_price),
                        source: source.to_string(),
                        fetched_at: Utc::now(),
                    };
                    self.quotes.write().await.insert(currency, quote);
                    updated += 1;
                }
                Err(e) => error!("Keeping previous {} quote: {}", currency, e),
            }
        }
        updated
    }

    pub async fn quotes(&self) -> Vec<Quote> {
        let mut quotes: Vec<Quote> = self.quotes.read().await.values().cloned().collect();
        quotes.sort_by(|a, b| a.currency.cmp(&b.currency));
        quotes
    }

    pub async fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.quotes.read().await.values().map(|q| q.fetched_at).max()
    }
}

pub async fn run_price_refresh(
    board: Arc<PriceBoard>,
    feed: Arc<PriceFeed>,
    currencies: Vec<String>,
    interval: Duration,
) {
    info!(
        "Starting price refresh for {:?} every {}s",
        currencies,
        interval.as_secs()
    );
    loop {
        let updated = board.refresh(&feed, &currencies).await;
        debug!("Refreshed {}/{} price quotes", updated, currencies.len());
        tokio::time::sleep(interval).await;
    }
}
