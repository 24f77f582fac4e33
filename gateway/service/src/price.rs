// Copyright (c) 2024 The Botho Foundation

//! USD price sources used to value deposits for the fee table.

use async_trait::async_trait;
use bth_gateway_core::{config::PriceSettings, config::PriceSource, Cryptocurrency};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::GatewayError;

/// Source of USD prices per whole coin.
#[async_trait]
pub trait PriceOracle: Send + Sync {
    async fn usd_price(&self, coin: Cryptocurrency) -> Result<f64, GatewayError>;
}

/// Fixed prices from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticPriceOracle {
    prices: BTreeMap<Cryptocurrency, f64>,
}

impl StaticPriceOracle {
    pub fn new(prices: BTreeMap<Cryptocurrency, f64>) -> Self {
        Self { prices }
    }

    pub fn with_price(mut self, coin: Cryptocurrency, usd: f64) -> Self {
        self.prices.insert(coin, usd);
        self
    }
}

#[async_trait]
impl PriceOracle for StaticPriceOracle {
    async fn usd_price(&self, coin: Cryptocurrency) -> Result<f64, GatewayError> {
        self.prices
            .get(&coin)
            .copied()
            .ok_or_else(|| GatewayError::PriceUnavailable(format!("no static price for {}", coin)))
    }
}

/// CoinGecko-style `simple/price` client with a short-lived cache.
pub struct HttpPriceOracle {
    url: String,
    cache_ttl: Duration,
    client: reqwest::Client,
    cache: Mutex<HashMap<Cryptocurrency, (f64, Instant)>>,
}

impl HttpPriceOracle {
    pub fn new(url: String, cache_ttl: Duration, timeout: Duration) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Validation(format!("HTTP client: {}", e)))?;
        Ok(Self {
            url,
            cache_ttl,
            client,
            cache: Mutex::new(HashMap::new()),
        })
    }

    fn cached(&self, coin: Cryptocurrency) -> Option<f64> {
        let cache = self.cache.lock().ok()?;
        cache
            .get(&coin)
            .filter(|(_, at)| at.elapsed() < self.cache_ttl)
            .map(|(price, _)| *price)
    }
}

/// Extract `{"<id>": {"usd": <price>}}` from a `simple/price` response.
fn parse_simple_price(body: &Value, id: &str) -> Result<f64, GatewayError> {
    body.get(id)
        .and_then(|entry| entry.get("usd"))
        .and_then(Value::as_f64)
        .filter(|price| price.is_finite() && *price > 0.0)
        .ok_or_else(|| GatewayError::PriceUnavailable(format!("no USD quote for {}", id)))
}

#[async_trait]
impl PriceOracle for HttpPriceOracle {
    async fn usd_price(&self, coin: Cryptocurrency) -> Result<f64, GatewayError> {
        if let Some(price) = self.cached(coin) {
            return Ok(price);
        }

        let response = self
            .client
            .get(&self.url)
            .query(&[("ids", coin.price_id()), ("vs_currencies", "usd")])
            .send()
            .await
            .map_err(|e| GatewayError::PriceUnavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(GatewayError::PriceUnavailable(format!(
                "HTTP {}",
                response.status()
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| GatewayError::PriceUnavailable(e.to_string()))?;

        let price = parse_simple_price(&body, coin.price_id())?;
        debug!("{} price ${}", coin, price);

        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(coin, (price, Instant::now()));
        }
        Ok(price)
    }
}

/// Build the oracle selected by configuration.
pub fn from_settings(
    settings: &PriceSettings,
    timeout: Duration,
) -> Result<Box<dyn PriceOracle>, GatewayError> {
    Ok(match settings.source {
        PriceSource::Static => Box::new(StaticPriceOracle::new(settings.static_usd.clone())),
        PriceSource::Http => Box::new(HttpPriceOracle::new(
            settings.url.clone(),
            Duration::from_secs(settings.cache_secs),
            timeout,
        )?),
    })
}
