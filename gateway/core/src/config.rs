// Copyright (c) 2024 The Botho Foundation

//! Gateway configuration types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

use crate::coin::{validate_address, Cryptocurrency};

/// Highest non-hardened BIP-32 child index.
pub const MAX_NON_HARDENED_INDEX: u64 = 0x7FFF_FFFF;

/// Longest watch window a pending session may have (ten years).
pub const MAX_WATCH_HOURS: i64 = 10 * 365 * 24;

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("cryptocurrency {0} is not configured")]
    UnknownCoin(Cryptocurrency),
}

/// Main gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Process-wide settings
    pub gateway: GatewaySettings,

    /// RPC and forwarding retry policy
    #[serde(default)]
    pub retry: RetrySettings,

    /// Platform fee table
    #[serde(default)]
    pub fees: FeeSchedule,

    /// USD price source used for fee thresholds
    #[serde(default)]
    pub price: PriceSettings,

    /// Per-coin chain settings, keyed by coin code
    #[serde(default)]
    pub coins: BTreeMap<Cryptocurrency, CoinConfig>,
}

/// Process-wide gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    /// Path to SQLite database
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// File holding the BIP-39 mnemonic; `GATEWAY_MNEMONIC` overrides it
    pub mnemonic_file: Option<String>,

    /// Seconds between monitoring passes
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Sessions processed concurrently in one pass
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_sessions: usize,

    /// Hours a pending session is actively watched
    #[serde(default = "default_max_watch_hours")]
    pub max_watch_hours: i64,

    /// Timeout for a single RPC call
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_secs: u64,
}

fn default_db_path() -> String {
    "gateway.db".to_string()
}

fn default_poll_interval() -> u64 {
    15
}

fn default_max_concurrent() -> usize {
    16
}

fn default_max_watch_hours() -> i64 {
    72
}

fn default_rpc_timeout() -> u64 {
    10
}

/// Retry and backoff limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Retries of a single transient RPC failure
    #[serde(default = "default_max_rpc_retries")]
    pub max_rpc_retries: u32,

    /// First backoff delay between RPC retries
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Upper bound on the RPC backoff delay
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Forwarding attempts before falling back to manual forwarding
    #[serde(default = "default_max_forward_attempts")]
    pub max_forward_attempts: u32,

    /// Delay after the first failed forward; doubles per attempt
    #[serde(default = "default_forward_retry_base")]
    pub forward_retry_base_secs: u64,

    /// Upper bound on the delay between forwarding attempts
    #[serde(default = "default_forward_retry_max")]
    pub forward_retry_max_secs: u64,
}

fn default_max_rpc_retries() -> u32 {
    4
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_max_forward_attempts() -> u32 {
    3
}

fn default_forward_retry_base() -> u64 {
    60
}

fn default_forward_retry_max() -> u64 {
    3_600
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_rpc_retries: default_max_rpc_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_forward_attempts: default_max_forward_attempts(),
            forward_retry_base_secs: default_forward_retry_base(),
            forward_retry_max_secs: default_forward_retry_max(),
        }
    }
}

impl RetrySettings {
    /// Delay before forwarding attempt `attempts + 1`.
    pub fn forward_retry_delay_secs(&self, attempts: u32) -> u64 {
        let shift = attempts.saturating_sub(1).min(20);
        self.forward_retry_base_secs
            .saturating_mul(1u64 << shift)
            .min(self.forward_retry_max_secs)
    }
}

/// One row of the fee table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeTier {
    /// Lowest USD valuation this tier applies to
    pub min_usd: f64,

    /// Proportional fee in basis points (100 = 1%)
    #[serde(default)]
    pub fee_bps: u32,

    /// Flat fee in USD, converted at the deposit's valuation
    #[serde(default)]
    pub flat_usd: f64,
}

/// Platform fee table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeSchedule {
    /// Tiers in ascending `min_usd` order
    #[serde(default = "default_fee_tiers")]
    pub tiers: Vec<FeeTier>,
}

fn default_fee_tiers() -> Vec<FeeTier> {
    vec![FeeTier {
        min_usd: 10.0,
        fee_bps: 100, // 1%
        flat_usd: 0.0,
    }]
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            tiers: default_fee_tiers(),
        }
    }
}

/// Where USD prices come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceSource {
    /// Fixed prices from `static_usd`
    #[default]
    Static,
    /// CoinGecko-compatible `simple/price` endpoint
    Http,
}

/// USD price source settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceSettings {
    #[serde(default)]
    pub source: PriceSource,

    /// Base URL of the `simple/price` endpoint
    #[serde(default = "default_price_url")]
    pub url: String,

    /// Seconds a fetched quote is reused
    #[serde(default = "default_price_cache")]
    pub cache_secs: u64,

    /// Fixed USD prices used by the static source
    #[serde(default)]
    pub static_usd: BTreeMap<Cryptocurrency, f64>,
}

fn default_price_url() -> String {
    "https://api.coingecko.com/api/v3/simple/price".to_string()
}

fn default_price_cache() -> u64 {
    60
}

impl Default for PriceSettings {
    fn default() -> Self {
        Self {
            source: PriceSource::default(),
            url: default_price_url(),
            cache_secs: default_price_cache(),
            static_usd: BTreeMap::new(),
        }
    }
}

/// Chain connection and wallet settings for one coin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoinConfig {
    /// JSON-RPC endpoints, tried in order with failover
    pub rpc_endpoints: Vec<String>,

    /// Etherscan-compatible API used for address history
    pub explorer_url: String,

    #[serde(default)]
    pub explorer_api_key: Option<String>,

    /// Consolidation address receiving net funds
    pub forwarding_address: String,

    /// Address collecting swept platform fees
    #[serde(default)]
    pub fee_address: Option<String>,

    /// EIP-155 chain id (defaults per coin)
    #[serde(default)]
    pub chain_id: Option<u64>,

    /// SLIP-44 coin type (defaults per coin)
    #[serde(default)]
    pub coin_type: Option<u32>,

    /// Confirmations before a deposit or forward is final (defaults per coin)
    #[serde(default)]
    pub confirmations_required: Option<u64>,

    /// Gas limit of a plain value transfer
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,

    /// Largest derivation index the allocator may hand out
    #[serde(default = "default_max_index")]
    pub max_index: u64,

    /// Fee table overriding the global one for this coin
    #[serde(default)]
    pub fee_tiers: Option<Vec<FeeTier>>,
}

fn default_gas_limit() -> u64 {
    21_000
}

fn default_max_index() -> u64 {
    MAX_NON_HARDENED_INDEX
}

impl GatewayConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: GatewayConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.coins.is_empty() {
            return invalid("at least one coin must be configured".to_string());
        }
        if self.gateway.poll_interval_secs == 0 {
            return invalid("poll_interval_secs must be positive".to_string());
        }
        if self.gateway.max_concurrent_sessions == 0 {
            return invalid("max_concurrent_sessions must be positive".to_string());
        }
        if !(1..=MAX_WATCH_HOURS).contains(&self.gateway.max_watch_hours) {
            return invalid(format!(
                "max_watch_hours must be between 1 and {}, got {}",
                MAX_WATCH_HOURS, self.gateway.max_watch_hours
            ));
        }
        if self.retry.max_forward_attempts == 0 {
            return invalid("max_forward_attempts must be positive".to_string());
        }

        validate_tiers("fees.tiers", &self.fees.tiers)?;

        for (coin, cfg) in &self.coins {
            if cfg.rpc_endpoints.is_empty() {
                return invalid(format!("{}: at least one RPC endpoint is required", coin));
            }
            if cfg.explorer_url.is_empty() {
                return invalid(format!("{}: explorer_url is required", coin));
            }
            validate_address(&cfg.forwarding_address)
                .map_err(|e| ConfigError::Invalid(format!("{}: forwarding_address {}", coin, e)))?;
            if let Some(fee_address) = &cfg.fee_address {
                validate_address(fee_address)
                    .map_err(|e| ConfigError::Invalid(format!("{}: fee_address {}", coin, e)))?;
            }
            if cfg.max_index > MAX_NON_HARDENED_INDEX {
                return invalid(format!(
                    "{}: max_index {} is past the hardened boundary",
                    coin, cfg.max_index
                ));
            }
            if cfg.gas_limit == 0 {
                return invalid(format!("{}: gas_limit must be positive", coin));
            }
            if let Some(tiers) = &cfg.fee_tiers {
                validate_tiers(&format!("coins.{}.fee_tiers", coin), tiers)?;
            }
            if self.price.source == PriceSource::Static && !self.price.static_usd.contains_key(coin)
            {
                tracing::warn!("{}: no static USD price configured, valuations will be 0", coin);
            }
        }

        Ok(())
    }

    /// Settings for a coin.
    pub fn coin(&self, coin: Cryptocurrency) -> Result<&CoinConfig, ConfigError> {
        self.coins.get(&coin).ok_or(ConfigError::UnknownCoin(coin))
    }

    /// Confirmation threshold for a coin.
    pub fn confirmations_required(&self, coin: Cryptocurrency) -> u64 {
        self.coins
            .get(&coin)
            .and_then(|c| c.confirmations_required)
            .unwrap_or_else(|| coin.default_confirmations())
    }

    /// EIP-155 chain id for a coin.
    pub fn chain_id(&self, coin: Cryptocurrency) -> u64 {
        self.coins
            .get(&coin)
            .and_then(|c| c.chain_id)
            .unwrap_or_else(|| coin.default_chain_id())
    }

    /// SLIP-44 coin type for a coin.
    pub fn coin_type(&self, coin: Cryptocurrency) -> u32 {
        self.coins
            .get(&coin)
            .and_then(|c| c.coin_type)
            .unwrap_or_else(|| coin.default_coin_type())
    }

    /// Fee table that applies to a coin.
    pub fn fee_tiers(&self, coin: Cryptocurrency) -> &[FeeTier] {
        self.coins
            .get(&coin)
            .and_then(|c| c.fee_tiers.as_deref())
            .unwrap_or(&self.fees.tiers)
    }
}

fn validate_tiers(name: &str, tiers: &[FeeTier]) -> Result<(), ConfigError> {
    for pair in tiers.windows(2) {
        if pair[1].min_usd <= pair[0].min_usd {
            return Err(ConfigError::Invalid(format!(
                "{}: tiers must be in ascending min_usd order",
                name
            )));
        }
    }
    for tier in tiers {
        if tier.fee_bps > 10_000 {
            return Err(ConfigError::Invalid(format!(
                "{}: fee_bps {} exceeds 100%",
                name, tier.fee_bps
            )));
        }
        if !(tier.min_usd >= 0.0) || !(tier.flat_usd >= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "{}: tier amounts must be non-negative",
                name
            )));
        }
    }
    Ok(())
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let mut coins = BTreeMap::new();
        coins.insert(
            Cryptocurrency::Eth,
            CoinConfig {
                rpc_endpoints: vec!["http://localhost:8545".to_string()],
                explorer_url: "https://api.etherscan.io/api".to_string(),
                explorer_api_key: None,
                forwarding_address: "0x0000000000000000000000000000000000000000".to_string(),
                fee_address: None,
                chain_id: None,
                coin_type: None,
                confirmations_required: None,
                gas_limit: default_gas_limit(),
                max_index: default_max_index(),
                fee_tiers: None,
            },
        );

        Self {
            gateway: GatewaySettings {
                db_path: default_db_path(),
                mnemonic_file: None,
                poll_interval_secs: default_poll_interval(),
                max_concurrent_sessions: default_max_concurrent(),
                max_watch_hours: default_max_watch_hours(),
                rpc_timeout_secs: default_rpc_timeout(),
            },
            retry: RetrySettings::default(),
            fees: FeeSchedule::default(),
            price: PriceSettings::default(),
            coins,
        }
    }
}
