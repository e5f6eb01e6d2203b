// src/config.rs

use chrono::FixedOffset;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::bc_client::{AccessTokenSource, BcConfig, StaticTokenSource, StoredTokenSource};
use crate::entry_store::DEFAULT_ENTRIES_FILE;
use crate::pricing::{COINBASE_API_BASE, COINGECKO_API_BASE, DEFAULT_PRICE_SATS, DEFAULT_REFRESH_SECS};
use crate::timer::DEFAULT_TIMER_FILE;

pub const BC_ENV_PREFIX: &str = "BC_";
pub const APP_ENV_PREFIX: &str = "THYME_";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {prefix}* environment: {source}")]
    Env {
        prefix: &'static str,
        #[source]
        source: envy::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Business Central token setup failed")]
    Token(#[from] crate::bc_client::BcError),
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 3000))
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_static_dir() -> PathBuf {
    PathBuf::from("./static")
}

fn default_price_sats() -> u64 {
    DEFAULT_PRICE_SATS
}

fn default_currencies() -> Vec<String> {
    vec!["USD".to_string(), "EUR".to_string()]
}

fn default_price_refresh_secs() -> u64 {
    DEFAULT_REFRESH_SECS
}

fn default_sync_interval_secs() -> u64 {
    15 * 60
}

fn default_coingecko_api_base() -> String {
    COINGECKO_API_BASE.to_string()
}

fn default_coinbase_api_base() -> String {
    COINBASE_API_BASE.to_string()
}

/// Loaded from `THYME_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_static_dir")]
    pub static_dir: PathBuf,
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    #[serde(default = "default_price_sats")]
    pub price_sats: u64,
    #[serde(default = "default_currencies")]
    pub currencies: Vec<String>,
    #[serde(default = "default_price_refresh_secs")]
    pub price_refresh_secs: u64,
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
    /// Resource used when a request names none.
    #[serde(default)]
    pub default_resource: Option<String>,
    /// Minutes east of UTC for the user's calendar day. Host offset when unset.
    #[serde(default)]
    pub utc_offset_minutes: Option<i32>,
    #[serde(default = "default_coingecko_api_base")]
    pub coingecko_api_base: String,
    #[serde(default = "default_coinbase_api_base")]
    pub coinbase_api_base: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let config: Self = envy::prefixed(APP_ENV_PREFIX)
            .from_env()
            .map_err(|source| ConfigError::Env {
                prefix: APP_ENV_PREFIX,
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.cert_path.is_some() != self.key_path.is_some() {
            return Err(ConfigError::Invalid(
                "THYME_CERT_PATH and THYME_KEY_PATH must be set together".to_string(),
            ));
        }
        if self.price_refresh_secs == 0 || self.sync_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "refresh and sync intervals must be positive".to_string(),
            ));
        }
        if let Some(minutes) = self.utc_offset_minutes {
            self.offset_from_minutes(minutes)?;
        }
        Ok(())
    }

    fn offset_from_minutes(&self, minutes: i32) -> Result<FixedOffset, ConfigError> {
        FixedOffset::east_opt(minutes * 60).ok_or_else(|| {
            ConfigError::Invalid(format!("UTC offset of {} minutes is out of range", minutes))
        })
    }

    pub fn utc_offset(&self) -> Option<FixedOffset> {
        self.utc_offset_minutes
            .and_then(|minutes| self.offset_from_minutes(minutes).ok())
    }

    pub fn tls_paths(&self) -> Option<(&Path, &Path)> {
        match (&self.cert_path, &self.key_path) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            _ => None,
        }
    }

    pub fn entries_path(&self) -> PathBuf {
        self.data_dir.join(DEFAULT_ENTRIES_FILE)
    }

    pub fn timer_path(&self) -> PathBuf {
        self.data_dir.join(DEFAULT_TIMER_FILE)
    }
}

pub fn load_bc_config() -> Result<BcConfig, ConfigError> {
    envy::prefixed(BC_ENV_PREFIX)
        .from_env()
        .map_err(|source| ConfigError::Env {
            prefix: BC_ENV_PREFIX,
            source,
        })
}

/// A directly supplied token wins over the token file.
pub fn token_source(config: &BcConfig) -> Result<Arc<dyn AccessTokenSource>, ConfigError> {
    if let Some(token) = config.access_token.as_deref().filter(|t| !t.is_empty()) {
        return Ok(Arc::new(StaticTokenSource::new(token)));
    }
    match &config.token_file {
        Some(path) => Ok(Arc::new(StoredTokenSource::new(path)?)),
        None => Err(ConfigError::Invalid(
            "set BC_ACCESS_TOKEN or BC_TOKEN_FILE".to_string(),
        )),
    }
}
