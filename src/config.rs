//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Secrets (session cookies, signer secret, API keys) are referenced by
//! env-var name in the config and resolved at runtime.

use anyhow::{bail, Context, Result};
use secrecy::SecretString;
use serde::Deserialize;
use std::fs;
use std::time::Duration;

use crate::platforms::fragment::DEFAULT_BASE_URL;
use crate::platforms::ton::DEFAULT_TONCENTER_URL;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub fragment: FragmentConfig,
    pub wallet: WalletConfig,
    #[serde(default)]
    pub monitor: MonitorSettings,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FragmentConfig {
    pub base_url: String,
    /// Env var holding the browser session cookies (`k=v; k2=v2`).
    pub cookies_env: String,
    pub request_timeout_secs: u64,
    pub listing_cache_ttl_secs: u64,
}

impl Default for FragmentConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.into(),
            cookies_env: "FRAGMENT_COOKIES".into(),
            request_timeout_secs: 10,
            listing_cache_ttl_secs: 5,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WalletConfig {
    #[serde(default = "default_toncenter_url")]
    pub toncenter_url: String,
    /// User-friendly wallet address.
    pub address: String,
    /// Hex public key, sent to Fragment with every bid.
    pub public_key: String,
    /// Base64 wallet state init, sent to Fragment with every bid.
    pub state_init: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    pub signer_url: String,
    #[serde(default = "default_signer_secret_env")]
    pub signer_secret_env: String,
    #[serde(default = "default_wallet_timeout")]
    pub request_timeout_secs: u64,
}

fn default_toncenter_url() -> String {
    DEFAULT_TONCENTER_URL.into()
}

fn default_signer_secret_env() -> String {
    "TON_SIGNER_SECRET".into()
}

fn default_wallet_timeout() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MonitorSettings {
    /// Consecutive insufficient-balance polls before a monitor stops itself.
    pub insufficient_funds_polls: u32,
    pub shutdown_timeout_secs: u64,
    /// Upper bound for each marketplace/wallet call inside a purchase.
    pub call_timeout_secs: u64,
    pub default_interval_secs: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            insufficient_funds_polls: 2,
            shutdown_timeout_secs: 10,
            call_timeout_secs: 30,
            default_interval_secs: 1,
        }
    }
}

impl MonitorSettings {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::from_toml(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.monitor.insufficient_funds_polls == 0 {
            bail!("monitor.insufficient_funds_polls must be at least 1");
        }
        if !(crate::types::MIN_INTERVAL_SECS..=crate::types::MAX_INTERVAL_SECS)
            .contains(&self.monitor.default_interval_secs)
        {
            bail!(
                "monitor.default_interval_secs must be within 1..=60, got {}",
                self.monitor.default_interval_secs
            );
        }
        if self.wallet.address.trim().is_empty() {
            bail!("wallet.address must not be empty");
        }
        Ok(())
    }

    /// Resolve an environment variable name to its value.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }

    /// Resolve a secret referenced by env-var name. Empty values count as missing.
    pub fn resolve_secret(env_name: &str) -> Result<SecretString> {
        let value = Self::resolve_env(env_name)?;
        if value.trim().is_empty() {
            bail!("Environment variable is empty: {env_name}");
        }
        Ok(SecretString::new(value))
    }
}
