//! fragment-buyer: automated Fragment marketplace purchaser.
//!
//! Entry point. Loads configuration, initialises structured logging,
//! builds the Fragment and TON clients, and serves the control API until
//! Ctrl+C, then signals every running monitor.

use anyhow::{Context, Result};
use secrecy::SecretString;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use fragment_buyer::api::{self, ApiState};
use fragment_buyer::config::{self, AppConfig};
use fragment_buyer::engine::{MonitorRegistry, PurchaseGuard, RegistrySettings};
use fragment_buyer::platforms::fragment::{FragmentAccount, FragmentClient};
use fragment_buyer::platforms::ton::TonWallet;

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let config_path =
        std::env::var("FRAGMENT_BUYER_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let cfg = AppConfig::load(&config_path)?;

    init_logging();

    info!(
        config = %config_path,
        wallet = %cfg.wallet.address,
        marketplace = %cfg.fragment.base_url,
        "fragment-buyer starting up"
    );

    // -- Initialise components -------------------------------------------

    let market = build_fragment(&cfg)?;
    let wallet = build_wallet(&cfg)?;

    let guard = Arc::new(PurchaseGuard::new(
        Arc::new(market),
        Arc::new(wallet),
        cfg.monitor.call_timeout(),
    ));
    let registry = Arc::new(MonitorRegistry::new(
        guard,
        RegistrySettings {
            insufficient_funds_polls: cfg.monitor.insufficient_funds_polls,
            shutdown_timeout: cfg.monitor.shutdown_timeout(),
        },
    ));

    let state = Arc::new(ApiState {
        registry: registry.clone(),
        default_interval_secs: cfg.monitor.default_interval_secs,
    });

    // -- Serve -------------------------------------------------------------

    let addr = listen_addr(&cfg.server)?;
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
        }
        info!("Shutdown signal received.");
    };

    api::serve(state, addr, shutdown).await?;

    registry.shutdown().await;
    info!("fragment-buyer shut down cleanly.");
    Ok(())
}

fn build_fragment(cfg: &AppConfig) -> Result<FragmentClient> {
    let cookies = AppConfig::resolve_secret(&cfg.fragment.cookies_env)
        .context("Fragment session cookies are required")?;
    let account = FragmentAccount::mainnet(
        cfg.wallet.address.clone(),
        cfg.wallet.public_key.clone(),
        cfg.wallet.state_init.clone(),
    );
    FragmentClient::new(
        &cfg.fragment.base_url,
        &cookies,
        account,
        Duration::from_secs(cfg.fragment.request_timeout_secs),
        Duration::from_secs(cfg.fragment.listing_cache_ttl_secs),
    )
}

fn build_wallet(cfg: &AppConfig) -> Result<TonWallet> {
    let api_key: Option<SecretString> = match &cfg.wallet.api_key_env {
        Some(env) => match AppConfig::resolve_secret(env) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(error = %e, "toncenter API key missing; using anonymous rate limit");
                None
            }
        },
        None => None,
    };
    let signer_secret = AppConfig::resolve_secret(&cfg.wallet.signer_secret_env)
        .context("Signer secret is required")?;

    TonWallet::new(
        &cfg.wallet.toncenter_url,
        api_key,
        &cfg.wallet.address,
        &cfg.wallet.signer_url,
        signer_secret,
        Duration::from_secs(cfg.wallet.request_timeout_secs),
    )
}

/// `HOST`/`PORT` env vars override the `[server]` section.
fn listen_addr(server: &config::ServerConfig) -> Result<SocketAddr> {
    let host = std::env::var("HOST").unwrap_or_else(|_| server.host.clone());
    let port = match std::env::var("PORT") {
        Ok(p) => p.parse::<u16>().with_context(|| format!("Invalid PORT: {p}"))?,
        Err(_) => server.port,
    };
    format!("{host}:{port}")
        .parse()
        .with_context(|| format!("Invalid listen address {host}:{port}"))
}

/// Initialise the tracing subscriber (JSON when `FRAGMENT_BUYER_LOG_JSON` is set).
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("fragment_buyer=info"));

    let json_logging = std::env::var("FRAGMENT_BUYER_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
