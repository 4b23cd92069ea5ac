//! Control API route handlers.
//!
//! All endpoints return JSON. Errors are `{error: <code>, message}` with a
//! stable code per failure kind. State is shared via `Arc<ApiState>`.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::engine::{MonitorRegistry, MonitorStatus, StopOutcome};
use crate::platforms::snapshot;
use crate::strategy::cheapest;
use crate::types::{
    ConfigError, Item, ItemClass, MarketError, MonitorConfig, PurchaseError, PurchaseReceipt,
    RegistryError, WalletError, WalletSnapshot,
};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub struct ApiState {
    pub registry: Arc<MonitorRegistry>,
    /// Poll interval used when a start request omits `interval_sec`.
    pub default_interval_secs: u64,
}

pub type AppState = Arc<ApiState>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.code, "message": self.message }));
        (self.status, body).into_response()
    }
}

impl From<PurchaseError> for ApiError {
    fn from(e: PurchaseError) -> Self {
        let status = match &e {
            PurchaseError::InvalidBid { .. } => StatusCode::BAD_REQUEST,
            PurchaseError::PurchaseInProgress(_) | PurchaseError::AlreadyPurchased(_) => {
                StatusCode::CONFLICT
            }
            PurchaseError::InsufficientFunds { .. } => StatusCode::PAYMENT_REQUIRED,
            PurchaseError::PurchaseFailed(_) => StatusCode::BAD_GATEWAY,
            PurchaseError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            PurchaseError::ItemNotFound(_) => StatusCode::NOT_FOUND,
        };
        Self::new(status, e.code(), e.to_string())
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        let status = match e {
            RegistryError::Conflict(_) => StatusCode::CONFLICT,
            RegistryError::NotRunning(_) => StatusCode::NOT_FOUND,
        };
        Self::new(status, e.code(), e.to_string())
    }
}

impl From<ConfigError> for ApiError {
    fn from(e: ConfigError) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_config", e.to_string())
    }
}

impl From<MarketError> for ApiError {
    fn from(e: MarketError) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, "marketplace_error", e.to_string())
    }
}

impl From<WalletError> for ApiError {
    fn from(e: WalletError) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, "wallet_error", e.to_string())
    }
}

fn parse_class(raw: &str) -> Result<ItemClass, ApiError> {
    raw.parse()
        .map_err(|e: anyhow::Error| ApiError::new(StatusCode::BAD_REQUEST, "invalid_class", e.to_string()))
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub max_price_ton: Decimal,
    #[serde(default)]
    pub interval_sec: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct StartResponse {
    pub status: &'static str,
    pub monitor: MonitorStatus,
    pub balance: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct BuyRequest {
    pub item_id: String,
    /// Defaults to the current asking price.
    #[serde(default)]
    pub bid_ton: Option<Decimal>,
}

#[derive(Debug, Serialize)]
pub struct BuyResponse {
    pub status: &'static str,
    pub tx: String,
    pub receipt: PurchaseReceipt,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub monitors: BTreeMap<&'static str, MonitorStatus>,
    pub in_flight: usize,
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// POST /monitor/:class/start
///
/// Refuses to start when the wallet cannot cover the cheapest item that is
/// currently eligible under the requested ceiling.
pub async fn start_monitor(
    State(state): State<AppState>,
    Path(class): Path<String>,
    Json(req): Json<StartRequest>,
) -> Result<(StatusCode, Json<StartResponse>), ApiError> {
    let class = parse_class(&class)?;
    let interval = req.interval_sec.unwrap_or(state.default_interval_secs);
    let config = MonitorConfig::new(class, req.max_price_ton, interval)?;

    let guard = state.registry.guard();
    let mut items = guard.market().list(class).await?;
    guard.overlay(&mut items);
    let balance = guard.wallet().balance().await?;

    if let Some(min) = cheapest(&items, config.max_price()) {
        if balance < min {
            warn!(class = %class, balance = %balance, cheapest = %min, "Refusing to start monitor");
            return Err(ApiError::new(
                StatusCode::PAYMENT_REQUIRED,
                "insufficient_balance_for_monitoring",
                format!("Balance {balance} TON is below the cheapest eligible item at {min} TON"),
            ));
        }
    }

    let monitor = state.registry.start(config).await?;
    info!(class = %class, ceiling = %req.max_price_ton, interval_secs = interval, "Monitor start accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(StartResponse {
            status: "started",
            monitor,
            balance,
        }),
    ))
}

/// POST /monitor/:class/stop
pub async fn stop_monitor(
    State(state): State<AppState>,
    Path(class): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let class = parse_class(&class)?;
    let status = match state.registry.stop(class).await? {
        StopOutcome::Stopped => "stopped",
        StopOutcome::TimedOut => "stop_timed_out",
    };
    Ok(Json(json!({ "status": status, "class": class })))
}

/// POST /buy/:class
pub async fn buy(
    State(state): State<AppState>,
    Path(class): Path<String>,
    Json(req): Json<BuyRequest>,
) -> Result<Json<BuyResponse>, ApiError> {
    let class = parse_class(&class)?;
    let guard = state.registry.guard();

    let item = guard
        .market()
        .fetch_item(class, &req.item_id)
        .await?
        .filter(|item| item.is_listed())
        .ok_or_else(|| PurchaseError::ItemNotFound(req.item_id.clone()))?;

    let bid = req.bid_ton.unwrap_or(item.price);
    let receipt = guard.purchase(&item, bid).await?;
    Ok(Json(BuyResponse {
        status: "sent",
        tx: receipt.tx_ref.clone(),
        receipt,
    }))
}

/// GET /items/:class
pub async fn list_items(
    State(state): State<AppState>,
    Path(class): Path<String>,
) -> Result<Json<Vec<Item>>, ApiError> {
    let class = parse_class(&class)?;
    let guard = state.registry.guard();
    let mut items = guard.market().list(class).await?;
    guard.overlay(&mut items);
    items.sort_by(|a, b| a.price.cmp(&b.price).then_with(|| a.id.cmp(&b.id)));
    Ok(Json(items))
}

/// GET /wallet
pub async fn wallet(State(state): State<AppState>) -> Result<Json<WalletSnapshot>, ApiError> {
    let wallet = state.registry.guard().wallet();
    Ok(Json(snapshot(wallet.as_ref()).await?))
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let monitors = state
        .registry
        .status()
        .await
        .into_iter()
        .map(|s| (s.class.as_str(), s))
        .collect();
    Json(HealthResponse {
        status: "ok",
        service: "fragment-buyer",
        monitors,
        in_flight: state.registry.guard().in_flight(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
