//! Shared types for the Fragment buyer.
//!
//! These types form the data model used across the platform clients,
//! the purchase engine and the control API. Money is always `Decimal`
//! denominated in TON; nanoton conversion lives here too.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Item
// ---------------------------------------------------------------------------

/// Class of marketplace listing. Each class gets its own monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemClass {
    Number,
    Username,
}

impl ItemClass {
    /// All known classes (useful for iteration).
    pub const ALL: &'static [ItemClass] = &[ItemClass::Number, ItemClass::Username];

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemClass::Number => "number",
            ItemClass::Username => "username",
        }
    }
}

impl fmt::Display for ItemClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse a class name, singular or plural (case-insensitive).
impl std::str::FromStr for ItemClass {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "number" | "numbers" => Ok(ItemClass::Number),
            "username" | "usernames" => Ok(ItemClass::Username),
            _ => anyhow::bail!("Unknown item class: {s}"),
        }
    }
}

/// Lifecycle of a listing as seen by this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStatus {
    Listed,
    PurchaseInProgress,
    Purchased,
    Unavailable,
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemStatus::Listed => write!(f, "LISTED"),
            ItemStatus::PurchaseInProgress => write!(f, "PURCHASE_IN_PROGRESS"),
            ItemStatus::Purchased => write!(f, "PURCHASED"),
            ItemStatus::Unavailable => write!(f, "UNAVAILABLE"),
        }
    }
}

/// A purchasable marketplace listing (phone number or username).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Identifier, unique within its class (e.g. `88800001234`, `durov`).
    pub id: String,
    pub class: ItemClass,
    /// Human-readable label as shown on the listing page.
    pub label: String,
    /// Current asking price in TON.
    pub price: Decimal,
    pub status: ItemStatus,
    pub url: String,
}

impl Item {
    /// Build a listed item with a label equal to its id and no url.
    pub fn listed(class: ItemClass, id: &str, price: Decimal) -> Self {
        Self {
            id: id.to_string(),
            class,
            label: id.to_string(),
            price,
            status: ItemStatus::Listed,
            url: String::new(),
        }
    }

    pub fn is_listed(&self) -> bool {
        self.status == ItemStatus::Listed
    }
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} ({} TON, {})",
            self.class, self.label, self.price, self.status
        )
    }
}

// ---------------------------------------------------------------------------
// Monitor configuration and state
// ---------------------------------------------------------------------------

pub const MIN_INTERVAL_SECS: u64 = 1;
pub const MAX_INTERVAL_SECS: u64 = 60;

/// Parameters of one monitor loop. Validated on construction and
/// immutable afterwards; changing them requires stop + start.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorConfig {
    class: ItemClass,
    max_price: Decimal,
    interval_secs: u64,
}

impl MonitorConfig {
    pub fn new(class: ItemClass, max_price: Decimal, interval_secs: u64) -> Result<Self, ConfigError> {
        if max_price <= Decimal::ZERO {
            return Err(ConfigError::InvalidCeiling(max_price));
        }
        if !(MIN_INTERVAL_SECS..=MAX_INTERVAL_SECS).contains(&interval_secs) {
            return Err(ConfigError::InvalidInterval(interval_secs));
        }
        Ok(Self {
            class,
            max_price,
            interval_secs,
        })
    }

    pub fn class(&self) -> ItemClass {
        self.class
    }

    /// Price ceiling in TON.
    pub fn max_price(&self) -> Decimal {
        self.max_price
    }

    pub fn interval_secs(&self) -> u64 {
        self.interval_secs
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Registry-level state of a class slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MonitorState {
    Stopped,
    Running,
    Stopping,
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorState::Stopped => write!(f, "STOPPED"),
            MonitorState::Running => write!(f, "RUNNING"),
            MonitorState::Stopping => write!(f, "STOPPING"),
        }
    }
}

// ---------------------------------------------------------------------------
// Wallet and receipts
// ---------------------------------------------------------------------------

/// 1 TON = 10^9 nanotons.
pub const NANOTONS_PER_TON: Decimal = dec!(1000000000);

pub fn ton_from_nano(nano: u64) -> Decimal {
    Decimal::from(nano) / NANOTONS_PER_TON
}

/// Convert TON to nanotons, truncating sub-nanoton dust.
/// Returns `None` for negative or out-of-range amounts.
pub fn nano_from_ton(ton: Decimal) -> Option<u64> {
    (ton * NANOTONS_PER_TON).trunc().to_u64()
}

/// Point-in-time wallet balance. Never cached across polls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletSnapshot {
    pub address: String,
    pub balance: Decimal,
    pub fetched_at: DateTime<Utc>,
}

/// Payment instructions returned by the marketplace for an accepted bid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidReceipt {
    pub item_id: String,
    pub class: ItemClass,
    /// Destination wallet address for the payment.
    pub destination: String,
    pub amount_nano: u64,
    /// Base64 BOC payload to attach to the transfer (may be empty).
    pub payload: String,
}

impl BidReceipt {
    pub fn amount(&self) -> Decimal {
        ton_from_nano(self.amount_nano)
    }
}

/// Wallet-side confirmation of a submitted payment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub tx_ref: String,
    pub destination: String,
    pub amount: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of a successful purchase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseReceipt {
    pub item_id: String,
    pub class: ItemClass,
    pub bid: Decimal,
    pub paid: Decimal,
    pub tx_ref: String,
    pub completed_at: DateTime<Utc>,
}

impl fmt::Display for PurchaseReceipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} bought for {} TON (tx {})",
            self.class, self.item_id, self.paid, self.tx_ref
        )
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Failures raised by a marketplace client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MarketError {
    #[error("Marketplace transport error: {0}")]
    Transport(String),

    #[error("Marketplace authentication failed: {0}")]
    Auth(String),

    #[error("Bid rejected: {0}")]
    Rejected(String),

    #[error("Failed to parse marketplace response: {0}")]
    Parse(String),
}

impl MarketError {
    /// Transport and auth failures are worth another try on the next poll.
    pub fn is_transient(&self) -> bool {
        matches!(self, MarketError::Transport(_) | MarketError::Auth(_))
    }
}

/// Failures raised by a wallet gateway.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WalletError {
    #[error("Wallet transport error: {0}")]
    Transport(String),

    #[error("Payment failed: {0}")]
    Payment(String),
}

/// Typed outcome of a failed purchase attempt.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PurchaseError {
    #[error("Bid {bid} TON is below the current price {price} TON")]
    InvalidBid { bid: Decimal, price: Decimal },

    #[error("Purchase already in progress for {0}")]
    PurchaseInProgress(String),

    #[error("Item {0} was already purchased")]
    AlreadyPurchased(String),

    #[error("Insufficient funds: need {needed} TON, have {available} TON")]
    InsufficientFunds { needed: Decimal, available: Decimal },

    #[error("Purchase failed: {0}")]
    PurchaseFailed(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Item not found: {0}")]
    ItemNotFound(String),
}

impl PurchaseError {
    /// Stable, machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            PurchaseError::InvalidBid { .. } => "invalid_bid",
            PurchaseError::PurchaseInProgress(_) => "purchase_in_progress",
            PurchaseError::AlreadyPurchased(_) => "already_purchased",
            PurchaseError::InsufficientFunds { .. } => "insufficient_funds",
            PurchaseError::PurchaseFailed(_) => "purchase_failed",
            PurchaseError::Timeout(_) => "timeout",
            PurchaseError::ItemNotFound(_) => "item_not_found",
        }
    }
}

impl From<MarketError> for PurchaseError {
    fn from(e: MarketError) -> Self {
        PurchaseError::PurchaseFailed(e.to_string())
    }
}

impl From<WalletError> for PurchaseError {
    fn from(e: WalletError) -> Self {
        PurchaseError::PurchaseFailed(e.to_string())
    }
}

/// Monitor lifecycle errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegistryError {
    #[error("A {0} monitor is already running")]
    Conflict(ItemClass),

    #[error("No {0} monitor is running")]
    NotRunning(ItemClass),
}

impl RegistryError {
    pub fn code(&self) -> &'static str {
        match self {
            RegistryError::Conflict(_) => "conflict",
            RegistryError::NotRunning(_) => "not_running",
        }
    }
}

/// Rejected monitor parameters.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("Price ceiling must be positive, got {0}")]
    InvalidCeiling(Decimal),

    #[error("Interval must be within 1..=60 seconds, got {0}")]
    InvalidInterval(u64),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
