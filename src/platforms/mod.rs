//! External collaborators.
//!
//! Defines the `MarketplaceClient` and `WalletGateway` traits consumed by
//! the purchase engine, and provides implementations for:
//! - Fragment: listing scrape and `getBidLink` bid submission
//! - TON: balance via toncenter, payments via an external signer

pub mod fragment;
pub mod ton;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;

use crate::types::{
    BidReceipt, Item, ItemClass, MarketError, TxReceipt, WalletError, WalletSnapshot,
};

/// Abstraction over the marketplace that lists and sells items.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketplaceClient: Send + Sync {
    /// List items of a class currently offered for sale.
    async fn list(&self, class: ItemClass) -> Result<Vec<Item>, MarketError>;

    /// Fetch a single item's current listing, `None` if it is not on sale.
    async fn fetch_item(&self, class: ItemClass, item_id: &str) -> Result<Option<Item>, MarketError>;

    /// Submit a bid and receive the payment instructions for it.
    async fn submit_bid(
        &self,
        class: ItemClass,
        item_id: &str,
        amount: Decimal,
    ) -> Result<BidReceipt, MarketError>;

    /// Marketplace name for logging.
    fn name(&self) -> &str;
}

/// Abstraction over the wallet holding purchase funds.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WalletGateway: Send + Sync {
    /// Current spendable balance in TON.
    async fn balance(&self) -> Result<Decimal, WalletError>;

    /// Pay `amount` TON according to the instructions of an accepted bid.
    async fn pay(&self, amount: Decimal, bid: &BidReceipt) -> Result<TxReceipt, WalletError>;

    /// User-friendly wallet address.
    fn address(&self) -> &str;
}

/// Read a fresh balance into a snapshot.
pub async fn snapshot(wallet: &dyn WalletGateway) -> Result<WalletSnapshot, WalletError> {
    let balance = wallet.balance().await?;
    Ok(WalletSnapshot {
        address: wallet.address().to_string(),
        balance,
        fetched_at: Utc::now(),
    })
}
