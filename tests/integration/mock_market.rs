//! In-memory marketplace and wallet for integration testing.
//!
//! Deterministic `MarketplaceClient` / `WalletGateway` implementations that
//! keep listings, bids and payments in memory and expose counters so tests
//! can assert exactly how many external calls happened.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use fragment_buyer::engine::{MonitorRegistry, PurchaseGuard, RegistrySettings};
use fragment_buyer::platforms::{MarketplaceClient, WalletGateway};
use fragment_buyer::types::*;

// ---------------------------------------------------------------------------
// Marketplace
// ---------------------------------------------------------------------------

pub struct MockMarket {
    items: Mutex<Vec<Item>>,
    /// Simulated latency of `submit_bid`.
    bid_delay: Duration,
    /// If set, every bid is rejected with this reason.
    reject_bids: Mutex<Option<String>>,
    list_calls: AtomicUsize,
    bid_calls: AtomicUsize,
    bids: Mutex<Vec<(ItemClass, String, Decimal)>>,
}

impl MockMarket {
    pub fn new(items: Vec<Item>) -> Self {
        Self::with_bid_delay(items, Duration::ZERO)
    }

    pub fn with_bid_delay(items: Vec<Item>, bid_delay: Duration) -> Self {
        Self {
            items: Mutex::new(items),
            bid_delay,
            reject_bids: Mutex::new(None),
            list_calls: AtomicUsize::new(0),
            bid_calls: AtomicUsize::new(0),
            bids: Mutex::new(Vec::new()),
        }
    }

    pub fn reject_bids(&self, reason: &str) {
        *self.reject_bids.lock().unwrap() = Some(reason.to_string());
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn bid_calls(&self) -> usize {
        self.bid_calls.load(Ordering::SeqCst)
    }

    pub fn bids_for(&self, item_id: &str) -> usize {
        self.bids
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, id, _)| id == item_id)
            .count()
    }
}

#[async_trait]
impl MarketplaceClient for MockMarket {
    async fn list(&self, class: ItemClass) -> Result<Vec<Item>, MarketError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .items
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.class == class)
            .cloned()
            .collect())
    }

    async fn fetch_item(&self, class: ItemClass, item_id: &str) -> Result<Option<Item>, MarketError> {
        Ok(self
            .items
            .lock()
            .unwrap()
            .iter()
            .find(|i| i.class == class && i.id == item_id)
            .cloned())
    }

    async fn submit_bid(
        &self,
        class: ItemClass,
        item_id: &str,
        amount: Decimal,
    ) -> Result<BidReceipt, MarketError> {
        self.bid_calls.fetch_add(1, Ordering::SeqCst);
        self.bids
            .lock()
            .unwrap()
            .push((class, item_id.to_string(), amount));

        if !self.bid_delay.is_zero() {
            tokio::time::sleep(self.bid_delay).await;
        }

        let rejection = self.reject_bids.lock().unwrap().clone();
        if let Some(reason) = rejection {
            return Err(MarketError::Rejected(reason));
        }

        Ok(BidReceipt {
            item_id: item_id.to_string(),
            class,
            destination: "EQfragment".into(),
            amount_nano: nano_from_ton(amount).unwrap(),
            payload: String::new(),
        })
    }

    fn name(&self) -> &str {
        "mock-market"
    }
}

// ---------------------------------------------------------------------------
// Wallet
// ---------------------------------------------------------------------------

pub struct MockWallet {
    balance: Mutex<Decimal>,
    payments: Mutex<Vec<TxReceipt>>,
}

impl MockWallet {
    pub fn new(balance: Decimal) -> Self {
        Self {
            balance: Mutex::new(balance),
            payments: Mutex::new(Vec::new()),
        }
    }

    pub fn current(&self) -> Decimal {
        *self.balance.lock().unwrap()
    }

    pub fn payments(&self) -> usize {
        self.payments.lock().unwrap().len()
    }
}

#[async_trait]
impl WalletGateway for MockWallet {
    async fn balance(&self) -> Result<Decimal, WalletError> {
        Ok(self.current())
    }

    async fn pay(&self, amount: Decimal, bid: &BidReceipt) -> Result<TxReceipt, WalletError> {
        let mut balance = self.balance.lock().unwrap();
        if *balance < amount {
            return Err(WalletError::Payment("insufficient balance".into()));
        }
        *balance -= amount;

        let tx = TxReceipt {
            tx_ref: Uuid::new_v4().to_string(),
            destination: bid.destination.clone(),
            amount,
            timestamp: Utc::now(),
        };
        self.payments.lock().unwrap().push(tx.clone());
        Ok(tx)
    }

    fn address(&self) -> &str {
        "UQmockwallet"
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub market: Arc<MockMarket>,
    pub wallet: Arc<MockWallet>,
    pub guard: Arc<PurchaseGuard>,
    pub registry: MonitorRegistry,
}

impl Harness {
    pub fn new(market: MockMarket, balance: Decimal) -> Self {
        Self::with_shutdown_timeout(market, balance, Duration::from_secs(10))
    }

    pub fn with_shutdown_timeout(market: MockMarket, balance: Decimal, shutdown_timeout: Duration) -> Self {
        let market = Arc::new(market);
        let wallet = Arc::new(MockWallet::new(balance));
        let guard = Arc::new(PurchaseGuard::new(
            market.clone(),
            wallet.clone(),
            Duration::from_secs(30),
        ));
        let registry = MonitorRegistry::new(
            guard.clone(),
            RegistrySettings {
                insufficient_funds_polls: 2,
                shutdown_timeout,
            },
        );
        Self {
            market,
            wallet,
            guard,
            registry,
        }
    }
}

pub fn number(id: &str, price: Decimal) -> Item {
    Item::listed(ItemClass::Number, id, price)
}

pub fn username(id: &str, price: Decimal) -> Item {
    Item::listed(ItemClass::Username, id, price)
}
