//! Purchase guard.
//!
//! Serializes purchase attempts per item and gates them on a fresh wallet
//! balance. The lock set is the only structure shared between the monitor
//! loops and manual `/buy` requests; every mutation goes through
//! `try_acquire` and the `LockToken` it returns.

use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::platforms::{MarketplaceClient, WalletGateway};
use crate::types::{Item, ItemClass, ItemStatus, PurchaseError, PurchaseReceipt};

type ItemKey = (ItemClass, String);

// ---------------------------------------------------------------------------
// Lock book
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct LockBook {
    in_flight: HashSet<ItemKey>,
    /// Items bought during this process lifetime, with their tx reference.
    purchased: HashMap<ItemKey, String>,
}

/// Proof of holding the purchase lock for one item.
///
/// Dropping the token releases the lock, so every early return (and a
/// cancelled future) frees the item again.
struct LockToken<'a> {
    book: &'a Mutex<LockBook>,
    key: ItemKey,
    completed: bool,
}

impl LockToken<'_> {
    /// Mark the item purchased and release the lock in one step.
    fn complete(mut self, tx_ref: &str) {
        let mut book = self.book.lock();
        book.in_flight.remove(&self.key);
        book.purchased.insert(self.key.clone(), tx_ref.to_string());
        self.completed = true;
    }
}

impl Drop for LockToken<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.book.lock().in_flight.remove(&self.key);
        }
    }
}

// ---------------------------------------------------------------------------
// Guard
// ---------------------------------------------------------------------------

pub struct PurchaseGuard {
    market: Arc<dyn MarketplaceClient>,
    wallet: Arc<dyn WalletGateway>,
    /// Upper bound for each external call inside a purchase.
    call_timeout: Duration,
    book: Mutex<LockBook>,
}

impl PurchaseGuard {
    pub fn new(
        market: Arc<dyn MarketplaceClient>,
        wallet: Arc<dyn WalletGateway>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            market,
            wallet,
            call_timeout,
            book: Mutex::new(LockBook::default()),
        }
    }

    pub fn market(&self) -> &Arc<dyn MarketplaceClient> {
        &self.market
    }

    pub fn wallet(&self) -> &Arc<dyn WalletGateway> {
        &self.wallet
    }

    /// Buy `item` for `bid` TON.
    ///
    /// Steps:
    /// 1. Reject bids below the asking price.
    /// 2. Atomically claim the item (insert-if-absent into the lock set).
    /// 3. Read a fresh balance and refuse if it cannot cover the bid.
    /// 4. Submit the bid, then pay the returned instructions if their amount
    ///    stays within the bid.
    ///
    /// The claim is held for the whole round trip and released on every
    /// exit path. Exactly one bid and at most one payment per success.
    pub async fn purchase(&self, item: &Item, bid: Decimal) -> Result<PurchaseReceipt, PurchaseError> {
        if bid < item.price {
            return Err(PurchaseError::InvalidBid {
                bid,
                price: item.price,
            });
        }

        let token = self.try_acquire(item)?;
        debug!(class = %item.class, item_id = %item.id, bid = %bid, "Purchase lock acquired");

        let available = self.bounded("wallet balance", self.wallet.balance()).await?;
        if available < bid {
            warn!(
                class = %item.class,
                item_id = %item.id,
                needed = %bid,
                available = %available,
                "Insufficient balance for purchase"
            );
            return Err(PurchaseError::InsufficientFunds {
                needed: bid,
                available,
            });
        }

        info!(class = %item.class, item_id = %item.id, bid = %bid, "Submitting bid");

        let result = async {
            let receipt = self
                .bounded("bid submission", self.market.submit_bid(item.class, &item.id, bid))
                .await?;
            // Never pay more than was bid and checked against the balance.
            let amount = receipt.amount();
            if amount > bid || amount > available {
                return Err(PurchaseError::PurchaseFailed(format!(
                    "bid instructions ask {amount} TON for a {bid} TON bid"
                )));
            }
            self.bounded("payment", self.wallet.pay(amount, &receipt))
                .await
        }
        .await;

        let tx = match result {
            Ok(tx) => tx,
            Err(e) => {
                error!(
                    class = %item.class,
                    item_id = %item.id,
                    error = %e,
                    "Purchase failed; item released"
                );
                return Err(e);
            }
        };

        token.complete(&tx.tx_ref);

        let receipt = PurchaseReceipt {
            item_id: item.id.clone(),
            class: item.class,
            bid,
            paid: tx.amount,
            tx_ref: tx.tx_ref,
            completed_at: Utc::now(),
        };
        info!(
            class = %receipt.class,
            item_id = %receipt.item_id,
            paid = %receipt.paid,
            tx = %receipt.tx_ref,
            "Purchase complete"
        );
        Ok(receipt)
    }

    /// Claim an item for purchase. Test-and-set happens under one lock.
    fn try_acquire(&self, item: &Item) -> Result<LockToken<'_>, PurchaseError> {
        let key = (item.class, item.id.clone());
        let mut book = self.book.lock();
        if book.purchased.contains_key(&key) {
            return Err(PurchaseError::AlreadyPurchased(item.id.clone()));
        }
        if !book.in_flight.insert(key.clone()) {
            return Err(PurchaseError::PurchaseInProgress(item.id.clone()));
        }
        Ok(LockToken {
            book: &self.book,
            key,
            completed: false,
        })
    }

    /// Await an external call with the configured timeout.
    async fn bounded<T, E>(
        &self,
        what: &str,
        call: impl Future<Output = Result<T, E>>,
    ) -> Result<T, PurchaseError>
    where
        PurchaseError: From<E>,
    {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(res) => res.map_err(PurchaseError::from),
            Err(_) => Err(PurchaseError::Timeout(what.to_string())),
        }
    }

    // -- Introspection -----------------------------------------------------

    /// Status override for an item, `None` if the guard has no opinion.
    pub fn status_of(&self, class: ItemClass, item_id: &str) -> Option<ItemStatus> {
        let key = (class, item_id.to_string());
        let book = self.book.lock();
        if book.purchased.contains_key(&key) {
            Some(ItemStatus::Purchased)
        } else if book.in_flight.contains(&key) {
            Some(ItemStatus::PurchaseInProgress)
        } else {
            None
        }
    }

    /// Apply guard-owned statuses to freshly listed items.
    pub fn overlay(&self, items: &mut [Item]) {
        for item in items.iter_mut() {
            if let Some(status) = self.status_of(item.class, &item.id) {
                item.status = status;
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.book.lock().in_flight.len()
    }

    pub fn purchased(&self) -> usize {
        self.book.lock().purchased.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
