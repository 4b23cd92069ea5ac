//! Monitor registry.
//!
//! Owns one slot per item class. Start and stop of the same class are
//! serialized by that slot's async mutex; different classes never block
//! each other.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::engine::guard::PurchaseGuard;
use crate::engine::monitor::{LoopPhase, LoopStats, MonitorLoop, MonitorRecord};
use crate::types::{ItemClass, MonitorConfig, MonitorState, RegistryError};

#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Consecutive insufficient-balance polls before a monitor self-stops.
    pub insufficient_funds_polls: u32,
    /// How long `stop` waits for a loop to exit.
    pub shutdown_timeout: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            insufficient_funds_polls: 2,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    Stopped,
    /// The loop did not exit in time; it was signalled and detached.
    TimedOut,
}

/// Snapshot of one class' monitor for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub class: ItemClass,
    pub state: MonitorState,
    /// Last known loop phase, kept after a self-stop until the slot is reused.
    pub phase: Option<LoopPhase>,
    pub config: Option<MonitorConfig>,
    pub started_at: Option<DateTime<Utc>>,
    pub stats: Option<LoopStats>,
}

impl MonitorStatus {
    fn idle(class: ItemClass) -> Self {
        Self {
            class,
            state: MonitorState::Stopped,
            phase: None,
            config: None,
            started_at: None,
            stats: None,
        }
    }
}

struct Slot {
    record: Arc<MonitorRecord>,
    stop_tx: watch::Sender<bool>,
    /// `None` while a `stop` call is waiting on the task outside the lock.
    handle: Option<JoinHandle<LoopPhase>>,
}

impl Slot {
    fn is_finished(&self) -> bool {
        self.record.phase().is_terminal()
            || self.handle.as_ref().is_some_and(|h| h.is_finished())
    }

    fn status(&self, class: ItemClass) -> MonitorStatus {
        let phase = self.record.phase();
        let state = if self.is_finished() {
            MonitorState::Stopped
        } else if phase == LoopPhase::Stopping {
            MonitorState::Stopping
        } else {
            MonitorState::Running
        };
        MonitorStatus {
            class,
            state,
            phase: Some(phase),
            config: Some(self.record.config().clone()),
            started_at: Some(self.record.started_at()),
            stats: Some(self.record.stats()),
        }
    }
}

pub struct MonitorRegistry {
    guard: Arc<PurchaseGuard>,
    settings: RegistrySettings,
    slots: HashMap<ItemClass, Mutex<Option<Slot>>>,
}

impl MonitorRegistry {
    pub fn new(guard: Arc<PurchaseGuard>, settings: RegistrySettings) -> Self {
        let slots = ItemClass::ALL
            .iter()
            .map(|c| (*c, Mutex::new(None)))
            .collect();
        Self {
            guard,
            settings,
            slots,
        }
    }

    pub fn guard(&self) -> &Arc<PurchaseGuard> {
        &self.guard
    }

    fn slot(&self, class: ItemClass) -> &Mutex<Option<Slot>> {
        // Every class gets a slot in `new`.
        &self.slots[&class]
    }

    /// Start a monitor. Fails with `Conflict` if one is already running;
    /// a self-stopped monitor's slot is reclaimed.
    pub async fn start(&self, config: MonitorConfig) -> Result<MonitorStatus, RegistryError> {
        let class = config.class();
        let mut slot = self.slot(class).lock().await;

        if let Some(existing) = slot.as_ref() {
            if !existing.is_finished() {
                return Err(RegistryError::Conflict(class));
            }
            info!(class = %class, phase = %existing.record.phase(), "Reclaiming finished monitor slot");
        }

        let record = Arc::new(MonitorRecord::new(config.clone()));
        let (stop_tx, stop_rx) = watch::channel(false);
        let monitor = MonitorLoop::new(
            config,
            self.guard.clone(),
            stop_rx,
            Arc::downgrade(&record),
            self.settings.insufficient_funds_polls,
        );
        let handle = tokio::spawn(monitor.run());

        let new_slot = Slot {
            record,
            stop_tx,
            handle: Some(handle),
        };
        let mut status = new_slot.status(class);
        // The task may not have been polled yet.
        status.state = MonitorState::Running;
        *slot = Some(new_slot);
        Ok(status)
    }

    /// Signal a monitor to stop and wait (bounded) for it to exit.
    ///
    /// The slot lock is only held to signal and to settle the slot, so
    /// status reads see `Stopping` during the wait. A monitor that does not
    /// exit in time keeps its slot until the task finishes, and `start`
    /// keeps failing with `Conflict` until then.
    pub async fn stop(&self, class: ItemClass) -> Result<StopOutcome, RegistryError> {
        let (record, mut handle) = {
            let mut slot = self.slot(class).lock().await;
            let Some(current) = slot.as_mut().filter(|s| !s.is_finished()) else {
                return Err(RegistryError::NotRunning(class));
            };
            // Another stop call already owns the wait.
            let Some(handle) = current.handle.take() else {
                return Err(RegistryError::NotRunning(class));
            };
            current.record.set_phase(LoopPhase::Stopping);
            let _ = current.stop_tx.send(true);
            (current.record.clone(), handle)
        };
        info!(class = %class, "Stop requested");

        let outcome = match tokio::time::timeout(self.settings.shutdown_timeout, &mut handle).await {
            Ok(Ok(phase)) => {
                info!(class = %class, phase = %phase, "Monitor stopped");
                StopOutcome::Stopped
            }
            Ok(Err(e)) => {
                warn!(class = %class, error = %e, "Monitor task ended abnormally");
                StopOutcome::Stopped
            }
            Err(_) => {
                warn!(
                    class = %class,
                    timeout_secs = self.settings.shutdown_timeout.as_secs(),
                    "Monitor did not exit in time; it keeps its slot until it does"
                );
                StopOutcome::TimedOut
            }
        };

        // A finished monitor may have been replaced by a new start meanwhile.
        let mut slot = self.slot(class).lock().await;
        if slot.as_ref().is_some_and(|s| Arc::ptr_eq(&s.record, &record)) {
            match outcome {
                StopOutcome::Stopped => *slot = None,
                StopOutcome::TimedOut => {
                    if let Some(current) = slot.as_mut() {
                        current.handle = Some(handle);
                    }
                }
            }
        }
        Ok(outcome)
    }

    pub async fn state(&self, class: ItemClass) -> MonitorState {
        self.status_of(class).await.state
    }

    async fn status_of(&self, class: ItemClass) -> MonitorStatus {
        let slot = self.slot(class).lock().await;
        slot.as_ref()
            .map(|s| s.status(class))
            .unwrap_or_else(|| MonitorStatus::idle(class))
    }

    /// Status of every class, in `ItemClass::ALL` order.
    pub async fn status(&self) -> Vec<MonitorStatus> {
        join_all(ItemClass::ALL.iter().map(|c| self.status_of(*c))).await
    }

    /// Signal every running monitor without waiting for it.
    pub async fn shutdown(&self) {
        for class in ItemClass::ALL {
            let slot = self.slot(*class).lock().await;
            if let Some(s) = slot.as_ref() {
                if !s.is_finished() {
                    s.record.set_phase(LoopPhase::Stopping);
                    let _ = s.stop_tx.send(true);
                    info!(class = %class, "Monitor signalled for shutdown");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platforms::{MarketplaceClient, MockMarketplaceClient, MockWalletGateway};
    use crate::types::{BidReceipt, Item, MarketError};
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use tokio_test::{assert_err, assert_ok};

    fn registry(market: MockMarketplaceClient, wallet: MockWalletGateway) -> MonitorRegistry {
        let guard = Arc::new(PurchaseGuard::new(
            Arc::new(market),
            Arc::new(wallet),
            Duration::from_secs(30),
        ));
        MonitorRegistry::new(guard, RegistrySettings::default())
    }

    fn quiet_market() -> MockMarketplaceClient {
        let mut market = MockMarketplaceClient::new();
        market.expect_list().returning(|_| Ok(Vec::new()));
        market
    }

    fn config(class: ItemClass) -> MonitorConfig {
        MonitorConfig::new(class, dec!(1000), 1).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_conflicts() {
        let reg = registry(quiet_market(), MockWalletGateway::new());

        let status = assert_ok!(reg.start(config(ItemClass::Number)).await);
        assert_eq!(status.state, MonitorState::Running);

        let err = assert_err!(reg.start(config(ItemClass::Number)).await);
        assert_eq!(err, RegistryError::Conflict(ItemClass::Number));

        // The other class is independent.
        assert_ok!(reg.start(config(ItemClass::Username)).await);
        reg.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_then_restart() {
        let reg = registry(quiet_market(), MockWalletGateway::new());

        assert_ok!(reg.start(config(ItemClass::Number)).await);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(reg.stop(ItemClass::Number).await, Ok(StopOutcome::Stopped));
        assert_eq!(reg.state(ItemClass::Number).await, MonitorState::Stopped);

        assert_ok!(reg.start(config(ItemClass::Number)).await);
        reg.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_when_not_running() {
        let reg = registry(MockMarketplaceClient::new(), MockWalletGateway::new());
        assert_eq!(
            reg.stop(ItemClass::Username).await,
            Err(RegistryError::NotRunning(ItemClass::Username))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_self_stopped_slot_is_reclaimed() {
        let mut market = MockMarketplaceClient::new();
        market
            .expect_list()
            .returning(|class| Ok(vec![Item::listed(class, "888", dec!(900))]));
        let mut wallet = MockWalletGateway::new();
        wallet.expect_balance().returning(|| Ok(dec!(50)));
        let reg = registry(market, wallet);

        assert_ok!(reg.start(config(ItemClass::Number)).await);
        tokio::time::sleep(Duration::from_secs(5)).await;

        let status = reg.status().await;
        assert_eq!(status[0].state, MonitorState::Stopped);
        assert_eq!(status[0].phase, Some(LoopPhase::SelfStopped));

        assert_eq!(
            reg.stop(ItemClass::Number).await,
            Err(RegistryError::NotRunning(ItemClass::Number))
        );
        assert_ok!(reg.start(config(ItemClass::Number)).await);
        reg.shutdown().await;
    }

    #[tokio::test]
    async fn test_status_lists_every_class() {
        let reg = registry(MockMarketplaceClient::new(), MockWalletGateway::new());
        let status = reg.status().await;
        assert_eq!(status.len(), ItemClass::ALL.len());
        assert!(status.iter().all(|s| s.state == MonitorState::Stopped));
    }

    /// Lists one affordable item; bids hang until the guard times them out.
    struct SlowBidMarket;

    #[async_trait]
    impl MarketplaceClient for SlowBidMarket {
        async fn list(&self, class: ItemClass) -> Result<Vec<Item>, MarketError> {
            Ok(vec![Item::listed(class, "888", dec!(900))])
        }

        async fn fetch_item(&self, _class: ItemClass, _id: &str) -> Result<Option<Item>, MarketError> {
            Ok(None)
        }

        async fn submit_bid(
            &self,
            _class: ItemClass,
            _item_id: &str,
            _amount: Decimal,
        ) -> Result<BidReceipt, MarketError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(MarketError::Rejected("auction ended".into()))
        }

        fn name(&self) -> &str {
            "slow-bid"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_stop_keeps_class_reserved() {
        let mut wallet = MockWalletGateway::new();
        wallet.expect_balance().returning(|| Ok(dec!(5000)));
        wallet.expect_pay().never();
        let guard = Arc::new(PurchaseGuard::new(
            Arc::new(SlowBidMarket),
            Arc::new(wallet),
            Duration::from_secs(30),
        ));
        let reg = Arc::new(MonitorRegistry::new(
            guard.clone(),
            RegistrySettings {
                insufficient_funds_polls: 2,
                shutdown_timeout: Duration::from_secs(1),
            },
        ));

        assert_ok!(reg.start(config(ItemClass::Number)).await);
        // First poll at t=1s; its bid is now hanging.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(guard.in_flight(), 1);

        let stopper = tokio::spawn({
            let reg = reg.clone();
            async move { reg.stop(ItemClass::Number).await }
        });
        tokio::task::yield_now().await;

        // The slot lock is free while stop waits.
        assert_eq!(reg.state(ItemClass::Number).await, MonitorState::Stopping);

        assert_eq!(stopper.await.unwrap(), Ok(StopOutcome::TimedOut));
        assert_eq!(reg.state(ItemClass::Number).await, MonitorState::Stopping);
        assert_eq!(
            reg.start(config(ItemClass::Number)).await.unwrap_err(),
            RegistryError::Conflict(ItemClass::Number)
        );
        assert_eq!(guard.in_flight(), 1);

        // The guard times the bid out at t=31s; the loop then sees its stop signal.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(guard.in_flight(), 0);
        assert_eq!(reg.state(ItemClass::Number).await, MonitorState::Stopped);
        assert_ok!(reg.start(config(ItemClass::Number)).await);
        reg.shutdown().await;
    }
}
