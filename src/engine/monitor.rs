//! Monitor loop.
//!
//! One periodic task per item class: sleep, list, filter by ceiling, buy
//! the cheapest eligible items through the `PurchaseGuard`. Cancellation
//! is cooperative; the loop observes its stop channel after every sleep
//! and before every purchase attempt, and an attempt already in flight is
//! always allowed to finish.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::engine::guard::PurchaseGuard;
use crate::strategy::{eligible, FundsDebounce, PollFunding};
use crate::types::{ItemStatus, MonitorConfig, PurchaseError};

// ---------------------------------------------------------------------------
// Phase and statistics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopPhase {
    Created,
    Running,
    Stopping,
    Stopped,
    /// Terminated on its own after repeated insufficient balance.
    SelfStopped,
}

impl LoopPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LoopPhase::Stopped | LoopPhase::SelfStopped)
    }
}

impl fmt::Display for LoopPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoopPhase::Created => "created",
            LoopPhase::Running => "running",
            LoopPhase::Stopping => "stopping",
            LoopPhase::Stopped => "stopped",
            LoopPhase::SelfStopped => "self_stopped",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LoopStats {
    pub polls: u64,
    pub attempts: u64,
    pub purchases: u64,
    pub insufficient_polls: u32,
    pub last_error: Option<String>,
    pub last_poll_at: Option<DateTime<Utc>>,
}

/// Shared state record of one monitor. The registry owns the `Arc`; the
/// loop only holds a `Weak`, so dropping the record stops the loop.
#[derive(Debug)]
pub struct MonitorRecord {
    config: MonitorConfig,
    started_at: DateTime<Utc>,
    inner: Mutex<RecordInner>,
}

#[derive(Debug)]
struct RecordInner {
    phase: LoopPhase,
    stats: LoopStats,
}

impl MonitorRecord {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            started_at: Utc::now(),
            inner: Mutex::new(RecordInner {
                phase: LoopPhase::Created,
                stats: LoopStats::default(),
            }),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn phase(&self) -> LoopPhase {
        self.inner.lock().phase
    }

    pub fn set_phase(&self, phase: LoopPhase) {
        self.inner.lock().phase = phase;
    }

    pub fn stats(&self) -> LoopStats {
        self.inner.lock().stats.clone()
    }

    fn update(&self, f: impl FnOnce(&mut LoopStats)) {
        f(&mut self.inner.lock().stats);
    }
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

pub struct MonitorLoop {
    config: MonitorConfig,
    guard: Arc<PurchaseGuard>,
    stop_rx: watch::Receiver<bool>,
    record: Weak<MonitorRecord>,
    debounce: FundsDebounce,
}

impl MonitorLoop {
    pub fn new(
        config: MonitorConfig,
        guard: Arc<PurchaseGuard>,
        stop_rx: watch::Receiver<bool>,
        record: Weak<MonitorRecord>,
        insufficient_funds_polls: u32,
    ) -> Self {
        Self {
            config,
            guard,
            stop_rx,
            record,
            debounce: FundsDebounce::new(insufficient_funds_polls),
        }
    }

    /// Run until stopped or until funds run out. Returns the exit phase.
    pub async fn run(mut self) -> LoopPhase {
        let class = self.config.class();
        self.set_phase(LoopPhase::Running);
        info!(
            class = %class,
            marketplace = self.guard.market().name(),
            ceiling = %self.config.max_price(),
            interval_secs = self.config.interval_secs(),
            "Monitor started"
        );

        let exit = loop {
            if self.stop_requested() {
                break LoopPhase::Stopped;
            }

            if self.sleep_interval().await || self.stop_requested() {
                break LoopPhase::Stopped;
            }

            self.poll().await;

            if self.debounce.exhausted() {
                warn!(
                    class = %class,
                    polls = self.debounce.consecutive(),
                    "Balance insufficient on consecutive polls; monitor stopping"
                );
                break LoopPhase::SelfStopped;
            }
        };

        self.set_phase(exit);
        info!(class = %class, phase = %exit, "Monitor exited");
        exit
    }

    /// Sleep one interval. Returns `true` if a stop arrived meanwhile.
    async fn sleep_interval(&mut self) -> bool {
        let sleep = tokio::time::sleep(self.config.interval());
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return false,
                changed = self.stop_rx.changed() => {
                    // Sender gone: nobody can restart us, treat as stop.
                    if changed.is_err() || *self.stop_rx.borrow() {
                        return true;
                    }
                }
            }
        }
    }

    /// One list → filter → buy pass.
    async fn poll(&mut self) {
        let class = self.config.class();

        let mut items = match self.guard.market().list(class).await {
            Ok(items) => items,
            Err(e) => {
                if e.is_transient() {
                    warn!(class = %class, error = %e, "Listing failed; retrying next poll");
                } else {
                    error!(class = %class, error = %e, "Listing unreadable; retrying next poll");
                }
                self.update(|s| {
                    s.polls += 1;
                    s.last_poll_at = Some(Utc::now());
                    s.last_error = Some(e.to_string());
                });
                self.record_funding(PollFunding::Idle);
                return;
            }
        };

        self.guard.overlay(&mut items);
        let ceiling = self.config.max_price();
        // An eligible item held by another purchase counts as funded.
        let held = items
            .iter()
            .any(|i| i.status == ItemStatus::PurchaseInProgress && i.price <= ceiling);
        if held {
            debug!(class = %class, "Eligible item locked by another purchase");
            self.record_funding(PollFunding::Covered);
        }
        let candidates = eligible(items, ceiling);
        debug!(class = %class, eligible = candidates.len(), "Poll complete");
        self.update(|s| {
            s.polls += 1;
            s.last_poll_at = Some(Utc::now());
        });

        if candidates.is_empty() {
            self.record_funding(PollFunding::Idle);
            return;
        }

        for item in candidates {
            if self.stop_requested() {
                debug!(class = %class, "Stop observed; skipping remaining items");
                return;
            }

            self.update(|s| s.attempts += 1);
            match self.guard.purchase(&item, item.price).await {
                Ok(receipt) => {
                    info!(class = %class, item_id = %item.id, "Monitor purchased {receipt}");
                    self.update(|s| s.purchases += 1);
                    self.record_funding(PollFunding::Covered);
                }
                Err(PurchaseError::PurchaseInProgress(_)) | Err(PurchaseError::AlreadyPurchased(_)) => {
                    debug!(class = %class, item_id = %item.id, "Item held elsewhere; skipping");
                    self.record_funding(PollFunding::Covered);
                }
                Err(e @ PurchaseError::InsufficientFunds { .. }) => {
                    // Items are sorted cheapest first; nothing dearer is affordable.
                    self.record_funding(PollFunding::Short);
                    info!(
                        class = %class,
                        item_id = %item.id,
                        consecutive = self.debounce.consecutive(),
                        threshold = self.debounce.threshold(),
                        "{e}"
                    );
                    self.update(|s| s.last_error = Some(e.to_string()));
                    return;
                }
                Err(e) => {
                    error!(class = %class, item_id = %item.id, code = e.code(), error = %e, "Purchase attempt failed");
                    self.update(|s| s.last_error = Some(e.to_string()));
                }
            }
        }
    }

    /// Feed the debounce and mirror its counter into the stats.
    fn record_funding(&mut self, poll: PollFunding) {
        self.debounce.record(poll);
        let consecutive = self.debounce.consecutive();
        self.update(|s| s.insufficient_polls = consecutive);
    }

    fn stop_requested(&self) -> bool {
        *self.stop_rx.borrow() || self.record.strong_count() == 0
    }

    fn set_phase(&self, phase: LoopPhase) {
        if let Some(record) = self.record.upgrade() {
            record.set_phase(phase);
        }
    }

    fn update(&self, f: impl FnOnce(&mut LoopStats)) {
        if let Some(record) = self.record.upgrade() {
            record.update(f);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
