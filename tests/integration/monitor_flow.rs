//! Monitor lifecycle scenarios: ceiling, self-stop, explicit stop, conflicts.

use rust_decimal_macros::dec;
use std::time::Duration;

use fragment_buyer::engine::{LoopPhase, StopOutcome};
use fragment_buyer::types::{ItemClass, ItemStatus, MonitorConfig, MonitorState, RegistryError};

use crate::mock_market::{number, username, Harness, MockMarket};

fn config(class: ItemClass, ceiling: rust_decimal::Decimal) -> MonitorConfig {
    MonitorConfig::new(class, ceiling, 1).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_buys_within_ceiling_and_balance_drops() {
    let market = MockMarket::new(vec![number("88800000900", dec!(900)), number("88800001200", dec!(1200))]);
    let h = Harness::new(market, dec!(1500));

    h.registry.start(config(ItemClass::Number, dec!(1000))).await.unwrap();
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(h.registry.stop(ItemClass::Number).await, Ok(StopOutcome::Stopped));

    assert_eq!(h.wallet.payments(), 1);
    assert_eq!(h.wallet.current(), dec!(600));
    assert_eq!(
        h.guard.status_of(ItemClass::Number, "88800000900"),
        Some(ItemStatus::Purchased)
    );
    // Above the ceiling: never bid on, even with funds available.
    assert_eq!(h.market.bids_for("88800001200"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_self_stops_after_two_short_polls() {
    let market = MockMarket::new(vec![number("888", dec!(900))]);
    let h = Harness::new(market, dec!(50));

    h.registry.start(config(ItemClass::Number, dec!(1000))).await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;

    let status = h.registry.status().await;
    let number_status = status.iter().find(|s| s.class == ItemClass::Number).unwrap();
    assert_eq!(number_status.state, MonitorState::Stopped);
    assert_eq!(number_status.phase, Some(LoopPhase::SelfStopped));

    // Exactly two polls, no bids, item still on sale.
    assert_eq!(h.market.list_calls(), 2);
    assert_eq!(h.market.bid_calls(), 0);
    assert_eq!(h.guard.status_of(ItemClass::Number, "888"), None);

    // Slot is reclaimed: stop reports not running, start works again.
    assert_eq!(
        h.registry.stop(ItemClass::Number).await,
        Err(RegistryError::NotRunning(ItemClass::Number))
    );
    assert!(h.registry.start(config(ItemClass::Number, dec!(1000))).await.is_ok());
    h.registry.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_no_attempts_after_stop() {
    let market = MockMarket::new(vec![number("888", dec!(900))]);
    market.reject_bids("auction closed");
    let h = Harness::new(market, dec!(1500));

    h.registry.start(config(ItemClass::Number, dec!(1000))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert!(h.market.bid_calls() >= 3);

    assert_eq!(h.registry.stop(ItemClass::Number).await, Ok(StopOutcome::Stopped));
    assert_eq!(h.registry.state(ItemClass::Number).await, MonitorState::Stopped);
    let after_stop = h.market.bid_calls();

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.market.bid_calls(), after_stop);
    assert_eq!(h.wallet.payments(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_second_start_conflicts() {
    let market = MockMarket::new(Vec::new());
    let h = Harness::new(market, dec!(100));

    assert!(h.registry.start(config(ItemClass::Number, dec!(10))).await.is_ok());
    assert_eq!(
        h.registry.start(config(ItemClass::Number, dec!(20))).await.unwrap_err(),
        RegistryError::Conflict(ItemClass::Number)
    );
    assert_eq!(h.registry.state(ItemClass::Number).await, MonitorState::Running);
    h.registry.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_classes_run_independently() {
    let market = MockMarket::new(vec![number("888", dec!(900)), username("coffee", dec!(100))]);
    let h = Harness::new(market, dec!(150));

    h.registry.start(config(ItemClass::Number, dec!(1000))).await.unwrap();
    h.registry.start(config(ItemClass::Username, dec!(500))).await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;

    // The username fits the budget; the number never does.
    assert_eq!(
        h.guard.status_of(ItemClass::Username, "coffee"),
        Some(ItemStatus::Purchased)
    );
    assert_eq!(h.guard.status_of(ItemClass::Number, "888"), None);
    assert_eq!(h.wallet.current(), dec!(50));
    assert_eq!(h.registry.state(ItemClass::Number).await, MonitorState::Stopped);
    h.registry.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_slow_stop_blocks_restart_until_loop_exits() {
    let market = MockMarket::with_bid_delay(vec![number("888", dec!(900))], Duration::from_secs(20));
    let h = Harness::with_shutdown_timeout(market, dec!(1500), Duration::from_secs(1));

    h.registry.start(config(ItemClass::Number, dec!(1000))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(h.market.bid_calls(), 1);

    assert_eq!(h.registry.stop(ItemClass::Number).await, Ok(StopOutcome::TimedOut));
    assert_eq!(h.registry.state(ItemClass::Number).await, MonitorState::Stopping);
    assert_eq!(
        h.registry.start(config(ItemClass::Number, dec!(1000))).await.unwrap_err(),
        RegistryError::Conflict(ItemClass::Number)
    );

    // The in-flight bid finishes, then the loop honours the stop.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.wallet.payments(), 1);
    assert_eq!(h.registry.state(ItemClass::Number).await, MonitorState::Stopped);

    h.registry.start(config(ItemClass::Number, dec!(1000))).await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(h.market.bid_calls(), 1);
    h.registry.shutdown().await;
}
