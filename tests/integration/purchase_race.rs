//! Concurrent purchase scenarios against the shared guard.

use rust_decimal_macros::dec;
use std::time::Duration;

use fragment_buyer::engine::StopOutcome;
use fragment_buyer::types::{ItemClass, ItemStatus, MonitorConfig, PurchaseError};

use crate::mock_market::{number, Harness, MockMarket};

#[tokio::test(start_paused = true)]
async fn test_two_simultaneous_purchases_one_wins() {
    let item = number("X", dec!(900));
    let market = MockMarket::with_bid_delay(vec![item.clone()], Duration::from_secs(2));
    let h = Harness::new(market, dec!(5000));

    let (a, b) = tokio::join!(
        h.guard.purchase(&item, dec!(900)),
        h.guard.purchase(&item, dec!(900)),
    );

    let outcomes = [a, b];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(outcomes
        .iter()
        .any(|r| matches!(r, Err(PurchaseError::PurchaseInProgress(id)) if id == "X")));
    assert_eq!(h.wallet.payments(), 1);
    assert_eq!(h.market.bid_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_many_spawned_purchases_pay_once() {
    let item = number("88800007777", dec!(100));
    let market = MockMarket::with_bid_delay(vec![item.clone()], Duration::from_millis(500));
    let h = Harness::new(market, dec!(10000));

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let guard = h.guard.clone();
            let item = item.clone();
            tokio::spawn(async move { guard.purchase(&item, dec!(100)).await })
        })
        .collect();

    let mut successes = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => successes += 1,
            Err(PurchaseError::PurchaseInProgress(_)) | Err(PurchaseError::AlreadyPurchased(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(successes, 1);
    assert_eq!(h.wallet.payments(), 1);
    assert_eq!(h.wallet.current(), dec!(9900));
    assert_eq!(h.guard.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_completed_item_is_never_paid_twice() {
    let item = number("888", dec!(900));
    let h = Harness::new(MockMarket::new(vec![item.clone()]), dec!(5000));

    let receipt = h.guard.purchase(&item, dec!(950)).await.unwrap();
    assert_eq!(receipt.paid, dec!(950));

    let err = h.guard.purchase(&item, dec!(950)).await.unwrap_err();
    assert_eq!(err, PurchaseError::AlreadyPurchased("888".into()));
    assert_eq!(h.wallet.payments(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_manual_purchase_beats_monitor() {
    let item = number("888", dec!(900));
    let market = MockMarket::with_bid_delay(vec![item.clone()], Duration::from_secs(3));
    let h = Harness::new(market, dec!(5000));

    // Manual purchase claims the item before the monitor's first poll.
    let manual = {
        let guard = h.guard.clone();
        let item = item.clone();
        tokio::spawn(async move { guard.purchase(&item, dec!(900)).await })
    };
    tokio::task::yield_now().await;
    assert_eq!(
        h.guard.status_of(ItemClass::Number, "888"),
        Some(ItemStatus::PurchaseInProgress)
    );

    h.registry
        .start(MonitorConfig::new(ItemClass::Number, dec!(1000), 1).unwrap())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(6)).await;

    assert!(manual.await.unwrap().is_ok());
    assert_eq!(h.registry.stop(ItemClass::Number).await, Ok(StopOutcome::Stopped));

    // The monitor saw the item in progress, then purchased; it never bid.
    assert_eq!(h.market.bids_for("888"), 1);
    assert_eq!(h.wallet.payments(), 1);
}
