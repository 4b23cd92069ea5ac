//! Eligibility filter.
//!
//! Reduces a raw listing to the items a monitor may try to buy, cheapest
//! first.

use rust_decimal::Decimal;

use crate::types::Item;

/// Items that are `Listed` and priced at or below `ceiling`, ordered by
/// ascending price with ties broken by identifier.
pub fn eligible(items: Vec<Item>, ceiling: Decimal) -> Vec<Item> {
    let mut out: Vec<Item> = items
        .into_iter()
        .filter(|i| i.is_listed() && i.price <= ceiling)
        .collect();
    out.sort_by(|a, b| a.price.cmp(&b.price).then_with(|| a.id.cmp(&b.id)));
    out
}

/// Cheapest eligible price, if any item qualifies.
pub fn cheapest(items: &[Item], ceiling: Decimal) -> Option<Decimal> {
    items
        .iter()
        .filter(|i| i.is_listed() && i.price <= ceiling)
        .map(|i| i.price)
        .min()
}
