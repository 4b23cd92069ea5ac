//! End-to-end tests for the purchase engine against an in-memory
//! marketplace and wallet.

mod mock_market;
mod monitor_flow;
mod purchase_race;
