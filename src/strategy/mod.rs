//! Buying rules: which listed items a monitor may attempt, and when a
//! monitor should give up for lack of funds.

pub mod filter;
pub mod funds;

pub use filter::{cheapest, eligible};
pub use funds::{FundsDebounce, PollFunding};
