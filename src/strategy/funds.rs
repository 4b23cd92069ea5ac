//! Insufficient-funds debounce.
//!
//! A single short poll can be a transient balance read (a payment still
//! settling, a toncenter hiccup). A monitor only gives up after the wallet
//! could not cover the cheapest eligible item on several consecutive polls.

/// Outcome of one poll, as far as funding is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollFunding {
    /// At least one attempt was funded (success or another holder owns the lock).
    Covered,
    /// The cheapest attempt in this poll was refused for lack of funds.
    Short,
    /// Nothing was attempted (no eligible items, listing error, stop).
    Idle,
}

/// Consecutive-poll counter for insufficient balance.
#[derive(Debug, Clone)]
pub struct FundsDebounce {
    threshold: u32,
    consecutive: u32,
}

impl FundsDebounce {
    /// `threshold` of zero is treated as one: a single short poll stops.
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive: 0,
        }
    }

    /// Record a poll. Returns `true` once the threshold is reached.
    pub fn record(&mut self, poll: PollFunding) -> bool {
        match poll {
            PollFunding::Covered => self.consecutive = 0,
            PollFunding::Short => self.consecutive += 1,
            PollFunding::Idle => {}
        }
        self.exhausted()
    }

    pub fn exhausted(&self) -> bool {
        self.consecutive >= self.threshold
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }
}
