//! Dutch auction price schedule
//!
//! Linear decay from a start price to a floor over a fixed window. Pure
//! functions of wall-clock time; the per-order schedule is built once at
//! detection and shared read-only after that.

use alloy_primitives::U256;
use chrono::{DateTime, Duration, Utc};

use crate::config::AuctionConfig;

const BPS_DENOMINATOR: u64 = 10_000;

/// Price-decay window for one order. Prices are denominated in the order's
/// taker asset: the output amount a resolver must provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuctionSchedule {
    pub start: DateTime<Utc>,
    pub duration_secs: u64,
    pub start_price: U256,
    pub floor_price: U256,
}

impl AuctionSchedule {
    /// Build the schedule for an order: the start price asks a premium over
    /// the maker's quoted taker amount, the floor concedes a discount.
    pub fn for_order(taker_amount: U256, now: DateTime<Utc>, config: &AuctionConfig) -> Self {
        let denominator = U256::from(BPS_DENOMINATOR);
        let start_price =
            taker_amount * U256::from(BPS_DENOMINATOR + config.start_premium_bps as u64)
                / denominator;
        let floor_price =
            taker_amount * U256::from(BPS_DENOMINATOR - config.floor_discount_bps as u64)
                / denominator;

        AuctionSchedule {
            start: now,
            duration_secs: config.duration_secs,
            start_price,
            floor_price,
        }
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.start + Duration::seconds(self.duration_secs as i64)
    }

    /// Whether the decay window has fully elapsed. Existing bids stay valid
    /// after closure until a winner is selected; new bids are rejected.
    pub fn is_closed(&self, now: DateTime<Utc>) -> bool {
        now >= self.end()
    }

    /// Whether a bid timestamp falls inside the auction window.
    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp >= self.start && timestamp <= self.end()
    }

    /// Current price: linear interpolation between start and floor, clamped
    /// to the window. Monotonically non-increasing in `now`.
    pub fn current_price(&self, now: DateTime<Utc>) -> U256 {
        let elapsed = (now - self.start).num_seconds();
        if elapsed <= 0 {
            return self.start_price;
        }
        let elapsed = (elapsed as u64).min(self.duration_secs);
        if elapsed >= self.duration_secs {
            return self.floor_price;
        }

        let range = self.start_price.saturating_sub(self.floor_price);
        let decay = range * U256::from(elapsed) / U256::from(self.duration_secs);
        self.start_price - decay
    }
}
