//! Bid registry
//!
//! One book per order, guarded by its own async mutex so concurrent
//! resolver submissions and winner selection serialize per order. Books are
//! in-memory; only the winning resolver id outlives the auction (persisted
//! on the order).

use std::cmp::Ordering;
use std::sync::Arc;

use alloy_primitives::U256;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::auction::AuctionSchedule;
use crate::config::ResolverConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::gateway::LedgerPair;
use crate::types::{Bid, LedgerSide, Order, OrderId, PartialFillPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BookState {
    Open,
    Locked,
}

struct OrderBook {
    schedule: AuctionSchedule,
    remaining: U256,
    partial: PartialFillPolicy,
    state: BookState,
    bids: Vec<Bid>,
}

/// Read-only view of an open auction, handed to resolver loops.
#[derive(Debug, Clone)]
pub struct AuctionView {
    pub order_id: OrderId,
    pub schedule: AuctionSchedule,
    pub remaining: U256,
    pub partial: PartialFillPolicy,
}

pub struct BidRegistry {
    pair: Arc<LedgerPair>,
    books: DashMap<OrderId, Arc<Mutex<OrderBook>>>,
}

impl BidRegistry {
    pub fn new(pair: Arc<LedgerPair>) -> Self {
        BidRegistry {
            pair,
            books: DashMap::new(),
        }
    }

    /// Open the book when an order enters its auction.
    pub fn open_auction(&self, order: &Order, schedule: AuctionSchedule) {
        self.books.insert(
            order.id,
            Arc::new(Mutex::new(OrderBook {
                schedule,
                remaining: order.remaining_amount,
                partial: order.partial_fill,
                state: BookState::Open,
                bids: Vec::new(),
            })),
        );
        debug!("Auction book opened for order {}", order.id);
    }

    fn book(&self, order_id: &OrderId) -> Option<Arc<Mutex<OrderBook>>> {
        self.books.get(order_id).map(|entry| entry.value().clone())
    }

    /// Validate and append a bid. The resolver's funding is read live from
    /// the destination ledger before the book lock is taken.
    pub async fn submit_bid(&self, resolver: &ResolverConfig, bid: Bid) -> RelayerResult<()> {
        let book = match self.book(&bid.order_id) {
            Some(book) => book,
            None => {
                crate::metrics::record_bid_rejected("no_auction");
                return Err(RelayerError::BidRejected(format!(
                    "no open auction for order {}",
                    bid.order_id
                )));
            }
        };

        if bid.input_amount.is_zero() || bid.output_amount.is_zero() {
            crate::metrics::record_bid_rejected("zero_amount");
            return Err(RelayerError::BidRejected(
                "bid amounts must be non-zero".to_string(),
            ));
        }

        let funding = self
            .pair
            .balance(LedgerSide::Destination, &resolver.address)
            .await?;

        let mut book = book.lock().await;
        if book.state != BookState::Open {
            crate::metrics::record_bid_rejected("locked");
            return Err(RelayerError::BidRejected(format!(
                "bidding closed for order {}",
                bid.order_id
            )));
        }
        if !book.schedule.contains(bid.timestamp) {
            crate::metrics::record_bid_rejected("window");
            return Err(RelayerError::BidRejected(format!(
                "bid timestamp outside auction window for order {}",
                bid.order_id
            )));
        }

        let full_fill = bid.input_amount == book.remaining;
        let valid_partial = book.partial.allowed
            && bid.input_amount >= book.partial.min_fill
            && bid.input_amount <= book.remaining;
        if !full_fill && !valid_partial {
            crate::metrics::record_bid_rejected("fill_bounds");
            return Err(RelayerError::BidRejected(format!(
                "fill amount {} outside policy for order {}",
                bid.input_amount, bid.order_id
            )));
        }

        // The winner deposits the output amount on the destination ledger.
        if funding < bid.output_amount {
            crate::metrics::record_bid_rejected("funding");
            return Err(RelayerError::InsufficientFunds {
                ledger: LedgerSide::Destination,
                have: funding.to_string(),
                need: bid.output_amount.to_string(),
            });
        }

        // One live bid per resolver per order.
        for existing in book.bids.iter_mut() {
            if existing.resolver == bid.resolver {
                existing.active = false;
            }
        }

        debug!(
            "Bid accepted on order {}: resolver={} input={} output={}",
            bid.order_id, bid.resolver, bid.input_amount, bid.output_amount
        );
        crate::metrics::record_bid_submitted(&bid.resolver);
        book.bids.push(bid);
        Ok(())
    }

    /// Lock the book and pick the winner: best output/input ratio for the
    /// originator, ties by earliest timestamp then resolver id. Returns
    /// `None` when no active bids exist.
    pub async fn select_winner(&self, order_id: &OrderId) -> Option<Bid> {
        let book = self.book(order_id)?;
        let mut book = book.lock().await;
        book.state = BookState::Locked;

        let winner_id = {
            let mut active = book.bids.iter().filter(|bid| bid.active);
            let mut best = active.next()?;
            for bid in active {
                if outbids(bid, best) {
                    best = bid;
                }
            }
            best.id
        };

        let mut winner = None;
        for bid in book.bids.iter_mut() {
            if bid.id == winner_id {
                winner = Some(bid.clone());
            } else {
                bid.active = false;
            }
        }

        if let Some(ref bid) = winner {
            info!(
                "Winner selected for order {}: resolver={} input={} output={}",
                order_id, bid.resolver, bid.input_amount, bid.output_amount
            );
        }
        winner
    }

    /// Drop the book once the order leaves the bidding phase for good.
    pub fn close(&self, order_id: &OrderId) {
        self.books.remove(order_id);
    }

    /// Snapshot of every book still accepting bids.
    pub async fn open_auctions(&self) -> Vec<AuctionView> {
        let handles: Vec<(OrderId, Arc<Mutex<OrderBook>>)> = self
            .books
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        let mut views = Vec::new();
        for (order_id, book) in handles {
            let book = book.lock().await;
            if book.state == BookState::Open {
                views.push(AuctionView {
                    order_id,
                    schedule: book.schedule,
                    remaining: book.remaining,
                    partial: book.partial,
                });
            }
        }
        views
    }

    pub async fn active_bids(&self, order_id: &OrderId) -> Vec<Bid> {
        match self.book(order_id) {
            Some(book) => {
                let book = book.lock().await;
                book.bids.iter().filter(|bid| bid.active).cloned().collect()
            }
            None => Vec::new(),
        }
    }
}

/// Whether `a` beats `b` under the selection rule.
fn outbids(a: &Bid, b: &Bid) -> bool {
    let cross = match (
        a.output_amount.checked_mul(b.input_amount),
        b.output_amount.checked_mul(a.input_amount),
    ) {
        (Some(left), Some(right)) => left.cmp(&right),
        // Amounts too large to cross-multiply; integer ratios decide.
        _ => (a.output_amount / a.input_amount).cmp(&(b.output_amount / b.input_amount)),
    };

    match cross {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => match a.timestamp.cmp(&b.timestamp) {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => a.resolver < b.resolver,
        },
    }
}
