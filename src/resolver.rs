//! Resolver pool
//!
//! Configured resolver identities bid independently against open auctions.
//! Each resolver runs its own loop; the bid registry's per-order lock is
//! what makes the racing safe. Pricing is a strategy tag on the resolver,
//! applied to the live auction price.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::U256;
use chrono::Utc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bids::{AuctionView, BidRegistry};
use crate::config::{BidStrategy, ResolverConfig, RiskTag, Settings};
use crate::error::RelayerError;
use crate::gateway::LedgerPair;
use crate::types::{Bid, LedgerSide, OrderId};

const BPS_DENOMINATOR: u64 = 10_000;

/// Fallback gas figure for strategies that do not model gas.
const DEFAULT_GAS_ESTIMATE: u64 = 90_000;

impl BidStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            BidStrategy::Aggressive { .. } => "aggressive",
            BidStrategy::Conservative { .. } => "conservative",
            BidStrategy::GasAware { .. } => "gas_aware",
        }
    }

    /// Output amount offered against the given auction price.
    pub fn quote(&self, auction_price: U256) -> U256 {
        let denominator = U256::from(BPS_DENOMINATOR);
        match self {
            BidStrategy::Aggressive { premium_bps } => {
                auction_price * U256::from(BPS_DENOMINATOR + *premium_bps as u64) / denominator
            }
            BidStrategy::Conservative { discount_bps } => {
                auction_price * U256::from(BPS_DENOMINATOR - (*discount_bps as u64).min(BPS_DENOMINATOR))
                    / denominator
            }
            BidStrategy::GasAware { gas_units, bump_bps } => {
                let bumped =
                    auction_price * U256::from(BPS_DENOMINATOR + *bump_bps as u64) / denominator;
                bumped.saturating_sub(U256::from(*gas_units))
            }
        }
    }

    pub fn gas_estimate(&self) -> u64 {
        match self {
            BidStrategy::GasAware { gas_units, .. } => *gas_units,
            _ => DEFAULT_GAS_ESTIMATE,
        }
    }
}

impl RiskTag {
    /// Largest input a resolver will commit out of its live funding.
    pub fn max_commitment(&self, funding: U256) -> U256 {
        match self {
            RiskTag::Low => funding / U256::from(4u64),
            RiskTag::Medium => funding / U256::from(2u64),
            RiskTag::High => funding,
        }
    }
}

pub struct ResolverPool {
    resolvers: Vec<ResolverConfig>,
    registry: Arc<BidRegistry>,
    pair: Arc<LedgerPair>,
    poll_interval: Duration,
    running: Arc<RwLock<bool>>,
}

impl ResolverPool {
    pub fn new(settings: &Settings, registry: Arc<BidRegistry>, pair: Arc<LedgerPair>) -> Self {
        ResolverPool {
            resolvers: settings.resolvers.clone(),
            registry,
            pair,
            poll_interval: Duration::from_millis(settings.relayer.resolver_poll_interval_ms),
            running: Arc::new(RwLock::new(true)),
        }
    }

    /// Spawn one bidding loop per configured resolver.
    pub fn spawn_loops(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        self.resolvers
            .iter()
            .cloned()
            .map(|resolver| {
                let pool = Arc::clone(self);
                tokio::spawn(async move {
                    info!(
                        "Resolver {} bidding loop started (strategy={})",
                        resolver.id,
                        resolver.strategy.name()
                    );
                    pool.bidding_loop(resolver).await;
                })
            })
            .collect()
    }

    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
    }

    async fn bidding_loop(&self, resolver: ResolverConfig) {
        // Last quote per order, to avoid resubmitting an unchanged bid once
        // the decay pins at the floor.
        let mut last_quotes: HashMap<OrderId, (U256, U256)> = HashMap::new();
        let mut withdrawn: HashSet<OrderId> = HashSet::new();

        loop {
            if !*self.running.read().await {
                break;
            }

            let views = self.registry.open_auctions().await;
            let open: HashSet<OrderId> = views.iter().map(|view| view.order_id).collect();
            last_quotes.retain(|order_id, _| open.contains(order_id));
            withdrawn.retain(|order_id| open.contains(order_id));

            for view in views {
                if withdrawn.contains(&view.order_id) {
                    continue;
                }
                self.consider_bid(&resolver, &view, &mut last_quotes, &mut withdrawn)
                    .await;
            }

            tokio::time::sleep(self.poll_interval).await;
        }
        debug!("Resolver {} bidding loop stopped", resolver.id);
    }

    async fn consider_bid(
        &self,
        resolver: &ResolverConfig,
        view: &AuctionView,
        last_quotes: &mut HashMap<OrderId, (U256, U256)>,
        withdrawn: &mut HashSet<OrderId>,
    ) {
        let now = Utc::now();
        if view.schedule.is_closed(now) {
            return;
        }

        let funding = match self
            .pair
            .balance(LedgerSide::Destination, &resolver.address)
            .await
        {
            Ok(funding) => funding,
            Err(err) => {
                debug!("Resolver {} funding read failed: {}", resolver.id, err);
                return;
            }
        };

        let cap = resolver.risk.max_commitment(funding);
        let input = view.remaining.min(cap);
        if input.is_zero() {
            return;
        }
        if input < view.remaining
            && (!view.partial.allowed || input < view.partial.min_fill)
        {
            // Cannot cover the full fill and partials are off the table.
            return;
        }

        let price = view.schedule.current_price(now);
        let scaled_price = if input == view.remaining {
            price
        } else {
            price * input / view.remaining
        };
        let output = resolver.strategy.quote(scaled_price);
        if output.is_zero() {
            return;
        }

        if last_quotes.get(&view.order_id) == Some(&(input, output)) {
            return;
        }

        let bid = Bid::new(
            view.order_id,
            &resolver.id,
            input,
            output,
            resolver.strategy.gas_estimate(),
            now,
        );

        match self.registry.submit_bid(resolver, bid).await {
            Ok(()) => {
                last_quotes.insert(view.order_id, (input, output));
            }
            Err(RelayerError::InsufficientFunds { have, need, .. }) => {
                info!(
                    "Resolver {} withdrawing from order {}: funding {} below {}",
                    resolver.id, view.order_id, have, need
                );
                withdrawn.insert(view.order_id);
            }
            Err(RelayerError::BidRejected(reason)) => {
                debug!("Resolver {} bid rejected: {}", resolver.id, reason);
            }
            Err(err) => {
                warn!("Resolver {} bid failed on {}: {}", resolver.id, view.order_id, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auction::AuctionSchedule;
    use crate::testkit;

    #[test]
    fn test_strategy_quotes() {
        let price = U256::from(10_000u64);
        assert_eq!(
            BidStrategy::Aggressive { premium_bps: 30 }.quote(price),
            U256::from(10_030u64)
        );
        assert_eq!(
            BidStrategy::Conservative { discount_bps: 20 }.quote(price),
            U256::from(9_980u64)
        );
        assert_eq!(
            BidStrategy::GasAware {
                gas_units: 5,
                bump_bps: 10
            }
            .quote(price),
            U256::from(10_005u64)
        );
    }

    #[test]
    fn test_risk_commitment_caps() {
        let funding = U256::from(1_000u64);
        assert_eq!(RiskTag::Low.max_commitment(funding), U256::from(250u64));
        assert_eq!(RiskTag::Medium.max_commitment(funding), U256::from(500u64));
        assert_eq!(RiskTag::High.max_commitment(funding), funding);
    }

    #[tokio::test]
    async fn test_pool_bids_on_open_auctions() {
        let harness = testkit::sim_pair();
        let registry = Arc::new(BidRegistry::new(harness.pair.clone()));
        let settings = testkit::settings();
        let pool = Arc::new(ResolverPool::new(
            &settings,
            registry.clone(),
            harness.pair.clone(),
        ));

        let order = testkit::order(21, 1_000, 950);
        let schedule = AuctionSchedule {
            start: Utc::now(),
            duration_secs: 30,
            start_price: U256::from(980u64),
            floor_price: U256::from(900u64),
        };
        registry.open_auction(&order, schedule);

        let handles = pool.spawn_loops();
        let order_id = order.id;
        let got_bids = testkit::wait_until(
            || {
                let registry = registry.clone();
                async move { registry.active_bids(&order_id).await.len() >= 2 }
            },
            Duration::from_secs(3),
        )
        .await;
        pool.stop().await;
        for handle in handles {
            handle.abort();
        }

        assert!(got_bids, "expected both resolvers to bid");
        let bids = registry.active_bids(&order.id).await;
        let resolvers: HashSet<String> = bids.iter().map(|bid| bid.resolver.clone()).collect();
        assert!(resolvers.contains("res-1"));
        assert!(resolvers.contains("res-2"));
    }
}
