//! Shared fixtures for the test suites: a settings profile with fast
//! timings, simulated ledger pairs, and order builders.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::U256;
use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::config::{
    ApiConfig, AuctionConfig, BidStrategy, DatabaseConfig, GatewayMode, LedgerConfig,
    MetricsConfig, PairConfig, RelayerConfig, ResolverConfig, RiskTag, Settings, StoreBackend,
    TimelockConfig,
};
use crate::gateway::{LedgerGateway, LedgerPair};
use crate::gateway::sim::SimulatedLedger;
use crate::types::{LedgerSide, Order, OrderIntent, PartialFillPolicy, Secret};

pub const RESOLVER_ONE: &str = "resolver-one";
pub const RESOLVER_TWO: &str = "resolver-two";

const RESOLVER_FUNDING: u64 = 1_000_000;

pub fn resolver(id: &str, address: &str) -> ResolverConfig {
    ResolverConfig {
        id: id.to_string(),
        address: address.to_string(),
        strategy: BidStrategy::Aggressive { premium_bps: 30 },
        risk: RiskTag::High,
    }
}

/// Settings tuned for tests: millisecond retries, one-second auctions,
/// two-second minimum source timelocks.
pub fn settings() -> Settings {
    Settings {
        relayer: RelayerConfig {
            instance_id: "relayer-test".to_string(),
            max_retries: 3,
            retry_delay_ms: 5,
            retry_max_delay_ms: 40,
            call_timeout_ms: 500,
            escrow_attempts: 2,
            rate_limit_cooldown_secs: 1,
            refund_scan_interval_secs: 1,
            resolver_poll_interval_ms: 25,
            health_check_interval_secs: 5,
        },
        database: DatabaseConfig {
            backend: StoreBackend::Memory,
            url: String::new(),
            max_connections: 5,
            min_connections: 1,
        },
        api: ApiConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        metrics: MetricsConfig {
            enabled: false,
            port: 0,
        },
        pair: PairConfig {
            mode: GatewayMode::Simulation,
            sim_initial_balance: RESOLVER_FUNDING,
            source: LedgerConfig {
                name: "evm-sim".to_string(),
                poll_interval_ms: 25,
                confirmations: 1,
                min_timelock_secs: 2,
                max_timelock_secs: 172_800,
            },
            destination: LedgerConfig {
                name: "algo-sim".to_string(),
                poll_interval_ms: 25,
                confirmations: 1,
                min_timelock_secs: 1,
                max_timelock_secs: 86_400,
            },
        },
        auction: AuctionConfig {
            duration_secs: 1,
            start_premium_bps: 500,
            floor_discount_bps: 500,
        },
        timelocks: TimelockConfig {
            safety_margin_secs: 1,
            min_destination_window_secs: 0,
        },
        resolvers: vec![
            resolver("res-1", RESOLVER_ONE),
            ResolverConfig {
                id: "res-2".to_string(),
                address: RESOLVER_TWO.to_string(),
                strategy: BidStrategy::Conservative { discount_bps: 20 },
                risk: RiskTag::High,
            },
        ],
    }
}

pub struct SimHarness {
    pub pair: Arc<LedgerPair>,
    pub source: Arc<SimulatedLedger>,
    pub destination: Arc<SimulatedLedger>,
}

/// A ledger pair over two simulated ledgers, with both test resolvers
/// funded on the destination side.
pub fn sim_pair() -> SimHarness {
    let settings = settings();
    let source = Arc::new(SimulatedLedger::new(LedgerSide::Source, "evm-sim", true));
    let destination = Arc::new(SimulatedLedger::new(
        LedgerSide::Destination,
        "algo-sim",
        false,
    ));
    destination.credit(RESOLVER_ONE, U256::from(RESOLVER_FUNDING));
    destination.credit(RESOLVER_TWO, U256::from(RESOLVER_FUNDING));

    let source_gateway: Arc<dyn LedgerGateway> = source.clone();
    let destination_gateway: Arc<dyn LedgerGateway> = destination.clone();
    let pair = Arc::new(LedgerPair::new(
        source_gateway,
        destination_gateway,
        &settings.pair,
        &settings.relayer,
    ));

    SimHarness {
        pair,
        source,
        destination,
    }
}

/// Deterministic per-tag preimage.
pub fn secret(tag: u8) -> Secret {
    Secret::from_bytes([tag; 32])
}

pub fn intent(
    tag: u8,
    maker_amount: u64,
    taker_amount: u64,
    deadline: DateTime<Utc>,
    timelock: DateTime<Utc>,
) -> OrderIntent {
    OrderIntent {
        maker_asset: "USDC".to_string(),
        taker_asset: "ALGO".to_string(),
        maker_amount: U256::from(maker_amount),
        taker_amount: U256::from(taker_amount),
        maker_address: format!("maker-{}", tag),
        dst_address: format!("maker-dst-{}", tag),
        deadline,
        hashlock: secret(tag).hashlock(),
        timelock,
        partial_fill: PartialFillPolicy::full_only(),
    }
}

/// An order with comfortable deadlines, for tests that never reach the
/// timeout paths.
pub fn order(tag: u8, maker_amount: u64, taker_amount: u64) -> Order {
    let now = Utc::now();
    let intent = intent(
        tag,
        maker_amount,
        taker_amount,
        now + ChronoDuration::hours(1),
        now + ChronoDuration::hours(2),
    );
    Order::from_intent(intent, now)
}

/// Poll a condition until it holds or the timeout passes.
pub async fn wait_until<F, Fut>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
