//! Fusion Relayer - Cross-chain HTLC swap coordination
//!
//! Watches a source/destination ledger pair, auctions observed swap intents
//! to a resolver set, funds the paired hash-time-locked escrows, and drives
//! every order to settlement or refund.

use alloy_primitives::U256;
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

mod api;
mod auction;
mod bids;
mod config;
mod coordination;
mod error;
mod events;
mod gateway;
mod metrics;
mod resolver;
mod state;
#[cfg(test)]
mod testkit;
mod types;
mod watcher;

use bids::BidRegistry;
use config::{GatewayMode, Settings, StoreBackend};
use coordination::{SwapEngine, TimeoutMonitor};
use gateway::sim::SimulatedLedger;
use gateway::LedgerPair;
use metrics::MetricsServer;
use resolver::ResolverPool;
use state::{MemoryStore, PgSwapStore, SwapStore};
use types::LedgerSide;
use watcher::LedgerWatcher;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Fusion Relayer v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Coordinating pair {} -> {}",
        settings.pair.source.name, settings.pair.destination.name
    );

    // Initialize the persistence backend
    let store: Arc<dyn SwapStore> = match settings.database.backend {
        StoreBackend::Postgres => {
            let pg = PgSwapStore::new(&settings.database).await?;
            pg.run_migrations().await?;
            info!("Database connection established, migrations complete");
            Arc::new(pg)
        }
        StoreBackend::Memory => {
            warn!("In-memory store selected; state will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };

    // Initialize the ledger gateways
    let pair = match settings.pair.mode {
        GatewayMode::Simulation => {
            let source = Arc::new(SimulatedLedger::new(
                LedgerSide::Source,
                &settings.pair.source.name,
                true,
            ));
            let destination = Arc::new(SimulatedLedger::new(
                LedgerSide::Destination,
                &settings.pair.destination.name,
                false,
            ));
            // Resolver working capital lives on the destination side.
            for resolver in &settings.resolvers {
                destination.credit(
                    &resolver.address,
                    U256::from(settings.pair.sim_initial_balance),
                );
            }
            Arc::new(LedgerPair::new(
                source,
                destination,
                &settings.pair,
                &settings.relayer,
            ))
        }
    };
    info!("Ledger gateways initialized (simulation mode)");

    // Auction book and the in-process resolver set
    let registry = Arc::new(BidRegistry::new(pair.clone()));
    let resolver_pool = Arc::new(ResolverPool::new(&settings, registry.clone(), pair.clone()));

    // Swap engine, with recovery of anything left open by the last run
    let engine = Arc::new(SwapEngine::new(
        &settings,
        pair.clone(),
        store.clone(),
        registry.clone(),
    ));
    let resumed = engine.resume_open_orders().await?;
    if resumed > 0 {
        info!("Recovered {} open orders", resumed);
    }

    // Timeout monitor for due and stranded escrows
    let monitor = Arc::new(TimeoutMonitor::new(
        &settings.relayer,
        pair.clone(),
        store.clone(),
        engine.clone(),
    ));

    // One watcher per ledger side
    let source_watcher = Arc::new(
        LedgerWatcher::new(pair.clone(), store.clone(), LedgerSide::Source).await?,
    );
    let destination_watcher = Arc::new(
        LedgerWatcher::new(pair.clone(), store.clone(), LedgerSide::Destination).await?,
    );

    // Start API server
    let api_state = api::AppState {
        instance_id: settings.relayer.instance_id.clone(),
        started_at: Utc::now(),
        store: store.clone(),
        engine: engine.clone(),
        monitor: monitor.clone(),
        pair: pair.clone(),
    };
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        async move {
            if let Err(e) = api::run_server(config, api_state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // The engine loop starts before the watchers so the first polled
    // events find a subscriber on the bus.
    let engine_handle = tokio::spawn(engine.clone().run());

    // Start watchers
    let source_watcher_handle = tokio::spawn({
        let watcher = source_watcher.clone();
        async move { watcher.run().await }
    });
    let destination_watcher_handle = tokio::spawn({
        let watcher = destination_watcher.clone();
        async move { watcher.run().await }
    });

    // Start resolver bidding loops
    let resolver_handles = resolver_pool.spawn_loops();

    // Start the timeout monitor
    let monitor_handle = tokio::spawn({
        let monitor = monitor.clone();
        async move { monitor.run().await }
    });

    // Health check loop
    let health_handle = tokio::spawn({
        let pair = pair.clone();
        let store = store.clone();
        let interval = settings.relayer.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;

                let mut healthy = true;
                for (ledger, ok) in pair.health_check().await {
                    if !ok {
                        warn!("Ledger {} health check failed", ledger);
                        healthy = false;
                    }
                }
                if let Err(e) = store.health_check().await {
                    warn!("Store health check failed: {}", e);
                    healthy = false;
                }

                if healthy {
                    metrics::record_health_check();
                } else {
                    metrics::record_health_check_failure();
                }
            }
        }
    });

    info!("Fusion Relayer is running");
    info!(
        "API server: http://{}:{}",
        settings.api.host, settings.api.port
    );
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown: stop the loops, let the resolver tasks drain
    engine.stop().await;
    monitor.stop().await;
    resolver_pool.stop().await;
    source_watcher.stop().await;
    destination_watcher.stop().await;

    let _ = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        futures::future::join_all(resolver_handles),
    )
    .await;

    // Abort background tasks
    api_handle.abort();
    engine_handle.abort();
    monitor_handle.abort();
    source_watcher_handle.abort();
    destination_watcher_handle.abort();
    health_handle.abort();
    if let Some(handle) = metrics_handle {
        handle.abort();
    }

    info!("Fusion Relayer stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,fusion_relayer=debug,sqlx=warn,hyper=warn"));

    let registry = tracing_subscriber::registry().with(filter);
    if std::env::var("FUSION_LOG_JSON").is_ok() {
        registry.with(fmt::layer().json()).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
