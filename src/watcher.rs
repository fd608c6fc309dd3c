//! Ledger event watcher
//!
//! One watcher per ledger side. Polls the gateway for new events from the
//! last persisted cursor, journals them, and fans them out on the event
//! bus. The engine and the timeout monitor are downstream consumers.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::error::{RelayerError, RelayerResult};
use crate::gateway::LedgerPair;
use crate::state::SwapStore;
use crate::types::LedgerSide;

pub struct LedgerWatcher {
    pair: Arc<LedgerPair>,
    store: Arc<dyn SwapStore>,
    side: LedgerSide,
    cursor: RwLock<u64>,
    running: Arc<RwLock<bool>>,
}

impl LedgerWatcher {
    pub async fn new(
        pair: Arc<LedgerPair>,
        store: Arc<dyn SwapStore>,
        side: LedgerSide,
    ) -> RelayerResult<Self> {
        // Resume from the last persisted cursor
        let cursor = store.get_checkpoint(side).await?;

        Ok(Self {
            pair,
            store,
            side,
            cursor: RwLock::new(cursor),
            running: Arc::new(RwLock::new(true)),
        })
    }

    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
    }

    /// Main polling loop
    pub async fn run(&self) {
        info!(
            "Watcher for {} starting at cursor {}",
            self.pair.ledger_name(self.side),
            *self.cursor.read().await
        );

        loop {
            if !*self.running.read().await {
                break;
            }

            match self.poll_once().await {
                Ok(count) if count > 0 => {
                    debug!(
                        "Watcher for {} processed {} events",
                        self.pair.ledger_name(self.side),
                        count
                    );
                }
                Ok(_) => {}
                Err(RelayerError::RateLimited { .. }) => {
                    self.pair.throttle(self.side).note_rate_limit();
                    crate::metrics::record_rate_limit(self.pair.ledger_name(self.side));
                }
                Err(e) => {
                    warn!(
                        "Watcher for {} poll failed: {}",
                        self.pair.ledger_name(self.side),
                        e
                    );
                }
            }

            tokio::time::sleep(self.pair.throttle(self.side).poll_interval()).await;
        }
        debug!("Watcher for {} stopped", self.pair.ledger_name(self.side));
    }

    /// One polling round. Returns the number of events processed.
    pub async fn poll_once(&self) -> RelayerResult<usize> {
        let from = *self.cursor.read().await;
        let page = self.pair.gateway(self.side).events_from(from).await?;
        self.pair.throttle(self.side).note_ok();

        if page.events.is_empty() {
            return Ok(0);
        }

        let count = page.events.len();
        for event in &page.events {
            debug!(
                "{} event at cursor {}: {}",
                self.pair.ledger_name(self.side),
                event.cursor(),
                event.name()
            );
            crate::metrics::record_event(self.pair.ledger_name(self.side), event.name());

            // Journal first, then broadcast. A send error only means no
            // subscriber is currently listening.
            if let Err(e) = self.store.store_event(event).await {
                error!("Failed to journal event: {}", e);
            }
            let _ = self.pair.event_sender().send(event.clone());
        }

        *self.cursor.write().await = page.next_cursor;
        if let Err(e) = self.store.save_checkpoint(self.side, page.next_cursor).await {
            warn!("Failed to save checkpoint: {}", e);
        }
        crate::metrics::set_watcher_cursor(self.pair.ledger_name(self.side), page.next_cursor);

        Ok(count)
    }
}
