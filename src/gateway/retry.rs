//! Central retry policy for gateway calls
//!
//! Every ledger call runs under the same policy: bounded per-call timeout,
//! bounded attempts, exponential backoff for transient failures, and a
//! cool-down after repeated rate limiting that also stretches the owning
//! ledger's polling interval.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::RelayerConfig;
use crate::error::{RelayerError, RelayerResult};

/// Rate-limit strikes before a ledger is put into cool-down.
const COOLDOWN_STRIKES: u32 = 3;

/// Polling slow-down factor while a ledger is cooling down.
const COOLDOWN_POLL_FACTOR: u32 = 4;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub call_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RelayerConfig) -> Self {
        RetryPolicy {
            max_attempts: config.max_retries.max(1),
            base_delay: Duration::from_millis(config.retry_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            call_timeout: Duration::from_millis(config.call_timeout_ms),
        }
    }

    /// Exponential backoff delay before the given retry (0-based), capped.
    fn backoff_delay(&self, retry: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32 << retry.min(16));
        exp.min(self.max_delay)
    }

    /// Run `op` under this policy. Retryable errors back off and retry up to
    /// the attempt limit; rate limiting waits out the throttle cool-down
    /// first; everything else returns immediately.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        throttle: &Throttle,
        mut op: F,
    ) -> RelayerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RelayerResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            let result = match tokio::time::timeout(self.call_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(RelayerError::Timeout {
                    operation: operation.to_string(),
                }),
            };

            match result {
                Ok(value) => {
                    throttle.note_ok();
                    return Ok(value);
                }
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.max_attempts || !err.is_retryable() {
                        return Err(err);
                    }

                    let delay = if matches!(err, RelayerError::RateLimited { .. }) {
                        throttle.note_rate_limit();
                        crate::metrics::record_rate_limit(throttle.ledger_name());
                        throttle.cooldown_remaining().max(self.backoff_delay(attempt - 1))
                    } else {
                        self.backoff_delay(attempt - 1)
                    };

                    if attempt == self.max_attempts - 1 {
                        warn!(
                            "{} failed (attempt {}/{}), retrying in {:?}: {}",
                            operation, attempt, self.max_attempts, delay, err
                        );
                    } else {
                        debug!(
                            "{} failed (attempt {}/{}), retrying in {:?}: {}",
                            operation, attempt, self.max_attempts, delay, err
                        );
                    }
                    crate::metrics::record_gateway_retry(throttle.ledger_name());
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Per-ledger rate-limit bookkeeping. Repeated strikes open a cool-down
/// window during which the ledger's poll loops slow down.
pub struct Throttle {
    ledger_name: String,
    base_poll_interval: Duration,
    cooldown: Duration,
    strikes: AtomicU32,
    cooldown_until: RwLock<Option<Instant>>,
}

impl Throttle {
    pub fn new(ledger_name: &str, base_poll_interval: Duration, cooldown: Duration) -> Self {
        Throttle {
            ledger_name: ledger_name.to_string(),
            base_poll_interval,
            cooldown,
            strikes: AtomicU32::new(0),
            cooldown_until: RwLock::new(None),
        }
    }

    pub fn ledger_name(&self) -> &str {
        &self.ledger_name
    }

    pub fn note_rate_limit(&self) {
        let strikes = self.strikes.fetch_add(1, Ordering::SeqCst) + 1;
        if strikes >= COOLDOWN_STRIKES {
            let until = Instant::now() + self.cooldown;
            if let Ok(mut guard) = self.cooldown_until.write() {
                *guard = Some(until);
            }
            warn!(
                "Ledger {} rate limited {} times, cooling down for {:?}",
                self.ledger_name, strikes, self.cooldown
            );
        }
    }

    pub fn note_ok(&self) {
        self.strikes.store(0, Ordering::SeqCst);
    }

    pub fn in_cooldown(&self) -> bool {
        match self.cooldown_until.read() {
            Ok(guard) => guard.map(|until| until > Instant::now()).unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Time left in the current cool-down window, zero if none.
    pub fn cooldown_remaining(&self) -> Duration {
        match self.cooldown_until.read() {
            Ok(guard) => guard
                .map(|until| until.saturating_duration_since(Instant::now()))
                .unwrap_or(Duration::ZERO),
            Err(_) => Duration::ZERO,
        }
    }

    /// Poll interval honoring any active cool-down.
    pub fn poll_interval(&self) -> Duration {
        if self.in_cooldown() {
            self.base_poll_interval * COOLDOWN_POLL_FACTOR
        } else {
            self.base_poll_interval
        }
    }
}
