//! Token-bucket pacing into external vendors.
//!
//! One bucket per (vendor, resource) pair. Local pacing keeps us under the
//! vendor's own concurrent-request and request-rate caps so their 429s do
//! not drive our error budget.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateError {
    #[error("rate gate timed out waiting for tokens")]
    TimedOut,
}

/// Refill rate and burst capacity for one bucket.
#[derive(Debug, Clone, Copy)]
pub struct BucketConfig {
    pub rate_per_sec: f64,
    pub burst: f64,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            rate_per_sec: 2.0,
            burst: 4.0,
        }
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
    config: BucketConfig,
}

impl BucketState {
    fn new(config: BucketConfig) -> Self {
        Self {
            tokens: config.burst,
            last_refill: Instant::now(),
            config,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.config.rate_per_sec).min(self.config.burst);
        self.last_refill = now;
    }

    /// Take `cost` tokens, or report how long until they would be available.
    fn try_take(&mut self, cost: f64, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= cost {
            self.tokens -= cost;
            return Ok(());
        }
        let deficit = cost - self.tokens;
        Err(Duration::from_secs_f64(deficit / self.config.rate_per_sec))
    }
}

struct Bucket {
    /// FIFO turn lock: waiters queue on this tokio mutex in arrival order.
    turn: tokio::sync::Mutex<()>,
    state: Mutex<BucketState>,
}

/// Token-bucket gate keyed by (vendor, resource).
pub struct RateGate {
    default_config: BucketConfig,
    buckets: Mutex<HashMap<(String, String), Arc<Bucket>>>,
    overrides: Mutex<HashMap<String, BucketConfig>>,
}

impl RateGate {
    pub fn new(default_config: BucketConfig) -> Self {
        Self {
            default_config,
            buckets: Mutex::new(HashMap::new()),
            overrides: Mutex::new(HashMap::new()),
        }
    }

    /// Configure a vendor-specific refill rate (applies to new buckets).
    pub fn set_vendor_config(&self, vendor: &str, config: BucketConfig) {
        self.overrides
            .lock()
            .expect("rate gate overrides poisoned")
            .insert(vendor.to_string(), config);
    }

    fn bucket(&self, vendor: &str, resource: &str) -> Arc<Bucket> {
        let mut buckets = self.buckets.lock().expect("rate gate buckets poisoned");
        buckets
            .entry((vendor.to_string(), resource.to_string()))
            .or_insert_with(|| {
                let config = self
                    .overrides
                    .lock()
                    .expect("rate gate overrides poisoned")
                    .get(vendor)
                    .copied()
                    .unwrap_or(self.default_config);
                Arc::new(Bucket {
                    turn: tokio::sync::Mutex::new(()),
                    state: Mutex::new(BucketState::new(config)),
                })
            })
            .clone()
    }

    /// Block until `cost` tokens are available or `timeout` elapses.
    ///
    /// Waiters are served in arrival order; a timed-out waiter consumes no
    /// tokens and does not disturb the waiters behind it.
    pub async fn acquire(
        &self,
        vendor: &str,
        resource: &str,
        cost: f64,
        timeout: Duration,
    ) -> Result<(), GateError> {
        let bucket = self.bucket(vendor, resource);
        let deadline = Instant::now() + timeout;

        // Take our turn in the queue. Head-of-line waiters that time out
        // release the turn without taking tokens.
        let turn = tokio::time::timeout_at(deadline.into(), bucket.turn.lock())
            .await
            .map_err(|_| GateError::TimedOut)?;

        loop {
            let wait = {
                let mut state = bucket.state.lock().expect("rate bucket poisoned");
                match state.try_take(cost, Instant::now()) {
                    Ok(()) => None,
                    Err(wait) => Some(wait),
                }
            };

            let Some(wait) = wait else {
                drop(turn);
                return Ok(());
            };

            let now = Instant::now();
            if now + wait > deadline {
                debug!("rate gate timeout for {}/{}", vendor, resource);
                return Err(GateError::TimedOut);
            }
            tokio::time::sleep(wait).await;
        }
    }
}
