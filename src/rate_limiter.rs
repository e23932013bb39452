use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::LimiterConfig;
use crate::shutdown::Phase;
use crate::token_bucket::TokenBucket;

/// Per-client state kept by the limiter.
#[derive(Debug)]
struct Client {
    bucket: TokenBucket,
    last_seen: Instant,
}

/// Per-client token-bucket admission control.
///
/// One lock guards the whole client map; it is held only for the lookup and
/// the consume decision.
#[derive(Debug)]
pub struct RateLimiter {
    enabled: bool,
    burst: u32,
    rps: f64,
    sweep_interval: Duration,
    idle_timeout: Duration,
    clients: Mutex<HashMap<String, Client>>,
}

impl RateLimiter {
    pub fn new(config: &LimiterConfig) -> Self {
        Self {
            enabled: config.enabled,
            burst: config.burst,
            rps: config.rps,
            sweep_interval: config.sweep_interval,
            idle_timeout: config.idle_timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Admit or reject one request from `key`.
    pub fn allow(&self, key: &str) -> bool {
        if !self.enabled {
            return true;
        }

        let now = Instant::now();
        let mut clients = self.clients.lock();
        let client = clients.entry(key.to_string()).or_insert_with(|| Client {
            bucket: TokenBucket::new(self.burst, self.rps, now),
            last_seen: now,
        });
        client.last_seen = now;
        client.bucket.try_consume(now)
    }

    /// Forget clients idle for longer than the configured timeout. Returns
    /// how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut clients = self.clients.lock();
        let before = clients.len();
        clients.retain(|_, client| now.saturating_duration_since(client.last_seen) <= self.idle_timeout);
        before - clients.len()
    }

    pub fn tracked_clients(&self) -> usize {
        self.clients.lock().len()
    }

    /// Run [`sweep`](Self::sweep) on a fixed interval until the server
    /// leaves the serving phase.
    pub fn spawn_sweeper(self: &Arc<Self>, mut phase: watch::Receiver<Phase>) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = time::interval_at(
                Instant::now() + limiter.sweep_interval,
                limiter.sweep_interval,
            );
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = limiter.sweep();
                        if evicted > 0 {
                            debug!(evicted, remaining = limiter.tracked_clients(), "swept idle rate limit clients");
                        }
                    }
                    changed = phase.changed() => {
                        if changed.is_err() || *phase.borrow() != Phase::Serving {
                            break;
                        }
                    }
                }
            }
            info!("rate limit sweeper stopped");
        })
    }
}
