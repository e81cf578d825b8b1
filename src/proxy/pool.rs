//! Proxy health pool
//!
//! Tracks candidate egress proxies, their success ratio, and evicts proxies whose
//! ratio degrades below a threshold. Eviction is permanent for the lifetime of the pool.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use parking_lot::Mutex;
use rand::seq::IteratorRandom;
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use crate::models::{ProxyAddress, ProxyHealth};

/// Proxy pool configuration
#[derive(Debug, Clone)]
pub struct ProxyPoolConfig {
    /// Reports required before a proxy can be evicted
    pub min_samples: u64,
    /// Proxies whose success ratio falls below this are evicted
    pub min_success_ratio: f64,
    /// Replenishment starts when the live count drops under this
    pub replenish_floor: usize,
    /// Replenishment pauses once the live count reaches this
    pub replenish_ceiling: usize,
    /// How often a starved `acquire` re-checks the pool without a wakeup
    pub poll_interval: Duration,
}

impl Default for ProxyPoolConfig {
    fn default() -> Self {
        Self {
            min_samples: 10,
            min_success_ratio: 0.5,
            replenish_floor: 150,
            replenish_ceiling: 300,
            poll_interval: Duration::from_secs(10),
        }
    }
}

/// Result of a single outcome report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    /// Counters updated, proxy stays live
    Recorded,
    /// Counters updated and the proxy moved to the dead set
    Evicted,
    /// Proxy is dead or unknown; nothing changed
    Ignored,
}

/// Point-in-time pool counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub live: usize,
    pub dead: usize,
    pub replenishing: bool,
}

struct PoolState {
    live: HashMap<ProxyAddress, ProxyHealth>,
    dead: HashSet<ProxyAddress>,
    replenishing: bool,
    closed: bool,
}

/// Shared pool of egress proxies with health tracking.
///
/// All map mutations happen under one lock that is never held across an await.
pub struct ProxyHealthPool {
    state: Mutex<PoolState>,
    changed: Notify,
    replenish_tx: watch::Sender<bool>,
    config: ProxyPoolConfig,
}

impl ProxyHealthPool {
    pub fn new(config: ProxyPoolConfig) -> Self {
        // An empty pool is under any floor, so it starts out asking for proxies.
        let (replenish_tx, _) = watch::channel(true);
        Self {
            state: Mutex::new(PoolState {
                live: HashMap::new(),
                dead: HashSet::new(),
                replenishing: true,
                closed: false,
            }),
            changed: Notify::new(),
            replenish_tx,
            config,
        }
    }

    pub fn config(&self) -> &ProxyPoolConfig {
        &self.config
    }

    /// Wait for a live proxy and return one chosen uniformly at random.
    ///
    /// Suspends while the pool is empty. Returns `None` only after `close`.
    pub async fn acquire(&self) -> Option<ProxyAddress> {
        let mut starved = false;

        loop {
            // Register for wakeups before inspecting state so an ingest between the
            // check and the wait is not missed.
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.state.lock();
                if state.closed {
                    return None;
                }
                let mut rng = rand::thread_rng();
                if let Some(address) = state.live.keys().choose(&mut rng) {
                    if starved {
                        debug!(proxy = %address, "Proxy became available");
                    }
                    return Some(address.clone());
                }
            }

            if !starved {
                debug!("No live proxies, waiting for supplier");
                starved = true;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    /// Register a newly discovered candidate.
    ///
    /// Returns `true` if the proxy was added. Dead and already-live proxies are ignored.
    pub fn ingest(&self, address: ProxyAddress) -> bool {
        let added = {
            let mut state = self.state.lock();
            if state.closed || state.dead.contains(&address) || state.live.contains_key(&address)
            {
                false
            } else {
                state.live.insert(address.clone(), ProxyHealth::default());
                self.update_replenish(&mut state);
                true
            }
        };

        if added {
            debug!(proxy = %address, "Proxy added to pool");
            self.changed.notify_waiters();
        }
        added
    }

    /// Record the outcome of a request made through `address`
    pub fn report(&self, address: &ProxyAddress, failed: bool) -> ReportOutcome {
        let mut state = self.state.lock();

        let Some(health) = state.live.get_mut(address) else {
            return ReportOutcome::Ignored;
        };
        health.record(failed);
        let health = *health;

        if failed
            && health.total >= self.config.min_samples
            && health.ratio() < self.config.min_success_ratio
        {
            state.live.remove(address);
            state.dead.insert(address.clone());
            self.update_replenish(&mut state);
            let live = state.live.len();
            drop(state);

            warn!(
                proxy = %address,
                successes = health.successes,
                total = health.total,
                ratio = health.ratio(),
                live,
                "Evicting unhealthy proxy"
            );
            return ReportOutcome::Evicted;
        }

        ReportOutcome::Recorded
    }

    /// Stop handing out proxies and wake every pending `acquire`
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.changed.notify_waiters();
        info!("Proxy pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn dead_count(&self) -> usize {
        self.state.lock().dead.len()
    }

    pub fn is_dead(&self, address: &ProxyAddress) -> bool {
        self.state.lock().dead.contains(address)
    }

    pub fn health(&self, address: &ProxyAddress) -> Option<ProxyHealth> {
        self.state.lock().live.get(address).copied()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            live: state.live.len(),
            dead: state.dead.len(),
            replenishing: state.replenishing,
        }
    }

    /// Subscribe to the replenishment signal (`true` = supplier should discover more)
    pub fn subscribe_replenish(&self) -> watch::Receiver<bool> {
        self.replenish_tx.subscribe()
    }

    /// Apply floor/ceiling hysteresis; between the watermarks the previous state holds.
    fn update_replenish(&self, state: &mut PoolState) {
        let live = state.live.len();
        let next = if live < self.config.replenish_floor {
            true
        } else if live >= self.config.replenish_ceiling {
            false
        } else {
            state.replenishing
        };

        if next != state.replenishing {
            state.replenishing = next;
            debug!(live, replenishing = next, "Replenish signal changed");
            self.replenish_tx.send_replace(next);
        }
    }
}

impl Default for ProxyHealthPool {
    fn default() -> Self {
        Self::new(ProxyPoolConfig::default())
    }
}
