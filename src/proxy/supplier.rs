//! Proxy suppliers and the replenishment loop
//!
//! A supplier discovers candidate proxies. The replenishment service feeds them into
//! the pool whenever the pool signals that its live count fell under the floor.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::error::Result;
use crate::models::ProxyAddress;
use crate::proxy::pool::ProxyHealthPool;

/// Source of candidate proxies
#[async_trait]
pub trait ProxySupplier: Send + Sync {
    /// Discover up to `limit` candidates.
    ///
    /// May return proxies the pool already knows; the pool ignores duplicates and
    /// dead entries.
    async fn discover(&self, limit: usize) -> Result<Vec<ProxyAddress>>;

    /// Get the supplier name
    fn name(&self) -> &'static str;
}

/// Hands out a fixed list of proxies, each one once
pub struct StaticSupplier {
    remaining: Mutex<VecDeque<ProxyAddress>>,
}

impl StaticSupplier {
    pub fn new(proxies: impl IntoIterator<Item = ProxyAddress>) -> Self {
        Self {
            remaining: Mutex::new(proxies.into_iter().collect()),
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining.lock().len()
    }
}

#[async_trait]
impl ProxySupplier for StaticSupplier {
    async fn discover(&self, limit: usize) -> Result<Vec<ProxyAddress>> {
        let mut remaining = self.remaining.lock();
        let take = limit.min(remaining.len());
        Ok(remaining.drain(..take).collect())
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

/// Re-reads a proxy list file on every discovery round.
///
/// One proxy per line; blank lines and `#` comments are skipped. Lines that do not
/// parse are logged and skipped. Each entry is handed out once, so later rounds
/// move further down the file and pick up lines appended since the last read.
pub struct FileSupplier {
    path: PathBuf,
    handed_out: Mutex<HashSet<ProxyAddress>>,
}

impl FileSupplier {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            handed_out: Mutex::new(HashSet::new()),
        }
    }

    /// Entries returned by earlier rounds
    pub fn handed_out(&self) -> usize {
        self.handed_out.lock().len()
    }
}

#[async_trait]
impl ProxySupplier for FileSupplier {
    async fn discover(&self, limit: usize) -> Result<Vec<ProxyAddress>> {
        let contents = tokio::fs::read_to_string(&self.path).await?;

        let mut handed_out = self.handed_out.lock();
        let fresh: Vec<ProxyAddress> = parse_proxy_list(&contents)
            .into_iter()
            .filter(|address| handed_out.insert(address.clone()))
            .take(limit)
            .collect();
        debug!(
            fresh = fresh.len(),
            handed_out = handed_out.len(),
            "Read proxy list"
        );
        Ok(fresh)
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

/// Parse a newline-separated proxy list
pub fn parse_proxy_list(contents: &str) -> Vec<ProxyAddress> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| match ProxyAddress::parse(line) {
            Ok(address) => Some(address),
            Err(e) => {
                warn!("Skipping proxy entry {:?}: {}", line, e);
                None
            }
        })
        .collect()
}

/// Replenishment service configuration
#[derive(Debug, Clone)]
pub struct ReplenishConfig {
    /// Delay between discovery rounds while the pool keeps asking for proxies
    pub retry_interval: Duration,
}

impl Default for ReplenishConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(10),
        }
    }
}

/// Feeds supplier output into the pool while the pool signals replenish
pub struct ReplenishService {
    pool: Arc<ProxyHealthPool>,
    supplier: Arc<dyn ProxySupplier>,
    config: ReplenishConfig,
}

impl ReplenishService {
    pub fn new(
        pool: Arc<ProxyHealthPool>,
        supplier: Arc<dyn ProxySupplier>,
        config: ReplenishConfig,
    ) -> Self {
        Self {
            pool,
            supplier,
            config,
        }
    }

    /// Run the replenishment loop (call in a spawned task)
    #[instrument(skip(self, shutdown), fields(supplier = self.supplier.name()))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting proxy replenishment with {}s retry interval",
            self.config.retry_interval.as_secs()
        );

        let mut replenish_rx = self.pool.subscribe_replenish();
        let mut ticker = interval(self.config.retry_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if *replenish_rx.borrow_and_update() {
                        self.replenish_once().await;
                    }
                }
                changed = replenish_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if *replenish_rx.borrow_and_update() {
                        self.replenish_once().await;
                        ticker.reset();
                    } else {
                        debug!("Pool above ceiling, pausing discovery");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Proxy replenishment shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Run one discovery round. Returns how many proxies were added to the pool.
    pub async fn replenish_once(&self) -> usize {
        let ceiling = self.pool.config().replenish_ceiling;
        let wanted = ceiling.saturating_sub(self.pool.live_count()).max(1);

        let candidates = match self.supplier.discover(wanted).await {
            Ok(candidates) => candidates,
            Err(e) => {
                error!("Proxy discovery failed: {}", e);
                return 0;
            }
        };

        if candidates.is_empty() {
            warn!("Supplier returned no proxy candidates");
            return 0;
        }

        let offered = candidates.len();
        let added = candidates
            .into_iter()
            .filter(|candidate| self.pool.ingest(candidate.clone()))
            .count();

        info!(
            offered,
            added,
            live = self.pool.live_count(),
            dead = self.pool.dead_count(),
            "Proxy discovery round complete"
        );
        added
    }
}

/// Guard for managing replenishment lifecycle
pub struct ReplenishHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl ReplenishHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { shutdown_tx: tx }, rx)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Default for ReplenishHandle {
    fn default() -> Self {
        Self::new().0
    }
}
