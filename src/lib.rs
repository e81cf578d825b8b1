//! TopHealth Crawler - adaptive task scheduler with proxy health management
//!
//! Runs crawl tasks on a pool of workers, routing every execution through a
//! randomly chosen proxy and learning from the outcome.
//!
//! ## Features
//!
//! - Randomized task queue with an in-flight cap and drain detection
//! - Per-task attempt budgets charged differently for transport and logic failures
//! - Proxy health pool with ratio-based eviction and hysteresis replenishment
//! - HTTP and SOCKS5 proxy transports, with TLS to https targets through tunnels
//! - Built-in page crawler emitting page and facility listing records as JSON lines

pub mod config;
pub mod crawl;
pub mod engine;
pub mod error;
pub mod models;
pub mod proxy;
pub mod sink;

pub use config::Config;
pub use engine::{RunReport, Scheduler, SchedulerConfig, TaskBody, TaskContext, TaskOutcome};
pub use error::{CrawlError, Result};
pub use proxy::{ProxyHealthPool, ProxyPoolConfig};
pub use sink::RecordSink;
