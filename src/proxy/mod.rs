//! Proxy handling
//!
//! This module provides:
//! - The proxy health pool (selection, outcome reports, eviction)
//! - Proxy suppliers and the replenishment service
//! - HTTP and SOCKS5 transports (plain and tunneled) and the HTTP session used by tasks

pub mod pool;
pub mod session;
pub mod supplier;
pub mod transport;

pub use pool::{PoolStats, ProxyHealthPool, ProxyPoolConfig, ReportOutcome};
pub use session::{HttpSession, Page, SessionConfig};
pub use supplier::{
    FileSupplier, ProxySupplier, ReplenishConfig, ReplenishHandle, ReplenishService,
    StaticSupplier,
};
pub use transport::ProxyTransport;
