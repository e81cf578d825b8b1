use crate::crawl::{CrawlSettings, DEFAULT_BLOCK_MARKERS};
use crate::engine::SchedulerConfig;
use crate::error::{CrawlError, Result};
use crate::proxy::{ProxyPoolConfig, ReplenishConfig, SessionConfig};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Scheduler configuration
    pub engine: SchedulerConfig,
    /// Proxy health pool configuration
    pub pool: ProxyPoolConfig,
    /// Proxy source configuration
    pub supplier: SupplierConfig,
    /// HTTP session configuration
    pub http: SessionConfig,
    /// Page crawler configuration
    pub crawl: CrawlConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct SupplierConfig {
    /// Proxy list file, one proxy per line
    pub proxy_file: PathBuf,
    /// Replenishment retry interval
    pub replenish: ReplenishConfig,
}

#[derive(Debug, Clone)]
pub struct CrawlConfig {
    /// Seed URLs
    pub seeds: Vec<String>,
    /// Optional file with more seed URLs, one per line
    pub seed_file: Option<PathBuf>,
    /// Link expansion settings
    pub settings: CrawlSettings,
    /// Output path for JSON lines (`-` for stdout)
    pub output: String,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let config = Config {
            engine: SchedulerConfig {
                workers: parse_env_or("CRAWL_WORKERS", 20)?,
                max_in_flight: parse_env_or("CRAWL_MAX_IN_FLIGHT", 100)?,
                initial_budget: parse_env_or("CRAWL_TASK_ATTEMPTS", 10.0)?,
                transport_decay_factor: parse_env_or("CRAWL_TRANSPORT_DECAY_FACTOR", 0.01)?,
                logic_decay: parse_env_or("CRAWL_LOGIC_DECAY", 1.0)?,
                task_timeout: Duration::from_secs(parse_env_or("CRAWL_TASK_TIMEOUT", 10)?),
                failure_backoff: Duration::from_millis(parse_env_or(
                    "CRAWL_FAILURE_BACKOFF_MS",
                    2000,
                )?),
            },
            pool: ProxyPoolConfig {
                min_samples: parse_env_or("PROXY_EVICT_MIN_SAMPLES", 10)?,
                min_success_ratio: parse_env_or("PROXY_EVICT_MIN_RATIO", 0.5)?,
                replenish_floor: parse_env_or("PROXY_REPLENISH_FLOOR", 150)?,
                replenish_ceiling: parse_env_or("PROXY_REPLENISH_CEILING", 300)?,
                poll_interval: Duration::from_secs(parse_env_or("PROXY_ACQUIRE_POLL_SECS", 10)?),
            },
            supplier: SupplierConfig {
                proxy_file: PathBuf::from(get_env_or("PROXY_SOURCE_FILE", "proxies.txt")),
                replenish: ReplenishConfig {
                    retry_interval: Duration::from_secs(parse_env_or(
                        "PROXY_SOURCE_INTERVAL_SECS",
                        10,
                    )?),
                },
            },
            http: SessionConfig {
                connect_timeout: Duration::from_secs(parse_env_or("HTTP_CONNECT_TIMEOUT", 10)?),
                request_timeout: Duration::from_secs(parse_env_or("HTTP_REQUEST_TIMEOUT", 10)?),
                user_agent: env::var("HTTP_USER_AGENT")
                    .unwrap_or_else(|_| SessionConfig::default().user_agent),
                max_body_bytes: parse_env_or("HTTP_MAX_BODY_BYTES", 8 * 1024 * 1024)?,
            },
            crawl: CrawlConfig {
                seeds: split_list(&get_env_or("CRAWL_SEEDS", "")),
                seed_file: env::var("CRAWL_SEED_FILE")
                    .ok()
                    .filter(|s| !s.trim().is_empty())
                    .map(PathBuf::from),
                settings: CrawlSettings {
                    max_depth: parse_env_or("CRAWL_MAX_DEPTH", 1)?,
                    same_host_only: parse_env_or("CRAWL_SAME_HOST_ONLY", true)?,
                    max_links_per_page: parse_env_or("CRAWL_MAX_LINKS_PER_PAGE", 100)?,
                    block_markers: match env::var("CRAWL_BLOCK_MARKERS") {
                        Ok(raw) => split_list(&raw),
                        Err(_) => DEFAULT_BLOCK_MARKERS.iter().map(|m| m.to_string()).collect(),
                    },
                },
                output: get_env_or("CRAWL_OUTPUT", "-"),
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "json"),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;

        if !(0.0..=1.0).contains(&self.pool.min_success_ratio) {
            return Err(CrawlError::InvalidConfig(format!(
                "PROXY_EVICT_MIN_RATIO must be within 0..=1, got {}",
                self.pool.min_success_ratio
            )));
        }
        if self.pool.min_samples == 0 {
            return Err(CrawlError::InvalidConfig(
                "PROXY_EVICT_MIN_SAMPLES must be at least 1".into(),
            ));
        }
        if self.pool.replenish_ceiling < self.pool.replenish_floor {
            return Err(CrawlError::InvalidConfig(format!(
                "PROXY_REPLENISH_CEILING ({}) must not be below PROXY_REPLENISH_FLOOR ({})",
                self.pool.replenish_ceiling, self.pool.replenish_floor
            )));
        }
        if !matches!(self.log.format.as_str(), "json" | "pretty") {
            return Err(CrawlError::InvalidConfig(format!(
                "LOG_FORMAT must be json or pretty, got {:?}",
                self.log.format
            )));
        }
        Ok(())
    }

    /// Seeds from `CRAWL_SEEDS` followed by those in `CRAWL_SEED_FILE`
    pub async fn load_seeds(&self) -> Result<Vec<String>> {
        let mut seeds = self.crawl.seeds.clone();
        if let Some(path) = &self.crawl.seed_file {
            let contents = tokio::fs::read_to_string(path).await?;
            seeds.extend(
                contents
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty() && !line.starts_with('#'))
                    .map(str::to_string),
            );
        }
        Ok(seeds)
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Parse an environment variable, falling back to `default` when unset
fn parse_env_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| {
            CrawlError::InvalidConfig(format!("{} has an invalid value: {:?}", key, raw))
        }),
        Err(_) => Ok(default),
    }
}

/// Split a comma-separated list, dropping empty entries
fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
