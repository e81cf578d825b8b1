use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{CrawlError, Result};

/// Proxy protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    Http,
    Socks5,
}

impl ProxyProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyProtocol::Http => "http",
            ProxyProtocol::Socks5 => "socks5",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "http" => Some(ProxyProtocol::Http),
            "socks5" | "socks5h" => Some(ProxyProtocol::Socks5),
            _ => None,
        }
    }

    fn default_port(&self) -> u16 {
        match self {
            ProxyProtocol::Http => 80,
            ProxyProtocol::Socks5 => 1080,
        }
    }
}

impl std::fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An egress proxy endpoint.
///
/// Immutable value compared by scheme, host, port and credentials.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProxyAddress {
    pub protocol: ProxyProtocol,
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing)]
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
}

impl ProxyAddress {
    pub fn new(protocol: ProxyProtocol, host: impl Into<String>, port: u16) -> Self {
        Self {
            protocol,
            host: host.into(),
            port,
            username: None,
            password: None,
        }
    }

    /// Parse `scheme://[user:pass@]host:port` or a bare `host:port` (HTTP)
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(CrawlError::InvalidProxyAddress("empty address".into()));
        }

        let with_scheme = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("http://{}", raw)
        };

        let url = Url::parse(&with_scheme)
            .map_err(|e| CrawlError::InvalidProxyAddress(format!("{}: {}", raw, e)))?;

        // Reject URLs that carry request-specific components.
        if url.fragment().is_some() || url.query().is_some() {
            return Err(CrawlError::InvalidProxyAddress(format!(
                "{}: must not include query/fragment",
                raw
            )));
        }
        if !(url.path().is_empty() || url.path() == "/") {
            return Err(CrawlError::InvalidProxyAddress(format!(
                "{}: must not include a path",
                raw
            )));
        }

        let protocol = ProxyProtocol::from_str(url.scheme())
            .ok_or_else(|| CrawlError::UnsupportedProtocol(url.scheme().to_string()))?;

        let host = url
            .host_str()
            .ok_or_else(|| CrawlError::InvalidProxyAddress(format!("{}: missing host", raw)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        let port = url.port().unwrap_or_else(|| protocol.default_port());

        let username = if url.username().is_empty() {
            None
        } else {
            Some(url.username().to_string())
        };
        let password = username
            .as_ref()
            .map(|_| url.password().unwrap_or("").to_string());

        Ok(Self {
            protocol,
            host,
            port,
            username,
            password,
        })
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// `host:port`, with brackets around IPv6 hosts
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl std::fmt::Display for ProxyAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Credentials are never printed.
        write!(f, "{}://{}", self.protocol, self.authority())
    }
}

impl std::str::FromStr for ProxyAddress {
    type Err = CrawlError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Rolling outcome counters for one proxy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyHealth {
    pub successes: u64,
    pub total: u64,
}

impl ProxyHealth {
    pub fn record(&mut self, failed: bool) {
        self.total += 1;
        if !failed {
            self.successes += 1;
        }
    }

    /// Success ratio in `[0, 1]`; an unused proxy counts as fully healthy
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.successes as f64 / self.total as f64
        }
    }

    pub fn failures(&self) -> u64 {
        self.total - self.successes
    }
}
