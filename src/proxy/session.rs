//! HTTP session used by task bodies
//!
//! Issues GET requests through an acquired proxy with connect and request timeouts.
//! https targets are fetched over TLS inside a tunnel opened by the proxy.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use http::header::{ACCEPT, HOST, PROXY_AUTHORIZATION, USER_AGENT};
use http::{Request, StatusCode};
use http_body_util::{BodyExt, Empty, Limited};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector;
use tracing::debug;
use url::{Host, Url};

use crate::error::{CrawlError, Result};
use crate::models::ProxyAddress;
use crate::proxy::transport::{self, ProxyTransport, RequestForm};

/// Configuration for the HTTP session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Timeout for reaching the target through the proxy, TLS included
    pub connect_timeout: Duration,
    /// Timeout for request/response
    pub request_timeout: Duration,
    /// User agent sent with every request
    pub user_agent: String,
    /// Responses larger than this are rejected
    pub max_body_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            user_agent: "Mozilla/5.0 (X11; CrOS x86_64 8172.45.0) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/51.0.2704.64 Safari/537.36"
                .to_string(),
            max_body_bytes: 8 * 1024 * 1024,
        }
    }
}

/// A fetched HTTP response
#[derive(Debug, Clone)]
pub struct Page {
    pub url: Url,
    pub status: StatusCode,
    pub body: Bytes,
}

impl Page {
    /// Body decoded as UTF-8, replacing invalid sequences
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Transport session handed to every task body
#[derive(Clone)]
pub struct HttpSession {
    config: SessionConfig,
    tls: TlsConnector,
}

impl fmt::Debug for HttpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSession")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Default for HttpSession {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl HttpSession {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            tls: transport::tls_connector(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Fetch `url` through `proxy`.
    ///
    /// Non-success statuses are returned as `CrawlError::HttpStatus`.
    pub async fn get(&self, url: &str, proxy: &ProxyAddress) -> Result<Page> {
        let url = Url::parse(url)?;
        let host = target_host(&url)?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| CrawlError::InvalidUrl(format!("{}: missing port", url)))?;

        let (status, body) = match url.scheme() {
            "http" => {
                let conn = tokio::time::timeout(
                    self.config.connect_timeout,
                    ProxyTransport::connect(proxy, &host, port),
                )
                .await??;

                let request = match conn.form {
                    RequestForm::Absolute => {
                        self.request(url.to_string(), &url, ProxyTransport::basic_auth(proxy))?
                    }
                    RequestForm::Origin => self.request(origin_form(&url), &url, None)?,
                };
                self.send(conn.stream, request).await?
            }
            "https" => {
                let stream = tokio::time::timeout(self.config.connect_timeout, async {
                    let tunnel = ProxyTransport::tunnel(proxy, &host, port).await?;
                    transport::tls_handshake(&self.tls, &host, tunnel).await
                })
                .await??;

                let request = self.request(origin_form(&url), &url, None)?;
                self.send(stream, request).await?
            }
            scheme => {
                return Err(CrawlError::UnsupportedTarget(format!(
                    "{} (unsupported scheme {:?})",
                    url, scheme
                )))
            }
        };
        debug!(url = %url, proxy = %proxy, status = status.as_u16(), bytes = body.len(), "Fetched page");

        if !status.is_success() {
            return Err(CrawlError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        Ok(Page { url, status, body })
    }

    fn request(
        &self,
        uri: String,
        url: &Url,
        proxy_auth: Option<String>,
    ) -> Result<Request<Empty<Bytes>>> {
        let mut builder = Request::builder()
            .method("GET")
            .uri(uri)
            .header(HOST, host_header(url))
            .header(USER_AGENT, self.config.user_agent.as_str())
            .header(ACCEPT, "text/html,application/xhtml+xml,application/json;q=0.9,*/*;q=0.8");

        if let Some(auth) = proxy_auth {
            builder = builder.header(PROXY_AUTHORIZATION, auth);
        }

        builder
            .body(Empty::<Bytes>::new())
            .map_err(|e| CrawlError::Internal(format!("Failed to build request: {}", e)))
    }

    /// Send one request over `stream` and collect the size-limited body
    async fn send<S>(&self, stream: S, request: Request<Empty<Bytes>>) -> Result<(StatusCode, Bytes)>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let io = TokioIo::new(stream);
        let (mut sender, connection) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| CrawlError::ProxyHandshake(format!("Handshake failed: {}", e)))?;

        // Spawn connection handler
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("Connection ended: {}", e);
            }
        });

        tokio::time::timeout(self.config.request_timeout, async {
            let response = sender.send_request(request).await?;
            let (parts, body) = response.into_parts();
            let body = Limited::new(body, self.config.max_body_bytes)
                .collect()
                .await
                .map_err(|e| CrawlError::Http(format!("Failed to read response: {}", e)))?
                .to_bytes();
            Ok::<_, CrawlError>((parts.status, body))
        })
        .await?
    }
}

/// Host to dial through the proxy, without IPv6 brackets
fn target_host(url: &Url) -> Result<String> {
    match url.host() {
        Some(Host::Domain(domain)) => Ok(domain.to_string()),
        Some(Host::Ipv4(addr)) => Ok(addr.to_string()),
        Some(Host::Ipv6(addr)) => Ok(addr.to_string()),
        None => Err(CrawlError::InvalidUrl(format!("{}: missing host", url))),
    }
}

fn origin_form(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProxyProtocol;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// One-shot HTTP proxy that records the request head and replies with `response`
    async fn spawn_fake_proxy(
        response: &'static str,
    ) -> (ProxyAddress, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let task = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                head.extend_from_slice(&buf[..n]);
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&head).into_owned()
        });

        (
            ProxyAddress::new(ProxyProtocol::Http, "127.0.0.1", port).with_credentials("u", "p"),
            task,
        )
    }

    #[test]
    fn test_request_target_forms() {
        let url = Url::parse("http://www.example.com:8080/search?q=clinic").unwrap();
        assert_eq!(origin_form(&url), "/search?q=clinic");
        assert_eq!(host_header(&url), "www.example.com:8080");

        let url = Url::parse("http://www.example.com/").unwrap();
        assert_eq!(host_header(&url), "www.example.com");
    }

    #[test]
    fn test_target_host_strips_ipv6_brackets() {
        let url = Url::parse("https://[::1]:8443/").unwrap();
        assert_eq!(target_host(&url).unwrap(), "::1");
        let url = Url::parse("https://listing.example/").unwrap();
        assert_eq!(target_host(&url).unwrap(), "listing.example");
    }

    #[tokio::test]
    async fn test_unsupported_scheme_is_rejected() {
        let session = HttpSession::default();
        let proxy = ProxyAddress::new(ProxyProtocol::Http, "127.0.0.1", 1);
        let err = session
            .get("ftp://files.example/list", &proxy)
            .await
            .unwrap_err();
        assert!(matches!(err, CrawlError::UnsupportedTarget(_)));
        assert!(!err.is_transport());
    }

    #[tokio::test]
    async fn test_https_target_is_tunneled() {
        // The proxy accepts the tunnel but nothing on the far side speaks TLS
        let (proxy, head) =
            spawn_fake_proxy("HTTP/1.1 200 Connection Established\r\n\r\n").await;

        let err = HttpSession::default()
            .get("https://listing.example/clinics?page=2", &proxy)
            .await
            .unwrap_err();
        assert!(matches!(err, CrawlError::TlsHandshake(_)), "{:?}", err);
        assert!(err.is_transport());

        let head = head.await.unwrap();
        assert!(head.starts_with("CONNECT listing.example:443 HTTP/1.1"));
        assert!(head.contains("Proxy-Authorization: Basic dTpw"));
    }

    #[tokio::test]
    async fn test_get_through_http_proxy() {
        let (proxy, head) = spawn_fake_proxy(
            "HTTP/1.1 200 OK\r\nContent-Length: 11\r\nConnection: close\r\n\r\nhello world",
        )
        .await;

        let session = HttpSession::default();
        let page = session
            .get("http://listing.example/clinics?page=2", &proxy)
            .await
            .unwrap();
        assert_eq!(page.status, StatusCode::OK);
        assert_eq!(page.text(), "hello world");

        let head = head.await.unwrap();
        assert!(head.starts_with("GET http://listing.example/clinics?page=2 HTTP/1.1"));
        assert!(head.to_lowercase().contains("proxy-authorization: basic dtpw"));
    }

    #[tokio::test]
    async fn test_error_status_is_transport_failure() {
        let (proxy, _head) = spawn_fake_proxy(
            "HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;

        let err = HttpSession::default()
            .get("http://listing.example/", &proxy)
            .await
            .unwrap_err();
        assert!(matches!(err, CrawlError::HttpStatus { status: 403, .. }));
        assert!(err.is_transport());
    }
}
