//! Proxy transport layer for HTTP and SOCKS5 proxies
//!
//! Opens the TCP stream a request is written to. For plain http targets, HTTP
//! proxies receive absolute-form requests on a plain connection. Everything else
//! (SOCKS5 proxies, and https targets on any proxy) goes through a tunnel to the
//! target: a SOCKS5 connect or an HTTP `CONNECT`.

use std::io;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tokio_socks::tcp::Socks5Stream;
use tracing::{debug, instrument};

use crate::error::{CrawlError, Result};
use crate::models::{ProxyAddress, ProxyProtocol};

/// How the request line must address the target on a given connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestForm {
    /// `GET http://host/path`, forwarded by the proxy
    Absolute,
    /// `GET /path` over a connection already tunneled to the target
    Origin,
}

/// A connection through a proxy, ready for an HTTP/1 request
pub struct ProxyStream {
    pub stream: TcpStream,
    pub form: RequestForm,
}

/// Proxy transport handler
pub struct ProxyTransport;

impl ProxyTransport {
    /// Connect to a target through the specified proxy
    #[instrument(skip(proxy), fields(proxy = %proxy, target = %target_host))]
    pub async fn connect(
        proxy: &ProxyAddress,
        target_host: &str,
        target_port: u16,
    ) -> Result<ProxyStream> {
        match proxy.protocol {
            ProxyProtocol::Http => {
                let stream = Self::dial(proxy).await?;
                debug!("Connected to HTTP proxy");
                Ok(ProxyStream {
                    stream,
                    form: RequestForm::Absolute,
                })
            }
            ProxyProtocol::Socks5 => {
                let stream = Self::connect_socks5(proxy, target_host, target_port).await?;
                Ok(ProxyStream {
                    stream,
                    form: RequestForm::Origin,
                })
            }
        }
    }

    /// Open a raw tunnel to the target through the proxy
    #[instrument(skip(proxy), fields(proxy = %proxy, target = %target_host))]
    pub async fn tunnel(
        proxy: &ProxyAddress,
        target_host: &str,
        target_port: u16,
    ) -> Result<TcpStream> {
        match proxy.protocol {
            ProxyProtocol::Http => Self::connect_http_tunnel(proxy, target_host, target_port).await,
            ProxyProtocol::Socks5 => Self::connect_socks5(proxy, target_host, target_port).await,
        }
    }

    /// Open a plain TCP connection to the proxy itself
    async fn dial(proxy: &ProxyAddress) -> Result<TcpStream> {
        TcpStream::connect(proxy.authority())
            .await
            .map_err(|e| connect_error(proxy, e))
    }

    /// Ask an HTTP proxy to open a tunnel with `CONNECT`
    async fn connect_http_tunnel(
        proxy: &ProxyAddress,
        target_host: &str,
        target_port: u16,
    ) -> Result<TcpStream> {
        let mut stream = Self::dial(proxy).await?;

        let authority = if target_host.contains(':') {
            format!("[{}]:{}", target_host, target_port)
        } else {
            format!("{}:{}", target_host, target_port)
        };
        let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", authority, authority);
        if let Some(auth) = Self::basic_auth(proxy) {
            request.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
        }
        request.push_str("\r\n");
        stream.write_all(request.as_bytes()).await?;

        // Read the reply head byte by byte so no tunneled bytes are consumed
        let mut head = Vec::with_capacity(128);
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            if head.len() >= MAX_CONNECT_REPLY {
                return Err(CrawlError::ProxyHandshake(format!(
                    "CONNECT reply from {} too long",
                    proxy
                )));
            }
            if stream.read(&mut byte).await? == 0 {
                return Err(CrawlError::ProxyHandshake(format!(
                    "{} closed the connection during CONNECT",
                    proxy
                )));
            }
            head.push(byte[0]);
        }

        let head = String::from_utf8_lossy(&head);
        let status_line = head.lines().next().unwrap_or_default();
        let status = status_line.split_whitespace().nth(1).unwrap_or_default();
        if !status_line.starts_with("HTTP/1.") || !status.starts_with('2') {
            return Err(CrawlError::ProxyHandshake(format!(
                "CONNECT via {} failed: {}",
                proxy, status_line
            )));
        }

        debug!("HTTP CONNECT tunnel established");
        Ok(stream)
    }

    /// Connect through SOCKS5 proxy (the proxy resolves the target hostname)
    async fn connect_socks5(
        proxy: &ProxyAddress,
        target_host: &str,
        target_port: u16,
    ) -> Result<TcpStream> {
        debug!("Connecting to SOCKS5 proxy at {}", proxy);

        let socket = Self::dial(proxy).await?;

        let stream = match (&proxy.username, &proxy.password) {
            (Some(username), Some(password)) => {
                Socks5Stream::connect_with_password_and_socket(
                    socket,
                    (target_host, target_port),
                    username,
                    password,
                )
                .await
            }
            _ => Socks5Stream::connect_with_socket(socket, (target_host, target_port)).await,
        }
        .map_err(|e| CrawlError::ProxyHandshake(format!("SOCKS5 connect via {} failed: {}", proxy, e)))?;

        debug!("SOCKS5 connection established");
        Ok(stream.into_inner())
    }

    /// `Proxy-Authorization` header value for HTTP proxies with credentials
    pub fn basic_auth(proxy: &ProxyAddress) -> Option<String> {
        let username = proxy.username.as_ref()?;
        let password = proxy.password.as_deref().unwrap_or("");
        let credentials = format!("{}:{}", username, password);
        Some(format!("Basic {}", BASE64.encode(credentials.as_bytes())))
    }
}

const MAX_CONNECT_REPLY: usize = 8 * 1024;

/// TLS client verifying servers against the bundled web PKI roots
pub fn tls_connector() -> TlsConnector {
    let roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

/// Run the TLS handshake with `host` over an established tunnel
pub async fn tls_handshake(
    connector: &TlsConnector,
    host: &str,
    stream: TcpStream,
) -> Result<TlsStream<TcpStream>> {
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| CrawlError::InvalidUrl(format!("{}: {}", host, e)))?;
    connector
        .connect(server_name, stream)
        .await
        .map_err(|e| CrawlError::TlsHandshake(format!("{}: {}", host, e)))
}

fn connect_error(proxy: &ProxyAddress, err: io::Error) -> CrawlError {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => {
            CrawlError::ConnectionRefused(format!("{}: {}", proxy, err))
        }
        io::ErrorKind::TimedOut => CrawlError::Timeout,
        _ => CrawlError::ProxyConnectionFailed(format!("TCP connect to {} failed: {}", proxy, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_basic_auth_header() {
        let proxy = ProxyAddress::new(ProxyProtocol::Http, "10.0.0.1", 8080)
            .with_credentials("user", "pass");
        assert_eq!(
            ProxyTransport::basic_auth(&proxy).as_deref(),
            Some("Basic dXNlcjpwYXNz")
        );

        let anonymous = ProxyAddress::new(ProxyProtocol::Http, "10.0.0.1", 8080);
        assert!(ProxyTransport::basic_auth(&anonymous).is_none());
    }

    #[tokio::test]
    async fn test_http_proxy_uses_absolute_form() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let proxy = ProxyAddress::new(ProxyProtocol::Http, "127.0.0.1", port);
        let conn = ProxyTransport::connect(&proxy, "example.com", 80)
            .await
            .unwrap();
        assert_eq!(conn.form, RequestForm::Absolute);
        accept.await.unwrap();
    }

    /// Accepts one CONNECT, replies with `reply`, then echoes tunneled bytes
    async fn spawn_connect_proxy(
        reply: &'static str,
    ) -> (u16, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let task = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut buf = [0u8; 512];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                head.extend_from_slice(&buf[..n]);
            }
            socket.write_all(reply.as_bytes()).await.unwrap();
            let n = socket.read(&mut buf).await.unwrap_or(0);
            let _ = socket.write_all(&buf[..n]).await;
            String::from_utf8_lossy(&head).into_owned()
        });
        (port, task)
    }

    #[tokio::test]
    async fn test_http_tunnel_sends_connect() {
        let (port, head) =
            spawn_connect_proxy("HTTP/1.1 200 Connection Established\r\n\r\n").await;
        let proxy = ProxyAddress::new(ProxyProtocol::Http, "127.0.0.1", port)
            .with_credentials("user", "pass");

        let mut stream = ProxyTransport::tunnel(&proxy, "www.example.com", 443)
            .await
            .unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");

        let head = head.await.unwrap();
        assert!(head.starts_with("CONNECT www.example.com:443 HTTP/1.1\r\n"));
        assert!(head.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));
    }

    #[tokio::test]
    async fn test_rejected_tunnel_is_transport_error() {
        let (port, _head) = spawn_connect_proxy(
            "HTTP/1.1 407 Proxy Authentication Required\r\nContent-Length: 0\r\n\r\n",
        )
        .await;
        let proxy = ProxyAddress::new(ProxyProtocol::Http, "127.0.0.1", port);

        let err = ProxyTransport::tunnel(&proxy, "www.example.com", 443)
            .await
            .unwrap_err();
        assert!(matches!(err, CrawlError::ProxyHandshake(_)));
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_refused_connection_is_transport_error() {
        // Bind then drop to get a port with nothing listening.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let proxy = ProxyAddress::new(ProxyProtocol::Http, "127.0.0.1", port);
        let err = ProxyTransport::connect(&proxy, "example.com", 80)
            .await
            .err()
            .unwrap();
        assert!(err.is_transport());
    }
}
