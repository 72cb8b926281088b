//! Upstream connection establishment.
//!
//! An upstream is either the SNI hostname itself on port 443, or an HTTP
//! forward proxy that is asked to open a tunnel with
//! `CONNECT host:443 HTTP/1.0`.
//!
//! The proxy's response is consumed up to the first blank line. Its status is
//! logged but not enforced; any complete response header is treated as
//! tunnel-ready.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Port dialed on the destination (and requested in CONNECT).
pub const DEFAULT_DESTINATION_PORT: u16 = 443;

/// Upper bound on the CONNECT response headers.
pub const MAX_CONNECT_RESPONSE_BYTES: usize = 8192;

/// Read size used while waiting for the CONNECT response.
const CONNECT_READ_CHUNK: usize = 1024;

const CONNECT_RESPONSE_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Errors produced while establishing an upstream connection.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("failed to resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("no addresses found for {host}")]
    NoAddress { host: String },

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: SocketAddr, timeout: Duration },

    #[error("upstream proxy closed the connection before the CONNECT response completed")]
    ProxyClosed,

    #[error("CONNECT response exceeded {limit} bytes without a header terminator")]
    ResponseTooLarge { limit: usize },

    #[error("upstream proxy i/o error: {0}")]
    Io(#[from] io::Error),
}

/// An `HOST:PORT` string that does not parse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid address {0:?}: expected HOST:PORT")]
pub struct InvalidHostPort(pub String);

/// Split `host:port`, accepting `[v6]:port`.
pub(crate) fn split_host_port(s: &str) -> Option<(&str, u16)> {
    let (host, port) = s.rsplit_once(':')?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return None;
    }
    Some((host, port.parse().ok()?))
}

/// Address of an HTTP forward proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamProxy {
    pub host: String,
    pub port: u16,
}

impl UpstreamProxy {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for UpstreamProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for UpstreamProxy {
    type Err = InvalidHostPort;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        split_host_port(s.trim())
            .map(|(host, port)| Self::new(host, port))
            .ok_or_else(|| InvalidHostPort(s.to_string()))
    }
}

/// Where a connection is dialed. Resolved once per connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamTarget {
    /// Connect to the SNI hostname directly.
    Direct { hostname: String, port: u16 },
    /// Tunnel to the SNI hostname through an HTTP forward proxy.
    ViaProxy {
        proxy: UpstreamProxy,
        hostname: String,
        port: u16,
    },
}

impl UpstreamTarget {
    /// The destination hostname, whichever way it is reached.
    pub fn hostname(&self) -> &str {
        match self {
            UpstreamTarget::Direct { hostname, .. } => hostname,
            UpstreamTarget::ViaProxy { hostname, .. } => hostname,
        }
    }
}

/// Dialer configuration.
#[derive(Debug, Clone)]
pub struct DialerConfig {
    /// Forward proxy to tunnel through; `None` dials destinations directly.
    pub upstream_proxy: Option<UpstreamProxy>,
    /// Value of the `User-Agent` header sent with CONNECT.
    pub user_agent: String,
    /// Destination port.
    pub destination_port: u16,
    /// Deadline for each TCP connect; `None` waits for the OS.
    pub connect_timeout: Option<Duration>,
}

impl DialerConfig {
    /// Direct-mode configuration with the given User-Agent.
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            upstream_proxy: None,
            user_agent: user_agent.into(),
            destination_port: DEFAULT_DESTINATION_PORT,
            connect_timeout: None,
        }
    }

    pub fn with_upstream_proxy(mut self, proxy: Option<UpstreamProxy>) -> Self {
        self.upstream_proxy = proxy;
        self
    }
}

/// Longest hostname accepted for dialing.
const MAX_HOSTNAME_LEN: usize = 253;

/// Whether `hostname` may be dialed or placed in a CONNECT request line.
///
/// Only letters, digits, `-`, `.` and `_` are allowed. Anything else
/// (whitespace, CR/LF, `:`, `/`) could rewrite the request or its port.
pub fn is_dialable_hostname(hostname: &str) -> bool {
    !hostname.is_empty()
        && hostname.len() <= MAX_HOSTNAME_LEN
        && hostname
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_'))
}

/// Format a `product/version` User-Agent value.
pub fn user_agent(product: &str, version: &str) -> String {
    format!("{product}/{version}")
}

/// An established upstream byte stream.
#[derive(Debug)]
pub struct UpstreamConnection {
    pub stream: TcpStream,
    /// Address actually connected to (destination or proxy).
    pub peer_addr: SocketAddr,
    /// Tunnel bytes the proxy sent in the same reads as its response headers.
    /// They belong to the client and must be delivered before relaying.
    pub early_data: Vec<u8>,
}

/// Opens upstream connections.
#[derive(Debug, Clone)]
pub struct Dialer {
    config: DialerConfig,
}

impl Dialer {
    pub fn new(config: DialerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DialerConfig {
        &self.config
    }

    /// Decide how `hostname` is reached under this configuration.
    pub fn target_for(&self, hostname: &str) -> UpstreamTarget {
        let port = self.config.destination_port;
        match &self.config.upstream_proxy {
            Some(proxy) => UpstreamTarget::ViaProxy {
                proxy: proxy.clone(),
                hostname: hostname.to_string(),
                port,
            },
            None => UpstreamTarget::Direct {
                hostname: hostname.to_string(),
                port,
            },
        }
    }

    /// Connect to the target. Nothing is retried.
    pub async fn dial(&self, target: &UpstreamTarget) -> Result<UpstreamConnection, DialError> {
        match target {
            UpstreamTarget::Direct { hostname, port } => {
                let (stream, peer_addr) = self.connect(hostname, *port).await?;
                debug!(upstream_addr = %peer_addr, "Connected to destination");
                Ok(UpstreamConnection {
                    stream,
                    peer_addr,
                    early_data: Vec::new(),
                })
            }
            UpstreamTarget::ViaProxy {
                proxy,
                hostname,
                port,
            } => {
                let (mut stream, peer_addr) = self.connect(&proxy.host, proxy.port).await?;
                let request = connect_request(hostname, *port, &self.config.user_agent);
                stream.write_all(request.as_bytes()).await?;

                let (headers, early_data) = read_connect_response(&mut stream).await?;
                let status = status_line(&headers);
                if is_success_status(&status) {
                    debug!(proxy = %proxy, status = %status, "CONNECT tunnel established");
                } else {
                    warn!(proxy = %proxy, status = %status, "CONNECT returned non-2xx status, tunneling anyway");
                }
                debug!(
                    response = %String::from_utf8_lossy(&headers),
                    early_bytes = early_data.len(),
                    "CONNECT response"
                );

                Ok(UpstreamConnection {
                    stream,
                    peer_addr,
                    early_data,
                })
            }
        }
    }

    /// Resolve `host` and connect to the first address.
    async fn connect(&self, host: &str, port: u16) -> Result<(TcpStream, SocketAddr), DialError> {
        let addr = lookup_host((host, port))
            .await
            .map_err(|source| DialError::Resolve {
                host: host.to_string(),
                source,
            })?
            .next()
            .ok_or_else(|| DialError::NoAddress {
                host: host.to_string(),
            })?;

        debug!(host = %host, addr = %addr, "Connecting upstream");

        let connect = TcpStream::connect(addr);
        let result = match self.config.connect_timeout {
            Some(limit) => timeout(limit, connect)
                .await
                .map_err(|_| DialError::ConnectTimeout {
                    addr,
                    timeout: limit,
                })?,
            None => connect.await,
        };

        let stream = result.map_err(|source| DialError::Connect { addr, source })?;
        Ok((stream, addr))
    }
}

/// Build the HTTP/1.0 CONNECT request for `hostname:port`.
pub fn connect_request(hostname: &str, port: u16, user_agent: &str) -> String {
    format!("CONNECT {hostname}:{port} HTTP/1.0\r\nUser-Agent: {user_agent}\r\n\r\n")
}

/// Read a CONNECT response up to and including the first `\r\n\r\n`.
///
/// Returns the response headers (terminator included) and any bytes that
/// arrived after the terminator.
pub async fn read_connect_response<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<(Vec<u8>, Vec<u8>), DialError> {
    let mut response = Vec::with_capacity(CONNECT_READ_CHUNK);
    let mut chunk = [0u8; CONNECT_READ_CHUNK];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(DialError::ProxyClosed);
        }

        // The terminator may straddle the previous read.
        let search_from = response
            .len()
            .saturating_sub(CONNECT_RESPONSE_TERMINATOR.len() - 1);
        response.extend_from_slice(&chunk[..n]);

        if let Some(pos) = find_terminator(&response[search_from..]) {
            let end = search_from + pos + CONNECT_RESPONSE_TERMINATOR.len();
            let early_data = response.split_off(end);
            return Ok((response, early_data));
        }

        if response.len() > MAX_CONNECT_RESPONSE_BYTES {
            return Err(DialError::ResponseTooLarge {
                limit: MAX_CONNECT_RESPONSE_BYTES,
            });
        }
    }
}

fn find_terminator(data: &[u8]) -> Option<usize> {
    data.windows(CONNECT_RESPONSE_TERMINATOR.len())
        .position(|w| w == CONNECT_RESPONSE_TERMINATOR)
}

fn status_line(headers: &[u8]) -> String {
    let line = headers
        .split(|&b| b == b'\n')
        .next()
        .unwrap_or_default();
    String::from_utf8_lossy(line).trim_end().to_string()
}

fn is_success_status(status_line: &str) -> bool {
    status_line
        .split_whitespace()
        .nth(1)
        .is_some_and(|code| code.len() == 3 && code.starts_with('2'))
}
