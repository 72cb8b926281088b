//! Command-line and environment configuration.
//!
//! Every flag has an `ACCELER_*` environment fallback. The parsed arguments
//! are folded into a single [`ProxyConfig`] that is read-only once the server
//! starts.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tokio::net::lookup_host;

use crate::proxy::{
    split_host_port, DialerConfig, ListenerConfig, UpstreamProxy, DEFAULT_MAX_CONNECTIONS,
};

/// Default listen URI.
pub const DEFAULT_LISTEN_URI: &str = "sni+http://0.0.0.0:8443";

/// Port used when the listen URI does not name one.
pub const DEFAULT_LISTEN_PORT: u16 = 8443;

/// acceler - traffic accelerator
#[derive(Debug, Parser)]
#[command(name = "acceler", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the TLS SNI proxy server.
    Sni(SniArgs),
}

#[derive(Debug, Clone, Args)]
pub struct SniArgs {
    /// Listen URI for the SNI proxy server (scheme://host:port).
    #[arg(long, env = "ACCELER_SNI_URI", default_value = DEFAULT_LISTEN_URI)]
    pub uri: ListenUri,

    /// HTTP forward proxy (HOST:PORT) to tunnel through with CONNECT.
    #[arg(long, env = "ACCELER_UPSTREAM_PROXY")]
    pub upstream_proxy: Option<UpstreamProxy>,

    /// Maximum connections handled at once.
    #[arg(long, env = "ACCELER_MAX_CONNECTIONS", default_value_t = DEFAULT_MAX_CONNECTIONS)]
    pub max_connections: usize,

    /// Deadline for receiving the ClientHello, in milliseconds.
    #[arg(long, env = "ACCELER_HANDSHAKE_TIMEOUT_MS")]
    pub handshake_timeout_ms: Option<u64>,

    /// Deadline for each upstream TCP connect, in milliseconds.
    #[arg(long, env = "ACCELER_CONNECT_TIMEOUT_MS")]
    pub connect_timeout_ms: Option<u64>,

    /// Relay idle timeout per direction, in milliseconds.
    #[arg(long, env = "ACCELER_IDLE_TIMEOUT_MS")]
    pub idle_timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long, env = "ACCELER_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// A listen URI that does not parse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid listen URI {0:?}: expected scheme://host[:port]")]
pub struct InvalidListenUri(pub String);

/// Listen URI such as `sni+http://127.0.0.1:8443`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenUri {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl FromStr for ListenUri {
    type Err = InvalidListenUri;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidListenUri(s.to_string());

        let (scheme, rest) = s.trim().split_once("://").ok_or_else(invalid)?;
        if scheme.is_empty() {
            return Err(invalid());
        }

        let authority = rest.split('/').next().unwrap_or_default();
        let (host, port) = match split_host_port(authority) {
            Some((host, port)) => (host.to_string(), port),
            None if !authority.is_empty() && !authority.contains(':') => {
                (authority.to_string(), DEFAULT_LISTEN_PORT)
            }
            None => return Err(invalid()),
        };

        Ok(Self {
            scheme: scheme.to_string(),
            host,
            port,
        })
    }
}

impl fmt::Display for ListenUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", self.scheme, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
        }
    }
}

/// Process-wide proxy configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen: ListenUri,
    pub upstream_proxy: Option<UpstreamProxy>,
    pub max_connections: usize,
    pub handshake_timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    pub log_level: String,
}

impl From<SniArgs> for ProxyConfig {
    fn from(args: SniArgs) -> Self {
        Self {
            listen: args.uri,
            upstream_proxy: args.upstream_proxy,
            max_connections: args.max_connections.max(1),
            handshake_timeout: args.handshake_timeout_ms.map(Duration::from_millis),
            connect_timeout: args.connect_timeout_ms.map(Duration::from_millis),
            idle_timeout: args.idle_timeout_ms.map(Duration::from_millis),
            log_level: args.log_level,
        }
    }
}

impl ProxyConfig {
    /// Resolve the listen URI to a socket address.
    pub async fn bind_addr(&self) -> io::Result<SocketAddr> {
        lookup_host((self.listen.host.as_str(), self.listen.port))
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no address for {}", self.listen),
                )
            })
    }

    pub fn listener_config(&self, bind_addr: SocketAddr) -> ListenerConfig {
        let mut config = ListenerConfig::new(bind_addr);
        config.max_connections = self.max_connections;
        config.handshake_timeout = self.handshake_timeout;
        config.idle_timeout = self.idle_timeout;
        config
    }

    /// Dialer settings; the User-Agent is supplied by the caller.
    pub fn dialer_config(&self, user_agent: impl Into<String>) -> DialerConfig {
        let mut config =
            DialerConfig::new(user_agent).with_upstream_proxy(self.upstream_proxy.clone());
        config.connect_timeout = self.connect_timeout;
        config
    }
}
