//! TLS SNI sniffing proxy.
//!
//! This module provides:
//! - TCP listener and per-connection tasks
//! - ClientHello parsing for the SNI hostname
//! - Upstream dialing, direct or through an HTTP CONNECT proxy
//! - Bidirectional relaying of the still-encrypted stream
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> ClientHello parser -> Dialer -> Destination:443
//!                                               |
//!                                   CONNECT host:443 (if proxy configured)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{Dialer, DialerConfig, Listener, ListenerConfig};
//!
//! let dialer = Dialer::new(DialerConfig::new("Acceler/0.1.0"));
//! let config = ListenerConfig::new("0.0.0.0:8443".parse()?);
//! let listener = Listener::bind(config, dialer).await?;
//! Arc::new(listener).run().await?;
//! ```

mod client_hello;
mod dialer;
mod error;
mod listener;

pub use client_hello::{
    parse_sni, ClientHello, RecordHeader, SniError, HANDSHAKE_FAILURE_ALERT, RECORD_HEADER_LEN,
};
pub use dialer::{
    connect_request, is_dialable_hostname, read_connect_response, user_agent, DialError, Dialer,
    DialerConfig, InvalidHostPort, UpstreamConnection, UpstreamProxy, UpstreamTarget,
    DEFAULT_DESTINATION_PORT,
};
pub(crate) use dialer::split_host_port;
pub use error::ProxyError;
pub use listener::{
    read_client_hello, relay, ConnectionHandler, Listener, ListenerConfig, ListenerStats,
    RelayStats, DEFAULT_MAX_CONNECTIONS,
};
