//! Per-connection error taxonomy.
//!
//! None of these cross the connection task boundary: the listener logs them
//! and moves on. Only bind/accept failures end the accept loop.

use std::io;
use std::time::Duration;

use thiserror::Error;

use super::client_hello::SniError;
use super::dialer::DialError;

/// Errors that end the handling of a single client connection.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The client closed or failed before a complete ClientHello record arrived.
    #[error("failed to read ClientHello: {0}")]
    ClientRead(#[source] io::Error),

    /// The first record is not a TLS 1.0 framed handshake record.
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(#[source] SniError),

    /// A length field in the ClientHello runs past the record.
    #[error("malformed handshake: {0}")]
    MalformedHandshake(#[source] SniError),

    /// The ClientHello carries no usable server_name.
    #[error("no server_name in ClientHello")]
    NoHostname,

    /// The server_name holds characters that cannot appear in a DNS hostname.
    #[error("server_name {0:?} is not a dialable hostname")]
    InvalidHostname(String),

    /// The ClientHello did not arrive before the handshake deadline.
    #[error("ClientHello not received within {0:?}")]
    HandshakeTimeout(Duration),

    /// The upstream connection could not be established.
    #[error("dial failed: {0}")]
    Dial(#[from] DialError),

    /// A socket failed while forwarding bytes.
    #[error("relay i/o error: {0}")]
    Relay(#[source] io::Error),
}

impl From<SniError> for ProxyError {
    fn from(err: SniError) -> Self {
        match err {
            SniError::NotClientHello { .. } => ProxyError::ProtocolMismatch(err),
            _ => ProxyError::MalformedHandshake(err),
        }
    }
}

impl ProxyError {
    /// Stable reason code for logs.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ProxyError::ClientRead(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                "client_closed"
            }
            ProxyError::ClientRead(_) => "client_read_failed",
            ProxyError::ProtocolMismatch(_) => "protocol_mismatch",
            ProxyError::MalformedHandshake(_) => "malformed_handshake",
            ProxyError::NoHostname => "no_hostname",
            ProxyError::InvalidHostname(_) => "invalid_hostname",
            ProxyError::HandshakeTimeout(_) => "handshake_timeout",
            ProxyError::Dial(_) => "dial_failed",
            ProxyError::Relay(_) => "relay_io_error",
        }
    }
}
