//! TCP listener and per-connection handling.
//!
//! Each accepted connection gets its own task:
//! - read the 5-byte record header and the ClientHello body
//! - answer non-TLS input with a fatal handshake_failure alert
//! - extract the SNI hostname, refuse names that are not plain DNS hostnames,
//!   and dial upstream (direct or via CONNECT)
//! - forward the buffered ClientHello, then relay both directions
//!
//! Both sockets are owned by the task and dropped on every exit path.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, error, info, warn, Instrument};

use super::client_hello::{ClientHello, RecordHeader, HANDSHAKE_FAILURE_ALERT, RECORD_HEADER_LEN};
use super::dialer::{is_dialable_hostname, Dialer, UpstreamConnection};
use super::error::ProxyError;

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Buffer size for each relay direction.
const RELAY_BUFFER_SIZE: usize = 8192;

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Deadline for receiving the full ClientHello. `None` waits forever.
    pub handshake_timeout: Option<Duration>,
    /// Idle timeout for each relay direction. `None` waits forever.
    pub idle_timeout: Option<Duration>,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            handshake_timeout: None,
            idle_timeout: None,
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently being handled.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections that did not open with a TLS 1.0 handshake record.
    pub not_tls: AtomicU64,
    /// ClientHellos without a usable server_name.
    pub no_sni: AtomicU64,
    /// ClientHellos with out-of-bounds length fields or an undialable server_name.
    pub malformed: AtomicU64,
    /// Upstream dials that failed.
    pub dial_failed: AtomicU64,
    /// Bytes sent upstream, ClientHello included. Relays that end in an
    /// error still count what they forwarded.
    pub bytes_to_upstream: AtomicU64,
    /// Bytes sent back to clients, CONNECT early data included.
    pub bytes_from_upstream: AtomicU64,
}

/// Byte counts of one finished relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub bytes_to_upstream: u64,
    pub bytes_from_upstream: u64,
}

/// Runs one client connection from ClientHello to teardown.
pub struct ConnectionHandler {
    dialer: Dialer,
    handshake_timeout: Option<Duration>,
    idle_timeout: Option<Duration>,
    stats: Arc<ListenerStats>,
}

impl ConnectionHandler {
    pub fn new(dialer: Dialer) -> Self {
        Self {
            dialer,
            handshake_timeout: None,
            idle_timeout: None,
            stats: Arc::new(ListenerStats::default()),
        }
    }

    pub fn with_timeouts(
        mut self,
        handshake_timeout: Option<Duration>,
        idle_timeout: Option<Duration>,
    ) -> Self {
        self.handshake_timeout = handshake_timeout;
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    /// Handle a single client connection to completion.
    ///
    /// The client and upstream streams are dropped before this returns,
    /// whatever the outcome.
    pub async fn handle<C>(&self, mut client: C) -> Result<RelayStats, ProxyError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let hello = match self.receive_client_hello(&mut client).await {
            Ok(hello) => hello,
            Err(ProxyError::ProtocolMismatch(e)) => {
                self.stats.not_tls.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, "Not a TLS ClientHello, sending handshake_failure alert");
                if let Err(write_err) = client.write_all(&HANDSHAKE_FAILURE_ALERT).await {
                    debug!(error = %write_err, "Failed to send alert");
                }
                let _ = client.shutdown().await;
                return Err(ProxyError::ProtocolMismatch(e));
            }
            Err(e) => return Err(e),
        };

        debug!(record_len = hello.len(), "ClientHello received");

        let hostname = match hello.server_name() {
            Ok(Some(hostname)) => hostname,
            Ok(None) => {
                self.stats.no_sni.fetch_add(1, Ordering::Relaxed);
                return Err(ProxyError::NoHostname);
            }
            Err(e) => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                return Err(e.into());
            }
        };

        if !is_dialable_hostname(&hostname) {
            self.stats.malformed.fetch_add(1, Ordering::Relaxed);
            return Err(ProxyError::InvalidHostname(hostname));
        }

        tracing::Span::current().record("sni", hostname.as_str());
        debug!(hostname = %hostname, "SNI extracted");

        let target = self.dialer.target_for(&hostname);
        let UpstreamConnection {
            stream: mut upstream,
            peer_addr,
            early_data,
        } = match self.dialer.dial(&target).await {
            Ok(connection) => connection,
            Err(e) => {
                self.stats.dial_failed.fetch_add(1, Ordering::Relaxed);
                return Err(e.into());
            }
        };

        debug!(upstream_addr = %peer_addr, "Upstream connected");

        // The upstream must see the ClientHello exactly as the client sent it.
        upstream
            .write_all(hello.as_bytes())
            .await
            .map_err(ProxyError::Relay)?;
        self.stats
            .bytes_to_upstream
            .fetch_add(hello.len() as u64, Ordering::Relaxed);

        if !early_data.is_empty() {
            client
                .write_all(&early_data)
                .await
                .map_err(ProxyError::Relay)?;
            self.stats
                .bytes_from_upstream
                .fetch_add(early_data.len() as u64, Ordering::Relaxed);
        }

        let (relay_stats, result) = relay(&mut client, &mut upstream, self.idle_timeout).await;

        self.stats
            .bytes_to_upstream
            .fetch_add(relay_stats.bytes_to_upstream, Ordering::Relaxed);
        self.stats
            .bytes_from_upstream
            .fetch_add(relay_stats.bytes_from_upstream, Ordering::Relaxed);

        result.map_err(ProxyError::Relay)?;
        Ok(relay_stats)
    }

    async fn receive_client_hello<C>(&self, client: &mut C) -> Result<ClientHello, ProxyError>
    where
        C: AsyncRead + Unpin,
    {
        match self.handshake_timeout {
            Some(limit) => timeout(limit, read_client_hello(client))
                .await
                .map_err(|_| ProxyError::HandshakeTimeout(limit))?,
            None => read_client_hello(client).await,
        }
    }
}

/// Read one ClientHello record: the 5-byte header, then exactly `length`
/// bytes of body.
///
/// The header is validated before the body is read, so non-TLS clients are
/// rejected without waiting for bytes they will never send.
pub async fn read_client_hello<R>(reader: &mut R) -> Result<ClientHello, ProxyError>
where
    R: AsyncRead + Unpin,
{
    let mut header_bytes = [0u8; RECORD_HEADER_LEN];
    reader
        .read_exact(&mut header_bytes)
        .await
        .map_err(ProxyError::ClientRead)?;

    let header = RecordHeader::from_bytes(header_bytes);
    header.validate()?;

    let mut record = vec![0u8; RECORD_HEADER_LEN + header.body_len()];
    record[..RECORD_HEADER_LEN].copy_from_slice(&header_bytes);
    reader
        .read_exact(&mut record[RECORD_HEADER_LEN..])
        .await
        .map_err(ProxyError::ClientRead)?;

    Ok(ClientHello::from_record(record)?)
}

/// Relay bytes between client and upstream in both directions at once.
///
/// Each direction shuts down its write side when its read side reaches EOF.
/// Returns once both directions are done, or as soon as either fails. The
/// byte counts cover everything forwarded, including before a failure.
pub async fn relay<A, B>(
    client: &mut A,
    upstream: &mut B,
    idle_timeout: Option<Duration>,
) -> (RelayStats, io::Result<()>)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let to_upstream = AtomicU64::new(0);
    let from_upstream = AtomicU64::new(0);

    let client_to_upstream = copy_half(
        &mut client_read,
        &mut upstream_write,
        idle_timeout,
        &to_upstream,
    );
    let upstream_to_client = copy_half(
        &mut upstream_read,
        &mut client_write,
        idle_timeout,
        &from_upstream,
    );

    let result = tokio::try_join!(client_to_upstream, upstream_to_client).map(|_| ());

    let stats = RelayStats {
        bytes_to_upstream: to_upstream.load(Ordering::Relaxed),
        bytes_from_upstream: from_upstream.load(Ordering::Relaxed),
    };
    (stats, result)
}

async fn copy_half<R, W>(
    reader: &mut R,
    writer: &mut W,
    idle_timeout: Option<Duration>,
    total: &AtomicU64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = match idle_timeout {
            Some(limit) => match timeout(limit, reader.read(&mut buf)).await {
                Ok(result) => result?,
                Err(_) => return Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout")),
            },
            None => reader.read(&mut buf).await?,
        };

        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        total.fetch_add(n as u64, Ordering::Relaxed);
    }
    writer.shutdown().await
}

/// The SNI proxy's accept loop.
pub struct Listener {
    /// Listener configuration.
    config: ListenerConfig,
    /// The TCP listener.
    listener: TcpListener,
    /// Shared by every connection task.
    handler: Arc<ConnectionHandler>,
    /// Bounds the number of connections handled at once.
    conn_semaphore: Arc<Semaphore>,
}

impl Listener {
    /// Bind the listening socket. A `max_connections` of zero is raised to one.
    pub async fn bind(mut config: ListenerConfig, dialer: Dialer) -> io::Result<Self> {
        config.max_connections = config.max_connections.max(1);

        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            "Listener bound"
        );

        let handler =
            ConnectionHandler::new(dialer).with_timeouts(config.handshake_timeout, config.idle_timeout);

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            handler: Arc::new(handler),
            listener,
            config,
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get listener statistics.
    pub fn stats(&self) -> Arc<ListenerStats> {
        self.handler.stats()
    }

    /// Accept connections until accepting fails.
    ///
    /// Waits for a free connection slot before each accept, so clients
    /// beyond `max_connections` queue in the kernel backlog.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(
            bind_addr = %local_addr,
            upstream_proxy = ?self.handler.dialer.config().upstream_proxy.as_ref().map(ToString::to_string),
            "SNI proxy listening"
        );

        let stats = self.stats();
        loop {
            let permit = Arc::clone(&self.conn_semaphore)
                .acquire_owned()
                .await
                .map_err(|_| io::Error::other("connection semaphore closed"))?;

            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(bind_addr = %self.config.bind_addr, error = %e, "Accept error");
                    return Err(e);
                }
            };

            stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
            stats.connections_active.fetch_add(1, Ordering::Relaxed);

            let handler = Arc::clone(&self.handler);
            let stats = Arc::clone(&stats);

            tokio::spawn(
                async move {
                    match handler.handle(stream).await {
                        Ok(relay) => debug!(
                            bytes_to_upstream = relay.bytes_to_upstream,
                            bytes_from_upstream = relay.bytes_from_upstream,
                            "Connection closed"
                        ),
                        Err(e) => log_connection_error(&e),
                    }

                    stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                    stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                    drop(permit);
                }
                .instrument(tracing::info_span!(
                    "connection",
                    peer = %peer_addr,
                    sni = tracing::field::Empty
                )),
            );
        }
    }
}

fn log_connection_error(e: &ProxyError) {
    let reason = e.reason_code();
    match e {
        ProxyError::Dial(_) => warn!(reason, error = %e, "Upstream dial failed"),
        ProxyError::ProtocolMismatch(_)
        | ProxyError::MalformedHandshake(_)
        | ProxyError::InvalidHostname(_) => {
            info!(reason, error = %e, "Rejected connection")
        }
        _ => debug!(reason, error = %e, "Connection ended"),
    }
}
