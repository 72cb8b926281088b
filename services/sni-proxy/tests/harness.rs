//! Test harness for SNI proxy integration tests.
//!
//! Provides loopback fixtures: the proxy itself, a fake HTTP CONNECT proxy,
//! echo/recording/TLS upstreams, and a ClientHello builder.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

static INIT_CRYPTO: Once = Once::new();

fn init_crypto_provider() {
    INIT_CRYPTO.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .ok();
    });
}

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, RwLock};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use acceler_sni::proxy::{read_connect_response, Dialer, DialerConfig, Listener, ListenerConfig};
use acceler_sni::{ListenerStats, UpstreamProxy};

pub const TEST_USER_AGENT: &str = "Acceler/test";

pub struct ProxyHandle {
    pub listen_addr: SocketAddr,
    pub stats: Arc<ListenerStats>,
}

impl ProxyHandle {
    /// Spawn the SNI proxy. Destinations are dialed on `destination_port`
    /// instead of 443 so loopback fixtures can stand in for them.
    pub async fn spawn(
        upstream_proxy: Option<UpstreamProxy>,
        destination_port: u16,
    ) -> io::Result<Self> {
        let mut dialer_config =
            DialerConfig::new(TEST_USER_AGENT).with_upstream_proxy(upstream_proxy);
        dialer_config.destination_port = destination_port;
        dialer_config.connect_timeout = Some(Duration::from_secs(2));

        let config = ListenerConfig::new("127.0.0.1:0".parse().unwrap());
        let listener = Listener::bind(config, Dialer::new(dialer_config)).await?;

        let listen_addr = listener.local_addr()?;
        let stats = listener.stats();
        let listener = Arc::new(listener);

        tokio::spawn(async move {
            let _ = listener.run().await;
        });

        Ok(Self { listen_addr, stats })
    }

    /// Poll a counter until it reaches `expected` or a second passes.
    pub async fn wait_for(&self, counter: impl Fn(&ListenerStats) -> &AtomicU64, expected: u64) {
        for _ in 0..100 {
            if counter(&self.stats).load(Ordering::Relaxed) >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Fake HTTP forward proxy. Answers every CONNECT with a 200, optionally
/// followed by extra bytes in the same write, then splices to `backend`.
pub struct ConnectProxy {
    pub addr: SocketAddr,
    pub requests: Arc<RwLock<Vec<String>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl ConnectProxy {
    pub async fn spawn(backend: SocketAddr, trailing: &[u8]) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let requests = Arc::new(RwLock::new(Vec::new()));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let requests_clone = Arc::clone(&requests);
        let mut response = b"HTTP/1.0 200 Connection established\r\n\r\n".to_vec();
        response.extend_from_slice(trailing);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((mut client, _)) => {
                                let requests = Arc::clone(&requests_clone);
                                let response = response.clone();
                                tokio::spawn(async move {
                                    let Ok((request, leftover)) = read_connect_response(&mut client).await else {
                                        return;
                                    };
                                    requests
                                        .write()
                                        .await
                                        .push(String::from_utf8_lossy(&request).to_string());

                                    let Ok(mut server) = TcpStream::connect(backend).await else {
                                        return;
                                    };
                                    if client.write_all(&response).await.is_err() {
                                        return;
                                    }
                                    if !leftover.is_empty() && server.write_all(&leftover).await.is_err() {
                                        return;
                                    }
                                    let _ = tokio::io::copy_bidirectional(&mut client, &mut server).await;
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            requests,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn upstream_proxy(&self) -> UpstreamProxy {
        UpstreamProxy::new(self.addr.ip().to_string(), self.addr.port())
    }

    pub async fn requests(&self) -> Vec<String> {
        self.requests.read().await.clone()
    }
}

impl Drop for ConnectProxy {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

pub struct TcpEchoBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TcpEchoBackend {
    pub async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let conn_clone = Arc::clone(&connections);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((mut stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                tokio::spawn(async move {
                                    let mut buf = vec![0u8; 8192];
                                    loop {
                                        match stream.read(&mut buf).await {
                                            Ok(0) => break,
                                            Ok(n) => {
                                                if stream.write_all(&buf[..n]).await.is_err() {
                                                    break;
                                                }
                                            }
                                            Err(_) => break,
                                        }
                                    }
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

impl Drop for TcpEchoBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Upstream that records everything it receives on its first connection,
/// answers with `reply` once the sender half-closes, then closes.
pub struct RecordingBackend {
    pub addr: SocketAddr,
    received: oneshot::Receiver<Vec<u8>>,
}

impl RecordingBackend {
    pub async fn spawn(reply: &'static [u8]) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (tx, received) = oneshot::channel();

        tokio::spawn(async move {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let mut data = Vec::new();
            if stream.read_to_end(&mut data).await.is_err() {
                return;
            }
            let _ = stream.write_all(reply).await;
            let _ = stream.shutdown().await;
            let _ = tx.send(data);
        });

        Ok(Self { addr, received })
    }

    pub async fn received(self) -> Vec<u8> {
        tokio::time::timeout(Duration::from_secs(5), self.received)
            .await
            .expect("backend timed out")
            .expect("backend dropped without data")
    }
}

pub struct TlsBackend {
    pub addr: SocketAddr,
    pub cert_der: Vec<u8>,
    pub connections: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TlsBackend {
    pub async fn spawn(server_name: &str, marker: &str) -> io::Result<Self> {
        init_crypto_provider();

        let cert = rcgen::generate_simple_self_signed(vec![server_name.to_string()])
            .map_err(io::Error::other)?;

        let cert_der = cert.cert.der().to_vec();
        let key_der = cert.key_pair.serialize_der();

        let certs = vec![CertificateDer::from(cert_der.clone())];
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_der));

        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(io::Error::other)?;

        let acceptor = TlsAcceptor::from(Arc::new(config));
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let connections = Arc::new(AtomicU64::new(0));
        let conn_clone = Arc::clone(&connections);
        let marker_bytes = marker.as_bytes().to_vec();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                let acceptor = acceptor.clone();
                                let response = marker_bytes.clone();
                                tokio::spawn(async move {
                                    if let Ok(mut tls_stream) = acceptor.accept(stream).await {
                                        let mut buf = vec![0u8; 1024];
                                        if tls_stream.read(&mut buf).await.is_ok() {
                                            let _ = tls_stream.write_all(&response).await;
                                        }
                                    }
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            cert_der,
            connections,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

impl Drop for TlsBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

pub async fn tls_client_connect(
    addr: SocketAddr,
    server_name: &str,
    cert_der: &[u8],
) -> io::Result<tokio_rustls::client::TlsStream<TcpStream>> {
    init_crypto_provider();

    let mut root_store = rustls::RootCertStore::empty();
    root_store
        .add(CertificateDer::from(cert_der.to_vec()))
        .map_err(io::Error::other)?;

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    let connector = TlsConnector::from(Arc::new(config));
    let stream = TcpStream::connect(addr).await?;
    let server_name = ServerName::try_from(server_name.to_string())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    connector.connect(server_name, stream).await
}

/// Build a TLS 1.0 framed ClientHello record, with a server_name extension
/// when `hostname` is given. A supported_groups extension always comes first.
pub fn client_hello_record(hostname: Option<&str>) -> Vec<u8> {
    let mut extensions = Vec::new();
    // supported_groups: x25519, secp256r1
    extensions.extend_from_slice(&[0x00, 0x0a, 0x00, 0x06, 0x00, 0x04, 0x00, 0x1d, 0x00, 0x17]);
    if let Some(hostname) = hostname {
        let name = hostname.as_bytes();
        extensions.extend_from_slice(&[0x00, 0x00]);
        extensions.extend_from_slice(&((name.len() + 5) as u16).to_be_bytes());
        extensions.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
        extensions.push(0x00);
        extensions.extend_from_slice(&(name.len() as u16).to_be_bytes());
        extensions.extend_from_slice(name);
    }

    let mut hello = Vec::new();
    hello.extend_from_slice(&[0x03, 0x03]);
    hello.extend_from_slice(&[0x5a; 32]);
    hello.push(0x00);
    hello.extend_from_slice(&[0x00, 0x02, 0xc0, 0x2f]);
    hello.extend_from_slice(&[0x01, 0x00]);
    hello.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    hello.extend_from_slice(&extensions);

    let mut body = vec![0x01];
    body.extend_from_slice(&(hello.len() as u32).to_be_bytes()[1..]);
    body.extend_from_slice(&hello);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&(body.len() as u16).to_be_bytes());
    record.extend_from_slice(&body);
    record
}
