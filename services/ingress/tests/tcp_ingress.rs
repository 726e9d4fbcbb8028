mod harness;

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use harness::{eventually, IngressHandle};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use sniproute_ingress::proxy::parse_proxy_v2;
use sniproute_ingress::{
    BackendDescriptor, Directory, IngressMetrics, Listener, ListenerConfig, Protocol,
    ProxyProtocolV2, Transport,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn local_backend(port: u16) -> BackendDescriptor {
    BackendDescriptor::new("127.0.0.1", port)
}

/// Read until the peer closes; errors count as closed.
async fn read_until_closed(stream: &mut TcpStream) -> Vec<u8> {
    let mut out = Vec::new();
    let _ = timeout(TEST_TIMEOUT, stream.read_to_end(&mut out)).await;
    out
}

/// TCP listener for `protocol` on an ephemeral loopback port.
async fn spawn_stream(protocol: Protocol, directory: Directory) -> io::Result<IngressHandle> {
    let metrics = IngressMetrics::new().map_err(io::Error::other)?;
    let mut config = ListenerConfig::new("127.0.0.1:0".parse().unwrap(), protocol);
    config.connect_timeout = Duration::from_secs(1);

    let listener = Listener::bind(config, Arc::new(directory), metrics.clone()).await?;
    let listen_addr = listener.local_addr();
    let listener = Arc::new(listener);

    tokio::spawn(async move {
        let _ = listener.run().await;
    });

    Ok(IngressHandle {
        listen_addr,
        metrics,
    })
}

static INIT_CRYPTO: Once = Once::new();

fn init_crypto_provider() {
    INIT_CRYPTO.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .ok();
    });
}

struct TcpEchoBackend {
    addr: SocketAddr,
    connections: Arc<AtomicU64>,
    received: Arc<Mutex<Vec<u8>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TcpEchoBackend {
    async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let received = Arc::new(Mutex::new(Vec::new()));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let conn_clone = Arc::clone(&connections);
        let received_clone = Arc::clone(&received);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((mut stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                let received = Arc::clone(&received_clone);
                                tokio::spawn(async move {
                                    let mut buf = vec![0u8; 8192];
                                    loop {
                                        match stream.read(&mut buf).await {
                                            Ok(0) => break,
                                            Ok(n) => {
                                                received.lock().await.extend_from_slice(&buf[..n]);
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
            received,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    async fn received(&self) -> Vec<u8> {
        self.received.lock().await.clone()
    }
}

impl Drop for TcpEchoBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

struct TlsBackend {
    addr: SocketAddr,
    cert_der: Vec<u8>,
    connections: Arc<AtomicU64>,
    marker: String,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TlsBackend {
    async fn spawn(server_name: &str, marker: &str) -> io::Result<Self> {
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
            marker: marker.to_string(),
            shutdown_tx: Some(shutdown_tx),
        })
    }

    fn connection_count(&self) -> u64 {
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

/// What a PROXY-aware backend saw at the start of a connection.
#[derive(Debug, Clone)]
struct CapturedHeader {
    header: ProxyProtocolV2,
    payload: Vec<u8>,
}

struct ProxyV2Backend {
    addr: SocketAddr,
    last_header: Arc<Mutex<Option<CapturedHeader>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl ProxyV2Backend {
    /// Accepts, reads the header plus `payload_len` bytes, then replies `ack`.
    async fn spawn(payload_len: usize) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let last_header = Arc::new(Mutex::new(None));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let header_clone = Arc::clone(&last_header);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((mut stream, _)) => {
                                let header_store = Arc::clone(&header_clone);
                                tokio::spawn(async move {
                                    let mut base = [0u8; 16];
                                    if stream.read_exact(&mut base).await.is_err() {
                                        return;
                                    }
                                    let addr_len = u16::from_be_bytes([base[14], base[15]]);
                                    let mut data = base.to_vec();
                                    data.resize(16 + usize::from(addr_len) + payload_len, 0);
                                    if stream.read_exact(&mut data[16..]).await.is_err() {
                                        return;
                                    }

                                    if let Some((header, used)) = parse_proxy_v2(&data) {
                                        *header_store.lock().await = Some(CapturedHeader {
                                            header,
                                            payload: data[used..].to_vec(),
                                        });
                                    }
                                    let _ = stream.write_all(b"ack").await;
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
            last_header,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    async fn get_last_header(&self) -> Option<CapturedHeader> {
        self.last_header.lock().await.clone()
    }
}

impl Drop for ProxyV2Backend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn tls_client_connect(
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

#[tokio::test]
async fn http_host_wildcard_reaches_backend_unmodified() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let directory = Directory::builder()
        .insert(Protocol::Http, "_.example.com", local_backend(backend.addr.port()))
        .build();
    let ingress = spawn_stream(Protocol::Http, directory).await.unwrap();

    let request = b"GET /index.html HTTP/1.1\r\nHost: a.example.com\r\nUser-Agent: test\r\n\r\n";
    let mut client = TcpStream::connect(ingress.listen_addr).await.unwrap();
    client.write_all(request).await.unwrap();

    let mut echoed = vec![0u8; request.len()];
    timeout(TEST_TIMEOUT, client.read_exact(&mut echoed))
        .await
        .expect("echo timed out")
        .unwrap();

    assert_eq!(echoed, request);
    assert_eq!(backend.received().await, request);
    assert_eq!(backend.connection_count(), 1);
}

#[tokio::test]
async fn request_without_host_uses_default_entry() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let directory = Directory::builder()
        .insert(Protocol::Http, "__default__", local_backend(backend.addr.port()))
        .build();
    let ingress = spawn_stream(Protocol::Http, directory).await.unwrap();

    let request = b"GET / HTTP/1.0\r\n\r\n";
    let mut client = TcpStream::connect(ingress.listen_addr).await.unwrap();
    client.write_all(request).await.unwrap();

    let mut echoed = vec![0u8; request.len()];
    timeout(TEST_TIMEOUT, client.read_exact(&mut echoed))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(echoed, request);
}

#[tokio::test]
async fn tls_passthrough_sni_routes_to_correct_backend() {
    let backend_a = TlsBackend::spawn("a.example.test", "A").await.unwrap();
    let backend_b = TlsBackend::spawn("b.example.test", "B").await.unwrap();

    let directory = Directory::builder()
        .insert(Protocol::Https, "a.example.test", local_backend(backend_a.addr.port()))
        .insert(Protocol::Https, "b.example.test", local_backend(backend_b.addr.port()))
        .build();
    let ingress = spawn_stream(Protocol::Https, directory).await.unwrap();

    for (name, backend) in [("a.example.test", &backend_a), ("b.example.test", &backend_b)] {
        let result = timeout(TEST_TIMEOUT, async {
            let mut stream =
                tls_client_connect(ingress.listen_addr, name, &backend.cert_der).await?;

            stream.write_all(b"whoami").await?;
            stream.flush().await?;

            let mut buf = vec![0u8; 16];
            let n = stream.read(&mut buf).await?;
            Ok::<_, std::io::Error>(String::from_utf8_lossy(&buf[..n]).to_string())
        })
        .await;

        match result {
            Ok(Ok(response)) => assert_eq!(response, backend.marker),
            Ok(Err(e)) => panic!("TLS connection to {name} failed: {e}"),
            Err(_) => panic!("TLS connection to {name} timed out"),
        }
    }

    assert_eq!(backend_a.connection_count(), 1);
    assert_eq!(backend_b.connection_count(), 1);
}

#[tokio::test]
async fn proxy_v2_header_precedes_sniffed_bytes() {
    let request = b"GET / HTTP/1.1\r\nHost: app.example.com\r\n\r\n";
    let backend = ProxyV2Backend::spawn(request.len()).await.unwrap();

    let directory = Directory::builder()
        .insert(
            Protocol::Http,
            "app.example.com",
            local_backend(backend.addr.port()).with_proxy_protocol(true),
        )
        .build();
    let ingress = spawn_stream(Protocol::Http, directory).await.unwrap();

    let mut client = TcpStream::connect(ingress.listen_addr).await.unwrap();
    client.write_all(request).await.unwrap();

    let mut ack = [0u8; 3];
    timeout(TEST_TIMEOUT, client.read_exact(&mut ack))
        .await
        .expect("ack timed out")
        .unwrap();
    assert_eq!(&ack, b"ack");

    let captured = backend.get_last_header().await.expect("no PROXY header");
    assert_eq!(captured.header.transport(), Transport::Stream);
    assert_eq!(captured.header.src_addr(), client.local_addr().unwrap());
    assert_eq!(captured.header.dst_addr(), ingress.listen_addr);
    assert_eq!(captured.payload, request);
}

#[tokio::test]
async fn unknown_host_is_dropped_without_dialing() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let directory = Directory::builder()
        .insert(Protocol::Http, "a.example.com", local_backend(backend.addr.port()))
        .build();
    let ingress = spawn_stream(Protocol::Http, directory).await.unwrap();

    let mut client = TcpStream::connect(ingress.listen_addr).await.unwrap();
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: b.example.com\r\n\r\n")
        .await
        .unwrap();

    assert!(read_until_closed(&mut client).await.is_empty());
    assert_eq!(backend.connection_count(), 0);
    assert_eq!(
        ingress
            .metrics
            .raw_connections_total(Protocol::Http, &ingress.label()),
        1
    );
}

#[tokio::test]
async fn non_tls_bytes_on_https_listener_are_dropped() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let directory = Directory::builder()
        .insert(Protocol::Https, "__default__", local_backend(backend.addr.port()))
        .build();
    let ingress = spawn_stream(Protocol::Https, directory).await.unwrap();

    let mut client = TcpStream::connect(ingress.listen_addr).await.unwrap();
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: a.example.com\r\n\r\n")
        .await
        .unwrap();

    assert!(read_until_closed(&mut client).await.is_empty());
    assert_eq!(backend.connection_count(), 0);
}

#[tokio::test]
async fn host_passthrough_dials_requested_hostname() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let directory = Directory::builder()
        .insert(
            Protocol::Http,
            "127.0.0.1",
            BackendDescriptor::new("backend.invalid", backend.addr.port())
                .with_host_passthrough(true),
        )
        .build();
    let ingress = spawn_stream(Protocol::Http, directory).await.unwrap();

    let request = format!(
        "GET / HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
        ingress.listen_addr.port()
    );
    let mut client = TcpStream::connect(ingress.listen_addr).await.unwrap();
    client.write_all(request.as_bytes()).await.unwrap();

    let mut echoed = vec![0u8; request.len()];
    timeout(TEST_TIMEOUT, client.read_exact(&mut echoed))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(echoed, request.as_bytes());
}

#[tokio::test]
async fn dial_failure_drops_client() {
    let closed = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_port = closed.local_addr().unwrap().port();
    drop(closed);

    let descriptor = local_backend(dead_port);
    let directory = Directory::builder()
        .insert(Protocol::Http, "__default__", descriptor.clone())
        .build();
    let ingress = spawn_stream(Protocol::Http, directory).await.unwrap();

    let mut client = TcpStream::connect(ingress.listen_addr).await.unwrap();
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: a.example.com\r\n\r\n")
        .await
        .unwrap();

    assert!(read_until_closed(&mut client).await.is_empty());

    let mut counted = descriptor;
    counted.matched_pattern = "__default__".to_string();
    assert_eq!(
        ingress
            .metrics
            .connections_total(Protocol::Http, &ingress.label(), &counted),
        0
    );
}

#[tokio::test]
async fn open_connection_gauge_follows_relay_lifetime() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let directory = Directory::builder()
        .insert(Protocol::Http, "_.example.com", local_backend(backend.addr.port()))
        .build();
    let ingress = spawn_stream(Protocol::Http, directory).await.unwrap();
    let label = ingress.label();

    let mut counted = local_backend(backend.addr.port());
    counted.matched_pattern = "_.example.com".to_string();

    let request = b"GET / HTTP/1.1\r\nHost: www.example.com\r\n\r\n";
    let mut client = TcpStream::connect(ingress.listen_addr).await.unwrap();
    client.write_all(request).await.unwrap();
    let mut echoed = vec![0u8; request.len()];
    timeout(TEST_TIMEOUT, client.read_exact(&mut echoed))
        .await
        .expect("echo timed out")
        .unwrap();

    let metrics = &ingress.metrics;
    assert_eq!(
        metrics.open_connections(Protocol::Http, &label, &counted),
        1
    );
    assert_eq!(
        metrics.connections_total(Protocol::Http, &label, &counted),
        1
    );
    assert_eq!(metrics.raw_connections_total(Protocol::Http, &label), 1);

    drop(client);
    let (label_ref, counted_ref) = (label.as_str(), &counted);
    assert!(
        eventually(TEST_TIMEOUT, move || async move {
            metrics.open_connections(Protocol::Http, label_ref, counted_ref) == 0
        })
        .await
    );
    assert_eq!(
        metrics.connections_total(Protocol::Http, &label, &counted),
        1
    );
}
