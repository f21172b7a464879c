// Common test utilities and fixtures

use async_trait::async_trait;
use eatsome_printer_bridge::config::{PrinterIdentity, RelayConfig, TransportKind};
use eatsome_printer_bridge::errors::{ConnectionError, SendError};
use eatsome_printer_bridge::relay::{server, RelayService};
use eatsome_printer_bridge::transport::{PrinterTransport, TransportFactory};
use socket2::{Domain, Socket, Type};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

/// Raw-port printer on loopback. Records every connection's bytes.
#[allow(dead_code)]
pub struct FakePrinter {
    pub addr: SocketAddr,
    received: Arc<Mutex<Vec<Vec<u8>>>>,
    connections: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

#[allow(dead_code)]
impl FakePrinter {
    pub async fn start() -> Self {
        Self::start_on("127.0.0.1:0", None).await
    }

    /// Answers `reply` as soon as the first bytes of a job arrive.
    pub async fn start_with_reply(reply: Vec<u8>) -> Self {
        Self::start_on("127.0.0.1:0", Some(reply)).await
    }

    pub async fn start_on(bind: &str, reply: Option<Vec<u8>>) -> Self {
        let listener = TcpListener::bind(bind)
            .await
            .expect("Failed to bind fake printer");
        let addr = listener.local_addr().expect("Fake printer has no address");
        let received = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));

        let task = {
            let received = received.clone();
            let connections = connections.clone();
            tokio::spawn(async move {
                while let Ok((mut socket, _)) = listener.accept().await {
                    connections.fetch_add(1, Ordering::SeqCst);
                    let received = received.clone();
                    let reply = reply.clone();
                    tokio::spawn(async move {
                        let mut data = Vec::new();
                        let mut buf = [0u8; 4096];
                        let mut replied = false;
                        loop {
                            let read = tokio::time::timeout(
                                Duration::from_secs(5),
                                socket.read(&mut buf),
                            )
                            .await;
                            match read {
                                Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
                                Ok(Ok(n)) => {
                                    data.extend_from_slice(&buf[..n]);
                                    if let (Some(reply), false) = (&reply, replied) {
                                        let _ = socket.write_all(reply).await;
                                        let _ = socket.shutdown().await;
                                        replied = true;
                                    }
                                }
                            }
                        }
                        received.lock().await.push(data);
                    });
                }
            })
        };

        Self {
            addr,
            received,
            connections,
            task,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Payloads of finished connections, in completion order.
    pub async fn received(&self) -> Vec<Vec<u8>> {
        self.received.lock().await.clone()
    }

    /// Wait until `count` connections have been fully read.
    pub async fn wait_for_jobs(&self, count: usize) -> Vec<Vec<u8>> {
        for _ in 0..100 {
            let received = self.received().await;
            if received.len() >= count {
                return received;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.received().await
    }
}

impl Drop for FakePrinter {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Relay server on an ephemeral loopback port.
#[allow(dead_code)]
pub struct TestRelay {
    pub addr: SocketAddr,
    pub service: Arc<RelayService>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<std::io::Result<()>>,
}

#[allow(dead_code)]
impl TestRelay {
    pub async fn start() -> Self {
        Self::start_with(RelayConfig::default()).await
    }

    pub async fn start_with(config: RelayConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind relay");
        let addr = listener.local_addr().expect("Relay has no address");
        let service = Arc::new(RelayService::new(config));
        let (shutdown, rx) = oneshot::channel::<()>();

        let task = tokio::spawn(server::serve(listener, service.clone(), async move {
            let _ = rx.await;
        }));

        Self {
            addr,
            service,
            shutdown: Some(shutdown),
            task,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = (&mut self.task).await;
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Shared counters for every transport a `FakeFactory` hands out.
#[derive(Default)]
#[allow(dead_code)]
pub struct FakeStats {
    pub created: AtomicUsize,
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    /// Transports connected and not yet released
    pub live: AtomicUsize,
    pub peak_live: AtomicUsize,
    pub sent: Mutex<Vec<Vec<u8>>>,
}

/// In-memory driver with configurable delays and connect outcome.
pub struct FakeTransport {
    stats: Arc<FakeStats>,
    connect_delay: Duration,
    send_delay: Duration,
    fail_connect: Option<ConnectionError>,
    connected: bool,
}

#[async_trait]
impl PrinterTransport for FakeTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Network
    }

    async fn connect(&mut self) -> Result<(), ConnectionError> {
        self.stats.connects.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.connect_delay).await;
        if let Some(e) = &self.fail_connect {
            return Err(e.clone());
        }
        self.connected = true;
        let live = self.stats.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.peak_live.fetch_max(live, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&mut self) {
        if self.connected {
            self.stats.disconnects.fetch_add(1, Ordering::SeqCst);
            self.stats.live.fetch_sub(1, Ordering::SeqCst);
            self.connected = false;
        }
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), SendError> {
        if !self.connected {
            return Err(SendError::NotConnected);
        }
        tokio::time::sleep(self.send_delay).await;
        self.stats.sent.lock().await.push(data.to_vec());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn status(&self) -> String {
        format!("fake: connected={}", self.connected)
    }
}

#[allow(dead_code)]
pub struct FakeFactory {
    pub stats: Arc<FakeStats>,
    pub connect_delay: Duration,
    pub send_delay: Duration,
    pub fail_connect: Option<ConnectionError>,
}

#[allow(dead_code)]
impl FakeFactory {
    pub fn new() -> Self {
        Self {
            stats: Arc::new(FakeStats::default()),
            connect_delay: Duration::ZERO,
            send_delay: Duration::ZERO,
            fail_connect: None,
        }
    }

    pub fn with_send_delay(mut self, delay: Duration) -> Self {
        self.send_delay = delay;
        self
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn failing(mut self, error: ConnectionError) -> Self {
        self.fail_connect = Some(error);
        self
    }
}

impl TransportFactory for FakeFactory {
    fn create(&self, _identity: &PrinterIdentity) -> Box<dyn PrinterTransport> {
        self.stats.created.fetch_add(1, Ordering::SeqCst);
        Box::new(FakeTransport {
            stats: self.stats.clone(),
            connect_delay: self.connect_delay,
            send_delay: self.send_delay,
            fail_connect: self.fail_connect.clone(),
            connected: false,
        })
    }
}

/// A listener whose accept queue is already full, so new connects hang in
/// the handshake until the caller's timeout. Relies on Linux dropping SYNs
/// on accept queue overflow.
#[allow(dead_code)]
pub struct StalledListener {
    pub addr: SocketAddr,
    _listener: Socket,
    _backlog: Vec<std::net::TcpStream>,
}

#[allow(dead_code)]
pub fn stalled_listener(ip: &str, port: u16) -> StalledListener {
    let addr: SocketAddr = format!("{}:{}", ip, port)
        .parse()
        .expect("Invalid listener address");
    let listener = Socket::new(Domain::IPV4, Type::STREAM, None).expect("Failed to create socket");
    listener
        .set_reuse_address(true)
        .expect("Failed to set SO_REUSEADDR");
    listener.bind(&addr.into()).expect("Failed to bind stalled listener");
    listener.listen(0).expect("Failed to listen");
    let addr = listener
        .local_addr()
        .expect("No address")
        .as_socket()
        .expect("Not an inet address");

    // Never accepted; fill the queue until the handshake stops completing
    let mut backlog = Vec::new();
    for _ in 0..16 {
        match std::net::TcpStream::connect_timeout(&addr, Duration::from_millis(200)) {
            Ok(stream) => backlog.push(stream),
            Err(_) => break,
        }
    }

    StalledListener {
        addr,
        _listener: listener,
        _backlog: backlog,
    }
}

/// A port on loopback with nothing listening.
#[allow(dead_code)]
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind loopback listener");
    let port = listener.local_addr().expect("No address").port();
    drop(listener);
    port
}

/// ESC/POS-style test payload of `len` bytes.
#[allow(dead_code)]
pub fn test_payload(len: usize) -> Vec<u8> {
    let mut payload = vec![0x1B, 0x40];
    payload.extend((0..len.saturating_sub(2)).map(|i| b'A' + (i % 26) as u8));
    payload.truncate(len);
    payload
}
