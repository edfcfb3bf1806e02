//! Connection management.
//!
//! A [`Connection`] owns one transport at a time. While connected, a read task
//! feeds transport bytes into a [`StreamAssembler`] and forwards frames to a
//! dispatch task, which routes them to event subscribers or to the request
//! waiting on the frame's correlation id.

use crate::correlation::CorrelationTable;
use crate::dispatch::Dispatcher;
use crate::error::ClientError;
use crate::event::{Disconnect, DisconnectReason, Event};
use crate::stream::ClientStream;
use crate::tls::tls_connector;
use bytes::Bytes;
use qwire_protocol::message::ErrorPayload;
use qwire_protocol::{
    ErrorCode, Frame, MsgPack, PacketKind, RequestKind, ResponseKind, StreamAssembler,
    DEFAULT_MAX_PAYLOAD_SIZE,
};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Default capacity for the event channel.
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default capacity of the queue between the read task and the dispatch task.
const DEFAULT_DISPATCH_QUEUE_CAPACITY: usize = 64;

const DISCONNECT_CHANNEL_CAPACITY: usize = 16;

/// TLS configuration for client connections.
#[derive(Debug, Clone, Default)]
pub struct TlsClientConfig {
    /// Enable TLS for the connection.
    pub enabled: bool,
    /// Path to PEM-encoded CA certificate(s). If None, webpki roots are used.
    pub ca_cert_path: Option<PathBuf>,
    /// Path to PEM-encoded client certificate (for mTLS).
    pub client_cert_path: Option<PathBuf>,
    /// Path to PEM-encoded client private key (for mTLS).
    pub client_key_path: Option<PathBuf>,
    /// Skip server certificate verification (INSECURE - development only).
    pub insecure: bool,
    /// Server name for SNI (defaults to the endpoint host).
    pub server_name: Option<String>,
}

impl TlsClientConfig {
    pub fn new() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    pub fn with_ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self.enabled = true;
        self
    }

    pub fn with_client_cert(
        mut self,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        self.client_cert_path = Some(cert_path.into());
        self.client_key_path = Some(key_path.into());
        self.enabled = true;
        self
    }

    pub fn with_insecure(mut self) -> Self {
        self.insecure = true;
        self.enabled = true;
        self
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self.enabled = true;
        self
    }
}

/// Credentials sent in an auth request.
///
/// Encodes as the token string or as a `[username, password]` pair.
#[derive(Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Credentials {
    Token(String),
    Password(String, String),
}

impl Credentials {
    pub fn token(token: impl Into<String>) -> Self {
        Credentials::Token(token.into())
    }

    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials::Password(username.into(), password.into())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Token(_) => f.write_str("Token(***)"),
            Credentials::Password(user, _) => write!(f, "Password({}, ***)", user),
        }
    }
}

/// Where a connection goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// A node's TCP client port.
    Tcp { host: String, port: u16 },
    /// A child process speaking the protocol on its stdin/stdout.
    Pipe { program: String, args: Vec<String> },
}

impl Endpoint {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Endpoint::Tcp {
            host: host.into(),
            port,
        }
    }

    pub fn pipe<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Endpoint::Pipe {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Parses `host`, `host:port` or `[v6addr]:port`.
    pub fn parse_tcp(addr: &str, default_port: u16) -> Option<Self> {
        if let Some(rest) = addr.strip_prefix('[') {
            let (host, tail) = rest.split_once(']')?;
            let port = match tail.strip_prefix(':') {
                Some(p) => p.parse().ok()?,
                None if tail.is_empty() => default_port,
                None => return None,
            };
            return Some(Endpoint::tcp(host, port));
        }

        match addr.rsplit_once(':') {
            // A bare IPv6 address has more than one colon and no port.
            Some((host, _)) if host.contains(':') => Some(Endpoint::tcp(addr, default_port)),
            Some((host, port)) => Some(Endpoint::tcp(host, port.parse().ok()?)),
            None if addr.is_empty() => None,
            None => Some(Endpoint::tcp(addr, default_port)),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } if host.contains(':') => write!(f, "[{}]:{}", host, port),
            Endpoint::Tcp { host, port } => write!(f, "{}:{}", host, port),
            Endpoint::Pipe { program, .. } => write!(f, "pipe:{}", program),
        }
    }
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Where to connect.
    pub endpoint: Endpoint,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Default request timeout.
    pub request_timeout: Duration,
    /// Read buffer size for transport reads.
    pub read_buffer_size: usize,
    /// Largest payload accepted from the peer.
    pub max_payload_size: u32,
    /// Frames buffered between the read task and the dispatch task.
    pub dispatch_queue_capacity: usize,
    /// Events buffered per subscriber before it starts lagging.
    pub event_channel_capacity: usize,
    /// Credentials to authenticate with right after connecting.
    pub auth: Option<Credentials>,
    /// TLS configuration (optional, TCP only).
    pub tls: Option<TlsClientConfig>,
}

impl ConnectionConfig {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            dispatch_queue_capacity: DEFAULT_DISPATCH_QUEUE_CAPACITY,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            auth: None,
            tls: None,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }

    pub fn with_max_payload_size(mut self, size: u32) -> Self {
        self.max_payload_size = size;
        self
    }

    pub fn with_dispatch_queue_capacity(mut self, capacity: usize) -> Self {
        self.dispatch_queue_capacity = capacity.max(1);
        self
    }

    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    pub fn with_auth(mut self, credentials: Credentials) -> Self {
        self.auth = Some(credentials);
        self
    }

    pub fn with_tls(mut self, tls_config: TlsClientConfig) -> Self {
        self.tls = Some(tls_config);
        self
    }
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

/// What the read task hands to the dispatch task.
type Incoming = Result<Frame, ClientError>;

struct Link {
    state: SessionState,
    /// Bumped on every connect; background tasks of older links are ignored.
    generation: u64,
    read_task: Option<JoinHandle<()>>,
    dispatch_task: Option<JoinHandle<()>>,
    /// Cleared on teardown; the dispatch task discards whatever is still queued.
    live: Arc<AtomicBool>,
}

/// An in-flight connect. Dropped before `commit`, it puts the session back to
/// `Disconnected` so a cancelled connect does not block the next one.
struct ConnectAttempt<'a> {
    link: &'a parking_lot::Mutex<Link>,
    committed: bool,
}

impl ConnectAttempt<'_> {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for ConnectAttempt<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut link = self.link.lock();
        if link.state == SessionState::Connecting {
            link.state = SessionState::Disconnected;
        }
    }
}

/// A connection to a node.
pub struct Connection {
    config: ConnectionConfig,
    link: parking_lot::Mutex<Link>,
    /// Write half of the stream (for sending requests).
    writer: Mutex<Option<WriteHalf<ClientStream>>>,
    /// Requests waiting for responses.
    table: Arc<CorrelationTable>,
    /// Next correlation id. Wraps at 2^16.
    next_id: AtomicU16,
    events: broadcast::Sender<Event>,
    disconnects: broadcast::Sender<Disconnect>,
}

impl Connection {
    /// Creates a new connection (not yet connected).
    pub fn new(config: ConnectionConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_channel_capacity.max(1));
        let (disconnects, _) = broadcast::channel(DISCONNECT_CHANNEL_CAPACITY);
        Self {
            config,
            link: parking_lot::Mutex::new(Link {
                state: SessionState::Disconnected,
                generation: 0,
                read_task: None,
                dispatch_task: None,
                live: Arc::new(AtomicBool::new(false)),
            }),
            writer: Mutex::new(None),
            table: Arc::new(CorrelationTable::new()),
            next_id: AtomicU16::new(0),
            events,
            disconnects,
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.config.endpoint
    }

    pub fn state(&self) -> SessionState {
        self.link.lock().state
    }

    /// Returns whether the connection is established.
    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Returns the number of requests waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.table.len()
    }

    /// Subscribes to unsolicited events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Subscribes to disconnect notifications, one per lost connection.
    pub fn subscribe_disconnects(&self) -> broadcast::Receiver<Disconnect> {
        self.disconnects.subscribe()
    }

    /// Waits until the current connection goes away.
    ///
    /// Returns immediately when not connected.
    pub async fn closed(&self) -> Option<Disconnect> {
        let mut rx = self.disconnects.subscribe();
        if !self.is_connected() {
            return None;
        }
        rx.recv().await.ok()
    }

    /// Opens the configured endpoint and starts the background tasks.
    ///
    /// Does nothing when already connected.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ClientError> {
        let Some(attempt) = self.begin_connect()? else {
            return Ok(());
        };

        tracing::debug!("Connecting to {}...", self.config.endpoint);
        match self.open().await {
            Ok(stream) => {
                self.start(stream, attempt).await;
                Ok(())
            }
            Err(e) => {
                tracing::debug!("Connection to {} failed: {}", self.config.endpoint, e);
                Err(e)
            }
        }
    }

    /// Starts a session over an already opened stream.
    pub async fn connect_stream(self: &Arc<Self>, stream: ClientStream) -> Result<(), ClientError> {
        let Some(attempt) = self.begin_connect()? else {
            return Ok(());
        };
        self.start(stream, attempt).await;
        Ok(())
    }

    /// Moves to `Connecting`. Returns `None` if already connected.
    fn begin_connect(&self) -> Result<Option<ConnectAttempt<'_>>, ClientError> {
        let mut link = self.link.lock();
        match link.state {
            SessionState::Connected => Ok(None),
            SessionState::Connecting => Err(ClientError::AlreadyConnecting),
            SessionState::Disconnected => {
                link.state = SessionState::Connecting;
                Ok(Some(ConnectAttempt {
                    link: &self.link,
                    committed: false,
                }))
            }
        }
    }

    async fn open(&self) -> Result<ClientStream, ClientError> {
        let connect_timeout = self.config.connect_timeout;

        match &self.config.endpoint {
            Endpoint::Tcp { host, port } => {
                let tcp_stream =
                    tokio::time::timeout(connect_timeout, TcpStream::connect((host.as_str(), *port)))
                        .await
                        .map_err(|_| ClientError::Timeout)??;

                tcp_stream.set_nodelay(true).ok();

                match self.config.tls {
                    Some(ref tls) if tls.enabled => {
                        let (connector, server_name) = tls_connector(tls, host)?;
                        tracing::debug!("Performing TLS handshake...");
                        let tls_stream = tokio::time::timeout(
                            connect_timeout,
                            connector.connect(server_name, tcp_stream),
                        )
                        .await
                        .map_err(|_| ClientError::Timeout)?
                        .map_err(|e| ClientError::TlsHandshake(e.to_string()))?;
                        Ok(ClientStream::Tls { stream: tls_stream })
                    }
                    _ => Ok(ClientStream::Plain { stream: tcp_stream }),
                }
            }
            Endpoint::Pipe { program, args } => {
                let mut child = Command::new(program)
                    .args(args)
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::inherit())
                    .kill_on_drop(true)
                    .spawn()
                    .map_err(|e| ClientError::Spawn(format!("{}: {}", program, e)))?;

                let writer = child
                    .stdin
                    .take()
                    .ok_or_else(|| ClientError::Spawn(format!("{}: stdin not piped", program)))?;
                let reader = child
                    .stdout
                    .take()
                    .ok_or_else(|| ClientError::Spawn(format!("{}: stdout not piped", program)))?;

                Ok(ClientStream::Pipe {
                    reader,
                    writer,
                    child,
                })
            }
        }
    }

    async fn start(self: &Arc<Self>, stream: ClientStream, attempt: ConnectAttempt<'_>) {
        let kind = stream.kind();
        let (read_half, write_half) = tokio::io::split(stream);
        *self.writer.lock().await = Some(write_half);

        let (tx, rx) = mpsc::channel(self.config.dispatch_queue_capacity.max(1));
        let assembler = StreamAssembler::with_max_payload(self.config.max_payload_size);
        let dispatcher = Dispatcher::new(self.table.clone(), self.events.clone());

        let live = Arc::new(AtomicBool::new(true));
        let generation = {
            let mut link = self.link.lock();
            link.generation += 1;
            let generation = link.generation;
            link.live = live.clone();
            link.read_task = Some(tokio::spawn(read_loop(
                read_half,
                assembler,
                self.config.read_buffer_size,
                tx,
            )));
            link.dispatch_task = Some(tokio::spawn(dispatch_loop(
                Arc::downgrade(self),
                generation,
                dispatcher,
                rx,
                live,
            )));
            link.state = SessionState::Connected;
            generation
        };
        attempt.commit();

        tracing::debug!(
            "Connected to {} over {} (generation {})",
            self.config.endpoint,
            kind,
            generation
        );
    }

    /// Tears down the link identified by `generation`, at most once.
    async fn teardown(&self, generation: u64, reason: DisconnectReason) -> bool {
        // Holding the writer lock first keeps a concurrent reconnect from
        // installing its writer before the old one is taken.
        let mut writer_guard = self.writer.lock().await;

        let read_task = {
            let mut link = self.link.lock();
            if link.generation != generation || link.state != SessionState::Connected {
                return false;
            }
            link.state = SessionState::Disconnected;
            link.live.store(false, Ordering::Release);
            link.dispatch_task = None;
            link.read_task.take()
        };

        if let Some(task) = read_task {
            task.abort();
        }

        if let Some(mut writer) = writer_guard.take() {
            let _ = writer.shutdown().await;
        }
        drop(writer_guard);

        let pending_failed = self.table.drain_all();
        if pending_failed > 0 {
            tracing::warn!(
                "Failed {} pending request(s) after losing {}",
                pending_failed,
                self.config.endpoint
            );
        }

        tracing::debug!("Disconnected from {} ({:?})", self.config.endpoint, reason);
        let _ = self.disconnects.send(Disconnect {
            pending_failed,
            reason,
        });
        true
    }

    /// Closes the connection.
    ///
    /// Every pending request fails with `ConnectionClosed`. The connection can
    /// be connected again afterwards.
    pub async fn close(&self) -> Result<(), ClientError> {
        let generation = {
            let link = self.link.lock();
            if link.state != SessionState::Connected {
                return Ok(());
            }
            link.generation
        };

        tracing::debug!("Closing connection to {}...", self.config.endpoint);
        self.teardown(generation, DisconnectReason::Closed).await;
        Ok(())
    }

    /// Sends a request and waits for its response.
    ///
    /// Error responses come back as [`ClientError::Server`]. On timeout the
    /// pending slot is freed; a response arriving later is dropped.
    pub async fn send(
        &self,
        kind: RequestKind,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Frame, ClientError> {
        let generation = {
            let link = self.link.lock();
            if link.state != SessionState::Connected {
                tracing::debug!("send() called but not connected");
                return Err(ClientError::NotConnected);
            }
            link.generation
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let encoded = Frame::encode(id, kind.tag(), &payload)?;

        // Registered before writing so a fast response always finds its slot.
        let rx = self.table.register(id)?;

        if let Err(e) = self.write(&encoded).await {
            self.table.remove(id);
            if let ClientError::Io(ref io) = e {
                tracing::warn!("Write to {} failed: {}", self.config.endpoint, io);
                let cause = std::io::Error::new(io.kind(), io.to_string());
                self.teardown(
                    generation,
                    DisconnectReason::Failed(Arc::new(ClientError::Io(cause))),
                )
                .await;
            }
            return Err(e);
        }
        tracing::debug!(
            "Request id={} {:?} sent ({} bytes), waiting for response...",
            id,
            kind,
            encoded.len()
        );

        let frame = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(delivery)) => delivery?,
            Ok(Err(_)) => return Err(ClientError::ConnectionClosed),
            Err(_) => {
                tracing::debug!("Request id={} timed out after {:?}", id, timeout);
                self.table.remove(id);
                return Err(ClientError::Timeout);
            }
        };

        tracing::debug!("Request id={} got response type {}", id, frame.type_tag());
        interpret_response(kind, frame)
    }

    /// Encodes `value` as the payload and sends the request.
    pub async fn request<T: Serialize + ?Sized>(
        &self,
        kind: RequestKind,
        value: &T,
        timeout: Duration,
    ) -> Result<Frame, ClientError> {
        let payload = MsgPack::encode(value)?;
        self.send(kind, Bytes::from(payload), timeout).await
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), ClientError> {
        let mut writer_guard = self.writer.lock().await;
        let writer = writer_guard.as_mut().ok_or(ClientError::NotConnected)?;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let link = self.link.get_mut();
        if let Some(task) = link.read_task.take() {
            task.abort();
        }
        if let Some(task) = link.dispatch_task.take() {
            task.abort();
        }
    }
}

fn interpret_response(kind: RequestKind, frame: Frame) -> Result<Frame, ClientError> {
    match PacketKind::from_tag(frame.type_tag()) {
        PacketKind::Response(ResponseKind::Error) => {
            let err: ErrorPayload = MsgPack::decode(frame.payload())?;
            Err(ClientError::Server {
                code: ErrorCode::from_code(err.error_code),
                message: err.error_msg,
            })
        }
        PacketKind::Response(got) if got == kind.expected_response() => Ok(frame),
        _ => Err(ClientError::UnexpectedResponse {
            id: frame.correlation_id(),
            tag: frame.type_tag(),
        }),
    }
}

/// Reads transport bytes and forwards assembled frames, in stream order.
///
/// Ends after forwarding the first fatal error (EOF included).
pub(crate) async fn read_loop<R>(
    mut reader: R,
    mut assembler: StreamAssembler,
    buffer_size: usize,
    tx: mpsc::Sender<Incoming>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; buffer_size];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                if assembler.is_mid_frame() {
                    tracing::debug!(
                        "read_loop: EOF with {} bytes of an incomplete frame",
                        assembler.buffered()
                    );
                } else {
                    tracing::debug!("read_loop: connection closed");
                }
                let _ = tx.send(Err(ClientError::ConnectionClosed)).await;
                return;
            }
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                let _ = tx.send(Err(ClientError::Io(e))).await;
                return;
            }
        };

        assembler.extend(&buf[..n]);

        loop {
            match assembler.next_frame() {
                Ok(Some(frame)) => {
                    if tx.send(Ok(frame)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("read_loop: {}", e);
                    let _ = tx.send(Err(e.into())).await;
                    return;
                }
            }
        }
    }
}

async fn dispatch_loop(
    conn: Weak<Connection>,
    generation: u64,
    dispatcher: Dispatcher,
    mut rx: mpsc::Receiver<Incoming>,
    live: Arc<AtomicBool>,
) {
    let reason = loop {
        let incoming = rx.recv().await;
        if !live.load(Ordering::Acquire) {
            // Torn down already; frames still queued belong to a closed link.
            tracing::debug!("dispatch_loop: link closed, discarding queued frames");
            return;
        }
        match incoming {
            Some(Ok(frame)) => {
                dispatcher.dispatch(frame);
            }
            Some(Err(ClientError::ConnectionClosed)) => break DisconnectReason::Eof,
            Some(Err(e)) => {
                tracing::warn!("Connection failed: {}", e);
                break DisconnectReason::Failed(Arc::new(e));
            }
            // Read task aborted by close()
            None => break DisconnectReason::Closed,
        }
    };

    if let Some(conn) = conn.upgrade() {
        conn.teardown(generation, reason).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qwire_protocol::ProtocolError;
    use tokio::io::DuplexStream;
    use tokio::net::TcpListener;
    use tokio::time::Instant;

    struct Peer {
        stream: DuplexStream,
        assembler: StreamAssembler,
    }

    impl Peer {
        async fn recv(&mut self) -> Frame {
            loop {
                if let Some(frame) = self.assembler.next_frame().unwrap() {
                    return frame;
                }
                let mut buf = [0u8; 1024];
                let n = self.stream.read(&mut buf).await.unwrap();
                assert!(n > 0, "client closed the stream");
                self.assembler.extend(&buf[..n]);
            }
        }

        async fn reply(&mut self, id: u16, tag: u8, payload: &[u8]) {
            let encoded = Frame::encode(id, tag, payload).unwrap();
            self.stream.write_all(&encoded).await.unwrap();
        }
    }

    fn test_config() -> ConnectionConfig {
        ConnectionConfig::new(Endpoint::tcp("127.0.0.1", 9200))
    }

    async fn connected() -> (Arc<Connection>, Peer) {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let conn = Arc::new(Connection::new(test_config()));
        conn.connect_stream(ClientStream::boxed(near)).await.unwrap();
        (
            conn,
            Peer {
                stream: far,
                assembler: StreamAssembler::new(),
            },
        )
    }

    async fn wait_pending(conn: &Connection, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while conn.pending_count() != n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("pending requests never registered");
    }

    #[test]
    fn test_config_defaults() {
        let config = test_config();
        assert_eq!(config.read_buffer_size, DEFAULT_READ_BUFFER_SIZE);
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.max_payload_size, DEFAULT_MAX_PAYLOAD_SIZE);
    }

    #[test]
    fn test_config_buffer_clamping() {
        let config = test_config().with_read_buffer_size(100); // Below minimum
        assert_eq!(config.read_buffer_size, MIN_READ_BUFFER_SIZE);

        let config = test_config().with_read_buffer_size(10 * 1024 * 1024); // Above maximum
        assert_eq!(config.read_buffer_size, MAX_READ_BUFFER_SIZE);
    }

    #[test]
    fn test_credentials_encoding() {
        let token: String = MsgPack::decode(&MsgPack::encode(&Credentials::token("abc")).unwrap())
            .unwrap();
        assert_eq!(token, "abc");

        let pair: (String, String) =
            MsgPack::decode(&MsgPack::encode(&Credentials::password("admin", "pass")).unwrap())
                .unwrap();
        assert_eq!(pair, ("admin".to_string(), "pass".to_string()));

        let shown = format!("{:?}", Credentials::password("admin", "secret"));
        assert_eq!(shown, "Password(admin, ***)");
    }

    #[test]
    fn test_endpoint_parse_and_display() {
        assert_eq!(
            Endpoint::parse_tcp("node01.local", 9200),
            Some(Endpoint::tcp("node01.local", 9200))
        );
        assert_eq!(
            Endpoint::parse_tcp("10.0.0.2:9201", 9200),
            Some(Endpoint::tcp("10.0.0.2", 9201))
        );
        assert_eq!(
            Endpoint::parse_tcp("[::1]:9300", 9200),
            Some(Endpoint::tcp("::1", 9300))
        );
        assert_eq!(
            Endpoint::parse_tcp("::1", 9200),
            Some(Endpoint::tcp("::1", 9200))
        );
        assert_eq!(Endpoint::parse_tcp("host:notaport", 9200), None);

        assert_eq!(Endpoint::tcp("::1", 9200).to_string(), "[::1]:9200");
        assert_eq!(Endpoint::tcp("localhost", 9200).to_string(), "localhost:9200");
        assert_eq!(Endpoint::pipe("timod", ["--stdio"]).to_string(), "pipe:timod");
    }

    #[tokio::test]
    async fn test_send_while_disconnected() {
        let conn = Connection::new(test_config());
        assert_eq!(conn.state(), SessionState::Disconnected);

        let result = conn
            .send(RequestKind::Ping, Bytes::new(), Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(ClientError::NotConnected)));
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_ping_roundtrip() {
        let (conn, mut peer) = connected().await;
        assert!(conn.is_connected());

        let (result, _) = tokio::join!(
            conn.send(RequestKind::Ping, Bytes::new(), Duration::from_secs(5)),
            async {
                let req = peer.recv().await;
                assert_eq!(req.type_tag(), RequestKind::Ping.tag());
                assert_eq!(req.payload_length(), 0);
                peer.reply(req.correlation_id(), ResponseKind::Ping.tag(), b"")
                    .await;
            }
        );

        let frame = result.unwrap();
        assert_eq!(frame.type_tag(), ResponseKind::Ping.tag());
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_requests_out_of_order() {
        let (conn, mut peer) = connected().await;
        let timeout = Duration::from_secs(5);

        let (first, second, _) = tokio::join!(
            conn.request(RequestKind::Query, &("@:stuff", "1"), timeout),
            conn.request(RequestKind::Query, &("@:stuff", "2"), timeout),
            async {
                let a = peer.recv().await;
                let b = peer.recv().await;
                assert_ne!(a.correlation_id(), b.correlation_id());

                // Answer in reverse order, echoing the query code back.
                for req in [b, a] {
                    let (_, code): (String, String) = MsgPack::decode(req.payload()).unwrap();
                    let body = MsgPack::encode(&code).unwrap();
                    peer.reply(req.correlation_id(), ResponseKind::Query.tag(), &body)
                        .await;
                }
            }
        );

        let first: String = MsgPack::decode(first.unwrap().payload()).unwrap();
        let second: String = MsgPack::decode(second.unwrap().payload()).unwrap();
        assert_eq!(first, "1");
        assert_eq!(second, "2");
    }

    #[tokio::test]
    async fn test_timeout_frees_slot() {
        let (conn, mut peer) = connected().await;
        let timeout = Duration::from_millis(100);

        let started = Instant::now();
        let (result, stale) = tokio::join!(
            conn.send(RequestKind::Query, Bytes::new(), timeout),
            peer.recv()
        );
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(ClientError::Timeout)));
        assert!(elapsed >= timeout);
        assert!(elapsed < Duration::from_secs(2));
        assert_eq!(conn.pending_count(), 0);
        assert!(conn.is_connected());

        // The late answer is dropped and does not satisfy the next request.
        peer.reply(stale.correlation_id(), ResponseKind::Query.tag(), b"\xa4late")
            .await;

        let (result, _) = tokio::join!(
            conn.send(RequestKind::Query, Bytes::new(), Duration::from_secs(5)),
            async {
                let req = peer.recv().await;
                assert_ne!(req.correlation_id(), stale.correlation_id());
                peer.reply(req.correlation_id(), ResponseKind::Query.tag(), b"\xa5fresh")
                    .await;
            }
        );
        assert_eq!(result.unwrap().payload().as_ref(), b"\xa5fresh");
    }

    #[tokio::test]
    async fn test_correlation_id_wraps() {
        let (conn, mut peer) = connected().await;
        conn.next_id.store(u16::MAX, Ordering::Relaxed);

        for expected in [u16::MAX, 0] {
            let (result, _) = tokio::join!(
                conn.send(RequestKind::Ping, Bytes::new(), Duration::from_secs(5)),
                async {
                    let req = peer.recv().await;
                    assert_eq!(req.correlation_id(), expected);
                    peer.reply(req.correlation_id(), ResponseKind::Ping.tag(), b"")
                        .await;
                }
            );
            assert_eq!(result.unwrap().correlation_id(), expected);
        }
    }

    #[tokio::test]
    async fn test_error_response() {
        let (conn, mut peer) = connected().await;

        let (result, _) = tokio::join!(
            conn.request(RequestKind::Query, &("@:stuff", "x"), Duration::from_secs(5)),
            async {
                let req = peer.recv().await;
                let body = MsgPack::encode(&ErrorPayload {
                    error_msg: "property `x` not found".to_string(),
                    error_code: -54,
                })
                .unwrap();
                peer.reply(req.correlation_id(), ResponseKind::Error.tag(), &body)
                    .await;
            }
        );

        match result {
            Err(ClientError::Server { code, message }) => {
                assert_eq!(code, ErrorCode::Lookup);
                assert_eq!(message, "property `x` not found");
            }
            other => panic!("expected server error, got {:?}", other),
        }
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn test_mismatched_response_kind() {
        let (conn, mut peer) = connected().await;

        let (result, _) = tokio::join!(
            conn.send(RequestKind::Ping, Bytes::new(), Duration::from_secs(5)),
            async {
                let req = peer.recv().await;
                peer.reply(req.correlation_id(), ResponseKind::Auth.tag(), b"")
                    .await;
            }
        );
        assert!(matches!(
            result,
            Err(ClientError::UnexpectedResponse { tag: 17, .. })
        ));
    }

    #[tokio::test]
    async fn test_events_published() {
        let (conn, mut peer) = connected().await;
        let mut events = conn.subscribe_events();

        let body = MsgPack::encode("READY").unwrap();
        peer.reply(0, 0, &body).await;

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, qwire_protocol::EventKind::NodeStatus);
        assert_eq!(
            event.node_status(),
            Some(qwire_protocol::message::NodeStatus::Ready)
        );
    }

    #[tokio::test]
    async fn test_close_fails_pending_requests() {
        let (conn, _peer) = connected().await;
        let mut disconnects = conn.subscribe_disconnects();

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let conn = conn.clone();
                tokio::spawn(async move {
                    conn.send(RequestKind::Query, Bytes::new(), Duration::from_secs(30))
                        .await
                })
            })
            .collect();
        wait_pending(&conn, 3).await;

        conn.close().await.unwrap();
        assert_eq!(conn.state(), SessionState::Disconnected);

        for handle in handles {
            let result = handle.await.unwrap();
            assert!(matches!(result, Err(ClientError::ConnectionClosed)));
        }

        let notice = disconnects.recv().await.unwrap();
        assert_eq!(notice.pending_failed, 3);
        assert!(matches!(notice.reason, DisconnectReason::Closed));

        // Exactly one notification per disconnect
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(disconnects.try_recv().is_err());

        // Closing again is a no-op
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_eof_fails_pending_requests() {
        let (conn, peer) = connected().await;
        let mut disconnects = conn.subscribe_disconnects();

        let pending = {
            let conn = conn.clone();
            tokio::spawn(async move {
                conn.send(RequestKind::Query, Bytes::new(), Duration::from_secs(30))
                    .await
            })
        };
        wait_pending(&conn, 1).await;

        drop(peer);

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(ClientError::ConnectionClosed)));

        let notice = disconnects.recv().await.unwrap();
        assert!(matches!(notice.reason, DisconnectReason::Eof));
        assert_eq!(conn.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_malformed_frame_is_fatal() {
        let (conn, mut peer) = connected().await;
        let mut disconnects = conn.subscribe_disconnects();

        let pending = {
            let conn = conn.clone();
            tokio::spawn(async move {
                conn.send(RequestKind::Query, Bytes::new(), Duration::from_secs(30))
                    .await
            })
        };
        wait_pending(&conn, 1).await;

        peer.stream
            .write_all(&[0x04, 0x00, 0x00, 0x00, 0x05, 0x00, 0x42, 0x00])
            .await
            .unwrap();

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(ClientError::ConnectionClosed)));

        let notice = disconnects.recv().await.unwrap();
        match notice.reason {
            DisconnectReason::Failed(err) => assert!(matches!(
                *err,
                ClientError::Protocol(ProtocolError::MalformedHeader { .. })
            )),
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn test_reconnect_after_close() {
        let (conn, _old_peer) = connected().await;
        conn.close().await.unwrap();

        let (near, far) = tokio::io::duplex(64 * 1024);
        conn.connect_stream(ClientStream::boxed(near)).await.unwrap();
        assert!(conn.is_connected());

        let mut peer = Peer {
            stream: far,
            assembler: StreamAssembler::new(),
        };
        let (result, _) = tokio::join!(
            conn.send(RequestKind::Ping, Bytes::new(), Duration::from_secs(5)),
            async {
                let req = peer.recv().await;
                peer.reply(req.correlation_id(), ResponseKind::Ping.tag(), b"")
                    .await;
            }
        );
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_connect_is_noop_when_connected() {
        let (conn, _peer) = connected().await;
        let (other, _) = tokio::io::duplex(64);

        conn.connect_stream(ClientStream::boxed(other)).await.unwrap();
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn test_closed_waits_for_disconnect() {
        let (conn, peer) = connected().await;

        let waiter = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.closed().await })
        };
        while conn.disconnects.receiver_count() == 0 {
            tokio::task::yield_now().await;
        }
        drop(peer);

        let notice = waiter.await.unwrap();
        assert!(notice.is_some());

        // Already disconnected: returns at once
        assert!(conn.closed().await.is_none());
    }

    #[tokio::test]
    async fn test_read_loop_fragmented_stream() {
        let mut bytes = Frame::encode(1, 18, b"first").unwrap().to_vec();
        bytes.extend_from_slice(&Frame::encode(2, 2, b"event").unwrap());
        bytes.extend_from_slice(&Frame::encode(3, 16, b"").unwrap());

        let reader = tokio_test::io::Builder::new()
            .read(&bytes[..3])
            .read(&bytes[3..17])
            .read(&bytes[17..])
            .build();

        let (tx, mut rx) = mpsc::channel(8);
        read_loop(reader, StreamAssembler::new(), 1024, tx).await;

        for expected in [1u16, 2, 3] {
            let frame = rx.recv().await.unwrap().unwrap();
            assert_eq!(frame.correlation_id(), expected);
        }
        assert!(matches!(
            rx.recv().await,
            Some(Err(ClientError::ConnectionClosed))
        ));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_read_loop_stops_on_bad_checksum() {
        let mut bytes = Frame::encode(1, 18, b"ok").unwrap().to_vec();
        bytes.extend_from_slice(&[0, 0, 0, 0, 2, 0, 18, 0]);
        bytes.extend_from_slice(&Frame::encode(3, 18, b"never").unwrap());

        let reader = tokio_test::io::Builder::new().read(&bytes).build();
        let (tx, mut rx) = mpsc::channel(8);
        read_loop(reader, StreamAssembler::new(), 1024, tx).await;

        assert_eq!(rx.recv().await.unwrap().unwrap().correlation_id(), 1);
        assert!(matches!(
            rx.recv().await,
            Some(Err(ClientError::Protocol(ProtocolError::MalformedHeader { .. })))
        ));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_connect_can_be_retried() {
        // Accepts the socket, then never answers the TLS handshake.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let silent = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });

        let config = ConnectionConfig::new(Endpoint::tcp("127.0.0.1", port))
            .with_tls(TlsClientConfig::new().with_insecure());
        let conn = Arc::new(Connection::new(config));

        let result = tokio::time::timeout(Duration::from_millis(200), conn.connect()).await;
        assert!(result.is_err(), "handshake should still be stalled");
        assert_eq!(conn.state(), SessionState::Disconnected);

        let (near, _far) = tokio::io::duplex(64);
        conn.connect_stream(ClientStream::boxed(near)).await.unwrap();
        assert!(conn.is_connected());

        silent.abort();
    }

    #[tokio::test]
    async fn test_dispatch_loop_discards_after_teardown() {
        let table = Arc::new(CorrelationTable::new());
        let (events_tx, mut events) = broadcast::channel(8);
        let _pending = table.register(3).unwrap();

        let (tx, rx) = mpsc::channel(8);
        tx.send(Ok(Frame::new(0, 2, Bytes::new()).unwrap()))
            .await
            .unwrap();
        tx.send(Ok(Frame::new(3, 18, Bytes::new()).unwrap()))
            .await
            .unwrap();

        let live = Arc::new(AtomicBool::new(false));
        let dispatcher = Dispatcher::new(table.clone(), events_tx);
        dispatch_loop(Weak::new(), 1, dispatcher, rx, live).await;

        assert!(events.try_recv().is_err());
        assert!(table.contains(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pipe_transport_roundtrip() {
        // Swallows the 8-byte ping, answers id 0 with an empty RES_PING
        // (tag 16, checksum 0xEF) and exits.
        let script = r"head -c 8 >/dev/null; printf '\000\000\000\000\000\000\020\357'";
        let config = ConnectionConfig::new(Endpoint::pipe("sh", ["-c", script]));
        let conn = Arc::new(Connection::new(config));
        let mut disconnects = conn.subscribe_disconnects();

        conn.connect().await.unwrap();
        assert!(conn.is_connected());

        let frame = conn
            .send(RequestKind::Ping, Bytes::new(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(frame.correlation_id(), 0);
        assert_eq!(frame.type_tag(), ResponseKind::Ping.tag());

        let notice = tokio::time::timeout(Duration::from_secs(5), disconnects.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(notice.reason, DisconnectReason::Eof));
        assert_eq!(notice.pending_failed, 0);
        assert_eq!(conn.state(), SessionState::Disconnected);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pipe_echo_dropped_and_close() {
        let config = ConnectionConfig::new(Endpoint::pipe("cat", Vec::<String>::new()));
        let conn = Arc::new(Connection::new(config));
        conn.connect().await.unwrap();

        // cat sends the request frame straight back; a request tag from the
        // peer is dropped, so the request can only time out.
        let result = conn
            .send(RequestKind::Ping, Bytes::new(), Duration::from_millis(200))
            .await;
        assert!(matches!(result, Err(ClientError::Timeout)));
        assert!(conn.is_connected());

        let mut disconnects = conn.subscribe_disconnects();
        conn.close().await.unwrap();
        let notice = disconnects.recv().await.unwrap();
        assert!(matches!(notice.reason, DisconnectReason::Closed));
        assert_eq!(conn.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_session_reusable() {
        let config = ConnectionConfig::new(Endpoint::pipe(
            "/nonexistent/qwire-node",
            Vec::<String>::new(),
        ));
        let conn = Arc::new(Connection::new(config));

        let result = conn.connect().await;
        assert!(matches!(result, Err(ClientError::Spawn(_))));
        assert_eq!(conn.state(), SessionState::Disconnected);
    }
}
