//! Per-client connection session.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! 1. Client connects, gets a ClientId and a NotificationStream
//!        │
//!        ▼
//! 2. ┌──────────────────────────────────────────┐
//!    │  select! {                               │
//!    │    socket readable   → parse, evaluate,  │
//!    │                        reply             │
//!    │    notification      → push frame        │
//!    │  }                                       │
//!    └──────────────────────────────────────────┘
//!        │
//!        ▼
//! 3. Client disconnects / error → Engine::disconnect(client)
//! ```
//!
//! Besides plain commands a session understands three connection-level
//! forms:
//!
//! - `<CMD>.WATCH args...` subscribes to `<CMD> args...` and answers with
//!   `["watch", fingerprint, 0, result]`; later changes are pushed as
//!   `["watch", fingerprint, sequence, result]`
//! - `UNWATCH <fingerprint>` ends one subscription
//! - `INFO` reports engine statistics

use crate::engine::{Command, Engine, EngineStats, Reply};
use crate::error::EngineError;
use crate::protocol::{parse_request, ParseError, RespValue};
use crate::watch::{ClientId, Fingerprint, Notification, NotificationStream};
use bytes::{Bytes, BytesMut};
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tracing::{debug, error, info, trace, warn};

/// Suffix that turns a read-only command into a subscription.
pub const WATCH_SUFFIX: &str = ".WATCH";

/// Maximum size for the read buffer (64 KB)
const MAX_BUFFER_SIZE: usize = 64 * 1024;

const INITIAL_BUFFER_SIZE: usize = 4096;

/// Statistics for connection handling
#[derive(Debug, Default)]
pub struct ConnectionStats {
    pub connections_accepted: AtomicU64,
    pub active_connections: AtomicU64,
    pub commands_processed: AtomicU64,
    /// Watch notifications pushed to clients
    pub notifications_pushed: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a new connection and returns its client id.
    pub fn connection_opened(&self) -> ClientId {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.connections_accepted.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn command_processed(&self) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn notification_pushed(&self) {
        self.notifications_pushed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written.fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// What to do after answering a request.
enum Flow {
    Continue,
    Close,
}

/// Handles a single client connection.
pub struct ConnectionHandler {
    stream: BufWriter<TcpStream>,
    addr: SocketAddr,
    buffer: BytesMut,
    engine: Arc<Engine>,
    client: ClientId,
    notifications: NotificationStream,
    stats: Arc<ConnectionStats>,
}

impl ConnectionHandler {
    pub fn new(
        stream: TcpStream,
        addr: SocketAddr,
        engine: Arc<Engine>,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        let client = stats.connection_opened();
        let notifications = engine.notifications(client);

        Self {
            stream: BufWriter::new(stream),
            addr,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            engine,
            client,
            notifications,
            stats,
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client
    }

    /// Runs the session until the client disconnects or an error occurs.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        info!(client = %self.addr, id = self.client, "Client connected");

        let result = self.main_loop().await;

        match &result {
            Ok(()) => info!(client = %self.addr, "Client disconnected gracefully"),
            Err(ConnectionError::ClientDisconnected) => {
                debug!(client = %self.addr, "Client disconnected")
            }
            Err(ConnectionError::IoError(io_err))
                if io_err.kind() == std::io::ErrorKind::ConnectionReset =>
            {
                debug!(client = %self.addr, "Connection reset by client")
            }
            Err(e) => warn!(client = %self.addr, error = %e, "Connection error"),
        }

        let dropped = self.engine.disconnect(self.client);
        if dropped > 0 {
            debug!(client = %self.addr, subscriptions = dropped, "Dropped subscriptions");
        }
        self.stats.connection_closed();
        result
    }

    async fn main_loop(&mut self) -> Result<(), ConnectionError> {
        let mut stream_open = true;
        loop {
            while let Some(parts) = self.try_parse_request()? {
                let (response, flow) = self.dispatch(parts).await;
                self.stats.command_processed();
                self.send(&response).await?;
                if let Flow::Close = flow {
                    return Ok(());
                }
            }

            if self.buffer.len() >= MAX_BUFFER_SIZE {
                error!(client = %self.addr, size = self.buffer.len(), "Buffer size limit exceeded");
                return Err(ConnectionError::BufferFull);
            }
            if self.buffer.capacity() - self.buffer.len() < 1024 {
                self.buffer.reserve(4096);
            }

            tokio::select! {
                read = self.stream.get_mut().read_buf(&mut self.buffer) => {
                    let n = read?;
                    if n == 0 {
                        return Err(if self.buffer.is_empty() {
                            ConnectionError::ClientDisconnected
                        } else {
                            ConnectionError::UnexpectedEof
                        });
                    }
                    self.stats.bytes_read(n);
                    trace!(client = %self.addr, bytes = n, "Read data");
                }

                notification = self.notifications.next(), if stream_open => match notification {
                    Some(notification) => self.push(notification).await?,
                    None => stream_open = false,
                },
            }
        }
    }

    fn try_parse_request(&mut self) -> Result<Option<Vec<Bytes>>, ConnectionError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        // freezing a split keeps argument slices pointing into the read buffer
        let pending = self.buffer.split().freeze();
        match parse_request(&pending) {
            Ok(Some((parts, consumed))) => {
                self.buffer.extend_from_slice(&pending[consumed..]);
                trace!(client = %self.addr, consumed = consumed, remaining = self.buffer.len(), "Parsed request");
                Ok(Some(parts))
            }
            Ok(None) => {
                self.buffer.extend_from_slice(&pending);
                Ok(None)
            }
            Err(e) => {
                warn!(client = %self.addr, error = %e, "Parse error");
                Err(ConnectionError::ParseError(e))
            }
        }
    }

    /// Runs one request and builds its response.
    async fn dispatch(&mut self, parts: Vec<Bytes>) -> (RespValue, Flow) {
        let mut parts = parts.into_iter();
        let Some(name) = parts.next() else {
            return (RespValue::error("ERR empty command"), Flow::Continue);
        };
        let name = String::from_utf8_lossy(&name).to_ascii_uppercase();
        let args: Vec<Bytes> = parts.collect();

        if let Some(watched) = name.strip_suffix(WATCH_SUFFIX) {
            return (self.watch(Command::new(watched, args)).await, Flow::Continue);
        }

        let response = match name.as_str() {
            "UNWATCH" => self.unwatch(&args),
            "INFO" => match self.engine.stats().await {
                Ok(stats) => RespValue::bulk_string(format_info(&stats, &self.stats)),
                Err(e) => e.into(),
            },
            "QUIT" => return (RespValue::ok(), Flow::Close),
            _ => RespValue::from_result(self.engine.evaluate(Command::new(name, args)).await),
        };
        (response, Flow::Continue)
    }

    async fn watch(&mut self, command: Command) -> RespValue {
        match self.engine.subscribe(self.client, command).await {
            Ok(subscription) => RespValue::notification(Notification {
                fingerprint: subscription.fingerprint,
                result: subscription.result,
                sequence: 0,
            }),
            Err(e) => e.into(),
        }
    }

    fn unwatch(&mut self, args: &[Bytes]) -> RespValue {
        let [fingerprint] = args else {
            return RespValue::error("ERR wrong number of arguments for 'unwatch' command");
        };
        let parsed = std::str::from_utf8(fingerprint)
            .ok()
            .and_then(|s| s.parse::<Fingerprint>().ok());
        match parsed {
            Some(fingerprint) => {
                RespValue::from(Reply::from(self.engine.unsubscribe(self.client, fingerprint)))
            }
            None => EngineError::invalid("invalid fingerprint").into(),
        }
    }

    async fn push(&mut self, notification: Notification) -> Result<(), ConnectionError> {
        if self.notifications.outbox().take_overflow() {
            warn!(
                client = %self.addr,
                dropped = self.notifications.outbox().dropped(),
                "Client fell behind, oldest notifications were dropped"
            );
        }
        self.stats.notification_pushed();
        self.send(&RespValue::notification(notification)).await
    }

    async fn send(&mut self, response: &RespValue) -> Result<(), ConnectionError> {
        let bytes = response.serialize();
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;
        self.stats.bytes_written(bytes.len());
        trace!(client = %self.addr, bytes = bytes.len(), "Sent response");
        Ok(())
    }
}

/// Renders statistics as `INFO` text.
fn format_info(engine: &EngineStats, connections: &ConnectionStats) -> String {
    let mut out = String::new();
    let _ = write!(
        out,
        "# Server\r\nversion:{}\r\nshards:{}\r\n\r\n",
        crate::VERSION,
        engine.shards.len()
    );
    let _ = write!(
        out,
        "# Clients\r\nconnected_clients:{}\r\ntotal_connections_received:{}\r\n\r\n",
        connections.active_connections.load(Ordering::Relaxed),
        connections.connections_accepted.load(Ordering::Relaxed)
    );
    let max_memory = if engine.max_memory == usize::MAX { 0 } else { engine.max_memory };
    let _ = write!(
        out,
        "# Memory\r\nused_memory:{}\r\nmaxmemory:{}\r\n\r\n",
        engine.used_memory, max_memory
    );
    let _ = write!(
        out,
        "# Stats\r\ntotal_commands_processed:{}\r\nrejected_commands:{}\r\nexpired_keys:{}\r\nevicted_keys:{}\r\n\r\n",
        engine.commands, engine.rejected, engine.expired, engine.evicted
    );
    let _ = write!(
        out,
        "# Watch\r\nwatched_queries:{}\r\nsubscriptions:{}\r\nwatched_keys:{}\r\ndropped_notifications:{}\r\n\r\n",
        engine.watch.fingerprints,
        engine.watch.subscriptions,
        engine.watch.watched_keys,
        engine.watch.dropped_notifications
    );
    let _ = write!(out, "# Keyspace\r\nkeys:{}\r\n", engine.keys);
    for shard in &engine.shards {
        let _ = write!(
            out,
            "shard{}:keys={},expires={},commands={}\r\n",
            shard.shard, shard.store.keys, shard.store.keys_with_expiry, shard.commands
        );
    }
    out
}

/// Errors that can occur while handling a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    ParseError(#[from] ParseError),

    #[error("Client disconnected")]
    ClientDisconnected,

    /// Stream ended in the middle of a request
    #[error("Unexpected end of stream")]
    UnexpectedEof,

    #[error("Buffer size limit exceeded")]
    BufferFull,
}

/// Runs a session for `stream` to completion.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    engine: Arc<Engine>,
    stats: Arc<ConnectionStats>,
) {
    let handler = ConnectionHandler::new(stream, addr, engine, stats);
    if let Err(e) = handler.run().await {
        match e {
            ConnectionError::ClientDisconnected => {}
            ConnectionError::IoError(ref io_err)
                if io_err.kind() == std::io::ErrorKind::ConnectionReset => {}
            _ => debug!(client = %addr, error = %e, "Connection ended with error"),
        }
    }
}
