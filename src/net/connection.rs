//! Connection lifecycle management for the codeforge client.
//!
//! The [`ConnectionManager`] owns the TCP socket and drives the
//! `Disconnected → Connecting → Connected → Disconnected` loop. While
//! connected it runs two background tasks:
//!
//! - a read task that drains the socket, feeds the framing codec, and
//!   routes every complete frame (correlated responses to their waiters,
//!   everything else to the event channel), and
//! - a heartbeat task that sends a liveness frame immediately on connect
//!   and on a fixed interval thereafter.
//!
//! On an unexpected peer close the manager tears down, emits events, and —
//! if auto-reconnect is enabled — schedules exactly one reconnect attempt
//! to the last-used endpoint.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::net::correlator::PendingTable;
use crate::protocol::{
    encode_frame, CodecError, Frame, FrameBuffer, Heartbeat, MessageType, Payload,
    DEFAULT_MAX_FRAME_LEN,
};

/// Default bound on a single TCP connect attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default heartbeat emission interval.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Default delay before the single reconnect attempt.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(5000);

/// Connection state, owned exclusively by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Transport-level error types.
#[derive(Debug, Error)]
pub enum NetError {
    /// No connection is established.
    #[error("not connected to server")]
    NotConnected,

    /// The TCP connect attempt failed.
    #[error("connection failed: {0}")]
    ConnectFailed(#[source] io::Error),

    /// The TCP connect attempt exceeded the configured bound.
    #[error("connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// I/O error on an established connection.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Framing codec failure.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Events emitted by the connection layer toward the dispatcher.
#[derive(Debug)]
pub enum NetEvent {
    /// The connection reached `Connected`.
    Connected,
    /// The connection left `Connected` (peer close, error, or explicit).
    Disconnected,
    /// A transport error worth surfacing (connect failure, read failure,
    /// protocol violation).
    ConnectionError(String),
    /// A heartbeat frame arrived from the peer.
    HeartbeatReceived,
    /// An uncorrelated inbound frame for the dispatcher to classify.
    Frame(Frame),
}

/// Connection manager configuration.
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Client identity stamped into every outgoing header.
    pub client_id: String,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub reconnect_delay: Duration,
    pub auto_reconnect: bool,
    pub max_frame_len: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        NetConfig {
            client_id: "codeforge-client".to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            auto_reconnect: false,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// Handle to the connection layer. Cheap to clone; all clones share state.
///
/// The manager is explicitly constructed with an event channel and owns the
/// only mutable [`ConnectionState`]; other components read it through
/// [`ConnectionManager::state`].
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    client_id: String,
    connect_timeout: Duration,
    heartbeat_interval: Duration,
    max_frame_len: usize,

    state: StdMutex<ConnectionState>,
    writer: TokioMutex<Option<tokio::net::tcp::OwnedWriteHalf>>,
    pending: PendingTable,
    events: mpsc::UnboundedSender<NetEvent>,

    /// Last endpoint passed to `connect`, for reconnect.
    endpoint: StdMutex<Option<(String, u16)>>,
    auto_reconnect: AtomicBool,
    reconnect_delay_ms: AtomicU64,

    /// Bumped on every connect/disconnect; background tasks carry the value
    /// current at spawn time and stand down when it no longer matches.
    epoch: AtomicU64,
    /// Milliseconds since epoch of the last send or receive.
    last_activity: AtomicI64,
    read_task: StdMutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Create a manager that reports events on `events`.
    ///
    /// No connection is attempted until [`ConnectionManager::connect`].
    pub fn new(config: NetConfig, events: mpsc::UnboundedSender<NetEvent>) -> Self {
        ConnectionManager {
            inner: Arc::new(Inner {
                client_id: config.client_id,
                connect_timeout: config.connect_timeout,
                heartbeat_interval: config.heartbeat_interval,
                max_frame_len: config.max_frame_len,
                state: StdMutex::new(ConnectionState::Disconnected),
                writer: TokioMutex::new(None),
                pending: PendingTable::new(),
                events,
                endpoint: StdMutex::new(None),
                auto_reconnect: AtomicBool::new(config.auto_reconnect),
                reconnect_delay_ms: AtomicU64::new(config.reconnect_delay.as_millis() as u64),
                epoch: AtomicU64::new(0),
                last_activity: AtomicI64::new(0),
                read_task: StdMutex::new(None),
            }),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock().expect("state lock poisoned")
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Enable or disable the single-shot reconnect after an unexpected close.
    pub fn set_auto_reconnect(&self, enabled: bool, delay: Duration) {
        self.inner.auto_reconnect.store(enabled, Ordering::SeqCst);
        self.inner
            .reconnect_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub(crate) fn pending(&self) -> &PendingTable {
        &self.inner.pending
    }

    pub(crate) fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// Establish a connection, replacing any existing one.
    ///
    /// Transitions through `Connecting`; on success starts the read and
    /// heartbeat tasks and emits [`NetEvent::Connected`]. On failure the
    /// state returns to `Disconnected` and a connection-error event is
    /// emitted alongside the returned error.
    ///
    /// # Errors
    ///
    /// `NetError::ConnectFailed` if the TCP connect is refused,
    /// `NetError::ConnectTimeout` if it exceeds the configured bound.
    pub async fn connect(&self, host: &str, port: u16) -> Result<(), NetError> {
        // Replace any live connection first.
        self.disconnect().await;

        *self.inner.endpoint.lock().expect("endpoint lock poisoned") =
            Some((host.to_string(), port));
        self.set_state(ConnectionState::Connecting);
        info!("Connecting to {}:{}", host, port);

        let stream = match timeout(
            self.inner.connect_timeout,
            TcpStream::connect((host, port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.set_state(ConnectionState::Disconnected);
                self.emit(NetEvent::ConnectionError(format!(
                    "connection to {}:{} failed: {}",
                    host, port, e
                )));
                return Err(NetError::ConnectFailed(e));
            }
            Err(_) => {
                self.set_state(ConnectionState::Disconnected);
                self.emit(NetEvent::ConnectionError(format!(
                    "connection to {}:{} timed out after {:?}",
                    host, port, self.inner.connect_timeout
                )));
                return Err(NetError::ConnectTimeout(self.inner.connect_timeout));
            }
        };

        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        *self.inner.writer.lock().await = Some(write_half);

        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.touch();
        self.set_state(ConnectionState::Connected);
        info!("Connected to {}:{}", host, port);
        self.emit(NetEvent::Connected);

        let mgr = self.clone();
        let handle = tokio::spawn(async move { mgr.read_loop(read_half, epoch).await });
        *self
            .inner
            .read_task
            .lock()
            .expect("read task lock poisoned") = Some(handle);

        let mgr = self.clone();
        tokio::spawn(async move { mgr.heartbeat_loop(epoch).await });

        Ok(())
    }

    /// Close the connection and stop heartbeat/reconnect. Idempotent.
    pub async fn disconnect(&self) {
        // Invalidate background tasks and any pending reconnect.
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);

        if let Some(handle) = self
            .inner
            .read_task
            .lock()
            .expect("read task lock poisoned")
            .take()
        {
            handle.abort();
        }

        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }

        // Wake every correlated waiter with a connection-lost result.
        self.inner.pending.clear();

        if self.set_state(ConnectionState::Disconnected) == ConnectionState::Connected {
            info!("Disconnected from server");
            self.emit(NetEvent::Disconnected);
        }
    }

    /// Synchronous teardown for drop paths: stops tasks without waiting on
    /// the writer lock. The socket closes when the halves are dropped.
    pub(crate) fn abort_tasks(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = self
            .inner
            .read_task
            .lock()
            .expect("read task lock poisoned")
            .take()
        {
            handle.abort();
        }
        self.inner.pending.clear();
    }

    /// Serialize and write one frame. Sends are not pipelined; the writer
    /// lock admits one frame at a time.
    ///
    /// # Errors
    ///
    /// `NetError::NotConnected` when no connection is established,
    /// `NetError::Codec` on serialization failure, `NetError::Io` on a
    /// write failure (the read task will observe the dead socket and drive
    /// the disconnect).
    pub async fn send_frame(&self, frame: &Frame) -> Result<(), NetError> {
        let bytes = encode_frame(frame)?;

        let mut guard = self.inner.writer.lock().await;
        let writer = guard.as_mut().ok_or(NetError::NotConnected)?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        drop(guard);

        self.touch();
        debug!(
            "Sent {} frame ({} bytes, request id {})",
            frame.header.kind.as_str(),
            bytes.len(),
            frame.header.request_id
        );
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Background tasks
    // -------------------------------------------------------------------------

    async fn read_loop(self, mut read_half: OwnedReadHalf, epoch: u64) {
        let mut assembler = FrameBuffer::with_max_len(self.inner.max_frame_len);
        let mut chunk = vec![0u8; 8 * 1024];

        let reason = loop {
            match read_half.read(&mut chunk).await {
                Ok(0) => break None,
                Ok(n) => match assembler.feed(&chunk[..n]) {
                    Ok(frames) => {
                        for frame in frames {
                            self.route_frame(frame);
                        }
                    }
                    // Oversized declared length; resync is impossible.
                    Err(e) => break Some(format!("protocol violation: {e}")),
                },
                Err(e) => break Some(format!("socket read failed: {e}")),
            }
        };

        self.connection_lost(epoch, reason).await;
    }

    /// Route one complete inbound frame: correlated responses resolve their
    /// waiter; heartbeats and everything else go to the event channel.
    fn route_frame(&self, frame: Frame) {
        self.touch();
        debug!(
            "Received {} frame (request id {})",
            frame.header.kind.as_str(),
            frame.header.request_id
        );

        let frame = match self.inner.pending.complete(frame) {
            Some(uncorrelated) => uncorrelated,
            None => return,
        };

        if frame.header.kind == MessageType::Heartbeat {
            self.emit(NetEvent::HeartbeatReceived);
            return;
        }

        self.emit(NetEvent::Frame(frame));
    }

    async fn heartbeat_loop(self, epoch: u64) {
        let mut ticker = tokio::time::interval(self.inner.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // First tick completes immediately: a heartbeat goes out as soon
            // as the connection is up.
            ticker.tick().await;
            if self.inner.epoch.load(Ordering::SeqCst) != epoch {
                return;
            }

            let frame = self.heartbeat_frame();
            if let Err(e) = self.send_frame(&frame).await {
                // Ordinary send failure; the read task owns disconnect.
                warn!("Heartbeat send failed: {}", e);
            }
        }
    }

    fn heartbeat_frame(&self) -> Frame {
        Frame::new(
            Uuid::new_v4().to_string(),
            self.inner.client_id.clone(),
            None,
            Payload::Heartbeat(Heartbeat {
                last_active_time: self.inner.last_activity.load(Ordering::SeqCst),
            }),
        )
    }

    /// Teardown after the read task observed EOF or an error.
    ///
    /// Only the task belonging to the live connection epoch may tear down;
    /// a stale task (superseded by an explicit disconnect or a newer
    /// connect) stands down silently.
    async fn connection_lost(&self, epoch: u64, reason: Option<String>) {
        if self
            .inner
            .epoch
            .compare_exchange(epoch, epoch + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        self.inner
            .read_task
            .lock()
            .expect("read task lock poisoned")
            .take();
        *self.inner.writer.lock().await = None;
        self.inner.pending.clear();

        match &reason {
            Some(reason) => {
                warn!("Connection lost: {}", reason);
                self.emit(NetEvent::ConnectionError(reason.clone()));
            }
            None => info!("Connection closed by peer"),
        }

        if self.set_state(ConnectionState::Disconnected) == ConnectionState::Connected {
            self.emit(NetEvent::Disconnected);
        }

        if self.inner.auto_reconnect.load(Ordering::SeqCst) {
            self.schedule_reconnect(epoch + 1);
        }
    }

    /// Schedule the single reconnect attempt for this disconnect event.
    ///
    /// The attempt is abandoned if anything changes the epoch first (an
    /// explicit disconnect or a caller-driven connect), and it is not
    /// retried on failure.
    fn schedule_reconnect(&self, expected_epoch: u64) {
        let delay =
            Duration::from_millis(self.inner.reconnect_delay_ms.load(Ordering::SeqCst));
        let mgr = self.clone();

        info!("Scheduling reconnect attempt in {:?}", delay);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            if mgr.inner.epoch.load(Ordering::SeqCst) != expected_epoch
                || !mgr.inner.auto_reconnect.load(Ordering::SeqCst)
            {
                return;
            }

            let endpoint = mgr
                .inner
                .endpoint
                .lock()
                .expect("endpoint lock poisoned")
                .clone();
            if let Some((host, port)) = endpoint {
                info!("Attempting to reconnect to {}:{}", host, port);
                // A failed attempt leaves the connection down until the
                // caller retries.
                let _ = mgr.connect(&host, port).await;
            }
        });
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    /// Set the state, returning the previous value.
    fn set_state(&self, next: ConnectionState) -> ConnectionState {
        let mut state = self.inner.state.lock().expect("state lock poisoned");
        std::mem::replace(&mut *state, next)
    }

    fn touch(&self) {
        self.inner
            .last_activity
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    fn emit(&self, event: NetEvent) {
        let _ = self.inner.events.send(event);
    }
}
