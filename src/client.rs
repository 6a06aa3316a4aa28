//! High-level client for the codeforge compile/execute service.
//!
//! [`ForgeClient`] ties the engine together: it owns the connection
//! manager and the session context, builds request frames with the current
//! auth token, classifies inbound frames, and reports everything the
//! presentation layer needs through a [`ClientEvent`] channel.
//!
//! # Architecture
//!
//! ```text
//! caller ──► ForgeClient ──► ConnectionManager ──► TCP socket
//!                │                   │
//!                │   NetEvent channel▼
//!                └──── dispatcher task ────► ClientEvent channel ──► caller
//! ```
//!
//! Operations are fire-and-forget: each sends a frame and surfaces its
//! outcome as an asynchronous result event rather than a return value.
//! Callers that want synchronous semantics can use
//! [`ForgeClient::request`], which waits for the correlated response.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::net::{ConnectionManager, NetConfig, NetError, NetEvent};
use crate::protocol::{
    CompileSourceRequest, ErrorResponse, ExecuteIrRequest, ExecutionMode, Frame, LoginRequest,
    Payload, SaveSourceCodeRequest, DEFAULT_MAX_FRAME_LEN,
};
use crate::session::{CredentialStore, SessionState};

/// Default bound on a correlated request/response exchange.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default period of the session expiry check.
pub const DEFAULT_SESSION_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Default margin before expiry at which the session is proactively expired.
pub const DEFAULT_EXPIRY_MARGIN: Duration = Duration::from_secs(300);

/// Client engine configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Identity stamped into every outgoing frame header.
    pub client_id: String,
    pub connect_timeout: Duration,
    /// Timeout for [`ForgeClient::request`] exchanges.
    pub request_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub reconnect_delay: Duration,
    pub auto_reconnect: bool,
    pub session_check_interval: Duration,
    /// Remaining lifetime below which the session is treated as expired.
    pub expiry_margin: Duration,
    pub max_frame_len: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let net = NetConfig::default();
        ClientConfig {
            client_id: net.client_id,
            connect_timeout: net.connect_timeout,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            heartbeat_interval: net.heartbeat_interval,
            reconnect_delay: net.reconnect_delay,
            auto_reconnect: false,
            session_check_interval: DEFAULT_SESSION_CHECK_INTERVAL,
            expiry_margin: DEFAULT_EXPIRY_MARGIN,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// Events emitted toward the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The connection came up (`true`) or went down (`false`).
    ConnectionStateChanged(bool),
    LoginResult {
        success: bool,
        message: String,
    },
    SaveSourceResult {
        success: bool,
        code_id: String,
        message: String,
    },
    CompileResult {
        success: bool,
        ir_code_id: String,
        message: String,
    },
    ExecuteResult {
        success: bool,
        result: String,
        error_message: String,
    },
    /// The session became authenticated (`true`) or was cleared (`false`).
    LoginStateChanged(bool),
    /// A transport, protocol, or peer-reported error.
    Error(String),
    /// A server push notification, with a display label for its category.
    Notification {
        label: String,
        content: String,
    },
}

/// Client engine for the codeforge service.
///
/// Create one with an event channel, connect, then invoke operations.
/// Must be created within a Tokio runtime; the dispatcher and session
/// watcher run as background tasks for the client's lifetime.
pub struct ForgeClient {
    net: ConnectionManager,
    session: Arc<SessionState>,
    events: UnboundedSender<ClientEvent>,
    request_timeout: Duration,
}

impl ForgeClient {
    /// Create a client using the default credential store location.
    pub fn new(config: ClientConfig, events: UnboundedSender<ClientEvent>) -> Self {
        Self::with_store(config, events, CredentialStore::open_default())
    }

    /// Create a client with an explicit credential store (used by tests to
    /// avoid touching the real config directory).
    pub fn with_store(
        config: ClientConfig,
        events: UnboundedSender<ClientEvent>,
        store: CredentialStore,
    ) -> Self {
        let (net_tx, net_rx) = mpsc::unbounded_channel();
        let net = ConnectionManager::new(
            NetConfig {
                client_id: config.client_id,
                connect_timeout: config.connect_timeout,
                heartbeat_interval: config.heartbeat_interval,
                reconnect_delay: config.reconnect_delay,
                auto_reconnect: config.auto_reconnect,
                max_frame_len: config.max_frame_len,
            },
            net_tx,
        );
        let session = Arc::new(SessionState::new(store));

        tokio::spawn(dispatch_loop(net_rx, Arc::clone(&session), events.clone()));
        tokio::spawn(session_watch_loop(
            Arc::clone(&session),
            events.clone(),
            config.session_check_interval,
            config.expiry_margin,
        ));

        ForgeClient {
            net,
            session,
            events,
            request_timeout: config.request_timeout,
        }
    }

    /// Shared session context.
    pub fn session(&self) -> Arc<SessionState> {
        Arc::clone(&self.session)
    }

    /// Handle to the connection layer.
    pub fn connection(&self) -> ConnectionManager {
        self.net.clone()
    }

    // -------------------------------------------------------------------------
    // Connection operations
    // -------------------------------------------------------------------------

    /// Connect to the server. Outcome also surfaces as
    /// [`ClientEvent::ConnectionStateChanged`] / [`ClientEvent::Error`].
    pub async fn connect(&self, host: &str, port: u16) -> Result<(), NetError> {
        self.net.connect(host, port).await
    }

    pub async fn disconnect(&self) {
        self.net.disconnect().await;
    }

    pub fn is_connected(&self) -> bool {
        self.net.is_connected()
    }

    /// Enable or disable the single-shot reconnect after an unexpected
    /// disconnect.
    pub fn set_auto_reconnect(&self, enabled: bool, delay: Duration) {
        self.net.set_auto_reconnect(enabled, delay);
    }

    // -------------------------------------------------------------------------
    // Authentication
    // -------------------------------------------------------------------------

    /// Send a login request and wait for the correlated response. The
    /// result arrives as [`ClientEvent::LoginResult`]; a timeout or send
    /// failure surfaces as a failed result.
    pub async fn login(
        &self,
        username: &str,
        password_hash: &str,
        device_info: &str,
        app_version: &str,
    ) {
        info!("Logging in as {}", username);
        let frame = self.request_frame(Payload::LoginRequest(LoginRequest {
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            device_info: device_info.to_string(),
            app_version: app_version.to_string(),
        }));

        let response = self.net.send_request(&frame, self.request_timeout).await;
        match response.payload {
            Payload::LoginResponse(login) => {
                apply_login_response(login, &self.session, &self.events);
            }
            Payload::ErrorResponse(error) => {
                let formatted = format_error(&error);
                warn!("Login failed: {}", formatted);
                self.emit(ClientEvent::LoginResult {
                    success: false,
                    message: formatted,
                });
            }
            other => {
                warn!(
                    "Unexpected {} response to login request",
                    other.kind().as_str()
                );
                self.emit(ClientEvent::LoginResult {
                    success: false,
                    message: "unexpected response to login request".to_string(),
                });
            }
        }
    }

    /// Clear the session and announce the state change.
    pub fn logout(&self) {
        self.session.clear();
        self.emit(ClientEvent::LoginStateChanged(false));
    }

    /// Attempt a login with previously saved credentials; does nothing when
    /// none are saved.
    pub async fn auto_login(&self) {
        match self.session.load_credentials() {
            Some(saved) => {
                self.login(&saved.username, &saved.password_hash, "", "")
                    .await
            }
            None => debug!("No saved credentials; auto-login skipped"),
        }
    }

    /// Persist credentials for later [`ForgeClient::auto_login`].
    pub fn save_credentials(&self, username: &str, password_hash: &str) {
        self.session.save_credentials(username, password_hash);
    }

    /// Remove saved credentials.
    pub fn clear_credentials(&self) {
        self.session.clear_credentials();
    }

    // -------------------------------------------------------------------------
    // Service operations
    // -------------------------------------------------------------------------

    /// Upload source code. The result arrives as
    /// [`ClientEvent::SaveSourceResult`].
    pub async fn save_source_code(
        &self,
        code_id: &str,
        language: &str,
        source_code: &str,
        code_name: &str,
        description: &str,
        metadata: BTreeMap<String, String>,
    ) {
        let frame = self.request_frame(Payload::SaveSourceRequest(SaveSourceCodeRequest {
            code_id: code_id.to_string(),
            language: language.to_string(),
            source_code: source_code.to_string(),
            code_name: code_name.to_string(),
            description: description.to_string(),
            metadata,
        }));

        if let Err(e) = self.net.send_frame(&frame).await {
            warn!("Failed to send save-source request: {}", e);
            self.emit(ClientEvent::SaveSourceResult {
                success: false,
                code_id: code_id.to_string(),
                message: format!("failed to send save request: {e}"),
            });
        }
    }

    /// Trigger compilation of previously saved source. The result arrives
    /// as [`ClientEvent::CompileResult`].
    pub async fn compile_source_code(
        &self,
        code_id: &str,
        compiler_options: &str,
        optimize: bool,
        target_ir_version: &str,
    ) {
        let frame = self.request_frame(Payload::CompileRequest(CompileSourceRequest {
            code_id: code_id.to_string(),
            compiler_options: compiler_options.to_string(),
            optimize,
            target_ir_version: target_ir_version.to_string(),
        }));

        if let Err(e) = self.net.send_frame(&frame).await {
            warn!("Failed to send compile request: {}", e);
            self.emit(ClientEvent::CompileResult {
                success: false,
                ir_code_id: String::new(),
                message: format!("failed to send compile request: {e}"),
            });
        }
    }

    /// Drive execution of compiled IR. The result arrives as
    /// [`ClientEvent::ExecuteResult`].
    pub async fn execute_ir_code(
        &self,
        ir_code_id: &str,
        mode: ExecutionMode,
        parameters: BTreeMap<String, String>,
        timeout_secs: u32,
    ) {
        let frame = self.request_frame(Payload::ExecuteRequest(ExecuteIrRequest {
            ir_code_id: ir_code_id.to_string(),
            mode,
            parameters,
            timeout_secs,
        }));

        if let Err(e) = self.net.send_frame(&frame).await {
            warn!("Failed to send execute request: {}", e);
            self.emit(ClientEvent::ExecuteResult {
                success: false,
                result: String::new(),
                error_message: format!("failed to send execute request: {e}"),
            });
        }
    }

    // -------------------------------------------------------------------------
    // Correlated requests
    // -------------------------------------------------------------------------

    /// Build a request frame carrying a fresh request id, the configured
    /// client id, and the current auth token when logged in.
    pub fn request_frame(&self, payload: Payload) -> Frame {
        Frame::new(
            self.session.generate_request_id(),
            self.net.client_id().to_string(),
            self.session.auth_token(),
            payload,
        )
    }

    /// Send a frame and wait for its correlated response (or a synthetic
    /// error frame on timeout/failure), using the configured request
    /// timeout.
    pub async fn request(&self, payload: Payload) -> Frame {
        let frame = self.request_frame(payload);
        self.net.send_request(&frame, self.request_timeout).await
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}

impl Drop for ForgeClient {
    fn drop(&mut self) {
        self.net.abort_tasks();
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Pump connection events into presentation events until the connection
/// layer goes away.
async fn dispatch_loop(
    mut net_rx: UnboundedReceiver<NetEvent>,
    session: Arc<SessionState>,
    events: UnboundedSender<ClientEvent>,
) {
    while let Some(event) = net_rx.recv().await {
        match event {
            NetEvent::Connected => {
                let _ = events.send(ClientEvent::ConnectionStateChanged(true));
            }
            NetEvent::Disconnected => {
                let _ = events.send(ClientEvent::ConnectionStateChanged(false));
            }
            NetEvent::ConnectionError(message) => {
                let _ = events.send(ClientEvent::Error(message));
            }
            NetEvent::HeartbeatReceived => {
                debug!("Heartbeat acknowledged by server");
            }
            NetEvent::Frame(frame) => handle_frame(frame, &session, &events),
        }
    }
}

/// Classify one uncorrelated inbound frame and raise the matching event.
fn handle_frame(frame: Frame, session: &SessionState, events: &UnboundedSender<ClientEvent>) {
    let kind = frame.header.kind;
    match frame.payload {
        // Correlated login responses are handled by `login` itself; this
        // covers a server that pushes one uncorrelated.
        Payload::LoginResponse(response) => apply_login_response(response, session, events),
        Payload::SaveSourceResponse(response) => {
            let _ = events.send(ClientEvent::SaveSourceResult {
                success: response.success,
                code_id: response.code_id,
                message: response.message,
            });
        }
        Payload::CompileResponse(response) => {
            let _ = events.send(ClientEvent::CompileResult {
                success: response.success,
                ir_code_id: response.ir_code_id,
                message: response.message,
            });
        }
        Payload::ExecuteResponse(response) => {
            let _ = events.send(ClientEvent::ExecuteResult {
                success: response.success,
                result: response.execution_result,
                error_message: response.error_message,
            });
        }
        Payload::ErrorResponse(response) => {
            let formatted = format_error(&response);
            warn!("Server error: {}", formatted);
            if response.code.is_auth_failure() {
                expire_session(session, events);
            }
            let _ = events.send(ClientEvent::Error(formatted));
        }
        Payload::Notification(notification) => {
            let _ = events.send(ClientEvent::Notification {
                label: notification.kind.label().to_string(),
                content: notification.content,
            });
        }
        // Heartbeats are classified by the connection layer; one landing
        // here means a correlated waiter abandoned it, which is fine.
        Payload::Heartbeat(_) => debug!("Ignoring stray heartbeat frame"),
        Payload::LoginRequest(_)
        | Payload::SaveSourceRequest(_)
        | Payload::CompileRequest(_)
        | Payload::ExecuteRequest(_) => {
            warn!("Dropping unexpected {} frame from server", kind.as_str());
        }
    }
}

/// Adopt a login response: update the session, announce the state change,
/// and emit the result event.
fn apply_login_response(
    response: crate::protocol::LoginResponse,
    session: &SessionState,
    events: &UnboundedSender<ClientEvent>,
) {
    if response.success {
        session.apply_login(&response);
        let _ = events.send(ClientEvent::LoginStateChanged(true));
    }
    let _ = events.send(ClientEvent::LoginResult {
        success: response.success,
        message: response.message,
    });
}

/// Render a peer error with its code namespace, detail, and remedy.
fn format_error(response: &ErrorResponse) -> String {
    let mut message = format!("error code {}: {}", response.code, response.message);
    if !response.detail.is_empty() {
        message.push_str("\ndetail: ");
        message.push_str(&response.detail);
    }
    if !response.solution.is_empty() {
        message.push_str("\nsuggested fix: ");
        message.push_str(&response.solution);
    }
    message
}

/// Force-expire the session: error event, clear, state-changed event.
fn expire_session(session: &SessionState, events: &UnboundedSender<ClientEvent>) {
    let _ = events.send(ClientEvent::Error(
        "Session expired; please log in again".to_string(),
    ));
    session.clear();
    let _ = events.send(ClientEvent::LoginStateChanged(false));
}

/// Periodically compare the session expiry against the margin and
/// proactively expire it. Runs until the event channel closes.
async fn session_watch_loop(
    session: Arc<SessionState>,
    events: UnboundedSender<ClientEvent>,
    check_interval: Duration,
    margin: Duration,
) {
    let mut ticker = tokio::time::interval(check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if events.is_closed() {
            return;
        }
        if session.expires_within(margin) {
            warn!("Session expires within {:?}; forcing logout", margin);
            expire_session(&session, &events);
        }
    }
}
