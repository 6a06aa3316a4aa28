//! Integration tests for the codeforge client engine.
//!
//! These tests run the full stack — client operations, framing codec,
//! connection lifecycle, dispatcher, session state — against an in-process
//! mock server speaking the wire protocol over a loopback TCP socket.
//!
//! # Running
//!
//! ```bash
//! cargo test --test client_integration -- --nocapture
//! ```

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

use codeforge_client::protocol::{
    encode_frame, CommonCode, CompileSourceResponse, ErrorCode, ErrorResponse, ExecuteIrResponse,
    ExecutionMode, Frame, FrameBuffer, LoginResponse, MessageType, Notification, NotificationKind,
    Payload, SaveSourceCodeResponse,
};
use codeforge_client::session::CredentialStore;
use codeforge_client::{ClientConfig, ClientEvent, ForgeClient};

/// Test timeout to prevent hanging tests.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Credential store at a unique temp path so tests never touch the real
/// config directory or each other.
fn temp_store(test_name: &str) -> CredentialStore {
    let path = std::env::temp_dir().join(format!(
        "codeforge-integration-{}-{}.json",
        test_name,
        std::process::id()
    ));
    let _ = std::fs::remove_file(&path);
    CredentialStore::at_path(path)
}

/// Short intervals so lifecycle behavior is observable in test time.
fn test_config() -> ClientConfig {
    ClientConfig {
        client_id: "integration-test".to_string(),
        connect_timeout: Duration::from_millis(500),
        request_timeout: Duration::from_millis(1000),
        heartbeat_interval: Duration::from_secs(10),
        reconnect_delay: Duration::from_millis(100),
        session_check_interval: Duration::from_millis(100),
        ..ClientConfig::default()
    }
}

fn spawn_client(test_name: &str) -> (ForgeClient, UnboundedReceiver<ClientEvent>) {
    spawn_client_with(test_name, test_config())
}

fn spawn_client_with(
    test_name: &str,
    config: ClientConfig,
) -> (ForgeClient, UnboundedReceiver<ClientEvent>) {
    init_tracing();
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let client = ForgeClient::with_store(config, tx, temp_store(test_name));
    (client, rx)
}

/// One accepted server-side connection with frame-level send/recv.
struct ServerPeer {
    stream: TcpStream,
    assembler: FrameBuffer,
}

impl ServerPeer {
    async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = timeout(TEST_TIMEOUT, listener.accept())
            .await
            .expect("timed out waiting for client connection")
            .expect("accept failed");
        ServerPeer {
            stream,
            assembler: FrameBuffer::new(),
        }
    }

    /// Receive the next frame of the given kind, skipping heartbeats and
    /// anything else.
    async fn recv_kind(&mut self, kind: MessageType) -> Frame {
        let mut chunk = [0u8; 4096];
        loop {
            let n = timeout(TEST_TIMEOUT, self.stream.read(&mut chunk))
                .await
                .expect("timed out waiting for frame")
                .expect("server read failed");
            assert!(n > 0, "client closed while waiting for {}", kind.as_str());

            for frame in self.assembler.feed(&chunk[..n]).expect("feed failed") {
                if frame.header.kind == kind {
                    return frame;
                }
            }
        }
    }

    async fn send(&mut self, frame: &Frame) {
        let bytes = encode_frame(frame).expect("encode failed");
        self.stream.write_all(&bytes).await.expect("server write failed");
    }
}

async fn next_event(rx: &mut UnboundedReceiver<ClientEvent>) -> ClientEvent {
    timeout(TEST_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for client event")
        .expect("event channel closed")
}

/// Scan events until one matches the predicate, failing on timeout.
async fn wait_for(
    rx: &mut UnboundedReceiver<ClientEvent>,
    mut matches: impl FnMut(&ClientEvent) -> bool,
) -> ClientEvent {
    loop {
        let event = next_event(rx).await;
        if matches(&event) {
            return event;
        }
    }
}

fn push_frame(payload: Payload) -> Frame {
    Frame::new("server-push".to_string(), "server".to_string(), None, payload)
}

fn login_response(request_id: &str, expire_in_secs: i64) -> Frame {
    Frame::new(
        request_id.to_string(),
        "server".to_string(),
        None,
        Payload::LoginResponse(LoginResponse {
            success: true,
            session_id: "sess-integration".to_string(),
            expire_time: chrono::Utc::now().timestamp() + expire_in_secs,
            user_nickname: "Alice".to_string(),
            user_role: 1,
            message: "welcome back".to_string(),
        }),
    )
}

/// Drive a full login exchange: the client's correlated login request runs
/// concurrently with the server-side read/ack. Returns the login request as
/// seen on the wire.
async fn login_and_ack(
    client: &ForgeClient,
    server: &mut ServerPeer,
    expire_in_secs: i64,
) -> Frame {
    let ((), request) = tokio::join!(client.login("alice", "cafef00d", "test rig", "v1"), async {
        let request = server.recv_kind(MessageType::LoginRequest).await;
        server
            .send(&login_response(&request.header.request_id, expire_in_secs))
            .await;
        request
    });
    request
}

/// Test: connect, observe the handshake heartbeat, log in, and verify the
/// auth token is stamped on subsequent requests.
#[tokio::test]
async fn test_login_flow_and_auth_token() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = listener.local_addr().expect("no local addr");

    let (client, mut events) = spawn_client("login_flow");
    client
        .connect("127.0.0.1", addr.port())
        .await
        .expect("connect failed");
    assert_eq!(
        next_event(&mut events).await,
        ClientEvent::ConnectionStateChanged(true)
    );

    let mut server = ServerPeer::accept(&listener).await;

    // The heartbeat goes out immediately on connect and carries no token.
    let heartbeat = server.recv_kind(MessageType::Heartbeat).await;
    assert!(heartbeat.header.auth_token.is_none());

    let request = login_and_ack(&client, &mut server, 3600).await;
    assert!(request.header.auth_token.is_none());
    match &request.payload {
        Payload::LoginRequest(login) => {
            assert_eq!(login.username, "alice");
            assert_eq!(login.password_hash, "cafef00d");
            assert_eq!(login.app_version, "v1");
        }
        other => panic!("expected LoginRequest, got {:?}", other.kind()),
    }

    wait_for(&mut events, |e| e == &ClientEvent::LoginStateChanged(true)).await;
    let result = wait_for(&mut events, |e| {
        matches!(e, ClientEvent::LoginResult { .. })
    })
    .await;
    assert_eq!(
        result,
        ClientEvent::LoginResult {
            success: true,
            message: "welcome back".to_string()
        }
    );
    assert!(client.session().is_logged_in());

    // Requests after login carry the session token.
    client
        .compile_source_code("code-1", "-O2", true, "ir-v2")
        .await;
    let compile = server.recv_kind(MessageType::CompileSourceRequest).await;
    assert_eq!(
        compile.header.auth_token,
        Some("sess-integration".to_string())
    );

    // Logout clears the session and announces the state change.
    client.logout();
    assert!(!client.session().is_logged_in());
    wait_for(&mut events, |e| e == &ClientEvent::LoginStateChanged(false)).await;

    client.disconnect().await;
}

/// Test: every service operation surfaces its typed result event.
#[tokio::test]
async fn test_operation_result_events() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = listener.local_addr().expect("no local addr");

    let (client, mut events) = spawn_client("result_events");
    client
        .connect("127.0.0.1", addr.port())
        .await
        .expect("connect failed");
    let mut server = ServerPeer::accept(&listener).await;

    client
        .save_source_code(
            "code-7",
            "rust",
            "fn main() {}",
            "hello",
            "minimal program",
            Default::default(),
        )
        .await;
    let save = server.recv_kind(MessageType::SaveSourceCodeRequest).await;
    server
        .send(&Frame::new(
            save.header.request_id.clone(),
            "server".to_string(),
            None,
            Payload::SaveSourceResponse(SaveSourceCodeResponse {
                success: true,
                code_id: "code-7".to_string(),
                message: "stored".to_string(),
            }),
        ))
        .await;
    let event = wait_for(&mut events, |e| {
        matches!(e, ClientEvent::SaveSourceResult { .. })
    })
    .await;
    assert_eq!(
        event,
        ClientEvent::SaveSourceResult {
            success: true,
            code_id: "code-7".to_string(),
            message: "stored".to_string()
        }
    );

    client
        .compile_source_code("code-7", "", false, "")
        .await;
    let compile = server.recv_kind(MessageType::CompileSourceRequest).await;
    server
        .send(&Frame::new(
            compile.header.request_id.clone(),
            "server".to_string(),
            None,
            Payload::CompileResponse(CompileSourceResponse {
                success: true,
                ir_code_id: "ir-7".to_string(),
                message: "compiled".to_string(),
            }),
        ))
        .await;
    let event = wait_for(&mut events, |e| {
        matches!(e, ClientEvent::CompileResult { .. })
    })
    .await;
    assert_eq!(
        event,
        ClientEvent::CompileResult {
            success: true,
            ir_code_id: "ir-7".to_string(),
            message: "compiled".to_string()
        }
    );

    client
        .execute_ir_code("ir-7", ExecutionMode::Jit, Default::default(), 30)
        .await;
    let execute = server.recv_kind(MessageType::ExecuteIrRequest).await;
    server
        .send(&Frame::new(
            execute.header.request_id.clone(),
            "server".to_string(),
            None,
            Payload::ExecuteResponse(ExecuteIrResponse {
                success: true,
                execution_result: "42".to_string(),
                error_message: String::new(),
            }),
        ))
        .await;
    let event = wait_for(&mut events, |e| {
        matches!(e, ClientEvent::ExecuteResult { .. })
    })
    .await;
    assert_eq!(
        event,
        ClientEvent::ExecuteResult {
            success: true,
            result: "42".to_string(),
            error_message: String::new()
        }
    );

    client.disconnect().await;
}

/// Test: a correlated request resolves with its own response frame instead
/// of an event.
#[tokio::test]
async fn test_correlated_request_roundtrip() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = listener.local_addr().expect("no local addr");

    let (client, _events) = spawn_client("correlated");
    client
        .connect("127.0.0.1", addr.port())
        .await
        .expect("connect failed");
    let mut server = ServerPeer::accept(&listener).await;

    let client_fut = client.request(Payload::ExecuteRequest(
        codeforge_client::protocol::ExecuteIrRequest {
            ir_code_id: "ir-55".to_string(),
            mode: ExecutionMode::Interpreter,
            parameters: Default::default(),
            timeout_secs: 10,
        },
    ));
    let server_fut = async {
        let request = server.recv_kind(MessageType::ExecuteIrRequest).await;
        server
            .send(&Frame::new(
                request.header.request_id.clone(),
                "server".to_string(),
                None,
                Payload::ExecuteResponse(ExecuteIrResponse {
                    success: true,
                    execution_result: "interpreted".to_string(),
                    error_message: String::new(),
                }),
            ))
            .await;
        request
    };

    let (response, request) = tokio::join!(client_fut, server_fut);
    assert_eq!(response.header.request_id, request.header.request_id);
    match &response.payload {
        Payload::ExecuteResponse(result) => {
            assert_eq!(result.execution_result, "interpreted");
        }
        other => panic!("expected ExecuteResponse, got {:?}", other.kind()),
    }

    client.disconnect().await;
}

/// Test: an auth-failure error response forces a logout; other errors
/// surface without touching the session.
#[tokio::test]
async fn test_auth_failure_forces_logout() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = listener.local_addr().expect("no local addr");

    let (client, mut events) = spawn_client("auth_failure");
    client
        .connect("127.0.0.1", addr.port())
        .await
        .expect("connect failed");
    let mut server = ServerPeer::accept(&listener).await;

    login_and_ack(&client, &mut server, 3600).await;
    wait_for(&mut events, |e| e == &ClientEvent::LoginStateChanged(true)).await;

    server
        .send(&push_frame(Payload::ErrorResponse(ErrorResponse {
            code: ErrorCode::Common(CommonCode::AuthFailed),
            message: "token rejected".to_string(),
            detail: String::new(),
            solution: "log in again".to_string(),
        })))
        .await;

    wait_for(&mut events, |e| e == &ClientEvent::LoginStateChanged(false)).await;
    assert!(!client.session().is_logged_in());

    let error = wait_for(&mut events, |e| {
        matches!(e, ClientEvent::Error(message) if message.contains("token rejected"))
    })
    .await;
    match error {
        ClientEvent::Error(message) => assert!(message.contains("common/AuthFailed")),
        _ => unreachable!(),
    }

    client.disconnect().await;
}

/// Test: server push notifications arrive with their display label.
#[tokio::test]
async fn test_notification_event() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = listener.local_addr().expect("no local addr");

    let (client, mut events) = spawn_client("notification");
    client
        .connect("127.0.0.1", addr.port())
        .await
        .expect("connect failed");
    let mut server = ServerPeer::accept(&listener).await;

    server
        .send(&push_frame(Payload::Notification(Notification {
            kind: NotificationKind::SystemAnnouncement,
            content: "maintenance at midnight".to_string(),
        })))
        .await;

    let event = wait_for(&mut events, |e| {
        matches!(e, ClientEvent::Notification { .. })
    })
    .await;
    assert_eq!(
        event,
        ClientEvent::Notification {
            label: "System announcement".to_string(),
            content: "maintenance at midnight".to_string()
        }
    );

    client.disconnect().await;
}

/// Test: auto-login replays previously saved credentials.
#[tokio::test]
async fn test_auto_login_uses_saved_credentials() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = listener.local_addr().expect("no local addr");

    let (client, _events) = spawn_client("auto_login");
    client.save_credentials("bob", "hash-bob");
    client
        .connect("127.0.0.1", addr.port())
        .await
        .expect("connect failed");
    let mut server = ServerPeer::accept(&listener).await;

    let ((), request) = tokio::join!(client.auto_login(), async {
        let request = server.recv_kind(MessageType::LoginRequest).await;
        server
            .send(&login_response(&request.header.request_id, 3600))
            .await;
        request
    });
    match &request.payload {
        Payload::LoginRequest(login) => {
            assert_eq!(login.username, "bob");
            assert_eq!(login.password_hash, "hash-bob");
        }
        other => panic!("expected LoginRequest, got {:?}", other.kind()),
    }

    client.clear_credentials();
    assert!(client.session().load_credentials().is_none());

    client.disconnect().await;
}

/// Test: a session expiring inside the margin is proactively logged out by
/// the periodic check.
#[tokio::test]
async fn test_session_expires_proactively() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = listener.local_addr().expect("no local addr");

    let (client, mut events) = spawn_client("expiry");
    client
        .connect("127.0.0.1", addr.port())
        .await
        .expect("connect failed");
    let mut server = ServerPeer::accept(&listener).await;

    // Expires in 60s — already inside the 300s margin, so the next periodic
    // check (every 100ms in this config) force-expires it.
    login_and_ack(&client, &mut server, 60).await;

    wait_for(&mut events, |e| {
        matches!(e, ClientEvent::Error(message) if message.contains("Session expired"))
    })
    .await;
    wait_for(&mut events, |e| e == &ClientEvent::LoginStateChanged(false)).await;
    assert!(!client.session().is_logged_in());

    client.disconnect().await;
}

/// Test: a session far from expiry is left alone by the periodic check.
#[tokio::test]
async fn test_session_not_expired_outside_margin() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = listener.local_addr().expect("no local addr");

    let (client, mut events) = spawn_client("no_expiry");
    client
        .connect("127.0.0.1", addr.port())
        .await
        .expect("connect failed");
    let mut server = ServerPeer::accept(&listener).await;

    login_and_ack(&client, &mut server, 3600).await;
    wait_for(&mut events, |e| e == &ClientEvent::LoginStateChanged(true)).await;

    // Several check periods pass without an expiry.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(client.session().is_logged_in());
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, ClientEvent::LoginStateChanged(false)),
            "session expired unexpectedly"
        );
    }

    client.disconnect().await;
}

/// Test: peer close with auto-reconnect enabled yields exactly one
/// reconnect attempt after the configured delay.
#[tokio::test]
async fn test_peer_close_triggers_single_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = listener.local_addr().expect("no local addr");

    let (client, mut events) = spawn_client("reconnect");
    client.set_auto_reconnect(true, Duration::from_millis(100));

    client
        .connect("127.0.0.1", addr.port())
        .await
        .expect("connect failed");
    wait_for(&mut events, |e| e == &ClientEvent::ConnectionStateChanged(true)).await;

    let server = ServerPeer::accept(&listener).await;
    drop(server);

    wait_for(&mut events, |e| {
        e == &ClientEvent::ConnectionStateChanged(false)
    })
    .await;

    // The one reconnect attempt lands on the listener and comes back up.
    let _server = ServerPeer::accept(&listener).await;
    wait_for(&mut events, |e| e == &ClientEvent::ConnectionStateChanged(true)).await;
    assert!(client.is_connected());

    client.disconnect().await;
}

/// Test: operations attempted while disconnected fail as result events,
/// not errors or panics.
#[tokio::test]
async fn test_operations_while_disconnected_surface_failures() {
    let (client, mut events) = spawn_client("offline_ops");

    client.login("alice", "cafef00d", "", "").await;
    match next_event(&mut events).await {
        ClientEvent::LoginResult { success, message } => {
            assert!(!success);
            assert!(message.contains("not connected"));
        }
        other => panic!("expected LoginResult, got {other:?}"),
    }

    client
        .compile_source_code("code-1", "", false, "")
        .await;
    match next_event(&mut events).await {
        ClientEvent::CompileResult { success, .. } => assert!(!success),
        other => panic!("expected CompileResult, got {other:?}"),
    }
}
