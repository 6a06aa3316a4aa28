//! Message types for the codeforge wire protocol.
//!
//! These structs are the fixed, externally defined message contract between
//! client and server. They use serde for postcard (de)serialization; field
//! order is part of the wire format and must not be rearranged.

use std::collections::BTreeMap;
use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Message kind tag carried in every frame header.
///
/// The header tag must agree with the populated [`Payload`] variant;
/// decoding fails otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    LoginRequest,
    LoginResponse,
    SaveSourceCodeRequest,
    SaveSourceCodeResponse,
    CompileSourceRequest,
    CompileSourceResponse,
    ExecuteIrRequest,
    ExecuteIrResponse,
    Heartbeat,
    Notification,
    ErrorResponse,
}

impl MessageType {
    /// Get a short display string for logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::LoginRequest => "LOGIN_REQUEST",
            MessageType::LoginResponse => "LOGIN_RESPONSE",
            MessageType::SaveSourceCodeRequest => "SAVE_SOURCE_CODE_REQUEST",
            MessageType::SaveSourceCodeResponse => "SAVE_SOURCE_CODE_RESPONSE",
            MessageType::CompileSourceRequest => "COMPILE_SOURCE_REQUEST",
            MessageType::CompileSourceResponse => "COMPILE_SOURCE_RESPONSE",
            MessageType::ExecuteIrRequest => "EXECUTE_IR_REQUEST",
            MessageType::ExecuteIrResponse => "EXECUTE_IR_RESPONSE",
            MessageType::Heartbeat => "HEARTBEAT",
            MessageType::Notification => "NOTIFICATION",
            MessageType::ErrorResponse => "ERROR_RESPONSE",
        }
    }

    /// Check if this is a request kind (client → server).
    ///
    /// The server never sends request kinds; the dispatcher drops them.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            MessageType::LoginRequest
                | MessageType::SaveSourceCodeRequest
                | MessageType::CompileSourceRequest
                | MessageType::ExecuteIrRequest
        )
    }
}

/// Frame header common to every message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Unique id for correlating responses to requests.
    pub request_id: String,
    /// Identity of the sending client.
    pub client_id: String,
    /// Milliseconds since epoch at build time.
    pub timestamp: i64,
    /// Message kind tag; must match the payload variant.
    pub kind: MessageType,
    /// Session token, present iff the session is logged in.
    /// Heartbeats never carry a token.
    pub auth_token: Option<String>,
}

// =============================================================================
// Payload variants
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password_hash: String,
    pub device_info: String,
    pub app_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginResponse {
    pub success: bool,
    /// Opaque session token; the auth token for subsequent requests.
    pub session_id: String,
    /// Session expiry as epoch seconds.
    pub expire_time: i64,
    pub user_nickname: String,
    pub user_role: u32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveSourceCodeRequest {
    pub code_id: String,
    pub language: String,
    pub source_code: String,
    pub code_name: String,
    pub description: String,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveSourceCodeResponse {
    pub success: bool,
    pub code_id: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileSourceRequest {
    pub code_id: String,
    pub compiler_options: String,
    pub optimize: bool,
    pub target_ir_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileSourceResponse {
    pub success: bool,
    pub ir_code_id: String,
    pub message: String,
}

/// How the server should run IR code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ExecutionMode {
    #[default]
    Jit,
    Interpreter,
    Aot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteIrRequest {
    pub ir_code_id: String,
    pub mode: ExecutionMode,
    pub parameters: BTreeMap<String, String>,
    /// Server-side execution timeout in seconds.
    pub timeout_secs: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteIrResponse {
    pub success: bool,
    pub execution_result: String,
    pub error_message: String,
}

/// Liveness frame exchanged while connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Milliseconds since epoch of the sender's last activity.
    pub last_active_time: i64,
}

/// Server push notification category.
///
/// Includes `Unknown` for forward-compatibility with new categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    SystemAnnouncement,
    OrderStatusChange,
    FriendRequest,
    Unknown,
}

impl NotificationKind {
    /// Human-readable label for the presentation layer.
    pub fn label(&self) -> &'static str {
        match self {
            NotificationKind::SystemAnnouncement => "System announcement",
            NotificationKind::OrderStatusChange => "Order status change",
            NotificationKind::FriendRequest => "Friend request",
            NotificationKind::Unknown => "Unknown notification",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub content: String,
}

// =============================================================================
// Error codes
// =============================================================================

/// General error codes shared by all services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommonCode {
    AuthFailed,
    InvalidRequest,
    PermissionDenied,
    InternalError,
    Unknown,
}

/// Transport-domain error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkCode {
    Timeout,
    SendFailed,
    ConnectionLost,
    Unknown,
}

/// Peer error code from one of two disjoint namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Common(CommonCode),
    Network(NetworkCode),
}

impl ErrorCode {
    /// Check if this code indicates an authentication failure.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, ErrorCode::Common(CommonCode::AuthFailed))
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Common(c) => write!(f, "common/{:?}", c),
            ErrorCode::Network(c) => write!(f, "network/{:?}", c),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
    /// Optional diagnostic detail.
    pub detail: String,
    /// Optional suggested remedy.
    pub solution: String,
}

// =============================================================================
// Frame
// =============================================================================

/// One typed payload, selected by the header's kind tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    LoginRequest(LoginRequest),
    LoginResponse(LoginResponse),
    SaveSourceRequest(SaveSourceCodeRequest),
    SaveSourceResponse(SaveSourceCodeResponse),
    CompileRequest(CompileSourceRequest),
    CompileResponse(CompileSourceResponse),
    ExecuteRequest(ExecuteIrRequest),
    ExecuteResponse(ExecuteIrResponse),
    Heartbeat(Heartbeat),
    Notification(Notification),
    ErrorResponse(ErrorResponse),
}

impl Payload {
    /// The message kind this payload variant corresponds to.
    pub fn kind(&self) -> MessageType {
        match self {
            Payload::LoginRequest(_) => MessageType::LoginRequest,
            Payload::LoginResponse(_) => MessageType::LoginResponse,
            Payload::SaveSourceRequest(_) => MessageType::SaveSourceCodeRequest,
            Payload::SaveSourceResponse(_) => MessageType::SaveSourceCodeResponse,
            Payload::CompileRequest(_) => MessageType::CompileSourceRequest,
            Payload::CompileResponse(_) => MessageType::CompileSourceResponse,
            Payload::ExecuteRequest(_) => MessageType::ExecuteIrRequest,
            Payload::ExecuteResponse(_) => MessageType::ExecuteIrResponse,
            Payload::Heartbeat(_) => MessageType::Heartbeat,
            Payload::Notification(_) => MessageType::Notification,
            Payload::ErrorResponse(_) => MessageType::ErrorResponse,
        }
    }
}

/// One complete unit of wire data: header plus one typed payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub header: Header,
    pub payload: Payload,
}

impl Frame {
    /// Build a frame with a header derived from the payload.
    ///
    /// The kind tag is taken from the payload variant, so frames built this
    /// way always satisfy the tag/payload consistency invariant. The
    /// timestamp is the current time in epoch milliseconds.
    pub fn new(
        request_id: String,
        client_id: String,
        auth_token: Option<String>,
        payload: Payload,
    ) -> Self {
        Frame {
            header: Header {
                request_id,
                client_id,
                timestamp: Utc::now().timestamp_millis(),
                kind: payload.kind(),
                auth_token,
            },
            payload,
        }
    }

    /// Build a local synthetic error-response frame echoing `request_id`.
    ///
    /// Used by the correlator for timeouts and send failures; these frames
    /// never touch the wire.
    pub fn synthetic_error(request_id: &str, code: NetworkCode, message: String) -> Self {
        Frame::new(
            request_id.to_string(),
            String::new(),
            None,
            Payload::ErrorResponse(ErrorResponse {
                code: ErrorCode::Network(code),
                message,
                detail: String::new(),
                solution: String::new(),
            }),
        )
    }

    /// Check the tag/payload consistency invariant.
    pub fn is_consistent(&self) -> bool {
        self.header.kind == self.payload.kind()
    }
}
