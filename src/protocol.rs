//! Wire protocol for communication with the codeforge server.
//!
//! This module defines the binary message contract and the framing codec
//! used on the persistent TCP connection:
//!
//! ```text
//! ┌──────────────────┐        TCP stream        ┌───────────────────┐
//! │  ForgeClient     │ ◄───────────────────────►│  codeforge server │
//! │  (this crate)    │   u32 BE length + body   │                   │
//! └──────────────────┘                          └───────────────────┘
//! ```
//!
//! # Wire Format
//!
//! Every frame is a 4-byte big-endian length prefix followed by exactly that
//! many bytes of [`postcard`]-serialized [`Frame`]. There are no magic or
//! sync bytes; the length prefix alone delimits frames.
//!
//! # Messages
//!
//! A [`Frame`] carries a [`Header`] (request id, client id, timestamp, kind
//! tag, optional auth token) and exactly one [`Payload`] variant selected by
//! the kind tag. Decoding rejects frames whose header tag and payload
//! variant disagree.

mod codec;
mod message;

pub use codec::{encode_frame, CodecError, FrameBuffer, DEFAULT_MAX_FRAME_LEN, LEN_PREFIX_LEN};
pub use message::{
    CommonCode, CompileSourceRequest, CompileSourceResponse, ErrorCode, ErrorResponse,
    ExecuteIrRequest, ExecuteIrResponse, ExecutionMode, Frame, Header, Heartbeat, LoginRequest,
    LoginResponse, MessageType, NetworkCode, Notification, NotificationKind, Payload,
    SaveSourceCodeRequest, SaveSourceCodeResponse,
};
