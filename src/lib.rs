//! Codeforge Client Engine
//!
//! This library is the protocol client engine for the codeforge remote
//! compile/execute service. It authenticates a session, submits source
//! code, triggers compilation, and drives execution of IR code over one
//! persistent length-prefixed binary TCP connection, handling connection
//! loss, heartbeats, and request/response correlation along the way.
//!
//! - `protocol` - wire message contract and length-prefixed framing codec
//! - `net` - connection lifecycle, heartbeat, reconnect, request correlation
//! - `session` - authentication state, expiry tracking, saved credentials
//! - `client` - public operations, inbound dispatcher, emitted events
//!
//! # Usage
//!
//! ```ignore
//! use codeforge_client::{ClientConfig, ClientEvent, ForgeClient};
//! use tokio::sync::mpsc;
//!
//! let (events_tx, mut events_rx) = mpsc::unbounded_channel();
//! let client = ForgeClient::new(ClientConfig::default(), events_tx);
//!
//! client.connect("127.0.0.1", 8080).await?;
//! client.login("alice", password_hash, "", "v1").await;
//!
//! while let Some(event) = events_rx.recv().await {
//!     match event {
//!         ClientEvent::LoginResult { success, message } => { /* ... */ }
//!         _ => {}
//!     }
//! }
//! ```

pub mod client;
pub mod net;
pub mod protocol;
pub mod session;

pub use client::{ClientConfig, ClientEvent, ForgeClient};
pub use net::{ConnectionManager, ConnectionState, NetError, NetEvent};
pub use protocol::{ExecutionMode, Frame, MessageType, Payload};
pub use session::{CredentialStore, SessionState};
