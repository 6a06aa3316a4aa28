//! Connection management for the codeforge protocol client.
//!
//! This module owns the transport side of the engine:
//!
//! - [`ConnectionManager`] drives the connect/disconnect lifecycle, the
//!   heartbeat, and single-shot auto-reconnect, and runs the read task that
//!   reassembles inbound frames.
//! - [`PendingTable`] bridges the asynchronous socket and synchronous
//!   request/response callers: `send_request` registers a waiter keyed by
//!   request id and suspends until the read task resolves it or a timeout
//!   elapses.
//!
//! The read task never blocks on a waiter: suspension is a oneshot channel
//! awaited by the caller, so responses always have a path in.

mod connection;
mod correlator;

pub use connection::{ConnectionManager, ConnectionState, NetConfig, NetError, NetEvent};
pub use correlator::PendingTable;
