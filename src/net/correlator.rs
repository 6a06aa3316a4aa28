//! Synchronous request/response correlation over the asynchronous socket.
//!
//! [`PendingTable`] maps outstanding request ids to oneshot senders. The
//! read task resolves entries as responses arrive; callers of
//! [`ConnectionManager::send_request`] suspend on the receiving end with a
//! bounded timeout. The suspension is a future, never a thread block, so
//! the read task that must deliver the response is never starved.
//!
//! A request that times out is abandoned client-side: its entry is removed,
//! the id is remembered, and a late response for it is discarded with a
//! debug log instead of surfacing as an unsolicited message.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::net::connection::ConnectionManager;
use crate::protocol::{Frame, NetworkCode};

/// How many abandoned request ids to remember for stale-response discard.
const ABANDONED_MEMORY: usize = 128;

/// Table of outstanding correlated requests.
///
/// Invariant: at most one entry per request id. Shared between the read
/// task (resolve side) and request callers (register/abandon side); all
/// access goes through one mutex held only for map operations, never across
/// an await point.
#[derive(Debug, Default)]
pub struct PendingTable {
    inner: Mutex<TableInner>,
}

#[derive(Debug, Default)]
struct TableInner {
    waiting: HashMap<String, oneshot::Sender<Frame>>,
    /// Recently timed-out ids, oldest first. Bounded ring.
    abandoned: VecDeque<String>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `request_id`.
    ///
    /// Returns `None` if the id already has an outstanding entry; the
    /// caller must not wait in that case.
    pub fn register(&self, request_id: &str) -> Option<oneshot::Receiver<Frame>> {
        let mut inner = self.inner.lock().expect("pending table lock poisoned");
        if inner.waiting.contains_key(request_id) {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        inner.waiting.insert(request_id.to_string(), tx);
        Some(rx)
    }

    /// Offer an inbound frame to the table.
    ///
    /// Returns `None` if the frame was consumed (a waiter was resolved, or
    /// the id was recently abandoned and the late response is discarded).
    /// Returns the frame back if it is uncorrelated and should go to the
    /// dispatcher.
    pub fn complete(&self, frame: Frame) -> Option<Frame> {
        let mut inner = self.inner.lock().expect("pending table lock poisoned");
        let request_id = frame.header.request_id.clone();

        if let Some(tx) = inner.waiting.remove(&request_id) {
            if let Err(frame) = tx.send(frame) {
                // Waiter vanished between timeout and resolve; same as stale.
                debug!(
                    "Discarding response for dropped waiter (request id {})",
                    frame.header.request_id
                );
            }
            return None;
        }

        if inner.abandoned.iter().any(|id| id == &request_id) {
            debug!(
                "Discarding stale response for timed-out request id {}",
                request_id
            );
            return None;
        }

        Some(frame)
    }

    /// Remove a timed-out entry and remember its id so a late response is
    /// discarded rather than treated as unsolicited.
    pub fn abandon(&self, request_id: &str) {
        let mut inner = self.inner.lock().expect("pending table lock poisoned");
        inner.waiting.remove(request_id);
        if inner.abandoned.len() == ABANDONED_MEMORY {
            inner.abandoned.pop_front();
        }
        inner.abandoned.push_back(request_id.to_string());
    }

    /// Remove an entry without remembering it (send-failure path: nothing
    /// was put on the wire, so no late response can exist).
    pub fn remove(&self, request_id: &str) {
        let mut inner = self.inner.lock().expect("pending table lock poisoned");
        inner.waiting.remove(request_id);
    }

    /// Drop every waiter. Each pending `send_request` resolves promptly
    /// with a connection-lost error frame.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("pending table lock poisoned");
        inner.waiting.clear();
    }

    /// Number of outstanding waiters.
    pub fn waiting(&self) -> usize {
        self.inner
            .lock()
            .expect("pending table lock poisoned")
            .waiting
            .len()
    }
}

impl ConnectionManager {
    /// Send a frame and wait for the correlated response.
    ///
    /// Registers the frame's request id, sends the frame, and suspends
    /// until the response arrives or `timeout` elapses. Every outcome is a
    /// frame:
    ///
    /// - the matching response, if one arrives in time;
    /// - a synthetic error-response frame echoing the request id with a
    ///   timeout code, if the wait elapses (the entry is abandoned and a
    ///   late response will be discarded);
    /// - a synthetic error-response frame immediately, if the send itself
    ///   fails (no entry is left behind);
    /// - a synthetic connection-lost frame, if the connection drops while
    ///   waiting.
    ///
    /// Multiple callers may wait on distinct request ids concurrently;
    /// responses arriving in any order resolve their own waiter only.
    pub async fn send_request(&self, frame: &Frame, timeout: Duration) -> Frame {
        let request_id = frame.header.request_id.clone();

        let rx = match self.pending().register(&request_id) {
            Some(rx) => rx,
            None => {
                warn!("Duplicate outstanding request id {}", request_id);
                return Frame::synthetic_error(
                    &request_id,
                    NetworkCode::SendFailed,
                    "a request with this id is already outstanding".to_string(),
                );
            }
        };

        if let Err(e) = self.send_frame(frame).await {
            self.pending().remove(&request_id);
            return Frame::synthetic_error(
                &request_id,
                NetworkCode::SendFailed,
                format!("failed to send request: {e}"),
            );
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_closed)) => Frame::synthetic_error(
                &request_id,
                NetworkCode::ConnectionLost,
                "connection lost while waiting for response".to_string(),
            ),
            Err(_elapsed) => {
                warn!("Request timeout for request id {}", request_id);
                self.pending().abandon(&request_id);
                Frame::synthetic_error(
                    &request_id,
                    NetworkCode::Timeout,
                    format!("no response within {timeout:?}"),
                )
            }
        }
    }
}
