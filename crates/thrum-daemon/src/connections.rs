//! Per-connection outbound queues (spec.md §4.3/§9: "a bounded queue with
//! drop-and-disconnect semantics is mandatory; an unbounded channel is a
//! bug").
//!
//! Every live RPC connection (Unix or WebSocket) registers a sender here
//! keyed by its session, if any session has been bound to it via
//! `session.start`/`user.identify`. The subscription bus and the crash
//! sweep both push through this registry rather than holding direct socket
//! handles, so dispatch never needs to know which transport a session is
//! on.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Outbound queue depth per connection (spec.md §8 "256th queued
/// notification... causes connection close on the 257th enqueue").
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

pub type Outbound = mpsc::Sender<String>;

/// What a connection registers: its outbound sender, plus a token the
/// transport's read/write loop watches so `try_send` can force a
/// disconnect when the queue is full (spec.md §8) rather than silently
/// dropping the notification and leaving a slow consumer attached.
struct ConnectionHandle {
    sender: Outbound,
    close: CancellationToken,
}

#[derive(Default)]
pub struct Connections {
    by_session: Mutex<HashMap<String, ConnectionHandle>>,
}

impl Connections {
    pub fn new() -> Self {
        Connections::default()
    }

    /// Binds `session_id` to a connection's outbound sender and close
    /// token, replacing any prior binding (a session can only be attached
    /// to one live socket).
    pub fn bind(&self, session_id: &str, sender: Outbound, close: CancellationToken) {
        self.by_session
            .lock()
            .unwrap()
            .insert(session_id.to_string(), ConnectionHandle { sender, close });
    }

    pub fn unbind(&self, session_id: &str) {
        self.by_session.lock().unwrap().remove(session_id);
    }

    /// Enqueues `payload` (a pre-serialized JSON line) for `session_id`.
    /// Returns `true` if a connection was found and the send was accepted.
    /// If the queue is full, the connection is forced closed (its token is
    /// cancelled) and unbound; the subscription itself is left intact so a
    /// reconnecting client keeps receiving (spec.md §4.5).
    pub fn try_send(&self, session_id: &str, payload: String) -> bool {
        let mut by_session = self.by_session.lock().unwrap();
        let Some(handle) = by_session.get(session_id) else { return false };
        match handle.sender.try_send(payload) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                handle.close.cancel();
                by_session.remove(session_id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                by_session.remove(session_id);
                false
            }
        }
    }

    pub fn is_connected(&self, session_id: &str) -> bool {
        self.by_session.lock().unwrap().contains_key(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_then_send_delivers_to_receiver() {
        let connections = Connections::new();
        let (tx, mut rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        connections.bind("ses_1", tx, CancellationToken::new());

        assert!(connections.try_send("ses_1", "hello".into()));
        assert_eq!(rx.recv().await.unwrap(), "hello");
    }

    #[test]
    fn send_to_unbound_session_returns_false() {
        let connections = Connections::new();
        assert!(!connections.try_send("ses_ghost", "x".into()));
    }

    #[test]
    fn unbind_removes_session() {
        let connections = Connections::new();
        let (tx, _rx) = mpsc::channel(4);
        connections.bind("ses_1", tx, CancellationToken::new());
        connections.unbind("ses_1");
        assert!(!connections.is_connected("ses_1"));
    }

    #[test]
    fn full_queue_disconnects_and_cancels_close_token() {
        let connections = Connections::new();
        let (tx, _rx) = mpsc::channel(1);
        let close = CancellationToken::new();
        connections.bind("ses_1", tx, close.clone());
        assert!(connections.try_send("ses_1", "first".into()));
        assert!(!connections.try_send("ses_1", "second".into()));
        assert!(close.is_cancelled());
        assert!(!connections.is_connected("ses_1"));
    }
}
