//! Lifecycle notifications from the connection manager.

use crate::manager::ManagerMsg;
use std::fmt;
use tokio::sync::mpsc;

/// Lifecycle event delivered to a [`Listener`].
#[derive(Debug)]
pub enum ConnectionEvent {
    /// The socket is open and the first write cycle has started.
    Connected,
    /// The connection is shutting down. The manager waits for the ack.
    Shutdown(Ack),
    /// Writes were exhausted. The manager hard-resets the socket once acked.
    Abort(Ack),
    /// This many requests were removed from the queue without a reply.
    Removed(usize),
    /// The manager reached its terminal state.
    Stopped,
}

impl ConnectionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionEvent::Connected => "connected",
            ConnectionEvent::Shutdown(_) => "shutdown",
            ConnectionEvent::Abort(_) => "abort",
            ConnectionEvent::Removed(_) => "removed",
            ConnectionEvent::Stopped => "stopped",
        }
    }
}

/// Receives lifecycle events. Called from the manager task, so it must not block.
pub trait Listener: Send + Sync + 'static {
    fn on_event(&self, event: ConnectionEvent);
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum AckKind {
    Shutdown,
    Abort,
}

/// Acknowledgment handle for `Shutdown` and `Abort`.
///
/// Acknowledges when [`Ack::ack`] is called or when dropped, whichever comes first.
pub struct Ack {
    kind: AckKind,
    tx: Option<mpsc::UnboundedSender<ManagerMsg>>,
}

impl Ack {
    pub(crate) fn new(kind: AckKind, tx: mpsc::UnboundedSender<ManagerMsg>) -> Self {
        Self { kind, tx: Some(tx) }
    }

    pub fn ack(mut self) {
        self.fire();
    }

    fn fire(&mut self) {
        if let Some(tx) = self.tx.take() {
            let msg = match self.kind {
                AckKind::Shutdown => ManagerMsg::ShutdownAck,
                AckKind::Abort => ManagerMsg::AbortAck,
            };
            // Manager may already be stopped.
            let _ = tx.send(msg);
        }
    }
}

impl Drop for Ack {
    fn drop(&mut self) {
        self.fire();
    }
}

impl fmt::Debug for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ack")
            .field("kind", &self.kind)
            .field("pending", &self.tx.is_some())
            .finish()
    }
}

/// Listener that ignores every event. Acks fire on drop.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl Listener for NoopListener {
    fn on_event(&self, _event: ConnectionEvent) {}
}

/// Listener that forwards events to a channel.
#[derive(Debug, Clone)]
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Listener for ChannelListener {
    fn on_event(&self, event: ConnectionEvent) {
        // A closed receiver drops the event, which also fires any ack it carries.
        let _ = self.tx.send(event);
    }
}
