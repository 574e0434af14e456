//! A single pipelined connection.

use crate::config::ConnectionConfig;
use crate::decoder::DecoderPool;
use crate::error::ClientError;
use crate::listener::Listener;
use crate::manager::{ConnectionState, Manager, ManagerMsg};
use crate::partitioner::{Control, Partitioner, PartitionerMsg};
use crate::request::{Reply, Request, Transaction, TransactionReply};
use crate::subscription::{Subscriber, Subscription};
use crate::transport::{connect_tcp, Link};
use respconn_protocol::Command;
use std::future::Future;
use std::io;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/// Handle to one connection: a partitioner, a manager and a decoder pool.
///
/// Dropping the handle requests a graceful shutdown.
pub struct Connection {
    id: Uuid,
    partitioner: mpsc::UnboundedSender<PartitionerMsg>,
    manager: mpsc::UnboundedSender<ManagerMsg>,
    state: watch::Receiver<ConnectionState>,
}

impl Connection {
    /// Opens a TCP connection to `config.addr` in the background.
    ///
    /// Returns immediately; requests submitted before the connect completes are
    /// queued and flushed once it does.
    pub fn open(config: ConnectionConfig, listener: Arc<dyn Listener>) -> Self {
        let addr = config.addr.clone();
        let socket = config.socket.clone();
        Self::open_with(config, listener, async move {
            let stream = connect_tcp(&addr, &socket).await?;
            Ok(Link::new(stream))
        })
    }

    /// Opens a connection over whatever transport `connect` produces.
    pub fn open_with<F>(config: ConnectionConfig, listener: Arc<dyn Listener>, connect: F) -> Self
    where
        F: Future<Output = io::Result<Link>> + Send + 'static,
    {
        let id = Uuid::new_v4();
        let (manager_tx, manager_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        let decoders = DecoderPool::new(config.decoder_workers);
        let partitioner = Partitioner::new(id, decoders, manager_tx.clone()).spawn();
        let manager = Manager::new(
            id,
            config,
            listener,
            manager_tx.clone(),
            partitioner.clone(),
            state_tx,
        );
        manager.spawn(manager_rx, Box::pin(connect));

        Self {
            id,
            partitioner,
            manager: manager_tx,
            state: state_rx,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Waits until the connection reaches `target`, or stops.
    pub async fn wait_for_state(&self, target: ConnectionState) -> ConnectionState {
        let mut state = self.state.clone();
        let result = match state
            .wait_for(|s| *s == target || s.is_terminal())
            .await
        {
            Ok(current) => *current,
            Err(_) => ConnectionState::Stopped,
        };
        result
    }

    /// Submits requests as one unit; they are written contiguously and in order.
    pub fn submit(&self, requests: Vec<Request>) {
        if requests.is_empty() {
            return;
        }
        if let Err(mpsc::error::SendError(PartitionerMsg::Submit(lost))) =
            self.partitioner.send(PartitionerMsg::Submit(requests))
        {
            for request in lost {
                request.fail(ClientError::ConnectionClosed);
            }
        }
    }

    /// Sends one command.
    pub fn send(&self, command: Command) -> Reply {
        let (request, reply) = Request::new(command);
        self.submit(vec![request]);
        reply
    }

    /// Sends commands back to back, one reply per command.
    pub fn pipeline(&self, commands: impl IntoIterator<Item = Command>) -> Vec<Reply> {
        let (requests, replies): (Vec<_>, Vec<_>) = commands.into_iter().map(Request::new).unzip();
        self.submit(requests);
        replies
    }

    /// Sends a subscriber-mode command. Resolves with `Null` once written.
    pub fn send_push(&self, command: Command) -> Reply {
        let (request, reply) = Request::push(command);
        self.submit(vec![request]);
        reply
    }

    /// Sends `MULTI`, the block's commands and `EXEC` as one unit.
    pub fn transaction(&self, transaction: Transaction) -> TransactionReply {
        let (requests, reply) = transaction.into_requests();
        self.submit(requests);
        reply
    }

    /// Switches the connection to push mode and returns the message stream.
    ///
    /// Replies still owed to earlier requests are delivered first. Only the
    /// first subscription on a connection takes effect.
    pub fn subscribe(&self) -> Subscriber {
        let (sink, subscriber) = Subscription::channel();
        let _ = self.partitioner.send(PartitionerMsg::Subscribe(sink));
        subscriber
    }

    /// Applies a shadow-queue adjustment on the partitioner.
    pub fn control(&self, control: Control) {
        let _ = self.partitioner.send(PartitionerMsg::Control(control));
    }

    /// Requests a graceful shutdown. Pending requests fail with `ConnectionClosed`.
    pub fn shutdown(&self) {
        let _ = self.manager.send(ManagerMsg::Shutdown);
    }

    /// Posts a message straight into the manager inbox.
    #[cfg(test)]
    pub(crate) fn inject(&self, msg: ManagerMsg) {
        let _ = self.manager.send(msg);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.manager.send(ManagerMsg::Shutdown);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
