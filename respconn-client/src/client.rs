//! High-level client API.
//!
//! A [`Client`] owns one connection at a time and a supervisor task that
//! listens to its lifecycle events, acknowledges shutdown and abort, and opens
//! a replacement connection after the old one stops.

use crate::config::ConnectionConfig;
use crate::connection::Connection;
use crate::error::ClientError;
use crate::listener::{ChannelListener, ConnectionEvent, NoopListener};
use crate::manager::ConnectionState;
use crate::request::{Reply, Transaction, TransactionReply};
use crate::subscription::{PushMessage, Subscriber};
use parking_lot::RwLock;
use respconn_protocol::{Command, RespValue};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Default capacity for the client event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle events published by a [`Client`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connected { connection: Uuid },
    Disconnected { connection: Uuid },
    Aborted { connection: Uuid },
    RequestsFailed { connection: Uuid, count: usize },
    Stopped { connection: Uuid },
    Reconnecting { attempt: u32, delay: Duration },
}

struct Shared {
    config: ConnectionConfig,
    current: RwLock<Arc<Connection>>,
    events: broadcast::Sender<ClientEvent>,
    closed: AtomicBool,
    failed: AtomicU64,
}

/// Client with automatic reconnection.
pub struct Client {
    shared: Arc<Shared>,
    supervisor: JoinHandle<()>,
}

impl Client {
    /// Opens the first connection and starts the supervisor.
    ///
    /// Connecting happens in the background; early requests are queued.
    pub fn open(config: ConnectionConfig) -> Result<Self, ClientError> {
        config
            .validate()
            .map_err(|e| ClientError::Config(e.to_string()))?;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (connection, listener_rx) = open_supervised(&config);
        let shared = Arc::new(Shared {
            config,
            current: RwLock::new(connection),
            events,
            closed: AtomicBool::new(false),
            failed: AtomicU64::new(0),
        });
        let supervisor = tokio::spawn(supervise(shared.clone(), listener_rx));

        Ok(Self { shared, supervisor })
    }

    /// Subscribes to lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }

    /// State of the current connection.
    pub fn state(&self) -> ConnectionState {
        self.connection().state()
    }

    /// Returns the current connection.
    pub fn connection(&self) -> Arc<Connection> {
        self.shared.current.read().clone()
    }

    /// Total requests failed by connection teardowns so far.
    pub fn failed_requests(&self) -> u64 {
        self.shared.failed.load(Ordering::Relaxed)
    }

    /// Waits until the current connection is connected.
    pub async fn wait_connected(&self) -> Result<(), ClientError> {
        match self
            .connection()
            .wait_for_state(ConnectionState::Connected)
            .await
        {
            ConnectionState::Connected => Ok(()),
            _ => Err(ClientError::ConnectionClosed),
        }
    }

    /// Stops reconnecting and shuts down the current connection.
    pub fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.connection().shutdown();
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Sends one command.
    pub fn send(&self, command: Command) -> Reply {
        self.connection().send(command)
    }

    /// Sends commands back to back on the current connection.
    pub fn pipeline(&self, commands: impl IntoIterator<Item = Command>) -> Vec<Reply> {
        self.connection().pipeline(commands)
    }

    /// Runs a MULTI/EXEC block.
    pub fn transaction(&self, transaction: Transaction) -> TransactionReply {
        self.connection().transaction(transaction)
    }

    /// Sends a command and maps server errors into `Err`.
    pub async fn call(&self, command: Command) -> Result<RespValue, ClientError> {
        self.send(command).await
    }

    /// Pings the server.
    pub async fn ping(&self) -> Result<(), ClientError> {
        self.call(Command::new("PING")).await?;
        Ok(())
    }

    /// Gets a key. Returns `None` for a missing key.
    pub async fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<RespValue>, ClientError> {
        match self.call(Command::new("GET").arg(key)).await? {
            RespValue::Null => Ok(None),
            value => Ok(Some(value)),
        }
    }

    /// Sets a key.
    pub async fn set(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<(), ClientError> {
        self.call(Command::new("SET").arg(key).arg(value)).await?;
        Ok(())
    }

    /// Deletes keys and returns how many existed.
    pub async fn del<K: AsRef<[u8]>>(&self, keys: impl IntoIterator<Item = K>) -> Result<i64, ClientError> {
        let mut command = Command::new("DEL");
        for key in keys {
            command = command.arg(key);
        }
        integer(self.call(command).await?)
    }

    /// Increments a counter and returns the new value.
    pub async fn incr(&self, key: impl AsRef<[u8]>) -> Result<i64, ClientError> {
        integer(self.call(Command::new("INCR").arg(key)).await?)
    }

    /// Publishes a message and returns the number of receivers.
    pub async fn publish(
        &self,
        channel: impl AsRef<[u8]>,
        message: impl AsRef<[u8]>,
    ) -> Result<i64, ClientError> {
        integer(self.call(Command::new("PUBLISH").arg(channel).arg(message)).await?)
    }

    // =========================================================================
    // Pub/sub
    // =========================================================================

    /// Opens a dedicated push-mode connection subscribed to `channels`.
    pub async fn subscriber<C: AsRef<[u8]>>(
        &self,
        channels: impl IntoIterator<Item = C>,
    ) -> Result<PubSub, ClientError> {
        let config = self.shared.config.clone().with_reconnect(false);
        let connection = Connection::open(config, Arc::new(NoopListener));
        let messages = connection.subscribe();
        let pubsub = PubSub {
            connection,
            messages,
        };
        pubsub.subscribe(channels).await?;
        Ok(pubsub)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.supervisor.abort();
    }
}

fn integer(value: RespValue) -> Result<i64, ClientError> {
    value
        .as_integer()
        .ok_or_else(|| ClientError::Server(format!("expected integer reply, got {:?}", value)))
}

fn open_supervised(
    config: &ConnectionConfig,
) -> (Arc<Connection>, mpsc::UnboundedReceiver<ConnectionEvent>) {
    let (listener, events) = ChannelListener::new();
    let connection = Connection::open(config.clone(), Arc::new(listener));
    (Arc::new(connection), events)
}

async fn supervise(shared: Arc<Shared>, mut events: mpsc::UnboundedReceiver<ConnectionEvent>) {
    let mut attempt: u32 = 0;

    loop {
        let id = shared.current.read().id();
        while let Some(event) = events.recv().await {
            let published = match event {
                ConnectionEvent::Connected => {
                    attempt = 0;
                    ClientEvent::Connected { connection: id }
                }
                ConnectionEvent::Shutdown(ack) => {
                    ack.ack();
                    ClientEvent::Disconnected { connection: id }
                }
                ConnectionEvent::Abort(ack) => {
                    ack.ack();
                    ClientEvent::Aborted { connection: id }
                }
                ConnectionEvent::Removed(count) => {
                    shared.failed.fetch_add(count as u64, Ordering::Relaxed);
                    ClientEvent::RequestsFailed {
                        connection: id,
                        count,
                    }
                }
                ConnectionEvent::Stopped => break,
            };
            let _ = shared.events.send(published);
        }
        let _ = shared.events.send(ClientEvent::Stopped { connection: id });

        if !shared.config.reconnect || shared.closed.load(Ordering::SeqCst) {
            tracing::debug!(conn = %id, "Supervisor finished");
            return;
        }

        attempt = attempt.saturating_add(1);
        let delay = shared.config.reconnect_delay();
        tracing::info!(attempt, "Reconnecting to {} in {:?}", shared.config.addr, delay);
        let _ = shared.events.send(ClientEvent::Reconnecting { attempt, delay });
        tokio::time::sleep(delay).await;
        if shared.closed.load(Ordering::SeqCst) {
            return;
        }

        let (connection, next_events) = open_supervised(&shared.config);
        *shared.current.write() = connection;
        events = next_events;
    }
}

/// A dedicated push-mode connection.
pub struct PubSub {
    connection: Connection,
    messages: Subscriber,
}

impl PubSub {
    /// Subscribes to more channels.
    pub async fn subscribe<C: AsRef<[u8]>>(
        &self,
        channels: impl IntoIterator<Item = C>,
    ) -> Result<(), ClientError> {
        self.push("SUBSCRIBE", channels).await
    }

    /// Subscribes to channel patterns.
    pub async fn psubscribe<C: AsRef<[u8]>>(
        &self,
        patterns: impl IntoIterator<Item = C>,
    ) -> Result<(), ClientError> {
        self.push("PSUBSCRIBE", patterns).await
    }

    /// Unsubscribes from channels, or from all when empty.
    pub async fn unsubscribe<C: AsRef<[u8]>>(
        &self,
        channels: impl IntoIterator<Item = C>,
    ) -> Result<(), ClientError> {
        self.push("UNSUBSCRIBE", channels).await
    }

    async fn push<C: AsRef<[u8]>>(
        &self,
        name: &str,
        args: impl IntoIterator<Item = C>,
    ) -> Result<(), ClientError> {
        let mut command = Command::new(name);
        for arg in args {
            command = command.arg(arg);
        }
        self.connection.send_push(command).await?;
        Ok(())
    }

    /// Next push message, or `None` once the connection is gone.
    pub async fn next_message(&mut self) -> Option<PushMessage> {
        self.messages.recv().await
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }
}
