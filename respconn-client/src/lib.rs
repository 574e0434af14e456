//! # respconn-client
//!
//! Pipelined RESP connection core.
//!
//! This crate provides:
//! - A connection manager that batches writes, retries failed writes and
//!   drives the connect/shutdown/abort lifecycle
//! - A partitioner that frames the reply stream and matches frames to
//!   requests in submission order
//! - A decoder pool that resolves replies concurrently
//! - Transactions, pub/sub and a reconnecting [`Client`]

pub mod buffer_pool;
pub mod client;
pub mod config;
pub mod connection;
pub mod decoder;
pub mod error;
pub mod listener;
pub mod manager;
pub mod partitioner;
pub mod queue;
pub mod request;
pub mod subscription;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use buffer_pool::BufferPool;
pub use client::{Client, ClientEvent, PubSub};
pub use config::{ConfigError, ConnectionConfig, SocketOptions};
pub use connection::Connection;
pub use error::ClientError;
pub use listener::{Ack, ChannelListener, ConnectionEvent, Listener, NoopListener};
pub use manager::ConnectionState;
pub use partitioner::Control;
pub use request::{Reply, Request, RequestResult, Transaction, TransactionReply};
pub use subscription::{PushMessage, Subscriber, Subscription};
pub use transport::{connect_tcp, AbortHandle, Link, Transport};

pub use respconn_protocol::{Command, RespValue};
