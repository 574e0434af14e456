//! Connection manager.
//!
//! Single-owner task that holds the write side of the connection: the pending
//! queue, the in-flight batch, retry accounting and the lifecycle state
//! machine. The socket itself is split between a reader task and a writer
//! task; both report back to the manager through its inbox, and every timer
//! is a spawned task that posts a message tagged with the state generation it
//! was armed in.

use crate::buffer_pool::BufferPool;
use crate::config::ConnectionConfig;
use crate::error::ClientError;
use crate::listener::{Ack, AckKind, ConnectionEvent, Listener};
use crate::partitioner::{Control, PartitionerMsg};
use crate::queue::PendingQueue;
use crate::request::Request;
use crate::transport::{AbortHandle, Link};
use bytes::{Bytes, BytesMut};
use respconn_protocol::{Command, RespValue};
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Future resolving to an established transport.
pub type Connector = Pin<Box<dyn Future<Output = io::Result<Link>> + Send>>;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    AwaitingShutdown,
    AwaitingAbort,
    Aborting,
    Stopped,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Stopped)
    }

    /// Whether new submissions are still accepted.
    pub fn accepts_requests(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::AwaitingShutdown => "awaiting-shutdown",
            ConnectionState::AwaitingAbort => "awaiting-abort",
            ConnectionState::Aborting => "aborting",
            ConnectionState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Messages accepted by the manager task.
pub enum ManagerMsg {
    Submit(Vec<Request>),
    Connected(Link),
    ConnectFailed(io::Error),
    ConnectTimeout { generation: u64 },
    WriteAck { buf: BytesMut },
    WriteFailed {
        buf: BytesMut,
        written: usize,
        error: io::Error,
    },
    WriteTimeout { seq: u64 },
    Terminated(Option<io::Error>),
    Shutdown,
    ShutdownAck,
    AbortAck,
    AbortTimeout { generation: u64 },
}

impl fmt::Debug for ManagerMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagerMsg::Submit(requests) => write!(f, "Submit({})", requests.len()),
            ManagerMsg::Connected(link) => write!(f, "Connected({})", link.peer()),
            ManagerMsg::ConnectFailed(e) => write!(f, "ConnectFailed({})", e),
            ManagerMsg::ConnectTimeout { generation } => write!(f, "ConnectTimeout({})", generation),
            ManagerMsg::WriteAck { buf } => write!(f, "WriteAck({} bytes)", buf.len()),
            ManagerMsg::WriteFailed { written, error, .. } => {
                write!(f, "WriteFailed(written={}, {})", written, error)
            }
            ManagerMsg::WriteTimeout { seq } => write!(f, "WriteTimeout({})", seq),
            ManagerMsg::Terminated(e) => write!(f, "Terminated({:?})", e),
            ManagerMsg::Shutdown => f.write_str("Shutdown"),
            ManagerMsg::ShutdownAck => f.write_str("ShutdownAck"),
            ManagerMsg::AbortAck => f.write_str("AbortAck"),
            ManagerMsg::AbortTimeout { generation } => write!(f, "AbortTimeout({})", generation),
        }
    }
}

enum WriterCmd {
    /// Write `buf[offset..]` and flush.
    Write { buf: BytesMut, offset: usize },
    /// Shut down the write side gracefully.
    Close,
}

/// Requests encoded into the outstanding write.
struct Batch {
    requests: Vec<Request>,
}

struct ActiveLink {
    writer: mpsc::UnboundedSender<WriterCmd>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
    abort: AbortHandle,
}

impl ActiveLink {
    fn teardown(self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

pub(crate) struct Manager {
    conn_id: Uuid,
    config: ConnectionConfig,
    state: ConnectionState,
    generation: u64,
    queue: PendingQueue,
    batch: Option<Batch>,
    free_to_write: bool,
    retries: u32,
    preamble: Option<Bytes>,
    pool: BufferPool,
    listener: Arc<dyn Listener>,
    inbox_tx: mpsc::UnboundedSender<ManagerMsg>,
    partitioner: mpsc::UnboundedSender<PartitionerMsg>,
    state_tx: watch::Sender<ConnectionState>,
    link: Option<ActiveLink>,
    connect_task: Option<JoinHandle<()>>,
    connect_timer: Option<JoinHandle<()>>,
    write_timer: Option<JoinHandle<()>>,
    abort_timer: Option<JoinHandle<()>>,
    write_seq: u64,
    reason: Option<ClientError>,
}

impl Manager {
    pub(crate) fn new(
        conn_id: Uuid,
        config: ConnectionConfig,
        listener: Arc<dyn Listener>,
        inbox_tx: mpsc::UnboundedSender<ManagerMsg>,
        partitioner: mpsc::UnboundedSender<PartitionerMsg>,
        state_tx: watch::Sender<ConnectionState>,
    ) -> Self {
        let pool = BufferPool::new(config.buffer_pool_size, config.write_batch_cap * 4);
        Self {
            conn_id,
            config,
            state: ConnectionState::Connecting,
            generation: 0,
            queue: PendingQueue::new(),
            batch: None,
            free_to_write: false,
            retries: 0,
            preamble: None,
            pool,
            listener,
            inbox_tx,
            partitioner,
            state_tx,
            link: None,
            connect_task: None,
            connect_timer: None,
            write_timer: None,
            abort_timer: None,
            write_seq: 0,
            reason: None,
        }
    }

    /// Starts connecting and runs the manager task until it stops.
    pub(crate) fn spawn(
        mut self,
        inbox: mpsc::UnboundedReceiver<ManagerMsg>,
        connector: Connector,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.start(connector);
            self.run(inbox).await;
        })
    }

    fn start(&mut self, connector: Connector) {
        tracing::debug!(conn = %self.conn_id, addr = %self.config.addr, "Connecting");
        let tx = self.inbox_tx.clone();
        self.connect_task = Some(tokio::spawn(async move {
            let msg = match connector.await {
                Ok(link) => ManagerMsg::Connected(link),
                Err(e) => ManagerMsg::ConnectFailed(e),
            };
            let _ = tx.send(msg);
        }));
        let generation = self.generation;
        self.connect_timer = Some(self.arm_timer(
            self.config.connect_timeout(),
            ManagerMsg::ConnectTimeout { generation },
        ));
    }

    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<ManagerMsg>) {
        while let Some(msg) = inbox.recv().await {
            tracing::trace!(conn = %self.conn_id, state = %self.state, "Manager received {:?}", msg);
            self.handle(msg);
            if self.state.is_terminal() {
                break;
            }
        }

        // Anything still queued behind the final transition is failed, not lost.
        inbox.close();
        let reason = self.closing_reason();
        while let Ok(msg) = inbox.try_recv() {
            match msg {
                ManagerMsg::Submit(requests) => {
                    for request in requests {
                        request.fail(reason.clone());
                    }
                }
                ManagerMsg::WriteAck { buf } | ManagerMsg::WriteFailed { buf, .. } => {
                    self.pool.release(buf)
                }
                _ => {}
            }
        }
        tracing::debug!(conn = %self.conn_id, "Manager stopped");
    }

    fn handle(&mut self, msg: ManagerMsg) {
        match msg {
            ManagerMsg::Submit(requests) => self.on_submit(requests),
            ManagerMsg::Connected(link) => self.on_connected(link),
            ManagerMsg::ConnectFailed(error) => {
                if self.state == ConnectionState::Connecting {
                    tracing::warn!(conn = %self.conn_id, addr = %self.config.addr, "Connect failed: {}", error);
                    self.fail_connect(ClientError::io(ClientError::ConnectFailed, error));
                }
            }
            ManagerMsg::ConnectTimeout { generation } => {
                if self.state == ConnectionState::Connecting && generation == self.generation {
                    let timeout = self.config.connect_timeout();
                    tracing::warn!(conn = %self.conn_id, addr = %self.config.addr, "Connect timed out after {:?}", timeout);
                    self.fail_connect(ClientError::ConnectTimeout(timeout));
                }
            }
            ManagerMsg::WriteAck { buf } => self.on_write_ack(buf),
            ManagerMsg::WriteFailed {
                buf,
                written,
                error,
            } => self.on_write_failed(buf, written, error),
            ManagerMsg::WriteTimeout { seq } => self.on_write_timeout(seq),
            ManagerMsg::Terminated(error) => self.on_terminated(error),
            ManagerMsg::Shutdown => self.on_shutdown_request(),
            ManagerMsg::ShutdownAck => {
                if self.state == ConnectionState::AwaitingShutdown {
                    self.stop();
                }
            }
            ManagerMsg::AbortAck => {
                if self.state == ConnectionState::AwaitingAbort {
                    self.on_abort_ack();
                }
            }
            ManagerMsg::AbortTimeout { generation } => {
                if self.state == ConnectionState::Aborting && generation == self.generation {
                    let timeout = self.config.abort_timeout();
                    tracing::warn!(conn = %self.conn_id, "Abort did not complete within {:?}, tearing down", timeout);
                    // Replies still owed on the wire fail with the watchdog, not the earlier fault.
                    self.reason = Some(ClientError::AbortTimeout(timeout));
                    self.stop();
                }
            }
        }
    }

    fn on_submit(&mut self, requests: Vec<Request>) {
        match self.state {
            ConnectionState::Connecting => self.queue.extend(requests),
            ConnectionState::Connected => {
                self.queue.extend(requests);
                if self.free_to_write {
                    self.write_cycle();
                }
            }
            _ => {
                let reason = self.closing_reason();
                tracing::debug!(
                    conn = %self.conn_id,
                    state = %self.state,
                    "Rejecting {} requests",
                    requests.len()
                );
                for request in requests {
                    request.fail(reason.clone());
                }
            }
        }
    }

    fn on_connected(&mut self, link: Link) {
        if self.state != ConnectionState::Connecting {
            tracing::debug!(conn = %self.conn_id, "Dropping late connection to {}", link.peer());
            return;
        }
        cancel(&mut self.connect_timer);
        self.connect_task = None;

        let Link {
            reader,
            writer,
            abort,
            peer,
        } = link;
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(run_writer(writer, writer_rx, self.inbox_tx.clone()));
        let reader_task = tokio::spawn(run_reader(
            reader,
            self.config.read_buffer_size,
            self.partitioner.clone(),
            self.inbox_tx.clone(),
        ));
        self.link = Some(ActiveLink {
            writer: writer_tx,
            reader_task,
            writer_task,
            abort,
        });

        self.transition(ConnectionState::Connected);
        tracing::info!(conn = %self.conn_id, peer = %peer, "Connected");
        self.listener.on_event(ConnectionEvent::Connected);

        if let Some((preamble, replies)) = build_preamble(&self.config) {
            // Skip must reach the partitioner before any preamble reply can.
            let _ = self
                .partitioner
                .send(PartitionerMsg::Control(Control::Skip(replies)));
            self.preamble = Some(preamble);
        }

        self.free_to_write = true;
        self.write_cycle();
    }

    fn fail_connect(&mut self, reason: ClientError) {
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        self.fail_everything(reason);
        self.stop();
    }

    /// Encodes the next batch from the head of the queue and hands it to the writer.
    fn write_cycle(&mut self) {
        if self.state != ConnectionState::Connected || !self.free_to_write {
            return;
        }
        if let Some(batch) = self.batch.take() {
            self.queue.requeue_front(batch.requests);
        }
        if self.queue.is_empty() && self.preamble.is_none() {
            return;
        }

        let cap = self.config.write_batch_cap;
        let mut total = self.preamble.as_ref().map_or(0, Bytes::len);
        let mut requests = Vec::new();
        while let Some(front) = self.queue.front() {
            let len = front.encoded_len();
            // An oversized request still goes out, alone.
            if total > 0 && total + len > cap {
                break;
            }
            total += len;
            if let Some(request) = self.queue.pop_front() {
                requests.push(request);
            }
        }

        let mut buf = self.pool.acquire(total);
        if let Some(preamble) = &self.preamble {
            buf.extend_from_slice(preamble);
        }
        for request in &requests {
            request.encode_into(&mut buf);
        }
        tracing::debug!(
            conn = %self.conn_id,
            requests = requests.len(),
            bytes = buf.len(),
            queued = self.queue.len(),
            "Writing batch"
        );

        self.batch = Some(Batch { requests });
        self.issue_write(buf, 0);
    }

    fn issue_write(&mut self, buf: BytesMut, offset: usize) {
        self.free_to_write = false;
        self.write_seq += 1;
        if let Some(timeout) = self.config.write_timeout() {
            cancel(&mut self.write_timer);
            let seq = self.write_seq;
            self.write_timer = Some(self.arm_timer(timeout, ManagerMsg::WriteTimeout { seq }));
        }

        let Some(link) = &self.link else {
            return;
        };
        if link.writer.send(WriterCmd::Write { buf, offset }).is_err() {
            // The reader reports the termination that took the writer down.
            tracing::warn!(conn = %self.conn_id, "Writer task is gone");
        }
    }

    fn on_write_ack(&mut self, buf: BytesMut) {
        self.pool.release(buf);
        if self.state != ConnectionState::Connected {
            return;
        }
        cancel(&mut self.write_timer);
        self.retries = 0;
        self.preamble = None;
        if let Some(batch) = self.batch.take() {
            tracing::trace!(conn = %self.conn_id, requests = batch.requests.len(), "Batch acknowledged");
            for request in batch.requests {
                if !request.expects_reply() {
                    request.resolve(Ok(RespValue::Null));
                }
            }
        }
        self.free_to_write = true;
        if !self.queue.is_empty() {
            self.write_cycle();
        }
    }

    fn on_write_failed(&mut self, buf: BytesMut, written: usize, error: io::Error) {
        if self.state != ConnectionState::Connected {
            self.pool.release(buf);
            return;
        }
        cancel(&mut self.write_timer);

        if self.retries >= self.config.write_retry_limit {
            let attempts = self.retries + 1;
            tracing::warn!(conn = %self.conn_id, attempts, "Write failed, retries exhausted: {}", error);
            self.pool.release(buf);
            self.fail_everything(ClientError::WriteExhausted {
                attempts,
                source: Arc::new(error),
            });
            self.begin_abort();
            return;
        }

        self.retries += 1;
        tracing::warn!(
            conn = %self.conn_id,
            attempt = self.retries,
            limit = self.config.write_retry_limit,
            written,
            "Write failed, retrying: {}",
            error
        );
        if written > 0 {
            // Bytes already on the wire must not be sent twice.
            self.issue_write(buf, written);
        } else {
            self.pool.release(buf);
            self.free_to_write = true;
            self.write_cycle();
        }
    }

    fn on_write_timeout(&mut self, seq: u64) {
        if self.state != ConnectionState::Connected || seq != self.write_seq || self.free_to_write {
            return;
        }
        let Some(timeout) = self.config.write_timeout() else {
            return;
        };
        tracing::warn!(conn = %self.conn_id, "Write not acknowledged within {:?}", timeout);
        self.write_timer = None;
        self.fail_everything(ClientError::WriteTimeout(timeout));
        self.begin_abort();
    }

    fn on_terminated(&mut self, error: Option<io::Error>) {
        match self.state {
            ConnectionState::Aborting => {
                tracing::debug!(conn = %self.conn_id, "Connection terminated after abort");
                self.stop();
            }
            ConnectionState::Connected | ConnectionState::AwaitingAbort => {
                let detail = match &error {
                    Some(e) => e.to_string(),
                    None => "closed by peer".to_string(),
                };
                tracing::info!(conn = %self.conn_id, "Connection terminated: {}", detail);
                self.fail_everything(ClientError::ConnectionTerminated(detail));
                self.begin_shutdown();
            }
            ConnectionState::Connecting
            | ConnectionState::AwaitingShutdown
            | ConnectionState::Stopped => {}
        }
    }

    fn on_shutdown_request(&mut self) {
        match self.state {
            ConnectionState::Connecting => {
                if let Some(task) = self.connect_task.take() {
                    task.abort();
                }
                cancel(&mut self.connect_timer);
            }
            ConnectionState::Connected => {
                if let Some(link) = &self.link {
                    let _ = link.writer.send(WriterCmd::Close);
                }
            }
            _ => return,
        }
        tracing::debug!(conn = %self.conn_id, "Shutdown requested");
        self.fail_everything(ClientError::ConnectionClosed);
        self.begin_shutdown();
    }

    fn on_abort_ack(&mut self) {
        self.transition(ConnectionState::Aborting);
        if let Some(link) = &self.link {
            if let Err(e) = link.abort.abort() {
                tracing::warn!(conn = %self.conn_id, "Transport abort failed: {}", e);
            }
        }
        let generation = self.generation;
        self.abort_timer = Some(self.arm_timer(
            self.config.abort_timeout(),
            ManagerMsg::AbortTimeout { generation },
        ));
    }

    fn begin_shutdown(&mut self) {
        self.transition(ConnectionState::AwaitingShutdown);
        let ack = Ack::new(AckKind::Shutdown, self.inbox_tx.clone());
        self.listener.on_event(ConnectionEvent::Shutdown(ack));
    }

    fn begin_abort(&mut self) {
        self.transition(ConnectionState::AwaitingAbort);
        let ack = Ack::new(AckKind::Abort, self.inbox_tx.clone());
        self.listener.on_event(ConnectionEvent::Abort(ack));
    }

    fn stop(&mut self) {
        self.transition(ConnectionState::Stopped);
        cancel(&mut self.connect_timer);
        cancel(&mut self.write_timer);
        cancel(&mut self.abort_timer);
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        if let Some(link) = self.link.take() {
            link.teardown();
        }

        let reason = self.closing_reason();
        self.fail_everything(reason.clone());
        let _ = self.partitioner.send(PartitionerMsg::Closed(reason));
        tracing::info!(conn = %self.conn_id, "Connection stopped");
        self.listener.on_event(ConnectionEvent::Stopped);
    }

    /// Fails the in-flight batch and the whole queue, reporting how many were removed.
    fn fail_everything(&mut self, reason: ClientError) {
        let mut removed = 0;
        if let Some(batch) = self.batch.take() {
            removed += batch.requests.len();
            for request in batch.requests {
                request.fail(reason.clone());
            }
        }
        removed += self.queue.fail_all(&reason);
        self.free_to_write = false;
        if self.reason.is_none() {
            self.reason = Some(reason);
        }
        if removed > 0 {
            tracing::debug!(conn = %self.conn_id, removed, "Failed pending requests");
            self.listener.on_event(ConnectionEvent::Removed(removed));
        }
    }

    fn closing_reason(&self) -> ClientError {
        self.reason.clone().unwrap_or(ClientError::ConnectionClosed)
    }

    fn transition(&mut self, next: ConnectionState) {
        tracing::debug!(conn = %self.conn_id, from = %self.state, to = %next, "State transition");
        self.state = next;
        self.generation += 1;
        self.state_tx.send_replace(next);
    }

    fn arm_timer(&self, after: Duration, msg: ManagerMsg) -> JoinHandle<()> {
        let tx = self.inbox_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(msg);
        })
    }
}

fn cancel(timer: &mut Option<JoinHandle<()>>) {
    if let Some(handle) = timer.take() {
        handle.abort();
    }
}

/// Commands sent ahead of the first batch, and how many replies they produce.
fn build_preamble(config: &ConnectionConfig) -> Option<(Bytes, usize)> {
    let mut commands = Vec::new();
    if let Some(password) = &config.password {
        let mut auth = Command::new("AUTH");
        if let Some(username) = &config.username {
            auth = auth.arg(username);
        }
        commands.push(auth.arg(password));
    }
    if config.database != 0 {
        commands.push(Command::new("SELECT").arg(config.database.to_string()));
    }
    if let Some(name) = &config.client_name {
        commands.push(Command::new("CLIENT").arg("SETNAME").arg(name));
    }
    if commands.is_empty() {
        return None;
    }

    let len = commands.iter().map(Command::encoded_len).sum();
    let mut buf = BytesMut::with_capacity(len);
    for command in &commands {
        respconn_protocol::encode_command(command.args(), &mut buf);
    }
    Some((buf.freeze(), commands.len()))
}

async fn run_writer(
    mut writer: Box<dyn AsyncWrite + Send + Unpin>,
    mut commands: mpsc::UnboundedReceiver<WriterCmd>,
    manager: mpsc::UnboundedSender<ManagerMsg>,
) {
    while let Some(cmd) = commands.recv().await {
        match cmd {
            WriterCmd::Write { buf, offset } => {
                let mut written = offset;
                let mut failure = None;
                while written < buf.len() {
                    match writer.write(&buf[written..]).await {
                        Ok(0) => {
                            failure = Some(io::Error::from(io::ErrorKind::WriteZero));
                            break;
                        }
                        Ok(n) => written += n,
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }
                if failure.is_none() {
                    failure = writer.flush().await.err();
                }

                let msg = match failure {
                    None => ManagerMsg::WriteAck { buf },
                    Some(error) => ManagerMsg::WriteFailed {
                        buf,
                        written,
                        error,
                    },
                };
                if manager.send(msg).is_err() {
                    break;
                }
            }
            WriterCmd::Close => {
                if let Err(e) = writer.shutdown().await {
                    tracing::debug!("Write side shutdown failed: {}", e);
                }
                break;
            }
        }
    }
}

async fn run_reader(
    mut reader: Box<dyn AsyncRead + Send + Unpin>,
    buffer_size: usize,
    partitioner: mpsc::UnboundedSender<PartitionerMsg>,
    manager: mpsc::UnboundedSender<ManagerMsg>,
) {
    let mut buf = BytesMut::with_capacity(buffer_size);
    let error = loop {
        buf.reserve(buffer_size);
        match reader.read_buf(&mut buf).await {
            Ok(0) => break None,
            Ok(n) => {
                tracing::trace!("Read {} bytes from socket", n);
                let chunk = buf.split().freeze();
                if partitioner.send(PartitionerMsg::Data(chunk)).is_err() {
                    break None;
                }
            }
            Err(e) => break Some(e),
        }
    };

    let detail = match &error {
        Some(e) => e.to_string(),
        None => "closed by peer".to_string(),
    };
    let _ = partitioner.send(PartitionerMsg::Closed(ClientError::ConnectionTerminated(detail)));
    let _ = manager.send(ManagerMsg::Terminated(error));
}
