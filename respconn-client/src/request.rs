//! Requests, reply futures and transactions.

use crate::error::ClientError;
use bytes::BytesMut;
use parking_lot::Mutex;
use respconn_protocol::{encode_command, Command, RespValue};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Outcome delivered to the caller of a request.
pub type RequestResult = Result<RespValue, ClientError>;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

struct RequestInner {
    id: u64,
    command: Command,
    expects_reply: bool,
    slot: Mutex<Option<oneshot::Sender<RequestResult>>>,
}

/// A command plus its single-assignment outcome slot.
///
/// Cloning shares the same request; both queues hold clones of one `Request`.
#[derive(Clone)]
pub struct Request {
    inner: Arc<RequestInner>,
}

impl Request {
    /// Creates a request whose outcome is the matched reply frame.
    pub fn new(command: Command) -> (Self, Reply) {
        Self::build(command, true)
    }

    /// Creates a request that produces no matched reply (subscriber mode).
    ///
    /// It resolves with `Null` once its write is acknowledged.
    pub fn push(command: Command) -> (Self, Reply) {
        Self::build(command, false)
    }

    fn build(command: Command, expects_reply: bool) -> (Self, Reply) {
        let (tx, rx) = oneshot::channel();
        let request = Self {
            inner: Arc::new(RequestInner {
                id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
                command,
                expects_reply,
                slot: Mutex::new(Some(tx)),
            }),
        };
        (request, Reply { rx })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn command(&self) -> &Command {
        &self.inner.command
    }

    pub fn expects_reply(&self) -> bool {
        self.inner.expects_reply
    }

    /// Exact number of bytes `encode_into` appends.
    pub fn encoded_len(&self) -> usize {
        self.inner.command.encoded_len()
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        encode_command(self.inner.command.args(), buf);
    }

    /// Resolves the outcome. Returns `false` if it was already resolved.
    pub fn resolve(&self, result: RequestResult) -> bool {
        match self.inner.slot.lock().take() {
            Some(tx) => {
                // The caller may have stopped waiting; the request still counts as resolved.
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    pub fn fail(&self, error: ClientError) -> bool {
        self.resolve(Err(error))
    }

    pub fn is_resolved(&self) -> bool {
        self.inner.slot.lock().is_none()
    }

    /// Whether two handles refer to the same request.
    pub fn same_as(&self, other: &Request) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.inner.id)
            .field("command", &self.inner.command.name())
            .field("expects_reply", &self.inner.expects_reply)
            .finish()
    }
}

/// Future resolving to a request's outcome.
///
/// If every holder of the request is dropped without resolving it, the reply
/// resolves to [`ClientError::ConnectionClosed`].
pub struct Reply {
    rx: oneshot::Receiver<RequestResult>,
}

impl Reply {
    /// Returns the outcome if it is already available.
    pub fn try_take(&mut self) -> Option<RequestResult> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(ClientError::ConnectionClosed)),
        }
    }
}

impl Future for Reply {
    type Output = RequestResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(ClientError::ConnectionClosed)))
    }
}

/// A MULTI/EXEC block.
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    commands: Vec<Command>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a command to the block.
    pub fn add(mut self, command: Command) -> Self {
        self.commands.push(command);
        self
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Expands into `MULTI`, the sub-commands, and `EXEC`, in order.
    pub fn into_requests(self) -> (Vec<Request>, TransactionReply) {
        let mut requests = Vec::with_capacity(self.commands.len() + 2);

        let (begin, begin_reply) = Request::new(Command::new("MULTI"));
        requests.push(begin);

        let mut queued = Vec::with_capacity(self.commands.len());
        for command in self.commands {
            let (request, reply) = Request::new(command);
            requests.push(request);
            queued.push(reply);
        }

        let (commit, exec) = Request::new(Command::new("EXEC"));
        requests.push(commit);

        (
            requests,
            TransactionReply {
                begin: begin_reply,
                queued,
                exec,
            },
        )
    }
}

/// Replies for a submitted transaction.
pub struct TransactionReply {
    begin: Reply,
    queued: Vec<Reply>,
    exec: Reply,
}

impl TransactionReply {
    /// Waits for the block and returns the EXEC results, one per sub-command.
    pub async fn results(self) -> Result<Vec<RespValue>, ClientError> {
        self.begin.await?;
        for reply in self.queued {
            reply.await?;
        }
        match self.exec.await? {
            RespValue::Array(items) => Ok(items),
            RespValue::Null => Err(ClientError::TransactionAborted),
            other => Err(ClientError::Server(format!(
                "unexpected EXEC reply: {:?}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_resolution_wins() {
        let (request, reply) = Request::new(Command::new("PING"));
        assert!(!request.is_resolved());
        assert!(request.resolve(Ok(RespValue::simple("PONG"))));
        assert!(request.is_resolved());
        assert!(!request.fail(ClientError::ConnectionClosed));

        assert_eq!(reply.await.unwrap(), RespValue::simple("PONG"));
    }

    #[tokio::test]
    async fn test_clone_shares_outcome() {
        let (request, reply) = Request::new(Command::new("GET").arg("k"));
        let shadow = request.clone();
        assert!(shadow.same_as(&request));
        assert!(shadow.fail(ClientError::PushMode));
        assert!(!request.resolve(Ok(RespValue::Null)));
        assert!(matches!(reply.await, Err(ClientError::PushMode)));
    }

    #[tokio::test]
    async fn test_dropped_request_closes_reply() {
        let (request, reply) = Request::new(Command::new("PING"));
        drop(request);
        assert!(matches!(reply.await, Err(ClientError::ConnectionClosed)));
    }

    #[test]
    fn test_encoding() {
        let (request, _reply) = Request::new(Command::new("GET").arg("key"));
        let mut buf = BytesMut::new();
        request.encode_into(&mut buf);
        assert_eq!(&buf[..], b"*2\r\n$3\r\nGET\r\n$3\r\nkey\r\n");
        assert_eq!(request.encoded_len(), buf.len());
    }

    #[test]
    fn test_ids_are_unique() {
        let (a, _) = Request::new(Command::new("PING"));
        let (b, _) = Request::push(Command::new("SUBSCRIBE").arg("ch"));
        assert_ne!(a.id(), b.id());
        assert!(a.expects_reply());
        assert!(!b.expects_reply());
    }

    #[test]
    fn test_try_take() {
        let (request, mut reply) = Request::new(Command::new("PING"));
        assert!(reply.try_take().is_none());
        request.resolve(Ok(RespValue::Integer(1)));
        assert_eq!(reply.try_take().unwrap().unwrap(), RespValue::Integer(1));
    }

    #[test]
    fn test_transaction_expansion() {
        let tx = Transaction::new()
            .add(Command::new("SET").arg("a").arg("1"))
            .add(Command::new("INCR").arg("a"));
        assert_eq!(tx.len(), 2);

        let (requests, _reply) = tx.into_requests();
        let names: Vec<String> = requests.iter().map(|r| r.command().name()).collect();
        assert_eq!(names, vec!["MULTI", "SET", "INCR", "EXEC"]);
    }

    #[tokio::test]
    async fn test_transaction_results() {
        let tx = Transaction::new().add(Command::new("INCR").arg("a"));
        let (requests, reply) = tx.into_requests();
        requests[0].resolve(Ok(RespValue::simple("OK")));
        requests[1].resolve(Ok(RespValue::simple("QUEUED")));
        requests[2].resolve(Ok(RespValue::Array(vec![RespValue::Integer(1)])));
        assert_eq!(reply.results().await.unwrap(), vec![RespValue::Integer(1)]);
    }

    #[tokio::test]
    async fn test_transaction_aborted() {
        let (requests, reply) = Transaction::new().add(Command::new("PING")).into_requests();
        requests[0].resolve(Ok(RespValue::simple("OK")));
        requests[1].resolve(Ok(RespValue::simple("QUEUED")));
        requests[2].resolve(Ok(RespValue::Null));
        assert!(matches!(
            reply.results().await,
            Err(ClientError::TransactionAborted)
        ));
    }
}
