//! In-memory transport with write fault injection, for tests.

use crate::transport::{AbortHandle, Transport};
use parking_lot::Mutex;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};

#[derive(Default)]
struct MockState {
    /// Bytes accepted by each successful write call.
    writes: Vec<Vec<u8>>,
    fail_next: usize,
    partial: Option<usize>,
    stall: bool,
    waker: Option<Waker>,
}

/// Client side: reads what the handle sends, records what the client writes.
pub(crate) struct MockStream {
    reader: DuplexStream,
    state: Arc<Mutex<MockState>>,
}

/// Test side of a [`MockStream`].
pub(crate) struct MockHandle {
    server: tokio::sync::Mutex<Option<DuplexStream>>,
    state: Arc<Mutex<MockState>>,
}

pub(crate) fn mock_transport() -> (MockStream, MockHandle) {
    let (reader, server) = tokio::io::duplex(256 * 1024);
    let state = Arc::new(Mutex::new(MockState::default()));
    (
        MockStream {
            reader,
            state: state.clone(),
        },
        MockHandle {
            server: tokio::sync::Mutex::new(Some(server)),
            state,
        },
    )
}

impl MockHandle {
    pub(crate) fn writes(&self) -> Vec<Vec<u8>> {
        self.state.lock().writes.clone()
    }

    /// Fails the next `n` write calls.
    pub(crate) fn fail_next(&self, n: usize) {
        self.state.lock().fail_next = n;
    }

    /// Accepts `n` bytes of the next write call, then fails the one after.
    pub(crate) fn partial_then_fail(&self, n: usize) {
        self.state.lock().partial = Some(n);
    }

    /// Blocks write calls until released.
    pub(crate) fn stall(&self, stall: bool) {
        let waker = {
            let mut state = self.state.lock();
            state.stall = stall;
            if stall {
                None
            } else {
                state.waker.take()
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Sends raw reply bytes to the client.
    pub(crate) async fn reply(&self, bytes: &[u8]) {
        let mut server = self.server.lock().await;
        let stream = server.as_mut().expect("disconnected");
        stream.write_all(bytes).await.expect("server write");
    }

    /// Closes the server side; the client reads EOF.
    pub(crate) fn disconnect(&self) {
        if let Ok(mut server) = self.server.try_lock() {
            server.take();
        }
    }

    pub(crate) async fn wait_for_writes(&self, n: usize) {
        self.wait_until(|writes| writes.len() >= n).await;
    }

    pub(crate) async fn wait_for_bytes(&self, n: usize) {
        self.wait_until(|writes| writes.iter().map(Vec::len).sum::<usize>() >= n)
            .await;
    }

    async fn wait_until(&self, done: impl Fn(&[Vec<u8>]) -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !done(self.state.lock().writes.as_slice()) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for writes"
            );
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }
}

impl Transport for MockStream {
    fn abort_handle(&self) -> AbortHandle {
        AbortHandle::none()
    }

    fn peer(&self) -> String {
        "mock".to_string()
    }
}

impl AsyncRead for MockStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for MockStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut state = self.state.lock();
        if state.stall {
            state.waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "injected write failure",
            )));
        }
        if let Some(n) = state.partial.take() {
            let n = n.min(buf.len());
            state.writes.push(buf[..n].to_vec());
            state.fail_next += 1;
            return Poll::Ready(Ok(n));
        }
        state.writes.push(buf.to_vec());
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
