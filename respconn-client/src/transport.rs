//! Byte transport under a connection.
//!
//! The manager never touches the stream directly: it is split into a read half
//! owned by the reader task and a write half owned by the writer task. The
//! manager keeps only an [`AbortHandle`] for hard resets.

use crate::config::SocketOptions;
use socket2::{SockRef, Socket};
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::{lookup_host, TcpSocket, TcpStream};

/// A bidirectional byte stream a connection can run over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Handle used to hard-reset the stream from outside its owning tasks.
    fn abort_handle(&self) -> AbortHandle;

    /// Peer description for logs.
    fn peer(&self) -> String {
        "unknown".to_string()
    }
}

impl Transport for TcpStream {
    fn abort_handle(&self) -> AbortHandle {
        match SockRef::from(self).try_clone() {
            Ok(socket) => AbortHandle {
                socket: Some(socket),
            },
            Err(e) => {
                tracing::warn!("Could not duplicate socket for abort: {}", e);
                AbortHandle::none()
            }
        }
    }

    fn peer(&self) -> String {
        self.peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    }
}

impl Transport for DuplexStream {
    fn abort_handle(&self) -> AbortHandle {
        AbortHandle::none()
    }

    fn peer(&self) -> String {
        "in-memory".to_string()
    }
}

/// Hard-reset handle for a transport.
#[derive(Debug)]
pub struct AbortHandle {
    socket: Option<Socket>,
}

impl AbortHandle {
    /// A handle that cannot abort anything; callers fall back to the abort watchdog.
    pub fn none() -> Self {
        Self { socket: None }
    }

    /// Resets the connection: zero linger, then shut down both directions.
    ///
    /// The reader task observes the shutdown and reports termination.
    pub fn abort(&self) -> io::Result<()> {
        let Some(socket) = &self.socket else {
            return Ok(());
        };
        socket.set_linger(Some(Duration::ZERO))?;
        match socket.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }

    pub fn is_available(&self) -> bool {
        self.socket.is_some()
    }
}

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// An established transport, split for the reader and writer tasks.
pub struct Link {
    pub(crate) reader: BoxReader,
    pub(crate) writer: BoxWriter,
    pub(crate) abort: AbortHandle,
    pub(crate) peer: String,
}

impl Link {
    pub fn new<T: Transport>(stream: T) -> Self {
        let abort = stream.abort_handle();
        let peer = stream.peer();
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            abort,
            peer,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("peer", &self.peer)
            .field("abortable", &self.abort.is_available())
            .finish()
    }
}

/// Opens a TCP connection with the configured socket options.
///
/// Tries every resolved address in order and returns the last error if none connect.
/// The connect timeout is enforced by the caller.
pub async fn connect_tcp(addr: &str, options: &SocketOptions) -> io::Result<TcpStream> {
    let mut last_error = None;

    for resolved in lookup_host(addr).await? {
        tracing::debug!("Connecting to {} ({})", addr, resolved);
        match connect_one(resolved, options).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                tracing::debug!("Error connecting to {}: {}", resolved, e);
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no addresses resolved for {}", addr),
        )
    }))
}

async fn connect_one(addr: SocketAddr, options: &SocketOptions) -> io::Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };

    {
        let sock = SockRef::from(&socket);
        sock.set_keepalive(options.keepalive)?;
        sock.set_reuse_address(options.reuse_address)?;
        sock.set_send_buffer_size(options.send_buffer_size)?;
        sock.set_recv_buffer_size(options.recv_buffer_size)?;
    }

    let stream = socket.connect(addr).await?;
    stream.set_nodelay(options.nodelay)?;
    Ok(stream)
}
