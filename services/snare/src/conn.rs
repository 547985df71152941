//! Accepted connections and their metadata.
//!
//! [`Conn`] wraps an accepted TCP stream with an absolute I/O deadline and a
//! [`ConnCloser`] that can shut the socket down from another task. Shutting
//! the socket down wakes any read or write the owning handler is blocked on.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use snare_rules::Rule;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::{Instant, Sleep};

/// Identifies a flow by its client-side socket address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src: SocketAddr,
}

impl FlowKey {
    pub fn new(src: SocketAddr) -> Self {
        Self { src }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.src.fmt(f)
    }
}

/// Classification of a tracked connection, supplied by the packet engine.
#[derive(Debug, Clone)]
pub struct ConnMetadata {
    pub flow: FlowKey,
    /// The rule that matched this flow.
    pub rule: Arc<Rule>,
    /// Destination port the client originally connected to.
    pub target_port: u16,
}

/// Shuts a connection's socket down from outside the task that owns it.
#[derive(Debug, Clone)]
pub struct ConnCloser {
    socket: Arc<std::net::TcpStream>,
    closed: Arc<AtomicBool>,
}

impl ConnCloser {
    /// Shut down both directions of the socket.
    ///
    /// Returns true for the call that actually closed it.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        // NotConnected just means the peer got there first.
        let _ = self.socket.shutdown(Shutdown::Both);
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// A live connection handed to a handler.
pub struct Conn {
    stream: TcpStream,
    closer: ConnCloser,
    deadline: Option<Pin<Box<Sleep>>>,
}

impl Conn {
    /// Wrap an accepted stream.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let std_stream = stream.into_std()?;
        let shadow = std_stream.try_clone()?;
        let stream = TcpStream::from_std(std_stream)?;

        Ok(Self {
            stream,
            closer: ConnCloser {
                socket: Arc::new(shadow),
                closed: Arc::new(AtomicBool::new(false)),
            },
            deadline: None,
        })
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    /// Handle that force-closes this connection.
    pub fn closer(&self) -> ConnCloser {
        self.closer.clone()
    }

    /// Fail every read and write after `deadline` with [`io::ErrorKind::TimedOut`].
    pub fn set_deadline(&mut self, deadline: Instant) {
        if let Some(sleep) = self.deadline.as_mut() {
            sleep.as_mut().reset(deadline);
            return;
        }
        self.deadline = Some(Box::pin(tokio::time::sleep_until(deadline)));
    }

    pub fn clear_deadline(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline.as_ref().map(|sleep| sleep.deadline())
    }

    fn poll_deadline(&mut self, cx: &mut Context<'_>) -> io::Result<()> {
        if let Some(sleep) = self.deadline.as_mut() {
            if sleep.as_mut().poll(cx).is_ready() {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "connection deadline exceeded",
                ));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("peer", &self.stream.peer_addr().ok())
            .field("closed", &self.closer.is_closed())
            .finish()
    }
}

impl AsyncRead for Conn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Err(e) = self.poll_deadline(cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Conn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if let Err(e) = self.poll_deadline(cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Err(e) = self.poll_deadline(cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
