//! Connection state: one socket, two buffers, a closed flag.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};

use mio::net::TcpStream;
use tracing::debug;

use crate::buffer::{InputBuffer, OutputBuffer};

/// Result of one receive attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillStatus {
    /// Kernel buffer drained; wait for the next readiness/completion.
    Suspend,
    /// Peer EOF or unrecoverable error; the connection is now closed.
    Closed,
}

/// Result of one flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    /// Output buffer fully drained.
    Flushed,
    /// Kernel would block with bytes still pending; wait for writability.
    Suspend,
    /// Unrecoverable error; the connection is now closed.
    Closed,
}

/// One TCP connection and its buffered byte streams.
///
/// Exactly one `Connection` owns a socket for its lifetime; the reactor that
/// drives it is the only thread that ever touches it, so the buffers need no
/// locking.
pub struct Connection {
    stream: TcpStream,
    pub rx: InputBuffer,
    pub tx: OutputBuffer,
    local: SocketAddr,
    peer: SocketAddr,
    closed: bool,
}

impl Connection {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let local = stream.local_addr()?;
        let peer = stream.peer_addr()?;
        Ok(Self {
            stream,
            rx: InputBuffer::new(),
            tx: OutputBuffer::new(),
            local,
            peer,
            closed: false,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn closed(&self) -> bool {
        self.closed
    }

    /// The registered socket, for readiness registration.
    pub(crate) fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Drain the kernel receive buffer into `rx`: retry on interrupt,
    /// suspend on would-block, close on EOF or any other error. All bytes
    /// actually read are appended before returning.
    pub fn fill(&mut self) -> FillStatus {
        if self.closed {
            return FillStatus::Closed;
        }
        loop {
            match self.rx.read_from(&mut self.stream) {
                Ok(0) => {
                    debug!(peer = %self.peer, "peer closed connection");
                    self.close();
                    return FillStatus::Closed;
                }
                Ok(_) => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return FillStatus::Suspend;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(peer = %self.peer, error = %e, "read failed");
                    self.close();
                    return FillStatus::Closed;
                }
            }
        }
    }

    /// Scatter-write `tx` until it drains or the kernel would block.
    pub fn flush(&mut self) -> FlushStatus {
        if self.closed {
            return FlushStatus::Closed;
        }
        while !self.tx.is_empty() {
            match self.tx.write_to(&mut self.stream) {
                Ok(0) => {
                    debug!(peer = %self.peer, "write returned zero");
                    self.close();
                    return FlushStatus::Closed;
                }
                Ok(_) => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return FlushStatus::Suspend;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(peer = %self.peer, error = %e, "write failed");
                    self.close();
                    return FlushStatus::Closed;
                }
            }
        }
        FlushStatus::Flushed
    }

    /// Shut the socket down and mark the connection closed. Idempotent;
    /// shutdown errors on an already-dead socket are ignored.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}
