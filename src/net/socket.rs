//! Listener and stream construction with the transport's socket options.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

/// Send/receive buffer size applied to every connection socket.
pub const SOCKET_BUFFER_SIZE: usize = 512 * 1024;

const LISTEN_BACKLOG: i32 = 256;

fn domain_for(addr: &SocketAddr) -> Domain {
    match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    }
}

/// Apply the per-connection options: large kernel buffers, Nagle off,
/// linger off, close-on-exec, nonblocking.
pub fn tune_stream(socket: &Socket, buffer_size: usize) -> io::Result<()> {
    socket.set_send_buffer_size(buffer_size)?;
    socket.set_recv_buffer_size(buffer_size)?;
    socket.set_nodelay(true)?;
    socket.set_linger(None)?;
    socket.set_cloexec(true)?;
    socket.set_nonblocking(true)?;
    Ok(())
}

/// Create a blocking listener bound to `addr`. Accepted sockets are tuned
/// individually by the accept loop.
pub fn listen(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(domain_for(&addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_cloexec(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}

/// Connect to `addr` (blocking, so callers learn about refusal immediately),
/// then flip the socket to nonblocking with the transport options applied.
pub fn connect(addr: SocketAddr, buffer_size: usize) -> io::Result<std::net::TcpStream> {
    let socket = Socket::new(domain_for(&addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.connect_timeout(&addr.into(), Duration::from_secs(10))?;
    tune_stream(&socket, buffer_size)?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_binds_ephemeral_port() {
        let listener = listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn connect_applies_options() {
        let listener = listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = connect(addr, SOCKET_BUFFER_SIZE).unwrap();
        assert!(stream.nodelay().unwrap());
        let (accepted, _) = listener.accept().unwrap();
        drop(accepted);
    }
}
