//! Client-side channel: one connection multiplexing many in-flight calls.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use mio::net::TcpStream;
use tracing::{debug, info};

use crate::net::{socket, Connection};
use crate::reactor::{ConnId, Executor, ReactorOps, SpawnError, Task};
use crate::rpc::session::{CallError, CallResult, ConnEntry, PendingCall};
use crate::rpc::wire::{encode_frame, Decode, Encode, Header, DEFAULT_MAX_PAYLOAD_LEN};

/// Per-channel connection tuning.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub socket_buffer_size: usize,
    pub max_payload_len: u32,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            socket_buffer_size: socket::SOCKET_BUFFER_SIZE,
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
        }
    }
}

/// A connected RPC channel. Cheap to share across threads; calls may be
/// issued from any thread and are marshalled onto the connection's owning
/// reactor.
pub struct ClientChannel {
    exec: Arc<dyn Executor>,
    conn_id: ConnId,
    next_request_id: AtomicI64,
    stray_responses: Arc<AtomicU64>,
}

impl ClientChannel {
    /// Connect to `addr` and adopt the connection onto `exec`'s reactor.
    pub fn connect(
        addr: SocketAddr,
        options: &ClientOptions,
        exec: Arc<dyn Executor>,
    ) -> io::Result<Self> {
        let stream = socket::connect(addr, options.socket_buffer_size)?;
        let stream = TcpStream::from_std(stream);
        let conn = Connection::new(stream)?;
        let stray_responses = Arc::new(AtomicU64::new(0));
        let entry = ConnEntry::client(conn, Arc::clone(&stray_responses), options.max_payload_len);

        let (done_tx, done_rx) = mpsc::channel();
        let task: Task = Box::new(move |ops: &mut dyn ReactorOps| {
            let _ = done_tx.send(ops.install(entry));
        });
        exec.spawn(task)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        let conn_id = done_rx
            .recv()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "reactor dropped install"))??;

        info!(peer = %addr, conn_id, "channel connected");
        Ok(Self {
            exec,
            conn_id,
            next_request_id: AtomicI64::new(1),
            stray_responses,
        })
    }

    /// Issue a call; `done` fires exactly once with the raw response payload
    /// or the reason the call failed. Returns the assigned request id.
    pub fn call_with(
        &self,
        service: &str,
        method: &str,
        request: &impl Encode,
        done: impl FnOnce(CallResult) + Send + 'static,
    ) -> Result<i64, CallError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let header = Header::request(request_id, service, method);
        let payload = request.to_bytes();
        let conn_id = self.conn_id;

        let task: Task = Box::new(move |ops: &mut dyn ReactorOps| {
            match ops.entry_mut(conn_id) {
                Some(entry) if !entry.conn.closed() && !entry.closing => {
                    encode_frame(&mut entry.conn.tx, &header, &payload);
                    entry.pending.insert(request_id, PendingCall::new(done));
                    ops.kick(conn_id);
                }
                _ => {
                    debug!(conn_id, request_id, "call on closed channel");
                    done(Err(CallError::ConnectionClosed));
                }
            }
        });
        self.exec.spawn(task).map_err(|e| match e {
            SpawnError::QueueFull => CallError::QueueFull,
            SpawnError::Stopped => CallError::ConnectionClosed,
        })?;
        Ok(request_id)
    }

    /// Blocking convenience wrapper: send, wait, decode. The call has no
    /// deadline; it completes when the response arrives or the connection
    /// dies.
    pub fn call<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        request: &Req,
    ) -> Result<Resp, CallError>
    where
        Req: Encode,
        Resp: Decode,
    {
        let (tx, rx) = mpsc::channel();
        self.call_with(service, method, request, move |result| {
            let _ = tx.send(result);
        })?;
        match rx.recv() {
            Ok(result) => decode_response(result),
            Err(_) => Err(CallError::ConnectionClosed),
        }
    }

    /// Blocking wrapper with an opt-in deadline. On timeout the call is
    /// abandoned by this caller; its completion still runs (into a dropped
    /// channel) when the response or teardown eventually arrives.
    pub fn call_timeout<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        request: &Req,
        timeout: Duration,
    ) -> Result<Resp, CallError>
    where
        Req: Encode,
        Resp: Decode,
    {
        let (tx, rx) = mpsc::channel();
        self.call_with(service, method, request, move |result| {
            let _ = tx.send(result);
        })?;
        match rx.recv_timeout(timeout) {
            Ok(result) => decode_response(result),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(CallError::TimedOut),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(CallError::ConnectionClosed),
        }
    }

    /// Responses that arrived for no known request id (protocol errors on
    /// the peer's side, or responses to calls the caller abandoned).
    pub fn stray_responses(&self) -> u64 {
        self.stray_responses.load(Ordering::Relaxed)
    }

    /// Close the channel: in-flight calls are failed, both connection loops
    /// terminate.
    pub fn close(&self) {
        let conn_id = self.conn_id;
        let task: Task = Box::new(move |ops: &mut dyn ReactorOps| {
            ops.close(conn_id);
        });
        let _ = self.exec.spawn(task);
    }
}

fn decode_response<Resp: Decode>(result: CallResult) -> Result<Resp, CallError> {
    let payload = result?;
    Resp::decode(&payload).map_err(CallError::Decode)
}
