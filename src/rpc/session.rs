//! Per-connection framing state machines.
//!
//! Each connection runs two cooperating loops. The receive loop walks the
//! length-prefixed frame grammar (header length, header, payload length,
//! payload), suspending whenever the input buffer cannot satisfy the next
//! step and resuming when the reactor delivers more bytes. The send loop
//! drains the output buffer and parks when there is nothing to flush or the
//! kernel pushes back.
//!
//! The state machines operate purely on buffers, so the same code drives the
//! readiness and completion backends and is testable without sockets. All
//! access is confined to the connection's owning reactor thread.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::buffer::{InputBuffer, OutputBuffer};
use crate::net::{Connection, FlushStatus};
use crate::rpc::service::ServiceRegistry;
use crate::rpc::wire::{
    encode_frame, DecodeError, FrameError, Header, MessageType, MAX_HEADER_LEN,
};

/// Why a call completed unsuccessfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// The connection closed (or was already closed) before a response
    /// arrived; the call was never silently dropped.
    ConnectionClosed,
    /// The reactor's task queue rejected the submission.
    QueueFull,
    /// The response payload did not decode into the requested type.
    Decode(DecodeError),
    /// The caller's opt-in deadline elapsed while the call was in flight.
    TimedOut,
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::ConnectionClosed => write!(f, "connection closed"),
            CallError::QueueFull => write!(f, "reactor task queue is full"),
            CallError::Decode(e) => write!(f, "response decode failed: {e}"),
            CallError::TimedOut => write!(f, "call timed out"),
        }
    }
}

impl std::error::Error for CallError {}

/// Raw completion result: the undecoded response payload.
pub type CallResult = Result<Vec<u8>, CallError>;

/// One in-flight call: where its response payload should land.
pub struct PendingCall {
    complete: Box<dyn FnOnce(CallResult) + Send>,
}

impl PendingCall {
    pub fn new(complete: impl FnOnce(CallResult) + Send + 'static) -> Self {
        Self {
            complete: Box::new(complete),
        }
    }
}

/// Request-id keyed table of in-flight calls. Confined to the owning
/// reactor thread; each entry is removed exactly once, either by its
/// response or by connection teardown.
pub struct PendingTable {
    calls: HashMap<i64, PendingCall>,
    stray_responses: Arc<AtomicU64>,
}

impl PendingTable {
    pub fn new(stray_responses: Arc<AtomicU64>) -> Self {
        Self {
            calls: HashMap::new(),
            stray_responses,
        }
    }

    pub fn insert(&mut self, request_id: i64, call: PendingCall) {
        let prev = self.calls.insert(request_id, call);
        debug_assert!(prev.is_none(), "request id reused while in flight");
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Complete the call for `request_id` exactly once. An unknown id is a
    /// routing error: counted, reported, and otherwise ignored so the
    /// stream (which stays aligned) keeps flowing.
    fn complete(&mut self, request_id: i64, result: CallResult) {
        match self.calls.remove(&request_id) {
            Some(call) => (call.complete)(result),
            None => {
                self.stray_responses.fetch_add(1, Ordering::Relaxed);
                error!(request_id, "response for unknown request id");
            }
        }
    }

    /// Fail every remaining call with `ConnectionClosed`.
    pub fn fail_all(&mut self) {
        let n = self.calls.len();
        if n > 0 {
            debug!(pending = n, "failing in-flight calls on close");
        }
        for (_, call) in self.calls.drain() {
            (call.complete)(Err(CallError::ConnectionClosed));
        }
    }
}

/// Which side of the protocol this connection's receive loop plays.
pub enum Role {
    Client,
    Server { registry: Arc<ServiceRegistry> },
}

enum RecvState {
    HeaderLen,
    Header { header_len: u32 },
    PayloadLen { header: Header },
    Payload { header: Header, payload_len: u32 },
}

/// Outcome of resuming the receive loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvOutcome {
    /// Suspended: the next framing step needs more buffered bytes.
    NeedMore,
    /// The loop terminated: connection closed or stream corrupt.
    Closed,
}

/// The receive-side continuation: an owned state machine the reactor takes
/// out of its slot, resumes, and parks again.
pub struct RecvLoop {
    state: RecvState,
    role: Role,
    max_payload_len: u32,
}

impl RecvLoop {
    pub fn new(role: Role, max_payload_len: u32) -> Self {
        Self {
            state: RecvState::HeaderLen,
            role,
            max_payload_len,
        }
    }

    /// Consume as many complete framing steps as the buffered bytes allow.
    ///
    /// Never delivers a partial frame: if the connection closed before the
    /// current step's threshold is met, the loop terminates.
    pub fn resume(
        &mut self,
        rx: &mut InputBuffer,
        tx: &mut OutputBuffer,
        closed: bool,
        pending: &mut PendingTable,
    ) -> RecvOutcome {
        loop {
            match &self.state {
                RecvState::HeaderLen => {
                    let header_len = match rx.fetch_u32() {
                        Some(n) => n,
                        None => return self.suspend(closed),
                    };
                    if header_len == 0 || header_len > MAX_HEADER_LEN {
                        error!(header_len, "corrupt header length prefix");
                        return RecvOutcome::Closed;
                    }
                    self.state = RecvState::Header { header_len };
                }
                RecvState::Header { header_len } => {
                    let header_len = *header_len;
                    let mut raw = Vec::with_capacity(header_len as usize);
                    if !rx.take(header_len as usize, &mut raw) {
                        return self.suspend(closed);
                    }
                    let header = match Header::decode(&raw) {
                        Ok(h) => h,
                        Err(e) => {
                            error!(error = %e, "dropping connection on corrupt header");
                            return RecvOutcome::Closed;
                        }
                    };
                    if let Err(e) = self.check_direction(&header) {
                        error!(error = %e, "dropping connection on misdirected frame");
                        return RecvOutcome::Closed;
                    }
                    self.state = RecvState::PayloadLen { header };
                }
                RecvState::PayloadLen { .. } => {
                    let payload_len = match rx.fetch_u32() {
                        Some(n) => n,
                        None => return self.suspend(closed),
                    };
                    if payload_len > self.max_payload_len {
                        error!(payload_len, "corrupt payload length prefix");
                        return RecvOutcome::Closed;
                    }
                    let header = match std::mem::replace(&mut self.state, RecvState::HeaderLen)
                    {
                        RecvState::PayloadLen { header } => header,
                        _ => unreachable!(),
                    };
                    self.state = RecvState::Payload {
                        header,
                        payload_len,
                    };
                }
                RecvState::Payload { payload_len, .. } => {
                    let payload_len = *payload_len as usize;
                    if rx.available() < payload_len {
                        return self.suspend(closed);
                    }
                    let mut payload = Vec::with_capacity(payload_len);
                    let ok = rx.take(payload_len, &mut payload);
                    debug_assert!(ok);
                    let header = match std::mem::replace(&mut self.state, RecvState::HeaderLen)
                    {
                        RecvState::Payload { header, .. } => header,
                        _ => unreachable!(),
                    };
                    if let Err(e) = self.dispatch(header, payload, tx, pending) {
                        error!(error = %e, "dropping connection on framing error");
                        return RecvOutcome::Closed;
                    }
                }
            }
        }
    }

    fn suspend(&self, closed: bool) -> RecvOutcome {
        if closed {
            RecvOutcome::Closed
        } else {
            RecvOutcome::NeedMore
        }
    }

    fn check_direction(&self, header: &Header) -> Result<(), FrameError> {
        let expected = match self.role {
            Role::Client => MessageType::Response,
            Role::Server { .. } => MessageType::Request,
        };
        if header.message_type != expected {
            return Err(FrameError::BadMessageType(header.message_type as u8));
        }
        Ok(())
    }

    fn dispatch(
        &mut self,
        header: Header,
        payload: Vec<u8>,
        tx: &mut OutputBuffer,
        pending: &mut PendingTable,
    ) -> Result<(), FrameError> {
        match &self.role {
            Role::Client => {
                pending.complete(header.request_id, Ok(payload));
                Ok(())
            }
            Role::Server { registry } => {
                let method = match registry.resolve(&header.service, &header.method) {
                    Some(m) => m,
                    None => {
                        // Routing miss: the frame was fully consumed, so the
                        // stream stays aligned. Drop it and keep going.
                        warn!(
                            service = %header.service,
                            method = %header.method,
                            request_id = header.request_id,
                            "no such service/method, dropping request"
                        );
                        return Ok(());
                    }
                };
                let response = method
                    .invoke(&payload)
                    .map_err(|e| match e {
                        crate::rpc::service::InvokeError::Decode(d) => {
                            FrameError::PayloadDecode(d)
                        }
                    })?;
                encode_frame(tx, &Header::response(header.request_id), &response);
                Ok(())
            }
        }
    }
}

/// Send-side continuation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    /// Nothing to flush; parked until the receive loop or a submitted call
    /// stages output.
    Idle,
    /// Bytes pending: write interest is armed (readiness backend) or a
    /// write operation is in flight (completion backend).
    Flushing,
}

/// Outcome of resuming the send loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Idle,
    Blocked,
    Closed,
}

/// The send-side continuation.
pub struct SendLoop {
    pub(crate) state: SendState,
}

impl SendLoop {
    pub fn new() -> Self {
        Self {
            state: SendState::Idle,
        }
    }

    /// Flush until drained or the kernel pushes back (readiness backend).
    pub fn resume(&mut self, conn: &mut Connection) -> SendOutcome {
        if conn.closed() {
            return SendOutcome::Closed;
        }
        if conn.tx.is_empty() {
            self.state = SendState::Idle;
            return SendOutcome::Idle;
        }
        match conn.flush() {
            FlushStatus::Flushed => {
                self.state = SendState::Idle;
                SendOutcome::Idle
            }
            FlushStatus::Suspend => {
                self.state = SendState::Flushing;
                SendOutcome::Blocked
            }
            FlushStatus::Closed => SendOutcome::Closed,
        }
    }
}

impl Default for SendLoop {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a reactor owns for one connection: the connection itself, the
/// two parked continuations, and the in-flight call table.
pub struct ConnEntry {
    pub conn: Connection,
    pub recv: Option<RecvLoop>,
    pub send: Option<SendLoop>,
    pub pending: PendingTable,
    /// Teardown requested but completions still outstanding (completion
    /// backend); the entry is destroyed once `inflight` drains to zero.
    pub closing: bool,
    /// Submitted-but-uncompleted kernel operations referencing this entry.
    pub inflight: u32,
}

impl ConnEntry {
    pub fn client(conn: Connection, stray: Arc<AtomicU64>, max_payload_len: u32) -> Self {
        Self {
            conn,
            recv: Some(RecvLoop::new(Role::Client, max_payload_len)),
            send: Some(SendLoop::new()),
            pending: PendingTable::new(stray),
            closing: false,
            inflight: 0,
        }
    }

    pub fn server(
        conn: Connection,
        registry: Arc<ServiceRegistry>,
        max_payload_len: u32,
    ) -> Self {
        Self {
            conn,
            recv: Some(RecvLoop::new(Role::Server { registry }, max_payload_len)),
            send: Some(SendLoop::new()),
            pending: PendingTable::new(Arc::new(AtomicU64::new(0))),
            closing: false,
            inflight: 0,
        }
    }

    /// Take, resume, and re-park the receive continuation. The slot stays
    /// empty once the loop terminates.
    pub fn drive_recv(&mut self) -> RecvOutcome {
        let mut recv = match self.recv.take() {
            Some(r) => r,
            None => return RecvOutcome::Closed,
        };
        let conn = &mut self.conn;
        let closed = conn.closed();
        let outcome = recv.resume(&mut conn.rx, &mut conn.tx, closed, &mut self.pending);
        if outcome == RecvOutcome::NeedMore {
            self.recv = Some(recv);
        }
        outcome
    }

    /// Take, resume, and re-park the send continuation (readiness backend).
    pub fn drive_send(&mut self) -> SendOutcome {
        let mut send = match self.send.take() {
            Some(s) => s,
            None => return SendOutcome::Closed,
        };
        let outcome = send.resume(&mut self.conn);
        if outcome != SendOutcome::Closed {
            self.send = Some(send);
        }
        outcome
    }

    /// Close the socket and fail every in-flight call. Idempotent.
    pub fn shutdown(&mut self) {
        self.conn.close();
        self.recv = None;
        self.send = None;
        self.pending.fail_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::wire::{Decode, Encode};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn client_parts() -> (InputBuffer, OutputBuffer, PendingTable, RecvLoop) {
        let rx = InputBuffer::new();
        let tx = OutputBuffer::new();
        let pending = PendingTable::new(Arc::new(AtomicU64::new(0)));
        let recv = RecvLoop::new(Role::Client, crate::rpc::wire::DEFAULT_MAX_PAYLOAD_LEN);
        (rx, tx, pending, recv)
    }

    fn response_bytes(request_id: i64, payload: &[u8]) -> Vec<u8> {
        let mut tx = OutputBuffer::new();
        encode_frame(&mut tx, &Header::response(request_id), payload);
        let mut wire = Vec::new();
        tx.write_to(&mut wire).unwrap();
        wire
    }

    fn request_bytes(request_id: i64, service: &str, method: &str, payload: &[u8]) -> Vec<u8> {
        let mut tx = OutputBuffer::new();
        encode_frame(&mut tx, &Header::request(request_id, service, method), payload);
        let mut wire = Vec::new();
        tx.write_to(&mut wire).unwrap();
        wire
    }

    #[test]
    fn response_delivered_one_byte_at_a_time() {
        let (mut rx, mut tx, mut pending, mut recv) = client_parts();
        let got = Arc::new(Mutex::new(None));
        let got2 = Arc::clone(&got);
        pending.insert(
            7,
            PendingCall::new(move |r| {
                *got2.lock().unwrap() = Some(r);
            }),
        );

        let wire = response_bytes(7, b"hello");
        for (i, byte) in wire.iter().enumerate() {
            let mut one = &[*byte][..];
            rx.read_from(&mut one).unwrap();
            let outcome = recv.resume(&mut rx, &mut tx, false, &mut pending);
            if i + 1 < wire.len() {
                assert_eq!(outcome, RecvOutcome::NeedMore);
            }
        }
        assert_eq!(
            got.lock().unwrap().take().unwrap().unwrap(),
            b"hello".to_vec()
        );
        assert!(pending.is_empty());
    }

    #[test]
    fn length_prefix_split_across_reads() {
        for split in 1..4usize {
            let (mut rx, mut tx, mut pending, mut recv) = client_parts();
            let got = Arc::new(AtomicUsize::new(0));
            let got2 = Arc::clone(&got);
            pending.insert(
                1,
                PendingCall::new(move |r| {
                    got2.store(r.unwrap().len(), Ordering::SeqCst);
                }),
            );

            let wire = response_bytes(1, b"abcdef");
            let mut first = &wire[..split];
            rx.read_from(&mut first).unwrap();
            assert_eq!(
                recv.resume(&mut rx, &mut tx, false, &mut pending),
                RecvOutcome::NeedMore
            );
            let mut rest = &wire[split..];
            rx.read_from(&mut rest).unwrap();
            recv.resume(&mut rx, &mut tx, false, &mut pending);
            assert_eq!(got.load(Ordering::SeqCst), 6);
        }
    }

    #[test]
    fn payloads_around_block_size_round_trip() {
        for size in [8191usize, 8192, 8193] {
            let (mut rx, mut tx, mut pending, mut recv) = client_parts();
            let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let expected = payload.clone();
            let got = Arc::new(Mutex::new(Vec::new()));
            let got2 = Arc::clone(&got);
            pending.insert(
                5,
                PendingCall::new(move |r| {
                    *got2.lock().unwrap() = r.unwrap();
                }),
            );

            rx.append(&response_bytes(5, &payload));
            recv.resume(&mut rx, &mut tx, false, &mut pending);
            assert_eq!(*got.lock().unwrap(), expected);
            assert_eq!(rx.available(), 0);
            // All blocks but the live tail were reclaimed.
            assert_eq!(rx.block_count(), 1);
        }
    }

    #[test]
    fn multiplexed_responses_land_on_their_own_calls() {
        let (mut rx, mut tx, mut pending, mut recv) = client_parts();
        let n = 8i64;
        let completions = Arc::new(Mutex::new(HashMap::new()));
        for id in 0..n {
            let completions = Arc::clone(&completions);
            pending.insert(
                id,
                PendingCall::new(move |r| {
                    let prev = completions.lock().unwrap().insert(id, r.unwrap());
                    assert!(prev.is_none(), "completion ran twice");
                }),
            );
        }

        // Arrival order scrambled relative to issue order.
        for id in (0..n).rev() {
            rx.append(&response_bytes(id, format!("payload-{id}").as_bytes()));
        }
        assert_eq!(
            recv.resume(&mut rx, &mut tx, false, &mut pending),
            RecvOutcome::NeedMore
        );

        let completions = completions.lock().unwrap();
        assert_eq!(completions.len(), n as usize);
        for id in 0..n {
            assert_eq!(completions[&id], format!("payload-{id}").into_bytes());
        }
        assert!(pending.is_empty());
    }

    #[test]
    fn stray_response_is_counted_not_fatal() {
        let stray = Arc::new(AtomicU64::new(0));
        let mut rx = InputBuffer::new();
        let mut tx = OutputBuffer::new();
        let mut pending = PendingTable::new(Arc::clone(&stray));
        let mut recv = RecvLoop::new(Role::Client, crate::rpc::wire::DEFAULT_MAX_PAYLOAD_LEN);

        rx.append(&response_bytes(99, b"nobody asked"));
        assert_eq!(
            recv.resume(&mut rx, &mut tx, false, &mut pending),
            RecvOutcome::NeedMore
        );
        assert_eq!(stray.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn corrupt_magic_terminates_connection() {
        let (mut rx, mut tx, mut pending, mut recv) = client_parts();
        let mut wire = response_bytes(3, b"x");
        wire[4] ^= 0xFF; // first header byte
        rx.append(&wire);
        assert_eq!(
            recv.resume(&mut rx, &mut tx, false, &mut pending),
            RecvOutcome::Closed
        );
    }

    #[test]
    fn oversized_length_prefix_terminates_connection() {
        let (mut rx, mut tx, mut pending, mut recv) = client_parts();
        rx.append(&u32::MAX.to_le_bytes());
        assert_eq!(
            recv.resume(&mut rx, &mut tx, false, &mut pending),
            RecvOutcome::Closed
        );
    }

    #[test]
    fn close_fails_every_pending_call_exactly_once() {
        let stray = Arc::new(AtomicU64::new(0));
        let mut pending = PendingTable::new(stray);
        let failures = Arc::new(AtomicUsize::new(0));
        let k = 5;
        for id in 0..k {
            let failures = Arc::clone(&failures);
            pending.insert(
                id,
                PendingCall::new(move |r| {
                    assert_eq!(r, Err(CallError::ConnectionClosed));
                    failures.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        pending.fail_all();
        assert_eq!(failures.load(Ordering::SeqCst), k as usize);
        assert!(pending.is_empty());
        // A second drain is a no-op.
        pending.fail_all();
        assert_eq!(failures.load(Ordering::SeqCst), k as usize);
    }

    #[test]
    fn server_echoes_request_with_matching_id() {
        let mut registry = ServiceRegistry::new();
        registry.register("EchoService", "Echo", |req: String| format!("[Echo]{req}"));
        let registry = Arc::new(registry);

        let mut rx = InputBuffer::new();
        let mut tx = OutputBuffer::new();
        let mut pending = PendingTable::new(Arc::new(AtomicU64::new(0)));
        let mut recv = RecvLoop::new(
            Role::Server {
                registry: Arc::clone(&registry),
            },
            crate::rpc::wire::DEFAULT_MAX_PAYLOAD_LEN,
        );

        let req = String::from("ping");
        rx.append(&request_bytes(11, "EchoService", "Echo", &req.to_bytes()));
        assert_eq!(
            recv.resume(&mut rx, &mut tx, false, &mut pending),
            RecvOutcome::NeedMore
        );

        let mut wire = Vec::new();
        tx.write_to(&mut wire).unwrap();
        let hlen = u32::from_le_bytes(wire[..4].try_into().unwrap()) as usize;
        let header = Header::decode(&wire[4..4 + hlen]).unwrap();
        assert_eq!(header.message_type, MessageType::Response);
        assert_eq!(header.request_id, 11);
        let body = &wire[4 + hlen + 4..];
        assert_eq!(String::decode(body).unwrap(), "[Echo]ping");
    }

    #[test]
    fn unknown_method_drops_frame_and_stream_continues() {
        let mut registry = ServiceRegistry::new();
        registry.register("EchoService", "Echo", |req: String| req);
        let registry = Arc::new(registry);

        let mut rx = InputBuffer::new();
        let mut tx = OutputBuffer::new();
        let mut pending = PendingTable::new(Arc::new(AtomicU64::new(0)));
        let mut recv = RecvLoop::new(
            Role::Server { registry },
            crate::rpc::wire::DEFAULT_MAX_PAYLOAD_LEN,
        );

        rx.append(&request_bytes(1, "EchoService", "Missing", b"x"));
        rx.append(&request_bytes(2, "EchoService", "Echo", b"ok"));
        assert_eq!(
            recv.resume(&mut rx, &mut tx, false, &mut pending),
            RecvOutcome::NeedMore
        );
        // Only the routable request produced a response frame.
        let mut wire = Vec::new();
        tx.write_to(&mut wire).unwrap();
        let hlen = u32::from_le_bytes(wire[..4].try_into().unwrap()) as usize;
        let header = Header::decode(&wire[4..4 + hlen]).unwrap();
        assert_eq!(header.request_id, 2);
        assert_eq!(wire.len(), 4 + hlen + 4 + 2);
    }

    #[test]
    fn close_before_full_frame_terminates_without_delivery() {
        let (mut rx, mut tx, mut pending, mut recv) = client_parts();
        let delivered = Arc::new(AtomicUsize::new(0));
        let delivered2 = Arc::clone(&delivered);
        pending.insert(
            1,
            PendingCall::new(move |_| {
                delivered2.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let wire = response_bytes(1, b"partial");
        rx.append(&wire[..wire.len() - 2]);
        assert_eq!(
            recv.resume(&mut rx, &mut tx, true, &mut pending),
            RecvOutcome::Closed
        );
        // Nothing was delivered upward; teardown fails the call instead.
        assert_eq!(delivered.load(Ordering::SeqCst), 0);
        pending.fail_all();
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }
}
