//! Completion-based reactor on io_uring (Linux).
//!
//! Operations are submitted ahead of time and completions deliver byte
//! counts directly: reads land in space reserved inside the connection's
//! input buffer, writes submit one unflushed fragment at a time and
//! resubmit until drained. A blocking eventfd read is kept armed as the
//! wake channel for cross-thread task submission.
//!
//! Teardown is deferred while kernel operations still reference an entry's
//! buffers: the entry is marked closing, its socket is shut down (which
//! promptly completes outstanding operations), and the entry is destroyed
//! once its in-flight count drains to zero.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use io_uring::{opcode, types, IoUring};
use slab::Slab;
use tracing::{debug, error, trace, warn};

use super::{ConnId, EventItem, Executor, ReactorOps, ReactorOptions, SpawnError, Task, Watch};
use crate::queue::Unbounded;
use crate::rpc::session::{ConnEntry, RecvOutcome, SendState};

const WAKE_TOKEN: u64 = u64::MAX;

/// In-flight operation kinds, correlated through the token slab.
#[derive(Debug, Clone, Copy)]
enum Op {
    Read { conn: ConnId },
    Write { conn: ConnId },
}

struct Shared {
    tasks: Unbounded<Task>,
    should_notify: AtomicBool,
    stop: AtomicBool,
    event_fd: RawFd,
}

impl Shared {
    fn signal(&self) {
        let value: u64 = 1;
        let n = unsafe {
            libc::write(
                self.event_fd,
                &value as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n < 0 {
            warn!("eventfd wake failed");
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        unsafe { libc::close(self.event_fd) };
    }
}

/// Cross-thread handle to a uring reactor.
pub struct UringExecutor {
    shared: Arc<Shared>,
}

impl Executor for UringExecutor {
    fn spawn(&self, task: Task) -> Result<(), SpawnError> {
        if self.shared.stop.load(Ordering::SeqCst) {
            return Err(SpawnError::Stopped);
        }
        self.shared.tasks.push(task);
        fence(Ordering::SeqCst);
        if self
            .shared
            .should_notify
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.shared.signal();
        }
        Ok(())
    }

    fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.signal();
    }
}

/// Start one uring reactor thread. Fails cleanly where the kernel or
/// container denies io_uring.
pub fn start(
    worker_id: usize,
    opts: &ReactorOptions,
) -> io::Result<(Arc<dyn Executor>, JoinHandle<()>)> {
    let ring = IoUring::new(opts.ring_entries)?;
    let event_fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) };
    if event_fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let shared = Arc::new(Shared {
        tasks: Unbounded::new(),
        should_notify: AtomicBool::new(false),
        stop: AtomicBool::new(false),
        event_fd,
    });
    let loop_shared = Arc::clone(&shared);
    let thread = std::thread::Builder::new()
        .name(format!("wirecall-uring-{worker_id}"))
        .spawn(move || run(worker_id, ring, loop_shared))?;
    Ok((Arc::new(UringExecutor { shared }), thread))
}

/// Reactor-thread state exposed to tasks and completion handlers.
struct UringCtx<'a> {
    ring: &'a mut IoUring,
    conns: &'a mut Slab<ConnEntry>,
    ops: &'a mut Slab<Op>,
}

impl UringCtx<'_> {
    fn push_sqe(&mut self, sqe: &io_uring::squeue::Entry) -> io::Result<()> {
        unsafe {
            if self.ring.submission().push(sqe).is_err() {
                self.ring.submit()?;
                self.ring
                    .submission()
                    .push(sqe)
                    .map_err(|_| io::Error::new(io::ErrorKind::Other, "submission queue full"))?;
            }
        }
        Ok(())
    }

    /// Arm the next read: reserve space in the input buffer and hand the
    /// kernel a pointer into it. The reserved block stays put until the
    /// completion commits into it.
    fn submit_read(&mut self, id: ConnId) -> io::Result<()> {
        let Some(entry) = self.conns.get_mut(id) else {
            return Ok(());
        };
        let fd = std::os::unix::io::AsRawFd::as_raw_fd(&entry.conn);
        let (ptr, len) = entry.conn.rx.reserve();
        let token = self.ops.insert(Op::Read { conn: id }) as u64;
        let sqe = opcode::Recv::new(types::Fd(fd), ptr, len as u32)
            .build()
            .user_data(token);
        match self.push_sqe(&sqe) {
            Ok(()) => {
                self.conns[id].inflight += 1;
                Ok(())
            }
            Err(e) => {
                self.ops.try_remove(token as usize);
                Err(e)
            }
        }
    }

    /// Submit the first unflushed fragment. One write is in flight per
    /// connection at most; completions resubmit until the buffer drains.
    fn submit_write(&mut self, id: ConnId) -> io::Result<()> {
        let Some(entry) = self.conns.get_mut(id) else {
            return Ok(());
        };
        let Some((ptr, len)) = entry.conn.tx.first_fragment() else {
            if let Some(send) = entry.send.as_mut() {
                send.state = SendState::Idle;
            }
            return Ok(());
        };
        let fd = std::os::unix::io::AsRawFd::as_raw_fd(&entry.conn);
        let token = self.ops.insert(Op::Write { conn: id }) as u64;
        let sqe = opcode::Send::new(types::Fd(fd), ptr, len as u32)
            .build()
            .user_data(token);
        match self.push_sqe(&sqe) {
            Ok(()) => {
                let entry = &mut self.conns[id];
                entry.inflight += 1;
                if let Some(send) = entry.send.as_mut() {
                    send.state = SendState::Flushing;
                }
                Ok(())
            }
            Err(e) => {
                self.ops.try_remove(token as usize);
                Err(e)
            }
        }
    }

    /// Close the socket and fail in-flight calls now; destroy the entry
    /// once no submitted operation references its buffers.
    fn begin_teardown(&mut self, id: ConnId) {
        let Some(entry) = self.conns.get_mut(id) else {
            return;
        };
        if !entry.closing {
            entry.closing = true;
            entry.shutdown();
            debug!(conn_id = id, "connection closing");
        }
        if entry.inflight == 0 {
            self.conns.try_remove(id);
            debug!(conn_id = id, "connection torn down");
        }
    }

    fn op_completed(&mut self, id: ConnId) {
        if let Some(entry) = self.conns.get_mut(id) {
            entry.inflight = entry.inflight.saturating_sub(1);
        }
    }

    fn on_read_complete(&mut self, id: ConnId, result: i32) {
        self.op_completed(id);
        let Some(entry) = self.conns.get_mut(id) else {
            return;
        };
        if entry.closing {
            self.begin_teardown(id);
            return;
        }
        if result <= 0 {
            if result < 0 {
                let err = io::Error::from_raw_os_error(-result);
                debug!(conn_id = id, error = %err, "read completion failed");
            } else {
                debug!(conn_id = id, "peer closed connection");
            }
            entry.conn.close();
            entry.drive_recv();
            self.begin_teardown(id);
            return;
        }
        entry.conn.rx.commit(result as usize);
        match entry.drive_recv() {
            RecvOutcome::Closed => {
                self.begin_teardown(id);
                return;
            }
            RecvOutcome::NeedMore => {
                if let Err(e) = self.submit_read(id) {
                    error!(conn_id = id, error = %e, "read submission failed");
                    self.begin_teardown(id);
                    return;
                }
            }
        }
        // Dispatch may have staged responses.
        self.kick(id);
    }

    fn on_write_complete(&mut self, id: ConnId, result: i32) {
        self.op_completed(id);
        let Some(entry) = self.conns.get_mut(id) else {
            return;
        };
        if entry.closing {
            self.begin_teardown(id);
            return;
        }
        if result <= 0 {
            if result < 0 {
                let err = io::Error::from_raw_os_error(-result);
                debug!(conn_id = id, error = %err, "write completion failed");
            }
            entry.conn.close();
            self.begin_teardown(id);
            return;
        }
        entry.conn.tx.consume(result as usize);
        if entry.conn.tx.is_empty() {
            if let Some(send) = entry.send.as_mut() {
                send.state = SendState::Idle;
            }
        } else if let Err(e) = self.submit_write(id) {
            error!(conn_id = id, error = %e, "write submission failed");
            self.begin_teardown(id);
        }
    }
}

impl ReactorOps for UringCtx<'_> {
    fn install(&mut self, entry: ConnEntry) -> io::Result<ConnId> {
        let id = self.conns.insert(entry);
        match self.submit_read(id) {
            Ok(()) => {
                debug!(conn_id = id, peer = %self.conns[id].conn.peer_addr(), "connection installed");
                Ok(id)
            }
            Err(e) => {
                let mut entry = self.conns.remove(id);
                entry.shutdown();
                Err(e)
            }
        }
    }

    fn entry_mut(&mut self, id: ConnId) -> Option<&mut ConnEntry> {
        self.conns.get_mut(id)
    }

    fn register(&mut self, item: EventItem) -> io::Result<()> {
        match item.watch {
            // Reads stay armed for a live entry by construction.
            Watch::Read => Ok(()),
            Watch::ReadWrite => {
                self.kick(item.conn);
                Ok(())
            }
            Watch::Unwatch => {
                self.begin_teardown(item.conn);
                Ok(())
            }
        }
    }

    fn kick(&mut self, id: ConnId) {
        let Some(entry) = self.conns.get_mut(id) else {
            return;
        };
        if entry.closing || entry.conn.tx.is_empty() {
            return;
        }
        let idle = entry
            .send
            .as_ref()
            .map(|s| s.state == SendState::Idle)
            .unwrap_or(false);
        if idle {
            if let Err(e) = self.submit_write(id) {
                error!(conn_id = id, error = %e, "write submission failed");
                self.begin_teardown(id);
            }
        }
    }

    fn close(&mut self, id: ConnId) {
        self.begin_teardown(id);
    }
}

fn run(worker_id: usize, mut ring: IoUring, shared: Arc<Shared>) {
    let mut conns: Slab<ConnEntry> = Slab::new();
    let mut ops: Slab<Op> = Slab::new();
    // Reused buffer for the armed eventfd read; lives until the final
    // completion is reaped below.
    let wake_buf = Box::new([0u8; 8]);
    let wake_ptr = Box::into_raw(wake_buf);
    let mut wake_armed = false;
    let mut cqes: Vec<(u64, i32)> = Vec::with_capacity(256);

    debug!(worker = worker_id, "uring reactor started");

    loop {
        while let Some(task) = shared.tasks.pop() {
            let mut ctx = UringCtx {
                ring: &mut ring,
                conns: &mut conns,
                ops: &mut ops,
            };
            task(&mut ctx);
        }

        let stopping = shared.stop.load(Ordering::SeqCst);
        if stopping && !wake_armed {
            break;
        }

        if !stopping && !wake_armed {
            let sqe = opcode::Read::new(types::Fd(shared.event_fd), wake_ptr as *mut u8, 8)
                .build()
                .user_data(WAKE_TOKEN);
            let pushed = unsafe { ring.submission().push(&sqe).is_ok() };
            if !pushed {
                if let Err(e) = ring.submit() {
                    error!(worker = worker_id, error = %e, "ring submit failed");
                    break;
                }
                if unsafe { ring.submission().push(&sqe).is_err() } {
                    error!(worker = worker_id, "submission queue full for wake read");
                    break;
                }
            }
            wake_armed = true;
        }

        if !stopping {
            shared.should_notify.store(true, Ordering::SeqCst);
            fence(Ordering::SeqCst);
            if !shared.tasks.is_empty() || shared.stop.load(Ordering::SeqCst) {
                shared.should_notify.store(false, Ordering::SeqCst);
                continue;
            }
        }

        match ring.submit_and_wait(1) {
            Ok(_) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!(worker = worker_id, error = %e, "submit_and_wait failed");
                break;
            }
        }
        shared.should_notify.store(false, Ordering::SeqCst);

        cqes.clear();
        for cqe in ring.completion() {
            cqes.push((cqe.user_data(), cqe.result()));
        }

        for &(user_data, result) in &cqes {
            if user_data == WAKE_TOKEN {
                trace!(worker = worker_id, "woken");
                wake_armed = false;
                continue;
            }
            let op = match ops.try_remove(user_data as usize) {
                Some(op) => op,
                None => {
                    warn!(worker = worker_id, user_data, "completion for unknown token");
                    continue;
                }
            };
            let mut ctx = UringCtx {
                ring: &mut ring,
                conns: &mut conns,
                ops: &mut ops,
            };
            match op {
                Op::Read { conn } => ctx.on_read_complete(conn, result),
                Op::Write { conn } => ctx.on_write_complete(conn, result),
            }
        }
    }

    shutdown_drain(worker_id, &mut ring, &mut conns, &mut ops, wake_armed);
    // Safe to reclaim: no armed wake read references the buffer anymore.
    drop(unsafe { Box::from_raw(wake_ptr) });
    debug!(worker = worker_id, "uring reactor stopped");
}

/// Close every connection, then reap outstanding completions so no kernel
/// operation still references an entry's buffers (or the wake buffer) when
/// they are dropped.
fn shutdown_drain(
    worker_id: usize,
    ring: &mut IoUring,
    conns: &mut Slab<ConnEntry>,
    ops: &mut Slab<Op>,
    mut wake_armed: bool,
) {
    for (_, entry) in conns.iter_mut() {
        entry.closing = true;
        entry.shutdown();
    }
    while !ops.is_empty() || wake_armed {
        match ring.submit_and_wait(1) {
            Ok(_) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!(worker = worker_id, error = %e, "drain wait failed");
                break;
            }
        }
        for cqe in ring.completion() {
            let user_data = cqe.user_data();
            if user_data == WAKE_TOKEN {
                wake_armed = false;
            } else {
                ops.try_remove(user_data as usize);
            }
        }
    }
    for mut entry in conns.drain() {
        entry.shutdown();
    }
}
