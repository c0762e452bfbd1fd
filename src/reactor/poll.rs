//! Readiness-based reactor on mio.
//!
//! Edge-triggered model: the poll tells us when a socket is ready, the
//! connection then drains the kernel buffer with nonblocking syscalls.
//! Write interest is armed only while a connection has unflushed output.

use std::io;
use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use mio::{Events, Interest, Poll, Registry, Token, Waker};
use slab::Slab;
use tracing::{debug, error, trace, warn};

use super::{ConnId, EventItem, Executor, ReactorOps, ReactorOptions, SpawnError, Task, Watch};
use crate::queue::Bounded;
use crate::rpc::session::{ConnEntry, RecvOutcome, SendOutcome, SendState};

const WAKE_TOKEN: Token = Token(usize::MAX);

struct Shared {
    tasks: Bounded<Task>,
    /// True while the reactor is about to park (or parked); the spawner that
    /// claims it with a compare-and-swap is the one that wakes the loop.
    should_notify: AtomicBool,
    stop: AtomicBool,
    waker: Waker,
}

/// Cross-thread handle to a poll reactor.
pub struct PollExecutor {
    shared: Arc<Shared>,
}

impl Executor for PollExecutor {
    fn spawn(&self, task: Task) -> Result<(), SpawnError> {
        if self.shared.stop.load(Ordering::SeqCst) {
            return Err(SpawnError::Stopped);
        }
        self.shared
            .tasks
            .push(task)
            .map_err(|_| SpawnError::QueueFull)?;
        fence(Ordering::SeqCst);
        if self
            .shared
            .should_notify
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            if let Err(e) = self.shared.waker.wake() {
                warn!(error = %e, "reactor wake failed");
            }
        }
        Ok(())
    }

    fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        let _ = self.shared.waker.wake();
    }
}

/// Start one poll reactor thread.
pub fn start(
    worker_id: usize,
    opts: &ReactorOptions,
) -> io::Result<(Arc<dyn Executor>, JoinHandle<()>)> {
    let poll = Poll::new()?;
    let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
    let shared = Arc::new(Shared {
        tasks: Bounded::new(opts.task_queue_capacity),
        should_notify: AtomicBool::new(false),
        stop: AtomicBool::new(false),
        waker,
    });
    let loop_shared = Arc::clone(&shared);
    let thread = std::thread::Builder::new()
        .name(format!("wirecall-poll-{worker_id}"))
        .spawn(move || run(worker_id, poll, loop_shared))?;
    Ok((Arc::new(PollExecutor { shared }), thread))
}

/// Reactor-thread state exposed to tasks and event handlers.
struct PollCtx<'a> {
    registry: &'a Registry,
    conns: &'a mut Slab<ConnEntry>,
}

impl PollCtx<'_> {
    /// Reconcile registered interest with the send loop's state: write
    /// interest is armed only while output is pending.
    fn sync_interest(&mut self, id: ConnId, was_flushing: bool) {
        let flushing = self.send_state(id);
        if flushing == was_flushing || !self.conns.contains(id) {
            return;
        }
        let watch = if flushing {
            Watch::ReadWrite
        } else {
            Watch::Read
        };
        if let Err(e) = self.register(EventItem { conn: id, watch }) {
            warn!(conn_id = id, error = %e, "interest change failed");
            self.teardown(id);
        }
    }

    fn send_state(&self, id: ConnId) -> bool {
        self.conns
            .get(id)
            .and_then(|e| e.send.as_ref())
            .map(|s| s.state == SendState::Flushing)
            .unwrap_or(false)
    }

    fn teardown(&mut self, id: ConnId) {
        if let Some(mut entry) = self.conns.try_remove(id) {
            let _ = self.registry.deregister(entry.conn.stream_mut());
            entry.shutdown();
            debug!(conn_id = id, "connection torn down");
        }
    }

    fn on_readable(&mut self, id: ConnId) {
        let Some(entry) = self.conns.get_mut(id) else {
            return;
        };
        entry.conn.fill();
        if entry.drive_recv() == RecvOutcome::Closed {
            self.teardown(id);
            return;
        }
        // The receive loop may have staged responses.
        if !self
            .conns
            .get(id)
            .map(|e| e.conn.tx.is_empty())
            .unwrap_or(true)
        {
            self.kick(id);
        }
    }

    fn on_writable(&mut self, id: ConnId) {
        let was_flushing = self.send_state(id);
        let Some(entry) = self.conns.get_mut(id) else {
            return;
        };
        match entry.drive_send() {
            SendOutcome::Closed => self.teardown(id),
            SendOutcome::Idle | SendOutcome::Blocked => self.sync_interest(id, was_flushing),
        }
    }
}

impl ReactorOps for PollCtx<'_> {
    fn install(&mut self, entry: ConnEntry) -> io::Result<ConnId> {
        let id = self.conns.insert(entry);
        let entry = &mut self.conns[id];
        match self
            .registry
            .register(entry.conn.stream_mut(), Token(id), Interest::READABLE)
        {
            Ok(()) => {
                debug!(conn_id = id, peer = %entry.conn.peer_addr(), "connection installed");
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
        let Some(entry) = self.conns.get_mut(item.conn) else {
            return Ok(());
        };
        match item.watch {
            Watch::Read => self.registry.reregister(
                entry.conn.stream_mut(),
                Token(item.conn),
                Interest::READABLE,
            ),
            Watch::ReadWrite => self.registry.reregister(
                entry.conn.stream_mut(),
                Token(item.conn),
                Interest::READABLE | Interest::WRITABLE,
            ),
            Watch::Unwatch => self.registry.deregister(entry.conn.stream_mut()),
        }
    }

    fn kick(&mut self, id: ConnId) {
        self.on_writable(id);
    }

    fn close(&mut self, id: ConnId) {
        self.teardown(id);
    }
}

fn run(worker_id: usize, mut poll: Poll, shared: Arc<Shared>) {
    let mut events = Events::with_capacity(1024);
    let mut conns: Slab<ConnEntry> = Slab::new();
    debug!(worker = worker_id, "poll reactor started");

    loop {
        // Drain cross-thread work first.
        while let Some(task) = shared.tasks.pop() {
            let mut ctx = PollCtx {
                registry: poll.registry(),
                conns: &mut conns,
            };
            task(&mut ctx);
        }

        if shared.stop.load(Ordering::SeqCst) {
            break;
        }

        // Publish that we are about to park, then re-check the queue: a
        // spawner that saw the flag down is guaranteed to have enqueued
        // before this check observes the queue.
        shared.should_notify.store(true, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        if !shared.tasks.is_empty() || shared.stop.load(Ordering::SeqCst) {
            shared.should_notify.store(false, Ordering::SeqCst);
            continue;
        }

        match poll.poll(&mut events, None) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!(worker = worker_id, error = %e, "poll failed");
                break;
            }
        }
        shared.should_notify.store(false, Ordering::SeqCst);

        for event in events.iter() {
            let token = event.token();
            if token == WAKE_TOKEN {
                continue;
            }
            let id = token.0;
            trace!(
                worker = worker_id,
                conn_id = id,
                readable = event.is_readable(),
                writable = event.is_writable(),
                "event"
            );
            let mut ctx = PollCtx {
                registry: poll.registry(),
                conns: &mut conns,
            };
            if event.is_readable() || event.is_read_closed() {
                ctx.on_readable(id);
            }
            if event.is_writable() || event.is_write_closed() {
                ctx.on_writable(id);
            }
        }
    }

    // Tear down whatever is left so no in-flight call hangs.
    let remaining = conns.len();
    if remaining > 0 {
        debug!(worker = worker_id, remaining, "closing connections on stop");
    }
    for mut entry in conns.drain() {
        entry.shutdown();
    }
    debug!(worker = worker_id, "poll reactor stopped");
}
