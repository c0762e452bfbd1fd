//! Per-thread event loops driving the connections.
//!
//! Backend implementations:
//! - `poll`: readiness-based, built on mio (epoll on Linux, kqueue on macOS)
//! - `uring`: completion-based, built on io_uring (Linux only)
//!
//! Both present the same contract: an [`Executor`] handle any thread can
//! submit work through, and a [`ReactorOps`] view those submitted tasks run
//! against on the reactor thread. A connection is owned by exactly one
//! reactor thread for its lifetime, which is what lets the buffer and
//! session layers run without locks.

pub mod poll;

#[cfg(target_os = "linux")]
pub mod uring;

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::warn;

use crate::config::BackendKind;
use crate::rpc::session::ConnEntry;

/// Identifier of a connection within its owning reactor.
pub type ConnId = usize;

/// Interest change requested for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Watch {
    /// Readable interest only.
    Read,
    /// Readable plus writable interest, while output is pending.
    ReadWrite,
    /// Drop all interest.
    Unwatch,
}

/// A registration request, consumed synchronously by [`ReactorOps::register`].
#[derive(Debug, Clone, Copy)]
pub struct EventItem {
    pub conn: ConnId,
    pub watch: Watch,
}

/// A unit of work executed on the reactor thread.
pub type Task = Box<dyn FnOnce(&mut dyn ReactorOps) + Send>;

/// Why a task submission was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    /// The reactor's bounded task queue is full.
    QueueFull,
    /// The reactor has been stopped.
    Stopped,
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnError::QueueFull => write!(f, "reactor task queue is full"),
            SpawnError::Stopped => write!(f, "reactor is stopped"),
        }
    }
}

impl std::error::Error for SpawnError {}

/// Cross-thread handle to one reactor.
pub trait Executor: Send + Sync {
    /// Enqueue `task` and wake the reactor if it is parked in the blocking
    /// wait. Multiple submissions between wakeups coalesce into a single
    /// notification.
    fn spawn(&self, task: Task) -> Result<(), SpawnError>;

    /// Request loop exit; remaining connections are torn down (failing
    /// their in-flight calls). Idempotent.
    fn stop(&self);
}

/// Reactor-thread view handed to submitted tasks and event handlers.
pub trait ReactorOps {
    /// Adopt a new connection: registers read interest (or submits the
    /// first read) and starts its receive/send loops.
    fn install(&mut self, entry: ConnEntry) -> io::Result<ConnId>;

    /// Access a live connection entry.
    fn entry_mut(&mut self, id: ConnId) -> Option<&mut ConnEntry>;

    /// Apply an interest change for a connection.
    fn register(&mut self, item: EventItem) -> io::Result<()>;

    /// Flush freshly staged output: attempt a write now and arm write
    /// interest (or submit a write op) if the kernel pushes back.
    fn kick(&mut self, id: ConnId);

    /// Tear a connection down, failing its in-flight calls.
    fn close(&mut self, id: ConnId);
}

/// Tuning knobs shared by both backends.
#[derive(Debug, Clone)]
pub struct ReactorOptions {
    /// Capacity of the poll backend's bounded task queue.
    pub task_queue_capacity: usize,
    /// Submission ring size for the uring backend.
    pub ring_entries: u32,
}

impl Default for ReactorOptions {
    fn default() -> Self {
        Self {
            task_queue_capacity: 1024,
            ring_entries: 1024,
        }
    }
}

/// A fixed set of reactor threads with round-robin executor handout.
pub struct Scheduler {
    executors: Vec<Arc<dyn Executor>>,
    threads: Vec<JoinHandle<()>>,
    next: AtomicUsize,
}

impl Scheduler {
    /// Spin up `workers` reactor threads of the given backend (at least
    /// one; 0 means one per available core).
    pub fn start(
        backend: BackendKind,
        workers: usize,
        opts: &ReactorOptions,
    ) -> io::Result<Self> {
        let workers = if workers == 0 { num_cpus() } else { workers };
        let mut executors: Vec<Arc<dyn Executor>> = Vec::with_capacity(workers);
        let mut threads = Vec::with_capacity(workers);
        for i in 0..workers {
            match backend {
                BackendKind::Poll => {
                    let (exec, thread) = poll::start(i, opts)?;
                    executors.push(exec);
                    threads.push(thread);
                }
                BackendKind::Uring => {
                    #[cfg(target_os = "linux")]
                    {
                        let (exec, thread) = uring::start(i, opts)?;
                        executors.push(exec);
                        threads.push(thread);
                    }
                    #[cfg(not(target_os = "linux"))]
                    {
                        return Err(io::Error::new(
                            io::ErrorKind::Unsupported,
                            "io_uring backend is only available on Linux",
                        ));
                    }
                }
            }
        }
        Ok(Self {
            executors,
            threads,
            next: AtomicUsize::new(0),
        })
    }

    /// Hand out executors round-robin, the way the accept loop spreads
    /// connections across workers.
    pub fn executor(&self) -> Arc<dyn Executor> {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.executors.len();
        Arc::clone(&self.executors[i])
    }

    /// Stop every reactor and join its thread.
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for exec in &self.executors {
            exec.stop();
        }
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                warn!("reactor thread panicked");
            }
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
