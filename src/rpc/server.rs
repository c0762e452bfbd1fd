//! Server: accept loop, connection adoption, graceful shutdown.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use mio::net::TcpStream;
use socket2::SockRef;
use tracing::{debug, error, info, warn};

use crate::config::BackendKind;
use crate::net::{socket, Connection};
use crate::reactor::{ReactorOps, ReactorOptions, Scheduler, Task};
use crate::rpc::service::ServiceRegistry;
use crate::rpc::session::ConnEntry;
use crate::rpc::wire::DEFAULT_MAX_PAYLOAD_LEN;

/// Server construction parameters.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub listen: SocketAddr,
    pub backend: BackendKind,
    /// Reactor threads; 0 means one per available core.
    pub workers: usize,
    pub socket_buffer_size: usize,
    pub max_payload_len: u32,
    pub task_queue_capacity: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8890".parse().expect("static address"),
            backend: BackendKind::Poll,
            workers: 0,
            socket_buffer_size: socket::SOCKET_BUFFER_SIZE,
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
            task_queue_capacity: 1024,
        }
    }
}

/// An RPC server: a listener plus the registry its connections dispatch
/// into.
pub struct RpcServer {
    options: ServerOptions,
    registry: Arc<ServiceRegistry>,
}

impl RpcServer {
    pub fn new(options: ServerOptions, registry: ServiceRegistry) -> Self {
        if registry.is_empty() {
            warn!("starting server with no registered services");
        }
        Self {
            options,
            registry: Arc::new(registry),
        }
    }

    /// Bind, start the reactors, and run the accept loop on a background
    /// thread. The returned handle reports the bound address and stops
    /// everything on shutdown.
    pub fn start(self) -> io::Result<ServerHandle> {
        let reactor_opts = ReactorOptions {
            task_queue_capacity: self.options.task_queue_capacity,
            ..ReactorOptions::default()
        };
        let scheduler = Scheduler::start(self.options.backend, self.options.workers, &reactor_opts)?;

        let listener = socket::listen(self.options.listen)?;
        let local_addr = listener.local_addr()?;
        info!(
            addr = %local_addr,
            backend = ?self.options.backend,
            "server listening"
        );

        let stop = Arc::new(AtomicBool::new(false));
        let accept_stop = Arc::clone(&stop);
        let options = self.options.clone();
        let registry = self.registry;
        let accept_scheduler = Arc::new(scheduler);
        let loop_scheduler = Arc::clone(&accept_scheduler);

        let accept_thread = std::thread::Builder::new()
            .name("wirecall-accept".to_string())
            .spawn(move || {
                accept_loop(listener, accept_stop, options, registry, loop_scheduler);
            })?;

        Ok(ServerHandle {
            local_addr,
            stop,
            accept_thread: Some(accept_thread),
            scheduler: Some(accept_scheduler),
        })
    }
}

fn accept_loop(
    listener: std::net::TcpListener,
    stop: Arc<AtomicBool>,
    options: ServerOptions,
    registry: Arc<ServiceRegistry>,
    scheduler: Arc<Scheduler>,
) {
    loop {
        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                error!(error = %e, "accept failed");
                continue;
            }
        };
        if stop.load(Ordering::SeqCst) {
            // The shutdown ping connects just to unblock this loop.
            break;
        }

        if let Err(e) = socket::tune_stream(&SockRef::from(&stream), options.socket_buffer_size) {
            warn!(peer = %peer, error = %e, "socket tuning failed, dropping connection");
            continue;
        }

        let stream = TcpStream::from_std(stream);
        let conn = match Connection::new(stream) {
            Ok(conn) => conn,
            Err(e) => {
                warn!(peer = %peer, error = %e, "connection setup failed");
                continue;
            }
        };
        debug!(peer = %peer, "accepted connection");

        let entry = ConnEntry::server(conn, Arc::clone(&registry), options.max_payload_len);
        let exec = scheduler.executor();
        let task: Task = Box::new(move |ops: &mut dyn ReactorOps| {
            if let Err(e) = ops.install(entry) {
                warn!(error = %e, "connection install failed");
            }
        });
        if let Err(e) = exec.spawn(task) {
            warn!(peer = %peer, error = %e, "reactor rejected connection");
        }
    }
    debug!("accept loop stopped");
}

/// Running-server handle.
pub struct ServerHandle {
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
    scheduler: Option<Arc<Scheduler>>,
}

impl ServerHandle {
    /// The bound listen address (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Block until the accept loop exits.
    pub fn wait(mut self) {
        if let Some(thread) = self.accept_thread.take() {
            let _ = thread.join();
        }
    }

    /// Stop accepting, tear down every connection (failing its in-flight
    /// calls), and join all threads.
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // Unblock the accept loop.
        let _ = std::net::TcpStream::connect(self.local_addr);
        if let Some(thread) = self.accept_thread.take() {
            let _ = thread.join();
        }
        // Dropping the scheduler stops and joins the reactors.
        self.scheduler.take();
        info!(addr = %self.local_addr, "server stopped");
    }
}
