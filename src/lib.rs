//! wirecall: an asynchronous RPC transport built from scratch.
//!
//! A reactor-based scheduler multiplexes many socket connections over a
//! small pool of OS threads; chained-block buffers feed a length-prefixed
//! request/response framing protocol; lock-free MPMC queues hand work
//! across threads. A client issues many concurrent in-flight calls over one
//! connection, and a server multiplexes many connections per thread without
//! blocking.
//!
//! Two interchangeable reactor backends share one contract:
//! - readiness-based polling via mio (epoll/kqueue)
//! - completion-based polling via io_uring (Linux)
//!
//! Serialization of user payloads is an opaque contract ([`Encode`] /
//! [`Decode`]); the transport only frames, multiplexes, and dispatches.

pub mod buffer;
pub mod config;
pub mod net;
pub mod queue;
pub mod reactor;
pub mod rpc;

pub use config::{BackendKind, Config};
pub use net::Connection;
pub use reactor::{Executor, ReactorOptions, Scheduler};
pub use rpc::{
    CallError, ClientChannel, ClientOptions, Decode, Encode, RpcServer, ServerHandle,
    ServerOptions, ServiceRegistry,
};
