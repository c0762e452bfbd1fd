//! Request/response framing, multiplexing, and the client/server roles.
//!
//! The wire format is a length-prefixed header+payload frame; a client
//! channel multiplexes many in-flight calls over one connection by request
//! id, and the server resolves each request against a [`ServiceRegistry`]
//! and echoes the id on the response.

pub mod client;
pub mod server;
pub mod service;
pub mod session;
pub mod wire;

pub use client::{ClientChannel, ClientOptions};
pub use server::{RpcServer, ServerHandle, ServerOptions};
pub use service::{InvokeError, Method, ServiceRegistry};
pub use session::{CallError, CallResult};
pub use wire::{Decode, DecodeError, Encode, FrameError, Header, MessageType};
