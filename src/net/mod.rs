//! Socket ownership and tuning.
//!
//! A [`Connection`] wraps exactly one nonblocking TCP socket together with
//! its receive and send buffers; `socket.rs` builds listeners and outbound
//! streams with the transport's socket options applied.

mod connection;
pub(crate) mod socket;

pub use connection::{Connection, FillStatus, FlushStatus};
