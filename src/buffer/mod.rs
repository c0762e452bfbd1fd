//! Chained-block byte buffers for streaming I/O.
//!
//! Input and output buffers own a chain of fixed-capacity blocks and grow
//! block-by-block as data arrives or is staged. Fully consumed (input) or
//! fully flushed (output) blocks are released as soon as the cursor moves
//! past them, so memory is bounded by live unread/unflushed data only.
//!
//! Both buffers are single-owner structures: a connection's buffers are only
//! ever touched by the reactor thread that owns the connection, so no
//! internal locking is needed.

mod block;
mod input;
mod output;

pub(crate) use block::Block;
pub use input::InputBuffer;
pub use output::OutputBuffer;

/// Default capacity of a single buffer block.
pub const DEFAULT_BLOCK_SIZE: usize = 8192;
