//! Buffer Module
//!
//! Queued bytes and the framing primitives built on top of them.
//!
//! ## Layout
//!
//! ```text
//!  socket reads ──> [seg][seg][seg]...  ByteQueue (VecDeque<Bytes>)
//!                    │
//!                    │  index_of / read_by_delimiter
//!                    ▼
//!              ScanCursor (resumable KMP state, cached in the queue)
//!                    │
//!                    ▼
//!              extract() ──> zero-copy slices of the segments
//! ```
//!
//! - [`ByteQueue`]: ordered segments, byte count and an insert version
//! - [`ScanCursor`] / [`find`] / [`extract`]: incremental delimiter search
//! - [`ReadQueue`]: incoming side, with a read mark that records consumed bytes
//! - [`WriteQueue`]: outgoing staging area, with a rewindable write mark
//!
//! Segments are `bytes::Bytes`, so splitting a frame out of a segment only
//! bumps a reference count.

pub mod queue;
pub mod read_queue;
pub mod scanner;
pub mod write_queue;

pub use queue::{ByteQueue, Frame};
pub use read_queue::ReadQueue;
pub use scanner::{extract, find, ScanCursor};
pub use write_queue::WriteQueue;

/// Errors raised by the queue and scanner primitives.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    /// Fewer bytes are queued than were requested
    #[error("Buffer underflow: requested {requested} bytes, {available} available")]
    Underflow { requested: usize, available: usize },

    /// The delimiter was not found within the allowed length
    #[error("Delimiter not found within {max} bytes")]
    MaxSizeExceeded { max: usize },

    /// Zero-length delimiters can never match
    #[error("Delimiter must not be empty")]
    EmptyDelimiter,
}
