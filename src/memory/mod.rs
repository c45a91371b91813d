//! Memory Module
//!
//! Pooled read segments shared by every dispatcher.
//!
//! ```text
//!   Dispatcher 0 ──acquire──┐           ┌──recycle── Dispatcher 0
//!   Dispatcher 1 ──acquire──┤  free     ├──recycle── Dispatcher 1
//!   Dispatcher N ──acquire──┘  list     └──recycle── Dispatcher N
//! ```
//!
//! A dispatcher acquires a segment, reads from the socket into it, freezes
//! the filled prefix into an immutable `Bytes` for the incoming queue and
//! hands the unused tail back. Ownership moves on every step, so a
//! recycled segment can never be observed by its previous user.

pub mod manager;

pub use manager::{MemoryConfig, MemoryManager, MemoryStats};
