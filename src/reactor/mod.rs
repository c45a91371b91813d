//! Reactor Module
//!
//! The threads that move bytes and run callbacks:
//!
//! - [`DispatcherPool`]: N dispatcher threads, each a single-threaded
//!   runtime serving its share of the sockets
//! - [`WorkerPool`]: the multi-threaded runtime whose blocking pool runs
//!   application callbacks and whose workers drive the watchdogs

pub mod dispatcher;
pub mod worker;

pub use dispatcher::{Dispatcher, DispatcherPool};
pub use worker::{Executor, WorkerPool};
