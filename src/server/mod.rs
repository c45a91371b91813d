//! Server Module
//!
//! - [`Server`]: the blocking accept loop handing sockets to dispatchers
//! - [`TimeoutWatchdog`]: periodic idle and lifetime timeout checks, at a
//!   [`CheckPeriod`] connections can lower

pub mod acceptor;
pub mod watchdog;

pub use acceptor::Server;
pub use watchdog::{CheckPeriod, TimeoutWatchdog};
