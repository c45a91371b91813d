//! Connections
//!
//! A [`Connection`] is the application's view of one TCP stream: a framed
//! read queue, a staged write queue, a transport chain and a serialized
//! stream of [`Handler`] callbacks.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Dispatcher task                         │
//! │        (socket readiness, wire reads and writes)            │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │ receive() / take_wire()
//!                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Connection                            │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐      │
//! │  │ ReadQueue   │<───│ Transport   │<───│ wire bytes  │      │
//! │  │ WriteQueue  │───>│ chain       │───>│             │      │
//! │  └─────────────┘    └─────────────┘    └─────────────┘      │
//! │         │                                                   │
//! │         ▼                                                   │
//! │  ┌─────────────┐                                            │
//! │  │ EventQueue  │──> Handler (one callback at a time)        │
//! │  └─────────────┘                                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use flashio::connection::{Connection, Handler};
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn on_data(&mut self, connection: &Connection) -> flashio::Result<()> {
//!         let line = connection.read_string_by_delimiter("\r\n", 8192)?;
//!         connection.write_str(&line)?;
//!         connection.write("\r\n")?;
//!         Ok(())
//!     }
//! }
//! ```

pub mod core;
mod events;
pub mod handler;
pub mod stats;

pub use self::core::{Connection, ConnectionId, Phase, ReadMode, UNLIMITED};
pub use handler::{Handler, HandlerFactory};
pub use stats::ConnectionStats;
