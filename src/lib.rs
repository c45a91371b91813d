//! # flashio - A Non-Blocking Network I/O Engine
//!
//! flashio multiplexes thousands of TCP connections over a handful of
//! dispatcher threads while giving application code a simple,
//! synchronous-looking read/write API with zero-copy framing.
//!
//! ## Features
//!
//! - **Reactor dispatchers**: N threads, each serving its share of sockets
//! - **Zero-copy framing**: delimiter and length reads that slice `Bytes`
//!   segments instead of copying, with resumable delimiter scans
//! - **Checkpoints**: read and write marks to roll back speculative parsing
//!   or staged output
//! - **Transport stages**: rate-limited writes and a pluggable secure
//!   transport, insertable and removable at runtime
//! - **Connection pool**: idle reuse, admission control and eviction
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                               flashio                                   │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐                  │
//! │  │  Acceptor   │───>│ Dispatcher  │───>│ Connection  │──> Handler       │
//! │  │  (Server)   │    │   threads   │    │  (queues)   │    (workers)     │
//! │  └─────────────┘    └──────┬──────┘    └──────┬──────┘                  │
//! │                            │                  │                         │
//! │                            ▼                  ▼                         │
//! │                     ┌─────────────┐    ┌─────────────┐                  │
//! │                     │  Memory     │    │ Transport   │                  │
//! │                     │  Manager    │    │ chain       │                  │
//! │                     └─────────────┘    └─────────────┘                  │
//! │                                                                         │
//! │  ┌─────────────────────────────┐    ┌────────────────────────────────┐  │
//! │  │ TimeoutWatchdog             │    │ ConnectionPool (client side)   │  │
//! │  │ (task on the worker runtime)│    │ idle reuse, admission, evict   │  │
//! │  └─────────────────────────────┘    └────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use flashio::{Connection, Handler, Server, ServerConfig};
//!
//! struct Pong;
//!
//! impl Handler for Pong {
//!     fn on_data(&mut self, connection: &Connection) -> flashio::Result<()> {
//!         let line = connection.read_string_by_delimiter("\r\n", 1024)?;
//!         if line == "PING" {
//!             connection.write("PONG\r\n")?;
//!         }
//!         Ok(())
//!     }
//! }
//!
//! let server = Server::bind(ServerConfig::default(), || Pong)?;
//! server.run()?;
//! ```
//!
//! ## Module Overview
//!
//! - [`buffer`]: byte queues, the delimiter scanner and checkpointed queues
//! - [`memory`]: the pooled read segments
//! - [`transport`]: the stage chain, rate limiting and secure transport
//! - [`connection`]: the application-facing connection and handler traits
//! - [`reactor`]: dispatcher threads and the callback worker pool
//! - [`server`]: the acceptor and the timeout watchdog
//! - [`pool`]: the client connection pool
//!
//! ## Design Highlights
//!
//! ### Serialized Callbacks
//!
//! Callbacks of one connection never run concurrently, even on the worker
//! pool. A data event that arrives while one is being handled is coalesced
//! into the running batch.
//!
//! ### Blocking and Non-Blocking Reads
//!
//! The same [`Connection`] serves both styles. A non-blocking read fails
//! with [`Error::BufferUnderflow`] when not enough data is queued; a
//! blocking handle waits up to its timeout. Once the peer has closed and
//! every byte was consumed, reads fail with [`Error::EndOfStream`].

pub mod buffer;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod memory;
pub mod pool;
pub mod reactor;
pub mod server;
mod sync;
pub mod transport;

// Re-export commonly used types for convenience
pub use config::{CallbackMode, ConnectionOptions, Encoding, IoConfig, PoolConfig, ServerConfig};
pub use connection::{Connection, ConnectionStats, Handler, HandlerFactory, ReadMode};
pub use context::IoContext;
pub use error::{Error, Result};
pub use pool::{ConnectionPool, PooledConnection};
pub use server::Server;
pub use transport::{SecureContext, SecureEngine};

/// The default port the demo server listens on
pub const DEFAULT_PORT: u16 = 8090;

/// The default host servers bind to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of flashio
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
