//! Connection Pool Module
//!
//! Client-side caching of idle connections:
//!
//! - [`ConnectionPool`]: admission control, idle reuse, eviction watchdog
//! - [`PooledConnection`]: the handle a caller holds while a connection is
//!   checked out; it dereferences to [`Connection`](crate::Connection)
//!
//! ## Example
//!
//! ```ignore
//! use flashio::pool::ConnectionPool;
//! use flashio::PoolConfig;
//!
//! let pool = ConnectionPool::new(PoolConfig::default())?;
//! let connection = pool.get("127.0.0.1:8090".parse()?, None)?;
//! connection.write("PING\r\n")?;
//! connection.close(); // back to the pool
//! ```

pub mod cache;
mod entry;
mod proxy;

pub use cache::{ConnectionPool, PoolStats};
pub use entry::PoolKey;
pub use proxy::PooledConnection;
