//! The handle callers hold while a pooled connection is checked out.

use super::cache::PoolInner;
use super::entry::PooledEntry;
use crate::connection::Connection;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Instant;

/// A checked-out pooled connection.
///
/// Dereferences to the underlying [`Connection`]. Closing or dropping the
/// handle returns the connection to the pool; [`destroy`](Self::destroy)
/// closes it for good.
pub struct PooledConnection {
    connection: Connection,
    entry: Option<PooledEntry>,
    pool: Arc<PoolInner>,
}

impl PooledConnection {
    pub(crate) fn new(entry: PooledEntry, pool: Arc<PoolInner>) -> Self {
        Self {
            connection: entry.connection.clone(),
            entry: Some(entry),
            pool,
        }
    }

    /// Gives the connection back to the pool.
    pub fn close(mut self) {
        if let Some(entry) = self.entry.take() {
            self.pool.release(entry);
        }
    }

    /// Closes the physical connection instead of returning it.
    pub fn destroy(mut self) {
        if let Some(entry) = self.entry.take() {
            self.pool.destroy(entry);
        }
    }

    /// With `false`, the connection is destroyed when this handle is
    /// closed or dropped.
    pub fn set_reusable(&mut self, reusable: bool) {
        if let Some(entry) = self.entry.as_mut() {
            entry.reusable = reusable;
        }
    }

    pub fn is_reusable(&self) -> bool {
        self.entry.as_ref().is_some_and(|entry| entry.reusable)
    }

    /// How many times the physical connection has been checked out.
    pub fn usage_count(&self) -> u64 {
        self.entry.as_ref().map_or(0, |entry| entry.usage_count)
    }

    /// When the physical connection was opened.
    pub fn pooled_since(&self) -> Instant {
        self.entry
            .as_ref()
            .map_or_else(|| self.connection.created_at(), |entry| entry.created_at)
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.connection
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            self.pool.release(entry);
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.entry {
            Some(entry) => f
                .debug_struct("PooledConnection")
                .field("connection", &entry.connection)
                .field("key", &entry.key)
                .field("usage_count", &entry.usage_count)
                .finish(),
            None => f.write_str("PooledConnection(released)"),
        }
    }
}
