//! Book-keeping for one pooled physical connection.

use crate::connection::Connection;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Idle connections are only handed to callers asking for the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub address: SocketAddr,
    pub secure: bool,
}

/// Why an entry may no longer be handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Expiry {
    Idle,
    Lifetime,
}

#[derive(Debug)]
pub(crate) struct PooledEntry {
    pub(crate) connection: Connection,
    pub(crate) key: PoolKey,
    pub(crate) created_at: Instant,
    pub(crate) last_used_at: Instant,
    pub(crate) usage_count: u64,
    pub(crate) reusable: bool,
}

impl PooledEntry {
    pub(crate) fn new(connection: Connection, key: PoolKey) -> Self {
        let now = Instant::now();
        Self {
            connection,
            key,
            created_at: now,
            last_used_at: now,
            usage_count: 0,
            reusable: true,
        }
    }

    /// Marks the entry as handed out.
    pub(crate) fn checked_out(&mut self) {
        self.usage_count += 1;
        self.last_used_at = Instant::now();
    }

    /// Lifetime is checked before idleness.
    pub(crate) fn expiry(
        &self,
        idle_timeout: Option<Duration>,
        life_timeout: Option<Duration>,
        now: Instant,
    ) -> Option<Expiry> {
        if life_timeout.is_some_and(|t| now.saturating_duration_since(self.created_at) >= t) {
            return Some(Expiry::Lifetime);
        }
        if idle_timeout.is_some_and(|t| now.saturating_duration_since(self.last_used_at) >= t) {
            return Some(Expiry::Idle);
        }
        None
    }

    /// Still connected and allowed back into the pool.
    pub(crate) fn is_healthy(&self) -> bool {
        self.reusable && self.connection.is_open() && !self.connection.is_end_of_stream()
    }
}
