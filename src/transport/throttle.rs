//! Rate-limited write stage.
//!
//! A token bucket paced in [`RELEASE_INTERVAL`] steps. Allowance accrues at
//! `bytes_per_sec`, starts empty and is capped at one second's worth, so a
//! connection that was quiet for a while cannot burst far above its rate.

use super::chain::{StageKind, Transform};
use crate::buffer::ByteQueue;
use crate::error::Result;
use bytes::Bytes;
use std::time::{Duration, Instant};

/// How often buffered bytes are released to the successor.
pub const RELEASE_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub struct ThrottledWrite {
    bytes_per_sec: u32,
    allowance: f64,
    last_refill: Instant,
    pending: ByteQueue,
    incoming: Vec<Bytes>,
    open: bool,
}

impl ThrottledWrite {
    pub fn new(bytes_per_sec: u32, now: Instant) -> Self {
        Self {
            bytes_per_sec: bytes_per_sec.max(1),
            allowance: 0.0,
            last_refill: now,
            pending: ByteQueue::new(),
            incoming: Vec::new(),
            open: true,
        }
    }

    pub fn rate(&self) -> u32 {
        self.bytes_per_sec
    }

    /// Changes the rate. Buffered bytes are kept.
    pub fn set_rate(&mut self, bytes_per_sec: u32) {
        self.bytes_per_sec = bytes_per_sec.max(1);
        self.allowance = self.allowance.min(self.bytes_per_sec as f64);
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }
        let rate = self.bytes_per_sec as f64;
        self.allowance = (self.allowance + elapsed.as_secs_f64() * rate).min(rate);
        self.last_refill = now;
    }
}

impl Transform for ThrottledWrite {
    fn kind(&self) -> StageKind {
        StageKind::Throttle
    }

    fn write_outgoing(&mut self, data: Vec<Bytes>, _now: Instant) -> Result<()> {
        self.pending.append_all(data);
        Ok(())
    }

    fn take_outgoing(&mut self, now: Instant) -> Vec<Bytes> {
        if self.pending.is_empty() {
            return Vec::new();
        }
        self.refill(now);
        let release = (self.allowance.floor() as usize).min(self.pending.len());
        if release == 0 {
            return Vec::new();
        }
        self.allowance -= release as f64;
        self.pending.read_segments(release).unwrap_or_default()
    }

    fn flush_outgoing(&mut self) -> Vec<Bytes> {
        self.pending.drain().into()
    }

    // Only the write direction is paced.
    fn receive_incoming(&mut self, data: Vec<Bytes>) -> Result<()> {
        self.incoming.extend(data);
        Ok(())
    }

    fn drain_incoming(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.incoming)
    }

    fn pending_outgoing(&self) -> usize {
        self.pending.len()
    }

    fn next_release(&self) -> Option<Instant> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.last_refill + RELEASE_INTERVAL)
        }
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
