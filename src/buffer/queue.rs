//! Segment Queue
//!
//! [`ByteQueue`] holds pending bytes as an ordered list of `Bytes` segments.
//! Appending is O(1), reads split segments without copying unless a
//! fixed-length read spans several of them.
//!
//! The queue caches the [`ScanCursor`] of the last delimiter search. The
//! cache survives appends (new bytes only extend the scanned region) and is
//! dropped by every other mutation, so a stale cursor can never be applied
//! to data it did not scan.

use super::scanner::{self, ScanCursor};
use super::BufferError;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::VecDeque;

/// A delimited frame removed from a queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    /// Bytes preceding the delimiter
    pub data: Vec<Bytes>,
    /// The delimiter bytes themselves
    pub delimiter: Vec<Bytes>,
}

impl Frame {
    pub fn len(&self) -> usize {
        self.data.iter().map(Bytes::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.data.iter().all(Bytes::is_empty)
    }

    /// Joins the frame data into one contiguous buffer.
    pub fn into_bytes(self) -> Bytes {
        coalesce(self.data)
    }
}

/// Joins segments, copying only when there is more than one.
pub(crate) fn coalesce(mut segments: Vec<Bytes>) -> Bytes {
    match segments.len() {
        0 => Bytes::new(),
        1 => segments.pop().unwrap_or_default(),
        _ => {
            let total = segments.iter().map(Bytes::len).sum();
            let mut joined = BytesMut::with_capacity(total);
            for segment in &segments {
                joined.put_slice(segment);
            }
            joined.freeze()
        }
    }
}

/// Ordered queue of byte segments.
#[derive(Debug, Default, Clone)]
pub struct ByteQueue {
    segments: VecDeque<Bytes>,
    size: usize,
    insert_version: u64,
    cursor: Option<ScanCursor>,
}

impl ByteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a segment. Empty segments are ignored.
    pub fn append(&mut self, segment: Bytes) {
        if segment.is_empty() {
            return;
        }
        self.size += segment.len();
        self.segments.push_back(segment);
        self.insert_version += 1;
    }

    pub fn append_all<I>(&mut self, segments: I)
    where
        I: IntoIterator<Item = Bytes>,
    {
        for segment in segments {
            self.append(segment);
        }
    }

    /// Total number of queued bytes.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Counter bumped on every append.
    pub fn insert_version(&self) -> u64 {
        self.insert_version
    }

    /// Detaches every segment, leaving the queue empty.
    pub fn drain(&mut self) -> VecDeque<Bytes> {
        self.size = 0;
        self.cursor = None;
        std::mem::take(&mut self.segments)
    }

    /// Re-attaches segments at the head, preserving their order.
    pub fn add_first<I>(&mut self, segments: I)
    where
        I: IntoIterator<Item = Bytes>,
        I::IntoIter: DoubleEndedIterator,
    {
        self.cursor = None;
        for segment in segments.into_iter().rev() {
            if !segment.is_empty() {
                self.size += segment.len();
                self.segments.push_front(segment);
            }
        }
    }

    /// Removes exactly `len` bytes, coalescing across segments if needed.
    pub fn read(&mut self, len: usize) -> Result<Bytes, BufferError> {
        self.read_segments(len).map(coalesce)
    }

    /// Removes exactly `len` bytes as zero-copy slices.
    pub fn read_segments(&mut self, len: usize) -> Result<Vec<Bytes>, BufferError> {
        if len > self.size {
            return Err(BufferError::Underflow {
                requested: len,
                available: self.size,
            });
        }
        Ok(self.take(len))
    }

    fn take(&mut self, len: usize) -> Vec<Bytes> {
        self.cursor = None;
        self.size -= len;
        scanner::extract(&mut self.segments, len)
    }

    /// Position of `delimiter`, searching at most `max` bytes ahead.
    ///
    /// Returns `Ok(None)` if the delimiter may still arrive. Repeated calls
    /// with the same delimiter only scan bytes appended since the last call.
    pub fn index_of(&mut self, delimiter: &[u8], max: usize) -> Result<Option<usize>, BufferError> {
        let cursor = scanner::find(&self.segments, delimiter, self.cursor.take())?;
        let bound = cursor.check_bound(max);
        self.cursor = Some(cursor);
        bound
    }

    /// Removes the next frame terminated by `delimiter`.
    ///
    /// Returns `Ok(None)` if no complete frame is queued yet. On
    /// `MaxSizeExceeded` nothing is removed.
    pub fn read_by_delimiter(
        &mut self,
        delimiter: &[u8],
        max: usize,
    ) -> Result<Option<Frame>, BufferError> {
        let Some(offset) = self.index_of(delimiter, max)? else {
            return Ok(None);
        };
        let data = self.take(offset);
        let delimiter = self.take(delimiter.len());
        Ok(Some(Frame { data, delimiter }))
    }

    /// Keeps the first `len` bytes and drops the rest.
    pub fn truncate(&mut self, len: usize) {
        if len >= self.size {
            return;
        }
        self.cursor = None;
        let mut kept = 0;
        let mut retained = VecDeque::with_capacity(self.segments.len());
        while kept < len {
            let Some(mut segment) = self.segments.pop_front() else {
                break;
            };
            if kept + segment.len() > len {
                segment.truncate(len - kept);
            }
            kept += segment.len();
            retained.push_back(segment);
        }
        self.segments = retained;
        self.size = kept;
    }

    pub fn clear(&mut self) {
        self.drain();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bytes> {
        self.segments.iter()
    }

    /// Copies the queued bytes into one vector without consuming them.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size);
        for segment in &self.segments {
            out.extend_from_slice(segment);
        }
        out
    }
}
