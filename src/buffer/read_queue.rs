//! Incoming byte queue with checkpoint/rollback.
//!
//! While a read mark is set, every segment removed from the queue is also
//! recorded. Resetting to the mark puts the recorded segments back at the
//! head in their original order, so a parser can consume speculatively and
//! roll back without losing a byte.

use super::queue::{coalesce, ByteQueue, Frame};
use super::BufferError;
use bytes::Bytes;

#[derive(Debug, Default)]
pub struct ReadQueue {
    queue: ByteQueue,
    mark: Option<Vec<Bytes>>,
}

impl ReadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, segment: Bytes) {
        self.queue.append(segment);
    }

    pub fn append_all<I>(&mut self, segments: I)
    where
        I: IntoIterator<Item = Bytes>,
    {
        self.queue.append_all(segments);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn insert_version(&self) -> u64 {
        self.queue.insert_version()
    }

    fn record(&mut self, segments: &[Bytes]) {
        if let Some(mark) = self.mark.as_mut() {
            mark.extend(segments.iter().cloned());
        }
    }

    pub fn read(&mut self, len: usize) -> Result<Bytes, BufferError> {
        self.read_segments(len).map(coalesce)
    }

    pub fn read_segments(&mut self, len: usize) -> Result<Vec<Bytes>, BufferError> {
        let segments = self.queue.read_segments(len)?;
        self.record(&segments);
        Ok(segments)
    }

    /// Removes the next delimited frame, returning the data without the
    /// delimiter. `Ok(None)` means no complete frame is queued yet.
    pub fn read_by_delimiter(
        &mut self,
        delimiter: &[u8],
        max: usize,
    ) -> Result<Option<Vec<Bytes>>, BufferError> {
        let Some(Frame { data, delimiter }) = self.queue.read_by_delimiter(delimiter, max)? else {
            return Ok(None);
        };
        self.record(&data);
        self.record(&delimiter);
        Ok(Some(data))
    }

    /// Removes everything currently queued.
    pub fn read_all(&mut self) -> Vec<Bytes> {
        let segments: Vec<Bytes> = self.queue.drain().into();
        self.record(&segments);
        segments
    }

    pub fn index_of(&mut self, delimiter: &[u8], max: usize) -> Result<Option<usize>, BufferError> {
        self.queue.index_of(delimiter, max)
    }

    /// Starts recording consumed bytes. Replaces any existing mark.
    pub fn mark(&mut self) {
        self.mark = Some(Vec::new());
    }

    pub fn is_marked(&self) -> bool {
        self.mark.is_some()
    }

    /// Restores every byte consumed since the mark and removes the mark.
    ///
    /// Returns false if no mark was set.
    pub fn reset_to_mark(&mut self) -> bool {
        match self.mark.take() {
            Some(consumed) => {
                self.queue.add_first(consumed);
                true
            }
            None => false,
        }
    }

    pub fn remove_mark(&mut self) {
        self.mark = None;
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.mark = None;
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.queue.to_vec()
    }
}
