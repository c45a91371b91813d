//! Outgoing staging queue with a rewindable write mark.
//!
//! Bytes written by the application are staged here until they are flushed
//! into the transport chain. A write mark remembers the staged length at
//! the time it was set; resetting to it discards everything written since.

use super::queue::ByteQueue;
use bytes::Bytes;
use std::collections::VecDeque;

#[derive(Debug, Default)]
pub struct WriteQueue {
    staged: ByteQueue,
    mark: Option<usize>,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, segment: Bytes) {
        self.staged.append(segment);
    }

    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// Takes every staged segment and clears the mark.
    pub fn take_all(&mut self) -> VecDeque<Bytes> {
        self.mark = None;
        self.staged.drain()
    }

    pub fn mark(&mut self) {
        self.mark = Some(self.staged.len());
    }

    pub fn is_marked(&self) -> bool {
        self.mark.is_some()
    }

    /// Discards bytes staged after the mark and removes it.
    ///
    /// Returns false if no mark was set.
    pub fn reset_to_mark(&mut self) -> bool {
        match self.mark.take() {
            Some(len) => {
                self.staged.truncate(len);
                true
            }
            None => false,
        }
    }

    pub fn remove_mark(&mut self) {
        self.mark = None;
    }

    pub fn clear(&mut self) {
        self.staged.clear();
        self.mark = None;
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.staged.to_vec()
    }
}
