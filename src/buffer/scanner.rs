//! Resumable Delimiter Scanner
//!
//! The scanner runs Knuth-Morris-Pratt over a sequence of segments and keeps
//! its automaton state in a [`ScanCursor`]. When a search ends without a
//! match, the cursor remembers how many bytes were examined and how much of
//! the delimiter the tail of the data already matches. Handing that cursor
//! back to [`find`] after more segments were appended continues exactly
//! where the previous scan stopped, so a delimiter split across two socket
//! reads is still found and already-examined bytes are never scanned twice.
//!
//! ```text
//!   segments:  [ ..."PI" ][ "NG\r" ][ "\n"... ]
//!                      ▲            ▲
//!   first scan ends ───┘            │ partial_match = 1 ("\r")
//!   second scan resumes here ───────┘
//! ```

use super::BufferError;
use bytes::Bytes;
use std::collections::VecDeque;

/// State of an incremental search for one delimiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanCursor {
    delimiter: Bytes,
    failure: Vec<usize>,
    bytes_scanned: usize,
    partial_match: usize,
    found: bool,
    match_offset: usize,
}

impl ScanCursor {
    fn new(delimiter: &[u8]) -> Self {
        Self {
            delimiter: Bytes::copy_from_slice(delimiter),
            failure: failure_table(delimiter),
            bytes_scanned: 0,
            partial_match: 0,
            found: false,
            match_offset: 0,
        }
    }

    pub fn delimiter(&self) -> &[u8] {
        &self.delimiter
    }

    /// Number of bytes examined so far.
    pub fn bytes_scanned(&self) -> usize {
        self.bytes_scanned
    }

    /// Length of the delimiter prefix matched by the tail of the scanned bytes.
    pub fn partial_match(&self) -> usize {
        self.partial_match
    }

    pub fn is_found(&self) -> bool {
        self.found
    }

    /// Offset of the first delimiter byte, if found.
    pub fn match_offset(&self) -> Option<usize> {
        self.found.then_some(self.match_offset)
    }

    /// Applies a length bound to the scan result.
    ///
    /// Returns the match offset if the delimiter was found within `max`
    /// bytes, `None` if it may still arrive, and `MaxSizeExceeded` once more
    /// than `max` bytes precede any possible match.
    pub fn check_bound(&self, max: usize) -> Result<Option<usize>, BufferError> {
        if self.found {
            if self.match_offset > max {
                return Err(BufferError::MaxSizeExceeded { max });
            }
            return Ok(Some(self.match_offset));
        }

        if self.bytes_scanned - self.partial_match > max {
            return Err(BufferError::MaxSizeExceeded { max });
        }
        Ok(None)
    }
}

/// KMP failure function: `table[i]` is the length of the longest proper
/// prefix of `pattern[..=i]` that is also its suffix.
fn failure_table(pattern: &[u8]) -> Vec<usize> {
    let mut table = vec![0; pattern.len()];
    let mut k = 0;
    for i in 1..pattern.len() {
        while k > 0 && pattern[i] != pattern[k] {
            k = table[k - 1];
        }
        if pattern[i] == pattern[k] {
            k += 1;
        }
        table[i] = k;
    }
    table
}

/// Searches `segments` for `delimiter`.
///
/// A `previous` cursor for the same delimiter resumes at its
/// `bytes_scanned` position. It is only valid if the segments have not been
/// mutated since, except by appending.
pub fn find<'a, I>(
    segments: I,
    delimiter: &[u8],
    previous: Option<ScanCursor>,
) -> Result<ScanCursor, BufferError>
where
    I: IntoIterator<Item = &'a Bytes>,
{
    if delimiter.is_empty() {
        return Err(BufferError::EmptyDelimiter);
    }

    let mut cursor = match previous {
        Some(cursor) if cursor.delimiter[..] == *delimiter => cursor,
        _ => ScanCursor::new(delimiter),
    };
    if cursor.found {
        return Ok(cursor);
    }

    let mut offset = 0;
    for segment in segments {
        let end = offset + segment.len();
        if end <= cursor.bytes_scanned {
            offset = end;
            continue;
        }

        let start = cursor.bytes_scanned - offset;
        let mut matched = cursor.partial_match;
        for (i, &byte) in segment[start..].iter().enumerate() {
            while matched > 0 && cursor.delimiter[matched] != byte {
                matched = cursor.failure[matched - 1];
            }
            if cursor.delimiter[matched] == byte {
                matched += 1;
            }
            if matched == cursor.delimiter.len() {
                let consumed = offset + start + i + 1;
                cursor.bytes_scanned = consumed;
                cursor.partial_match = matched;
                cursor.found = true;
                cursor.match_offset = consumed - matched;
                return Ok(cursor);
            }
        }

        cursor.partial_match = matched;
        cursor.bytes_scanned = end;
        offset = end;
    }

    Ok(cursor)
}

/// Removes the first `len` bytes from `segments` and returns them as slices.
///
/// The boundary segment is split, never copied; its remainder stays at the
/// head of `segments`.
pub fn extract(segments: &mut VecDeque<Bytes>, mut len: usize) -> Vec<Bytes> {
    let mut extracted = Vec::new();
    while len > 0 {
        let Some(mut segment) = segments.pop_front() else {
            break;
        };
        if segment.len() > len {
            extracted.push(segment.split_to(len));
            segments.push_front(segment);
            break;
        }
        len -= segment.len();
        extracted.push(segment);
    }
    extracted
}
