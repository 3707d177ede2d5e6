//! Bounded read buffer with line and byte-count extraction.
//!
//! The buffer has a fixed capacity that doubles as the framing limit: the
//! longest line (or byte-count request) the transport will ever hand to the
//! protocol layer. It never grows; running out of room is a framing error,
//! not an allocation event.

use crate::{Error, Result};

/// Threshold below which a trailing free region is considered too small to
/// bother reading into; valid bytes are slid to the front first.
const MIN_BULK_READ: usize = 1000;

/// What the pending read is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wanted {
    /// A complete terminator-delimited line.
    Line,
    /// At least this many bytes.
    Bytes(usize),
}

/// Fixed-capacity read buffer.
///
/// Valid bytes live at `start .. start + len`. The scan cursor records how
/// far terminator scanning has progressed (relative to `start`), so bytes
/// are examined at most once no matter how many times a partial line is
/// retried.
pub(crate) struct ReadBuffer {
    buf: Box<[u8]>,
    start: usize,
    len: usize,
    scan: usize,
    wanted: Wanted,
}

impl ReadBuffer {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity].into_boxed_slice(),
            start: 0,
            len: 0,
            scan: 0,
            wanted: Wanted::Line,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Number of buffered bytes not yet consumed.
    pub(crate) fn available(&self) -> usize {
        self.len
    }

    pub(crate) fn set_wanted(&mut self, wanted: Wanted) {
        self.wanted = wanted;
    }

    /// How many more bytes are needed before the pending read could
    /// complete. Always at least one; a line's length is unknowable.
    pub(crate) fn needed(&self) -> usize {
        match self.wanted {
            Wanted::Line => 1,
            Wanted::Bytes(n) => n.saturating_sub(self.len).max(1),
        }
    }

    /// Extracts one complete line, with the LF (and a preceding CR, if any)
    /// stripped. Returns `Ok(None)` when no terminator is buffered yet.
    ///
    /// A full buffer with no terminator in it means the line cannot fit and
    /// the framing contract is broken.
    pub(crate) fn take_line(&mut self) -> Result<Option<Vec<u8>>> {
        let valid = &self.buf[self.start..self.start + self.len];
        if let Some(pos) = valid[self.scan..].iter().position(|&b| b == b'\n') {
            let nl = self.scan + pos;
            let mut end = nl;
            if end > 0 && valid[end - 1] == b'\r' {
                end -= 1;
            }
            let line = valid[..end].to_vec();
            self.consume(nl + 1);
            return Ok(Some(line));
        }
        self.scan = self.len;
        if self.len == self.capacity() {
            return Err(Error::LineTooLong {
                capacity: self.capacity(),
            });
        }
        Ok(None)
    }

    /// Extracts between `min` and `max` buffered bytes, or `Ok(None)` when
    /// fewer than `min` are buffered. Never touches the underlying stream.
    pub(crate) fn take_bytes(&mut self, min: usize, max: usize) -> Result<Option<Vec<u8>>> {
        if min > self.capacity() {
            return Err(Error::RequestTooLong {
                wanted: min,
                capacity: self.capacity(),
            });
        }
        if self.len < min {
            return Ok(None);
        }
        let n = self.len.min(max);
        let out = self.buf[self.start..self.start + n].to_vec();
        self.consume(n);
        Ok(Some(out))
    }

    /// Free region to read into. Valid bytes are compacted to the front when
    /// the tail cannot hold what the pending read still needs (or a
    /// worthwhile bulk read); compaction is bookkeeping, never growth.
    pub(crate) fn space_mut(&mut self) -> &mut [u8] {
        let tail_free = self.buf.len() - self.start - self.len;
        let want = self
            .needed()
            .max(MIN_BULK_READ)
            .min(self.buf.len() - self.len);
        if self.start > 0 && tail_free < want {
            self.buf.copy_within(self.start..self.start + self.len, 0);
            self.start = 0;
        }
        &mut self.buf[self.start + self.len..]
    }

    /// Marks `n` bytes (just read into [`Self::space_mut`]) as valid.
    pub(crate) fn commit(&mut self, n: usize) {
        debug_assert!(self.start + self.len + n <= self.buf.len());
        self.len += n;
    }

    pub(crate) fn clear(&mut self) {
        self.start = 0;
        self.len = 0;
        self.scan = 0;
        self.wanted = Wanted::Line;
    }

    fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.len);
        self.start += n;
        self.len -= n;
        self.scan = self.scan.saturating_sub(n);
        if self.len == 0 {
            self.start = 0;
        }
    }

    #[cfg(test)]
    pub(crate) fn scan_pos(&self) -> usize {
        self.scan
    }
}
