//! Outbound write queue with coalescing chunks and a memory ceiling.
//!
//! Small writes accumulate into a shared chunk to keep syscall counts down;
//! large owned buffers are queued as-is without copying. Chunks drain to the
//! stream strictly in enqueue order, resuming partial writes from the exact
//! byte where the stream last stopped.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::AsyncWrite;

use crate::{Error, Result};

/// Capacity of the accumulating chunk; also the cutoff above which a buffer
/// is queued standalone instead of being copied in.
const CHUNK_SIZE: usize = 8 * 1024;

/// One buffer handed to [`Connection::write`](super::Connection::write).
///
/// The tag settles who owns the bytes: `Copy` leaves the caller's buffer
/// untouched (the queue copies what it needs before returning), `Own` moves
/// the allocation into the queue, which releases it exactly once after the
/// bytes are flushed or the connection closes.
#[derive(Debug)]
pub enum WriteBuf<'a> {
    /// Borrowed bytes, copied into the queue's own storage.
    Copy(&'a [u8]),
    /// Caller-allocated bytes; the queue takes ownership.
    Own(Vec<u8>),
}

impl WriteBuf<'_> {
    /// Byte length of the buffer.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            WriteBuf::Copy(b) => b.len(),
            WriteBuf::Own(v) => v.len(),
        }
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// FIFO queue of outbound chunks.
pub(crate) struct WriteQueue {
    /// Chunk currently accepting small appends.
    accum: BytesMut,
    /// Sealed chunks, drained front to back. The front chunk is advanced
    /// in place on partial writes, so it is always the exact unsent tail.
    fifo: VecDeque<Bytes>,
    /// Total unsent bytes, accumulator included.
    queued: usize,
    /// Ceiling on `queued`; breaching it is fatal.
    limit: usize,
}

impl WriteQueue {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            accum: BytesMut::new(),
            fifo: VecDeque::new(),
            queued: 0,
            limit,
        }
    }

    /// Total unsent bytes currently queued.
    pub(crate) fn pending(&self) -> usize {
        self.queued
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queued == 0
    }

    /// Enqueues one buffer, coalescing small ones into the accumulating
    /// chunk. Fails (without queueing anything from this buffer) when the
    /// ceiling would be breached.
    pub(crate) fn enqueue(&mut self, buf: WriteBuf<'_>) -> Result<()> {
        let len = buf.len();
        if len == 0 {
            return Ok(());
        }
        if self.queued + len > self.limit {
            return Err(Error::WriteQueueOverflow { limit: self.limit });
        }
        match buf {
            WriteBuf::Own(v) if v.len() >= CHUNK_SIZE => {
                // Big owned buffer: no copy, but seal first so order holds.
                self.seal();
                self.fifo.push_back(Bytes::from(v));
            }
            WriteBuf::Own(v) => self.append(&v),
            WriteBuf::Copy(b) if b.len() >= CHUNK_SIZE => {
                self.seal();
                self.fifo.push_back(Bytes::copy_from_slice(b));
            }
            WriteBuf::Copy(b) => self.append(b),
        }
        self.queued += len;
        Ok(())
    }

    fn append(&mut self, bytes: &[u8]) {
        if self.accum.len() + bytes.len() > CHUNK_SIZE {
            self.seal();
        }
        if self.accum.capacity() == 0 {
            self.accum.reserve(CHUNK_SIZE);
        }
        self.accum.extend_from_slice(bytes);
    }

    /// Moves the accumulating chunk onto the FIFO.
    fn seal(&mut self) {
        if !self.accum.is_empty() {
            let chunk = self.accum.split().freeze();
            self.fifo.push_back(chunk);
        }
    }

    /// Drives the queue toward empty. Returns `Ready(Ok(()))` only once
    /// every queued byte (accumulator included) has been accepted by the
    /// stream; a partial write leaves the front chunk advanced so the next
    /// call resumes at the right offset.
    pub(crate) fn poll_drain<S>(
        &mut self,
        cx: &mut Context<'_>,
        stream: &mut S,
    ) -> Poll<io::Result<()>>
    where
        S: AsyncWrite + Unpin,
    {
        loop {
            if self.fifo.is_empty() {
                if self.accum.is_empty() {
                    return Poll::Ready(Ok(()));
                }
                self.seal();
            }
            let Some(front) = self.fifo.front_mut() else {
                return Poll::Ready(Ok(()));
            };
            let n = ready!(Pin::new(&mut *stream).poll_write(cx, front.chunk()))?;
            if n == 0 {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "stream accepted no bytes",
                )));
            }
            front.advance(n);
            self.queued -= n;
            if front.is_empty() {
                self.fifo.pop_front();
            }
        }
    }

    /// Drops every queued chunk. Owned buffers are released here if the
    /// connection closes before they are flushed.
    pub(crate) fn clear(&mut self) {
        self.accum = BytesMut::new();
        self.fifo.clear();
        self.queued = 0;
    }
}
