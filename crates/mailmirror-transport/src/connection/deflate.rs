//! Streaming DEFLATE layer (IMAP COMPRESS, RFC 4978 / RFC 1951).
//!
//! Raw deflate streams in both directions, no zlib framing. Inbound and
//! outbound state are independent: compressed bytes from the stream are
//! staged and inflated on demand, outbound bytes are deflated into a
//! pending buffer that drains to the stream opportunistically.
//!
//! One stream read can stage input for many decompressed reads, and the
//! decoder can hold producible state while the fd is quiet. `poll_read`
//! therefore serves from staged input without polling the underlying
//! stream, so consumption is re-driven until the staging buffer runs dry —
//! the async rendition of a synthesized readiness event.

#![allow(clippy::cast_possible_truncation)]

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Capacity of the inbound compressed staging buffer.
const STAGING_SIZE: usize = 64 * 1024;

/// Pending deflated output above which writes stop accepting input until
/// the stream drains.
const OUT_LIMIT: usize = 64 * 1024;

/// Fixed staging buffer for compressed bytes pulled off the stream.
struct Staging {
    buf: Box<[u8]>,
    start: usize,
    len: usize,
}

impl Staging {
    fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity].into_boxed_slice(),
            start: 0,
            len: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn data(&self) -> &[u8] {
        &self.buf[self.start..self.start + self.len]
    }

    fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.len);
        self.start += n;
        self.len -= n;
        if self.len == 0 {
            self.start = 0;
        }
    }

    fn space_mut(&mut self) -> &mut [u8] {
        if self.start > 0 && self.start + self.len == self.buf.len() {
            self.buf.copy_within(self.start..self.start + self.len, 0);
            self.start = 0;
        }
        &mut self.buf[self.start + self.len..]
    }

    fn commit(&mut self, n: usize) {
        debug_assert!(self.start + self.len + n <= self.buf.len());
        self.len += n;
    }
}

/// DEFLATE transform over any byte stream.
pub(crate) struct DeflateStream<S> {
    inner: S,
    enc: Compress,
    dec: Decompress,
    /// Compressed input staged from the stream, pending inflation.
    staging: Staging,
    /// Deflated output pending delivery to the stream.
    out: Vec<u8>,
    out_pos: usize,
    /// Input was deflated since the last sync flush.
    dirty: bool,
}

impl<S> DeflateStream<S> {
    pub(crate) fn new(inner: S) -> Self {
        Self {
            inner,
            enc: Compress::new(Compression::default(), false),
            dec: Decompress::new(false),
            staging: Staging::new(STAGING_SIZE),
            out: Vec::new(),
            out_pos: 0,
            dirty: false,
        }
    }

    pub(crate) fn get_ref(&self) -> &S {
        &self.inner
    }

    fn pending_out(&self) -> usize {
        self.out.len() - self.out_pos
    }

    /// Deflates all of `data` into the pending output buffer.
    fn deflate_all(&mut self, data: &[u8]) -> io::Result<()> {
        let mut consumed = 0;
        while consumed < data.len() {
            self.out.reserve((data.len() - consumed) / 2 + 256);
            let before = self.enc.total_in();
            self.enc
                .compress_vec(&data[consumed..], &mut self.out, FlushCompress::None)
                .map_err(io::Error::other)?;
            consumed += (self.enc.total_in() - before) as usize;
        }
        self.dirty = true;
        Ok(())
    }

    /// Emits a deflate sync flush so everything written so far becomes
    /// decodable by the peer without ending the stream.
    fn sync_flush(&mut self) -> io::Result<()> {
        loop {
            self.out.reserve(64);
            let before = self.enc.total_out();
            self.enc
                .compress_vec(&[], &mut self.out, FlushCompress::Sync)
                .map_err(io::Error::other)?;
            if self.enc.total_out() == before {
                return Ok(());
            }
        }
    }
}

impl<S> DeflateStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Pushes pending deflated output to the stream, resuming from the
    /// exact offset of the last partial write.
    fn drain_out(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.out_pos < self.out.len() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.out[self.out_pos..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "stream accepted no bytes",
                )));
            }
            self.out_pos += n;
        }
        self.out.clear();
        self.out_pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S> AsyncRead for DeflateStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        loop {
            // Inflate staged input first; the stream is only polled once
            // the decoder cannot produce anything more from it.
            if !this.staging.is_empty() {
                let out = buf.initialize_unfilled();
                let before_in = this.dec.total_in();
                let before_out = this.dec.total_out();
                let status = this
                    .dec
                    .decompress(this.staging.data(), out, FlushDecompress::None)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                let consumed = (this.dec.total_in() - before_in) as usize;
                let produced = (this.dec.total_out() - before_out) as usize;
                this.staging.consume(consumed);
                if produced > 0 {
                    buf.advance(produced);
                    return Poll::Ready(Ok(()));
                }
                if status == Status::StreamEnd {
                    return Poll::Ready(Ok(()));
                }
            }
            let mut rb = ReadBuf::new(this.staging.space_mut());
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut rb))?;
            let n = rb.filled().len();
            if n == 0 {
                if this.staging.is_empty() {
                    return Poll::Ready(Ok(()));
                }
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "truncated deflate stream",
                )));
            }
            this.staging.commit(n);
        }
    }
}

impl<S> AsyncWrite for DeflateStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.pending_out() > OUT_LIMIT {
            ready!(this.drain_out(cx))?;
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        this.deflate_all(buf)?;
        // Opportunistic drain; leftover output is picked up by the next
        // write or flush.
        if let Poll::Ready(Err(e)) = this.drain_out(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.dirty {
            this.sync_flush()?;
            this.dirty = false;
        }
        ready!(this.drain_out(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.as_mut().poll_flush(cx))?;
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
