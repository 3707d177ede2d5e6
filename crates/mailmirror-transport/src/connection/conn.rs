//! Buffered transport connection.
//!
//! One `Connection` per remote endpoint: TCP socket or tunnel subprocess,
//! optionally upgraded with TLS and/or DEFLATE mid-session, under a single
//! buffered read/write interface. Reads deliver whole lines or bounded
//! byte ranges; writes queue scatter buffers that flush strictly in order.
//!
//! Suspension is expressed as futures: an operation that cannot complete
//! yet stays pending until the runtime reports readiness. The `try_*`
//! variants never touch the stream and only consult the read buffer.

use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker, ready};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::buffer::{ReadBuffer, Wanted};
use super::config::{Endpoint, ServerConfig};
use super::connect;
use super::deflate::DeflateStream;
use super::queue::{WriteBuf, WriteQueue};
use super::stream::{RawStream, TlsCapable, TransportStream};
use super::tls::{self, TlsInfo};
use crate::{Error, Result};

/// Lifecycle state of a connection.
///
/// Resolution and connect attempts happen inside [`Connection::connect`];
/// a `Connection` value exists from `Connected` onward, so the stream is
/// present exactly while the state says so.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Transport established and usable.
    Connected,
    /// Teardown in progress.
    Closing,
    /// Terminal; every operation fails with [`Error::Closed`].
    Closed,
}

/// A buffered transport connection to one remote endpoint.
pub struct Connection {
    config: Arc<ServerConfig>,
    name: String,
    state: ConnState,
    stream: Option<TransportStream>,
    rbuf: ReadBuffer,
    queue: WriteQueue,
    expect_activity: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("has_stream", &self.stream.is_some())
            .field("expect_activity", &self.expect_activity)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Resolves the endpoint and establishes the transport.
    ///
    /// The configured timeout bounds the whole attempt: resolution plus
    /// every candidate address (or the tunnel spawn). Candidates are tried
    /// in resolver order until one succeeds.
    ///
    /// # Errors
    ///
    /// [`Error::Resolve`] when no candidate address exists,
    /// [`Error::Connect`] when all candidates fail, [`Error::Timeout`]
    /// when the attempt exceeds the configured timeout.
    pub async fn connect(config: Arc<ServerConfig>) -> Result<Self> {
        let (raw, name) = match timeout(config.timeout, connect::establish(&config)).await {
            Ok(done) => done?,
            Err(_) => return Err(Error::Timeout(config.timeout)),
        };
        Ok(Self::from_raw(raw, name, config))
    }

    /// Adopts an already-connected TCP socket.
    pub fn from_tcp(stream: TcpStream, config: Arc<ServerConfig>) -> Self {
        let name = stream
            .peer_addr()
            .map_or_else(|_| "tcp".to_string(), |addr| addr.to_string());
        let _ = stream.set_nodelay(true);
        Self::from_raw(RawStream::Tcp(stream), name, config)
    }

    fn from_raw(raw: RawStream, name: String, config: Arc<ServerConfig>) -> Self {
        Self {
            rbuf: ReadBuffer::with_capacity(config.read_buffer),
            queue: WriteQueue::new(config.max_queued),
            stream: Some(TransportStream::Clear(TlsCapable::Plain(raw))),
            state: ConnState::Connected,
            expect_activity: false,
            name,
            config,
        }
    }

    /// Human-readable endpoint name for diagnostics.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> ConnState {
        self.state
    }

    /// Whether TLS is active.
    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.stream.as_ref().is_some_and(TransportStream::is_tls)
    }

    /// Whether the DEFLATE layer is active.
    #[must_use]
    pub fn is_compressed(&self) -> bool {
        self.stream
            .as_ref()
            .is_some_and(TransportStream::is_compressed)
    }

    /// Bytes buffered and immediately readable.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.rbuf.available()
    }

    /// Outbound bytes queued but not yet accepted by the stream.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.pending()
    }

    /// Upgrades the connection to TLS (STARTTLS flow).
    ///
    /// Valid only while the byte path is plain: before TLS and before
    /// compression, with the write queue drained. The configured timeout
    /// bounds the handshake. Handshake failure (certificate validation
    /// included) closes the connection.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] when TLS is not configured or the byte path
    /// is no longer plain; [`Error::Tls`] / [`Error::Timeout`] on a failed
    /// handshake.
    pub async fn start_tls(&mut self) -> Result<TlsInfo> {
        self.check_open()?;
        let policy = self
            .config
            .tls
            .clone()
            .ok_or_else(|| Error::InvalidState("no TLS policy configured".to_string()))?;
        let server_name = match (&policy.server_name, &self.config.endpoint) {
            (Some(name), _) => name.clone(),
            (None, Endpoint::Net { host, .. }) => host.clone(),
            (None, Endpoint::Tunnel { .. }) => {
                return Err(Error::InvalidState(
                    "tunnel endpoint needs an explicit TLS server name".to_string(),
                ));
            }
        };
        if !self.queue.is_empty() {
            return Err(Error::InvalidState(
                "write queue not drained before TLS handshake".to_string(),
            ));
        }
        let raw = match self.stream.take() {
            Some(TransportStream::Clear(TlsCapable::Plain(raw))) => raw,
            Some(other) => {
                self.stream = Some(other);
                return Err(Error::InvalidState(
                    "TLS or compression already active".to_string(),
                ));
            }
            None => return Err(Error::Closed),
        };
        match timeout(
            self.config.timeout,
            tls::handshake(raw, &server_name, &policy),
        )
        .await
        {
            Ok(Ok((stream, info))) => {
                self.stream = Some(TransportStream::Clear(TlsCapable::Tls(Box::new(stream))));
                Ok(info)
            }
            Ok(Err(e)) => Err(self.fail(e)),
            Err(_) => Err(self.fail(Error::Timeout(self.config.timeout))),
        }
    }

    /// Layers DEFLATE over the current byte path (post-negotiation).
    ///
    /// Takes effect on subsequent I/O; bytes already buffered from before
    /// the switch remain readable as-is.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] when compression is already active or the
    /// write queue is not drained.
    pub fn start_compression(&mut self) -> Result<()> {
        self.check_open()?;
        if !self.queue.is_empty() {
            return Err(Error::InvalidState(
                "write queue not drained before enabling compression".to_string(),
            ));
        }
        match self.stream.take() {
            Some(TransportStream::Clear(inner)) => {
                self.stream = Some(TransportStream::Deflate(DeflateStream::new(inner)));
                tracing::debug!(name = %self.name, "compression enabled");
                Ok(())
            }
            Some(other) => {
                self.stream = Some(other);
                Err(Error::InvalidState("compression already active".to_string()))
            }
            None => Err(Error::Closed),
        }
    }

    /// Extracts one buffered line without touching the stream.
    ///
    /// Returns `Ok(None)` when no complete line is buffered yet; the
    /// caller retries after awaiting readiness (or uses [`read_line`]).
    ///
    /// # Errors
    ///
    /// [`Error::LineTooLong`] when the buffer fills without a terminator.
    ///
    /// [`read_line`]: Self::read_line
    pub fn try_read_line(&mut self) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        self.rbuf.set_wanted(Wanted::Line);
        match self.rbuf.take_line() {
            Ok(line) => Ok(line),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Reads one complete line, filling from the stream as needed.
    ///
    /// The terminator (CRLF or bare LF) is stripped.
    ///
    /// # Errors
    ///
    /// [`Error::LineTooLong`] on framing overflow; [`Error::Timeout`] when
    /// activity was expected but none arrived; I/O errors are fatal.
    pub async fn read_line(&mut self) -> Result<Vec<u8>> {
        self.check_open()?;
        self.rbuf.set_wanted(Wanted::Line);
        loop {
            match self.rbuf.take_line() {
                Ok(Some(line)) => return Ok(line),
                Ok(None) => {}
                Err(e) => return Err(self.fail(e)),
            }
            self.fill().await?;
        }
    }

    /// Extracts between `min` and `max` buffered bytes without touching
    /// the stream. Returns `Ok(None)` when fewer than `min` are buffered.
    ///
    /// # Errors
    ///
    /// [`Error::RequestTooLong`] when `min` exceeds the buffer capacity.
    pub fn try_read_bytes(&mut self, min: usize, max: usize) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        self.rbuf.set_wanted(Wanted::Bytes(min));
        match self.rbuf.take_bytes(min, max) {
            Ok(bytes) => Ok(bytes),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Reads between `min` and `max` bytes, filling from the stream until
    /// at least `min` are available.
    ///
    /// # Errors
    ///
    /// [`Error::RequestTooLong`] when `min` exceeds the buffer capacity;
    /// [`Error::Timeout`] when activity was expected but none arrived.
    pub async fn read_bytes(&mut self, min: usize, max: usize) -> Result<Vec<u8>> {
        self.check_open()?;
        self.rbuf.set_wanted(Wanted::Bytes(min));
        loop {
            match self.rbuf.take_bytes(min, max) {
                Ok(Some(bytes)) => return Ok(bytes),
                Ok(None) => {}
                Err(e) => return Err(self.fail(e)),
            }
            self.fill().await?;
        }
    }

    /// Enqueues scatter buffers and flushes opportunistically.
    ///
    /// Buffers are queued in order; whatever the stream does not accept
    /// immediately stays queued and is resumed by the next `write` or by
    /// [`flushed`]. Completion of an individual buffer is not reported;
    /// [`flushed`] resolves when the whole queue has drained.
    ///
    /// # Errors
    ///
    /// [`Error::WriteQueueOverflow`] when the queued-byte ceiling would be
    /// breached (fatal); I/O errors are fatal.
    ///
    /// [`flushed`]: Self::flushed
    pub fn write<'a, I>(&mut self, bufs: I) -> Result<()>
    where
        I: IntoIterator<Item = WriteBuf<'a>>,
    {
        self.check_open()?;
        for buf in bufs {
            if let Err(e) = self.queue.enqueue(buf) {
                return Err(self.fail(e));
            }
        }
        self.try_flush()
    }

    /// Resolves once every queued byte has been accepted by the stream
    /// and shim/stream buffers are flushed through.
    ///
    /// # Errors
    ///
    /// I/O and compression errors are fatal.
    pub async fn flushed(&mut self) -> Result<()> {
        self.check_open()?;
        let compressed = self.is_compressed();
        let result = {
            let Some(stream) = self.stream.as_mut() else {
                return Err(Error::Closed);
            };
            let queue = &mut self.queue;
            poll_fn(|cx| {
                ready!(queue.poll_drain(cx, &mut *stream))?;
                Pin::new(&mut *stream).poll_flush(cx)
            })
            .await
        };
        result.map_err(|e| {
            let e = map_io(e, compressed);
            self.fail(e)
        })
    }

    /// Arms or disarms the activity timeout: while armed, blocking reads
    /// fail with [`Error::Timeout`] if the peer stays quiet longer than
    /// the configured timeout.
    pub fn expect_activity(&mut self, expect: bool) {
        self.expect_activity = expect;
    }

    /// Declares that roughly `n` bytes are expected next, tuning read
    /// buffering toward one bulk read.
    ///
    /// # Errors
    ///
    /// [`Error::RequestTooLong`] (fatal) when `n` can never fit the
    /// buffer.
    pub fn expect_bytes(&mut self, n: usize) -> Result<()> {
        self.check_open()?;
        let capacity = self.rbuf.capacity();
        if n > capacity {
            return Err(self.fail(Error::RequestTooLong {
                wanted: n,
                capacity,
            }));
        }
        self.rbuf.set_wanted(Wanted::Bytes(n));
        Ok(())
    }

    /// Closes the connection, releasing buffers and shim state.
    ///
    /// Idempotent. Pending data in either direction is dropped; a
    /// best-effort stream shutdown (TLS close_notify included) is bounded
    /// by the configured timeout. Afterwards every operation returns
    /// [`Error::Closed`].
    pub async fn close(&mut self) {
        if self.state == ConnState::Closed {
            return;
        }
        self.state = ConnState::Closing;
        if let Some(mut stream) = self.stream.take() {
            let _ = timeout(self.config.timeout, stream.shutdown()).await;
        }
        self.rbuf.clear();
        self.queue.clear();
        self.state = ConnState::Closed;
        tracing::debug!(name = %self.name, "closed");
    }

    /// Reads at least one byte from the stream into the buffer.
    async fn fill(&mut self) -> Result<()> {
        let activity_timeout = self.expect_activity.then_some(self.config.timeout);
        let compressed = self.is_compressed();
        let result = {
            let Some(stream) = self.stream.as_mut() else {
                return Err(Error::Closed);
            };
            let rbuf = &mut self.rbuf;
            let read = poll_fn(|cx| {
                let n = {
                    let mut rb = ReadBuf::new(rbuf.space_mut());
                    ready!(Pin::new(&mut *stream).poll_read(cx, &mut rb))?;
                    rb.filled().len()
                };
                rbuf.commit(n);
                Poll::Ready(io::Result::Ok(n))
            });
            match activity_timeout {
                Some(limit) => match timeout(limit, read).await {
                    Ok(done) => done,
                    Err(_) => Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "expected activity did not arrive",
                    )),
                },
                None => read.await,
            }
        };
        match result {
            Ok(0) => Err(self.fail(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by peer",
            )))),
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::TimedOut && activity_timeout.is_some() => {
                Err(self.fail(Error::Timeout(self.config.timeout)))
            }
            Err(e) => Err(self.fail(map_io(e, compressed))),
        }
    }

    /// Non-blocking drain attempt after an enqueue; leftovers stay queued.
    fn try_flush(&mut self) -> Result<()> {
        let compressed = self.is_compressed();
        let mut cx = Context::from_waker(Waker::noop());
        let result = {
            let Some(stream) = self.stream.as_mut() else {
                return Err(Error::Closed);
            };
            match self.queue.poll_drain(&mut cx, &mut *stream) {
                Poll::Ready(Err(e)) => Err(e),
                Poll::Ready(Ok(())) => match Pin::new(&mut *stream).poll_flush(&mut cx) {
                    Poll::Ready(Err(e)) => Err(e),
                    Poll::Ready(Ok(())) | Poll::Pending => Ok(()),
                },
                Poll::Pending => Ok(()),
            }
        };
        result.map_err(|e| {
            let e = map_io(e, compressed);
            self.fail(e)
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.state == ConnState::Connected {
            Ok(())
        } else {
            Err(Error::Closed)
        }
    }

    /// Single teardown path for fatal errors: buffers released once,
    /// stream dropped, state terminal.
    fn fail(&mut self, err: Error) -> Error {
        if self.state != ConnState::Closed {
            self.state = ConnState::Closing;
            drop(self.stream.take());
            self.rbuf.clear();
            self.queue.clear();
            self.state = ConnState::Closed;
            tracing::debug!(name = %self.name, error = %err, "connection failed");
        }
        err
    }
}

/// Distinguishes malformed compressed data from other I/O failures.
fn map_io(e: io::Error, compressed: bool) -> Error {
    if compressed && e.kind() == io::ErrorKind::InvalidData {
        Error::Compression(e.to_string())
    } else {
        Error::Io(e)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair(config: &Arc<ServerConfig>) -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) =
            tokio::join!(TcpStream::connect(addr), async {
                listener.accept().await.unwrap().0
            });
        (
            Connection::from_tcp(client.unwrap(), config.clone()),
            accepted,
        )
    }

    fn config() -> Arc<ServerConfig> {
        Arc::new(ServerConfig::new("127.0.0.1", 0))
    }

    #[tokio::test]
    async fn test_read_line_across_fragments() {
        let config = config();
        let (mut conn, mut peer) = pair(&config).await;

        peer.write_all(b"* OK ready").await.unwrap();
        peer.flush().await.unwrap();
        peer.write_all(b"\r\na1 OK done\r\n").await.unwrap();
        peer.flush().await.unwrap();

        assert_eq!(conn.read_line().await.unwrap(), b"* OK ready");
        assert_eq!(conn.read_line().await.unwrap(), b"a1 OK done");
    }

    #[tokio::test]
    async fn test_try_read_line_never_touches_stream() {
        let config = config();
        let (mut conn, _peer) = pair(&config).await;
        // Nothing buffered, nothing read: immediately None.
        assert_eq!(conn.try_read_line().unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_bytes_min_max() {
        let config = config();
        let (mut conn, mut peer) = pair(&config).await;

        peer.write_all(b"0123456789").await.unwrap();
        // Exact minimums make the split deterministic regardless of how
        // the bytes arrive.
        let bytes = conn.read_bytes(6, 6).await.unwrap();
        assert_eq!(bytes, b"012345");
        let bytes = conn.read_bytes(4, 100).await.unwrap();
        assert_eq!(bytes, b"6789");
    }

    #[tokio::test]
    async fn test_line_too_long_is_fatal() {
        let config = Arc::new(
            ServerConfig::builder("127.0.0.1", 0)
                .read_buffer(64)
                .build(),
        );
        let (mut conn, mut peer) = pair(&config).await;

        peer.write_all(&[b'x'; 128]).await.unwrap();
        let err = conn.read_line().await.unwrap_err();
        assert!(matches!(err, Error::LineTooLong { capacity: 64 }));
        assert_eq!(conn.state(), ConnState::Closed);
    }

    #[tokio::test]
    async fn test_queue_ceiling_is_fatal() {
        let config = Arc::new(
            ServerConfig::builder("127.0.0.1", 0)
                .max_queued(32)
                .build(),
        );
        let (mut conn, _peer) = pair(&config).await;

        let err = conn
            .write([WriteBuf::Own(vec![0u8; 64])])
            .unwrap_err();
        assert!(matches!(err, Error::WriteQueueOverflow { limit: 32 }));
        assert_eq!(conn.state(), ConnState::Closed);
    }

    #[tokio::test]
    async fn test_expect_bytes_over_capacity_is_fatal() {
        let config = Arc::new(
            ServerConfig::builder("127.0.0.1", 0)
                .read_buffer(64)
                .build(),
        );
        let (mut conn, _peer) = pair(&config).await;

        let err = conn.expect_bytes(65).unwrap_err();
        assert!(matches!(
            err,
            Error::RequestTooLong {
                wanted: 65,
                capacity: 64
            }
        ));
        assert_eq!(conn.state(), ConnState::Closed);
    }

    #[tokio::test]
    async fn test_operations_after_close() {
        let config = config();
        let (mut conn, _peer) = pair(&config).await;

        conn.close().await;
        assert_eq!(conn.state(), ConnState::Closed);
        assert!(matches!(conn.read_line().await, Err(Error::Closed)));
        assert!(matches!(
            conn.write([WriteBuf::Copy(b"x")]),
            Err(Error::Closed)
        ));
        assert!(matches!(conn.flushed().await, Err(Error::Closed)));
        assert!(matches!(conn.start_tls().await, Err(Error::Closed)));
        assert!(matches!(conn.start_compression(), Err(Error::Closed)));
        // Idempotent.
        conn.close().await;
        assert_eq!(conn.state(), ConnState::Closed);
    }

    #[tokio::test]
    async fn test_peer_eof_is_unexpected_eof() {
        let config = config();
        let (mut conn, peer) = pair(&config).await;
        drop(peer);

        let err = conn.read_line().await.unwrap_err();
        assert!(matches!(err, Error::Io(ref e) if e.kind() == io::ErrorKind::UnexpectedEof));
        assert_eq!(conn.state(), ConnState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expected_activity_timeout() {
        let config = Arc::new(
            ServerConfig::builder("127.0.0.1", 0)
                .timeout(std::time::Duration::from_millis(200))
                .build(),
        );
        let (mut conn, _peer) = pair(&config).await;

        conn.expect_activity(true);
        let err = conn.read_line().await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(conn.state(), ConnState::Closed);
    }

    #[tokio::test]
    async fn test_start_tls_requires_policy() {
        let config = config();
        let (mut conn, _peer) = pair(&config).await;
        assert!(matches!(
            conn.start_tls().await,
            Err(Error::InvalidState(_))
        ));
        // Invalid state is not fatal; the connection stays usable.
        assert_eq!(conn.state(), ConnState::Connected);
    }

    #[tokio::test]
    async fn test_start_compression_only_once() {
        let config = config();
        let (mut conn, _peer) = pair(&config).await;
        conn.start_compression().unwrap();
        assert!(conn.is_compressed());
        assert!(matches!(
            conn.start_compression(),
            Err(Error::InvalidState(_))
        ));
    }
}
