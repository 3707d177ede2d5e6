//! # mailmirror-transport
//!
//! The transport layer of the mailmirror IMAP-to-maildir synchronizer: a
//! buffered, non-blocking connection engine that multiplexes plain,
//! TLS-encrypted, and optionally DEFLATE-compressed byte streams under one
//! read/write interface.
//!
//! The protocol layer above this crate speaks in lines and byte ranges; it
//! never sees sockets, handshakes, or compression state. This crate owns:
//!
//! - **Resolution and connecting**: a host/port resolves to an ordered
//!   candidate list tried one by one; a tunnel command spawns a subprocess
//!   whose stdio pair becomes the transport.
//! - **Read buffering**: a fixed-capacity buffer accumulates partial reads
//!   into whole lines or bounded byte ranges; the capacity doubles as the
//!   framing limit, and a scan cursor keeps repeated partial-line attempts
//!   linear in total bytes.
//! - **Write queueing**: scatter buffers coalesce into chunks that flush
//!   strictly in order, resuming partial writes where they stopped, under
//!   a hard queued-byte ceiling.
//! - **TLS and DEFLATE layering**: `start_tls` and `start_compression`
//!   insert byte-stream transforms mid-connection without changing the
//!   interface above them.
//!
//! ## Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use mailmirror_transport::{Connection, ServerConfig, TlsPolicy, WriteBuf};
//!
//! #[tokio::main]
//! async fn main() -> mailmirror_transport::Result<()> {
//!     let config = Arc::new(
//!         ServerConfig::builder("imap.example.com", 143)
//!             .tls(TlsPolicy::default())
//!             .build(),
//!     );
//!
//!     let mut conn = Connection::connect(config).await?;
//!     let greeting = conn.read_line().await?;
//!     println!("{}", String::from_utf8_lossy(&greeting));
//!
//!     conn.write([WriteBuf::Copy(b"a1 STARTTLS\r\n")])?;
//!     conn.flushed().await?;
//!     let _ = conn.read_line().await?;
//!     let info = conn.start_tls().await?;
//!     println!("TLS {:?}, verified: {}", info.version, info.verified);
//!
//!     conn.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Concurrency model
//!
//! A `Connection` is driven from a single task; operations take `&mut
//! self` and never run concurrently with themselves. Suspension is
//! expressed as pending futures rather than callbacks: dropping a pending
//! read or write future cancels it without side effects, and
//! [`Connection::close`] invalidates everything that follows. Writes flush
//! in enqueue order; reads preserve byte-stream order across TLS and
//! compression boundaries.
//!
//! ## Errors
//!
//! Every failure is terminal for its connection ([`Error`] lists the
//! taxonomy); the transport never retries. Partial reads and writes are
//! not errors, they are suspension points.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod connection;
mod error;

pub use connection::{
    ClientIdentity, ConnState, Connection, Endpoint, ServerConfig, ServerConfigBuilder, TlsInfo,
    TlsPolicy, TlsVersions, TrustAnchors, WriteBuf,
};
pub use error::{Error, Result};
