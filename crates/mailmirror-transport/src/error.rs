//! Error types for the transport layer.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur on a transport connection.
///
/// Every variant is terminal for the connection it is reported on: the
/// transport never retries internally, and a failed connection moves to
/// `Closed` before the error is returned. Reconnect policy belongs to the
/// protocol layer.
#[derive(Debug, Error)]
pub enum Error {
    /// Name resolution produced no usable candidate address.
    #[error("Address resolution failed: {0}")]
    Resolve(String),

    /// Every candidate address was attempted and all failed.
    #[error("Connection failed: {0}")]
    Connect(String),

    /// Fatal I/O error (distinct from would-block, which never surfaces).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A line exceeded the fixed read-buffer capacity before a terminator
    /// was seen.
    #[error("Line exceeds read buffer capacity ({capacity} bytes)")]
    LineTooLong {
        /// Capacity of the read buffer.
        capacity: usize,
    },

    /// A byte-count request exceeded the fixed read-buffer capacity.
    #[error("Requested {wanted} bytes but read buffer holds at most {capacity}")]
    RequestTooLong {
        /// Minimum byte count the caller asked for.
        wanted: usize,
        /// Capacity of the read buffer.
        capacity: usize,
    },

    /// TLS handshake or encryption error. Certificate validation failures
    /// arrive as `rustls::Error::InvalidCertificate` and remain
    /// distinguishable from other handshake failures.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// The configured host is not usable as a TLS server name.
    #[error("Invalid DNS name: {0}")]
    InvalidDnsName(#[from] rustls::pki_types::InvalidDnsNameError),

    /// Malformed compressed data on an inbound DEFLATE stream.
    #[error("Compression error: {0}")]
    Compression(String),

    /// The write queue would exceed its configured memory ceiling.
    #[error("Write queue exceeds {limit} bytes")]
    WriteQueueOverflow {
        /// Configured queued-byte ceiling.
        limit: usize,
    },

    /// Connect, handshake, or expected activity did not complete in time.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Operation attempted on a closed connection.
    #[error("Connection is closed")]
    Closed,

    /// Operation invalid in the connection's current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
