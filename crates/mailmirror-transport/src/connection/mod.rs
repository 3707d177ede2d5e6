//! Transport connection management.
//!
//! This module provides the buffered connection engine, including:
//! - Configuration (endpoint, timeout, TLS policy, buffer ceilings)
//! - Address resolution and candidate-ordered connecting
//! - Tunnel subprocess transports
//! - Fixed-capacity read buffering with line/length framing
//! - Coalescing FIFO write queue with ownership-tagged buffers
//! - TLS and DEFLATE layering inserted mid-connection

mod buffer;
mod config;
mod conn;
mod connect;
mod deflate;
mod queue;
mod stream;
mod tls;

pub use config::{
    ClientIdentity, Endpoint, ServerConfig, ServerConfigBuilder, TlsPolicy, TlsVersions,
    TrustAnchors,
};
pub use conn::{ConnState, Connection};
pub use queue::WriteBuf;
pub use tls::TlsInfo;
