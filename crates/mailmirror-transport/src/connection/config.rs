//! Connection configuration types.

use std::path::PathBuf;
use std::time::Duration;

/// Default fixed capacity of the read buffer.
pub const DEFAULT_READ_BUFFER: usize = 96 * 1024;

/// Default ceiling on queued outbound bytes.
pub const DEFAULT_MAX_QUEUED: usize = 16 * 1024 * 1024;

/// Where the transport connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// A network host, connected via TCP after name resolution.
    Net {
        /// Server hostname or address literal.
        host: String,
        /// Server port.
        port: u16,
    },
    /// A local command whose stdio pair becomes the transport, bypassing
    /// name resolution entirely (e.g. `ssh host exec imapd`).
    Tunnel {
        /// Shell command spawned with piped stdin/stdout.
        command: String,
    },
}

/// Source of trust anchors for server certificate validation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TrustAnchors {
    /// Bundled Mozilla root certificates.
    #[default]
    WebPki,
    /// Explicit PEM file of trusted certificates.
    File(PathBuf),
    /// Accept any server certificate. The handshake still verifies
    /// signatures, but the peer is not authenticated; `TlsInfo::verified`
    /// reports `false` so callers can refuse the connection.
    Insecure,
}

/// TLS protocol versions the client will offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsVersions {
    /// Allow TLS 1.2.
    pub tls12: bool,
    /// Allow TLS 1.3.
    pub tls13: bool,
}

impl Default for TlsVersions {
    fn default() -> Self {
        Self {
            tls12: true,
            tls13: true,
        }
    }
}

/// Client certificate and key presented to the server on request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    /// PEM file holding the certificate chain.
    pub cert: PathBuf,
    /// PEM file holding the private key.
    pub key: PathBuf,
}

/// TLS policy for a connection.
#[derive(Debug, Clone, Default)]
pub struct TlsPolicy {
    /// Trust anchors used to validate the server certificate.
    pub trust: TrustAnchors,
    /// Optional client identity for mutual TLS.
    pub identity: Option<ClientIdentity>,
    /// Allowed protocol versions.
    pub versions: TlsVersions,
    /// Server name for SNI and certificate matching. Defaults to the
    /// endpoint host; required when the endpoint is a tunnel.
    pub server_name: Option<String>,
}

/// Static configuration for one transport connection.
///
/// Owned by the caller and referenced (via `Arc`) for the connection's
/// lifetime; nothing here changes once the connection exists.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Remote endpoint.
    pub endpoint: Endpoint,
    /// Bounds the whole connect attempt (resolution plus every candidate),
    /// the TLS handshake, and reads while activity is expected.
    pub timeout: Duration,
    /// TLS policy; `None` means `start_tls` is rejected.
    pub tls: Option<TlsPolicy>,
    /// Whether the protocol layer intends to negotiate compression.
    pub compress: bool,
    /// Fixed read-buffer capacity; also the longest representable line.
    pub read_buffer: usize,
    /// Ceiling on queued outbound bytes before the connection is failed.
    pub max_queued: usize,
}

impl ServerConfig {
    /// Creates a configuration for a network endpoint with defaults.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            endpoint: Endpoint::Net {
                host: host.into(),
                port,
            },
            timeout: Duration::from_secs(20),
            tls: None,
            compress: false,
            read_buffer: DEFAULT_READ_BUFFER,
            max_queued: DEFAULT_MAX_QUEUED,
        }
    }

    /// Creates a configuration builder for a network endpoint.
    #[must_use]
    pub fn builder(host: impl Into<String>, port: u16) -> ServerConfigBuilder {
        ServerConfigBuilder::new(Endpoint::Net {
            host: host.into(),
            port,
        })
    }

    /// Creates a configuration builder for a tunnel command.
    #[must_use]
    pub fn tunnel(command: impl Into<String>) -> ServerConfigBuilder {
        ServerConfigBuilder::new(Endpoint::Tunnel {
            command: command.into(),
        })
    }
}

/// Builder for [`ServerConfig`].
#[derive(Debug, Clone)]
pub struct ServerConfigBuilder {
    endpoint: Endpoint,
    timeout: Duration,
    tls: Option<TlsPolicy>,
    compress: bool,
    read_buffer: usize,
    max_queued: usize,
}

impl ServerConfigBuilder {
    fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            timeout: Duration::from_secs(20),
            tls: None,
            compress: false,
            read_buffer: DEFAULT_READ_BUFFER,
            max_queued: DEFAULT_MAX_QUEUED,
        }
    }

    /// Sets the connect / handshake / activity timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the TLS policy.
    #[must_use]
    pub fn tls(mut self, policy: TlsPolicy) -> Self {
        self.tls = Some(policy);
        self
    }

    /// Declares that compression will be negotiated.
    #[must_use]
    pub const fn compress(mut self, enabled: bool) -> Self {
        self.compress = enabled;
        self
    }

    /// Sets the fixed read-buffer capacity.
    #[must_use]
    pub const fn read_buffer(mut self, bytes: usize) -> Self {
        self.read_buffer = bytes;
        self
    }

    /// Sets the queued outbound byte ceiling.
    #[must_use]
    pub const fn max_queued(mut self, bytes: usize) -> Self {
        self.max_queued = bytes;
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> ServerConfig {
        ServerConfig {
            endpoint: self.endpoint,
            timeout: self.timeout,
            tls: self.tls,
            compress: self.compress,
            read_buffer: self.read_buffer,
            max_queued: self.max_queued,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_config_new_defaults() {
        let config = ServerConfig::new("imap.example.com", 143);
        assert_eq!(
            config.endpoint,
            Endpoint::Net {
                host: "imap.example.com".to_string(),
                port: 143
            }
        );
        assert_eq!(config.read_buffer, DEFAULT_READ_BUFFER);
        assert_eq!(config.max_queued, DEFAULT_MAX_QUEUED);
        assert!(config.tls.is_none());
    }

    #[test]
    fn test_config_builder() {
        let config = ServerConfig::builder("imap.example.com", 143)
            .timeout(Duration::from_secs(5))
            .tls(TlsPolicy::default())
            .compress(true)
            .read_buffer(4096)
            .max_queued(1 << 20)
            .build();

        assert_eq!(config.timeout, Duration::from_secs(5));
        assert!(config.tls.is_some());
        assert!(config.compress);
        assert_eq!(config.read_buffer, 4096);
        assert_eq!(config.max_queued, 1 << 20);
    }

    #[test]
    fn test_tunnel_builder() {
        let config = ServerConfig::tunnel("ssh mail exec imapd").build();
        assert_eq!(
            config.endpoint,
            Endpoint::Tunnel {
                command: "ssh mail exec imapd".to_string()
            }
        );
    }

    #[test]
    fn test_tls_versions_default() {
        let versions = TlsVersions::default();
        assert!(versions.tls12);
        assert!(versions.tls13);
    }
}
