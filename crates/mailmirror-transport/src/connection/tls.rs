//! TLS layering via rustls.
//!
//! The policy decides where trust anchors come from (bundled roots, an
//! explicit PEM file, or none at all), which protocol versions are offered,
//! and whether a client identity is presented. Certificate validation
//! failure surfaces as a distinguished handshake error; it is never
//! downgraded to an insecure session behind the caller's back.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use super::config::{TlsPolicy, TlsVersions, TrustAnchors};
use super::stream::RawStream;
use crate::{Error, Result};

/// Outcome of a completed handshake.
#[derive(Debug, Clone, Copy)]
pub struct TlsInfo {
    /// Negotiated protocol version.
    pub version: Option<rustls::ProtocolVersion>,
    /// Whether the peer certificate was validated against trust anchors.
    /// `false` exactly when the policy was [`TrustAnchors::Insecure`].
    pub verified: bool,
}

impl TlsVersions {
    fn as_rustls(self) -> Result<Vec<&'static rustls::SupportedProtocolVersion>> {
        let mut versions = Vec::new();
        if self.tls12 {
            versions.push(&rustls::version::TLS12);
        }
        if self.tls13 {
            versions.push(&rustls::version::TLS13);
        }
        if versions.is_empty() {
            return Err(Error::InvalidState(
                "TLS policy allows no protocol version".to_string(),
            ));
        }
        Ok(versions)
    }
}

/// Builds a rustls client configuration from the policy.
///
/// Trust material is loaded once and immutable afterward; the returned
/// `Arc` may be shared across connections.
pub(crate) fn client_config(policy: &TlsPolicy) -> Result<Arc<ClientConfig>> {
    let versions = policy.versions.as_rustls()?;
    let builder = ClientConfig::builder_with_protocol_versions(&versions);

    let builder = match &policy.trust {
        TrustAnchors::WebPki => builder.with_root_certificates(webpki_store()),
        TrustAnchors::File(path) => builder.with_root_certificates(load_root_store(path)?),
        TrustAnchors::Insecure => {
            let verifier = danger::AcceptAnyServerCert::new(builder.crypto_provider().clone());
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(verifier))
        }
    };

    let config = match &policy.identity {
        Some(identity) => builder
            .with_client_auth_cert(load_certs(&identity.cert)?, load_private_key(&identity.key)?)?,
        None => builder.with_no_client_auth(),
    };

    Ok(Arc::new(config))
}

/// Upgrades a raw stream to TLS. The caller bounds this with the
/// connection timeout.
pub(crate) async fn handshake(
    raw: RawStream,
    server_name: &str,
    policy: &TlsPolicy,
) -> Result<(TlsStream<RawStream>, TlsInfo)> {
    let config = client_config(policy)?;
    let name = ServerName::try_from(server_name.to_string())?;
    let connector = TlsConnector::from(config);
    // tokio-rustls wraps handshake failures in io::Error; unwrap them so
    // certificate validation failures stay a distinguished TLS error.
    let stream = connector.connect(name, raw).await.map_err(|e| {
        match e
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        {
            Some(tls) => Error::Tls(tls.clone()),
            None => Error::Io(e),
        }
    })?;

    let (_, session) = stream.get_ref();
    let info = TlsInfo {
        version: session.protocol_version(),
        verified: policy.trust != TrustAnchors::Insecure,
    };
    tracing::debug!(version = ?info.version, verified = info.verified, "TLS established");
    Ok((stream, info))
}

fn webpki_store() -> RootCertStore {
    RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    }
}

/// Loads certificates from a PEM file.
fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader).collect::<io::Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(Error::InvalidState(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Loads a private key from a PEM file.
fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)?.ok_or_else(|| {
        Error::InvalidState(format!("no private key in {}", path.display()))
    })
}

/// Builds a root store from an explicit PEM trust file.
fn load_root_store(path: &Path) -> Result<RootCertStore> {
    let mut store = RootCertStore::empty();
    for cert in load_certs(path)? {
        store.add(cert)?;
    }
    Ok(store)
}

mod danger {
    use std::sync::Arc;

    use rustls::DigitallySignedStruct;
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::CryptoProvider;
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};

    /// Verifier that skips peer authentication but still checks handshake
    /// signatures with the active crypto provider.
    #[derive(Debug)]
    pub(super) struct AcceptAnyServerCert {
        provider: Arc<CryptoProvider>,
    }

    impl AcceptAnyServerCert {
        pub(super) fn new(provider: Arc<CryptoProvider>) -> Self {
            Self { provider }
        }
    }

    impl ServerCertVerifier for AcceptAnyServerCert {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> std::result::Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &self.provider.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &self.provider.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.provider
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}
