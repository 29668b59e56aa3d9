//! TLS client configuration and the named TLS-config registry
//!
//! The handshake flow is: read the server greeting, send the short SSL
//! request prefix, perform the TLS handshake, then resend the full
//! handshake response over the encrypted stream.
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use tokio_rustls::rustls;
use tokio_rustls::rustls::ClientConfig;

use crate::error::{ErrorKind, Result};

/// How the DSN asked for TLS
#[derive(Clone, Debug)]
pub enum TlsSetup {
    /// `tls=true`: verify the server certificate against the webpki roots
    Standard,
    /// `tls=skip-verify`: encrypt but accept any certificate
    SkipVerify,
    /// `tls=<name>`: a config registered with [crate::register_tls_config]
    Custom(Arc<ClientConfig>),
}

static TLS_CONFIGS: Lazy<RwLock<HashMap<String, Arc<ClientConfig>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Register a named TLS configuration for use with `tls=<name>` in a DSN.
///
/// The registry is process-wide. Register configurations before opening
/// connections that reference them; entries are not meant to be swapped
/// during steady state.
pub fn register_tls_config(name: &str, config: Arc<ClientConfig>) {
    TLS_CONFIGS
        .write()
        .expect("tls config registry poisoned")
        .insert(name.to_string(), config);
}

pub(crate) fn lookup_tls_config(name: &str) -> Option<Arc<ClientConfig>> {
    TLS_CONFIGS
        .read()
        .expect("tls config registry poisoned")
        .get(name)
        .cloned()
}

impl TlsSetup {
    /// Resolve the setup to a rustls client config
    pub(crate) fn client_config(&self) -> Result<Arc<ClientConfig>> {
        match self {
            TlsSetup::Custom(cfg) => Ok(cfg.clone()),
            TlsSetup::Standard => {
                let mut roots = rustls::RootCertStore::empty();
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                let cfg = builder()?
                    .with_root_certificates(roots)
                    .with_no_client_auth();
                Ok(Arc::new(cfg))
            }
            TlsSetup::SkipVerify => {
                let provider = ring_provider();
                let cfg = builder()?
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(NoVerify(provider)))
                    .with_no_client_auth();
                Ok(Arc::new(cfg))
            }
        }
    }
}

fn ring_provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn builder() -> Result<rustls::ConfigBuilder<ClientConfig, rustls::WantsVerifier>> {
    ClientConfig::builder_with_provider(ring_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| ErrorKind::Io(io::Error::other(e)).into())
}

/// Certificate verifier for `tls=skip-verify` that accepts any server
/// certificate. The stream is still encrypted but not authenticated.
#[derive(Debug)]
struct NoVerify(Arc<rustls::crypto::CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
