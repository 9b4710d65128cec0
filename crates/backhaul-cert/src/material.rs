//! PEM material loading and rustls configuration builders

use crate::TlsMaterialError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

/// A certificate chain with its private key, ready to hand to rustls.
pub struct TlsMaterial {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("rustls crypto provider already installed");
        }
    });
}

fn open(path: &Path) -> Result<BufReader<File>, TlsMaterialError> {
    let file = File::open(path).map_err(|e| TlsMaterialError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(BufReader::new(file))
}

/// Load a PEM certificate chain.
pub fn load_cert_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsMaterialError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsMaterialError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    if certs.is_empty() {
        return Err(TlsMaterialError::Parse {
            path: path.to_path_buf(),
            reason: "no certificates found".to_string(),
        });
    }
    Ok(certs)
}

/// Load a PEM private key (PKCS#8, PKCS#1, or SEC1).
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsMaterialError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsMaterialError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?
        .ok_or_else(|| TlsMaterialError::NoPrivateKey {
            path: path.to_path_buf(),
        })
}

/// Load a combined PEM bundle: certificate chain and private key in one file.
pub fn load_bundle(path: &Path) -> Result<TlsMaterial, TlsMaterialError> {
    let certs = load_cert_chain(path)?;
    let key = load_private_key(path)?;
    Ok(TlsMaterial { certs, key })
}

/// Build a root store from a PEM trust-anchor file, or the bundled
/// `webpki-roots` store when no file is given.
pub fn load_trust_anchors(path: Option<&Path>) -> Result<RootCertStore, TlsMaterialError> {
    let mut roots = RootCertStore::empty();
    match path {
        Some(path) => {
            for cert in load_cert_chain(path)? {
                roots.add(cert).map_err(|e| TlsMaterialError::Parse {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })?;
            }
        }
        None => {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
    }
    Ok(roots)
}

/// Build a rustls server configuration.
///
/// With `client_roots` set, clients must present a certificate that chains to
/// one of those anchors; the handshake fails otherwise and the verified chain
/// is available to the accept path afterwards.
pub fn server_tls_config(
    material: TlsMaterial,
    client_roots: Option<RootCertStore>,
) -> Result<ServerConfig, TlsMaterialError> {
    ensure_crypto_provider();

    let builder = match client_roots {
        Some(roots) => {
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| TlsMaterialError::Verifier(e.to_string()))?;
            ServerConfig::builder().with_client_cert_verifier(verifier)
        }
        None => ServerConfig::builder().with_no_client_auth(),
    };

    Ok(builder.with_single_cert(material.certs, material.key)?)
}

/// Build a rustls client configuration.
///
/// `verify` disabled swaps in a verifier that accepts any server certificate;
/// `identity` is an optional client certificate presented to the server.
pub fn client_tls_config(
    verify: bool,
    roots: RootCertStore,
    identity: Option<TlsMaterial>,
) -> Result<ClientConfig, TlsMaterialError> {
    ensure_crypto_provider();

    let config = match (verify, identity) {
        (true, None) => ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
        (true, Some(id)) => ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(id.certs, id.key)?,
        (false, None) => ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(SkipVerification::new())
            .with_no_client_auth(),
        (false, Some(id)) => ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(SkipVerification::new())
            .with_client_auth_cert(id.certs, id.key)?,
    };
    Ok(config)
}

// Certificate verifier that skips verification (INSECURE)
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme;
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
