//! Self-signed certificate autogeneration
//!
//! When a TLS listener has neither a bundle nor a key/cert pair configured, a
//! short-lived self-signed certificate is synthesized once at startup and
//! reused for every accepted connection for the life of the process.

use crate::material::TlsMaterial;
use crate::TlsMaterialError;
use rcgen::{CertificateParams, DistinguishedName};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::SystemTime;

/// How long autogenerated certificates remain valid.
const VALIDITY: std::time::Duration = std::time::Duration::from_secs(7 * 24 * 60 * 60);

/// Generate a self-signed certificate for the given common name.
///
/// Valid for seven days from generation. The common name is also added as a
/// DNS SAN (when it parses as one) alongside localhost and the loopback
/// addresses, so a verifying peer can be pointed at the same name.
pub fn generate_self_signed(common_name: &str) -> Result<SelfSignedCertificate, TlsMaterialError> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(rcgen::DnType::CommonName, common_name);
    params.distinguished_name = dn;

    let mut sans = vec![
        rcgen::SanType::DnsName(rcgen::Ia5String::try_from("localhost").unwrap()),
        rcgen::SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        rcgen::SanType::IpAddress(IpAddr::V6(Ipv6Addr::LOCALHOST)),
    ];
    if let Ok(ip) = common_name.parse::<IpAddr>() {
        sans.push(rcgen::SanType::IpAddress(ip));
    } else if let Ok(name) = rcgen::Ia5String::try_from(common_name) {
        sans.push(rcgen::SanType::DnsName(name));
    }
    params.subject_alt_names = sans;

    let not_before = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_err(|e| TlsMaterialError::Generation(e.to_string()))?;
    params.not_before = time::OffsetDateTime::from_unix_timestamp(not_before.as_secs() as i64)
        .map_err(|e| TlsMaterialError::Generation(e.to_string()))?;

    let not_after = not_before + VALIDITY;
    params.not_after = time::OffsetDateTime::from_unix_timestamp(not_after.as_secs() as i64)
        .map_err(|e| TlsMaterialError::Generation(e.to_string()))?;

    params.serial_number = Some(rcgen::SerialNumber::from(rand::random::<u64>()));

    let key_pair =
        rcgen::KeyPair::generate().map_err(|e| TlsMaterialError::Generation(e.to_string()))?;

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| TlsMaterialError::Generation(e.to_string()))?;

    let cert_pem = cert.pem();
    let key_pem = key_pair.serialize_pem();
    let cert_der = cert.der().to_vec();
    let key_der = key_pair.serialize_der();

    Ok(SelfSignedCertificate {
        cert_der: CertificateDer::from(cert_der),
        key_der: PrivateKeyDer::try_from(key_der)
            .map_err(|e| TlsMaterialError::Generation(format!("{e:?}")))?,
        pem_cert: cert_pem,
        pem_key: key_pem,
    })
}

/// A freshly generated certificate with its private key, in both DER (for
/// rustls) and PEM (for files and trust anchors) form.
pub struct SelfSignedCertificate {
    pub cert_der: CertificateDer<'static>,
    pub key_der: PrivateKeyDer<'static>,
    pub pem_cert: String,
    pub pem_key: String,
}

impl SelfSignedCertificate {
    pub fn into_material(self) -> TlsMaterial {
        TlsMaterial {
            certs: vec![self.cert_der],
            key: self.key_der,
        }
    }
}
