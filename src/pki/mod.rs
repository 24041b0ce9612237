//! Certificate generation and validation for the rotator
//!
//! This module materializes the cryptographic state the controller keeps in
//! agreement: a self-signed CA and a leaf serving certificate signed by it.
//! Generation goes through rcgen; validation parses the PEM blobs with
//! x509-parser and checks structure, signatures, names and validity windows.
//!
//! # Freshness Model
//!
//! Certificates are refreshed proactively, not reactively: a certificate is
//! *fresh* only if it is still valid at `now + lookahead`. Validation is
//! deterministic given its inputs - every check takes the probe instant as a
//! parameter, so the rotator's injected clock is the only time source.

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, PublicKeyData, SanType,
};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use thiserror::Error;
use x509_parser::prelude::*;
use ::time::OffsetDateTime;

/// Modulus size of generated RSA keys
const RSA_KEY_BITS: usize = 2048;

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGeneration(String),

    /// Certificate or key parsing error
    #[error("certificate parsing error: {0}")]
    Parse(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Extended key usages a serving certificate can be required to carry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtKeyUsage {
    /// TLS server authentication (the default requirement)
    ServerAuth,
    /// TLS client authentication
    ClientAuth,
}

impl ExtKeyUsage {
    fn to_rcgen(self) -> ExtendedKeyUsagePurpose {
        match self {
            Self::ServerAuth => ExtendedKeyUsagePurpose::ServerAuth,
            Self::ClientAuth => ExtendedKeyUsagePurpose::ClientAuth,
        }
    }

    fn present_in(self, eku: &ExtendedKeyUsage) -> bool {
        match self {
            Self::ServerAuth => eku.server_auth,
            Self::ClientAuth => eku.client_auth,
        }
    }
}

/// CA material: the certificate and private key as PEM blobs.
///
/// The PEM form is the source of truth (it is what the secret stores and
/// what goes on disk); parsed forms are derived on demand since rcgen key
/// pairs are not cloneable. Regenerated as a whole on rotation.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyPairArtifacts {
    cert_pem: Vec<u8>,
    key_pem: Vec<u8>,
}

impl KeyPairArtifacts {
    /// Construct from PEM blobs, validating that both parse.
    pub fn from_pem(cert_pem: Vec<u8>, key_pem: Vec<u8>) -> Result<Self> {
        parse_cert_der(&cert_pem)?;
        key_pair_from_pem(&key_pem)?;
        Ok(Self { cert_pem, key_pem })
    }

    /// The CA certificate in PEM form
    pub fn cert_pem(&self) -> &[u8] {
        &self.cert_pem
    }

    /// The CA private key in PEM form
    pub fn key_pem(&self) -> &[u8] {
        &self.key_pem
    }

    fn key_pair(&self) -> Result<KeyPair> {
        key_pair_from_pem(&self.key_pem)
    }
}

impl std::fmt::Debug for KeyPairArtifacts {
    // the private key stays out of logs
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPairArtifacts")
            .field("cert_pem", &String::from_utf8_lossy(&self.cert_pem))
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

/// Generate a fresh self-signed CA valid over `[begin, end]`.
///
/// The subject is `CN=<ca_name>, O=<ca_organization>`; basic constraints
/// mark it as a CA and key usages permit certificate and CRL signing. The
/// serial number is randomized by rcgen.
pub fn create_ca_cert(
    ca_name: &str,
    ca_organization: &str,
    begin: OffsetDateTime,
    end: OffsetDateTime,
) -> Result<KeyPairArtifacts> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(ca_name.to_string()));
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(ca_organization.to_string()),
    );
    params.distinguished_name = dn;

    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];
    params.not_before = begin;
    params.not_after = end;

    let key_pair = generate_rsa_key_pair("CA")?;

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| PkiError::CertificateGeneration(format!("failed to create CA cert: {e}")))?;

    Ok(KeyPairArtifacts {
        cert_pem: cert.pem().into_bytes(),
        key_pem: key_pair.serialize_pem().into_bytes(),
    })
}

/// Generate a fresh serving certificate signed by `ca`, valid over
/// `[begin, end]`.
///
/// The common name is `dns_name`; the SAN set is `[dns_name]` plus
/// `extra_dns_names`; the extended key usages are exactly `ext_key_usages`.
/// Returns `(cert_pem, key_pem)`.
pub fn create_cert_pem(
    ca: &KeyPairArtifacts,
    dns_name: &str,
    extra_dns_names: &[String],
    ext_key_usages: &[ExtKeyUsage],
    begin: OffsetDateTime,
    end: OffsetDateTime,
) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(dns_name.to_string()),
    );
    params.distinguished_name = dn;

    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = ext_key_usages.iter().map(|u| u.to_rcgen()).collect();
    params.not_before = begin;
    params.not_after = end;

    params.subject_alt_names = std::iter::once(dns_name)
        .chain(extra_dns_names.iter().map(String::as_str))
        .map(|san| {
            Ia5String::try_from(san.to_string())
                .map(SanType::DnsName)
                .map_err(|e| {
                    PkiError::CertificateGeneration(format!("invalid DNS name '{san}': {e}"))
                })
        })
        .collect::<Result<Vec<_>>>()?;

    let leaf_key = generate_rsa_key_pair("serving")?;

    let ca_cert_pem = std::str::from_utf8(&ca.cert_pem)
        .map_err(|e| PkiError::Parse(format!("CA certificate is not valid UTF-8: {e}")))?;
    let ca_key = ca.key_pair()?;
    let issuer = Issuer::from_ca_cert_pem(ca_cert_pem, &ca_key)
        .map_err(|e| PkiError::Parse(format!("failed to create issuer: {e}")))?;

    let cert = params.signed_by(&leaf_key, &issuer).map_err(|e| {
        PkiError::CertificateGeneration(format!("failed to sign serving cert: {e}"))
    })?;

    Ok((
        cert.pem().into_bytes(),
        leaf_key.serialize_pem().into_bytes(),
    ))
}

/// Check whether `cert_pem`/`key_pem` form a usable self-signed CA: the
/// issuer equals the subject, the signature verifies against the cert's own
/// public key, and the embedded public key matches the private key.
///
/// Empty or unparseable input is simply not a valid CA. The validity window
/// is deliberately not inspected here; the rotator checks expiry separately
/// via [`cert_valid_at`] with its lookahead instant.
pub fn valid_ca_cert(cert_pem: &[u8], key_pem: &[u8]) -> bool {
    fn check(cert_pem: &[u8], key_pem: &[u8]) -> Result<bool> {
        let der = parse_cert_der(cert_pem)?;
        let (_, cert) = parse_x509(&der)?;
        let key = key_pair_from_pem(key_pem)?;

        if cert.issuer().as_raw() != cert.subject().as_raw() {
            return Ok(false);
        }
        if cert.verify_signature(None).is_err() {
            return Ok(false);
        }
        Ok(cert.public_key().raw == key.subject_public_key_info())
    }
    check(cert_pem, key_pem).unwrap_or(false)
}

/// Check whether `cert_pem`/`key_pem` form a serving certificate chained to
/// `ca_pem` that covers `dns_name` plus every name in `extra_dns_names`
/// with the given extended key usages at instant `at`.
pub fn valid_server_cert(
    ca_pem: &[u8],
    cert_pem: &[u8],
    key_pem: &[u8],
    dns_name: &str,
    extra_dns_names: &[String],
    ext_key_usages: &[ExtKeyUsage],
    at: OffsetDateTime,
) -> bool {
    std::iter::once(dns_name)
        .chain(extra_dns_names.iter().map(String::as_str))
        .all(|dns| valid_cert(ca_pem, cert_pem, key_pem, dns, ext_key_usages, at).unwrap_or(false))
}

/// Validate a certificate against a CA for a single DNS name at a
/// caller-supplied instant.
///
/// Returns `Err` only when an input fails to parse (corrupt PEM, DER or
/// key). Structurally sound but unusable material - expired at `at`, not
/// chained to the CA, missing the DNS name or a required key usage, key
/// mismatch - yields `Ok(false)`, so callers can distinguish "corrupt" from
/// "invalid". Probing at `now + lookahead` implements the freshness policy;
/// external verifiers probe at their own `now`.
pub fn valid_cert(
    ca_pem: &[u8],
    cert_pem: &[u8],
    key_pem: &[u8],
    dns_name: &str,
    ext_key_usages: &[ExtKeyUsage],
    at: OffsetDateTime,
) -> Result<bool> {
    let ca_der = parse_cert_der(ca_pem)?;
    let cert_der = parse_cert_der(cert_pem)?;
    let (_, ca) = parse_x509(&ca_der)?;
    let (_, cert) = parse_x509(&cert_der)?;
    let key = key_pair_from_pem(key_pem)?;

    if cert.public_key().raw != key.subject_public_key_info() {
        return Ok(false);
    }
    if cert.verify_signature(Some(ca.public_key())).is_err() {
        return Ok(false);
    }

    let ts = at.unix_timestamp();
    if !within_validity(&cert, ts) || !within_validity(&ca, ts) {
        return Ok(false);
    }

    if !covers_dns_name(&cert, dns_name)? {
        return Ok(false);
    }
    Ok(covers_ext_key_usages(&cert, ext_key_usages))
}

/// Check whether the certificate's validity window contains `at`.
///
/// Structure-only probe used for the CA's lookahead expiry check; `Err`
/// means the input did not parse.
pub fn cert_valid_at(cert_pem: &[u8], at: OffsetDateTime) -> Result<bool> {
    let der = parse_cert_der(cert_pem)?;
    let (_, cert) = parse_x509(&der)?;
    Ok(within_validity(&cert, at.unix_timestamp()))
}

fn within_validity(cert: &X509Certificate<'_>, ts: i64) -> bool {
    let validity = cert.validity();
    ts >= validity.not_before.timestamp() && ts <= validity.not_after.timestamp()
}

fn covers_dns_name(cert: &X509Certificate<'_>, dns_name: &str) -> Result<bool> {
    let san = cert
        .subject_alternative_name()
        .map_err(|e| PkiError::Parse(format!("failed to parse SAN extension: {e}")))?;
    let Some(san) = san else {
        return Ok(false);
    };
    Ok(san.value.general_names.iter().any(|name| {
        matches!(name, GeneralName::DNSName(san) if san.eq_ignore_ascii_case(dns_name))
    }))
}

fn covers_ext_key_usages(cert: &X509Certificate<'_>, required: &[ExtKeyUsage]) -> bool {
    if required.is_empty() {
        return true;
    }
    match cert.extended_key_usage() {
        Ok(Some(eku)) => required.iter().all(|u| u.present_in(eku.value)),
        _ => false,
    }
}

fn parse_cert_der(pem_data: &[u8]) -> Result<Vec<u8>> {
    let block = ::pem::parse(pem_data)
        .map_err(|e| PkiError::Parse(format!("failed to parse PEM: {e}")))?;
    Ok(block.contents().to_vec())
}

fn parse_x509(der: &[u8]) -> Result<(&[u8], X509Certificate<'_>)> {
    X509Certificate::from_der(der)
        .map_err(|e| PkiError::Parse(format!("failed to parse certificate: {e}")))
}

fn key_pair_from_pem(key_pem: &[u8]) -> Result<KeyPair> {
    let key_str = std::str::from_utf8(key_pem)
        .map_err(|e| PkiError::Parse(format!("private key is not valid UTF-8: {e}")))?;
    KeyPair::from_pem(key_str)
        .map_err(|e| PkiError::Parse(format!("failed to parse private key: {e}")))
}

// rcgen cannot generate RSA keys itself, so the key comes from the rsa
// crate and is imported for signing
fn generate_rsa_key_pair(context: &str) -> Result<KeyPair> {
    let key = RsaPrivateKey::new(&mut rand::thread_rng(), RSA_KEY_BITS)
        .map_err(|e| PkiError::KeyGeneration(format!("failed to generate {context} key: {e}")))?;
    let key_pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| PkiError::KeyGeneration(format!("failed to encode {context} key: {e}")))?;
    KeyPair::from_pem(&key_pem)
        .map_err(|e| PkiError::KeyGeneration(format!("failed to load {context} key: {e}")))
}
