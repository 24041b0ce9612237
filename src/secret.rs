//! Encoding and decoding certificate material in the backing Secret
//!
//! The secret carries four PEM blobs: CA certificate, CA private key,
//! serving certificate and serving private key. The data keys are
//! configuration, not hard-coded; [`SecretFields`] carries the configured
//! names. A missing key and an unparseable value are reported as different
//! error variants so the reconciler can log the distinction, though both
//! lead to regeneration.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::ResourceExt;

use crate::pki::KeyPairArtifacts;
use crate::{Error, Result};

/// The configured secret data keys (doubling as on-disk file names, except
/// for the CA key, which never reaches the filesystem).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecretFields {
    /// Data key for the serving certificate
    pub cert: String,
    /// Data key for the serving private key
    pub key: String,
    /// Data key for the CA certificate
    pub ca_cert: String,
    /// Data key for the CA private key
    pub ca_key: String,
}

impl Default for SecretFields {
    fn default() -> Self {
        Self {
            cert: crate::DEFAULT_CERT_NAME.to_string(),
            key: crate::DEFAULT_KEY_NAME.to_string(),
            ca_cert: crate::DEFAULT_CA_CERT_NAME.to_string(),
            ca_key: crate::DEFAULT_CA_KEY_NAME.to_string(),
        }
    }
}

/// Write the four PEM blobs into the secret's data map, replacing any
/// previous values under the configured keys. Other keys are left alone.
pub fn populate_secret(
    secret: &mut Secret,
    cert_pem: &[u8],
    key_pem: &[u8],
    fields: &SecretFields,
    ca: &KeyPairArtifacts,
) {
    let data = secret.data.get_or_insert_with(BTreeMap::new);
    data.insert(fields.ca_cert.clone(), ByteString(ca.cert_pem().to_vec()));
    data.insert(fields.ca_key.clone(), ByteString(ca.key_pem().to_vec()));
    data.insert(fields.cert.clone(), ByteString(cert_pem.to_vec()));
    data.insert(fields.key.clone(), ByteString(key_pem.to_vec()));
}

/// Read and parse the CA material out of the secret.
pub fn artifacts_from_secret(secret: &Secret, fields: &SecretFields) -> Result<KeyPairArtifacts> {
    let cert = field(secret, &fields.ca_cert)?;
    let key = field(secret, &fields.ca_key)?;
    Ok(KeyPairArtifacts::from_pem(cert.to_vec(), key.to_vec())?)
}

/// Read the serving certificate and key PEM blobs out of the secret.
pub fn serving_pair_from_secret(
    secret: &Secret,
    fields: &SecretFields,
) -> Result<(Vec<u8>, Vec<u8>)> {
    let cert = field(secret, &fields.cert)?;
    let key = field(secret, &fields.key)?;
    Ok((cert.to_vec(), key.to_vec()))
}

/// `namespace/name` form for logs and errors
pub fn secret_display(secret: &Secret) -> String {
    format!(
        "{}/{}",
        secret.namespace().unwrap_or_default(),
        secret.name_any()
    )
}

fn field<'a>(secret: &'a Secret, name: &str) -> Result<&'a [u8]> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(name))
        .map(|ByteString(bytes)| bytes.as_slice())
        .filter(|bytes| !bytes.is_empty())
        .ok_or_else(|| Error::SecretMissingField {
            secret: secret_display(secret),
            field: name.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::{Duration, OffsetDateTime};

    use crate::pki::{self, ExtKeyUsage};

    fn fixtures() -> (KeyPairArtifacts, Vec<u8>, Vec<u8>) {
        let now = OffsetDateTime::now_utc();
        let begin = now - Duration::hours(1);
        let end = now + Duration::days(10 * 365);
        let ca = pki::create_ca_cert("ca", "org", begin, end).expect("CA generation");
        let (cert, key) = pki::create_cert_pem(
            &ca,
            "service.namespace",
            &[],
            &[ExtKeyUsage::ServerAuth],
            begin,
            end,
        )
        .expect("leaf generation");
        (ca, cert, key)
    }

    #[test]
    fn round_trip_preserves_validity() {
        let (ca, cert, key) = fixtures();
        let fields = SecretFields::default();
        let mut secret = Secret::default();

        populate_secret(&mut secret, &cert, &key, &fields, &ca);
        let recovered = artifacts_from_secret(&secret, &fields).expect("decoding should succeed");

        let lookahead = OffsetDateTime::now_utc() + Duration::days(90);
        assert!(pki::valid_server_cert(
            recovered.cert_pem(),
            &cert,
            &key,
            "service.namespace",
            &[],
            &[ExtKeyUsage::ServerAuth],
            lookahead,
        ));

        let (cert2, key2) = serving_pair_from_secret(&secret, &fields).expect("leaf fields");
        assert_eq!(cert2, cert);
        assert_eq!(key2, key);

        // recovered CA can still sign fresh leaves
        let now = OffsetDateTime::now_utc();
        let (cert3, key3) = pki::create_cert_pem(
            &recovered,
            "service.namespace",
            &[],
            &[ExtKeyUsage::ServerAuth],
            now - Duration::hours(1),
            now + Duration::days(365),
        )
        .expect("re-signing with recovered CA");
        assert!(pki::valid_server_cert(
            ca.cert_pem(),
            &cert3,
            &key3,
            "service.namespace",
            &[],
            &[ExtKeyUsage::ServerAuth],
            lookahead,
        ));
    }

    #[test]
    fn missing_fields_are_reported_as_missing() {
        let fields = SecretFields::default();
        let empty = Secret::default();
        match artifacts_from_secret(&empty, &fields) {
            Err(Error::SecretMissingField { field, .. }) => assert_eq!(field, "ca.crt"),
            other => panic!("expected SecretMissingField, got {other:?}"),
        }
    }

    #[test]
    fn empty_value_counts_as_missing() {
        let (ca, cert, key) = fixtures();
        let fields = SecretFields::default();
        let mut secret = Secret::default();
        populate_secret(&mut secret, &cert, &key, &fields, &ca);
        secret
            .data
            .as_mut()
            .expect("populated data")
            .insert(fields.key.clone(), ByteString(Vec::new()));

        assert!(matches!(
            serving_pair_from_secret(&secret, &fields),
            Err(Error::SecretMissingField { .. })
        ));
    }

    #[test]
    fn corrupt_fields_are_reported_as_corrupt() {
        let (ca, cert, key) = fixtures();
        let fields = SecretFields::default();
        let mut secret = Secret::default();
        populate_secret(&mut secret, &cert, &key, &fields, &ca);
        secret
            .data
            .as_mut()
            .expect("populated data")
            .insert(fields.ca_cert.clone(), ByteString(b"garbage".to_vec()));

        assert!(matches!(
            artifacts_from_secret(&secret, &fields),
            Err(Error::Pki(_))
        ));
    }

    #[test]
    fn custom_field_names_are_honored() {
        let (ca, cert, key) = fixtures();
        let fields = SecretFields {
            cert: "server.pem".to_string(),
            key: "server-key.pem".to_string(),
            ca_cert: "root.pem".to_string(),
            ca_key: "root-key.pem".to_string(),
        };
        let mut secret = Secret::default();
        populate_secret(&mut secret, &cert, &key, &fields, &ca);

        let data = secret.data.as_ref().expect("populated data");
        assert!(data.contains_key("root.pem"));
        assert!(!data.contains_key(crate::DEFAULT_CA_CERT_NAME));
        assert!(artifacts_from_secret(&secret, &fields).is_ok());
    }
}
