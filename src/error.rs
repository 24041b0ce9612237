//! Error types for the certificate rotation controller

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for rotator operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Invalid rotator configuration, fatal at startup
    #[error("configuration error: {0}")]
    Config(String),

    /// Certificate generation or parsing error
    #[error("certificate error: {0}")]
    Pki(#[from] crate::pki::PkiError),

    /// The backing secret exists but lacks a required data field.
    ///
    /// Distinct from [`Error::Pki`] (corrupt material) so callers can tell
    /// an empty secret from a damaged one; both trigger regeneration.
    #[error("secret {secret} is missing required field {field:?}")]
    SecretMissingField {
        /// namespace/name of the secret
        secret: String,
        /// the absent data key
        field: String,
    },

    /// Filesystem error while publishing certificate files
    #[error("filesystem error at {path}: {source}")]
    Publish {
        /// the file or directory being written
        path: PathBuf,
        /// the underlying IO error
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_carry_their_message() {
        let err = Error::config("secret namespace must not be empty");
        assert!(err.to_string().contains("configuration error"));
        assert!(err.to_string().contains("namespace must not be empty"));
    }

    #[test]
    fn missing_field_is_distinguishable_from_corrupt() {
        let missing = Error::SecretMissingField {
            secret: "ns/test-secret".to_string(),
            field: "tls.crt".to_string(),
        };
        assert!(missing.to_string().contains("missing required field"));
        assert!(matches!(missing, Error::SecretMissingField { .. }));

        let corrupt: Error = crate::pki::PkiError::Parse("bad PEM".to_string()).into();
        assert!(matches!(corrupt, Error::Pki(_)));
    }
}
