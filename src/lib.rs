//! cert-rotator - certificate rotation controller for Kubernetes webhooks
//!
//! cert-rotator provisions and continuously maintains the TLS material (a
//! self-signed CA plus a leaf serving certificate) that lets an in-cluster
//! webhook endpoint serve HTTPS, and propagates the CA bundle into every
//! consumer resource that must trust the endpoint.
//!
//! # Architecture
//!
//! Three pieces of state are kept in agreement:
//! - A Kubernetes Secret holding the CA key/cert and the serving key/cert
//! - An on-disk certificate directory consumed by the HTTPS server
//! - The CA-bundle fields of consumer resources (admission webhook
//!   configurations, CRD conversion webhooks, aggregated API services,
//!   external-data providers)
//!
//! The secret is the single source of truth. A secret reconciler refreshes
//! stale or missing material (a CA refresh always cascades to the leaf; a
//! leaf-only refresh never touches the CA) and mirrors the PEM blobs to
//! disk. Consumer reconcilers watch their resources and patch the CA-bundle
//! fields back whenever they diverge.
//!
//! # Modules
//!
//! - [`pki`] - CA and leaf certificate generation and validation
//! - [`secret`] - encoding certificate material into the backing Secret
//! - [`publish`] - atomic publication of certificate files to disk
//! - [`rotator`] - the secret reconciler and orchestrator
//! - [`webhook`] - consumer resource descriptors and reconcilers
//! - [`crd`] - the external-data `Provider` resource definition
//! - [`ready`] - one-shot readiness signalling
//! - [`retry`] - bounded retry for racing cluster writes
//! - [`error`] - error types for the controller

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod pki;
pub mod publish;
pub mod ready;
pub mod retry;
pub mod rotator;
pub mod secret;
pub mod webhook;

pub use error::Error;
pub use rotator::{CertRotator, Clock, RotatorConfig, SecretRef};
pub use webhook::{WebhookInfo, WebhookType};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================
// Defaults shared by the rotator config, the CLI and the test fixtures.

/// Default secret field name and file name for the serving certificate
pub const DEFAULT_CERT_NAME: &str = "tls.crt";

/// Default secret field name and file name for the serving private key
pub const DEFAULT_KEY_NAME: &str = "tls.key";

/// Default secret field name and file name for the CA certificate
pub const DEFAULT_CA_CERT_NAME: &str = "ca.crt";

/// Default secret field name for the CA private key (never written to disk)
pub const DEFAULT_CA_KEY_NAME: &str = "ca.key";

/// Default CA validity window (10 years)
pub const DEFAULT_CA_CERT_DURATION: time::Duration = time::Duration::days(10 * 365);

/// Default period of the background rotation sweep (12 hours)
pub const DEFAULT_ROTATION_CHECK_FREQUENCY: std::time::Duration =
    std::time::Duration::from_secs(12 * 60 * 60);

/// Default lookahead margin: material expiring within this window is
/// considered stale and refreshed proactively (90 days)
pub const DEFAULT_LOOKAHEAD_INTERVAL: time::Duration = time::Duration::days(90);
