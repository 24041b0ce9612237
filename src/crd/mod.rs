//! External-data `Provider` resource definition
//!
//! External-data providers (`externaldata.gatekeeper.sh/v1beta1`) are HTTPS
//! endpoints an admission controller calls out to; each carries the CA
//! bundle it should be trusted with. Unlike the admission and aggregation
//! objects, the bundle here is a base64 *string* field rather than a raw
//! byte field.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Spec of an external-data provider endpoint
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, CustomResource)]
#[kube(
    group = "externaldata.gatekeeper.sh",
    version = "v1beta1",
    kind = "Provider"
)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSpec {
    /// HTTPS endpoint of the provider
    pub url: String,

    /// Request timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i32>,

    /// Base64-encoded CA certificate bundle clients use to trust `url`
    #[serde(default)]
    pub ca_bundle: String,
}
