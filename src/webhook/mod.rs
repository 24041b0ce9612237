//! Consumer resources that must trust the rotated CA
//!
//! Every consumer is a cluster object with one or more CA-bundle fields
//! that must stay byte-equal to the current CA certificate: admission
//! webhook configurations (one bundle per `webhooks[]` entry), CRDs with
//! webhook conversion, aggregated API services, and external-data
//! providers.
//!
//! Each configured kind gets its own controller. It watches the kind
//! itself (so a third party zeroing a bundle is repaired) and the backing
//! secret (so a CA refresh propagates without waiting for a consumer
//! edit). The reconciler compares the live bundle against the CA from the
//! shared secret reader and submits an update only on divergence.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::APIService;
use k8s_openapi::ByteString;
use kube::api::{Api, PostParams};
use kube::core::ClusterResourceScope;
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{watcher, Controller};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::retry::retry_cluster_write;
use crate::rotator::RotatorShared;
use crate::{Error, Result};

/// How long a consumer reconcile waits before retrying after an error
/// (secret not yet healthy, transient API failure)
const CONSUMER_REQUEUE: Duration = Duration::from_secs(10);

/// The kinds of consumer resources the rotator can keep in sync
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WebhookType {
    /// `MutatingWebhookConfiguration`
    Mutating,
    /// `ValidatingWebhookConfiguration`
    Validating,
    /// `CustomResourceDefinition` with webhook conversion
    CrdConversion,
    /// Aggregated `APIService` registration
    ApiService,
    /// External-data `Provider`
    ExternalDataProvider,
}

impl std::fmt::Display for WebhookType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Mutating => "mutating",
            Self::Validating => "validating",
            Self::CrdConversion => "crd-conversion",
            Self::ApiService => "api-service",
            Self::ExternalDataProvider => "external-data-provider",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for WebhookType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "mutating" => Ok(Self::Mutating),
            "validating" => Ok(Self::Validating),
            "crd-conversion" => Ok(Self::CrdConversion),
            "api-service" => Ok(Self::ApiService),
            "external-data-provider" => Ok(Self::ExternalDataProvider),
            _ => Err(Error::config(format!(
                "invalid webhook type: {s}, expected one of: mutating, validating, \
                 crd-conversion, api-service, external-data-provider"
            ))),
        }
    }
}

/// A consumer resource the rotator keeps in sync, identified by kind and
/// name
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WebhookInfo {
    /// Object name (cluster-scoped for every supported kind)
    pub name: String,
    /// Which kind of consumer this is
    pub kind: WebhookType,
}

impl WebhookInfo {
    /// Convenience constructor
    pub fn new(name: impl Into<String>, kind: WebhookType) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// A cluster object carrying CA-bundle fields the rotator owns.
///
/// Implementations locate every bundle field within the object and replace
/// it with the given bytes, reporting whether anything actually changed so
/// the reconciler can skip no-op updates.
pub trait CaBundleTarget: Resource<DynamicType = (), Scope = ClusterResourceScope> {
    /// Write `ca_pem` into every CA-bundle field. Returns `true` if any
    /// field changed.
    fn set_ca_bundle(&mut self, ca_pem: &[u8]) -> bool;
}

impl CaBundleTarget for MutatingWebhookConfiguration {
    fn set_ca_bundle(&mut self, ca_pem: &[u8]) -> bool {
        let mut changed = false;
        for wh in self.webhooks.iter_mut().flatten() {
            changed |= set_bundle_bytes(&mut wh.client_config.ca_bundle, ca_pem);
        }
        changed
    }
}

impl CaBundleTarget for ValidatingWebhookConfiguration {
    fn set_ca_bundle(&mut self, ca_pem: &[u8]) -> bool {
        let mut changed = false;
        for wh in self.webhooks.iter_mut().flatten() {
            changed |= set_bundle_bytes(&mut wh.client_config.ca_bundle, ca_pem);
        }
        changed
    }
}

impl CaBundleTarget for CustomResourceDefinition {
    // only the conversion webhook's client config is touched; strategy,
    // versions and the rest of the spec pass through untouched
    fn set_ca_bundle(&mut self, ca_pem: &[u8]) -> bool {
        let Some(webhook) = self
            .spec
            .conversion
            .as_mut()
            .and_then(|conversion| conversion.webhook.as_mut())
        else {
            return false;
        };
        let client_config = webhook.client_config.get_or_insert_with(Default::default);
        set_bundle_bytes(&mut client_config.ca_bundle, ca_pem)
    }
}

impl CaBundleTarget for APIService {
    fn set_ca_bundle(&mut self, ca_pem: &[u8]) -> bool {
        match self.spec.as_mut() {
            Some(spec) => set_bundle_bytes(&mut spec.ca_bundle, ca_pem),
            None => false,
        }
    }
}

impl CaBundleTarget for crate::crd::Provider {
    // the provider carries its bundle as a base64 string, not raw bytes
    fn set_ca_bundle(&mut self, ca_pem: &[u8]) -> bool {
        let desired = BASE64.encode(ca_pem);
        if self.spec.ca_bundle == desired {
            return false;
        }
        self.spec.ca_bundle = desired;
        true
    }
}

fn set_bundle_bytes(field: &mut Option<ByteString>, ca_pem: &[u8]) -> bool {
    if field.as_ref().is_some_and(|current| current.0 == ca_pem) {
        return false;
    }
    *field = Some(ByteString(ca_pem.to_vec()));
    true
}

/// Build the controller future for every configured consumer of `kind`.
pub(crate) fn consumer_task(
    kind: WebhookType,
    shared: Arc<RotatorShared>,
    names: BTreeSet<String>,
) -> BoxFuture<'static, ()> {
    match kind {
        WebhookType::Mutating => {
            run_consumer_controller::<MutatingWebhookConfiguration>(shared, names).boxed()
        }
        WebhookType::Validating => {
            run_consumer_controller::<ValidatingWebhookConfiguration>(shared, names).boxed()
        }
        WebhookType::CrdConversion => {
            run_consumer_controller::<CustomResourceDefinition>(shared, names).boxed()
        }
        WebhookType::ApiService => run_consumer_controller::<APIService>(shared, names).boxed(),
        WebhookType::ExternalDataProvider => {
            run_consumer_controller::<crate::crd::Provider>(shared, names).boxed()
        }
    }
}

struct ConsumerContext {
    shared: Arc<RotatorShared>,
    names: BTreeSet<String>,
}

async fn run_consumer_controller<K>(shared: Arc<RotatorShared>, names: BTreeSet<String>)
where
    K: CaBundleTarget
        + Clone
        + std::fmt::Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static,
{
    let api: Api<K> = Api::all(shared.client().clone());
    let secrets = shared.secrets_api();
    let secret_watch = shared.secret_watch_config();

    let mapped_names: Arc<Vec<String>> = Arc::new(names.iter().cloned().collect());
    let ctx = Arc::new(ConsumerContext { shared, names });

    Controller::new(api, watcher::Config::default())
        // a secret refresh re-enqueues every configured consumer of this kind
        .watches(secrets, secret_watch, move |_secret| {
            mapped_names
                .iter()
                .map(|name| ObjectRef::<K>::new(name))
                .collect::<Vec<_>>()
        })
        .shutdown_on_signal()
        .run(reconcile_consumer::<K>, consumer_error_policy::<K>, ctx)
        .for_each(|result| async move {
            match result {
                Ok(obj) => debug!(object = ?obj, "consumer reconciliation completed"),
                Err(error) => error!(%error, "consumer reconciliation error"),
            }
        })
        .await;
}

async fn reconcile_consumer<K>(obj: Arc<K>, ctx: Arc<ConsumerContext>) -> Result<Action>
where
    K: CaBundleTarget
        + Clone
        + std::fmt::Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static,
{
    let name = obj.name_any();
    if !ctx.names.contains(&name) {
        return Ok(Action::await_change());
    }

    // in on-demand mode there is no background sweep; this path is what
    // generates or rotates the certificate material
    if ctx.shared.rotate_on_demand() {
        ctx.shared.refresh_certs_if_needed().await?;
    }

    let ca_pem = ctx.shared.current_ca_pem().await?;
    ensure_bundle::<K>(&ctx.shared, &name, &ca_pem).await?;
    Ok(Action::await_change())
}

fn consumer_error_policy<K>(obj: Arc<K>, error: &Error, _ctx: Arc<ConsumerContext>) -> Action
where
    K: CaBundleTarget + Clone + std::fmt::Debug + DeserializeOwned + Send + Sync + 'static,
{
    error!(
        kind = %K::kind(&()),
        name = %obj.name_any(),
        %error,
        "consumer reconcile failed, will retry"
    );
    Action::requeue(CONSUMER_REQUEUE)
}

/// Fetch the object, rewrite its bundle fields and update it, retrying
/// (bounded, with backoff) on conflicts and transient failures.
async fn ensure_bundle<K>(shared: &RotatorShared, name: &str, ca_pem: &[u8]) -> Result<()>
where
    K: CaBundleTarget
        + Clone
        + std::fmt::Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static,
{
    let api: Api<K> = Api::all(shared.client().clone());

    retry_cluster_write("update CA bundle", 5, || {
        let api = api.clone();
        let ca_pem = ca_pem.to_vec();
        async move {
            let mut obj = api.get(name).await?;
            if obj.set_ca_bundle(&ca_pem) {
                api.replace(name, &PostParams::default(), &obj).await?;
                info!(kind = %K::kind(&()), name, "CA bundle updated");
            } else {
                debug!(kind = %K::kind(&()), name, "CA bundle already current");
            }
            Ok(())
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::admissionregistration::v1::{
        MutatingWebhook, ValidatingWebhook, WebhookClientConfig,
    };
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
        CustomResourceConversion, CustomResourceDefinitionNames, CustomResourceDefinitionSpec,
        CustomResourceDefinitionVersion, WebhookConversion,
    };
    use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::APIServiceSpec;

    use crate::crd::{Provider, ProviderSpec};

    const CA: &[u8] = b"-----BEGIN CERTIFICATE-----\nfake\n-----END CERTIFICATE-----\n";

    fn admission_entry<T>(make: impl Fn(WebhookClientConfig) -> T) -> T {
        make(WebhookClientConfig {
            url: Some("https://localhost/webhook".to_string()),
            ..Default::default()
        })
    }

    #[test]
    fn webhook_type_round_trips_through_strings() {
        for kind in [
            WebhookType::Mutating,
            WebhookType::Validating,
            WebhookType::CrdConversion,
            WebhookType::ApiService,
            WebhookType::ExternalDataProvider,
        ] {
            let parsed: WebhookType = kind.to_string().parse().expect("round trip");
            assert_eq!(parsed, kind);
        }
        assert!("sidecar".parse::<WebhookType>().is_err());
    }

    #[test]
    fn mutating_config_gets_bundle_in_every_entry() {
        let mut config = MutatingWebhookConfiguration {
            webhooks: Some(vec![
                admission_entry(|client_config| MutatingWebhook {
                    name: "a.example.com".to_string(),
                    client_config,
                    ..Default::default()
                }),
                admission_entry(|client_config| MutatingWebhook {
                    name: "b.example.com".to_string(),
                    client_config,
                    ..Default::default()
                }),
            ]),
            ..Default::default()
        };

        assert!(config.set_ca_bundle(CA));
        for wh in config.webhooks.as_ref().expect("webhooks") {
            assert_eq!(wh.client_config.ca_bundle.as_ref().expect("bundle").0, CA);
        }

        // second application is a no-op
        assert!(!config.set_ca_bundle(CA));
    }

    #[test]
    fn validating_config_repairs_a_zeroed_entry() {
        let mut config = ValidatingWebhookConfiguration {
            webhooks: Some(vec![admission_entry(|client_config| ValidatingWebhook {
                name: "testpolicy.kubernetes.io".to_string(),
                client_config,
                ..Default::default()
            })]),
            ..Default::default()
        };

        assert!(config.set_ca_bundle(CA));

        // a third party wipes the bundle
        config.webhooks.as_mut().expect("webhooks")[0]
            .client_config
            .ca_bundle = Some(ByteString(Vec::new()));
        assert!(config.set_ca_bundle(CA));
        assert_eq!(
            config.webhooks.as_ref().expect("webhooks")[0]
                .client_config
                .ca_bundle
                .as_ref()
                .expect("bundle")
                .0,
            CA
        );
    }

    fn conversion_crd() -> CustomResourceDefinition {
        CustomResourceDefinition {
            spec: CustomResourceDefinitionSpec {
                group: "example.com".to_string(),
                names: CustomResourceDefinitionNames {
                    kind: "TestCRD".to_string(),
                    plural: "testcrds".to_string(),
                    ..Default::default()
                },
                scope: "Namespaced".to_string(),
                conversion: Some(CustomResourceConversion {
                    strategy: "Webhook".to_string(),
                    webhook: Some(WebhookConversion {
                        client_config: None,
                        conversion_review_versions: vec!["v1".to_string()],
                    }),
                }),
                versions: vec![CustomResourceDefinitionVersion {
                    name: "v1alpha1".to_string(),
                    served: true,
                    storage: true,
                    ..Default::default()
                }],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn crd_conversion_bundle_preserves_surrounding_spec() {
        let mut crd = conversion_crd();
        assert!(crd.set_ca_bundle(CA));

        let conversion = crd.spec.conversion.as_ref().expect("conversion");
        assert_eq!(conversion.strategy, "Webhook");
        let bundle = conversion
            .webhook
            .as_ref()
            .expect("webhook")
            .client_config
            .as_ref()
            .expect("client config")
            .ca_bundle
            .as_ref()
            .expect("bundle");
        assert_eq!(bundle.0, CA);

        // versions untouched
        assert_eq!(crd.spec.versions.len(), 1);
        assert_eq!(crd.spec.versions[0].name, "v1alpha1");

        assert!(!crd.set_ca_bundle(CA));
    }

    #[test]
    fn crd_without_conversion_webhook_is_left_alone() {
        let mut crd = conversion_crd();
        crd.spec.conversion = None;
        assert!(!crd.set_ca_bundle(CA));
        assert!(crd.spec.conversion.is_none());
    }

    #[test]
    fn api_service_bundle_is_top_level() {
        let mut api_service = APIService {
            spec: Some(APIServiceSpec {
                group: Some("example.com".to_string()),
                version: Some("v1alpha1".to_string()),
                group_priority_minimum: 1,
                version_priority: 1,
                ..Default::default()
            }),
            ..Default::default()
        };

        assert!(api_service.set_ca_bundle(CA));
        assert_eq!(
            api_service.spec.as_ref().expect("spec").ca_bundle.as_ref().expect("bundle").0,
            CA
        );
        assert!(!api_service.set_ca_bundle(CA));
    }

    #[test]
    fn provider_bundle_is_base64_encoded() {
        let mut provider = Provider::new(
            "my-provider",
            ProviderSpec {
                url: "https://my-provider:8080".to_string(),
                timeout: Some(10),
                ca_bundle: "c3RhbGU=".to_string(),
            },
        );

        assert!(provider.set_ca_bundle(CA));
        assert_eq!(provider.spec.ca_bundle, BASE64.encode(CA));
        assert!(!provider.set_ca_bundle(CA));
    }
}
