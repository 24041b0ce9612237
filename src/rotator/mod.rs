//! The certificate rotator: secret reconciler and orchestrator
//!
//! The rotator owns the backing secret. It runs a synchronous pre-cache
//! pass at startup (through a direct client, so certificate files exist on
//! disk before the HTTPS server starts and before any watch cache is
//! warm), then keeps the material fresh through three triggers: secret
//! watch events, a periodic sweep that catches silent expiry, and - in
//! on-demand mode - consumer reconciles invoking the refresh inline.
//!
//! A CA refresh always cascades to the leaf in the same secret update; a
//! leaf-only refresh never touches the CA fields. After every successful
//! pass the PEM blobs are mirrored to the certificate directory and the
//! one-shot readiness signal is latched.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::{watcher, Controller, WatchStreamExt};
use kube::Client;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use crate::pki::{self, ExtKeyUsage, KeyPairArtifacts};
use crate::ready::{ReadyFlag, ReadySignal};
use crate::retry::{self, retry_cluster_write};
use crate::secret::{self, SecretFields};
use crate::webhook::{self, WebhookInfo, WebhookType};
use crate::{publish, Error, Result};

/// Bounded immediate retries when a secret update hits an
/// optimistic-concurrency conflict
const SECRET_CONFLICT_RETRIES: u32 = 5;

/// (namespace, name) of the backing secret. The namespace also scopes the
/// rotator's secret cache.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SecretRef {
    /// Namespace holding the secret (and bounding the informer)
    pub namespace: String,
    /// Name of the secret
    pub name: String,
}

impl SecretRef {
    /// Convenience constructor
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for SecretRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Injectable time source.
///
/// Every freshness decision reads time through this, which keeps the
/// lookahead logic deterministic under test.
#[derive(Clone)]
pub struct Clock(Arc<dyn Fn() -> OffsetDateTime + Send + Sync>);

impl Clock {
    /// The system clock (UTC)
    pub fn system() -> Self {
        Self(Arc::new(OffsetDateTime::now_utc))
    }

    /// A clock pinned to a fixed instant
    pub fn fixed(at: OffsetDateTime) -> Self {
        Self(Arc::new(move || at))
    }

    /// A clock driven by an arbitrary function
    pub fn from_fn(f: impl Fn() -> OffsetDateTime + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// The current instant according to this clock
    pub fn now(&self) -> OffsetDateTime {
        (self.0)()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Clock")
    }
}

/// Rotator configuration, frozen at construction
#[derive(Clone, Debug)]
pub struct RotatorConfig {
    /// The backing secret; its namespace scopes the secret cache
    pub secret: SecretRef,
    /// Directory the HTTPS server reads certificate files from
    pub cert_dir: PathBuf,
    /// CA subject common name
    pub ca_name: String,
    /// CA subject organization
    pub ca_organization: String,
    /// Primary SAN and common name of the serving certificate
    pub dns_name: String,
    /// Additional SANs on the serving certificate
    pub extra_dns_names: Vec<String>,
    /// Secret field / file name for the serving certificate
    pub cert_name: String,
    /// Secret field / file name for the serving private key
    pub key_name: String,
    /// Secret field / file name for the CA certificate
    pub ca_cert_name: String,
    /// Secret field name for the CA private key (never written to disk)
    pub ca_key_name: String,
    /// Validity window of generated material
    pub ca_cert_duration: time::Duration,
    /// Period of the background rotation sweep
    pub rotation_check_frequency: std::time::Duration,
    /// Freshness margin: material expiring within this window is rotated
    pub lookahead_interval: time::Duration,
    /// Extended key usages required on the serving certificate
    pub ext_key_usages: Vec<ExtKeyUsage>,
    /// Consumer resources whose CA-bundle fields track the CA
    pub webhooks: Vec<WebhookInfo>,
    /// Whether the embedder should gate [`CertRotator::run`] on leader
    /// election (the pre-cache pass still runs on every replica)
    pub require_leader_election: bool,
    /// When false, the readiness flag starts latched
    pub enable_readiness_check: bool,
    /// Disable the background sweep and secret controller; consumer
    /// reconciles refresh the material inline instead. Makes rotation
    /// deterministic for tests and embedders that drive refresh themselves.
    pub rotate_on_demand: bool,
    /// Time source for freshness decisions
    pub clock: Clock,
}

impl Default for RotatorConfig {
    fn default() -> Self {
        Self {
            secret: SecretRef::default(),
            cert_dir: PathBuf::new(),
            ca_name: String::new(),
            ca_organization: String::new(),
            dns_name: String::new(),
            extra_dns_names: Vec::new(),
            cert_name: crate::DEFAULT_CERT_NAME.to_string(),
            key_name: crate::DEFAULT_KEY_NAME.to_string(),
            ca_cert_name: crate::DEFAULT_CA_CERT_NAME.to_string(),
            ca_key_name: crate::DEFAULT_CA_KEY_NAME.to_string(),
            ca_cert_duration: crate::DEFAULT_CA_CERT_DURATION,
            rotation_check_frequency: crate::DEFAULT_ROTATION_CHECK_FREQUENCY,
            lookahead_interval: crate::DEFAULT_LOOKAHEAD_INTERVAL,
            ext_key_usages: vec![ExtKeyUsage::ServerAuth],
            webhooks: Vec::new(),
            require_leader_election: false,
            enable_readiness_check: true,
            rotate_on_demand: false,
            clock: Clock::default(),
        }
    }
}

impl RotatorConfig {
    /// Validate the configuration. Called by [`CertRotator::new`]; errors
    /// here are fatal at startup.
    pub fn validate(&self) -> Result<()> {
        if self.secret.namespace.is_empty() {
            return Err(Error::config("secret namespace must not be empty"));
        }
        if self.secret.name.is_empty() {
            return Err(Error::config("secret name must not be empty"));
        }
        if self.cert_dir.as_os_str().is_empty() {
            return Err(Error::config("cert dir must not be empty"));
        }
        if self.dns_name.is_empty() {
            return Err(Error::config("dns name must not be empty"));
        }
        if !self.ca_cert_duration.is_positive() {
            return Err(Error::config("ca cert duration must be positive"));
        }
        if self.rotation_check_frequency.is_zero() {
            return Err(Error::config("rotation check frequency must be positive"));
        }
        if let Some(wh) = self.webhooks.iter().find(|wh| wh.name.is_empty()) {
            return Err(Error::config(format!(
                "webhook of type {} has an empty name",
                wh.kind
            )));
        }
        Ok(())
    }

    fn fields(&self) -> SecretFields {
        SecretFields {
            cert: self.cert_name.clone(),
            key: self.key_name.clone(),
            ca_cert: self.ca_cert_name.clone(),
            ca_key: self.ca_key_name.clone(),
        }
    }
}

/// What a refresh pass has to regenerate
enum RefreshScope {
    /// CA is fine; regenerate only the leaf against it
    LeafOnly(KeyPairArtifacts),
    /// CA missing, corrupt or stale; regenerate CA and leaf together
    Full,
}

/// Decide the minimum refresh scope for the secret's current contents.
/// `None` means everything is fresh and no mutation is needed.
fn evaluate(config: &RotatorConfig, fields: &SecretFields, secret: &Secret) -> Option<RefreshScope> {
    let lookahead = config.clock.now() + config.lookahead_interval;

    let ca = match secret::artifacts_from_secret(secret, fields) {
        Ok(ca) => ca,
        Err(error) => {
            debug!(%error, "CA material unusable, rebuilding CA and leaf");
            return Some(RefreshScope::Full);
        }
    };
    let ca_fresh = pki::valid_ca_cert(ca.cert_pem(), ca.key_pem())
        && pki::cert_valid_at(ca.cert_pem(), lookahead).unwrap_or(false);
    if !ca_fresh {
        return Some(RefreshScope::Full);
    }

    match secret::serving_pair_from_secret(secret, fields) {
        Ok((cert, key))
            if pki::valid_server_cert(
                ca.cert_pem(),
                &cert,
                &key,
                &config.dns_name,
                &config.extra_dns_names,
                &config.ext_key_usages,
                lookahead,
            ) =>
        {
            None
        }
        _ => Some(RefreshScope::LeafOnly(ca)),
    }
}

/// Generate the material a refresh scope calls for. Returns the CA (new or
/// carried over) and the fresh leaf pair.
fn refresh_material(
    config: &RotatorConfig,
    scope: RefreshScope,
) -> Result<(KeyPairArtifacts, Vec<u8>, Vec<u8>)> {
    let now = config.clock.now();
    // the backdated begin absorbs clock skew between issuer and verifiers
    let begin = now - time::Duration::hours(1);
    let end = now + config.ca_cert_duration;

    let (ca, scope) = match scope {
        RefreshScope::LeafOnly(ca) => (ca, "leaf"),
        RefreshScope::Full => (
            pki::create_ca_cert(&config.ca_name, &config.ca_organization, begin, end)?,
            "ca+leaf",
        ),
    };
    let (cert, key) = pki::create_cert_pem(
        &ca,
        &config.dns_name,
        &config.extra_dns_names,
        &config.ext_key_usages,
        begin,
        end,
    )?;
    info!(scope, dns_name = %config.dns_name, "certificate material refreshed");
    Ok((ca, cert, key))
}

/// Shared state behind every reconciler of one rotator instance
pub(crate) struct RotatorShared {
    config: RotatorConfig,
    fields: SecretFields,
    client: Client,
    ready: ReadySignal,
    store: Store<Secret>,
}

impl RotatorShared {
    pub(crate) fn client(&self) -> &Client {
        &self.client
    }

    pub(crate) fn rotate_on_demand(&self) -> bool {
        self.config.rotate_on_demand
    }

    pub(crate) fn secrets_api(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.config.secret.namespace)
    }

    pub(crate) fn secret_watch_config(&self) -> watcher::Config {
        watcher::Config::default().fields(&format!("metadata.name={}", self.config.secret.name))
    }

    fn empty_secret(&self) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(self.config.secret.name.clone()),
                namespace: Some(self.config.secret.namespace.clone()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// The current CA certificate PEM, read through the shared cache with
    /// a direct-client fallback for the window before the cache warms up.
    pub(crate) async fn current_ca_pem(&self) -> Result<Vec<u8>> {
        let key = ObjectRef::<Secret>::new(&self.config.secret.name)
            .within(&self.config.secret.namespace);
        let secret = match self.store.get(&key) {
            Some(secret) => secret,
            None => Arc::new(self.secrets_api().get(&self.config.secret.name).await?),
        };
        let ca = secret::artifacts_from_secret(&secret, &self.fields)?;
        Ok(ca.cert_pem().to_vec())
    }

    /// The secret reconcile pass: read (or create) the secret, regenerate
    /// whatever is missing or stale, mirror the files to disk, latch the
    /// readiness signal. Idempotent; safe to invoke from any trigger.
    ///
    /// Always uses a direct client so the pre-cache invocation cannot
    /// deadlock waiting on its own watch.
    pub(crate) async fn refresh_certs_if_needed(&self) -> Result<()> {
        let api = self.secrets_api();
        let name = &self.config.secret.name;
        let mut conflicts = 0u32;

        let secret = loop {
            let mut secret = match api.get_opt(name).await? {
                Some(secret) => secret,
                None => {
                    info!(secret = %self.config.secret, "backing secret missing, creating");
                    match api.create(&PostParams::default(), &self.empty_secret()).await {
                        Ok(secret) => secret,
                        // lost the creation race; re-read what won
                        Err(error) if retry::is_conflict(&error) => continue,
                        Err(error) => return Err(error.into()),
                    }
                }
            };

            let Some(scope) = evaluate(&self.config, &self.fields, &secret) else {
                debug!(secret = %self.config.secret, "certificate material is fresh");
                break secret;
            };

            let (ca, cert, key) = refresh_material(&self.config, scope)?;
            secret::populate_secret(&mut secret, &cert, &key, &self.fields, &ca);

            match api.replace(name, &PostParams::default(), &secret).await {
                Ok(updated) => {
                    info!(secret = %self.config.secret, "backing secret updated");
                    break updated;
                }
                Err(error) if retry::is_conflict(&error) && conflicts < SECRET_CONFLICT_RETRIES => {
                    conflicts += 1;
                    debug!(
                        secret = %self.config.secret,
                        attempt = conflicts,
                        "conflict updating secret, re-reading"
                    );
                }
                Err(error) => return Err(error.into()),
            }
        };

        self.publish_files(&secret).await?;
        self.ready.signal();
        Ok(())
    }

    /// Mirror the three public blobs to the certificate directory. The CA
    /// private key stays in the secret.
    async fn publish_files(&self, secret: &Secret) -> Result<()> {
        let ca = secret::artifacts_from_secret(secret, &self.fields)?;
        let (cert, key) = secret::serving_pair_from_secret(secret, &self.fields)?;

        let dir = &self.config.cert_dir;
        publish::publish_file(dir, &self.fields.cert, &cert).await?;
        publish::publish_file(dir, &self.fields.key, &key).await?;
        publish::publish_file(dir, &self.fields.ca_cert, ca.cert_pem()).await?;
        Ok(())
    }
}

/// The certificate rotation controller.
///
/// Construction validates the configuration; [`CertRotator::run`] performs
/// the pre-cache pass and then drives the secret and consumer reconcilers
/// until shutdown.
pub struct CertRotator {
    shared: Arc<RotatorShared>,
    reflector_writer: reflector::store::Writer<Secret>,
}

impl CertRotator {
    /// Create a rotator from a client and configuration.
    ///
    /// Fails fast on invalid configuration (empty secret reference, cert
    /// dir or DNS name).
    pub fn new(client: Client, config: RotatorConfig) -> Result<Self> {
        config.validate()?;
        let fields = config.fields();
        let ready = ReadySignal::new(!config.enable_readiness_check);
        let (store, writer) = reflector::store();
        Ok(Self {
            shared: Arc::new(RotatorShared {
                config,
                fields,
                client,
                ready,
                store,
            }),
            reflector_writer: writer,
        })
    }

    /// Observer handle for the one-shot readiness signal. The embedding
    /// process should await it before starting its HTTPS listener.
    pub fn ready(&self) -> ReadyFlag {
        self.shared.ready.subscribe()
    }

    /// The namespace-scoped secret cache. Populated once [`run`] has
    /// started its reflector; lists exactly the backing secret's
    /// namespace.
    ///
    /// [`run`]: CertRotator::run
    pub fn secret_reader(&self) -> Store<Secret> {
        self.shared.store.clone()
    }

    /// Whether the embedder should gate [`CertRotator::run`] on its leader
    /// election primitive. [`CertRotator::bootstrap_certs`] must still run
    /// on every replica so each one has files on disk before its own HTTPS
    /// server starts.
    pub fn requires_leader_election(&self) -> bool {
        self.shared.config.require_leader_election
    }

    /// The pre-cache pass: synchronously ensure the secret holds valid
    /// material and the files exist on disk, using a direct client.
    ///
    /// Blocks (with bounded retries on transient API failures) until the
    /// secret exists in a valid state or has just been populated. [`run`]
    /// invokes this itself; replicas that gate [`run`] on leader election
    /// call it directly at startup.
    ///
    /// [`run`]: CertRotator::run
    pub async fn bootstrap_certs(&self) -> Result<()> {
        let shared = &self.shared;
        retry_cluster_write("initial certificate refresh", 10, || {
            shared.refresh_certs_if_needed()
        })
        .await
    }

    /// Run the rotator until shutdown.
    ///
    /// Performs the pre-cache pass, then drives the secret reflector, the
    /// secret controller and periodic sweep (unless `rotate_on_demand` is
    /// set), and one consumer controller per configured kind. Returns when
    /// a termination signal stops the controllers.
    pub async fn run(self) -> Result<()> {
        self.bootstrap_certs().await?;

        let shared = self.shared;
        let mut tasks: Vec<BoxFuture<'static, ()>> = Vec::new();

        // reflector keeping the namespace-scoped secret cache warm
        let reflect = reflector::reflector(
            self.reflector_writer,
            watcher(shared.secrets_api(), shared.secret_watch_config()).default_backoff(),
        );
        tasks.push(
            reflect
                .touched_objects()
                .for_each(|result| async {
                    if let Err(error) = result {
                        warn!(%error, "secret reflector stream error");
                    }
                })
                .boxed(),
        );

        if !shared.config.rotate_on_demand {
            tasks.push(secret_controller(shared.clone()).boxed());
            tasks.push(rotation_sweep(shared.clone()).boxed());
        }

        let mut by_kind: BTreeMap<WebhookType, BTreeSet<String>> = BTreeMap::new();
        for wh in &shared.config.webhooks {
            by_kind.entry(wh.kind).or_default().insert(wh.name.clone());
        }
        for (kind, names) in by_kind {
            info!(%kind, count = names.len(), "starting consumer reconciler");
            tasks.push(webhook::consumer_task(kind, shared.clone(), names));
        }

        // the reflector never finishes on its own; the first controller to
        // observe the termination signal ends the rotator
        let (_, _, _) = futures::future::select_all(tasks).await;
        info!("cert rotator shutting down");
        Ok(())
    }
}

/// Watch-driven secret reconciles: any create or update of the backing
/// secret re-runs the refresh logic.
async fn secret_controller(shared: Arc<RotatorShared>) {
    Controller::new(shared.secrets_api(), shared.secret_watch_config())
        .shutdown_on_signal()
        .run(reconcile_secret, secret_error_policy, shared.clone())
        .for_each(|result| async move {
            match result {
                Ok(obj) => debug!(object = ?obj, "secret reconciliation completed"),
                Err(error) => error!(%error, "secret reconciliation error"),
            }
        })
        .await;
}

async fn reconcile_secret(_secret: Arc<Secret>, shared: Arc<RotatorShared>) -> Result<Action> {
    shared.refresh_certs_if_needed().await?;
    Ok(Action::await_change())
}

fn secret_error_policy(_secret: Arc<Secret>, error: &Error, shared: Arc<RotatorShared>) -> Action {
    error!(secret = %shared.config.secret, %error, "secret reconcile failed, will retry");
    Action::requeue(std::time::Duration::from_secs(5))
}

/// Periodic sweep: refreshes on a timer even without watch events, which
/// also recovers from outright deletion of the secret.
async fn rotation_sweep(shared: Arc<RotatorShared>) {
    let mut ticker = tokio::time::interval(shared.config.rotation_check_frequency);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Err(error) = shared.refresh_certs_if_needed().await {
            error!(secret = %shared.config.secret, %error, "rotation sweep failed");
        }
    }
}
