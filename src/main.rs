//! cert-rotator - standalone certificate rotation controller

use std::path::PathBuf;

use clap::Parser;
use kube::Client;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cert_rotator::{CertRotator, RotatorConfig, SecretRef, WebhookInfo, WebhookType};

/// Keeps a webhook's serving certificates and consumer CA bundles rotated
#[derive(Parser, Debug)]
#[command(name = "cert-rotator", version, about, long_about = None)]
struct Cli {
    /// Directory where certificate files are written
    #[arg(long, default_value = "/certs")]
    cert_dir: PathBuf,

    /// Common name of the generated CA
    #[arg(long, default_value = "cert-rotator-ca")]
    ca_name: String,

    /// Organization of the generated CA
    #[arg(long, default_value = "cert-rotator")]
    ca_organization: String,

    /// Name of the secret holding the certificate material
    #[arg(long, env = "SECRET_NAME")]
    secret_name: String,

    /// Namespace of the secret (also scopes the rotator's secret cache)
    #[arg(long, env = "POD_NAMESPACE")]
    namespace: String,

    /// Name of the webhook service; used to derive the DNS name when
    /// --dns-name is not given
    #[arg(long, default_value = "webhook-service")]
    service_name: String,

    /// DNS name the serving certificate is issued for; defaults to
    /// <service-name>.<namespace>.svc
    #[arg(long)]
    dns_name: Option<String>,

    /// Additional DNS names on the serving certificate
    #[arg(long = "extra-dns-name")]
    extra_dns_names: Vec<String>,

    /// Name of the consumer resource to keep in sync
    #[arg(long)]
    webhook_name: String,

    /// Kind of the consumer resource (mutating, validating,
    /// crd-conversion, api-service, external-data-provider)
    #[arg(long, default_value = "mutating")]
    webhook_type: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let webhook_type: WebhookType = cli
        .webhook_type
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid --webhook-type: {}", e))?;
    let dns_name = cli
        .dns_name
        .unwrap_or_else(|| format!("{}.{}.svc", cli.service_name, cli.namespace));

    let config = RotatorConfig {
        secret: SecretRef::new(cli.namespace, cli.secret_name),
        cert_dir: cli.cert_dir,
        ca_name: cli.ca_name,
        ca_organization: cli.ca_organization,
        dns_name,
        extra_dns_names: cli.extra_dns_names,
        webhooks: vec![WebhookInfo::new(cli.webhook_name, webhook_type)],
        ..Default::default()
    };

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {}", e))?;

    tracing::info!(secret = %config.secret, dns_name = %config.dns_name, "setting up cert rotation");
    let rotator = CertRotator::new(client, config)?;

    let mut ready = rotator.ready();
    tokio::spawn(async move {
        if ready.wait().await {
            tracing::info!("certificate material ready");
        }
    });

    rotator.run().await?;
    Ok(())
}
