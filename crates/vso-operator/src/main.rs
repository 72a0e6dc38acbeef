//! Vault secrets operator - Vault client management for Kubernetes

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::{Client, CustomResourceExt};
use tracing::{info, warn};

use vso_common::crd::{parse_duration, ObjectRef, VaultAuth, VaultConnection};
use vso_common::telemetry::{init_telemetry, shutdown_telemetry, LogFormat, TelemetryConfig};
use vso_common::{KubeObjectFetcher, DEFAULT_OPERATOR_NAMESPACE};
use vso_vault::{
    CachingClientFactory, ClientCallbackHandler, ClientEvents, ClientFactoryConfig,
    DEFAULT_CACHE_SIZE,
};

/// Vault secrets operator
#[derive(Parser, Debug)]
#[command(name = "vso-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Namespace the operator runs in
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = DEFAULT_OPERATOR_NAMESPACE)]
    operator_namespace: String,

    /// Maximum number of cached Vault clients
    #[arg(long, env = "VSO_CLIENT_CACHE_SIZE", default_value_t = DEFAULT_CACHE_SIZE)]
    client_cache_size: usize,

    /// VaultAuth (`name` or `namespace/name`) whose transit key encrypts persisted clients
    #[arg(long, env = "VSO_STORAGE_ENCRYPTION_AUTH")]
    storage_encryption_auth: Option<String>,

    /// Bound on storage encryption client setup (e.g. 30s, 2m)
    #[arg(
        long,
        env = "VSO_SETUP_TIMEOUT",
        default_value = "30s",
        value_parser = parse_cli_duration
    )]
    setup_timeout: Duration,

    /// Persist Vault client tokens to encrypted Secrets
    #[arg(long, env = "VSO_CLIENT_CACHE_PERSIST")]
    client_cache_persist: bool,

    /// How often dead clients are pruned from the cache
    #[arg(
        long,
        env = "VSO_PRUNE_INTERVAL",
        default_value = "1m",
        value_parser = parse_cli_duration
    )]
    prune_interval: Duration,

    /// OTLP endpoint for traces and metrics
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,

    /// Log output format (json or text)
    #[arg(long, env = "VSO_LOG_FORMAT", default_value = "json")]
    log_format: LogFormat,
}

fn parse_cli_duration(s: &str) -> Result<Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install aws-lc-rs crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        let auth = serde_yaml::to_string(&VaultAuth::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        let connection = serde_yaml::to_string(&VaultConnection::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{auth}---\n{connection}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        otlp_endpoint: cli.otlp_endpoint.clone(),
        log_format: cli.log_format,
        ..Default::default()
    })?;

    let storage_encryption_auth = cli
        .storage_encryption_auth
        .as_deref()
        .map(|r| ObjectRef::parse(r, &cli.operator_namespace))
        .transpose()?;
    let config = ClientFactoryConfig {
        operator_namespace: cli.operator_namespace.clone(),
        cache_size: cli.client_cache_size,
        storage_encryption_auth,
        setup_timeout: cli.setup_timeout,
        persist: cli.client_cache_persist,
    };

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;
    let fetcher = Arc::new(KubeObjectFetcher::new(client));
    let factory = CachingClientFactory::new(fetcher, config)?;

    factory.register_client_callback_handler(ClientCallbackHandler::new(
        ClientEvents::ALL,
        |client| async move {
            info!(
                cache_key = %client.cache_key(),
                method = %client.credential_provider().method(),
                "Vault client left service"
            );
        },
    ));

    if factory.config().storage_encryption_auth.is_some() {
        match factory.storage_encryption_client().await {
            Ok(client) => info!(cache_key = %client.cache_key(), "Storage encryption client ready"),
            Err(e) => warn!(
                error = %e,
                "Storage encryption client unavailable, will retry on demand"
            ),
        }
    }

    info!(namespace = %cli.operator_namespace, "Vault secrets operator started");
    run_until_shutdown(&factory, cli.prune_interval).await;

    factory.shutdown();
    info!("Vault secrets operator stopped");
    shutdown_telemetry();
    Ok(())
}

/// Prune dead clients periodically until SIGINT
async fn run_until_shutdown(factory: &CachingClientFactory, prune_interval: Duration) {
    let mut ticker = tokio::time::interval(prune_interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let pruned = factory.prune(|_, client| !client.is_valid()).await;
                if !pruned.is_empty() {
                    info!(count = pruned.len(), "Pruned dead Vault clients");
                }
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "Failed to listen for shutdown signal");
                }
                break;
            }
        }
    }
}
