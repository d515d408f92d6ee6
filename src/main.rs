use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use ic_broker::{Bundle, MsalBrokerResultAdapter, keys};
use ic_core::{AuthenticationResult, BaseException, CommonConfig, LoggingConfig, logging};
use ic_storage::{
    EnvSecretProvider, FileNameValueStore, PassphraseKeyLoader, StorageEncryptionManager,
};
use ic_telemetry::LastRequestTelemetryCache;
use ic_telemetry::cache::LAST_REQUEST_TELEMETRY_STORE_NAME;
use tracing::debug;

/// Inspect broker bundles and persisted telemetry
#[derive(Parser)]
#[command(name = "identity-common", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode a JSON dump of a broker bundle
    Decode {
        /// Path to the bundle JSON
        bundle: PathBuf,
    },
    /// Print the persisted x-client-last-telemetry header
    LastTelemetry {
        /// Configuration file, defaults apply when omitted
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Decode { bundle } => {
            logging::init(&LoggingConfig::default());
            decode(&bundle).await
        }
        Commands::LastTelemetry { config } => last_telemetry(config.as_deref()).await,
    }
}

async fn decode(path: &Path) -> Result<()> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let bundle: Bundle = serde_json::from_str(&content).context("Failed to parse bundle JSON")?;
    debug!("Bundle keys: {:?}", bundle.keys().collect::<Vec<_>>());

    let adapter = MsalBrokerResultAdapter::new();

    if bundle.contains_key(keys::NEGOTIATED_BP_VERSION_KEY) || bundle.contains_key(keys::ERROR) {
        match adapter.verify_hello_from_result_bundle(Some(&bundle)) {
            Ok(version) => println!("Negotiated protocol version: {}", version),
            Err(e) => print_exception(&e),
        }
        return Ok(());
    }

    if bundle.contains_key(keys::BROKER_ACCOUNTS) || bundle.contains_key(keys::BROKER_ACCOUNTS_COMPRESSED) {
        match adapter.get_accounts_from_result_bundle(&bundle) {
            Ok(records) => {
                println!("{} account(s)", records.len());
                for record in records {
                    println!(
                        "  {} ({}) realm={}",
                        record.account.username, record.account.home_account_id, record.account.realm
                    );
                }
            }
            Err(e) => print_exception(&e),
        }
        return Ok(());
    }

    if bundle.contains_key(keys::BROKER_DEVICE_MODE) {
        match adapter.get_device_mode_from_result_bundle(&bundle) {
            Ok(shared) => println!("Shared device mode: {}", shared),
            Err(e) => print_exception(&e),
        }
        return Ok(());
    }

    if !bundle.contains_key(keys::BROKER_RESULT_V2)
        && !bundle.contains_key(keys::BROKER_RESULT_V2_COMPRESSED)
    {
        bail!("Bundle does not contain a broker result");
    }

    match adapter.get_acquire_token_result_from_result_bundle(&bundle) {
        Ok(result) => {
            let account = result.account_record();
            println!("Token result for {} ({})", account.username, account.home_account_id);
            println!("  tenant:        {}", result.tenant_id().unwrap_or("-"));
            println!("  scope:         {}", result.scope().join(" "));
            println!("  expires on:    {}", result.expires_on().to_rfc3339());
            println!("  refresh token: {}", result.refresh_token().is_some());
            println!("  from cache:    {}", result.is_serviced_from_cache());
            println!("  tenant profiles: {}", result.cache_record_with_tenant_profile_data().len());
        }
        Err(e) => print_exception(&e),
    }
    Ok(())
}

fn print_exception(exception: &BaseException) {
    println!("{}: {}", exception.exception_type().short_name(), exception);
    if let Some(correlation_id) = exception.correlation_id() {
        println!("  correlation id: {}", correlation_id);
    }
    if let Some(sub_error_code) = exception.sub_error_code() {
        println!("  sub error code: {}", sub_error_code);
    }
    if let Some(details) = exception.service_details() {
        println!("  http status:    {}", details.http_status_code);
    }
}

async fn last_telemetry(config_path: Option<&Path>) -> Result<()> {
    let config = match config_path {
        Some(path) => CommonConfig::load(path)
            .await
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => CommonConfig::default(),
    };
    logging::init(&config.logging);

    let storage_dir = config
        .storage
        .resolve_dir()
        .context("Failed to resolve storage directory")?;

    let encryption = if config.storage.encrypt {
        let loader = PassphraseKeyLoader::new(&storage_dir, Arc::new(EnvSecretProvider::default()));
        Some(Arc::new(StorageEncryptionManager::new(Arc::new(loader), Vec::new())))
    } else {
        None
    };

    let store = FileNameValueStore::new(&storage_dir, LAST_REQUEST_TELEMETRY_STORE_NAME, encryption)
        .await
        .context("Failed to open telemetry store")?;
    let cache = LastRequestTelemetryCache::new(Arc::new(store));

    let header = cache
        .get_header_string()
        .await
        .context("Failed to read last request telemetry")?;
    match header {
        Some(header) => println!("{}", header),
        None => println!("No last request telemetry stored"),
    }

    if let Some(telemetry) = cache.get_request_telemetry_from_cache().await {
        println!(
            "silent successes: {}, failed requests: {}",
            telemetry.silent_successful_count(),
            telemetry.failed_requests().len()
        );
    }
    Ok(())
}
