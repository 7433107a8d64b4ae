use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use vaultkeeper::backup::list_snapshots;
use vaultkeeper::{
    KeyProvider, KeychainKeyProvider, MasterKey, PassphraseKeyProvider, StaticKeyProvider,
    StoreConfig, StoreError, StoreManager,
};

const CLI_CONTRACT_VERSION: &str = "vk.v1";

#[derive(Debug, Parser)]
#[command(name = "vk")]
#[command(about = "Inspect and maintain an encrypted vaultkeeper store")]
struct Cli {
    /// Store file (defaults to the platform data directory)
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// JSON file with store settings; --store overrides its path
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    key: KeyArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct KeyArgs {
    /// Raw 32-byte store key as hex
    #[arg(long, global = true, env = "VK_KEY_HEX", hide_env_values = true, conflicts_with = "passphrase_env")]
    key_hex: Option<String>,

    /// Name of an environment variable holding a passphrase
    #[arg(long, global = true)]
    passphrase_env: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Open the store, encrypting and migrating it when needed
    Init,
    /// Report schema version and snapshots
    Status,
    /// Re-encrypt the store under a new key
    Rekey(RekeyArgs),
    Vacuum,
    Reindex,
    /// Move a user id and every reference to it
    MigrateId(MigrateIdArgs),
    /// List pre-migration snapshots
    Backups,
}

#[derive(Debug, Args)]
struct RekeyArgs {
    #[arg(long)]
    new_key_hex: String,
}

#[derive(Debug, Args)]
struct MigrateIdArgs {
    #[arg(long)]
    old: String,
    #[arg(long)]
    new: String,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("vaultkeeper=info,vk=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<StoreConfig> {
    let mut config = match &cli.config {
        Some(path) => StoreConfig::from_json_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => StoreConfig::default(),
    };
    if let Some(store) = &cli.store {
        config.path.clone_from(store);
    }
    config.validate()?;
    Ok(config)
}

fn key_provider(args: &KeyArgs, config: &StoreConfig) -> Result<Box<dyn KeyProvider>> {
    if let Some(hex_key) = &args.key_hex {
        let key = MasterKey::from_hex(hex_key).context("--key-hex must be 64 hex characters")?;
        return Ok(Box::new(StaticKeyProvider::new(key)));
    }
    if let Some(var) = &args.passphrase_env {
        let passphrase = std::env::var(var).with_context(|| format!("environment variable {var} is not set"))?;
        let salt_path = PassphraseKeyProvider::salt_path_for(&config.path);
        return Ok(Box::new(PassphraseKeyProvider::new(passphrase, salt_path)));
    }
    Ok(Box::new(KeychainKeyProvider::default()))
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn error_json(err: &anyhow::Error) -> Value {
    match err.downcast_ref::<StoreError>() {
        Some(store_err) => json!({
            "error": {
                "code": store_err.code(),
                "category": store_err.category(),
                "message": format!("{err:#}"),
                "user_message": store_err.user_message(),
            }
        }),
        None => json!({
            "error": {
                "code": "CLI_ERROR",
                "message": format!("{err:#}"),
            }
        }),
    }
}

fn display_paths(paths: &[PathBuf]) -> Vec<String> {
    paths.iter().map(|p| p.display().to_string()).collect()
}

fn opened(config: StoreConfig, keys: Box<dyn KeyProvider>) -> Result<StoreManager> {
    let mut manager = StoreManager::new(config, keys);
    manager.initialize()?;
    Ok(manager)
}

fn run(cli: &Cli) -> Result<Value> {
    let config = load_config(cli)?;
    let store = config.path.display().to_string();

    // Listing snapshots needs no key and must not open (and so migrate) the store
    if matches!(cli.command, Command::Backups) {
        let snapshots = list_snapshots(&config.path)
            .with_context(|| format!("failed to list snapshots next to {store}"))?;
        return Ok(json!({ "store": store, "snapshots": display_paths(&snapshots) }));
    }

    let keys = key_provider(&cli.key, &config)?;
    let mut manager = opened(config, keys)?;

    let value = match &cli.command {
        Command::Init => json!({
            "store": store,
            "initialized": manager.is_initialized(),
            "report": manager.last_init(),
        }),
        Command::Status => json!({
            "store": store,
            "schema": manager.schema_status()?,
            "snapshots": display_paths(&manager.snapshots()?),
        }),
        Command::Rekey(args) => {
            let new_key = MasterKey::from_hex(&args.new_key_hex).context("--new-key-hex must be 64 hex characters")?;
            manager.rekey(&new_key)?;
            json!({ "store": store, "rekeyed": true })
        }
        Command::Vacuum => {
            manager.vacuum()?;
            json!({ "store": store, "vacuumed": true })
        }
        Command::Reindex => json!({ "store": store, "reindex": manager.reindex()? }),
        Command::MigrateId(args) => json!({
            "store": store,
            "remap": manager.migrate_identifier(&args.old, &args.new)?,
        }),
        Command::Backups => json!({ "store": store }),
    };

    manager.close()?;
    Ok(value)
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let outcome = run(&cli).and_then(emit_json);
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "command failed");
            if let Err(emit_err) = emit_json(error_json(&err)) {
                eprintln!("Error: {err:#} ({emit_err})");
            }
            ExitCode::FAILURE
        }
    }
}
