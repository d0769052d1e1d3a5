use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use sp_metadata_core::{MetadataResolver, MetadataStoreConfig, TableName};
use sp_metadata_store_sqlite::{SqliteMetadataStore, StoreOutcome};
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "spmd")]
#[command(about = "SAML service provider metadata store CLI")]
struct Cli {
    #[arg(long, default_value = "./sp_metadata.sqlite3")]
    db: PathBuf,

    /// YAML file with `entity_id` and `table_name`.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    entity_id: Option<String>,

    #[arg(long)]
    table: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the metadata table if it is missing.
    Init,
    /// Store a metadata document for the configured entity.
    Store(StoreArgs),
    /// Print the stored document for the configured entity.
    Show,
    /// Summarize the stored document through a metadata resolver.
    Resolve,
}

#[derive(Debug, Args)]
struct StoreArgs {
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    entity_id: Option<String>,
    table_name: Option<TableName>,
}

fn load_file_config(path: Option<&Path>) -> Result<FileConfig> {
    let Some(path) = path else {
        return Ok(FileConfig::default());
    };
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

fn resolve_config(cli: &Cli) -> Result<MetadataStoreConfig> {
    let file = load_file_config(cli.config.as_deref())?;

    let entity_id = cli
        .entity_id
        .clone()
        .or(file.entity_id)
        .ok_or_else(|| anyhow!("an entity id is required: pass --entity-id or set entity_id in --config"))?;

    let table_name = match &cli.table {
        Some(table) => TableName::new(table.as_str())?,
        None => file.table_name.unwrap_or_default(),
    };

    // spmd installs no signer, so signing is never requested.
    Ok(MetadataStoreConfig::new(entity_id).with_table_name(table_name))
}

fn open_store(cli: &Cli) -> Result<SqliteMetadataStore> {
    let config = resolve_config(cli)?;
    tracing::debug!(db = %cli.db.display(), table = %config.table_name, entity_id = %config.entity_id, "opening metadata store");
    SqliteMetadataStore::open(&cli.db, config)
        .with_context(|| format!("failed to open metadata store {}", cli.db.display()))
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
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut store = open_store(&cli)?;
    match &cli.command {
        Command::Init => run_init(&store),
        Command::Store(args) => run_store(&mut store, args),
        Command::Show => run_show(&store),
        Command::Resolve => run_resolve(&store),
    }
}

fn run_init(store: &SqliteMetadataStore) -> Result<()> {
    store
        .ensure_table()
        .with_context(|| format!("failed to create table {}", store.table_name()))?;
    emit_json(serde_json::json!({
        "table": store.table_name().as_str(),
        "ready": true
    }))
}

fn run_store(store: &mut SqliteMetadataStore, args: &StoreArgs) -> Result<()> {
    let metadata = fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read metadata file {}", args.file.display()))?;

    let outcome = store
        .store_metadata_with_outcome(&metadata, false)
        .with_context(|| format!("failed to store metadata for entity {}", store.entity_id()))?;

    let (kind, rows_affected) = match outcome {
        Some(StoreOutcome { kind, rows_affected }) => (kind.as_str(), rows_affected),
        None => ("skipped", 0),
    };

    emit_json(serde_json::json!({
        "entity_id": store.entity_id(),
        "stored": outcome.is_some_and(StoreOutcome::is_applied),
        "outcome": kind,
        "rows_affected": rows_affected
    }))
}

fn run_show(store: &SqliteMetadataStore) -> Result<()> {
    let metadata = store.fetch_metadata_text()?;
    let digest = Sha256::digest(metadata.as_bytes());

    emit_json(serde_json::json!({
        "entity_id": store.entity_id(),
        "sha256": format!("{digest:x}"),
        "metadata": metadata
    }))
}

fn run_resolve(store: &SqliteMetadataStore) -> Result<()> {
    let resolver = store
        .create_metadata_resolver()
        .with_context(|| format!("failed to build resolver for entity {}", store.entity_id()))?;
    emit_json(resolver_summary(&resolver, store.entity_id())?)
}

fn resolver_summary(resolver: &MetadataResolver, entity_id: &str) -> Result<Value> {
    let entity = resolver
        .resolve(entity_id)
        .ok_or_else(|| anyhow!("stored metadata does not describe entity {entity_id}"))?;

    Ok(serde_json::json!({
        "entity_id": entity.entity_id(),
        "entity_ids": resolver.entity_ids(),
        "signed": entity.is_signed(),
        "sp_sso_descriptor": entity.has_sp_sso_descriptor(),
        "authn_requests_signed": entity.authn_requests_signed(),
        "want_assertions_signed": entity.want_assertions_signed(),
        "assertion_consumer_services": entity.assertion_consumer_services(),
        "default_assertion_consumer_service": entity.default_assertion_consumer_service(),
        "single_logout_services": entity.single_logout_services(),
        "name_id_formats": entity.name_id_formats(),
        "signing_certificates": entity.signing_certificates().len(),
        "encryption_certificates": entity.encryption_certificates().len()
    }))
}
