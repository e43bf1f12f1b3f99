use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result};
use clap::Parser;
use mdstash_core::{ItemCatalog, StaticCatalog};
use mdstash_server::{AuditLog, ServerConfig, StashServer};
use mdstash_world::SnapshotStore;
use tracing::info;

mod replay;

use replay::{Replay, ScriptedProducer};

/// Item ids accepted when no item table is configured.
const DEFAULT_ITEM_IDS: u16 = 1024;

#[derive(Parser, Debug)]
#[command(author, version, about = "Replay a JSONL action script through the mdstash engine", long_about = None)]
struct Args {
    /// Server configuration (TOML); defaults are used when omitted or unreadable
    #[arg(long)]
    config: Option<PathBuf>,

    /// JSONL script, one step per line
    #[arg(long)]
    script: PathBuf,

    /// Where to write outbound messages as JSONL (stdout when omitted)
    #[arg(long)]
    out: Option<PathBuf>,

    /// Override the snapshot directory from the configuration
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout stays pure JSONL.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => ServerConfig::load_from_path(path),
        None => ServerConfig::default(),
    };
    if let Some(dir) = args.data_dir {
        config.persistence.data_dir = dir;
    }

    let catalog: Arc<dyn ItemCatalog> = match &config.item_table {
        Some(path) => Arc::new(
            StaticCatalog::load_file(path)
                .with_context(|| format!("failed to load item table {}", path.display()))?,
        ),
        None => Arc::new(StaticCatalog::uniform(DEFAULT_ITEM_IDS)),
    };
    let store = SnapshotStore::new(&config.persistence.data_dir).with_context(|| {
        format!(
            "failed to open snapshot directory {}",
            config.persistence.data_dir.display()
        )
    })?;
    let audit = match &config.audit_log {
        Some(path) => AuditLog::create(path)
            .with_context(|| format!("failed to open audit log {}", path.display()))?,
        None => AuditLog::disabled(),
    };

    let steps = replay::load_script(&args.script)?;
    let out: Box<dyn Write> = match &args.out {
        Some(path) => Box::new(BufWriter::new(
            File::create(path)
                .with_context(|| format!("failed to create output {}", path.display()))?,
        )),
        None => Box::new(BufWriter::new(io::stdout())),
    };

    info!(
        script = %args.script.display(),
        steps = steps.len(),
        data_dir = %config.persistence.data_dir.display(),
        "starting replay"
    );
    let producer = Arc::new(ScriptedProducer::default());
    let server = StashServer::start(config, catalog, producer.clone(), Arc::new(store), audit);
    Replay::new(server, producer, out).run(&steps).await?;
    Ok(())
}
