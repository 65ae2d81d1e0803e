use std::sync::Arc;

use clap::Parser;
use netpulse::{
    collector::exec::ExecCollector,
    config::{StorageConfig, read_config_file},
    engine::MonitoringEngine,
    inventory::StaticInventory,
    storage::{MemoryBackend, StorageBackend},
};
use tracing::{debug, info, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short, long, env = "NETPULSE_CONFIG")]
    file: String,

    /// Run a single fast cycle, print the outcome and exit
    #[arg(long)]
    once: bool,
}

fn init() {
    dotenv::dotenv().ok();

    let filter = filter::Targets::new().with_targets(vec![
        ("netpulse", LevelFilter::DEBUG),
        ("netpulse_engine", LevelFilter::TRACE),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

async fn open_store(config: &StorageConfig) -> anyhow::Result<Arc<dyn StorageBackend>> {
    match config {
        StorageConfig::None => {
            info!("storage disabled, keeping everything in memory");
            Ok(Arc::new(MemoryBackend::new()))
        }
        #[cfg(feature = "storage-sqlite")]
        StorageConfig::Sqlite { path, .. } => {
            let backend = netpulse::storage::sqlite::SqliteBackend::new(path).await?;
            Ok(Arc::new(backend))
        }
        #[cfg(not(feature = "storage-sqlite"))]
        StorageConfig::Sqlite { .. } => {
            anyhow::bail!("built without SQLite support; set storage.backend to \"none\"")
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config = read_config_file(&args.file)?;

    let store = open_store(&config.storage).await?;
    let health = store.health_check().await?;
    debug!("storage health: {}", health.message);

    let inventory = Arc::new(StaticInventory::new(config.devices.clone()));
    let collector = Arc::new(ExecCollector::new(&config.collector));
    let engine = MonitoringEngine::new(config, store, inventory, collector)?;

    if args.once {
        let report = engine.trigger_check_all().await?;
        for device in &report.devices {
            let state = if device.outcome.is_reachable() {
                "reachable"
            } else {
                "unreachable"
            };
            println!("{:<24} {}", device.device_id, state);
        }
        for alert in engine.list_active_alerts().await? {
            println!("[{}] {} - {}", alert.severity, alert.title, alert.message);
        }
        engine.shutdown().await;
        return Ok(());
    }

    engine.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("received interrupt");

    engine.shutdown().await;
    Ok(())
}
