//! TestDeck server daemon

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use testdeck_common::Database;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use testdeck_server::access::AccessPolicy;
use testdeck_server::aggregate::Aggregator;
use testdeck_server::config::{self, AppConfig};
use testdeck_server::executor::Executor;
use testdeck_server::http::{self, AppState};
use testdeck_server::queue::QueueWorker;
use testdeck_server::retention::RetentionWorker;
use testdeck_server::scheduler::ScheduleWorker;
use testdeck_server::store::Store;
use testdeck_server::{discovery, recovery};

#[derive(Parser)]
#[command(name = "testdeckd")]
#[command(about = "TestDeck - UI test orchestration and dashboard API")]
#[command(version)]
struct Cli {
    /// Directory holding app.config.json, environments.json, users.json
    #[arg(short, long, default_value = "config")]
    config_dir: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("TestDeck server v{}", env!("CARGO_PKG_VERSION"));

    let config_dir = std::env::var("CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or(cli.config_dir);
    let config = Arc::new(AppConfig::load(&config_dir)?);
    let policy = Arc::new(AccessPolicy::new(
        config::load_environments(&config_dir)?,
        config::load_users(&config_dir)?,
    ));

    tokio::fs::create_dir_all(&config.artifact_root).await?;
    if let Some(parent) = config.database_path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    // A migration failure aborts startup here
    let db = Database::open(&config.database_path)?;
    let store = Store::new(&db);
    let aggregator = Aggregator::new(&db);

    discovery::discover_and_sync(&store, &config.test_root)?;

    // Must complete before any worker starts: no stale non-terminal runs
    // may be visible once HTTP serving begins.
    recovery::recover_interrupted_runs(&store)?;

    let executor = Executor::new(store.clone(), &config);
    tokio::spawn(QueueWorker::new(store.clone(), executor, config.max_concurrent_runs).run());
    tokio::spawn(ScheduleWorker::new(store.clone()).run());
    tokio::spawn(
        RetentionWorker::new(
            store.clone(),
            db.clone(),
            config.artifact_root.clone(),
            config.retention_days,
        )
        .run(),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let state = AppState {
        store,
        aggregator,
        policy,
        config: config.clone(),
    };
    let server = tokio::spawn(http::serve(addr, state));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server => {
            if let Ok(Err(e)) = result {
                tracing::error!("HTTP server error: {}", e);
            }
        }
    }

    info!("Server shutdown complete");
    Ok(())
}
