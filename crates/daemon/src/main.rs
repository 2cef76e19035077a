//! scythed: the CSAF advisory ingestion daemon.

mod store;

use anyhow::{Context, Result};
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use scythe_core::config::AppConfig;
use scythe_csaf::{HttpKeysLoader, HttpPmdLoader};
use scythe_db::Database;
use scythe_sources::Manager;
use std::sync::Arc;
use store::PgDocumentStore;
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// scythe - a CSAF advisory ingestion daemon
#[derive(Parser, Debug)]
#[command(name = "scythed")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "SCYTHE_CONFIG",
        default_value = "config/scythed.toml"
    )]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config: AppConfig = Figment::new()
        .merge(Toml::file(&args.config))
        .merge(Env::prefixed("SCYTHE_").split("__"))
        .extract()
        .context("loading configuration failed")?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_new(&config.log.filter).context("invalid log filter")?)
        .with(tracing_subscriber::fmt::layer())
        .init();

    config
        .sources
        .validate()
        .map_err(anyhow::Error::msg)
        .context("invalid sources configuration")?;
    if config.sources.encryption_secret.is_empty() {
        tracing::warn!(
            "sources.encryption_secret is empty; stored credentials are only as safe as the database"
        );
    }

    let db = Database::connect(&config.database)
        .await
        .context("connecting to the database failed")?;
    db.ensure_schema()
        .await
        .context("preparing the database schema failed")?;

    let document_store = Arc::new(PgDocumentStore::new(db.clone()));
    document_store
        .ensure_schema()
        .await
        .context("preparing the advisory store failed")?;

    let pmd_loader = Arc::new(HttpPmdLoader::new().context("building PMD loader failed")?);
    let keys_loader = Arc::new(HttpKeysLoader::new().context("building keys loader failed")?);

    let (mut manager, handle) = Manager::new(
        config.sources.clone(),
        db,
        pmd_loader,
        keys_loader,
        None,
        document_store,
    );
    manager
        .boot()
        .await
        .context("booting source manager failed")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let manager_task = tokio::spawn(manager.run(shutdown_rx));
    tracing::info!("source manager running");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal failed")?;
    tracing::info!("shutting down");
    let _ = shutdown_tx.send(true);
    drop(handle);
    manager_task.await.context("manager task failed")?;
    Ok(())
}
