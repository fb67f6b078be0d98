use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use tracing::{info, warn};
use trellis_core::app::BuildError;
use trellis_core::{App, AppBuilder, CollabError, TrellisConfig};

use crate::http;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Print the effective configuration as YAML
    Show,

    /// Load and validate the configuration
    Validate,
}

fn load_config(explicit: Option<&Path>) -> Result<TrellisConfig> {
    let (config, source) =
        TrellisConfig::load_or_default(explicit).context("failed to load configuration")?;
    match source {
        Some(path) => info!(path = %path.display(), "configuration loaded"),
        None => info!("using default configuration"),
    }
    Ok(config)
}

/// One process owns a data directory; the others go through its HTTP API.
async fn open(config: TrellisConfig) -> Result<App> {
    match AppBuilder::new().config(config).build().await {
        Ok(app) => Ok(app),
        Err(BuildError::Storage(CollabError::DirLocked { path, pid })) => bail!(
            "{path} is held by process {pid}; if that is `trellis serve`, use its HTTP API \
             instead (POST /leases/sweep, POST /reconcile, GET /status, GET /events)"
        ),
        Err(e) => Err(e).context("failed to open the store"),
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn serve(
    explicit: Option<&Path>,
    host: Option<String>,
    port: Option<u16>,
    reconcile_first: bool,
) -> Result<()> {
    let mut config = load_config(explicit)?;
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    let addr = config.bind_address();
    let app = Arc::new(open(config).await?);

    if reconcile_first {
        let report = app.reconciler.run().await.context("startup reconciliation failed")?;
        if !report.backfilled.is_empty() {
            warn!(
                backfilled = report.backfilled.len(),
                "task transitions were missing from the event log"
            );
        }
    }

    let reaper = app.spawn_reaper();
    let served = http::serve(Arc::clone(&app), &addr).await;
    reaper.shutdown_and_join().await;
    served
}

pub async fn sweep(explicit: Option<&Path>) -> Result<()> {
    let app = open(load_config(explicit)?).await?;
    let reclaimed = app.reaper().sweep_once().await.context("sweep failed")?;
    for lock_id in &reclaimed {
        println!("{lock_id}");
    }
    info!(count = reclaimed.len(), "sweep finished");
    Ok(())
}

pub async fn reconcile(explicit: Option<&Path>) -> Result<()> {
    let app = open(load_config(explicit)?).await?;
    let report = app.reconciler.run().await.context("reconciliation failed")?;
    print_json(&report)
}

pub async fn status(explicit: Option<&Path>) -> Result<()> {
    let app = open(load_config(explicit)?).await?;
    print_json(&app.status().await?)
}

pub async fn events(explicit: Option<&Path>, since: u64) -> Result<()> {
    let app = open(load_config(explicit)?).await?;
    for event in app.journal.read_since(since).await? {
        println!("{}", serde_json::to_string(&event)?);
    }
    Ok(())
}

pub fn config(command: ConfigCommand, explicit: Option<&Path>) -> Result<()> {
    let config = load_config(explicit)?;
    match command {
        ConfigCommand::Show => {
            print!("{}", config.to_yaml().context("failed to render configuration")?);
        }
        ConfigCommand::Validate => {
            config.validate()?;
            println!("configuration is valid");
        }
    }
    Ok(())
}
