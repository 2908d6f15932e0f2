use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use usage_sync_core::CredentialStore;
use usage_sync_core::EnvCredentialStore;
use usage_sync_core::SyncConfig;
use usage_sync_core::SyncOrchestrator;

use crate::SourceArg;
use crate::print_json;

/// Logs in (or validates the cached token) without fetching readings.
#[derive(Debug, Parser)]
pub struct CheckCli {
    #[arg(long, value_enum, default_value_t = SourceArg::All)]
    source: SourceArg,
    #[arg(long)]
    pretty: bool,
}

pub async fn run(cli: CheckCli, home: PathBuf) -> Result<bool> {
    let config = SyncConfig::load(home.clone())
        .with_context(|| format!("failed to load configuration from {}", home.display()))?;
    let credentials: Arc<dyn CredentialStore> = Arc::new(EnvCredentialStore::new());
    let mut orchestrator =
        SyncOrchestrator::from_config(&config, credentials).context("failed to set up sources")?;

    let mut outcomes = Vec::new();
    for source in cli.source.sources() {
        outcomes.push(orchestrator.check_source(source).await);
    }
    print_json(&outcomes, cli.pretty)?;
    Ok(outcomes.iter().all(|outcome| outcome.ok))
}
