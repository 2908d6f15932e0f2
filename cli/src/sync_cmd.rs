use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use tracing::info;
use usage_sync_core::CredentialStore;
use usage_sync_core::EnvCredentialStore;
use usage_sync_core::SyncConfig;
use usage_sync_core::SyncOrchestrator;

use crate::SourceArg;
use crate::print_json;

#[derive(Debug, Parser)]
pub struct SyncCli {
    /// Source to synchronize.
    #[arg(long, value_enum, default_value_t = SourceArg::All)]
    source: SourceArg,
    /// Pretty-print the JSON outcomes.
    #[arg(long)]
    pretty: bool,
}

/// Runs one pass per selected source and prints the outcomes. Returns
/// whether every pass succeeded.
pub async fn run(cli: SyncCli, home: PathBuf) -> Result<bool> {
    let config = SyncConfig::load(home.clone())
        .with_context(|| format!("failed to load configuration from {}", home.display()))?;
    let credentials: Arc<dyn CredentialStore> = Arc::new(EnvCredentialStore::new());
    let mut orchestrator =
        SyncOrchestrator::from_config(&config, credentials).context("failed to set up sources")?;

    let mut outcomes = Vec::new();
    for source in cli.source.sources() {
        let outcome = orchestrator.run_sync_pass(source).await;
        info!(%source, ok = outcome.ok, detail = %outcome.detail, "pass outcome");
        outcomes.push(outcome);
    }
    print_json(&outcomes, cli.pretty)?;
    Ok(outcomes.iter().all(|outcome| outcome.ok))
}
