use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use usage_sync_core::CheckpointStore;
use usage_sync_core::SourceSummary;

use crate::SourceArg;
use crate::print_json;

/// Summarizes persisted state. Makes no network calls.
#[derive(Debug, Parser)]
pub struct StatusCli {
    #[arg(long, value_enum, default_value_t = SourceArg::All)]
    source: SourceArg,
    #[arg(long)]
    pretty: bool,
}

pub fn run(cli: StatusCli, home: PathBuf) -> Result<()> {
    let mut summaries = Vec::new();
    for source in cli.source.sources() {
        let store = CheckpointStore::for_source(&home, source);
        let state = store
            .load()
            .with_context(|| format!("failed to read {}", store.path().display()))?;
        summaries.push(SourceSummary::new(source, &state));
    }
    print_json(&summaries, cli.pretty)
}
