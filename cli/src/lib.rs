pub mod check_cmd;
pub mod status_cmd;
pub mod sync_cmd;

use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use clap::ValueEnum;
use serde::Serialize;
use usage_sync_core::SourceId;
use usage_sync_core::find_home;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SourceArg {
    Utility,
    Thermostat,
    All,
}

impl SourceArg {
    pub fn sources(self) -> Vec<SourceId> {
        match self {
            SourceArg::Utility => vec![SourceId::Utility],
            SourceArg::Thermostat => vec![SourceId::Thermostat],
            SourceArg::All => SourceId::ALL.to_vec(),
        }
    }
}

/// `--home` when given, otherwise `USAGE_SYNC_HOME` or `~/.usage-sync`.
pub fn resolve_home(flag: Option<PathBuf>) -> Result<PathBuf> {
    match flag {
        Some(home) => Ok(home),
        None => find_home().context("failed to resolve the data directory"),
    }
}

/// Seeds the environment from `<home>/.env` and `./.env`. Variables that
/// are already set win.
pub fn load_dotenv(home: &std::path::Path) {
    let _ = dotenvy::from_path(home.join(".env"));
    let _ = dotenvy::dotenv();
}

pub fn print_json<T: Serialize + ?Sized>(value: &T, pretty: bool) -> Result<()> {
    let rendered = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{rendered}");
    Ok(())
}
