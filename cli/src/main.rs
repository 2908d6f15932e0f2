use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use usage_sync_cli::check_cmd;
use usage_sync_cli::check_cmd::CheckCli;
use usage_sync_cli::load_dotenv;
use usage_sync_cli::resolve_home;
use usage_sync_cli::status_cmd;
use usage_sync_cli::status_cmd::StatusCli;
use usage_sync_cli::sync_cmd;
use usage_sync_cli::sync_cmd::SyncCli;

const DEFAULT_LOG_FILTER: &str = "usage_sync_core=info,usage_sync_cli=info";

/// Incremental sync of utility-portal and thermostat readings.
///
/// Outcomes are printed to stdout as JSON; logs go to stderr.
#[derive(Debug, Parser)]
#[command(author, version)]
struct MultitoolCli {
    /// Data directory. Defaults to $USAGE_SYNC_HOME, then ~/.usage-sync.
    #[arg(long, global = true, value_name = "DIR")]
    home: Option<PathBuf>,

    #[command(subcommand)]
    subcommand: Subcommand,
}

#[derive(Debug, clap::Subcommand)]
enum Subcommand {
    /// Run one sync pass per source.
    Sync(SyncCli),

    /// Verify credentials and cached tokens.
    Check(CheckCli),

    /// Show what has been synced so far.
    Status(StatusCli),
}

fn setup_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = MultitoolCli::parse();
    setup_tracing();
    let home = resolve_home(cli.home)?;
    load_dotenv(&home);

    let all_ok = match cli.subcommand {
        Subcommand::Sync(sync_cli) => sync_cmd::run(sync_cli, home).await?,
        Subcommand::Check(check_cli) => check_cmd::run(check_cli, home).await?,
        Subcommand::Status(status_cli) => {
            status_cmd::run(status_cli, home)?;
            true
        }
    };
    Ok(if all_ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
