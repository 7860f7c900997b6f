//! testbed - end-to-end test environment orchestrator
//!
//! Brings up a backend (and optionally a secondary service), obtains
//! credentials, runs the test suite and tears the process trees down again.

use std::path::PathBuf;

use clap::{ArgAction, Parser};
use testbed::common::{logging, paths};
use testbed::{cli, commands::Commands};

#[derive(Parser)]
#[command(name = "testbed", about = "End-to-end test environment orchestrator")]
#[command(version, long_about = None)]
struct Cli {
    /// More log output (repeatable)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Less log output (repeatable)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    quiet: u8,

    /// Also log to a file; without a path, the user log directory is used
    #[arg(long, global = true, num_args = 0..=1, value_name = "PATH")]
    log_file: Option<Option<PathBuf>>,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let verbosity = cli.verbose.min(3) as i8 - cli.quiet.min(3) as i8;
    let log_file = match cli.log_file {
        Some(Some(path)) => Some(path),
        Some(None) => paths::default_log_file(),
        None => None,
    };
    let guard = logging::init_cli(verbosity, log_file.as_deref());

    let code = match cli::dispatch(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            1
        }
    };

    // process::exit skips destructors; flush the log file first
    drop(guard);
    std::process::exit(code);
}
