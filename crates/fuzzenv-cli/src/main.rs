mod commands;
mod telemetry;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::Level;

/// EX_USAGE from sysexits.h. clap's own code 2 would read as a tool failure.
const EXIT_USAGE: u8 = 64;

#[derive(Parser)]
#[command(name = "fuzzenv", version)]
#[command(about = "Provision a reproducible fuzzing build environment")]
struct Cli {
    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Install packages and tools, check out sources, and stage scripts
    Provision {
        /// Path to the config file
        #[arg(short, long, default_value = "fuzzenv.toml")]
        config: PathBuf,

        /// Give up after this many seconds
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,

        /// Print the steps without running them
        #[arg(long)]
        dry_run: bool,
    },

    /// Validate the config file
    Check {
        /// Path to the config file
        #[arg(short, long, default_value = "fuzzenv.toml")]
        config: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let usage = e.use_stderr();
            // --help and --version are not errors
            let _ = e.print();
            return if usage {
                ExitCode::from(EXIT_USAGE)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    telemetry::init_tracing(cli.json_logs, level);

    match cli.command {
        Command::Provision {
            config,
            timeout,
            dry_run,
        } => {
            if dry_run {
                commands::provision::dry_run(&config)
            } else {
                commands::provision::run(&config, timeout)
            }
        }
        Command::Check { config } => commands::check::run(&config),
    }
}
