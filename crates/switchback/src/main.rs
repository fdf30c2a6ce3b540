//! The Switchback CLI.
//!
//! Provides the `switchback` command with the following subcommands:
//!
//! - `switchback fetch <URL>...` - Fetch each URL as its own unit of work on
//!   one reactor, printing `<url> <status> <bytes>` per success
//! - `switchback simulate` - Run many units against out-of-order timer
//!   completions and check each one got its own result
//!
//! Options:
//! - `--verbose` - Debug-level logging (otherwise `RUST_LOG`, default `info`)

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod fetch;
mod simulate;

#[derive(Parser)]
#[command(name = "switchback", version, about = "Blocking-style units of work on a callback reactor")]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch URLs, one unit of work per URL
    Fetch {
        /// URLs to fetch
        #[arg(required = true)]
        urls: Vec<String>,

        /// Runtime configuration file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Per-request timeout in milliseconds (overrides the config file)
        #[arg(long = "timeout-ms")]
        timeout_ms: Option<u64>,

        /// Write failure detail into each unit's output
        #[arg(long)]
        debug: bool,
    },
    /// Resume many parked units with out-of-order completions
    Simulate {
        /// Number of units of work
        #[arg(long, default_value = "1000")]
        units: usize,

        /// Upper bound for each operation's random delay
        #[arg(long = "max-delay-ms", default_value = "50")]
        max_delay_ms: u64,

        /// Seed for the delay generator (random if omitted)
        #[arg(long)]
        seed: Option<u64>,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::Fetch {
            urls,
            config,
            timeout_ms,
            debug,
        } => fetch::run(&urls, config.as_deref(), timeout_ms, debug),
        Commands::Simulate {
            units,
            max_delay_ms,
            seed,
        } => simulate::run(units, max_delay_ms, seed),
    };

    match result {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            eprintln!("error: {:#}", e);
            process::exit(1);
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
