#![forbid(unsafe_code)]

mod cmd;
mod fixture;
mod protocol;

use clap::{Parser, Subcommand};
use std::env;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "wb: query handle broker for safe bulk work item edits",
    long_about = None
)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Serve query handles over stdio",
        long_about = "Read one JSON request per line from stdin and write one JSON response per line to stdout.",
        after_help = "EXAMPLES:\n    # Serve against a fixture of work items\n    wb serve --fixture items.json\n\n    # Shorter sweep interval for a demo\n    WB_SWEEP_INTERVAL_SECS=5 wb serve --fixture items.json"
    )]
    Serve(cmd::serve::ServeArgs),

    #[command(
        about = "Print the effective configuration",
        after_help = "EXAMPLES:\n    wb config\n    wb config --config ./ci.toml"
    )]
    Config(cmd::config::ConfigArgs),
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("WB_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if env::var("DEBUG").is_ok() {
            "witbroker=debug,wb=debug,info"
        } else {
            "witbroker=info,wb=info,warn"
        })
    });

    let format = env::var("WB_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    // stdout carries protocol responses.
    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    if cli.verbose {
        info!("Verbose mode enabled");
    }

    let project_root = env::current_dir()?;

    match cli.command {
        Commands::Serve(ref args) => cmd::serve::run_serve(args, &project_root),
        Commands::Config(ref args) => cmd::config::run_config(args, &project_root),
    }
}
