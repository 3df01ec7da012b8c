mod cli;
mod commands;
mod error;

use clap::Parser;
use cli::{Cli, Command};
use error::CliError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    setup_tracing(cli.verbose);

    let result = dispatch(cli).await;
    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    let cwd = std::env::current_dir()?;
    match cli.command {
        Command::Run(args) => commands::run::run(args, cwd).await,
        Command::Check => commands::check::check(cwd).await,
        Command::Config(args) => commands::config::config(args, cwd).await,
    }
}

/// Log filter for a `-v` count.
///
/// Verbosity only raises the splice crates; hickory and other dependencies
/// stay at `warn` unless `SPLICE_LOG` says otherwise.
fn default_filter(verbose: u8) -> String {
    let level = match verbose {
        0 => return "warn".to_string(),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    format!("warn,splice={level},splice_relay={level},splice_settings={level}")
}

fn setup_tracing(verbose: u8) {
    let filter = tracing_subscriber::EnvFilter::try_from_env("SPLICE_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter(verbose)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose >= 2)
        .with_writer(std::io::stderr)
        .init();
}
