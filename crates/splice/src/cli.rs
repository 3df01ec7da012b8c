use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "splice", about = "Relay TCP connections to a single upstream without inspecting them")]
pub struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the relay and serve until interrupted
    Run(RunArgs),
    /// Validate the effective configuration and upstream resolution
    Check,
    /// Manage splice configuration
    Config(ConfigArgs),
}

#[derive(Args)]
pub struct RunArgs {
    /// Address to accept client connections on
    #[arg(long, value_name = "ADDR")]
    pub listen: Option<SocketAddr>,

    /// Upstream host name or IP address (selects the relay filter)
    #[arg(long, value_name = "HOST")]
    pub server_addr: Option<String>,

    /// Upstream port (selects the relay filter)
    #[arg(long, value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Load an additional config file on top of defaults
    #[arg(long = "config", value_name = "PATH")]
    pub extra_config: Option<PathBuf>,

    /// Ignore global and project config files
    #[arg(long)]
    pub no_config: bool,
}

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub subcommand: ConfigSubcommand,
}

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Write a starter config file
    Init {
        #[arg(long)]
        global: bool,
    },
    /// Print the effective merged configuration
    Show {
        #[arg(long, value_enum, default_value = "toml")]
        format: OutputFormat,
    },
}

#[derive(ValueEnum, Clone, Copy)]
pub enum OutputFormat {
    Toml,
    Json,
}
