//! Command line entrypoint for laneforge.
//!
//! Deliberately small: starting the server and validating a config file.
//! Admin/debug subcommands are out of scope.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "laneforge")]
#[command(about = "laneforge - workflow and saga execution engine")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Enable verbose startup logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress startup/recovery logging
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Configuration file path
    #[arg(short, long, default_value = "config/default.toml", global = true)]
    pub config: String,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the RPC server and the lane/saga engine
    Start {
        #[arg(short, long, default_value = "8080")]
        port: u16,

        #[arg(long, default_value = "0.0.0.0")]
        host: String,
    },
    /// Validate the configuration file without starting the server
    Config {
        #[arg(short, long)]
        validate: bool,
    },
}

pub fn parse_args() -> Cli {
    Cli::parse()
}
