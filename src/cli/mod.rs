//! CLI command parsing.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::core::types::SpawnPurpose;

/// Python runtime provisioning and subprocess supervision for the agent backend.
#[derive(Parser)]
#[command(name = "agent-host")]
#[command(about = "Provision the agent backend runtime and supervise its processes")]
#[command(version)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Backend source directory.
    #[arg(short, long, global = true, env = "AGENT_HOST_SOURCE", default_value = ".")]
    pub source: PathBuf,

    /// Increase logging verbosity.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Ensure the Python runtime is ready and print its status.
    Check,

    /// Print the environment a spawned backend would receive.
    Env {
        /// Show which layer produced each value.
        #[arg(long)]
        origins: bool,

        /// Print credential values unmasked.
        #[arg(long)]
        show_secrets: bool,

        /// Extra variables, as KEY=VALUE.
        #[arg(short = 'e', long = "env", value_parser = parse_key_value)]
        overrides: Vec<(String, String)>,
    },

    /// Spawn a supervised process and print its outcome.
    Run(RunArgs),

    /// Resolve an executable through the augmented search path.
    Which {
        /// Executable name.
        name: String,
    },

    /// Manage configuration.
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Args)]
pub struct RunArgs {
    /// Spawn purpose; selects the timeout budget.
    #[arg(short, long, default_value = "agent-run")]
    pub purpose: SpawnPurpose,

    /// Working directory for the child (defaults to the source directory).
    #[arg(short = 'C', long)]
    pub cwd: Option<PathBuf>,

    /// Timeout in seconds, replacing the purpose budget.
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Extra variables, as KEY=VALUE.
    #[arg(short = 'e', long = "env", value_parser = parse_key_value)]
    pub overrides: Vec<(String, String)>,

    /// Program followed by its arguments. Omit the program to run the
    /// provisioned interpreter.
    #[arg(last = true)]
    pub command: Vec<String>,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the current configuration.
    Show,

    /// Show the configuration file path.
    Path,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))?;
    if key.is_empty() {
        return Err(format!("empty variable name in '{s}'"));
    }
    Ok((key.to_string(), value.to_string()))
}
