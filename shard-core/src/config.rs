//! Configuration management for the relay
//!
//! Handles CLI argument parsing, config file loading, and defaults.

use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Parser, Debug)]
#[command(name = "shard")]
#[command(about = "Relay indexing on-chain host announcements", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Follow the chain and serve the host index
    Start(StartCommand),
    /// Resolve a host public key to its announced address via a relay
    Resolve(ResolveCommand),
    /// Find the full host key matching a prefix via a relay
    Lookup(LookupCommand),
}

#[derive(Args, Debug, Clone)]
pub struct StartCommand {
    /// Directory holding the saved host index
    #[arg(long, default_value = "./data")]
    pub data_dir: PathBuf,

    /// HTTP port for the query API
    #[arg(long, default_value_t = 8080)]
    pub api_port: u16,

    /// Base URL of the chain node to follow
    #[arg(long, default_value = "http://127.0.0.1:9980")]
    pub upstream: String,

    /// Seconds between polls of the upstream chain node
    #[arg(long, default_value_t = 10)]
    pub poll_interval_secs: u64,

    /// Seconds between the first unsaved change and the save that captures it
    #[arg(long, default_value_t = 120)]
    pub save_delay_secs: u64,

    /// Logging level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// TOML config file; replaces every other start option
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct ResolveCommand {
    /// Relay address; https is assumed without a scheme
    #[arg(long)]
    pub server: String,

    /// Host public key, e.g. ed25519:<hex>
    pub pubkey: String,

    #[arg(long, default_value = "warn")]
    pub log_level: String,
}

#[derive(Args, Debug, Clone)]
pub struct LookupCommand {
    /// Relay address; https is assumed without a scheme
    #[arg(long)]
    pub server: String,

    /// Key prefix, with or without the ed25519: tag
    pub prefix: String,

    #[arg(long, default_value = "warn")]
    pub log_level: String,
}

/// What the binary was asked to do
#[derive(Debug, Clone)]
pub enum Command {
    Start(Config),
    Resolve(ResolveCommand),
    Lookup(LookupCommand),
}

impl Command {
    /// Parse the process arguments, loading the config file if one is named
    pub fn from_cli() -> Result<Self, ConfigError> {
        Self::from_cli_args(Cli::parse())
    }

    fn from_cli_args(cli: Cli) -> Result<Self, ConfigError> {
        match cli.command {
            Commands::Start(cmd) => {
                let config = match &cmd.config {
                    Some(path) => Config::load_from_file(path)?,
                    None => cmd.into(),
                };
                config.validate()?;
                Ok(Command::Start(config))
            }
            Commands::Resolve(cmd) => Ok(Command::Resolve(cmd)),
            Commands::Lookup(cmd) => Ok(Command::Lookup(cmd)),
        }
    }

    pub fn log_level(&self) -> &str {
        match self {
            Command::Start(config) => &config.log_level,
            Command::Resolve(cmd) => &cmd.log_level,
            Command::Lookup(cmd) => &cmd.log_level,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub api_port: u16,
    pub upstream: String,
    pub poll_interval_secs: u64,
    pub save_delay_secs: u64,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: PathBuf::from("./data"),
            api_port: 8080,
            upstream: "http://127.0.0.1:9980".to_string(),
            poll_interval_secs: 10,
            save_delay_secs: 120,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load config from a TOML file; missing keys take their defaults
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.upstream.is_empty() {
            return Err(ConfigError::Invalid("upstream must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn save_delay(&self) -> Duration {
        Duration::from_secs(self.save_delay_secs)
    }
}

impl From<StartCommand> for Config {
    fn from(cmd: StartCommand) -> Self {
        Config {
            data_dir: cmd.data_dir,
            api_port: cmd.api_port,
            upstream: cmd.upstream,
            poll_interval_secs: cmd.poll_interval_secs,
            save_delay_secs: cmd.save_delay_secs,
            log_level: cmd.log_level,
        }
    }
}
