pub mod config;
pub mod doctor;

use clap::{Parser, Subcommand};
use conduit_domain::Config;

/// conduit — a realtime WebSocket gateway for agent interactions.
#[derive(Debug, Parser)]
#[command(name = "conduit", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Override `server.host` from the config file.
    #[arg(long, global = true)]
    pub host: Option<String>,
    /// Override `server.port` from the config file.
    #[arg(long, global = true)]
    pub port: Option<u16>,
    /// Which built-in agent factory to run. `echo` is the only one shipped
    /// with this binary; a real model-backed factory is an external
    /// collaborator.
    #[arg(long, global = true, default_value = "echo")]
    pub agent_factory: String,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the gateway server (default when no subcommand is given).
    Serve,
    /// Run startup diagnostic checks against the current configuration.
    Doctor,
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print version information.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse the config file and report any errors.
    Validate,
    /// Dump the resolved configuration (with defaults) as TOML.
    Show,
}

/// Load the configuration from the path specified by `CONDUIT_CONFIG` (or
/// `config.toml` by default). Returns the parsed [`Config`] and the path
/// that was used.
///
/// This is shared by `serve`, `doctor`, and `config` subcommands so the
/// logic lives in one place.
pub fn load_config() -> anyhow::Result<(Config, String)> {
    let config_path = std::env::var("CONDUIT_CONFIG").unwrap_or_else(|_| "config.toml".into());

    let config = if std::path::Path::new(&config_path).exists() {
        let raw = std::fs::read_to_string(&config_path)
        .map_err(|e| anyhow::anyhow!("reading {config_path}: {e}"))?;
        toml::from_str(&raw).map_err(|e| anyhow::anyhow!("parsing {config_path}: {e}"))?
    } else {
        Config::default()
    };

    Ok((config, config_path))
}
