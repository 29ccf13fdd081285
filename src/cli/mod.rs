//! CLI subcommand definitions and handlers.
//!
//! Uses clap derive to define the subcommand hierarchy:
//! - `start` (default) -- start the gateway server
//! - `config show|path` -- inspect the resolved configuration
//! - `version` -- print build/version info

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::config::{settings_path, ConfigError, Settings};
use crate::logging::LogFormat;

/// Switchyard local API gateway.
#[derive(Parser, Debug)]
#[command(
    name = "switchyard",
    version = env!("CARGO_PKG_VERSION"),
    about = "Switchyard — a local API gateway for pluggable capability providers"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway server (default when no subcommand is given).
    Start(StartArgs),

    /// Inspect the resolved configuration.
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Print version information.
    Version,
}

/// Server options. Flags beat env vars, which beat the settings file.
#[derive(Args, Debug, Default)]
pub struct StartArgs {
    /// Settings file path (default: SWITCHYARD_CONFIG_PATH or the state dir).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Bind host.
    #[arg(long)]
    pub host: Option<String>,

    /// Bind port.
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Log output format.
    #[arg(long, value_enum)]
    pub log_format: Option<LogFormatArg>,

    /// Log level or filter directives (e.g. "debug", "info,plugins=trace").
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormatArg {
    Json,
    Plain,
}

impl From<LogFormatArg> for LogFormat {
    fn from(value: LogFormatArg) -> Self {
        match value {
            LogFormatArg::Json => LogFormat::Json,
            LogFormatArg::Plain => LogFormat::Plaintext,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the effective settings after defaults and env overrides.
    Show,
    /// Print the settings file path.
    Path,
}

pub fn handle_config_show() -> Result<(), ConfigError> {
    let settings = Settings::load()?;
    println!("{settings:#?}");
    Ok(())
}

pub fn handle_config_path() {
    println!("{}", settings_path().display());
}

pub fn handle_version() {
    println!("switchyard {}", env!("CARGO_PKG_VERSION"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_no_subcommand_defaults_to_start() {
        let cli = Cli::parse_from(["switchyard"]);
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_start_accepts_server_flags() {
        let cli = Cli::parse_from([
            "switchyard",
            "start",
            "--config",
            "/tmp/switchyard.json5",
            "--host",
            "0.0.0.0",
            "--port",
            "14035",
            "--log-format",
            "json",
            "--log-level",
            "debug,plugins=trace",
        ]);
        let Some(Command::Start(args)) = cli.command else {
            panic!("expected the start subcommand");
        };
        assert_eq!(
            args.config.as_deref(),
            Some(std::path::Path::new("/tmp/switchyard.json5"))
        );
        assert_eq!(args.host.as_deref(), Some("0.0.0.0"));
        assert_eq!(args.port, Some(14035));
        assert_eq!(args.log_format, Some(LogFormatArg::Json));
        assert_eq!(args.log_level.as_deref(), Some("debug,plugins=trace"));
    }

    #[test]
    fn test_start_flags_default_to_none() {
        let cli = Cli::parse_from(["switchyard", "start"]);
        let Some(Command::Start(args)) = cli.command else {
            panic!("expected the start subcommand");
        };
        assert!(args.config.is_none());
        assert!(args.host.is_none());
        assert!(args.port.is_none());
        assert!(args.log_format.is_none());
        assert!(args.log_level.is_none());
    }

    #[test]
    fn test_config_path_subcommand_parses() {
        let cli = Cli::parse_from(["switchyard", "config", "path"]);
        assert!(matches!(
            cli.command,
            Some(Command::Config(ConfigCommand::Path))
        ));
    }
}
