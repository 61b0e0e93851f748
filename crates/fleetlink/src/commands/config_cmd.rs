//! Config subcommand handlers.

use std::path::PathBuf;

use fleetlink_config::{self as config, Config, ConfigError};

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts};
use crate::error::CliError;

/// The file `--config` names, or the platform default.
pub fn resolve_path(global: &GlobalOpts) -> PathBuf {
    global.config.clone().unwrap_or_else(config::config_path)
}

/// `path` and `init` work even when the current file does not parse.
pub fn handle(
    args: &ConfigArgs,
    global: &GlobalOpts,
    loaded: Result<Config, ConfigError>,
) -> Result<(), CliError> {
    let path = resolve_path(global);
    match args.command {
        ConfigCommand::Path => {
            println!("{}", path.display());
        }
        ConfigCommand::Init { force } => {
            config::save_config(&Config::default(), &path, force)?;
            eprintln!("Wrote default configuration to {}", path.display());
        }
        ConfigCommand::Show => {
            print!("{}", toml::to_string_pretty(&loaded?)?);
        }
        ConfigCommand::Check => {
            let resolved = loaded?;
            let fleet = resolved.to_fleet_config()?;
            println!(
                "Configuration OK: listening on {}, service '{}', {} circuit override(s)",
                resolved.bind_addr()?,
                fleet.service.name,
                fleet.circuit_overrides.len()
            );
        }
    }
    Ok(())
}
