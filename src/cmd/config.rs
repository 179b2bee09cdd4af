//! Configuration view and validation commands: `shipwright config`.

use std::path::Path;

use anyhow::{Context, Result};

use shipwright::config::ShipwrightConfig;

use super::super::ConfigCommands;

pub fn cmd_config(
    config_path: &Path,
    config: &ShipwrightConfig,
    command: Option<ConfigCommands>,
) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            if config_path.exists() {
                println!("# Config file: {}", config_path.display());
            } else {
                println!("# No config file at {}; using defaults", config_path.display());
            }
            println!("# Effective values (file, environment and defaults)");
            println!();
            let rendered =
                toml::to_string_pretty(config).context("Failed to render configuration")?;
            print!("{rendered}");
        }
        Some(ConfigCommands::Validate) => {
            config.validate()?;
            println!("Configuration is valid");
        }
    }
    Ok(())
}
