//! Configuration view and validation commands: `conductor config`.

use std::path::Path;

use anyhow::{Context, Result};
use conductor::config::ConductorToml;

use super::super::ConfigCommands;

pub fn cmd_config(config_path: &Path, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No config file at {}, using defaults", config_path.display());
            }
            println!();

            let mut config = ConductorToml::load_or_default(config_path)?;
            config.apply_env();
            let rendered = toml::to_string_pretty(&config.masked())
                .context("Failed to render configuration")?;
            println!("{}", rendered);
        }
        Some(ConfigCommands::Validate) => {
            if !config_path.exists() {
                println!("No config file found. Using defaults (valid).");
                return Ok(());
            }

            let config = ConductorToml::load(config_path)?;
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("{} already exists", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }
            if let Some(parent) = config_path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)?;
            }

            ConductorToml::default().save(config_path)?;
            println!("Created {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [server] host, port, dev_mode");
            println!("  - [runtime] poll_interval_ms, retain_finished_secs, stage_timeout_secs");
            println!("  - [stages.<name>] api_base, api_key, model, prompt");
        }
    }

    Ok(())
}
