//! Configuration view and validation commands: `forge-actions config`.

use std::path::Path;

use anyhow::Result;

use forge_actions::config::{ActionsConfig, ActionsToml};

use super::super::ConfigCommands;

pub fn cmd_config(config_path: &Path, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Forge Actions Configuration");
            println!("===========================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No actions.toml found at {}", config_path.display());
                println!("Using default configuration.");
            }
            println!();

            let config = ActionsConfig::load(config_path.to_path_buf())?;
            print!("{}", toml::to_string_pretty(&config.toml)?);
            println!();
            println!("Effective values (with env overrides):");
            println!("  listen = \"{}:{}\"", config.host(), config.port());
            println!("  database = \"{}\"", config.db_path().display());
            println!("  json_logs = {}", config.json_logs());
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No actions.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = ActionsToml::load(config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("actions.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            ActionsToml::default().save(config_path)?;

            println!("Created actions.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [server] host, port");
            println!("  - [database] path");
            println!("  - [actions] skip_workflow_strings, limit_dispatch_inputs, default_runs_on");
            println!("  - [log] level, json");
            println!();
        }
    }

    Ok(())
}
