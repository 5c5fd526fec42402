//! Configuration view and validation commands: `anvil config`.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;
use std::process::ExitCode;

use anvil::config::{ANVIL_DIR, AnvilConfig, AnvilToml, CONFIG_FILE};

use crate::ConfigCommands;

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<ExitCode> {
    let anvil_dir = project_dir.join(ANVIL_DIR);
    let config_path = anvil_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No anvil.toml found at {}", config_path.display());
                println!("Using default configuration.");
            }
            println!();

            // Effective values include ANVIL_* environment overrides.
            let config = AnvilConfig::new(project_dir.to_path_buf())?;
            let rendered =
                toml::to_string_pretty(&config.toml).context("Failed to render configuration")?;
            println!("{}", rendered.trim_end());
            Ok(ExitCode::SUCCESS)
        }
        Some(ConfigCommands::Validate) => {
            if !config_path.exists() {
                println!("No anvil.toml found; defaults are valid.");
                return Ok(ExitCode::SUCCESS);
            }
            let toml = match AnvilToml::load(&config_path) {
                Ok(toml) => toml,
                Err(e) => {
                    println!("{} {:#}", style("Invalid:").red().bold(), e);
                    return Ok(ExitCode::FAILURE);
                }
            };
            let problems = toml.validate();
            if problems.is_empty() {
                println!("{} {}", style("Valid:").green().bold(), config_path.display());
                Ok(ExitCode::SUCCESS)
            } else {
                println!("{} {}", style("Invalid:").red().bold(), config_path.display());
                for problem in problems {
                    println!("  - {}", problem);
                }
                Ok(ExitCode::FAILURE)
            }
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("anvil.toml already exists at {}", config_path.display());
                return Ok(ExitCode::SUCCESS);
            }
            std::fs::create_dir_all(&anvil_dir)
                .with_context(|| format!("Failed to create {}", anvil_dir.display()))?;
            AnvilToml::default().save(&config_path)?;
            println!("Created {}", config_path.display());
            Ok(ExitCode::SUCCESS)
        }
    }
}
