//! Project setup command: `anvil init`.

use anyhow::Result;
use std::path::Path;
use std::process::ExitCode;

use anvil::config::{ANVIL_DIR, AnvilConfig, AnvilToml};

pub fn cmd_init(project_dir: &Path) -> Result<ExitCode> {
    let anvil_dir = project_dir.join(ANVIL_DIR);
    let config = AnvilConfig {
        project_dir: project_dir.to_path_buf(),
        anvil_dir: anvil_dir.clone(),
        toml: AnvilToml::default(),
    };
    config.ensure_dirs()?;

    let config_path = config.config_path();
    if config_path.exists() {
        println!("{} already initialized", anvil_dir.display());
    } else {
        config.toml.save(&config_path)?;
        println!("Initialized {}", anvil_dir.display());
        println!("  config: {}", config_path.display());
    }
    println!();
    println!("Next: set executor.agent_command in anvil.toml, then `anvil run <plan>`.");
    Ok(ExitCode::SUCCESS)
}
