use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use anvil::config::{AnvilConfig, CliOverrides, LogFormat};

mod cmd;

#[derive(Parser)]
#[command(name = "anvil")]
#[command(version, about = "Durable orchestration engine for multi-stage development workflows")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Diagnostic log format on stderr (pretty or json). Overrides anvil.toml.
    #[arg(long, global = true)]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create .anvil/ with a default anvil.toml
    Init,
    /// Create a workflow from a plan and run it to completion
    Run {
        /// Plan file (.md, .json or .toml)
        plan: PathBuf,

        /// Also stream events over WebSocket on this port while running
        #[arg(long)]
        serve_port: Option<u16>,

        #[arg(long)]
        max_jumps: Option<u32>,

        #[arg(long)]
        max_repair_attempts: Option<u32>,

        #[arg(long)]
        quality_threshold: Option<f64>,
    },
    /// Recover interrupted work and resume a workflow (the latest when no id is given)
    Resume { id: Option<String> },
    /// Cancel a workflow, wherever it is running
    Cancel { id: String },
    /// Show a workflow's stages and status (the latest when no id is given)
    Status {
        id: Option<String>,

        #[arg(long)]
        json: bool,
    },
    /// List recorded workflows
    List {
        /// Include archived workflows
        #[arg(long)]
        all: bool,

        #[arg(long)]
        json: bool,
    },
    /// Print a workflow's event history
    Events {
        id: String,

        /// First seq to print
        #[arg(long, default_value = "1")]
        from: u64,

        /// Keep printing new events until the workflow finishes
        #[arg(short, long)]
        follow: bool,

        /// One JSON object per line
        #[arg(long)]
        json: bool,
    },
    /// Stream events of every workflow in this project over WebSocket
    Serve {
        /// Defaults to [server].port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Hide a finished workflow from list, recovery and resume
    Archive { id: String },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate anvil.toml
    Validate,
    /// Write a default anvil.toml
    Init,
}

impl Cli {
    fn overrides(&self) -> CliOverrides {
        let mut overrides = CliOverrides {
            log_format: self.log_format,
            ..Default::default()
        };
        if let Commands::Run {
            max_jumps,
            max_repair_attempts,
            quality_threshold,
            ..
        } = &self.command
        {
            overrides.max_jumps = *max_jumps;
            overrides.max_repair_attempts = *max_repair_attempts;
            overrides.quality_threshold = *quality_threshold;
        }
        overrides
    }

    /// Long-running commands also log to `.anvil/logs`.
    fn logs_to_file(&self) -> bool {
        matches!(
            self.command,
            Commands::Run { .. } | Commands::Resume { .. } | Commands::Serve { .. }
        )
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    // These must work with a broken anvil.toml.
    let config = match &cli.command {
        Commands::Init => return cmd::cmd_init(&project_dir),
        Commands::Config { command } => return cmd::cmd_config(&project_dir, command.clone()),
        _ => AnvilConfig::with_overrides(project_dir, &cli.overrides())?,
    };
    let log_dir = (cli.logs_to_file() && config.toml.logging.file).then(|| config.log_dir());
    let _guard = anvil::logging::init(config.toml.logging.format, cli.verbose, log_dir.as_deref())?;

    match cli.command {
        Commands::Init | Commands::Config { .. } => Ok(ExitCode::SUCCESS),
        Commands::Run {
            plan, serve_port, ..
        } => cmd::cmd_run(config, &plan, serve_port).await,
        Commands::Resume { id } => cmd::cmd_resume(config, id.as_deref()).await,
        Commands::Cancel { id } => cmd::cmd_cancel(config, &id).await,
        Commands::Status { id, json } => cmd::cmd_status(config, id.as_deref(), json).await,
        Commands::List { all, json } => cmd::cmd_list(config, all, json).await,
        Commands::Events {
            id,
            from,
            follow,
            json,
        } => cmd::cmd_events(config, &id, from, follow, json).await,
        Commands::Serve { port } => cmd::cmd_serve(config, port).await,
        Commands::Archive { id } => cmd::cmd_archive(config, &id).await,
    }
}
