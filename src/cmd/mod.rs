//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled                          |
//! |-----------|-------------------------------------------|
//! | `project` | `Init`                                    |
//! | `config`  | `Config`                                  |
//! | `run`     | `Run`, `Resume`, `Cancel`                 |
//! | `inspect` | `Status`, `List`, `Events`, `Archive`     |
//! | `serve`   | `Serve`                                   |

pub mod config;
pub mod inspect;
pub mod project;
pub mod run;
pub mod serve;

pub use config::cmd_config;
pub use inspect::{cmd_archive, cmd_events, cmd_list, cmd_status};
pub use project::cmd_init;
pub use run::{cmd_cancel, cmd_resume, cmd_run};
pub use serve::cmd_serve;

use anyhow::Result;
use console::style;
use std::sync::Arc;

use anvil::config::AnvilConfig;
use anvil::engine::Engine;
use anvil::events::{Event, EventKind};
use anvil::executor::{CommandExecutor, Executors};

/// Engine over the project's log, running stages as configured commands.
pub(crate) fn open_engine(config: AnvilConfig) -> Result<Engine> {
    let executor = Arc::new(CommandExecutor::new(
        config.toml.executor.clone(),
        config.project_dir.clone(),
    ));
    Ok(Engine::open(config, Executors::uniform(executor))?)
}

/// Print one event as a colored line.
pub(crate) fn print_event(event: &Event) {
    let line = style(event.describe());
    let line = match &event.kind {
        EventKind::StageSucceeded { .. } => line.green(),
        EventKind::StageFailed { .. } | EventKind::JumpCeilingExceeded { .. } => line.red(),
        EventKind::StageTerminal { .. } => line.red().bold(),
        EventKind::StageFailedContinue { .. }
        | EventKind::JumpTaken { .. }
        | EventKind::StageReset { .. }
        | EventKind::StageCanceled
        | EventKind::WatchdogFlagged { .. } => line.yellow(),
        EventKind::QualityScored { .. } => line.cyan(),
        EventKind::CounterIncremented { .. } | EventKind::CounterReset { .. } => line.dim(),
        EventKind::WorkflowCreated { .. }
        | EventKind::WorkflowStatusChanged { .. }
        | EventKind::ScopeFinished { .. } => line.bold(),
        EventKind::StageStarted { .. } => line,
    };
    println!("{}", line);
}
