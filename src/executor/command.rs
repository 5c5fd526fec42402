//! Shell-command executor driven by the `[executor]` config section.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{CheckResult, TaskExecutor, TaskKind, TaskOutcome, TaskSpec};
use crate::config::ExecutorSection;
use crate::dag::StageRole;
use crate::errors::CheckKind;
use crate::quality::PillarScores;

/// Keep at most this many trailing bytes of command output.
const OUTPUT_TAIL: usize = 2000;

/// Runs each stage as one or more `sh -c` commands in the project directory.
///
/// Cancellation is honoured between commands; a command that has started is
/// allowed to finish.
pub struct CommandExecutor {
    config: ExecutorSection,
    workdir: PathBuf,
}

struct CommandRun {
    success: bool,
    stdout: String,
    output: String,
}

impl CommandExecutor {
    pub fn new(config: ExecutorSection, workdir: PathBuf) -> Self {
        Self { config, workdir }
    }

    async fn run(&self, command: &str, task: &TaskSpec) -> Result<CommandRun> {
        debug!(stage = %task.stage_id, command, "running command");
        let output = Command::new(&self.config.shell)
            .arg("-c")
            .arg(command)
            .current_dir(&self.workdir)
            .env("ANVIL_WORKFLOW_ID", &task.workflow_id)
            .env("ANVIL_STAGE", &task.stage_id)
            .env("ANVIL_ROLE", task.role.to_string())
            .env("ANVIL_ATTEMPT", task.attempt.to_string())
            .env("ANVIL_MODULE", task.module.as_deref().unwrap_or(""))
            .env("ANVIL_OWNED_FILES", task.owned_files.join("\n"))
            .env("ANVIL_PROMPT", task.prompt())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to spawn '{}'", command))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        Ok(CommandRun {
            success: output.status.success(),
            output: tail(&format!("{}{}", stdout, stderr)),
            stdout,
        })
    }

    async fn run_all(
        &self,
        commands: &[String],
        task: &TaskSpec,
        cancel: &CancellationToken,
    ) -> Result<TaskOutcome> {
        for command in commands {
            if cancel.is_cancelled() {
                return Ok(TaskOutcome::Canceled);
            }
            let run = self.run(command, task).await?;
            if !run.success {
                return Ok(TaskOutcome::failure(format!(
                    "'{}' failed: {}",
                    command, run.output
                )));
            }
        }
        Ok(TaskOutcome::success())
    }

    async fn validate(&self, task: &TaskSpec, cancel: &CancellationToken) -> Result<TaskOutcome> {
        let checks = [
            (CheckKind::Syntax, &self.config.syntax),
            (CheckKind::Lint, &self.config.lint),
            (CheckKind::Tests, &self.config.tests),
        ];
        let mut results = Vec::new();
        for (kind, command) in checks {
            let Some(command) = command else { continue };
            if cancel.is_cancelled() {
                return Ok(TaskOutcome::Canceled);
            }
            let run = self.run(command, task).await?;
            results.push(if run.success {
                CheckResult::pass(kind)
            } else {
                CheckResult::fail(kind, run.output)
            });
        }
        Ok(TaskOutcome::from_checks(results))
    }

    async fn mutation(&self, task: &TaskSpec) -> Result<TaskOutcome> {
        let Some(command) = &self.config.mutation_command else {
            info!(stage = %task.stage_id, "no mutation command configured, gate skipped");
            return Ok(TaskOutcome::Success {
                summary: Some("mutation testing skipped".to_string()),
                pillars: None,
            });
        };
        let run = self.run(command, task).await?;
        if run.success {
            Ok(TaskOutcome::success())
        } else {
            Ok(TaskOutcome::failure(format!("mutants survived: {}", run.output)))
        }
    }

    async fn quality(&self, task: &TaskSpec) -> Result<TaskOutcome> {
        let Some(command) = &self.config.quality_command else {
            info!(stage = %task.stage_id, "no quality command configured, gate skipped");
            return Ok(TaskOutcome::Success {
                summary: Some("quality gate skipped".to_string()),
                pillars: None,
            });
        };
        let run = self.run(command, task).await?;
        if !run.success {
            return Ok(TaskOutcome::failure(format!(
                "quality command failed: {}",
                run.output
            )));
        }
        let pillars: PillarScores = serde_json::from_str(run.stdout.trim())
            .context("Quality command did not print pillar scores as JSON")?;
        Ok(TaskOutcome::scored(pillars))
    }
}

#[async_trait]
impl TaskExecutor for CommandExecutor {
    async fn execute(&self, task: &TaskSpec, cancel: CancellationToken) -> Result<TaskOutcome> {
        match task.kind() {
            TaskKind::Setup => self.run_all(&self.config.setup, task, &cancel).await,
            TaskKind::Agent | TaskKind::Repair => match &self.config.agent_command {
                Some(command) => self.run_all(std::slice::from_ref(command), task, &cancel).await,
                None => Ok(TaskOutcome::failure(
                    "no agent command configured (set executor.agent_command)",
                )),
            },
            TaskKind::Validate if task.role == StageRole::Mutation => self.mutation(task).await,
            TaskKind::Validate => self.validate(task, &cancel).await,
            TaskKind::Quality => self.quality(task).await,
        }
    }
}

fn tail(text: &str) -> String {
    if text.len() <= OUTPUT_TAIL {
        return text.to_string();
    }
    let mut start = text.len() - OUTPUT_TAIL;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}
