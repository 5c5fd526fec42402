//! Task executors: the external collaborators that perform a stage's work.
//!
//! The engine only sees the terminal [`TaskOutcome`] of an invocation. What
//! happens inside (shell commands, agent tool loops) is opaque to it.

mod command;

pub use command::CommandExecutor;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::dag::StageRole;
use crate::errors::CheckKind;
use crate::quality::PillarScores;

/// Closed set of task kinds the scheduler dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Setup,
    Agent,
    Validate,
    Repair,
    Quality,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Setup => write!(f, "setup"),
            TaskKind::Agent => write!(f, "agent"),
            TaskKind::Validate => write!(f, "validate"),
            TaskKind::Repair => write!(f, "repair"),
            TaskKind::Quality => write!(f, "quality"),
        }
    }
}

/// Everything an executor is told about one stage attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub workflow_id: String,
    pub stage_id: String,
    pub role: StageRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    pub owned_files: Vec<String>,
    /// 1-based attempt number for this stage
    pub attempt: u32,
    pub goal: String,
    /// Most recent failure summaries in this scope, oldest first
    pub feedback: Vec<String>,
}

impl TaskSpec {
    pub fn kind(&self) -> TaskKind {
        self.role.kind()
    }

    /// Plain-text brief handed to agent commands.
    pub fn prompt(&self) -> String {
        let mut prompt = format!("Stage: {} (attempt {})\n", self.stage_id, self.attempt);
        if let Some(module) = &self.module {
            prompt.push_str(&format!("Module: {}\n", module));
        }
        if !self.owned_files.is_empty() {
            prompt.push_str(&format!("Owned files: {}\n", self.owned_files.join(", ")));
        }
        if !self.goal.is_empty() {
            prompt.push_str(&format!("\n{}\n", self.goal));
        }
        if !self.feedback.is_empty() {
            prompt.push_str("\nPrevious failures:\n");
            for line in &self.feedback {
                prompt.push_str(&format!("- {}\n", line));
            }
        }
        prompt
    }
}

/// Result of one validation check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub check: CheckKind,
    pub passed: bool,
    #[serde(default)]
    pub output: String,
}

impl CheckResult {
    pub fn pass(check: CheckKind) -> Self {
        Self {
            check,
            passed: true,
            output: String::new(),
        }
    }

    pub fn fail(check: CheckKind, output: impl Into<String>) -> Self {
        Self {
            check,
            passed: false,
            output: output.into(),
        }
    }
}

/// Terminal outcome of one executor invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Success {
        #[serde(default)]
        summary: Option<String>,
        #[serde(default)]
        pillars: Option<PillarScores>,
    },
    Failure {
        reason: String,
        #[serde(default)]
        checks: Vec<CheckResult>,
        #[serde(default)]
        pillars: Option<PillarScores>,
    },
    Timeout {
        after_secs: u64,
    },
    Canceled,
}

impl TaskOutcome {
    pub fn success() -> Self {
        TaskOutcome::Success {
            summary: None,
            pillars: None,
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        TaskOutcome::Failure {
            reason: reason.into(),
            checks: Vec::new(),
            pillars: None,
        }
    }

    pub fn scored(pillars: PillarScores) -> Self {
        TaskOutcome::Success {
            summary: None,
            pillars: Some(pillars),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        TaskOutcome::Timeout {
            after_secs: after.as_secs(),
        }
    }

    /// Outcome of a validate run from its individual checks.
    pub fn from_checks(checks: Vec<CheckResult>) -> Self {
        let failed: Vec<String> = checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.check.to_string())
            .collect();
        if failed.is_empty() {
            TaskOutcome::Success {
                summary: Some(format!("{} checks passed", checks.len())),
                pillars: None,
            }
        } else {
            TaskOutcome::Failure {
                reason: format!("failing checks: {}", failed.join(", ")),
                checks,
                pillars: None,
            }
        }
    }

    pub fn pillars(&self) -> Option<&PillarScores> {
        match self {
            TaskOutcome::Success { pillars, .. } | TaskOutcome::Failure { pillars, .. } => {
                pillars.as_ref()
            }
            _ => None,
        }
    }
}

/// One implementation per task kind, selected by [`Executors::for_kind`].
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Perform the task. `cancel` fires when the workflow is canceled or the
    /// invocation exceeds its time budget; implementations should stop at
    /// their next safe checkpoint and return [`TaskOutcome::Canceled`].
    async fn execute(&self, task: &TaskSpec, cancel: CancellationToken)
    -> anyhow::Result<TaskOutcome>;
}

/// The executor set a workflow runs with.
#[derive(Clone)]
pub struct Executors {
    setup: Arc<dyn TaskExecutor>,
    agent: Arc<dyn TaskExecutor>,
    validate: Arc<dyn TaskExecutor>,
    repair: Arc<dyn TaskExecutor>,
    quality: Arc<dyn TaskExecutor>,
}

impl Executors {
    /// Use one executor for every kind.
    pub fn uniform(executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            setup: executor.clone(),
            agent: executor.clone(),
            validate: executor.clone(),
            repair: executor.clone(),
            quality: executor,
        }
    }

    /// Replace the executor for one kind.
    pub fn with(mut self, kind: TaskKind, executor: Arc<dyn TaskExecutor>) -> Self {
        match kind {
            TaskKind::Setup => self.setup = executor,
            TaskKind::Agent => self.agent = executor,
            TaskKind::Validate => self.validate = executor,
            TaskKind::Repair => self.repair = executor,
            TaskKind::Quality => self.quality = executor,
        }
        self
    }

    pub fn for_kind(&self, kind: TaskKind) -> &Arc<dyn TaskExecutor> {
        match kind {
            TaskKind::Setup => &self.setup,
            TaskKind::Agent => &self.agent,
            TaskKind::Validate => &self.validate,
            TaskKind::Repair => &self.repair,
            TaskKind::Quality => &self.quality,
        }
    }
}
