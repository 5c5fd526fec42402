//! Typed error hierarchy for the Anvil engine.
//!
//! Three top-level enums cover the three failure surfaces:
//! - `EngineError`: workflow construction, scheduling and command-surface failures
//! - `PersistenceError`: event log storage failures (always fatal)
//! - `PlanError`: plan rejection before any stage is dispatched
//!
//! `FailureClass` and `FatalCondition` are not Rust errors: they are the
//! serialisable failure taxonomy recorded in the event log.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sub-kind of a failed validation check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Syntax,
    Lint,
    Tests,
}

impl std::fmt::Display for CheckKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckKind::Syntax => write!(f, "syntax"),
            CheckKind::Lint => write!(f, "lint"),
            CheckKind::Tests => write!(f, "tests"),
        }
    }
}

/// Classification of a single failed stage attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum FailureClass {
    /// Environment setup failed; never retried.
    SetupError,
    /// Agent reported failure.
    AgentError,
    /// Any task invocation that exceeded its time budget.
    Timeout,
    /// One or more validation checks failed.
    ValidateFailure { checks: Vec<CheckKind> },
    /// A repair attempt did not complete.
    RepairFailure,
    /// Repair budget exhausted; escalates to reimplementation.
    RepairExhausted,
    /// Reimplementation budget exhausted; terminal for the branch.
    ReimplementExhausted,
    /// In-place retries of an agent stage exhausted.
    RetryExhausted,
    /// Weighted quality total below the gate threshold.
    QualityGateFailure,
    /// Code review reported blocking findings.
    ReviewFindings,
    /// Mutants survived the test suite.
    MutantsSurvived,
    /// The executor itself could not run the task.
    ExecutorError,
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureClass::SetupError => write!(f, "setup error"),
            FailureClass::AgentError => write!(f, "agent error"),
            FailureClass::Timeout => write!(f, "timeout"),
            FailureClass::ValidateFailure { checks } => {
                let names: Vec<String> = checks.iter().map(|c| c.to_string()).collect();
                write!(f, "validate failure ({})", names.join(", "))
            }
            FailureClass::RepairFailure => write!(f, "repair failure"),
            FailureClass::RepairExhausted => write!(f, "repair exhausted"),
            FailureClass::ReimplementExhausted => write!(f, "reimplementation exhausted"),
            FailureClass::RetryExhausted => write!(f, "retries exhausted"),
            FailureClass::QualityGateFailure => write!(f, "quality gate failure"),
            FailureClass::ReviewFindings => write!(f, "review findings"),
            FailureClass::MutantsSurvived => write!(f, "mutants survived"),
            FailureClass::ExecutorError => write!(f, "executor error"),
        }
    }
}

/// The condition that forced a scope or workflow into `TERMINAL`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "condition", rename_all = "snake_case")]
pub enum FatalCondition {
    SetupFailed { stage: String, reason: String },
    ReimplementExhausted { stage: String, attempts: u32 },
    RetryExhausted { stage: String, attempts: u32 },
    JumpCeilingExceeded { ceiling: u32 },
    BranchJumpCeilingExceeded { scope: String, ceiling: u32 },
    ModuleFailed { modules: Vec<String> },
    Stalled { scope: String, stages: Vec<String> },
    StageFailed { stage: String, reason: String },
}

impl std::fmt::Display for FatalCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FatalCondition::SetupFailed { stage, reason } => {
                write!(f, "setup stage '{}' failed: {}", stage, reason)
            }
            FatalCondition::ReimplementExhausted { stage, attempts } => write!(
                f,
                "'{}' still failing after {} reimplementations",
                stage, attempts
            ),
            FatalCondition::RetryExhausted { stage, attempts } => {
                write!(f, "'{}' failed after {} retries", stage, attempts)
            }
            FatalCondition::JumpCeilingExceeded { ceiling } => {
                write!(f, "jump ceiling of {} exceeded", ceiling)
            }
            FatalCondition::BranchJumpCeilingExceeded { scope, ceiling } => {
                write!(f, "'{}' exceeded its jump ceiling of {}", scope, ceiling)
            }
            FatalCondition::ModuleFailed { modules } => {
                write!(f, "modules failed: {}", modules.join(", "))
            }
            FatalCondition::Stalled { scope, stages } => write!(
                f,
                "'{}' cannot make progress; unfinished stages: {}",
                scope,
                stages.join(", ")
            ),
            FatalCondition::StageFailed { stage, reason } => {
                write!(f, "'{}' failed with no recovery path: {}", stage, reason)
            }
        }
    }
}

/// Errors from the durable event log. Never auto-recovered.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to (de)serialise event payload: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Sequence gap for workflow {workflow_id}: expected {expected}, got {found}")]
    SequenceGap {
        workflow_id: String,
        expected: u64,
        found: u64,
    },

    #[error("Workflow {0} already exists")]
    DuplicateWorkflow(String),

    #[error("Event log lock poisoned")]
    LockPoisoned,

    #[error("Event log task panicked: {0}")]
    TaskPanicked(String),

    #[error("Failed to open event log at {path}: {source}")]
    Open {
        path: std::path::PathBuf,
        #[source]
        source: rusqlite::Error,
    },
}

/// Reasons a plan is rejected before construction.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Duplicate module id: {0}")]
    DuplicateModule(String),

    #[error("Module '{module}' depends on unknown module '{dependency}'")]
    UnknownModuleDependency { module: String, dependency: String },

    #[error("File ownership conflicts: {}", conflicts.join("; "))]
    OwnershipConflict { conflicts: Vec<String> },

    #[error("Module dependency cycle: {}", cycle.join(" -> "))]
    ModuleCycle { cycle: Vec<String> },

    #[error("Invalid stage graph: {0}")]
    InvalidGraph(String),

    #[error("Failed to parse plan: {0}")]
    Parse(String),
}

/// Errors from the engine's public API.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("Workflow {0} not found")]
    UnknownWorkflow(String),

    #[error("Stage '{0}' does not exist in this workflow")]
    UnknownStage(String),

    #[error("Illegal transition for stage '{stage}': {from} -> {to}")]
    InvalidTransition {
        stage: String,
        from: String,
        to: String,
    },

    #[error("Workflow {0} is canceled; no further stages may start")]
    WorkflowCanceled(String),

    #[error("Workflow {id} is {status} and cannot be resumed")]
    NotResumable { id: String, status: String },

    #[error("Workflow {0} is locked by another process")]
    WorkflowLocked(String),

    #[error("Corrupt event log for workflow {workflow_id}: {message}")]
    CorruptLog {
        workflow_id: String,
        message: String,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
