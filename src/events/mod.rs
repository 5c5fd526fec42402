//! Workflow events: the durable log, its storage backends, and the live bus.
//!
//! Every state change of a workflow is an [`Event`]. The ordered sequence of
//! events for a workflow is the only source of truth for its state; the
//! in-memory view is a fold over it (see `engine::state`).

mod bus;
mod log;
mod memory;
mod sqlite;
mod tail;

pub use bus::{EventBus, Subscription, SubscriptionFilter};
pub use log::{EventLog, WorkflowRecord};
pub use memory::MemoryEventLog;
pub use sqlite::SqliteEventLog;
pub use tail::LogTailer;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dag::WorkflowStatus;
use crate::engine::{WatchdogFinding, WorkflowDefinition};
use crate::errors::{FailureClass, FatalCondition};
use crate::jump::CounterKind;
use crate::quality::QualityReport;

/// How a stage came to be started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dispatch {
    /// All prerequisites satisfied
    Ready,
    /// Taken from the scope's pending jump queue
    Jump,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    WorkflowCreated {
        definition: Box<WorkflowDefinition>,
    },
    WorkflowStatusChanged {
        status: WorkflowStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fatal: Option<FatalCondition>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        warnings: Vec<String>,
    },
    StageStarted {
        attempt: u32,
        dispatch: Dispatch,
    },
    StageSucceeded {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
    StageFailed {
        failure: FailureClass,
        summary: String,
    },
    StageFailedContinue {
        warning: String,
    },
    StageTerminal {
        failure: FailureClass,
        fatal: FatalCondition,
    },
    StageCanceled,
    StageReset {
        reason: String,
    },
    JumpTaken {
        target: String,
        counter: CounterKind,
        return_chain: Vec<String>,
        total_jumps: u32,
    },
    CounterIncremented {
        counter: CounterKind,
        value: u32,
    },
    CounterReset {
        counter: CounterKind,
    },
    QualityScored {
        report: QualityReport,
    },
    ScopeFinished {
        scope: String,
        status: WorkflowStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fatal: Option<FatalCondition>,
    },
    JumpCeilingExceeded {
        attempted: u32,
        ceiling: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scope: Option<String>,
    },
    /// Advisory only; never changes a stage or workflow status
    WatchdogFlagged {
        finding: WatchdogFinding,
    },
}

impl EventKind {
    /// Stable name, stored alongside the payload.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::WorkflowCreated { .. } => "workflow_created",
            EventKind::WorkflowStatusChanged { .. } => "workflow_status_changed",
            EventKind::StageStarted { .. } => "stage_started",
            EventKind::StageSucceeded { .. } => "stage_succeeded",
            EventKind::StageFailed { .. } => "stage_failed",
            EventKind::StageFailedContinue { .. } => "stage_failed_continue",
            EventKind::StageTerminal { .. } => "stage_terminal",
            EventKind::StageCanceled => "stage_canceled",
            EventKind::StageReset { .. } => "stage_reset",
            EventKind::JumpTaken { .. } => "jump_taken",
            EventKind::CounterIncremented { .. } => "counter_incremented",
            EventKind::CounterReset { .. } => "counter_reset",
            EventKind::QualityScored { .. } => "quality_scored",
            EventKind::ScopeFinished { .. } => "scope_finished",
            EventKind::JumpCeilingExceeded { .. } => "jump_ceiling_exceeded",
            EventKind::WatchdogFlagged { .. } => "watchdog_flagged",
        }
    }
}

/// One entry of a workflow's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Per-workflow sequence number, starting at 1, gapless
    pub seq: u64,
    pub workflow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_id: Option<String>,
    pub kind: EventKind,
    pub recorded_at: DateTime<Utc>,
}

impl Event {
    pub fn stage(&self) -> Option<&str> {
        self.stage_id.as_deref()
    }

    /// One-line human rendering for `anvil events`.
    pub fn describe(&self) -> String {
        let stage = self.stage_id.as_deref().unwrap_or("-");
        let detail = match &self.kind {
            EventKind::WorkflowCreated { definition } => {
                format!("created '{}' ({} stages)", definition.name, definition.stages.len())
            }
            EventKind::WorkflowStatusChanged { status, fatal, .. } => match fatal {
                Some(fatal) => format!("workflow {}: {}", status, fatal),
                None => format!("workflow {}", status),
            },
            EventKind::StageStarted { attempt, dispatch } => {
                format!("started (attempt {}, {:?})", attempt, dispatch)
            }
            EventKind::StageSucceeded { summary } => match summary {
                Some(s) => format!("succeeded: {}", s),
                None => "succeeded".to_string(),
            },
            EventKind::StageFailed { failure, .. } => format!("failed: {}", failure),
            EventKind::StageFailedContinue { warning } => format!("accepted: {}", warning),
            EventKind::StageTerminal { fatal, .. } => format!("terminal: {}", fatal),
            EventKind::StageCanceled => "canceled".to_string(),
            EventKind::StageReset { reason } => format!("reset: {}", reason),
            EventKind::JumpTaken {
                target,
                total_jumps,
                ..
            } => format!("jump -> {} (#{})", target, total_jumps),
            EventKind::CounterIncremented { counter, value } => format!("{} = {}", counter, value),
            EventKind::CounterReset { counter } => format!("{} = 0", counter),
            EventKind::QualityScored { report } => {
                format!("quality {:.2} {}", report.total, report.verdict)
            }
            EventKind::ScopeFinished { scope, status, .. } => format!("{} {}", scope, status),
            EventKind::JumpCeilingExceeded {
                attempted, ceiling, ..
            } => format!("jump {} refused: ceiling {}", attempted, ceiling),
            EventKind::WatchdogFlagged { finding } => format!("watchdog: {}", finding),
        };
        format!("{:>5} {:<24} {}", self.seq, stage, detail)
    }
}

/// An event not yet assigned a sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    pub stage_id: Option<String>,
    pub kind: EventKind,
}

impl EventDraft {
    pub fn workflow(kind: EventKind) -> Self {
        Self {
            stage_id: None,
            kind,
        }
    }

    pub fn stage(stage_id: &str, kind: EventKind) -> Self {
        Self {
            stage_id: Some(stage_id.to_string()),
            kind,
        }
    }
}
