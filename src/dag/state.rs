//! Workflow-level status and the outcome surfaced to callers.

use serde::{Deserialize, Serialize};

use crate::errors::FatalCondition;

/// Aggregated status of a workflow (or of one scope inside it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    #[default]
    NotStarted,
    Running,
    Succeeded,
    FailedContinue,
    Terminal,
    Canceled,
}

impl WorkflowStatus {
    /// No further progress will be made.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::FailedContinue | Self::Terminal | Self::Canceled
        )
    }

    /// Whether recovery should pick this workflow up.
    pub fn is_resumable(self) -> bool {
        matches!(self, Self::NotStarted | Self::Running)
    }

    pub fn can_transition(self, to: WorkflowStatus) -> bool {
        match (self, to) {
            (Self::NotStarted, Self::Running) => true,
            (Self::NotStarted | Self::Running, Self::Canceled | Self::Terminal) => true,
            (Self::Running, Self::Succeeded | Self::FailedContinue) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotStarted => "NOT_STARTED",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::FailedContinue => "FAILED_CONTINUE",
            Self::Terminal => "TERMINAL",
            Self::Canceled => "CANCELED",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NOT_STARTED" => Ok(Self::NotStarted),
            "RUNNING" => Ok(Self::Running),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "FAILED_CONTINUE" => Ok(Self::FailedContinue),
            "TERMINAL" => Ok(Self::Terminal),
            "CANCELED" => Ok(Self::Canceled),
            other => Err(format!("unknown workflow status '{}'", other)),
        }
    }
}

/// The final verdict of a run, as seen by the command surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fatal: Option<FatalCondition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl Outcome {
    /// Process exit code: success, terminal failure, quality warning accepted.
    pub fn exit_code(&self) -> u8 {
        match self.status {
            WorkflowStatus::Succeeded => 0,
            WorkflowStatus::FailedContinue => 2,
            WorkflowStatus::Canceled => 130,
            WorkflowStatus::Terminal | WorkflowStatus::NotStarted | WorkflowStatus::Running => 1,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == WorkflowStatus::Succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_transitions() {
        use WorkflowStatus::*;
        assert!(NotStarted.can_transition(Running));
        assert!(Running.can_transition(Succeeded));
        assert!(Running.can_transition(FailedContinue));
        assert!(Running.can_transition(Terminal));
        assert!(Running.can_transition(Canceled));
        assert!(!Succeeded.can_transition(Running));
        assert!(!Terminal.can_transition(Canceled));
        assert!(!NotStarted.can_transition(Succeeded));
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            WorkflowStatus::NotStarted,
            WorkflowStatus::Running,
            WorkflowStatus::FailedContinue,
            WorkflowStatus::Canceled,
        ] {
            assert_eq!(status.to_string().parse::<WorkflowStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_exit_codes() {
        let outcome = |status| Outcome {
            workflow_id: "wf".into(),
            status,
            fatal: None,
            warnings: vec![],
        };
        assert_eq!(outcome(WorkflowStatus::Succeeded).exit_code(), 0);
        assert_eq!(outcome(WorkflowStatus::Terminal).exit_code(), 1);
        assert_eq!(outcome(WorkflowStatus::FailedContinue).exit_code(), 2);
        assert_eq!(outcome(WorkflowStatus::Canceled).exit_code(), 130);
    }
}
