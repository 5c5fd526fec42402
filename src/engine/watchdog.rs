//! Pipeline health monitor.
//!
//! While a workflow runs, the watchdog periodically inspects its journal
//! state and records a `watchdog_flagged` event for every new finding:
//!
//! - **repair_loop** - a scope has taken `repair_loop_jumps` jumps or more
//! - **jump_budget** - the workflow has used 60% (warning) or 80% (error) of `max_jumps`
//! - **regression** - a validation stage that passed before keeps failing
//! - **stall** - no stage has reached an outcome for `stall_after_secs`
//!
//! Findings are advisory. They never change a stage or workflow status, and
//! each one is recorded once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use super::journal::Journal;
use super::state::WorkflowState;
use crate::config::WatchdogSection;
use crate::dag::{StageRole, WorkflowStatus};
use crate::errors::EngineError;
use crate::events::{EventDraft, EventKind};

/// Consecutive failures of a previously passing validation stage.
const REGRESSION_FAILURES: u32 = 3;
const BUDGET_WARNING: f64 = 0.6;
const BUDGET_ERROR: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchdogRule {
    RepairLoop,
    JumpBudget,
    Regression,
    Stall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchdogFinding {
    pub rule: WatchdogRule,
    pub severity: Severity,
    /// Scope or stage the finding is about
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub message: String,
}

impl WatchdogFinding {
    /// Two findings with the same rule, severity and subject are one finding.
    fn same_as(&self, other: &WatchdogFinding) -> bool {
        self.rule == other.rule && self.severity == other.severity && self.subject == other.subject
    }
}

impl fmt::Display for WatchdogFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.severity, self.message)
    }
}

/// Everything currently wrong with a running workflow. Empty once it has
/// stopped running.
pub fn inspect(
    state: &WorkflowState,
    config: &WatchdogSection,
    now: DateTime<Utc>,
) -> Vec<WatchdogFinding> {
    if state.status != WorkflowStatus::Running {
        return Vec::new();
    }
    let mut findings = Vec::new();

    for (scope, entry) in &state.scopes {
        if !entry.status.is_final() && entry.jumps >= config.repair_loop_jumps {
            findings.push(WatchdogFinding {
                rule: WatchdogRule::RepairLoop,
                severity: Severity::Warning,
                subject: Some(scope.clone()),
                message: format!(
                    "scope '{}' has taken {} jumps; it may be stuck in a repair loop",
                    scope, entry.jumps
                ),
            });
        }
    }

    let max_jumps = state.definition.policy.limits.max_jumps;
    if max_jumps > 0 {
        let used = f64::from(state.total_jumps) / f64::from(max_jumps);
        let severity = if used >= BUDGET_ERROR {
            Some(Severity::Error)
        } else if used >= BUDGET_WARNING {
            Some(Severity::Warning)
        } else {
            None
        };
        if let Some(severity) = severity {
            findings.push(WatchdogFinding {
                rule: WatchdogRule::JumpBudget,
                severity,
                subject: None,
                message: format!("{} of {} jumps used", state.total_jumps, max_jumps),
            });
        }
    }

    for (def, stage) in state.graph.stages().iter().zip(&state.stages) {
        let validates = matches!(def.role, StageRole::Validate | StageRole::IntegrationValidate);
        if validates && stage.ever_passed && stage.consecutive_failures >= REGRESSION_FAILURES {
            findings.push(WatchdogFinding {
                rule: WatchdogRule::Regression,
                severity: Severity::Error,
                subject: Some(def.id.clone()),
                message: format!(
                    "'{}' passed before but has failed {} times in a row",
                    def.id, stage.consecutive_failures
                ),
            });
        }
    }

    if let Some(since) = state.progress_at {
        let idle = (now - since).num_seconds();
        if idle >= 0 && idle as u64 >= config.stall_after_secs {
            findings.push(WatchdogFinding {
                rule: WatchdogRule::Stall,
                severity: Severity::Warning,
                subject: Some(format!("seq {}", state.progress_seq)),
                message: format!("no stage has finished for {} minutes", idle / 60),
            });
        }
    }

    findings
}

/// Periodic [`inspect`] over one workflow's journal.
pub struct Watchdog {
    journal: Arc<Journal>,
    config: WatchdogSection,
}

impl Watchdog {
    pub fn new(journal: Arc<Journal>, config: WatchdogSection) -> Self {
        Self { journal, config }
    }

    /// Check every `interval_secs` until `stop` fires.
    pub async fn run(self, stop: CancellationToken) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.interval_secs.max(1)));
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.check(Utc::now()).await {
                        warn!(error = %e, "watchdog check failed");
                    }
                }
            }
        }
    }

    /// Record findings not flagged before. Returns them.
    pub async fn check(&self, now: DateTime<Utc>) -> Result<Vec<WatchdogFinding>, EngineError> {
        let config = self.config;
        let fresh = self
            .journal
            .transact(|state| {
                let fresh: Vec<WatchdogFinding> = inspect(state, &config, now)
                    .into_iter()
                    .filter(|f| !state.findings.iter().any(|seen| seen.same_as(f)))
                    .collect();
                let drafts = fresh
                    .iter()
                    .map(|f| EventDraft::workflow(EventKind::WatchdogFlagged { finding: f.clone() }))
                    .collect();
                Ok((drafts, fresh))
            })
            .await?;

        for finding in &fresh {
            match finding.severity {
                Severity::Error => error!(rule = ?finding.rule, "{}", finding.message),
                Severity::Warning => warn!(rule = ?finding.rule, "{}", finding.message),
            }
        }
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Policy;
    use crate::engine::WorkflowDefinition;
    use crate::events::{EventBus, MemoryEventLog};
    use crate::plan::{ModuleSpec, Plan};

    fn definition() -> WorkflowDefinition {
        WorkflowDefinition::from_plan(&Plan::new("watch"), Policy::default())
            .unwrap()
            .with_id("wf")
    }

    fn running(definition: WorkflowDefinition) -> WorkflowState {
        let mut state = WorkflowState::new(definition).unwrap();
        state.status = WorkflowStatus::Running;
        state.progress_at = Some(Utc::now());
        state
    }

    fn rules(findings: &[WatchdogFinding]) -> Vec<WatchdogRule> {
        findings.iter().map(|f| f.rule).collect()
    }

    #[test]
    fn test_healthy_workflow_has_no_findings() {
        let state = running(definition());
        assert!(inspect(&state, &WatchdogSection::default(), Utc::now()).is_empty());
    }

    #[test]
    fn test_stopped_workflow_is_never_flagged() {
        let mut state = running(definition());
        state.total_jumps = 49;
        state.status = WorkflowStatus::FailedContinue;
        assert!(inspect(&state, &WatchdogSection::default(), Utc::now()).is_empty());
    }

    #[test]
    fn test_repair_loop_flags_the_looping_scope() {
        let plan = Plan::new("watch").with_modules(vec![
            ModuleSpec::new("a").with_files(&["src/a.rs"]),
            ModuleSpec::new("b").with_files(&["src/b.rs"]),
        ]);
        let definition = WorkflowDefinition::from_plan(&plan, Policy::default())
            .unwrap()
            .with_id("wf");
        let mut state = running(definition);
        state.scopes.get_mut("module:b").unwrap().jumps = 3;

        let findings = inspect(&state, &WatchdogSection::default(), Utc::now());
        assert_eq!(rules(&findings), vec![WatchdogRule::RepairLoop]);
        assert_eq!(findings[0].subject.as_deref(), Some("module:b"));
    }

    #[test]
    fn test_jump_budget_escalates() {
        let mut state = running(definition());
        let config = WatchdogSection {
            repair_loop_jumps: u32::MAX,
            ..WatchdogSection::default()
        };

        state.total_jumps = 29;
        assert!(inspect(&state, &config, Utc::now()).is_empty());

        state.total_jumps = 30;
        let findings = inspect(&state, &config, Utc::now());
        assert_eq!(findings[0].severity, Severity::Warning);
        assert_eq!(findings[0].message, "30 of 50 jumps used");

        state.total_jumps = 40;
        assert_eq!(inspect(&state, &config, Utc::now())[0].severity, Severity::Error);
    }

    #[test]
    fn test_regression_needs_an_earlier_pass() {
        let mut state = running(definition());
        let validate = state.stage_index("validate").unwrap();
        state.stages[validate].consecutive_failures = 4;
        assert!(inspect(&state, &WatchdogSection::default(), Utc::now()).is_empty());

        state.stages[validate].ever_passed = true;
        let findings = inspect(&state, &WatchdogSection::default(), Utc::now());
        assert_eq!(rules(&findings), vec![WatchdogRule::Regression]);
        assert_eq!(findings[0].subject.as_deref(), Some("validate"));
    }

    #[test]
    fn test_stall_after_quiet_period() {
        let state = running(definition());
        let config = WatchdogSection::default();
        let soon = Utc::now() + chrono::Duration::seconds(60);
        assert!(inspect(&state, &config, soon).is_empty());

        let later = Utc::now() + chrono::Duration::hours(2);
        let findings = inspect(&state, &config, later);
        assert_eq!(rules(&findings), vec![WatchdogRule::Stall]);
        assert!(findings[0].message.contains("minutes"));
    }

    async fn started_journal() -> Arc<Journal> {
        let journal = Journal::create(
            Arc::new(MemoryEventLog::new()),
            EventBus::new(16),
            definition(),
        )
        .await
        .unwrap();
        journal
            .record(vec![EventDraft::workflow(EventKind::WorkflowStatusChanged {
                status: WorkflowStatus::Running,
                fatal: None,
                warnings: vec![],
            })])
            .await
            .unwrap();
        Arc::new(journal)
    }

    #[tokio::test]
    async fn test_check_records_each_finding_once() {
        let journal = started_journal().await;
        let watchdog = Watchdog::new(journal.clone(), WatchdogSection::default());
        let later = Utc::now() + chrono::Duration::hours(2);

        let first = watchdog.check(later).await.unwrap();
        assert_eq!(rules(&first), vec![WatchdogRule::Stall]);
        assert!(watchdog.check(later).await.unwrap().is_empty());

        let snapshot = journal.snapshot().await;
        assert_eq!(snapshot.findings, first);
        assert_eq!(snapshot.status, WorkflowStatus::Running);
        assert!(snapshot.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let journal = started_journal().await;
        let config = WatchdogSection {
            interval_secs: 1,
            stall_after_secs: 0,
            ..WatchdogSection::default()
        };
        let stop = CancellationToken::new();
        let handle = tokio::spawn(Watchdog::new(journal.clone(), config).run(stop.clone()));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        stop.cancel();
        handle.await.unwrap();

        let findings = journal.snapshot().await.findings;
        assert_eq!(rules(&findings), vec![WatchdogRule::Stall]);
    }
}
