//! Event-sourced workflow state.
//!
//! [`WorkflowState`] is a pure fold over a workflow's events. The live engine
//! and the recovery path both build it with [`WorkflowState::apply`], so a
//! replay reproduces exactly what the live run saw.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use super::definition::{WorkflowDefinition, scope_module};
use super::watchdog::WatchdogFinding;
use crate::dag::{StageGraph, StageIndex, StageStatus, WorkflowStatus};
use crate::errors::{EngineError, FatalCondition};
use crate::events::{Dispatch, Event, EventKind};
use crate::jump::{CounterKind, Counters};
use crate::quality::QualityReport;

/// Failure summaries kept per scope for repair feedback.
const FEEDBACK_DEPTH: usize = 5;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StageState {
    pub status: StageStatus,
    pub attempts: u32,
    pub counters: Counters,
    pub dispatch: Option<Dispatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_report: Option<QualityReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_summary: Option<String>,
    /// Failures since the last success
    pub consecutive_failures: u32,
    pub ever_passed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScopeState {
    pub status: WorkflowStatus,
    /// Jumps taken inside this scope
    pub jumps: u32,
    /// Stages queued by jumps, front first
    pub pending: VecDeque<String>,
    pub failures: VecDeque<String>,
    pub warnings: Vec<String>,
    pub fatal: Option<FatalCondition>,
}

#[derive(Debug, Clone)]
pub struct WorkflowState {
    pub definition: Arc<WorkflowDefinition>,
    pub graph: Arc<StageGraph>,
    pub status: WorkflowStatus,
    pub stages: Vec<StageState>,
    pub scopes: BTreeMap<String, ScopeState>,
    pub total_jumps: u32,
    pub last_seq: u64,
    pub fatal: Option<FatalCondition>,
    pub warnings: Vec<String>,
    pub quality: Option<QualityReport>,
    /// Seq and time of the last event that moved a stage to an outcome
    pub progress_seq: u64,
    pub progress_at: Option<DateTime<Utc>>,
    pub findings: Vec<WatchdogFinding>,
}

impl WorkflowState {
    /// State before any event has been applied.
    pub fn new(definition: WorkflowDefinition) -> Result<Self, EngineError> {
        let graph = definition.graph()?;
        let scopes = definition
            .scopes()
            .into_iter()
            .map(|s| (s, ScopeState::default()))
            .collect();
        Ok(Self {
            stages: vec![StageState::default(); graph.len()],
            definition: Arc::new(definition),
            graph: Arc::new(graph),
            status: WorkflowStatus::NotStarted,
            scopes,
            total_jumps: 0,
            last_seq: 0,
            fatal: None,
            warnings: Vec::new(),
            quality: None,
            progress_seq: 0,
            progress_at: None,
            findings: Vec::new(),
        })
    }

    /// Rebuild state from a workflow's full log.
    pub fn replay(events: &[Event]) -> Result<Self, EngineError> {
        let first = events.first().ok_or_else(|| EngineError::CorruptLog {
            workflow_id: String::new(),
            message: "empty log".to_string(),
        })?;
        let EventKind::WorkflowCreated { definition } = &first.kind else {
            return Err(corrupt(first, "first event is not workflow_created"));
        };
        let mut state = Self::new(definition.as_ref().clone())?;
        for event in events {
            state.apply(event)?;
        }
        Ok(state)
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn stage_index(&self, stage_id: &str) -> Result<StageIndex, EngineError> {
        self.graph
            .index_of(stage_id)
            .ok_or_else(|| EngineError::UnknownStage(stage_id.to_string()))
    }

    pub fn stage(&self, stage_id: &str) -> Option<&StageState> {
        self.graph.index_of(stage_id).map(|i| &self.stages[i])
    }

    pub fn status_of(&self, index: StageIndex) -> StageStatus {
        self.stages
            .get(index)
            .map(|s| s.status)
            .unwrap_or_default()
    }

    pub fn scope(&self, scope: &str) -> Option<&ScopeState> {
        self.scopes.get(scope)
    }

    /// Whether a stage may be dispatched at all right now.
    pub fn accepts_dispatch(&self) -> bool {
        !self.status.is_final() && self.fatal.is_none()
    }

    /// Apply one event. Rejects anything the state machine does not allow.
    pub fn apply(&mut self, event: &Event) -> Result<(), EngineError> {
        if event.seq != self.last_seq + 1 {
            return Err(corrupt(
                event,
                &format!("expected seq {}, got {}", self.last_seq + 1, event.seq),
            ));
        }

        match &event.kind {
            EventKind::WorkflowCreated { .. } => {
                if event.seq != 1 {
                    return Err(corrupt(event, "workflow_created after seq 1"));
                }
            }
            EventKind::WorkflowStatusChanged {
                status,
                fatal,
                warnings,
            } => {
                if self.status != *status && !self.status.can_transition(*status) {
                    return Err(EngineError::InvalidTransition {
                        stage: "<workflow>".to_string(),
                        from: self.status.to_string(),
                        to: status.to_string(),
                    });
                }
                self.status = *status;
                if fatal.is_some() {
                    self.fatal = fatal.clone();
                }
                if !warnings.is_empty() {
                    self.warnings = warnings.clone();
                }
            }
            EventKind::StageStarted { attempt, dispatch } => {
                if self.status == WorkflowStatus::Canceled {
                    return Err(EngineError::WorkflowCanceled(self.id().to_string()));
                }
                let index = self.event_stage(event)?;
                let stage_id = self.graph.stages()[index].id.clone();
                if *dispatch == Dispatch::Jump
                    && self.scope_mut_of(index)?.pending.front() != Some(&stage_id)
                {
                    return Err(corrupt(event, "jump dispatch does not match pending queue"));
                }
                self.transition(index, StageStatus::Running)?;
                let scope = self.scope_mut_of(index)?;
                if *dispatch == Dispatch::Jump {
                    scope.pending.pop_front();
                }
                if scope.status == WorkflowStatus::NotStarted {
                    scope.status = WorkflowStatus::Running;
                }
                let stage = &mut self.stages[index];
                stage.attempts = *attempt;
                stage.dispatch = Some(*dispatch);
            }
            EventKind::StageSucceeded { summary } => {
                let index = self.event_stage(event)?;
                self.transition(index, StageStatus::Succeeded)?;
                let stage = &mut self.stages[index];
                stage.last_summary = summary.clone();
                stage.consecutive_failures = 0;
                stage.ever_passed = true;
            }
            EventKind::StageFailed { summary, .. } => {
                let index = self.event_stage(event)?;
                self.transition(index, StageStatus::Failed)?;
                let stage = &mut self.stages[index];
                stage.last_summary = Some(summary.clone());
                stage.consecutive_failures += 1;
                let stage_id = self.graph.stages()[index].id.clone();
                let scope = self.scope_mut_of(index)?;
                scope.failures.push_back(format!("{}: {}", stage_id, summary));
                while scope.failures.len() > FEEDBACK_DEPTH {
                    scope.failures.pop_front();
                }
            }
            EventKind::StageFailedContinue { warning } => {
                let index = self.event_stage(event)?;
                self.transition(index, StageStatus::FailedContinue)?;
                self.scope_mut_of(index)?.warnings.push(warning.clone());
            }
            EventKind::StageTerminal { fatal, .. } => {
                let index = self.event_stage(event)?;
                self.transition(index, StageStatus::Terminal)?;
                let scope = self.scope_mut_of(index)?;
                scope.fatal.get_or_insert_with(|| fatal.clone());
            }
            EventKind::StageCanceled => {
                let index = self.event_stage(event)?;
                self.transition(index, StageStatus::Canceled)?;
            }
            EventKind::StageReset { .. } => {
                let index = self.event_stage(event)?;
                self.transition(index, StageStatus::NotStarted)?;
                if self.stages[index].dispatch == Some(Dispatch::Jump) {
                    let stage_id = self.graph.stages()[index].id.clone();
                    self.scope_mut_of(index)?.pending.push_front(stage_id);
                }
            }
            EventKind::JumpTaken {
                target,
                return_chain,
                total_jumps,
                ..
            } => {
                let from = self.event_stage(event)?;
                if *total_jumps != self.total_jumps + 1 {
                    return Err(corrupt(event, "jump count out of order"));
                }
                let scope_name = self.graph.stages()[from].scope.clone();
                for stage_id in return_chain.iter().chain(std::iter::once(target)) {
                    let index = self.stage_index(stage_id)?;
                    if self.graph.stages()[index].scope != scope_name {
                        return Err(corrupt(event, "jump leaves its scope"));
                    }
                }
                let scope = self.scope_mut_of(from)?;
                for stage_id in return_chain.iter().rev() {
                    scope.pending.push_front(stage_id.clone());
                }
                scope.pending.push_front(target.clone());
                scope.jumps += 1;
                self.total_jumps = *total_jumps;
            }
            EventKind::CounterIncremented { counter, value } => {
                let index = self.event_stage(event)?;
                let counters = &mut self.stages[index].counters;
                let current = counters.get(counter).copied().unwrap_or(0);
                if *value != current + 1 {
                    return Err(corrupt(event, "counter must advance by one"));
                }
                counters.insert(*counter, *value);
            }
            EventKind::CounterReset { counter } => {
                let index = self.event_stage(event)?;
                self.stages[index].counters.insert(*counter, 0);
            }
            EventKind::QualityScored { report } => {
                let index = self.event_stage(event)?;
                self.stages[index].last_report = Some(report.clone());
                self.quality = Some(report.clone());
            }
            EventKind::ScopeFinished {
                scope,
                status,
                fatal,
            } => {
                let entry = self
                    .scopes
                    .get_mut(scope)
                    .ok_or_else(|| corrupt(event, "unknown scope"))?;
                entry.status = *status;
                if fatal.is_some() {
                    entry.fatal = fatal.clone();
                }
            }
            EventKind::JumpCeilingExceeded { ceiling, scope, .. } => match scope {
                Some(scope) => {
                    let entry = self
                        .scopes
                        .get_mut(scope)
                        .ok_or_else(|| corrupt(event, "unknown scope"))?;
                    entry.fatal.get_or_insert(FatalCondition::BranchJumpCeilingExceeded {
                        scope: scope.clone(),
                        ceiling: *ceiling,
                    });
                }
                None => {
                    self.fatal
                        .get_or_insert(FatalCondition::JumpCeilingExceeded { ceiling: *ceiling });
                }
            },
            EventKind::WatchdogFlagged { finding } => {
                self.findings.push(finding.clone());
            }
        }

        if marks_progress(&event.kind) {
            self.progress_seq = event.seq;
            self.progress_at = Some(event.recorded_at);
        }
        self.last_seq = event.seq;
        Ok(())
    }

    fn event_stage(&self, event: &Event) -> Result<StageIndex, EngineError> {
        let stage_id = event
            .stage_id
            .as_deref()
            .ok_or_else(|| corrupt(event, "stage event without stage id"))?;
        self.stage_index(stage_id)
    }

    fn transition(&mut self, index: StageIndex, to: StageStatus) -> Result<(), EngineError> {
        let from = self.stages[index].status;
        if !from.can_transition(to) {
            return Err(EngineError::InvalidTransition {
                stage: self.graph.stages()[index].id.clone(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        self.stages[index].status = to;
        Ok(())
    }

    fn scope_mut_of(&mut self, index: StageIndex) -> Result<&mut ScopeState, EngineError> {
        let scope = &self.graph.stages()[index].scope;
        let workflow_id = self.definition.id.clone();
        self.scopes
            .get_mut(scope)
            .ok_or_else(|| EngineError::CorruptLog {
                workflow_id,
                message: format!("stage in unknown scope '{}'", scope),
            })
    }

    /// Whether `scope` is the pipeline of a module.
    pub fn is_module_scope(scope: &str) -> bool {
        scope_module(scope).is_some()
    }

    pub fn counter(&self, index: StageIndex, kind: CounterKind) -> u32 {
        crate::jump::counter(&self.stages[index].counters, kind)
    }

    /// Stages currently RUNNING.
    pub fn running_stages(&self) -> Vec<StageIndex> {
        (0..self.stages.len())
            .filter(|&i| self.stages[i].status.is_running())
            .collect()
    }

    /// Warnings from every scope, in scope order.
    pub fn all_warnings(&self) -> Vec<String> {
        self.scopes
            .values()
            .flat_map(|s| s.warnings.iter().cloned())
            .collect()
    }

    pub fn snapshot(&self) -> WorkflowSnapshot {
        WorkflowSnapshot {
            id: self.definition.id.clone(),
            name: self.definition.name.clone(),
            status: self.status,
            total_jumps: self.total_jumps,
            last_seq: self.last_seq,
            fatal: self.fatal.clone(),
            warnings: self.warnings.clone(),
            stages: self
                .graph
                .stages()
                .iter()
                .zip(&self.stages)
                .map(|(def, st)| StageSnapshot {
                    id: def.id.clone(),
                    scope: def.scope.clone(),
                    status: st.status,
                    attempts: st.attempts,
                    counters: st.counters.clone(),
                })
                .collect(),
            scopes: self
                .scopes
                .iter()
                .map(|(name, s)| (name.clone(), s.status))
                .collect(),
            quality_total: self.quality.as_ref().map(|q| q.total),
            findings: self.findings.clone(),
        }
    }
}

fn marks_progress(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::WorkflowStatusChanged {
            status: WorkflowStatus::Running,
            ..
        } | EventKind::StageSucceeded { .. }
            | EventKind::StageFailed { .. }
            | EventKind::StageFailedContinue { .. }
            | EventKind::StageReset { .. }
    )
}

fn corrupt(event: &Event, message: &str) -> EngineError {
    EngineError::CorruptLog {
        workflow_id: event.workflow_id.clone(),
        message: format!("seq {}: {}", event.seq, message),
    }
}

/// Read-only view of a workflow for status output and replay comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub id: String,
    pub name: String,
    pub status: WorkflowStatus,
    pub total_jumps: u32,
    pub last_seq: u64,
    pub fatal: Option<FatalCondition>,
    pub warnings: Vec<String>,
    pub stages: Vec<StageSnapshot>,
    pub scopes: BTreeMap<String, WorkflowStatus>,
    pub quality_total: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub findings: Vec<WatchdogFinding>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSnapshot {
    pub id: String,
    pub scope: String,
    pub status: StageStatus,
    pub attempts: u32,
    pub counters: Counters,
}
