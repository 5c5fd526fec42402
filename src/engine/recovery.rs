use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use super::journal::Journal;
use super::lock::WorkflowLock;
use super::state::WorkflowState;
use crate::dag::{StageStatus, WorkflowStatus};
use crate::errors::EngineError;
use crate::events::{EventBus, EventDraft, EventKind, EventLog};

const RESET_REASON: &str = "interrupted; re-queued by recovery";

/// What recovery did to one workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub workflow_id: String,
    /// Stages moved from RUNNING back to NOT_STARTED
    pub reset: Vec<String>,
}

/// Resets for every stage the log shows as RUNNING.
///
/// Only valid while holding the workflow's lock: a RUNNING stage then has no
/// live executor behind it.
pub(crate) fn interrupted_resets(state: &WorkflowState) -> Vec<EventDraft> {
    state
        .running_stages()
        .into_iter()
        .rev()
        .map(|i| {
            EventDraft::stage(
                &state.graph.stages()[i].id,
                EventKind::StageReset {
                    reason: RESET_REASON.to_string(),
                },
            )
        })
        .collect()
}

/// Re-queue the interrupted stages of one open workflow.
pub(crate) async fn recover_journal(journal: &Journal) -> Result<Vec<String>, EngineError> {
    journal
        .transact(|state| {
            if !state.status.is_resumable() {
                return Ok((Vec::new(), Vec::new()));
            }
            let drafts = interrupted_resets(state);
            let reset = drafts.iter().filter_map(|d| d.stage_id.clone()).collect();
            Ok((drafts, reset))
        })
        .await
}

/// Scan the log and re-queue interrupted work of every resumable workflow
/// no other process is driving.
pub(crate) async fn recover_all(
    log: Arc<dyn EventLog>,
    bus: EventBus,
    lock_dir: &Path,
) -> Result<Vec<RecoveryReport>, EngineError> {
    let mut reports = Vec::new();
    for record in log.workflows().await? {
        if !record.is_resumable() {
            continue;
        }
        let Some(_lock) = WorkflowLock::try_acquire(lock_dir, &record.id)? else {
            info!(workflow = %record.id, "workflow is locked by another process; not recovering");
            continue;
        };
        let journal = Journal::open(log.clone(), bus.clone(), &record.id).await?;
        let reset = recover_journal(&journal).await?;
        if !reset.is_empty() {
            warn!(workflow = %record.id, stages = ?reset, "re-queued interrupted stages");
        }
        reports.push(RecoveryReport {
            workflow_id: record.id,
            reset,
        });
    }
    Ok(reports)
}

/// Events that cancel a workflow nobody is driving: the status change, every
/// stage that could still move, and every open scope.
pub(crate) fn offline_cancel(state: &WorkflowState) -> Vec<EventDraft> {
    if state.status.is_final() {
        return Vec::new();
    }
    let mut drafts = vec![EventDraft::workflow(EventKind::WorkflowStatusChanged {
        status: WorkflowStatus::Canceled,
        fatal: None,
        warnings: Vec::new(),
    })];
    drafts.extend(
        state
            .graph
            .stages()
            .iter()
            .zip(&state.stages)
            .filter(|(_, st)| {
                matches!(
                    st.status,
                    StageStatus::NotStarted | StageStatus::Running | StageStatus::Failed
                )
            })
            .map(|(def, _)| EventDraft::stage(&def.id, EventKind::StageCanceled)),
    );
    drafts.extend(
        state
            .scopes
            .iter()
            .filter(|(_, s)| !s.status.is_final())
            .map(|(name, _)| {
                EventDraft::workflow(EventKind::ScopeFinished {
                    scope: name.clone(),
                    status: WorkflowStatus::Canceled,
                    fatal: None,
                })
            }),
    );
    drafts
}
