use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use super::definition::WorkflowDefinition;
use super::state::{WorkflowSnapshot, WorkflowState};
use crate::errors::EngineError;
use crate::events::{Event, EventBus, EventDraft, EventKind, EventLog};

/// Write-ahead owner of one workflow's state.
///
/// Every change goes through [`Journal::transact`]: the drafted events are
/// applied to a copy of the state, appended to the log, and only then made
/// visible in memory and on the bus. A failed append leaves the in-memory
/// state untouched. Events reach the bus in seq order even when several
/// module runners record concurrently.
pub struct Journal {
    log: Arc<dyn EventLog>,
    bus: EventBus,
    state: Mutex<WorkflowState>,
}

impl Journal {
    /// Record a new workflow. Fails if the id is already in the log.
    pub async fn create(
        log: Arc<dyn EventLog>,
        bus: EventBus,
        definition: WorkflowDefinition,
    ) -> Result<Self, EngineError> {
        let journal = Self {
            state: Mutex::new(WorkflowState::new(definition.clone())?),
            log,
            bus,
        };
        journal
            .record(vec![EventDraft::workflow(EventKind::WorkflowCreated {
                definition: Box::new(definition),
            })])
            .await?;
        Ok(journal)
    }

    /// Rebuild a workflow from its log.
    pub async fn open(
        log: Arc<dyn EventLog>,
        bus: EventBus,
        workflow_id: &str,
    ) -> Result<Self, EngineError> {
        let events = log.read(workflow_id, 1).await?;
        if events.is_empty() {
            return Err(EngineError::UnknownWorkflow(workflow_id.to_string()));
        }
        let state = WorkflowState::replay(&events)?;
        debug!(workflow = workflow_id, events = events.len(), "workflow replayed");
        Ok(Self {
            log,
            bus,
            state: Mutex::new(state),
        })
    }

    pub async fn snapshot(&self) -> WorkflowSnapshot {
        self.state.lock().await.snapshot()
    }

    /// Run `f` against the current state without changing it.
    pub async fn read<R>(&self, f: impl FnOnce(&WorkflowState) -> R) -> R {
        f(&*self.state.lock().await)
    }

    pub async fn definition(&self) -> Arc<WorkflowDefinition> {
        self.state.lock().await.definition.clone()
    }

    /// Decide and record atomically.
    ///
    /// `f` sees the state as of the last committed event and returns the
    /// events to record plus a value for the caller. No other writer can
    /// interleave between the decision and the append.
    pub async fn transact<T>(
        &self,
        f: impl FnOnce(&WorkflowState) -> Result<(Vec<EventDraft>, T), EngineError>,
    ) -> Result<T, EngineError> {
        let mut state = self.state.lock().await;
        let (drafts, value) = f(&state)?;
        if drafts.is_empty() {
            return Ok(value);
        }

        let mut next = state.clone();
        let mut events = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let event = Event {
                seq: next.last_seq + 1,
                workflow_id: next.definition.id.clone(),
                stage_id: draft.stage_id,
                kind: draft.kind,
                recorded_at: Utc::now(),
            };
            next.apply(&event)?;
            events.push(event);
        }

        self.log.append(&events).await?;
        *state = next;

        // Published under the lock so the bus sees seqs in log order.
        for event in events {
            debug!(
                workflow = %event.workflow_id,
                seq = event.seq,
                stage = event.stage().unwrap_or("-"),
                kind = event.kind.name(),
                "event recorded"
            );
            self.bus.publish(event);
        }
        drop(state);
        Ok(value)
    }

    /// Record events unconditionally.
    pub async fn record(&self, drafts: Vec<EventDraft>) -> Result<(), EngineError> {
        self.transact(|_| Ok((drafts, ()))).await
    }
}
