use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Event, EventKind};
use crate::dag::WorkflowStatus;
use crate::errors::PersistenceError;

/// Append-only, ordered, crash-durable event storage.
///
/// Appends are acknowledged only once durable. A batch is all-or-nothing and
/// must continue the workflow's sequence without gaps: the first event of a
/// new workflow is seq 1, every later batch starts at `last_seq + 1`.
#[async_trait]
pub trait EventLog: Send + Sync {
    async fn append(&self, events: &[Event]) -> Result<(), PersistenceError>;

    /// Events of one workflow with `seq >= from_seq`, in order.
    async fn read(&self, workflow_id: &str, from_seq: u64) -> Result<Vec<Event>, PersistenceError>;

    /// Every known workflow, most recently updated first.
    async fn workflows(&self) -> Result<Vec<WorkflowRecord>, PersistenceError>;

    /// Mark a workflow archived. Returns false if it does not exist.
    async fn set_archived(&self, workflow_id: &str) -> Result<bool, PersistenceError>;

    async fn workflow(&self, workflow_id: &str) -> Result<Option<WorkflowRecord>, PersistenceError> {
        Ok(self
            .workflows()
            .await?
            .into_iter()
            .find(|w| w.id == workflow_id))
    }
}

/// Projection of a workflow's log used for listing and recovery scans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub id: String,
    pub name: String,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_seq: u64,
    pub archived: bool,
}

impl WorkflowRecord {
    /// Start a record from the batch that creates a workflow.
    pub(crate) fn from_created(event: &Event) -> Option<Self> {
        match &event.kind {
            EventKind::WorkflowCreated { definition } => Some(Self {
                id: event.workflow_id.clone(),
                name: definition.name.clone(),
                status: WorkflowStatus::NotStarted,
                created_at: definition.created_at,
                updated_at: event.recorded_at,
                last_seq: 0,
                archived: false,
            }),
            _ => None,
        }
    }

    /// Fold a durable batch into the projection.
    pub(crate) fn absorb(&mut self, events: &[Event]) {
        for event in events {
            if let EventKind::WorkflowStatusChanged { status, .. } = &event.kind {
                self.status = *status;
            }
            self.last_seq = event.seq;
            self.updated_at = event.recorded_at;
        }
    }

    pub fn is_resumable(&self) -> bool {
        !self.archived && self.status.is_resumable()
    }
}

/// Check that `events` is a single-workflow batch continuing `last_seq`.
pub(crate) fn check_batch(events: &[Event], last_seq: u64) -> Result<(), PersistenceError> {
    let mut expected = last_seq + 1;
    for event in events {
        if event.seq != expected || event.workflow_id != events[0].workflow_id {
            return Err(PersistenceError::SequenceGap {
                workflow_id: event.workflow_id.clone(),
                expected,
                found: event.seq,
            });
        }
        expected += 1;
    }
    Ok(())
}
