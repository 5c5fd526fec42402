use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::log::{EventLog, WorkflowRecord, check_batch};
use super::{Event, EventKind};
use crate::errors::PersistenceError;

#[derive(Default)]
struct Stored {
    records: HashMap<String, WorkflowRecord>,
    events: HashMap<String, Vec<Event>>,
}

/// In-process event log with the same contract as [`super::SqliteEventLog`].
/// Nothing survives the process; used by tests and dry runs.
#[derive(Clone, Default)]
pub struct MemoryEventLog {
    inner: Arc<Mutex<Stored>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Stored>, PersistenceError> {
        self.inner.lock().map_err(|_| PersistenceError::LockPoisoned)
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, events: &[Event]) -> Result<(), PersistenceError> {
        let Some(first) = events.first() else {
            return Ok(());
        };
        let mut stored = self.lock()?;

        let mut record = match stored.records.get(&first.workflow_id) {
            Some(_) if matches!(first.kind, EventKind::WorkflowCreated { .. }) => {
                return Err(PersistenceError::DuplicateWorkflow(first.workflow_id.clone()));
            }
            Some(record) => record.clone(),
            None => WorkflowRecord::from_created(first).ok_or_else(|| {
                PersistenceError::SequenceGap {
                    workflow_id: first.workflow_id.clone(),
                    expected: 1,
                    found: first.seq,
                }
            })?,
        };

        check_batch(events, record.last_seq)?;
        record.absorb(events);

        stored
            .events
            .entry(record.id.clone())
            .or_default()
            .extend_from_slice(events);
        stored.records.insert(record.id.clone(), record);
        Ok(())
    }

    async fn read(&self, workflow_id: &str, from_seq: u64) -> Result<Vec<Event>, PersistenceError> {
        let stored = self.lock()?;
        Ok(stored
            .events
            .get(workflow_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.seq >= from_seq)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn workflows(&self) -> Result<Vec<WorkflowRecord>, PersistenceError> {
        let stored = self.lock()?;
        let mut records: Vec<WorkflowRecord> = stored.records.values().cloned().collect();
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn set_archived(&self, workflow_id: &str) -> Result<bool, PersistenceError> {
        let mut stored = self.lock()?;
        Ok(match stored.records.get_mut(workflow_id) {
            Some(record) => {
                record.archived = true;
                true
            }
            None => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::WorkflowStatus;
    use crate::engine::WorkflowDefinition;
    use crate::plan::Plan;
    use chrono::Utc;

    fn event(seq: u64, kind: EventKind) -> Event {
        Event {
            seq,
            workflow_id: "wf".into(),
            stage_id: None,
            kind,
            recorded_at: Utc::now(),
        }
    }

    fn created() -> Event {
        let definition = WorkflowDefinition::from_plan(&Plan::new("mem"), Default::default())
            .unwrap()
            .with_id("wf");
        event(
            1,
            EventKind::WorkflowCreated {
                definition: Box::new(definition),
            },
        )
    }

    #[tokio::test]
    async fn test_matches_sqlite_contract() {
        let log = MemoryEventLog::new();
        log.append(&[created()]).await.unwrap();

        let gap = log
            .append(&[event(3, EventKind::StageCanceled)])
            .await
            .unwrap_err();
        assert!(matches!(gap, PersistenceError::SequenceGap { expected: 2, .. }));

        log.append(&[event(
            2,
            EventKind::WorkflowStatusChanged {
                status: WorkflowStatus::Canceled,
                fatal: None,
                warnings: vec![],
            },
        )])
        .await
        .unwrap();

        let records = log.workflows().await.unwrap();
        assert_eq!(records[0].status, WorkflowStatus::Canceled);
        assert_eq!(log.read("wf", 2).await.unwrap().len(), 1);
        assert!(log.read("other", 1).await.unwrap().is_empty());
    }
}
