use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Arc;

use super::log::{EventLog, WorkflowRecord, check_batch};
use super::{Event, EventKind};
use crate::dag::WorkflowStatus;
use crate::errors::PersistenceError;

/// SQLite-backed event log.
///
/// The connection lives behind `Arc<Mutex>` and every access runs on tokio's
/// blocking pool via `spawn_blocking`. WAL with `synchronous = FULL` means a
/// committed append has been fsynced before `append` returns.
#[derive(Clone)]
pub struct SqliteEventLog {
    inner: Arc<std::sync::Mutex<Connection>>,
}

impl SqliteEventLog {
    /// Open (or create) the log at `path` and run migrations.
    pub fn open(path: &Path) -> Result<Self, PersistenceError> {
        let conn = Connection::open(path).map_err(|source| PersistenceError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = FULL;")?;
        Self::init(conn)
    }

    /// In-memory database (for tests).
    pub fn open_in_memory() -> Result<Self, PersistenceError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, PersistenceError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                last_seq INTEGER NOT NULL DEFAULT 0,
                archived INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS events (
                workflow_id TEXT NOT NULL REFERENCES workflows(id),
                seq INTEGER NOT NULL,
                stage_id TEXT,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                recorded_at TEXT NOT NULL,
                UNIQUE(workflow_id, seq)
            );

            CREATE INDEX IF NOT EXISTS idx_workflows_updated ON workflows(updated_at);
            ",
        )?;
        Ok(Self {
            inner: Arc::new(std::sync::Mutex::new(conn)),
        })
    }

    async fn call<F, R>(&self, f: F) -> Result<R, PersistenceError>
    where
        F: FnOnce(&mut Connection) -> Result<R, PersistenceError> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| PersistenceError::LockPoisoned)?;
            f(&mut guard)
        })
        .await
        .map_err(|e| PersistenceError::TaskPanicked(e.to_string()))?
    }
}

fn append_batch(conn: &mut Connection, events: &[Event]) -> Result<(), PersistenceError> {
    let Some(first) = events.first() else {
        return Ok(());
    };
    let tx = conn.transaction()?;

    let mut record = match tx
        .query_row(
            "SELECT id, name, status, created_at, updated_at, last_seq, archived
             FROM workflows WHERE id = ?1",
            params![first.workflow_id],
            row_to_record,
        )
        .optional()?
    {
        Some(record) => {
            if matches!(first.kind, EventKind::WorkflowCreated { .. }) {
                return Err(PersistenceError::DuplicateWorkflow(first.workflow_id.clone()));
            }
            record
        }
        None => WorkflowRecord::from_created(first).ok_or_else(|| PersistenceError::SequenceGap {
            workflow_id: first.workflow_id.clone(),
            expected: 1,
            found: first.seq,
        })?,
    };

    check_batch(events, record.last_seq)?;
    record.absorb(events);

    tx.execute(
        "INSERT INTO workflows (id, name, status, created_at, updated_at, last_seq, archived)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(id) DO UPDATE SET
            status = excluded.status,
            updated_at = excluded.updated_at,
            last_seq = excluded.last_seq",
        params![
            record.id,
            record.name,
            record.status.to_string(),
            record.created_at,
            record.updated_at,
            record.last_seq as i64,
            record.archived,
        ],
    )?;

    {
        let mut stmt = tx.prepare(
            "INSERT INTO events (workflow_id, seq, stage_id, kind, payload, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for event in events {
            stmt.execute(params![
                event.workflow_id,
                event.seq as i64,
                event.stage_id,
                event.kind.name(),
                serde_json::to_string(&event.kind)?,
                event.recorded_at,
            ])?;
        }
    }

    tx.commit()?;
    Ok(())
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkflowRecord> {
    let status: String = row.get(2)?;
    let status = status.parse::<WorkflowStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, Type::Text, e.into())
    })?;
    Ok(WorkflowRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        status,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
        last_seq: row.get::<_, i64>(5)? as u64,
        archived: row.get(6)?,
    })
}

#[async_trait]
impl EventLog for SqliteEventLog {
    async fn append(&self, events: &[Event]) -> Result<(), PersistenceError> {
        let events = events.to_vec();
        self.call(move |conn| append_batch(conn, &events)).await
    }

    async fn read(&self, workflow_id: &str, from_seq: u64) -> Result<Vec<Event>, PersistenceError> {
        let workflow_id = workflow_id.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT seq, stage_id, payload, recorded_at FROM events
                 WHERE workflow_id = ?1 AND seq >= ?2 ORDER BY seq",
            )?;
            let rows = stmt.query_map(params![workflow_id, from_seq as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, DateTime<Utc>>(3)?,
                ))
            })?;

            let mut events = Vec::new();
            for row in rows {
                let (seq, stage_id, payload, recorded_at) = row?;
                events.push(Event {
                    seq: seq as u64,
                    workflow_id: workflow_id.clone(),
                    stage_id,
                    kind: serde_json::from_str(&payload)?,
                    recorded_at,
                });
            }
            Ok(events)
        })
        .await
    }

    async fn workflows(&self) -> Result<Vec<WorkflowRecord>, PersistenceError> {
        self.call(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, status, created_at, updated_at, last_seq, archived
                 FROM workflows ORDER BY updated_at DESC, id",
            )?;
            let records = stmt
                .query_map([], row_to_record)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(records)
        })
        .await
    }

    async fn set_archived(&self, workflow_id: &str) -> Result<bool, PersistenceError> {
        let workflow_id = workflow_id.to_string();
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE workflows SET archived = 1 WHERE id = ?1",
                params![workflow_id],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn workflow(&self, workflow_id: &str) -> Result<Option<WorkflowRecord>, PersistenceError> {
        let workflow_id = workflow_id.to_string();
        self.call(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT id, name, status, created_at, updated_at, last_seq, archived
                     FROM workflows WHERE id = ?1",
                    params![workflow_id],
                    row_to_record,
                )
                .optional()?)
        })
        .await
    }
}
