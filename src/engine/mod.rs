//! The orchestration engine.
//!
//! ## Architecture
//!
//! 1. **Definition** - Plan in, stage graph and jump rules out
//! 2. **State** - Pure fold of a workflow's events
//! 3. **Journal** - Write-ahead owner of one workflow's state
//! 4. **Runner** - Scheduling loop over one scope
//! 5. **Coordinator** - Scope ordering and concurrent module waves
//! 6. **Recovery** - Re-queues work interrupted by a crash
//! 7. **Watchdog** - Flags stalled or looping runs while they execute
//!
//! [`Engine`] is the command surface over all of it.

mod coordinator;
mod definition;
mod journal;
mod lock;
mod recovery;
mod runner;
mod state;
mod watchdog;

pub use definition::{
    INTEGRATION_SCOPE, MAIN_SCOPE, PRE_SCOPE, WorkflowDefinition, module_scope, scope_module,
};
pub use lock::WorkflowLock;
pub use recovery::RecoveryReport;
pub use state::{ScopeState, StageSnapshot, StageState, WorkflowSnapshot, WorkflowState};
pub use watchdog::{Severity, Watchdog, WatchdogFinding, WatchdogRule, inspect};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{AnvilConfig, ExecutorSection};
use crate::dag::{Outcome, WorkflowStatus};
use crate::errors::EngineError;
use crate::events::{
    Event, EventBus, EventDraft, EventKind, EventLog, SqliteEventLog, Subscription,
    SubscriptionFilter, WorkflowRecord,
};
use crate::executor::Executors;
use crate::plan::Plan;
use coordinator::Coordinator;
use journal::Journal;

/// How often a running workflow checks for a cancel request from another
/// process.
const CANCEL_POLL: Duration = Duration::from_millis(500);

struct ActiveRun {
    journal: Arc<Journal>,
    cancel: CancellationToken,
}

type ActiveRuns = Arc<Mutex<HashMap<String, ActiveRun>>>;

/// Removes a run from the active set however its future ends.
struct ActiveGuard {
    runs: ActiveRuns,
    id: String,
    watcher: CancellationToken,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.watcher.cancel();
        if let Ok(mut runs) = self.runs.lock() {
            runs.remove(&self.id);
        }
    }
}

pub struct Engine {
    config: AnvilConfig,
    log: Arc<dyn EventLog>,
    bus: EventBus,
    executors: Executors,
    timeouts: Arc<ExecutorSection>,
    active: ActiveRuns,
}

impl Engine {
    pub fn new(
        config: AnvilConfig,
        log: Arc<dyn EventLog>,
        bus: EventBus,
        executors: Executors,
    ) -> Self {
        let timeouts = Arc::new(config.toml.executor.clone());
        Self {
            config,
            log,
            bus,
            executors,
            timeouts,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Engine over the project's SQLite log.
    pub fn open(config: AnvilConfig, executors: Executors) -> Result<Self, EngineError> {
        config.ensure_dirs()?;
        let log = Arc::new(SqliteEventLog::open(&config.db_path())?);
        let bus = EventBus::new(config.toml.bus.capacity);
        Ok(Self::new(config, log, bus, executors))
    }

    pub fn config(&self) -> &AnvilConfig {
        &self.config
    }

    pub fn log(&self) -> Arc<dyn EventLog> {
        self.log.clone()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Validate a plan and record a new workflow for it.
    pub async fn create_workflow(&self, plan: &Plan) -> Result<String, EngineError> {
        for warning in plan.validate()? {
            warn!(plan = %plan.name, %warning, "plan warning");
        }
        let definition = WorkflowDefinition::from_plan(plan, self.config.policy())?;
        let id = definition.id.clone();
        let stages = definition.stages.len();
        Journal::create(self.log.clone(), self.bus.clone(), definition).await?;
        info!(workflow = %id, plan = %plan.name, stages, "workflow created");
        Ok(id)
    }

    /// Create a workflow and run it to completion.
    pub async fn run_plan(&self, plan: &Plan) -> Result<Outcome, EngineError> {
        let id = self.create_workflow(plan).await?;
        self.start(&id).await
    }

    /// Drive a workflow until it reaches a final status.
    ///
    /// Claims the workflow's lock for the duration. Stages left RUNNING by a
    /// previous process are re-queued before anything is dispatched.
    pub async fn start(&self, workflow_id: &str) -> Result<Outcome, EngineError> {
        let _lock = lock::WorkflowLock::acquire(&self.config.lock_dir(), workflow_id)?;
        let journal = Arc::new(Journal::open(self.log.clone(), self.bus.clone(), workflow_id).await?);

        let status = journal.read(|s| s.status).await;
        if !status.is_resumable() {
            return Err(EngineError::NotResumable {
                id: workflow_id.to_string(),
                status: status.to_string(),
            });
        }
        let reset = recovery::recover_journal(&journal).await?;
        if !reset.is_empty() {
            warn!(workflow = workflow_id, stages = ?reset, "re-queued interrupted stages");
        }

        let cancel = CancellationToken::new();
        let watcher = CancellationToken::new();
        if let Ok(mut runs) = self.active.lock() {
            runs.insert(
                workflow_id.to_string(),
                ActiveRun {
                    journal: journal.clone(),
                    cancel: cancel.clone(),
                },
            );
        }
        let _guard = ActiveGuard {
            runs: self.active.clone(),
            id: workflow_id.to_string(),
            watcher: watcher.clone(),
        };
        tokio::spawn(watch_cancel_marker(
            self.cancel_marker(workflow_id),
            journal.clone(),
            cancel.clone(),
            watcher,
        ));

        let patrol = CancellationToken::new();
        let watchdog = self.config.toml.watchdog;
        let watchdog = watchdog
            .enabled
            .then(|| tokio::spawn(Watchdog::new(journal.clone(), watchdog).run(patrol.clone())));

        info!(workflow = workflow_id, "workflow started");
        let outcome = Coordinator::new(
            journal,
            self.executors.clone(),
            self.timeouts.clone(),
            cancel,
            self.config.toml.scheduler.max_parallel_modules,
        )
        .run()
        .await;

        patrol.cancel();
        if let Some(handle) = watchdog {
            let _ = handle.await;
        }
        outcome
    }

    /// Re-queue interrupted work of every resumable workflow not driven by
    /// another process.
    pub async fn recover(&self) -> Result<Vec<RecoveryReport>, EngineError> {
        recovery::recover_all(self.log.clone(), self.bus.clone(), &self.config.lock_dir()).await
    }

    /// Recover, then resume the most recently updated resumable workflow.
    /// `Ok(None)` when there is nothing to resume.
    pub async fn resume_latest(&self) -> Result<Option<Outcome>, EngineError> {
        self.recover().await?;
        match self.latest_resumable().await? {
            Some(id) => {
                info!(workflow = %id, "resuming workflow");
                self.start(&id).await.map(Some)
            }
            None => Ok(None),
        }
    }

    /// Most recently updated resumable workflow no process is driving.
    pub async fn latest_resumable(&self) -> Result<Option<String>, EngineError> {
        let lock_dir = self.config.lock_dir();
        for record in self.log.workflows().await? {
            if record.is_resumable() && !WorkflowLock::is_held(&lock_dir, &record.id)? {
                return Ok(Some(record.id));
            }
        }
        Ok(None)
    }

    /// Cancel a workflow.
    ///
    /// A run in this process is marked CANCELED and its executors signaled.
    /// A run in another process is asked to stop through a marker file. A
    /// workflow nobody is driving is closed out directly in the log.
    pub async fn cancel(&self, workflow_id: &str) -> Result<(), EngineError> {
        let active = self.active.lock().ok().and_then(|runs| {
            runs.get(workflow_id)
                .map(|run| (run.journal.clone(), run.cancel.clone()))
        });
        if let Some((journal, token)) = active {
            cancel_run(&journal, &token).await?;
            info!(workflow = workflow_id, "workflow canceled");
            return Ok(());
        }

        if self.log.workflow(workflow_id).await?.is_none() {
            return Err(EngineError::UnknownWorkflow(workflow_id.to_string()));
        }

        match WorkflowLock::try_acquire(&self.config.lock_dir(), workflow_id)? {
            Some(_lock) => {
                let journal = Journal::open(self.log.clone(), self.bus.clone(), workflow_id).await?;
                journal
                    .transact(|state| Ok((recovery::offline_cancel(state), ())))
                    .await?;
                info!(workflow = workflow_id, "idle workflow canceled");
            }
            None => {
                let marker = self.cancel_marker(workflow_id);
                if let Some(dir) = marker.parent() {
                    std::fs::create_dir_all(dir).map_err(anyhow::Error::from)?;
                }
                std::fs::write(&marker, b"").map_err(anyhow::Error::from)?;
                info!(workflow = workflow_id, "cancel requested from owning process");
            }
        }
        Ok(())
    }

    pub fn subscribe(&self, filter: SubscriptionFilter) -> Subscription {
        self.bus.subscribe(filter)
    }

    /// Recorded events of a workflow from `from_seq` on.
    pub async fn history(&self, workflow_id: &str, from_seq: u64) -> Result<Vec<Event>, EngineError> {
        let events = self.log.read(workflow_id, from_seq).await?;
        if events.is_empty() && self.log.workflow(workflow_id).await?.is_none() {
            return Err(EngineError::UnknownWorkflow(workflow_id.to_string()));
        }
        Ok(events)
    }

    pub async fn status(&self, workflow_id: &str) -> Result<WorkflowSnapshot, EngineError> {
        let active = self
            .active
            .lock()
            .ok()
            .and_then(|runs| runs.get(workflow_id).map(|run| run.journal.clone()));
        match active {
            Some(journal) => Ok(journal.snapshot().await),
            None => Ok(Journal::open(self.log.clone(), self.bus.clone(), workflow_id)
                .await?
                .snapshot()
                .await),
        }
    }

    pub async fn list(&self) -> Result<Vec<WorkflowRecord>, EngineError> {
        Ok(self.log.workflows().await?)
    }

    /// Hide a finished workflow from recovery and resume.
    pub async fn archive(&self, workflow_id: &str) -> Result<(), EngineError> {
        let record = self
            .log
            .workflow(workflow_id)
            .await?
            .ok_or_else(|| EngineError::UnknownWorkflow(workflow_id.to_string()))?;
        if !record.status.is_final() && WorkflowLock::is_held(&self.config.lock_dir(), workflow_id)? {
            return Err(EngineError::WorkflowLocked(workflow_id.to_string()));
        }
        self.log.set_archived(workflow_id).await?;
        info!(workflow = workflow_id, "workflow archived");
        Ok(())
    }

    fn cancel_marker(&self, workflow_id: &str) -> PathBuf {
        self.config.cancel_dir().join(workflow_id)
    }
}

/// Mark an in-process run CANCELED, then signal its executors.
async fn cancel_run(journal: &Journal, token: &CancellationToken) -> Result<(), EngineError> {
    journal
        .transact(|state| {
            if state.status.is_final() {
                return Ok((Vec::new(), ()));
            }
            Ok((
                vec![EventDraft::workflow(EventKind::WorkflowStatusChanged {
                    status: WorkflowStatus::Canceled,
                    fatal: None,
                    warnings: Vec::new(),
                })],
                (),
            ))
        })
        .await?;
    token.cancel();
    Ok(())
}

async fn watch_cancel_marker(
    marker: PathBuf,
    journal: Arc<Journal>,
    cancel: CancellationToken,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(CANCEL_POLL);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                if !marker.exists() {
                    continue;
                }
                let _ = std::fs::remove_file(&marker);
                if let Err(e) = cancel_run(&journal, &cancel).await {
                    warn!(error = %e, "failed to record cancel request");
                }
                break;
            }
        }
    }
}
