//! Drives a workflow's scopes in order.
//!
//! A serial workflow has one scope. A parallel workflow runs `pre`, then its
//! module pipelines wave by wave (modules inside a wave run concurrently),
//! then `integration`. Scopes already finished in the log are skipped, so
//! the same call resumes a recovered workflow.

use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::definition::{INTEGRATION_SCOPE, MAIN_SCOPE, PRE_SCOPE, module_scope};
use super::journal::Journal;
use super::runner::{ScopeRunner, skipped_stages};
use super::state::WorkflowState;
use crate::config::ExecutorSection;
use crate::dag::{Outcome, WorkflowStatus};
use crate::errors::{EngineError, FatalCondition};
use crate::events::{EventDraft, EventKind};
use crate::executor::Executors;

pub(crate) struct Coordinator {
    journal: Arc<Journal>,
    executors: Executors,
    timeouts: Arc<ExecutorSection>,
    cancel: CancellationToken,
    max_parallel_modules: usize,
}

impl Coordinator {
    pub fn new(
        journal: Arc<Journal>,
        executors: Executors,
        timeouts: Arc<ExecutorSection>,
        cancel: CancellationToken,
        max_parallel_modules: usize,
    ) -> Self {
        Self {
            journal,
            executors,
            timeouts,
            cancel,
            max_parallel_modules: max_parallel_modules.max(1),
        }
    }

    pub async fn run(&self) -> Result<Outcome, EngineError> {
        let already_final = self
            .journal
            .transact(|state| match state.status {
                WorkflowStatus::NotStarted => Ok((
                    vec![EventDraft::workflow(EventKind::WorkflowStatusChanged {
                        status: WorkflowStatus::Running,
                        fatal: None,
                        warnings: Vec::new(),
                    })],
                    false,
                )),
                status => Ok((Vec::new(), status.is_final())),
            })
            .await?;
        if already_final {
            return Ok(self.outcome().await);
        }

        let definition = self.journal.definition().await;
        if definition.is_parallel() {
            self.run_parallel(&definition.module_waves()).await?;
        } else {
            self.run_scope(MAIN_SCOPE).await?;
        }
        self.conclude().await
    }

    async fn run_parallel(&self, waves: &[Vec<String>]) -> Result<(), EngineError> {
        if !self.run_scope(PRE_SCOPE).await?.is_ok() {
            return Ok(());
        }

        let mut failed = Vec::new();
        for (i, wave) in waves.iter().enumerate() {
            info!(wave = i + 1, modules = ?wave, "starting module wave");
            failed.extend(self.run_wave(wave).await?);
            if !failed.is_empty() || self.cancel.is_cancelled() {
                break;
            }
        }

        if !failed.is_empty() {
            warn!(modules = ?failed, "module pipelines failed; skipping integration");
            self.journal
                .record(vec![EventDraft::workflow(EventKind::ScopeFinished {
                    scope: INTEGRATION_SCOPE.to_string(),
                    status: WorkflowStatus::Terminal,
                    fatal: Some(FatalCondition::ModuleFailed { modules: failed }),
                })])
                .await?;
            return Ok(());
        }
        if self.cancel.is_cancelled() {
            return Ok(());
        }

        self.run_scope(INTEGRATION_SCOPE).await?;
        Ok(())
    }

    /// Run one wave of modules concurrently. Returns the modules that ended
    /// terminal.
    async fn run_wave(&self, wave: &[String]) -> Result<Vec<String>, EngineError> {
        let permits = Arc::new(Semaphore::new(self.max_parallel_modules));
        let mut set: JoinSet<(String, Result<WorkflowStatus, EngineError>)> = JoinSet::new();
        let mut failed = Vec::new();

        for module in wave {
            let scope = module_scope(module);
            // Finished before a restart; unfinished siblings still run.
            if let Some(status) = self.finished_status(&scope).await {
                if status == WorkflowStatus::Terminal {
                    failed.push(module.clone());
                }
                continue;
            }
            let runner = self.runner(&scope);
            let permits = permits.clone();
            let module = module.clone();
            set.spawn(async move {
                let _permit = permits.acquire_owned().await;
                (module, runner.run().await)
            });
        }

        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            let (module, result) = joined
                .map_err(|e| EngineError::Other(anyhow::anyhow!("module task failed: {}", e)))?;
            match result {
                Ok(WorkflowStatus::Terminal) => failed.push(module),
                Ok(status) => info!(module = %module, %status, "module finished"),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        failed.sort();
        Ok(failed)
    }

    /// Run a scope unless the log says it already finished.
    async fn run_scope(&self, scope: &str) -> Result<ScopeResult, EngineError> {
        let status = match self.finished_status(scope).await {
            Some(status) => status,
            None => self.runner(scope).run().await?,
        };
        Ok(ScopeResult(status))
    }

    async fn finished_status(&self, scope: &str) -> Option<WorkflowStatus> {
        self.journal
            .read(|s| s.scope(scope).map(|s| s.status).filter(|s| s.is_final()))
            .await
    }

    fn runner(&self, scope: &str) -> ScopeRunner {
        ScopeRunner::new(
            self.journal.clone(),
            self.executors.clone(),
            self.timeouts.clone(),
            scope,
            self.cancel.clone(),
        )
    }

    /// Record the workflow's final status from its scopes.
    async fn conclude(&self) -> Result<Outcome, EngineError> {
        let canceled = self.cancel.is_cancelled();
        self.journal
            .transact(|state| {
                if state.status.is_final() {
                    return Ok((Vec::new(), ()));
                }
                let (status, fatal, warnings) = final_verdict(state, canceled);
                Ok((
                    vec![EventDraft::workflow(EventKind::WorkflowStatusChanged {
                        status,
                        fatal,
                        warnings,
                    })],
                    (),
                ))
            })
            .await?;
        let outcome = self.outcome().await;
        info!(workflow = %outcome.workflow_id, status = %outcome.status, "workflow finished");
        Ok(outcome)
    }

    async fn outcome(&self) -> Outcome {
        self.journal
            .read(|state| Outcome {
                workflow_id: state.definition.id.clone(),
                status: state.status,
                fatal: state.fatal.clone(),
                warnings: state.warnings.clone(),
            })
            .await
    }
}

struct ScopeResult(WorkflowStatus);

impl ScopeResult {
    /// Later scopes may run after this one.
    fn is_ok(&self) -> bool {
        matches!(
            self.0,
            WorkflowStatus::Succeeded | WorkflowStatus::FailedContinue
        )
    }
}

/// Final status, fatal condition and warnings of a workflow whose scopes
/// have all been run (or skipped).
pub(crate) fn final_verdict(
    state: &WorkflowState,
    canceled: bool,
) -> (WorkflowStatus, Option<FatalCondition>, Vec<String>) {
    let mut warnings = state.all_warnings();
    for (name, scope) in &state.scopes {
        if scope.status == WorkflowStatus::FailedContinue {
            let skipped = skipped_stages(state, name);
            if !skipped.is_empty() {
                warnings.push(format!("'{}' skipped: {}", name, skipped.join(", ")));
            }
        }
    }

    if canceled || state.scopes.values().any(|s| s.status == WorkflowStatus::Canceled) {
        return (WorkflowStatus::Canceled, None, warnings);
    }

    if let Some(fatal) = state.fatal.clone() {
        return (WorkflowStatus::Terminal, Some(fatal), warnings);
    }
    // The condition of the first scope, in run order, that went terminal.
    let order = state.definition.scopes();
    let terminal = order
        .iter()
        .filter_map(|name| state.scope(name))
        .find(|s| s.status == WorkflowStatus::Terminal);
    if let Some(scope) = terminal {
        return (WorkflowStatus::Terminal, scope.fatal.clone(), warnings);
    }
    if order
        .iter()
        .filter_map(|name| state.scope(name))
        .any(|s| !s.status.is_final())
    {
        // A scope never ran: an earlier one stopped the workflow.
        return (WorkflowStatus::Terminal, None, warnings);
    }

    if warnings.is_empty() {
        (WorkflowStatus::Succeeded, None, warnings)
    } else {
        (WorkflowStatus::FailedContinue, None, warnings)
    }
}
