//! One scheduling loop over one scope of a workflow.
//!
//! The runner dispatches stages of its scope as they become ready, waits for
//! their executors, and records each outcome together with the jump decision
//! it triggers. It returns once the scope has finished (or was canceled).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::definition::scope_module;
use super::journal::Journal;
use super::state::WorkflowState;
use crate::config::ExecutorSection;
use crate::dag::{DagScheduler, StageIndex, StageRole, StageStatus, WorkflowStatus};
use crate::errors::{CheckKind, EngineError, FailureClass, FatalCondition};
use crate::events::{Dispatch, EventDraft, EventKind};
use crate::executor::{Executors, TaskExecutor, TaskOutcome, TaskSpec};
use crate::jump::{JumpController, JumpDecision};
use crate::quality::QualityScorer;

/// What came back from one executor invocation.
type Invocation = Result<TaskOutcome, String>;

pub(crate) struct ScopeRunner {
    journal: Arc<Journal>,
    executors: Executors,
    timeouts: Arc<ExecutorSection>,
    scope: String,
    cancel: CancellationToken,
}

impl ScopeRunner {
    pub fn new(
        journal: Arc<Journal>,
        executors: Executors,
        timeouts: Arc<ExecutorSection>,
        scope: &str,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            journal,
            executors,
            timeouts,
            scope: scope.to_string(),
            cancel,
        }
    }

    /// Drive the scope to a final status.
    pub async fn run(self) -> Result<WorkflowStatus, EngineError> {
        let mut in_flight: JoinSet<(StageIndex, Invocation)> = JoinSet::new();
        let mut running: HashSet<StageIndex> = HashSet::new();

        info!(scope = %self.scope, "scope started");
        loop {
            if self.is_canceled().await {
                return self.cancel_scope(in_flight).await;
            }

            for (index, task) in self.dispatch(running.is_empty()).await? {
                running.insert(index);
                self.spawn(&mut in_flight, index, task);
            }

            if in_flight.is_empty() {
                return self.finish().await;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return self.cancel_scope(in_flight).await;
                }
                joined = in_flight.join_next() => {
                    let Some(joined) = joined else { continue };
                    let (index, invocation) = joined
                        .map_err(|e| EngineError::Other(anyhow::anyhow!("stage task failed: {}", e)))?;
                    running.remove(&index);
                    self.resolve(index, invocation).await?;
                }
            }
        }
    }

    async fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
            || self
                .journal
                .read(|s| s.status == WorkflowStatus::Canceled)
                .await
    }

    /// Record the starts of whatever may run now.
    ///
    /// A non-empty jump queue takes priority and runs one stage at a time:
    /// its front stage starts only once nothing else in the scope is running.
    async fn dispatch(&self, idle: bool) -> Result<Vec<(StageIndex, TaskSpec)>, EngineError> {
        let scope = self.scope.clone();
        self.journal
            .transact(|state| {
                let Some(scope_state) = state.scope(&scope) else {
                    return Err(EngineError::Other(anyhow::anyhow!("unknown scope '{}'", scope)));
                };
                if !state.accepts_dispatch()
                    || scope_state.fatal.is_some()
                    || scope_state.status.is_final()
                {
                    return Ok((Vec::new(), Vec::new()));
                }

                let picks: Vec<(StageIndex, Dispatch)> = match scope_state.pending.front() {
                    Some(front) if idle => vec![(state.stage_index(front)?, Dispatch::Jump)],
                    Some(_) => Vec::new(),
                    None => {
                        let scheduler = DagScheduler::new(
                            &state.graph,
                            state.definition.policy.tolerate_failed_continue,
                        );
                        scheduler
                            .ready_stages(&scope, |i| state.status_of(i))
                            .into_iter()
                            .map(|i| (i, Dispatch::Ready))
                            .collect()
                    }
                };

                let mut drafts = Vec::new();
                let mut tasks = Vec::new();
                for (index, dispatch) in picks {
                    let attempt = state.stages[index].attempts + 1;
                    let task = task_spec(state, index, attempt);
                    drafts.push(EventDraft::stage(
                        &task.stage_id,
                        EventKind::StageStarted { attempt, dispatch },
                    ));
                    tasks.push((index, task));
                }
                Ok((drafts, tasks))
            })
            .await
    }

    fn spawn(
        &self,
        in_flight: &mut JoinSet<(StageIndex, Invocation)>,
        index: StageIndex,
        task: TaskSpec,
    ) {
        let kind = task.kind();
        let executor = self.executors.for_kind(kind).clone();
        let budget = self.timeouts.timeout_for(kind);
        let token = self.cancel.child_token();
        debug!(stage = %task.stage_id, attempt = task.attempt, %kind, "dispatching");
        in_flight.spawn(async move { (index, invoke(executor, task, token, budget).await) });
    }

    /// Record the outcome of a finished stage and the decision it triggers.
    async fn resolve(&self, index: StageIndex, invocation: Invocation) -> Result<(), EngineError> {
        let canceled = self.cancel.is_cancelled();
        self.journal
            .transact(|state| Ok((resolve_outcome(state, index, invocation, canceled), ())))
            .await
    }

    /// Final status of the scope once nothing more can be dispatched.
    async fn finish(&self) -> Result<WorkflowStatus, EngineError> {
        let scope = self.scope.clone();
        let status = self
            .journal
            .transact(|state| {
                let Some(scope_state) = state.scope(&scope) else {
                    return Err(EngineError::Other(anyhow::anyhow!("unknown scope '{}'", scope)));
                };
                if scope_state.status.is_final() {
                    return Ok((Vec::new(), scope_state.status));
                }
                let (status, fatal) = scope_verdict(state, &scope);
                let draft = EventDraft::workflow(EventKind::ScopeFinished {
                    scope: scope.clone(),
                    status,
                    fatal,
                });
                Ok((vec![draft], status))
            })
            .await?;
        info!(scope = %self.scope, %status, "scope finished");
        Ok(status)
    }

    /// Let in-flight work stop at its checkpoint, then close the scope.
    async fn cancel_scope(
        &self,
        mut in_flight: JoinSet<(StageIndex, Invocation)>,
    ) -> Result<WorkflowStatus, EngineError> {
        self.cancel.cancel();
        while let Some(joined) = in_flight.join_next().await {
            let Ok((index, invocation)) = joined else {
                continue;
            };
            let succeeded = matches!(invocation, Ok(TaskOutcome::Success { .. }));
            self.journal
                .transact(|state| {
                    if !state.stages[index].status.is_running() {
                        return Ok((Vec::new(), ()));
                    }
                    let stage_id = &state.graph.stages()[index].id;
                    let kind = if succeeded {
                        EventKind::StageSucceeded { summary: None }
                    } else {
                        EventKind::StageCanceled
                    };
                    Ok((vec![EventDraft::stage(stage_id, kind)], ()))
                })
                .await?;
        }

        let scope = self.scope.clone();
        self.journal
            .transact(|state| {
                let Some(scope_state) = state.scope(&scope) else {
                    return Ok((Vec::new(), ()));
                };
                if scope_state.status.is_final() {
                    return Ok((Vec::new(), ()));
                }
                let mut drafts: Vec<EventDraft> = state
                    .graph
                    .stages()
                    .iter()
                    .zip(&state.stages)
                    .filter(|(def, st)| {
                        def.scope == scope
                            && matches!(st.status, StageStatus::NotStarted | StageStatus::Failed)
                    })
                    .map(|(def, _)| EventDraft::stage(&def.id, EventKind::StageCanceled))
                    .collect();
                drafts.push(EventDraft::workflow(EventKind::ScopeFinished {
                    scope: scope.clone(),
                    status: WorkflowStatus::Canceled,
                    fatal: None,
                }));
                Ok((drafts, ()))
            })
            .await?;
        warn!(scope = %self.scope, "scope canceled");
        Ok(WorkflowStatus::Canceled)
    }
}

/// Run one executor invocation under its time budget.
///
/// The executor runs on its own task so that a panic inside it is reported
/// as an executor failure instead of tearing down the scope.
async fn invoke(
    executor: Arc<dyn TaskExecutor>,
    task: TaskSpec,
    token: CancellationToken,
    budget: Duration,
) -> Invocation {
    let child = token.clone();
    let handle = tokio::spawn(async move { executor.execute(&task, child).await });
    let abort = handle.abort_handle();
    // Dropping this future (scope torn down) must stop the executor too.
    let _stop_on_drop = token.clone().drop_guard();
    match tokio::time::timeout(budget, handle).await {
        Ok(Ok(Ok(outcome))) => Ok(outcome),
        Ok(Ok(Err(e))) => Err(format!("{:#}", e)),
        Ok(Err(e)) => Err(format!("executor task failed: {}", e)),
        Err(_) => {
            token.cancel();
            abort.abort();
            Ok(TaskOutcome::timeout(budget))
        }
    }
}

fn task_spec(state: &WorkflowState, index: StageIndex, attempt: u32) -> TaskSpec {
    let def = &state.graph.stages()[index];
    let owned_files = def
        .module
        .as_deref()
        .and_then(|m| state.definition.module(m))
        .map(|m| m.owned_files().collect())
        .unwrap_or_default();
    let feedback = state
        .scope(&def.scope)
        .map(|s| s.failures.iter().cloned().collect())
        .unwrap_or_default();
    TaskSpec {
        workflow_id: state.definition.id.clone(),
        stage_id: def.id.clone(),
        role: def.role,
        module: def.module.clone(),
        owned_files,
        attempt,
        goal: state.definition.goal.clone(),
        feedback,
    }
}

/// Events recording one stage outcome and, on failure, the jump decision.
pub(crate) fn resolve_outcome(
    state: &WorkflowState,
    index: StageIndex,
    invocation: Invocation,
    canceled: bool,
) -> Vec<EventDraft> {
    let def = &state.graph.stages()[index];
    let stage = &state.stages[index];
    if !stage.status.is_running() {
        return Vec::new();
    }
    let stage_id = def.id.as_str();
    let mut drafts = Vec::new();

    let (failure, summary, stagnant) = match invocation {
        Ok(TaskOutcome::Canceled) if canceled => {
            return vec![EventDraft::stage(stage_id, EventKind::StageCanceled)];
        }
        Ok(TaskOutcome::Canceled) => (
            FailureClass::ExecutorError,
            "executor stopped without being canceled".to_string(),
            false,
        ),
        Ok(outcome @ (TaskOutcome::Success { .. } | TaskOutcome::Failure { .. }))
            if def.role == StageRole::Quality && outcome.pillars().is_some() =>
        {
            let policy = &state.definition.policy;
            let scorer = QualityScorer::new(policy.weights, policy.quality_threshold);
            let scores = outcome.pillars().cloned().unwrap_or_default();
            match scorer.score(&scores) {
                Ok(report) => {
                    let stagnant = stage
                        .last_report
                        .as_ref()
                        .is_some_and(|prev| report.is_stagnant_against(prev));
                    let passed = report.passed;
                    let feedback = report.feedback();
                    drafts.push(EventDraft::stage(
                        stage_id,
                        EventKind::QualityScored { report },
                    ));
                    if passed {
                        drafts.push(EventDraft::stage(
                            stage_id,
                            EventKind::StageSucceeded { summary: None },
                        ));
                        return drafts;
                    }
                    (FailureClass::QualityGateFailure, feedback, stagnant)
                }
                Err(e) => (FailureClass::ExecutorError, format!("invalid pillar scores: {}", e), false),
            }
        }
        Ok(TaskOutcome::Success { summary, .. }) => {
            return vec![EventDraft::stage(
                stage_id,
                EventKind::StageSucceeded { summary },
            )];
        }
        Ok(TaskOutcome::Failure { reason, checks, .. }) => {
            let failure = match def.role {
                StageRole::Setup => FailureClass::SetupError,
                StageRole::Validate | StageRole::IntegrationValidate => {
                    let mut failing: Vec<CheckKind> =
                        checks.iter().filter(|c| !c.passed).map(|c| c.check).collect();
                    failing.sort();
                    failing.dedup();
                    FailureClass::ValidateFailure { checks: failing }
                }
                StageRole::Repair | StageRole::IntegrationRepair => FailureClass::RepairFailure,
                StageRole::Quality => FailureClass::QualityGateFailure,
                StageRole::Review => FailureClass::ReviewFindings,
                StageRole::Mutation => FailureClass::MutantsSurvived,
                StageRole::Plan | StageRole::WriteTests | StageRole::Implement => {
                    FailureClass::AgentError
                }
            };
            (failure, reason, false)
        }
        Ok(TaskOutcome::Timeout { after_secs }) => {
            let failure = if def.role == StageRole::Setup {
                FailureClass::SetupError
            } else {
                FailureClass::Timeout
            };
            (failure, format!("timed out after {}s", after_secs), false)
        }
        Err(reason) => {
            let failure = if def.role == StageRole::Setup {
                FailureClass::SetupError
            } else {
                FailureClass::ExecutorError
            };
            (failure, reason, false)
        }
    };

    debug!(stage = stage_id, %failure, "stage failed");
    drafts.push(EventDraft::stage(
        stage_id,
        EventKind::StageFailed {
            failure: failure.clone(),
            summary: summary.clone(),
        },
    ));

    let scope = state.scope(&def.scope);
    if state.fatal.is_some() || scope.is_none_or(|s| s.fatal.is_some()) {
        return drafts;
    }

    let controller = JumpController::new(&state.definition.rules, state.definition.policy.limits);
    match controller.decide(stage_id, &failure, &stage.counters, stagnant) {
        JumpDecision::Jump {
            target,
            counter,
            value,
            resets,
            return_chain,
        } => {
            let scope_jumps = scope.map(|s| s.jumps).unwrap_or(0);
            let module_scope = scope_module(&def.scope).map(|_| def.scope.as_str());
            if let Some(breach) = controller.check_ceilings(state.total_jumps, scope_jumps, module_scope) {
                warn!(stage = stage_id, attempted = breach.attempted, ceiling = breach.ceiling, "jump ceiling exceeded");
                drafts.push(EventDraft::stage(
                    stage_id,
                    EventKind::JumpCeilingExceeded {
                        attempted: breach.attempted,
                        ceiling: breach.ceiling,
                        scope: breach.scope.clone(),
                    },
                ));
                drafts.push(EventDraft::stage(
                    stage_id,
                    EventKind::StageTerminal {
                        failure,
                        fatal: breach.fatal(),
                    },
                ));
                return drafts;
            }

            info!(stage = stage_id, %target, %counter, value, "jump");
            drafts.push(EventDraft::stage(
                stage_id,
                EventKind::CounterIncremented { counter, value },
            ));
            for reset in resets {
                drafts.push(EventDraft::stage(
                    stage_id,
                    EventKind::CounterReset { counter: reset },
                ));
            }
            drafts.push(EventDraft::stage(
                stage_id,
                EventKind::JumpTaken {
                    target,
                    counter,
                    return_chain,
                    total_jumps: state.total_jumps + 1,
                },
            ));
        }
        JumpDecision::Accept { warning } => {
            warn!(stage = stage_id, %warning, "failure accepted");
            drafts.push(EventDraft::stage(
                stage_id,
                EventKind::StageFailedContinue { warning },
            ));
        }
        JumpDecision::Proceed => {}
        JumpDecision::Terminal { failure } => {
            let fatal = JumpController::fatal_for(stage_id, &failure, &stage.counters, &summary);
            warn!(stage = stage_id, %fatal, "stage terminal");
            drafts.push(EventDraft::stage(
                stage_id,
                EventKind::StageTerminal { failure, fatal },
            ));
        }
    }
    drafts
}

/// Status a scope finishes with, given that nothing more can be dispatched.
pub(crate) fn scope_verdict(
    state: &WorkflowState,
    scope: &str,
) -> (WorkflowStatus, Option<FatalCondition>) {
    if let Some(fatal) = state
        .scope(scope)
        .and_then(|s| s.fatal.clone())
        .or_else(|| state.fatal.clone())
    {
        return (WorkflowStatus::Terminal, Some(fatal));
    }

    let stages: Vec<(&str, StageStatus)> = state
        .graph
        .stages()
        .iter()
        .zip(&state.stages)
        .filter(|(def, _)| def.scope == scope && !def.jump_only)
        .map(|(def, st)| (def.id.as_str(), st.status))
        .collect();

    let unfinished: Vec<String> = stages
        .iter()
        .filter(|(_, s)| !matches!(s, StageStatus::Succeeded | StageStatus::FailedContinue))
        .map(|(id, _)| id.to_string())
        .collect();
    let accepted = stages
        .iter()
        .any(|(_, s)| *s == StageStatus::FailedContinue);

    match (unfinished.is_empty(), accepted) {
        (true, false) => (WorkflowStatus::Succeeded, None),
        (true, true) => (WorkflowStatus::FailedContinue, None),
        // Stages left behind an accepted failure the policy does not tolerate.
        (false, true) => (WorkflowStatus::FailedContinue, None),
        (false, false) => (
            WorkflowStatus::Terminal,
            Some(FatalCondition::Stalled {
                scope: scope.to_string(),
                stages: unfinished,
            }),
        ),
    }
}

/// Stages of `scope` that never ran because an accepted failure blocked them.
pub(crate) fn skipped_stages(state: &WorkflowState, scope: &str) -> Vec<String> {
    state
        .graph
        .stages()
        .iter()
        .zip(&state.stages)
        .filter(|(def, st)| def.scope == scope && !def.jump_only && st.status == StageStatus::NotStarted)
        .map(|(def, _)| def.id.clone())
        .collect()
}
