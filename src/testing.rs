//! Scripted executor for driving the engine in tests.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::executor::{TaskExecutor, TaskOutcome, TaskSpec};

#[derive(Default)]
struct Script {
    queued: HashMap<String, VecDeque<TaskOutcome>>,
    always: HashMap<String, TaskOutcome>,
    errors: HashSet<String>,
    hang: HashSet<String>,
    delay: Duration,
    calls: Vec<TaskSpec>,
}

/// Executor whose outcomes are set per stage id.
///
/// A stage answers from its queued outcomes first, then its `always`
/// outcome, then plain success. Clones share one script.
#[derive(Clone, Default)]
pub struct ScriptedExecutor {
    inner: Arc<Mutex<Script>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Outcomes for the next invocations of `stage`, in order.
    pub fn script(self, stage: &str, outcomes: Vec<TaskOutcome>) -> Self {
        self.with(|s| {
            s.queued
                .entry(stage.to_string())
                .or_default()
                .extend(outcomes)
        });
        self
    }

    /// Outcome for every invocation of `stage` once its queue is empty.
    pub fn always(self, stage: &str, outcome: TaskOutcome) -> Self {
        self.with(|s| {
            s.always.insert(stage.to_string(), outcome);
        });
        self
    }

    /// `stage` returns an executor error instead of an outcome.
    pub fn erroring(self, stage: &str) -> Self {
        self.with(|s| {
            s.errors.insert(stage.to_string());
        });
        self
    }

    /// `stage` blocks until canceled.
    pub fn hang(self, stage: &str) -> Self {
        self.with(|s| {
            s.hang.insert(stage.to_string());
        });
        self
    }

    /// Wait this long inside every invocation.
    pub fn delay(self, delay: Duration) -> Self {
        self.with(|s| s.delay = delay);
        self
    }

    /// Every invocation so far, in start order.
    pub fn calls(&self) -> Vec<TaskSpec> {
        self.with(|s| s.calls.clone())
    }

    /// Stage ids in invocation order.
    pub fn call_order(&self) -> Vec<String> {
        self.with(|s| s.calls.iter().map(|c| c.stage_id.clone()).collect())
    }

    pub fn count(&self, stage: &str) -> usize {
        self.with(|s| s.calls.iter().filter(|c| c.stage_id == stage).count())
    }

    /// Poll until `stage` has been invoked at least `times` times.
    pub async fn wait_for(&self, stage: &str, times: usize) {
        while self.count(stage) < times {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Script) -> R) -> R {
        let mut script = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut script)
    }
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        task: &TaskSpec,
        cancel: CancellationToken,
    ) -> anyhow::Result<TaskOutcome> {
        let (hang, error, delay) = self.with(|s| {
            s.calls.push(task.clone());
            (
                s.hang.contains(&task.stage_id),
                s.errors.contains(&task.stage_id),
                s.delay,
            )
        });

        if hang {
            cancel.cancelled().await;
            return Ok(TaskOutcome::Canceled);
        }
        if !delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(TaskOutcome::Canceled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if error {
            anyhow::bail!("scripted executor error for '{}'", task.stage_id);
        }

        Ok(self.with(|s| {
            s.queued
                .get_mut(&task.stage_id)
                .and_then(VecDeque::pop_front)
                .or_else(|| s.always.get(&task.stage_id).cloned())
                .unwrap_or_else(TaskOutcome::success)
        }))
    }
}
