//! Stage state machine and readiness computation.
//!
//! The scheduler never mutates status itself: it answers "which stages may
//! start now" from a status lookup, and "is this transition legal".

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::dag::builder::{StageGraph, StageIndex};

/// Status of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    #[default]
    NotStarted,
    Running,
    Succeeded,
    Failed,
    FailedContinue,
    Terminal,
    Canceled,
}

impl StageStatus {
    /// `TERMINAL` and `CANCELED` never change again.
    pub fn is_absorbing(self) -> bool {
        matches!(self, Self::Terminal | Self::Canceled)
    }

    pub fn is_running(self) -> bool {
        matches!(self, Self::Running)
    }

    /// Whether `self -> to` is an allowed transition.
    ///
    /// `Running -> NotStarted` is the recovery reset. Re-dispatch out of
    /// `Succeeded`, `Failed` or `FailedContinue` is only taken by jumps.
    pub fn can_transition(self, to: StageStatus) -> bool {
        use StageStatus::*;
        match (self, to) {
            (NotStarted, Running) => true,
            (Running, Succeeded | Failed | FailedContinue | NotStarted) => true,
            (Failed, Running | Terminal | FailedContinue) => true,
            (Succeeded | FailedContinue, Running) => true,
            (NotStarted | Running | Failed, Canceled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotStarted => "NOT_STARTED",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::FailedContinue => "FAILED_CONTINUE",
            Self::Terminal => "TERMINAL",
            Self::Canceled => "CANCELED",
        };
        f.write_str(s)
    }
}

/// Readiness over a built stage graph.
#[derive(Debug, Clone, Copy)]
pub struct DagScheduler<'g> {
    graph: &'g StageGraph,
    tolerate_failed_continue: bool,
}

impl<'g> DagScheduler<'g> {
    pub fn new(graph: &'g StageGraph, tolerate_failed_continue: bool) -> Self {
        Self {
            graph,
            tolerate_failed_continue,
        }
    }

    /// Whether a prerequisite in this status lets dependents start.
    pub fn satisfies(&self, status: StageStatus) -> bool {
        status == StageStatus::Succeeded
            || (self.tolerate_failed_continue && status == StageStatus::FailedContinue)
    }

    pub fn prerequisites_met(
        &self,
        index: StageIndex,
        status_of: &impl Fn(StageIndex) -> StageStatus,
    ) -> bool {
        self.graph
            .dependencies_satisfied(index, |dep| self.satisfies(status_of(dep)))
    }

    /// `NOT_STARTED` stages in `scope` whose prerequisites are met, in
    /// declaration order. Jump-only stages are never ready.
    pub fn ready_stages(
        &self,
        scope: &str,
        status_of: impl Fn(StageIndex) -> StageStatus,
    ) -> Vec<StageIndex> {
        self.graph
            .stages()
            .iter()
            .enumerate()
            .filter(|(_, stage)| stage.scope == scope && !stage.jump_only)
            .filter(|(i, _)| status_of(*i) == StageStatus::NotStarted)
            .filter(|(i, _)| self.prerequisites_met(*i, &status_of))
            .map(|(i, _)| i)
            .collect()
    }

    /// Static execution waves over the whole graph, ignoring jump-only stages.
    pub fn compute_waves(&self) -> Vec<Vec<String>> {
        let mut waves = Vec::new();
        let mut placed: HashSet<StageIndex> = HashSet::new();

        loop {
            let ready: Vec<StageIndex> = self
                .graph
                .stages()
                .iter()
                .enumerate()
                .filter(|(i, stage)| !stage.jump_only && !placed.contains(i))
                .filter(|(i, _)| self.graph.dependencies_satisfied(*i, |d| placed.contains(&d)))
                .map(|(i, _)| i)
                .collect();

            if ready.is_empty() {
                break;
            }
            placed.extend(ready.iter().copied());
            waves.push(
                ready
                    .into_iter()
                    .filter_map(|i| self.graph.get(i).map(|s| s.id.clone()))
                    .collect(),
            );
        }

        waves
    }
}
