//! Jump controller: failure-driven conditional transitions.
//!
//! Each stage that can fail declares a [`JumpRule`]: an ordered list of
//! edges, each guarded by a counter and its ceiling. When a stage fails, the
//! first edge whose counter is still below its ceiling is taken. When every
//! edge is exhausted the rule's [`Exhaustion`] policy applies.
//!
//! Two ceilings sit above every rule:
//! - `max_jumps` bounds the total number of jumps in the workflow
//! - `per_module_max_jumps` bounds the jumps inside one module pipeline
//!
//! Both are checked before a jump is taken and override any per-edge budget
//! still available.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::LimitsSection;
use crate::errors::{FailureClass, FatalCondition};

/// Per-stage retry counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterKind {
    /// Repair cycles for a validate/repair pair
    RepairAttempt,
    /// Fresh implementations after the repair budget ran out
    ReimplementationCount,
    /// Quality gate retries through the repair stage
    QualityRetry,
    /// Repairs requested by a failing code review
    ReviewRetry,
    /// In-place retries of an agent stage
    Retry,
}

impl std::fmt::Display for CounterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CounterKind::RepairAttempt => write!(f, "repair_attempt"),
            CounterKind::ReimplementationCount => write!(f, "reimplementation_count"),
            CounterKind::QualityRetry => write!(f, "quality_retry"),
            CounterKind::ReviewRetry => write!(f, "review_retry"),
            CounterKind::Retry => write!(f, "retry"),
        }
    }
}

/// Counter values held by one stage.
pub type Counters = BTreeMap<CounterKind, u32>;

pub fn counter(counters: &Counters, kind: CounterKind) -> u32 {
    counters.get(&kind).copied().unwrap_or(0)
}

/// One guarded transition out of a failed stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JumpEdge {
    /// Stage to dispatch next
    pub target: String,
    /// Counter on the failing stage incremented when this edge is taken
    pub counter: CounterKind,
    /// Edge is available while `counter < ceiling`
    pub ceiling: u32,
    /// Counters zeroed when this edge is taken
    #[serde(default)]
    pub resets: Vec<CounterKind>,
    /// Stages re-run, in order, after the target completes
    #[serde(default)]
    pub return_chain: Vec<String>,
}

/// What happens when every edge of a rule is exhausted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum Exhaustion {
    /// Leave the stage failed and let the pending work continue
    Proceed,
    /// Accept the failure with a warning (`FAILED_CONTINUE`)
    Accept,
    /// The stage goes `TERMINAL`, taking its scope with it
    Terminal { failure: FailureClass },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JumpRule {
    /// Stage whose failure this rule handles
    pub from: String,
    #[serde(default)]
    pub edges: Vec<JumpEdge>,
    pub on_exhausted: Exhaustion,
    /// Accept immediately when a retry produced the same result as before
    #[serde(default)]
    pub accept_on_stagnation: bool,
}

impl JumpRule {
    pub fn new(from: &str, on_exhausted: Exhaustion) -> Self {
        Self {
            from: from.to_string(),
            edges: Vec::new(),
            on_exhausted,
            accept_on_stagnation: false,
        }
    }

    pub fn edge(mut self, edge: JumpEdge) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn accepting_stagnation(mut self) -> Self {
        self.accept_on_stagnation = true;
        self
    }
}

impl JumpEdge {
    pub fn new(target: &str, counter: CounterKind, ceiling: u32) -> Self {
        Self {
            target: target.to_string(),
            counter,
            ceiling,
            resets: Vec::new(),
            return_chain: Vec::new(),
        }
    }

    pub fn resetting(mut self, counters: &[CounterKind]) -> Self {
        self.resets = counters.to_vec();
        self
    }

    pub fn returning_to(mut self, stages: &[&str]) -> Self {
        self.return_chain = stages.iter().map(|s| s.to_string()).collect();
        self
    }
}

/// Outcome of evaluating a failed stage against its rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JumpDecision {
    Jump {
        target: String,
        counter: CounterKind,
        /// Counter value after the increment
        value: u32,
        resets: Vec<CounterKind>,
        return_chain: Vec<String>,
    },
    Accept {
        warning: String,
    },
    Proceed,
    Terminal {
        failure: FailureClass,
    },
}

/// A jump that would breach a ceiling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CeilingBreach {
    /// The jump number that was refused
    pub attempted: u32,
    pub ceiling: u32,
    /// Set when the per-module ceiling was hit rather than the global one
    pub scope: Option<String>,
}

impl CeilingBreach {
    pub fn fatal(&self) -> FatalCondition {
        match &self.scope {
            Some(scope) => FatalCondition::BranchJumpCeilingExceeded {
                scope: scope.clone(),
                ceiling: self.ceiling,
            },
            None => FatalCondition::JumpCeilingExceeded {
                ceiling: self.ceiling,
            },
        }
    }
}

/// Evaluates jump rules against stage counters.
#[derive(Debug, Clone, Copy)]
pub struct JumpController<'a> {
    rules: &'a [JumpRule],
    limits: LimitsSection,
}

impl<'a> JumpController<'a> {
    pub fn new(rules: &'a [JumpRule], limits: LimitsSection) -> Self {
        Self { rules, limits }
    }

    pub fn rule_for(&self, stage_id: &str) -> Option<&'a JumpRule> {
        self.rules.iter().find(|r| r.from == stage_id)
    }

    /// Decide what follows a failure of `stage_id`.
    ///
    /// A stage without a rule has no recovery path and goes terminal.
    pub fn decide(
        &self,
        stage_id: &str,
        failure: &FailureClass,
        counters: &Counters,
        stagnant: bool,
    ) -> JumpDecision {
        let Some(rule) = self.rule_for(stage_id) else {
            return JumpDecision::Terminal {
                failure: failure.clone(),
            };
        };

        if stagnant && rule.accept_on_stagnation {
            return JumpDecision::Accept {
                warning: format!("'{}' accepted: result unchanged since last attempt", stage_id),
            };
        }

        for edge in &rule.edges {
            let current = counter(counters, edge.counter);
            if current < edge.ceiling {
                return JumpDecision::Jump {
                    target: edge.target.clone(),
                    counter: edge.counter,
                    value: current + 1,
                    resets: edge.resets.clone(),
                    return_chain: edge.return_chain.clone(),
                };
            }
        }

        match &rule.on_exhausted {
            Exhaustion::Proceed => JumpDecision::Proceed,
            Exhaustion::Accept if rule.edges.is_empty() => JumpDecision::Accept {
                warning: format!("'{}' accepted with a warning ({})", stage_id, failure),
            },
            Exhaustion::Accept => JumpDecision::Accept {
                warning: format!(
                    "'{}' accepted after exhausting its retries ({})",
                    stage_id, failure
                ),
            },
            Exhaustion::Terminal { failure } => JumpDecision::Terminal {
                failure: failure.clone(),
            },
        }
    }

    /// Check the global and per-module ceilings before jump `total_jumps + 1`.
    ///
    /// `module_scope` is the scope name when the jump happens inside a module
    /// pipeline; other scopes only answer to the global ceiling.
    pub fn check_ceilings(
        &self,
        total_jumps: u32,
        scope_jumps: u32,
        module_scope: Option<&str>,
    ) -> Option<CeilingBreach> {
        if total_jumps >= self.limits.max_jumps {
            return Some(CeilingBreach {
                attempted: total_jumps + 1,
                ceiling: self.limits.max_jumps,
                scope: None,
            });
        }
        match module_scope {
            Some(scope) if scope_jumps >= self.limits.per_module_max_jumps => Some(CeilingBreach {
                attempted: scope_jumps + 1,
                ceiling: self.limits.per_module_max_jumps,
                scope: Some(scope.to_string()),
            }),
            _ => None,
        }
    }

    /// The fatal condition a terminal decision attaches to its scope.
    pub fn fatal_for(
        stage_id: &str,
        failure: &FailureClass,
        counters: &Counters,
        reason: &str,
    ) -> FatalCondition {
        match failure {
            FailureClass::ReimplementExhausted => FatalCondition::ReimplementExhausted {
                stage: stage_id.to_string(),
                attempts: counter(counters, CounterKind::ReimplementationCount),
            },
            FailureClass::RetryExhausted => FatalCondition::RetryExhausted {
                stage: stage_id.to_string(),
                attempts: counter(counters, CounterKind::Retry),
            },
            FailureClass::SetupError => FatalCondition::SetupFailed {
                stage: stage_id.to_string(),
                reason: reason.to_string(),
            },
            _ => FatalCondition::StageFailed {
                stage: stage_id.to_string(),
                reason: reason.to_string(),
            },
        }
    }
}
