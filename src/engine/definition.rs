//! Workflow construction: plan in, stage list and jump rules out.
//!
//! The definition is recorded in the workflow's first event so that a replay
//! never depends on the plan file or the config as they are later.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Policy;
use crate::dag::{DagBuilder, StageDef, StageGraph, StageRole};
use crate::errors::{FailureClass, PlanError};
use crate::jump::{CounterKind, Exhaustion, JumpEdge, JumpRule};
use crate::plan::{DevelopmentMode, ModuleSpec, Plan, module_waves};

/// Scope of a serial workflow.
pub const MAIN_SCOPE: &str = "main";
/// Plan and setup of a parallel workflow.
pub const PRE_SCOPE: &str = "pre";
/// Integration validate and quality gate of a parallel workflow.
pub const INTEGRATION_SCOPE: &str = "integration";

const MODULE_SCOPE_PREFIX: &str = "module:";

pub fn module_scope(module: &str) -> String {
    format!("{}{}", MODULE_SCOPE_PREFIX, module)
}

/// Module id of a `module:<id>` scope.
pub fn scope_module(scope: &str) -> Option<&str> {
    scope.strip_prefix(MODULE_SCOPE_PREFIX)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub goal: String,
    pub mode: DevelopmentMode,
    pub created_at: DateTime<Utc>,
    pub policy: Policy,
    #[serde(default)]
    pub modules: Vec<ModuleSpec>,
    pub stages: Vec<StageDef>,
    pub rules: Vec<JumpRule>,
}

impl WorkflowDefinition {
    /// Validate a plan and lay out its stages.
    ///
    /// Rejects overlapping file ownership, unknown or cyclic module
    /// dependencies, and a cyclic stage graph.
    pub fn from_plan(plan: &Plan, policy: Policy) -> Result<Self, PlanError> {
        plan.validate()?;

        let (stages, rules) = if plan.is_parallel() {
            parallel_layout(plan, &policy)
        } else {
            serial_layout(plan.mode, &policy)
        };

        let definition = Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: plan.name.clone(),
            goal: plan.goal.clone(),
            mode: plan.mode,
            created_at: Utc::now(),
            policy,
            modules: if plan.is_parallel() {
                plan.modules.clone()
            } else {
                Vec::new()
            },
            stages,
            rules,
        };
        definition.graph()?;
        Ok(definition)
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }

    pub fn graph(&self) -> Result<StageGraph, PlanError> {
        DagBuilder::new(self.stages.clone()).build()
    }

    pub fn is_parallel(&self) -> bool {
        !self.modules.is_empty()
    }

    pub fn module(&self, id: &str) -> Option<&ModuleSpec> {
        self.modules.iter().find(|m| m.id == id)
    }

    /// Module ids grouped into dependency waves.
    pub fn module_waves(&self) -> Vec<Vec<String>> {
        module_waves(&self.modules)
    }

    /// Every scope, in the order the coordinator runs them.
    pub fn scopes(&self) -> Vec<String> {
        if !self.is_parallel() {
            return vec![MAIN_SCOPE.to_string()];
        }
        let mut scopes = vec![PRE_SCOPE.to_string()];
        scopes.extend(self.module_waves().iter().flatten().map(|m| module_scope(m)));
        scopes.push(INTEGRATION_SCOPE.to_string());
        scopes
    }
}

fn agent_rule(stage: &str, policy: &Policy) -> JumpRule {
    JumpRule::new(
        stage,
        Exhaustion::Terminal {
            failure: FailureClass::RetryExhausted,
        },
    )
    .edge(JumpEdge::new(
        stage,
        CounterKind::Retry,
        policy.limits.max_agent_retries,
    ))
}

fn validate_rule(validate: &str, repair: &str, implement: &str, policy: &Policy) -> JumpRule {
    JumpRule::new(
        validate,
        Exhaustion::Terminal {
            failure: FailureClass::ReimplementExhausted,
        },
    )
    .edge(
        JumpEdge::new(
            repair,
            CounterKind::RepairAttempt,
            policy.limits.max_repair_attempts,
        )
        .returning_to(&[validate]),
    )
    .edge(
        JumpEdge::new(
            implement,
            CounterKind::ReimplementationCount,
            policy.limits.max_reimplementations,
        )
        .resetting(&[CounterKind::RepairAttempt])
        .returning_to(&[validate]),
    )
}

/// Append the enabled optional gates after `validate`. Returns the stage the
/// quality gate waits for.
fn optional_gates(
    validate: &str,
    repair: &str,
    scope: &str,
    policy: &Policy,
    stages: &mut Vec<StageDef>,
    rules: &mut Vec<JumpRule>,
) -> String {
    let mut last = validate.to_string();
    if policy.stages.mutation {
        stages.push(StageDef::new("mutation", StageRole::Mutation, scope).after(&[last.as_str()]));
        // Surviving mutants never block the pipeline.
        rules.push(JumpRule::new("mutation", Exhaustion::Accept));
        last = "mutation".to_string();
    }
    if policy.stages.review {
        stages.push(StageDef::new("review", StageRole::Review, scope).after(&[last.as_str()]));
        rules.push(
            JumpRule::new("review", Exhaustion::Accept).edge(
                JumpEdge::new(repair, CounterKind::ReviewRetry, policy.stages.review_repairs)
                    .returning_to(&[validate, "review"]),
            ),
        );
        last = "review".to_string();
    }
    last
}

fn quality_rule(repair: &str, validate: &str, policy: &Policy) -> JumpRule {
    JumpRule::new("quality", Exhaustion::Accept)
        .edge(
            JumpEdge::new(
                repair,
                CounterKind::QualityRetry,
                policy.limits.max_quality_retries,
            )
            .returning_to(&[validate, "quality"]),
        )
        .accepting_stagnation()
}

fn serial_layout(mode: DevelopmentMode, policy: &Policy) -> (Vec<StageDef>, Vec<JumpRule>) {
    let mut stages = vec![
        StageDef::new("plan", StageRole::Plan, MAIN_SCOPE),
        StageDef::new("setup", StageRole::Setup, MAIN_SCOPE).after(&["plan"]),
    ];
    let mut rules = vec![agent_rule("plan", policy)];

    let implement_after = if mode.writes_tests_first() {
        stages.push(StageDef::new("write_tests", StageRole::WriteTests, MAIN_SCOPE).after(&["setup"]));
        rules.push(agent_rule("write_tests", policy));
        "write_tests"
    } else {
        "setup"
    };

    stages.extend([
        StageDef::new("implement", StageRole::Implement, MAIN_SCOPE).after(&[implement_after]),
        StageDef::new("validate", StageRole::Validate, MAIN_SCOPE).after(&["implement"]),
        StageDef::new("repair", StageRole::Repair, MAIN_SCOPE).jump_only(),
    ]);
    rules.extend([
        agent_rule("implement", policy),
        validate_rule("validate", "repair", "implement", policy),
        JumpRule::new("repair", Exhaustion::Proceed),
    ]);
    let quality_after = optional_gates("validate", "repair", MAIN_SCOPE, policy, &mut stages, &mut rules);
    stages.push(StageDef::new("quality", StageRole::Quality, MAIN_SCOPE).after(&[quality_after.as_str()]));
    rules.push(quality_rule("repair", "validate", policy));

    (stages, rules)
}

fn parallel_layout(plan: &Plan, policy: &Policy) -> (Vec<StageDef>, Vec<JumpRule>) {
    let mut stages = vec![
        StageDef::new("plan", StageRole::Plan, PRE_SCOPE),
        StageDef::new("setup", StageRole::Setup, PRE_SCOPE).after(&["plan"]),
    ];
    let mut rules = vec![agent_rule("plan", policy)];
    let mut module_validates = Vec::new();

    for module in &plan.modules {
        let m = module.id.as_str();
        let scope = module_scope(m);
        let write_tests = format!("write_tests_{}", m);
        let implement = format!("implement_{}", m);
        let validate = format!("validate_{}", m);
        let repair = format!("repair_{}", m);

        // The first stage of a module waits for setup and for every module it
        // depends on to validate.
        let mut entry: Vec<String> = vec!["setup".to_string()];
        entry.extend(module.deps.iter().map(|d| format!("validate_{}", d)));
        let entry: Vec<&str> = entry.iter().map(String::as_str).collect();

        let implement_after: Vec<&str> = if plan.mode.writes_tests_first() {
            stages.push(
                StageDef::new(&write_tests, StageRole::WriteTests, &scope)
                    .after(&entry)
                    .in_module(m),
            );
            rules.push(agent_rule(&write_tests, policy));
            vec![write_tests.as_str()]
        } else {
            entry
        };

        stages.extend([
            StageDef::new(&implement, StageRole::Implement, &scope)
                .after(&implement_after)
                .in_module(m),
            StageDef::new(&validate, StageRole::Validate, &scope)
                .after(&[implement.as_str()])
                .in_module(m),
            StageDef::new(&repair, StageRole::Repair, &scope)
                .in_module(m)
                .jump_only(),
        ]);
        rules.extend([
            agent_rule(&implement, policy),
            validate_rule(&validate, &repair, &implement, policy),
            JumpRule::new(&repair, Exhaustion::Proceed),
        ]);
        module_validates.push(validate);
    }

    let validates: Vec<&str> = module_validates.iter().map(String::as_str).collect();
    stages.extend([
        StageDef::new(
            "integration_validate",
            StageRole::IntegrationValidate,
            INTEGRATION_SCOPE,
        )
        .after(&validates),
        StageDef::new(
            "integration_repair",
            StageRole::IntegrationRepair,
            INTEGRATION_SCOPE,
        )
        .jump_only(),
    ]);
    rules.extend([
        JumpRule::new("integration_validate", Exhaustion::Accept).edge(
            JumpEdge::new(
                "integration_repair",
                CounterKind::RepairAttempt,
                policy.limits.max_integration_repairs,
            )
            .returning_to(&["integration_validate"]),
        ),
        JumpRule::new("integration_repair", Exhaustion::Proceed),
    ]);
    let quality_after = optional_gates(
        "integration_validate",
        "integration_repair",
        INTEGRATION_SCOPE,
        policy,
        &mut stages,
        &mut rules,
    );
    stages.push(
        StageDef::new("quality", StageRole::Quality, INTEGRATION_SCOPE)
            .after(&[quality_after.as_str()]),
    );
    rules.push(quality_rule("integration_repair", "integration_validate", policy));

    (stages, rules)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(def: &WorkflowDefinition, scope: &str) -> Vec<String> {
        def.stages
            .iter()
            .filter(|s| s.scope == scope)
            .map(|s| s.id.clone())
            .collect()
    }

    #[test]
    fn test_serial_tdd_layout() {
        let def = WorkflowDefinition::from_plan(&Plan::new("serial"), Policy::default()).unwrap();
        assert!(!def.is_parallel());
        assert_eq!(
            ids(&def, MAIN_SCOPE),
            vec!["plan", "setup", "write_tests", "implement", "validate", "repair", "quality"]
        );
        assert_eq!(def.scopes(), vec!["main"]);
        assert!(def.rules.iter().all(|r| r.from != "setup"));
        assert!(def.graph().is_ok());
    }

    #[test]
    fn test_ddd_omits_write_tests() {
        let plan = Plan::new("ddd").with_mode(DevelopmentMode::Ddd);
        let def = WorkflowDefinition::from_plan(&plan, Policy::default()).unwrap();
        let implement = def.stages.iter().find(|s| s.id == "implement").unwrap();
        assert_eq!(implement.prerequisites, vec!["setup"]);
        assert!(def.stages.iter().all(|s| s.id != "write_tests"));
    }

    #[test]
    fn test_validate_rule_uses_policy_limits() {
        let mut policy = Policy::default();
        policy.limits.max_repair_attempts = 7;
        let def = WorkflowDefinition::from_plan(&Plan::new("p"), policy).unwrap();
        let rule = def.rules.iter().find(|r| r.from == "validate").unwrap();
        assert_eq!(rule.edges[0].target, "repair");
        assert_eq!(rule.edges[0].ceiling, 7);
        assert_eq!(rule.edges[1].target, "implement");
        assert_eq!(rule.edges[1].resets, vec![CounterKind::RepairAttempt]);
    }

    #[test]
    fn test_parallel_layout() {
        let plan = Plan::new("par").with_modules(vec![
            ModuleSpec::new("core").with_files(&["src/core.rs"]),
            ModuleSpec::new("api").with_files(&["src/api.rs"]).with_deps(&["core"]),
        ]);
        let def = WorkflowDefinition::from_plan(&plan, Policy::default()).unwrap();
        assert!(def.is_parallel());
        assert_eq!(
            def.scopes(),
            vec!["pre", "module:core", "module:api", "integration"]
        );
        assert_eq!(
            ids(&def, "module:api"),
            vec!["write_tests_api", "implement_api", "validate_api", "repair_api"]
        );

        let first_api = def.stages.iter().find(|s| s.id == "write_tests_api").unwrap();
        assert_eq!(first_api.prerequisites, vec!["setup", "validate_core"]);
        assert_eq!(first_api.module.as_deref(), Some("api"));

        let integration = def
            .stages
            .iter()
            .find(|s| s.id == "integration_validate")
            .unwrap();
        assert_eq!(integration.prerequisites, vec!["validate_core", "validate_api"]);

        let quality = def.rules.iter().find(|r| r.from == "quality").unwrap();
        assert_eq!(quality.edges[0].target, "integration_repair");
        assert_eq!(
            quality.edges[0].return_chain,
            vec!["integration_validate", "quality"]
        );
        assert_eq!(def.module_waves(), vec![vec!["core"], vec!["api"]]);
    }

    #[test]
    fn test_optional_gates_sit_before_quality() {
        let mut policy = Policy::default();
        policy.stages.mutation = true;
        policy.stages.review = true;
        let def = WorkflowDefinition::from_plan(&Plan::new("gates"), policy).unwrap();
        assert_eq!(
            ids(&def, MAIN_SCOPE),
            vec![
                "plan", "setup", "write_tests", "implement", "validate", "repair", "mutation",
                "review", "quality"
            ]
        );
        let quality = def.stages.iter().find(|s| s.id == "quality").unwrap();
        assert_eq!(quality.prerequisites, vec!["review"]);

        let review = def.rules.iter().find(|r| r.from == "review").unwrap();
        assert_eq!(review.edges[0].target, "repair");
        assert_eq!(review.edges[0].counter, CounterKind::ReviewRetry);
        assert_eq!(review.edges[0].return_chain, vec!["validate", "review"]);
        let mutation = def.rules.iter().find(|r| r.from == "mutation").unwrap();
        assert!(mutation.edges.is_empty());
        assert_eq!(mutation.on_exhausted, Exhaustion::Accept);
    }

    #[test]
    fn test_parallel_review_gate_uses_integration_repair() {
        let mut policy = Policy::default();
        policy.stages.review = true;
        let plan = Plan::new("par").with_modules(vec![
            ModuleSpec::new("a").with_files(&["src/a.rs"]),
            ModuleSpec::new("b").with_files(&["src/b.rs"]),
        ]);
        let def = WorkflowDefinition::from_plan(&plan, policy).unwrap();
        assert_eq!(
            ids(&def, INTEGRATION_SCOPE),
            vec!["integration_validate", "integration_repair", "review", "quality"]
        );
        let review = def.rules.iter().find(|r| r.from == "review").unwrap();
        assert_eq!(review.edges[0].target, "integration_repair");
        assert_eq!(
            review.edges[0].return_chain,
            vec!["integration_validate", "review"]
        );
    }

    #[test]
    fn test_overlapping_ownership_rejected() {
        let plan = Plan::new("bad").with_modules(vec![
            ModuleSpec::new("a").with_files(&["src/shared.rs"]),
            ModuleSpec::new("b").with_files(&["./src/shared.rs"]),
        ]);
        let err = WorkflowDefinition::from_plan(&plan, Policy::default()).unwrap_err();
        assert!(matches!(err, PlanError::OwnershipConflict { .. }));
    }

    #[test]
    fn test_scope_helpers() {
        assert_eq!(module_scope("db"), "module:db");
        assert_eq!(scope_module("module:db"), Some("db"));
        assert_eq!(scope_module("integration"), None);
    }

    #[test]
    fn test_definition_serialises() {
        let def = WorkflowDefinition::from_plan(&Plan::new("s"), Policy::default()).unwrap();
        let json = serde_json::to_string(&def).unwrap();
        let back: WorkflowDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(back, def);
    }
}
