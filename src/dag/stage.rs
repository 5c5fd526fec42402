//! Stage definitions: the static, declared shape of one schedulable unit.

use serde::{Deserialize, Serialize};

use crate::executor::TaskKind;

/// What a stage is for in the pipeline. Determines its task kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageRole {
    Plan,
    Setup,
    WriteTests,
    Implement,
    Validate,
    Repair,
    Quality,
    IntegrationValidate,
    IntegrationRepair,
    /// Mutation-testing gate, run after validation when enabled
    Mutation,
    /// Agent code review ahead of the quality gate, when enabled
    Review,
}

impl StageRole {
    pub fn kind(self) -> TaskKind {
        match self {
            StageRole::Plan
            | StageRole::WriteTests
            | StageRole::Implement
            | StageRole::Review => TaskKind::Agent,
            StageRole::Setup => TaskKind::Setup,
            StageRole::Validate | StageRole::IntegrationValidate | StageRole::Mutation => {
                TaskKind::Validate
            }
            StageRole::Repair | StageRole::IntegrationRepair => TaskKind::Repair,
            StageRole::Quality => TaskKind::Quality,
        }
    }

    /// Base stage id, suffixed with the module id inside module pipelines.
    pub fn base_id(self) -> &'static str {
        match self {
            StageRole::Plan => "plan",
            StageRole::Setup => "setup",
            StageRole::WriteTests => "write_tests",
            StageRole::Implement => "implement",
            StageRole::Validate => "validate",
            StageRole::Repair => "repair",
            StageRole::Quality => "quality",
            StageRole::IntegrationValidate => "integration_validate",
            StageRole::IntegrationRepair => "integration_repair",
            StageRole::Mutation => "mutation",
            StageRole::Review => "review",
        }
    }
}

impl std::fmt::Display for StageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.base_id())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDef {
    pub id: String,
    pub role: StageRole,
    /// Scheduling scope (`main`, `pre`, `module:<id>`, `integration`)
    pub scope: String,
    #[serde(default)]
    pub prerequisites: Vec<String>,
    #[serde(default)]
    pub module: Option<String>,
    /// Only ever dispatched by a jump, never by readiness
    #[serde(default)]
    pub jump_only: bool,
}

impl StageDef {
    pub fn new(id: impl Into<String>, role: StageRole, scope: &str) -> Self {
        Self {
            id: id.into(),
            role,
            scope: scope.to_string(),
            prerequisites: Vec::new(),
            module: None,
            jump_only: false,
        }
    }

    pub fn after(mut self, prerequisites: &[&str]) -> Self {
        self.prerequisites = prerequisites.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn in_module(mut self, module: &str) -> Self {
        self.module = Some(module.to_string());
        self
    }

    pub fn jump_only(mut self) -> Self {
        self.jump_only = true;
        self
    }

    pub fn kind(&self) -> TaskKind {
        self.role.kind()
    }
}
