//! Plans: the input a workflow is constructed from.
//!
//! A plan names the work, its development mode, and (optionally) the
//! modules it splits into. Plans can be written as JSON, TOML, or as
//! planner markdown carrying a `<!-- MODULES ... -->` JSON block.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::LazyLock;
use tracing::warn;

use crate::errors::PlanError;

static MODULES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<!--\s*MODULES\s*\n(.*?)\n\s*-->").unwrap());

/// Single-file modules named like this are usually re-export shims.
const FACADE_FILES: &[&str] = &[
    "__init__.py",
    "base.py",
    "index.py",
    "index.ts",
    "index.js",
    "mod.rs",
    "lib.rs",
    "main.go",
];

/// How tests relate to implementation in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevelopmentMode {
    /// Tests are written first by a dedicated stage
    #[default]
    Tdd,
    /// Tests first, implementation may extend them
    Hybrid,
    /// No dedicated test-writing stage
    Ddd,
}

impl DevelopmentMode {
    pub fn writes_tests_first(self) -> bool {
        matches!(self, DevelopmentMode::Tdd | DevelopmentMode::Hybrid)
    }
}

impl std::fmt::Display for DevelopmentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DevelopmentMode::Tdd => write!(f, "tdd"),
            DevelopmentMode::Hybrid => write!(f, "hybrid"),
            DevelopmentMode::Ddd => write!(f, "ddd"),
        }
    }
}

impl std::str::FromStr for DevelopmentMode {
    type Err = PlanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tdd" => Ok(DevelopmentMode::Tdd),
            "hybrid" => Ok(DevelopmentMode::Hybrid),
            "ddd" => Ok(DevelopmentMode::Ddd),
            _ => Err(PlanError::Parse(format!(
                "invalid development mode '{}'; expected tdd, hybrid or ddd",
                s
            ))),
        }
    }
}

/// One independently schedulable module and the files it exclusively owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSpec {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub test_files: Vec<String>,
    #[serde(default)]
    pub deps: Vec<String>,
}

impl ModuleSpec {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            files: Vec::new(),
            test_files: Vec::new(),
            deps: Vec::new(),
        }
    }

    pub fn with_files(mut self, files: &[&str]) -> Self {
        self.files = files.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_test_files(mut self, files: &[&str]) -> Self {
        self.test_files = files.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_deps(mut self, deps: &[&str]) -> Self {
        self.deps = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    /// Every path this module may write, normalised.
    pub fn owned_files(&self) -> impl Iterator<Item = String> + '_ {
        self.files
            .iter()
            .chain(self.test_files.iter())
            .map(|f| normalize_path(f))
    }

    fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

fn normalize_path(path: &str) -> String {
    path.trim().trim_start_matches("./").replace('\\', "/")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub name: String,
    /// Free-form description handed to agent stages
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub mode: DevelopmentMode,
    #[serde(default)]
    pub modules: Vec<ModuleSpec>,
}

impl Plan {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            goal: String::new(),
            mode: DevelopmentMode::default(),
            modules: Vec::new(),
        }
    }

    pub fn with_modules(mut self, modules: Vec<ModuleSpec>) -> Self {
        self.modules = modules;
        self
    }

    pub fn with_mode(mut self, mode: DevelopmentMode) -> Self {
        self.mode = mode;
        self
    }

    /// Load a plan, choosing the format from the file extension.
    pub fn load(path: &Path) -> Result<Self, PlanError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PlanError::Parse(format!("{}: {}", path.display(), e)))?;
        let fallback_name = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "workflow".to_string());

        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => {
                serde_json::from_str(&content).map_err(|e| PlanError::Parse(e.to_string()))
            }
            Some("toml") => toml::from_str(&content).map_err(|e| PlanError::Parse(e.to_string())),
            _ => Ok(Self::from_markdown(&content, &fallback_name)),
        }
    }

    /// Build a plan from planner markdown output.
    pub fn from_markdown(text: &str, fallback_name: &str) -> Self {
        let name = text
            .lines()
            .find_map(|l| l.strip_prefix("# "))
            .map(|h| h.trim().to_string())
            .unwrap_or_else(|| fallback_name.to_string());
        let modules = parse_modules(text);
        let modules = if modules.len() == 1 && modules[0].id == "main" {
            Vec::new()
        } else {
            modules
        };
        Self {
            name,
            goal: text.to_string(),
            mode: DevelopmentMode::default(),
            modules,
        }
    }

    /// Two or more modules run as parallel pipelines; otherwise serial.
    pub fn is_parallel(&self) -> bool {
        self.modules.len() >= 2
    }

    /// Check module ids, dependencies, ownership and cycles.
    ///
    /// Returns non-fatal warnings on success.
    pub fn validate(&self) -> Result<Vec<String>, PlanError> {
        let mut ids = HashSet::new();
        for module in &self.modules {
            if !ids.insert(module.id.as_str()) {
                return Err(PlanError::DuplicateModule(module.id.clone()));
            }
        }
        for module in &self.modules {
            for dep in &module.deps {
                if !ids.contains(dep.as_str()) {
                    return Err(PlanError::UnknownModuleDependency {
                        module: module.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        validate_ownership(&self.modules)?;
        detect_dependency_cycle(&self.modules)?;
        Ok(facade_warnings(&self.modules))
    }

    /// Group modules into dependency waves, preserving declaration order.
    pub fn module_waves(&self) -> Vec<Vec<String>> {
        module_waves(&self.modules)
    }

    pub fn module(&self, id: &str) -> Option<&ModuleSpec> {
        self.modules.iter().find(|m| m.id == id)
    }
}

/// Group modules into dependency waves, preserving declaration order.
///
/// Modules caught in a cycle never become ready and are left out.
pub fn module_waves(modules: &[ModuleSpec]) -> Vec<Vec<String>> {
    let mut done: HashSet<&str> = HashSet::new();
    let mut waves = Vec::new();
    loop {
        let wave: Vec<&str> = modules
            .iter()
            .filter(|m| !done.contains(m.id.as_str()))
            .filter(|m| m.deps.iter().all(|d| done.contains(d.as_str())))
            .map(|m| m.id.as_str())
            .collect();
        if wave.is_empty() {
            break;
        }
        done.extend(wave.iter().copied());
        waves.push(wave.into_iter().map(String::from).collect());
    }
    waves
}

/// Extract module definitions from planner output.
///
/// Falls back to a single `main` module when the block is absent, malformed,
/// or empty.
pub fn parse_modules(text: &str) -> Vec<ModuleSpec> {
    let fallback = || vec![ModuleSpec {
        name: "Main".to_string(),
        ..ModuleSpec::new("main")
    }];

    let Some(captures) = MODULES_RE.captures(text) else {
        return fallback();
    };
    let data: serde_json::Value = match serde_json::from_str(&captures[1]) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "Failed to parse MODULES JSON, falling back to serial");
            return fallback();
        }
    };
    let Some(items) = data.as_array() else {
        return fallback();
    };

    let strings = |v: Option<&serde_json::Value>| -> Vec<String> {
        v.and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|s| s.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    };

    let modules: Vec<ModuleSpec> = items
        .iter()
        .filter_map(|item| {
            let id = match item.get("id")? {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let name = item
                .get("name")
                .and_then(|n| n.as_str())
                .map(String::from)
                .unwrap_or_else(|| id.clone());
            Some(ModuleSpec {
                id,
                name,
                files: strings(item.get("files")),
                test_files: strings(item.get("test_files")),
                deps: strings(item.get("deps")),
            })
        })
        .collect();

    if modules.is_empty() { fallback() } else { modules }
}

fn validate_ownership(modules: &[ModuleSpec]) -> Result<(), PlanError> {
    let mut seen: HashMap<String, &str> = HashMap::new();
    let mut conflicts = Vec::new();
    for module in modules {
        let mut own = HashSet::new();
        for file in module.owned_files() {
            if !own.insert(file.clone()) {
                continue;
            }
            match seen.get(&file) {
                Some(owner) => conflicts.push(format!(
                    "'{}' claimed by both '{}' and '{}'",
                    file, owner, module.id
                )),
                None => {
                    seen.insert(file, &module.id);
                }
            }
        }
    }
    if conflicts.is_empty() {
        Ok(())
    } else {
        Err(PlanError::OwnershipConflict { conflicts })
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

fn detect_dependency_cycle(modules: &[ModuleSpec]) -> Result<(), PlanError> {
    let index: HashMap<&str, usize> = modules
        .iter()
        .enumerate()
        .map(|(i, m)| (m.id.as_str(), i))
        .collect();
    let deps: Vec<Vec<usize>> = modules
        .iter()
        .map(|m| {
            m.deps
                .iter()
                .filter_map(|d| index.get(d.as_str()).copied())
                .collect()
        })
        .collect();

    let mut color = vec![Color::White; modules.len()];
    for start in 0..modules.len() {
        if color[start] != Color::White {
            continue;
        }
        let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
        color[start] = Color::Gray;
        while let Some((node, idx)) = stack.pop() {
            if idx < deps[node].len() {
                stack.push((node, idx + 1));
                let child = deps[node][idx];
                match color[child] {
                    Color::Gray => {
                        let mut cycle: Vec<String> = stack
                            .iter()
                            .map(|(n, _)| n)
                            .skip_while(|n| **n != child)
                            .map(|n| modules[*n].id.clone())
                            .collect();
                        cycle.push(modules[child].id.clone());
                        return Err(PlanError::ModuleCycle { cycle });
                    }
                    Color::White => {
                        color[child] = Color::Gray;
                        stack.push((child, 0));
                    }
                    Color::Black => {}
                }
            } else {
                color[node] = Color::Black;
            }
        }
    }
    Ok(())
}

fn facade_warnings(modules: &[ModuleSpec]) -> Vec<String> {
    let mut warnings = Vec::new();
    for module in modules {
        if let [only] = module.files.as_slice() {
            let basename = Path::new(only)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if FACADE_FILES.contains(&basename.as_str()) {
                let message = format!(
                    "Module '{}' has only one file ({}) which is typically a facade; \
                     its implementation files may be missing",
                    module.display_name(),
                    only
                );
                warn!(module = %module.id, file = %only, "{}", message);
                warnings.push(message);
            }
        }
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn three_modules() -> Vec<ModuleSpec> {
        vec![
            ModuleSpec::new("a").with_files(&["src/a.rs"]),
            ModuleSpec::new("b").with_files(&["src/b.rs"]),
            ModuleSpec::new("c")
                .with_files(&["src/c.rs"])
                .with_deps(&["a"]),
        ]
    }

    #[test]
    fn test_parse_modules_block() {
        let text = r#"# Plan

Some prose.

<!-- MODULES
[
  {"id": "api", "name": "API", "files": ["src/api.rs"], "test_files": ["tests/api.rs"]},
  {"id": "db", "files": ["src/db.rs"], "deps": ["api"]}
]
-->
"#;
        let modules = parse_modules(text);
        assert_eq!(modules.len(), 2);
        assert_eq!(modules[0].name, "API");
        assert_eq!(modules[0].test_files, vec!["tests/api.rs"]);
        assert_eq!(modules[1].name, "db");
        assert_eq!(modules[1].deps, vec!["api"]);
    }

    #[test]
    fn test_parse_modules_fallbacks() {
        assert_eq!(parse_modules("no block here")[0].id, "main");
        assert_eq!(parse_modules("<!-- MODULES\nnot json\n-->")[0].id, "main");
        assert_eq!(parse_modules("<!-- MODULES\n[]\n-->")[0].id, "main");
        assert_eq!(parse_modules("<!-- MODULES\n[{\"x\": 1}]\n-->")[0].id, "main");
    }

    #[test]
    fn test_from_markdown_single_module_is_serial() {
        let plan = Plan::from_markdown("# Todo app\nbuild it", "fallback");
        assert_eq!(plan.name, "Todo app");
        assert!(plan.modules.is_empty());
        assert!(!plan.is_parallel());
    }

    #[test]
    fn test_ownership_conflict_rejected() {
        let plan = Plan::new("p").with_modules(vec![
            ModuleSpec::new("a").with_files(&["src/shared.rs", "src/a.rs"]),
            ModuleSpec::new("b").with_files(&["./src/shared.rs"]),
        ]);
        match plan.validate() {
            Err(PlanError::OwnershipConflict { conflicts }) => {
                assert_eq!(conflicts.len(), 1);
                assert!(conflicts[0].contains("claimed by both 'a' and 'b'"));
            }
            other => panic!("Expected OwnershipConflict, got {:?}", other),
        }
    }

    #[test]
    fn test_test_files_count_as_owned() {
        let plan = Plan::new("p").with_modules(vec![
            ModuleSpec::new("a").with_test_files(&["tests/common.rs"]),
            ModuleSpec::new("b").with_test_files(&["tests/common.rs"]),
        ]);
        assert!(matches!(
            plan.validate(),
            Err(PlanError::OwnershipConflict { .. })
        ));
    }

    #[test]
    fn test_dependency_cycle_rejected() {
        let plan = Plan::new("p").with_modules(vec![
            ModuleSpec::new("a").with_deps(&["c"]),
            ModuleSpec::new("b").with_deps(&["a"]),
            ModuleSpec::new("c").with_deps(&["b"]),
        ]);
        match plan.validate() {
            Err(PlanError::ModuleCycle { cycle }) => {
                assert_eq!(cycle.first(), cycle.last());
                assert!(cycle.len() >= 3);
            }
            other => panic!("Expected ModuleCycle, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_and_duplicate_modules() {
        let plan = Plan::new("p").with_modules(vec![ModuleSpec::new("a").with_deps(&["zzz"])]);
        assert!(matches!(
            plan.validate(),
            Err(PlanError::UnknownModuleDependency { .. })
        ));

        let plan = Plan::new("p").with_modules(vec![ModuleSpec::new("a"), ModuleSpec::new("a")]);
        assert!(matches!(plan.validate(), Err(PlanError::DuplicateModule(_))));
    }

    #[test]
    fn test_facade_warning() {
        let plan = Plan::new("p").with_modules(vec![
            ModuleSpec::new("core").with_files(&["src/core/mod.rs"]),
            ModuleSpec::new("cli").with_files(&["src/cli.rs"]),
        ]);
        let warnings = plan.validate().unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("src/core/mod.rs"));
    }

    #[test]
    fn test_module_waves_respect_deps() {
        let plan = Plan::new("p").with_modules(three_modules());
        assert_eq!(
            plan.module_waves(),
            vec![vec!["a".to_string(), "b".to_string()], vec!["c".to_string()]]
        );
    }

    #[test]
    fn test_load_json_and_toml() {
        let dir = tempdir().unwrap();
        let json_path = dir.path().join("plan.json");
        std::fs::write(
            &json_path,
            r#"{"name": "svc", "mode": "ddd", "modules": [{"id": "a"}, {"id": "b"}]}"#,
        )
        .unwrap();
        let plan = Plan::load(&json_path).unwrap();
        assert_eq!(plan.mode, DevelopmentMode::Ddd);
        assert!(plan.is_parallel());

        let toml_path = dir.path().join("plan.toml");
        std::fs::write(&toml_path, "name = \"svc\"\ngoal = \"ship it\"\n").unwrap();
        let plan = Plan::load(&toml_path).unwrap();
        assert_eq!(plan.goal, "ship it");
        assert_eq!(plan.mode, DevelopmentMode::Tdd);
    }
}
