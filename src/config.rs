//! Configuration for Anvil, read from `.anvil/anvil.toml`.
//!
//! Settings are layered file → environment → CLI. Every value has a default,
//! so a missing file is equivalent to an empty one.
//!
//! # Configuration File Format
//!
//! ```toml
//! [limits]
//! max_jumps = 50
//! per_module_max_jumps = 30
//! max_repair_attempts = 5
//! max_reimplementations = 3
//! max_quality_retries = 3
//! max_integration_repairs = 3
//! max_agent_retries = 2
//!
//! [quality]
//! threshold = 0.85
//!
//! [quality.weights]
//! tested = 0.30
//! readable = 0.15
//! understandable = 0.15
//! secured = 0.25
//! trackable = 0.15
//!
//! [scheduler]
//! tolerate_failed_continue = true
//! max_parallel_modules = 4
//!
//! [stages]
//! mutation = false
//! review = false
//! review_repairs = 1
//!
//! [watchdog]
//! enabled = true
//! interval_secs = 30
//! stall_after_secs = 1800
//! repair_loop_jumps = 3
//!
//! [executor]
//! shell = "sh"
//! agent_command = "my-agent --prompt \"$ANVIL_PROMPT\""
//! setup = ["npm ci"]
//! syntax = "cargo check"
//! lint = "cargo clippy -- -D warnings"
//! tests = "cargo test"
//! quality_command = "./scripts/quality.sh"
//! mutation_command = "cargo mutants --in-place"
//! agent_timeout_secs = 1800
//!
//! [bus]
//! capacity = 1024
//!
//! [server]
//! host = "127.0.0.1"
//! port = 7341
//!
//! [logging]
//! format = "pretty"
//! file = true
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::executor::TaskKind;
use crate::quality::{DEFAULT_THRESHOLD, PillarWeights};

/// Name of the per-project state directory.
pub const ANVIL_DIR: &str = ".anvil";
/// Name of the config file inside [`ANVIL_DIR`].
pub const CONFIG_FILE: &str = "anvil.toml";

/// Retry and jump ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsSection {
    /// Hard ceiling on jumps across the whole workflow
    #[serde(default = "default_max_jumps")]
    pub max_jumps: u32,
    /// Ceiling on jumps inside a single module pipeline
    #[serde(default = "default_per_module_max_jumps")]
    pub per_module_max_jumps: u32,
    /// Repair cycles per validate stage before reimplementing
    #[serde(default = "default_max_repair_attempts")]
    pub max_repair_attempts: u32,
    /// Reimplementations per validate stage before giving up
    #[serde(default = "default_max_reimplementations")]
    pub max_reimplementations: u32,
    /// Quality gate retries before accepting with a warning
    #[serde(default = "default_max_quality_retries")]
    pub max_quality_retries: u32,
    /// Integration repair cycles before accepting with a warning
    #[serde(default = "default_max_integration_repairs")]
    pub max_integration_repairs: u32,
    /// In-place retries of a failed agent stage
    #[serde(default = "default_max_agent_retries")]
    pub max_agent_retries: u32,
}

fn default_max_jumps() -> u32 {
    50
}

fn default_per_module_max_jumps() -> u32 {
    30
}

fn default_max_repair_attempts() -> u32 {
    5
}

fn default_max_reimplementations() -> u32 {
    3
}

fn default_max_quality_retries() -> u32 {
    3
}

fn default_max_integration_repairs() -> u32 {
    3
}

fn default_max_agent_retries() -> u32 {
    2
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_jumps: default_max_jumps(),
            per_module_max_jumps: default_per_module_max_jumps(),
            max_repair_attempts: default_max_repair_attempts(),
            max_reimplementations: default_max_reimplementations(),
            max_quality_retries: default_max_quality_retries(),
            max_integration_repairs: default_max_integration_repairs(),
            max_agent_retries: default_max_agent_retries(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualitySection {
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default)]
    pub weights: PillarWeights,
}

fn default_threshold() -> f64 {
    DEFAULT_THRESHOLD
}

impl Default for QualitySection {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            weights: PillarWeights::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerSection {
    /// Treat a FAILED_CONTINUE prerequisite as satisfied
    #[serde(default = "default_tolerate_failed_continue")]
    pub tolerate_failed_continue: bool,
    /// Upper bound on module pipelines running at once
    #[serde(default = "default_max_parallel_modules")]
    pub max_parallel_modules: usize,
}

fn default_tolerate_failed_continue() -> bool {
    true
}

fn default_max_parallel_modules() -> usize {
    4
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            tolerate_failed_continue: default_tolerate_failed_continue(),
            max_parallel_modules: default_max_parallel_modules(),
        }
    }
}

/// Optional stages between validation and the quality gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagesSection {
    /// Run the mutation-testing gate after validation
    #[serde(default)]
    pub mutation: bool,
    /// Run an agent code review before the quality gate
    #[serde(default)]
    pub review: bool,
    /// Repairs a failing review may request before it is accepted with a
    /// warning; 0 makes the review advisory
    #[serde(default = "default_review_repairs")]
    pub review_repairs: u32,
}

fn default_review_repairs() -> u32 {
    1
}

impl Default for StagesSection {
    fn default() -> Self {
        Self {
            mutation: false,
            review: false,
            review_repairs: default_review_repairs(),
        }
    }
}

/// Thresholds for the pipeline health monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchdogSection {
    #[serde(default = "default_watchdog_enabled")]
    pub enabled: bool,
    #[serde(default = "default_watchdog_interval")]
    pub interval_secs: u64,
    /// Flag a running workflow when no stage has finished for this long
    #[serde(default = "default_stall_after")]
    pub stall_after_secs: u64,
    /// Flag a scope once it has taken this many jumps
    #[serde(default = "default_repair_loop_jumps")]
    pub repair_loop_jumps: u32,
}

fn default_watchdog_enabled() -> bool {
    true
}

fn default_watchdog_interval() -> u64 {
    30
}

fn default_stall_after() -> u64 {
    1800
}

fn default_repair_loop_jumps() -> u32 {
    3
}

impl Default for WatchdogSection {
    fn default() -> Self {
        Self {
            enabled: default_watchdog_enabled(),
            interval_secs: default_watchdog_interval(),
            stall_after_secs: default_stall_after(),
            repair_loop_jumps: default_repair_loop_jumps(),
        }
    }
}

/// Shell commands and time budgets for the command executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorSection {
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Command that runs one agent turn; receives the prompt via env
    #[serde(default)]
    pub agent_command: Option<String>,
    #[serde(default)]
    pub setup: Vec<String>,
    #[serde(default)]
    pub syntax: Option<String>,
    #[serde(default)]
    pub lint: Option<String>,
    #[serde(default)]
    pub tests: Option<String>,
    /// Command printing pillar scores as JSON on stdout
    #[serde(default)]
    pub quality_command: Option<String>,
    /// Command that fails when mutants survive the test suite
    #[serde(default)]
    pub mutation_command: Option<String>,
    #[serde(default = "default_setup_timeout")]
    pub setup_timeout_secs: u64,
    #[serde(default = "default_agent_timeout")]
    pub agent_timeout_secs: u64,
    #[serde(default = "default_validate_timeout")]
    pub validate_timeout_secs: u64,
    #[serde(default = "default_quality_timeout")]
    pub quality_timeout_secs: u64,
}

fn default_shell() -> String {
    "sh".to_string()
}

fn default_setup_timeout() -> u64 {
    600
}

fn default_agent_timeout() -> u64 {
    1800
}

fn default_validate_timeout() -> u64 {
    600
}

fn default_quality_timeout() -> u64 {
    600
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            agent_command: None,
            setup: Vec::new(),
            syntax: None,
            lint: None,
            tests: None,
            quality_command: None,
            mutation_command: None,
            setup_timeout_secs: default_setup_timeout(),
            agent_timeout_secs: default_agent_timeout(),
            validate_timeout_secs: default_validate_timeout(),
            quality_timeout_secs: default_quality_timeout(),
        }
    }
}

impl ExecutorSection {
    /// Wall-clock budget for one invocation of the given task kind.
    pub fn timeout_for(&self, kind: TaskKind) -> Duration {
        let secs = match kind {
            TaskKind::Setup => self.setup_timeout_secs,
            TaskKind::Agent | TaskKind::Repair => self.agent_timeout_secs,
            TaskKind::Validate => self.validate_timeout_secs,
            TaskKind::Quality => self.quality_timeout_secs,
        };
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusSection {
    /// Events buffered per subscriber before the oldest are dropped
    #[serde(default = "default_bus_capacity")]
    pub capacity: usize,
}

fn default_bus_capacity() -> usize {
    1024
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            capacity: default_bus_capacity(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7341
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Log output format for stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub format: LogFormat,
    /// Also write a daily-rotated log file under `.anvil/logs`
    #[serde(default = "default_log_file")]
    pub file: bool,
}

fn default_log_file() -> bool {
    true
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            file: default_log_file(),
        }
    }
}

/// The complete anvil.toml structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnvilToml {
    #[serde(default)]
    pub limits: LimitsSection,
    #[serde(default)]
    pub quality: QualitySection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub stages: StagesSection,
    #[serde(default)]
    pub watchdog: WatchdogSection,
    #[serde(default)]
    pub executor: ExecutorSection,
    #[serde(default)]
    pub bus: BusSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl AnvilToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse anvil.toml")
    }

    /// Load `.anvil/anvil.toml`, or defaults if it does not exist.
    pub fn load_or_default(anvil_dir: &Path) -> Result<Self> {
        let config_path = anvil_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize anvil.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `ANVIL_*` environment overrides.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    fn apply_env_from(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<()> {
        fn parse<T: std::str::FromStr>(key: &str, raw: String) -> Result<T> {
            raw.trim()
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid value '{}' for {}", raw, key))
        }

        let limits = &mut self.limits;
        for (key, slot) in [
            ("ANVIL_MAX_JUMPS", &mut limits.max_jumps),
            ("ANVIL_PER_MODULE_MAX_JUMPS", &mut limits.per_module_max_jumps),
            ("ANVIL_MAX_REPAIR_ATTEMPTS", &mut limits.max_repair_attempts),
            ("ANVIL_MAX_REIMPLEMENTATIONS", &mut limits.max_reimplementations),
            ("ANVIL_MAX_QUALITY_RETRIES", &mut limits.max_quality_retries),
        ] {
            if let Some(raw) = get(key) {
                *slot = parse(key, raw)?;
            }
        }
        if let Some(raw) = get("ANVIL_QUALITY_THRESHOLD") {
            self.quality.threshold = parse("ANVIL_QUALITY_THRESHOLD", raw)?;
        }
        if let Some(raw) = get("ANVIL_STAGE_TIMEOUT_SECS") {
            let secs: u64 = parse("ANVIL_STAGE_TIMEOUT_SECS", raw)?;
            self.executor.setup_timeout_secs = secs;
            self.executor.agent_timeout_secs = secs;
            self.executor.validate_timeout_secs = secs;
            self.executor.quality_timeout_secs = secs;
        }
        if let Some(cmd) = get("ANVIL_AGENT_CMD") {
            self.executor.agent_command = Some(cmd);
        }
        if let Some(raw) = get("ANVIL_MUTATION_TESTING") {
            self.stages.mutation = parse("ANVIL_MUTATION_TESTING", raw)?;
        }
        if let Some(raw) = get("ANVIL_CODE_REVIEW") {
            self.stages.review = parse("ANVIL_CODE_REVIEW", raw)?;
        }
        Ok(())
    }

    /// Validate the configuration and return any problems found.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if let Err(e) = self.quality.weights.validate() {
            problems.push(e.to_string());
        }
        if !(0.0..=1.0).contains(&self.quality.threshold) {
            problems.push(format!(
                "quality.threshold {} must be within [0, 1]",
                self.quality.threshold
            ));
        }
        if self.limits.max_jumps < 2 {
            problems.push(format!(
                "limits.max_jumps must be at least 2, got {}",
                self.limits.max_jumps
            ));
        }
        if self.limits.per_module_max_jumps < 2 {
            problems.push(format!(
                "limits.per_module_max_jumps must be at least 2, got {}",
                self.limits.per_module_max_jumps
            ));
        }
        if self.limits.max_repair_attempts < 1 {
            problems.push("limits.max_repair_attempts must be at least 1".to_string());
        }
        if self.scheduler.max_parallel_modules == 0 {
            problems.push("scheduler.max_parallel_modules must be at least 1".to_string());
        }
        if self.bus.capacity == 0 {
            problems.push("bus.capacity must be at least 1".to_string());
        }
        if self.watchdog.enabled && self.watchdog.interval_secs == 0 {
            problems.push("watchdog.interval_secs must be at least 1".to_string());
        }

        problems
    }

    /// The retry/threshold policy frozen into each new workflow.
    pub fn policy(&self) -> Policy {
        Policy {
            limits: self.limits,
            quality_threshold: self.quality.threshold,
            weights: self.quality.weights,
            tolerate_failed_continue: self.scheduler.tolerate_failed_continue,
            stages: self.stages,
        }
    }
}

/// Policy recorded into a workflow at creation so replay never depends on
/// the config file as it is later.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub limits: LimitsSection,
    pub quality_threshold: f64,
    pub weights: PillarWeights,
    pub tolerate_failed_continue: bool,
    #[serde(default)]
    pub stages: StagesSection,
}

impl Default for Policy {
    fn default() -> Self {
        AnvilToml::default().policy()
    }
}

/// CLI-level overrides, applied last.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub max_jumps: Option<u32>,
    pub max_repair_attempts: Option<u32>,
    pub quality_threshold: Option<f64>,
    pub log_format: Option<LogFormat>,
}

/// Resolved configuration for one project directory.
#[derive(Debug, Clone)]
pub struct AnvilConfig {
    pub project_dir: PathBuf,
    pub anvil_dir: PathBuf,
    pub toml: AnvilToml,
}

impl AnvilConfig {
    /// Load config for a project directory (file → env).
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let anvil_dir = project_dir.join(ANVIL_DIR);
        let mut toml = AnvilToml::load_or_default(&anvil_dir)?;
        toml.apply_env()?;
        Ok(Self {
            project_dir,
            anvil_dir,
            toml,
        })
    }

    /// Load config and apply CLI overrides on top.
    pub fn with_overrides(project_dir: PathBuf, overrides: &CliOverrides) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.apply_overrides(overrides);
        Ok(config)
    }

    pub fn apply_overrides(&mut self, overrides: &CliOverrides) {
        if let Some(max) = overrides.max_jumps {
            self.toml.limits.max_jumps = max;
        }
        if let Some(max) = overrides.max_repair_attempts {
            self.toml.limits.max_repair_attempts = max;
        }
        if let Some(threshold) = overrides.quality_threshold {
            self.toml.quality.threshold = threshold;
        }
        if let Some(format) = overrides.log_format {
            self.toml.logging.format = format;
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.anvil_dir.join(CONFIG_FILE)
    }

    pub fn db_path(&self) -> PathBuf {
        self.anvil_dir.join("anvil.db")
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.anvil_dir.join("locks")
    }

    pub fn cancel_dir(&self) -> PathBuf {
        self.anvil_dir.join("cancel")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.anvil_dir.join("logs")
    }

    pub fn policy(&self) -> Policy {
        self.toml.policy()
    }

    /// Create `.anvil/` and its subdirectories.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.anvil_dir.clone(), self.lock_dir(), self.cancel_dir()] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}
