use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::capabilities::{CapabilitiesFile, CapabilitySpec};
use crate::approval::{ApprovalGate, ProtectionRules};
use crate::workers::{CommandSpec, DEFAULT_MIN_BYTES};

/// File names searched in the project root when no `--config` is given
pub const CONFIG_FILE_NAMES: &[&str] = &["build-forge.yaml", ".build-forge/config.yaml"];

/// Main CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Directory the build operates on; relative paths below resolve against it
    pub project_root: PathBuf,
    pub state: StateConfig,
    pub orchestrator: OrchestratorConfig,
    pub build_loop: BuildLoopConfig,
    pub approval: ApprovalConfig,
    pub worker: AgentConfig,
    pub decomposer: AgentConfig,
    /// Inline capability declarations (merged with `build_loop.capabilities_file`)
    pub capabilities: Vec<CapabilitySpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// State directory holding `state.json` and `approvals/`
    pub dir: PathBuf,
    /// Build steps kept before the oldest finished ones are dropped
    pub step_retention: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Deepest allowed recursion (top-level runs are depth 0)
    pub max_depth: u32,
    /// Upper bound on a single worker invocation
    pub worker_timeout_secs: u64,
    pub complexity: ComplexityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComplexityConfig {
    /// Structural signals needed before a task is decomposed
    pub min_signals: usize,
    /// Area keywords; each distinct one mentioned counts as a signal
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildLoopConfig {
    /// Maximum iterations before reporting the build incomplete
    pub max_iterations: u32,
    /// Minimum trimmed artifact length for the default validator
    pub min_content_bytes: usize,
    /// minijinja template overriding the bundled gap goal text
    pub goal_template: Option<PathBuf>,
    /// YAML file listing capabilities
    pub capabilities_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Glob patterns whose writes need a human decision
    pub protected: Vec<String>,
    /// Exemptions from `protected`
    pub allow: Vec<String>,
    /// Glob patterns that can never be written
    pub forbidden: Vec<String>,
}

/// An external agent process and the label its steps are recorded under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    #[serde(default)]
    pub command: Option<CommandSpec>,
}

/// Hard limits handed to the orchestrator guardrails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailsConfig {
    pub max_depth: u32,
    pub max_iterations: u32,
    pub worker_timeout_secs: u64,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from("."),
            state: StateConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            build_loop: BuildLoopConfig::default(),
            approval: ApprovalConfig::default(),
            worker: AgentConfig {
                name: "builder".to_string(),
                command: None,
            },
            decomposer: AgentConfig {
                name: "planner".to_string(),
                command: None,
            },
            capabilities: Vec::new(),
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".build-forge"),
            step_retention: crate::store::DEFAULT_STEP_RETENTION,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_depth: 2,
            worker_timeout_secs: 600,
            complexity: ComplexityConfig::default(),
        }
    }
}

impl Default for ComplexityConfig {
    fn default() -> Self {
        Self {
            min_signals: 3,
            keywords: [
                "agents", "tools", "core", "api", "frontend", "backend", "memory", "tests",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

impl Default for BuildLoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            min_content_bytes: DEFAULT_MIN_BYTES,
            goal_template: None,
            capabilities_file: None,
        }
    }
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            protected: vec![
                "build-forge.yaml".to_string(),
                ".build-forge/**".to_string(),
                "Cargo.toml".to_string(),
            ],
            allow: Vec::new(),
            forbidden: vec![
                ".env".to_string(),
                ".env.local".to_string(),
                ".git/**".to_string(),
            ],
        }
    }
}

impl CliConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: CliConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration, falling back to defaults if file doesn't exist
    pub fn load_or_default(path: Option<&PathBuf>) -> anyhow::Result<Self> {
        match path {
            Some(p) if p.exists() => Self::from_file(p),
            Some(p) => anyhow::bail!("Config file not found: {}", p.display()),
            None => match Self::discover() {
                Some(found) => {
                    debug!("Using config {}", found.display());
                    Self::from_file(&found)
                }
                None => Ok(Self::default()),
            },
        }
    }

    /// Load configuration and apply `BUILD_FORGE_*` environment overrides
    pub fn load_with_env(path: Option<&PathBuf>) -> anyhow::Result<Self> {
        Ok(Self::load_or_default(path)?.apply_env_overrides())
    }

    /// First config file found in the working directory, then the user
    /// config directory.
    fn discover() -> Option<PathBuf> {
        let local = CONFIG_FILE_NAMES.iter().map(PathBuf::from);
        let user = dirs::config_dir().map(|dir| dir.join("build-forge").join("config.yaml"));
        local.chain(user).find(|p| p.is_file())
    }

    /// Override selected settings from the environment.
    ///
    /// - `BUILD_FORGE_PROJECT_ROOT`
    /// - `BUILD_FORGE_STATE_DIR`
    /// - `BUILD_FORGE_MAX_DEPTH`
    /// - `BUILD_FORGE_MAX_ITERATIONS`
    /// - `BUILD_FORGE_WORKER_TIMEOUT_SECS`
    /// - `BUILD_FORGE_WORKER_COMMAND` (program run through `sh -c`)
    /// - `BUILD_FORGE_DECOMPOSER_COMMAND`
    pub fn apply_env_overrides(self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(root) = var("BUILD_FORGE_PROJECT_ROOT") {
            self.project_root = PathBuf::from(root);
        }
        if let Some(dir) = var("BUILD_FORGE_STATE_DIR") {
            self.state.dir = PathBuf::from(dir);
        }
        if let Some(depth) = var("BUILD_FORGE_MAX_DEPTH").and_then(|v| v.parse().ok()) {
            self.orchestrator.max_depth = depth;
        }
        if let Some(max) = var("BUILD_FORGE_MAX_ITERATIONS").and_then(|v| v.parse().ok()) {
            self.build_loop.max_iterations = max;
        }
        if let Some(secs) = var("BUILD_FORGE_WORKER_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.orchestrator.worker_timeout_secs = secs;
        }
        if let Some(cmd) = var("BUILD_FORGE_WORKER_COMMAND") {
            self.worker.command = Some(shell_command(cmd));
        }
        if let Some(cmd) = var("BUILD_FORGE_DECOMPOSER_COMMAND") {
            self.decomposer.command = Some(shell_command(cmd));
        }
        self
    }

    pub fn guardrails(&self) -> GuardrailsConfig {
        GuardrailsConfig {
            max_depth: self.orchestrator.max_depth,
            max_iterations: self.build_loop.max_iterations,
            worker_timeout_secs: self.orchestrator.worker_timeout_secs,
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.project_root.join(&self.state.dir)
    }

    /// Snapshot file of the state store
    pub fn state_path(&self) -> PathBuf {
        self.state_dir().join("state.json")
    }

    /// Directory of approval records
    pub fn approvals_dir(&self) -> PathBuf {
        self.state_dir().join("approvals")
    }

    pub fn protection_rules(&self) -> anyhow::Result<ProtectionRules> {
        ProtectionRules::new(
            &self.approval.protected,
            &self.approval.allow,
            &self.approval.forbidden,
        )
        .context("Invalid approval path pattern")
    }

    /// Approval gate rooted at the project, with records under the state dir
    pub fn approval_gate(&self) -> anyhow::Result<ApprovalGate> {
        Ok(ApprovalGate::new(
            &self.project_root,
            self.approvals_dir(),
            self.protection_rules()?,
        ))
    }

    /// Inline capabilities followed by those from `build_loop.capabilities_file`.
    /// Later declarations of the same name replace earlier ones.
    pub fn load_capabilities(&self) -> anyhow::Result<Vec<CapabilitySpec>> {
        let mut specs = self.capabilities.clone();
        if let Some(file) = &self.build_loop.capabilities_file {
            let path = self.project_root.join(file);
            specs.extend(CapabilitiesFile::from_file(&path)?.capabilities);
        }

        let mut merged: Vec<CapabilitySpec> = Vec::with_capacity(specs.len());
        for spec in specs {
            match merged.iter_mut().find(|s| s.name == spec.name) {
                Some(existing) => *existing = spec,
                None => merged.push(spec),
            }
        }
        Ok(merged)
    }
}

fn shell_command(cmd: String) -> CommandSpec {
    CommandSpec::new("sh").with_args(["-c".to_string(), cmd])
}
