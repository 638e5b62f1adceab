//! Subprocess-backed worker and decomposer.
//!
//! The configured program receives `{"task": ..., "context": ...}` on stdin
//! and `BUILD_FORGE_MODE` (`invoke` or `decompose`) in its environment.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{Decomposer, Worker, WorkerError, WorkerOutput, extract_json_block};

/// Exit code a command uses to report a transient failure (sysexits EX_TEMPFAIL).
pub const EX_TEMPFAIL: i32 = 75;

/// How to launch an external agent process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Defaults to the current directory
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Run once and return stdout. Dropping the future kills the child.
    async fn run(&self, mode: &str, payload: &Value) -> Result<String, WorkerError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env("BUILD_FORGE_MODE", mode)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        debug!("Spawning {} ({})", self.program, mode);
        let mut child = cmd
            .spawn()
            .map_err(|e| WorkerError::Fatal(format!("failed to spawn {}: {}", self.program, e)))?;

        let input = serde_json::to_vec(payload)
            .map_err(|e| WorkerError::Fatal(format!("failed to encode request: {}", e)))?;
        if let Some(mut stdin) = child.stdin.take() {
            // Feed stdin concurrently so a chatty child cannot deadlock on a full pipe.
            tokio::spawn(async move {
                let _ = stdin.write_all(&input).await;
                let _ = stdin.shutdown().await;
            });
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| WorkerError::Fatal(format!("failed to wait for {}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = format!("{} exited with {}: {}", self.program, output.status, stderr);
            return Err(match output.status.code() {
                Some(EX_TEMPFAIL) => WorkerError::Transient(message),
                _ => WorkerError::Fatal(message),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Worker that delegates every task to an external command.
pub struct CommandWorker {
    name: String,
    spec: CommandSpec,
}

impl CommandWorker {
    pub fn new(name: impl Into<String>, spec: CommandSpec) -> Self {
        Self {
            name: name.into(),
            spec,
        }
    }
}

#[async_trait]
impl Worker for CommandWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, task: &str, context: &Value) -> Result<WorkerOutput, WorkerError> {
        let stdout = self
            .spec
            .run("invoke", &json!({ "task": task, "context": context }))
            .await?;
        Ok(parse_worker_output(&stdout))
    }
}

/// A JSON object with an `output` field is taken as-is; anything else is text.
fn parse_worker_output(stdout: &str) -> WorkerOutput {
    let trimmed = stdout.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed)
        && value.get("output").is_some_and(Value::is_string)
        && let Ok(parsed) = serde_json::from_value::<WorkerOutput>(value)
    {
        return parsed;
    }
    WorkerOutput::text(trimmed)
}

/// Decomposer that asks an external command for the phase list.
pub struct CommandDecomposer {
    name: String,
    spec: CommandSpec,
}

impl CommandDecomposer {
    pub fn new(name: impl Into<String>, spec: CommandSpec) -> Self {
        Self {
            name: name.into(),
            spec,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PhaseList {
    Plain(Vec<String>),
    Wrapped { phases: Vec<String> },
}

impl PhaseList {
    fn into_phases(self) -> Vec<String> {
        let phases = match self {
            PhaseList::Plain(phases) | PhaseList::Wrapped { phases } => phases,
        };
        phases
            .into_iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect()
    }
}

/// Parse a phase list from raw stdout or from a JSON block inside it.
fn parse_phases(stdout: &str) -> Result<Vec<String>, WorkerError> {
    let trimmed = stdout.trim();
    if let Ok(list) = serde_json::from_str::<PhaseList>(trimmed) {
        return Ok(list.into_phases());
    }

    let block = extract_json_block(trimmed)
        .ok_or_else(|| WorkerError::Fatal("decomposer returned no JSON phase list".to_string()))?;
    serde_json::from_str::<PhaseList>(block)
        .map(PhaseList::into_phases)
        .map_err(|e| WorkerError::Fatal(format!("invalid phase list: {}", e)))
}

#[async_trait]
impl Decomposer for CommandDecomposer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn decompose(&self, task: &str) -> Result<Vec<String>, WorkerError> {
        let stdout = self.spec.run("decompose", &json!({ "task": task })).await?;
        parse_phases(&stdout)
    }
}
