use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;

use crate::models::Capability;

/// Why the orchestrator is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunMode {
    /// A one-off task from a caller
    Task,
    /// Resolving gaps inside the build loop
    Build { iteration: u32 },
}

/// Output of one completed phase, threaded into later phases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    /// 1-based position in the decomposition
    pub index: usize,
    pub phase: String,
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_result: Option<Value>,
}

impl PhaseResult {
    pub fn new(index: usize, phase: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            index,
            phase: phase.into(),
            result: result.into(),
            structured_result: None,
        }
    }
}

/// Per-call context. Cheap to clone; the cancellation token is shared.
#[derive(Debug, Clone)]
pub struct OrchestrationContext {
    pub mode: RunMode,
    /// Caller-supplied data passed through to workers
    pub session: Map<String, Value>,
    /// Completed phases of the enclosing decomposition, in order
    pub previous_phases: Vec<PhaseResult>,
    /// `(index, count)` when running as a phase
    pub phase_position: Option<(usize, usize)>,
    cancel: CancellationToken,
}

impl Default for OrchestrationContext {
    fn default() -> Self {
        Self::new(RunMode::Task)
    }
}

impl OrchestrationContext {
    pub fn new(mode: RunMode) -> Self {
        Self {
            mode,
            session: Map::new(),
            previous_phases: Vec::new(),
            phase_position: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_session(mut self, session: Map<String, Value>) -> Self {
        self.session = session;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Context for phase `index` of `count`, seeing every phase completed so far.
    pub(crate) fn for_phase(&self, index: usize, count: usize, completed: &[PhaseResult]) -> Self {
        Self {
            mode: self.mode,
            session: self.session.clone(),
            previous_phases: completed.to_vec(),
            phase_position: Some((index, count)),
            cancel: self.cancel.clone(),
        }
    }

    /// JSON handed to a worker alongside its task.
    pub fn to_worker_context(
        &self,
        depth: u32,
        generated_files: &[String],
        capabilities: &[Capability],
    ) -> Value {
        let previous: Vec<Value> = self
            .previous_phases
            .iter()
            .map(|p| json!({ "phase": p.phase, "result": p.result }))
            .collect();

        let mut context = json!({
            "depth": depth,
            "mode": self.mode,
            "session": self.session,
            "previous_phases": previous,
            "generated_files": generated_files,
            "capabilities": capabilities,
        });
        if let Some((index, count)) = self.phase_position {
            context["phase_index"] = json!(index);
            context["phase_count"] = json!(count);
        }
        context
    }
}
