use serde::{Deserialize, Serialize};

/// State maintained across build-loop iterations
#[derive(Debug, Clone)]
pub struct LoopState {
    /// Completed iterations (incremented before each iteration starts)
    pub iteration: u32,
    /// Maximum allowed iterations
    pub max_iterations: u32,
    /// Capabilities that validated during this run, in order
    pub resolved: Vec<String>,
    /// Approval ids created by resolve attempts and not yet decided
    pub pending_approvals: Vec<String>,
}

impl LoopState {
    pub fn new(max_iterations: u32) -> Self {
        Self {
            iteration: 0,
            max_iterations,
            resolved: Vec::new(),
            pending_approvals: Vec::new(),
        }
    }

    /// Increment iteration counter
    pub fn next_iteration(&mut self) {
        self.iteration += 1;
    }

    pub fn record_resolved(&mut self, name: &str) {
        if !self.resolved.iter().any(|r| r == name) {
            self.resolved.push(name.to_string());
        }
    }

    pub fn record_pending<'a>(&mut self, ids: impl IntoIterator<Item = &'a str>) {
        for id in ids {
            if !self.pending_approvals.iter().any(|p| p == id) {
                self.pending_approvals.push(id.to_string());
            }
        }
    }
}

/// How the build loop ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoopStatus {
    /// No gaps remain
    Converged,
    /// Iteration cap reached with gaps remaining
    Incomplete,
    /// An unrecoverable error stopped the loop
    Failed { error: String },
    /// Cancellation observed between gaps
    Cancelled,
}

impl std::fmt::Display for LoopStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoopStatus::Converged => write!(f, "converged"),
            LoopStatus::Incomplete => write!(f, "incomplete"),
            LoopStatus::Failed { error } => write!(f, "failed: {}", error),
            LoopStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Result of `run_until_converged`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSummary {
    pub converged: bool,
    /// Iterations that ran (0 if nothing was ever missing)
    pub iterations: u32,
    #[serde(flatten)]
    pub status: LoopStatus,
    pub resolved: Vec<String>,
    /// Capabilities still unimplemented
    pub remaining: Vec<String>,
    pub pending_approvals: Vec<String>,
}

impl BuildSummary {
    pub fn new(state: &LoopState, status: LoopStatus, remaining: Vec<String>) -> Self {
        Self {
            converged: status == LoopStatus::Converged,
            iterations: state.iteration,
            status,
            resolved: state.resolved.clone(),
            remaining,
            pending_approvals: state.pending_approvals.clone(),
        }
    }
}
