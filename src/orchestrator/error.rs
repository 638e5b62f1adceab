use serde_json::{Value, json};
use thiserror::Error;

use crate::approval::GateError;
use crate::store::StoreError;
use crate::workers::WorkerError;

use super::context::PhaseResult;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Recursion limit exceeded: depth {depth} > max {limit}")]
    RecursionLimitExceeded { depth: u32, limit: u32 },

    #[error("Phase {index} ({phase}) failed after {} completed phase(s): {reason}", .completed.len())]
    PhaseExecutionFailed {
        /// 1-based position of the failing phase
        index: usize,
        phase: String,
        reason: String,
        /// Results of the phases that finished before the failure
        completed: Vec<PhaseResult>,
    },

    #[error("Worker failed on '{task}': {source}")]
    Worker {
        task: String,
        #[source]
        source: WorkerError,
    },

    #[error("Decomposition failed: {0}")]
    Decomposition(#[source] WorkerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Gate(#[from] GateError),
}

impl OrchestratorError {
    /// Fatal errors stop the build loop; the rest leave the gap open for
    /// the next iteration.
    pub fn is_fatal(&self) -> bool {
        match self {
            OrchestratorError::RecursionLimitExceeded { .. } | OrchestratorError::Store(_) => true,
            OrchestratorError::Gate(e) => !e.is_client_error(),
            OrchestratorError::PhaseExecutionFailed { .. }
            | OrchestratorError::Worker { .. }
            | OrchestratorError::Decomposition(_) => false,
        }
    }

    /// Phases that completed before a phase failure.
    pub fn partial_results(&self) -> &[PhaseResult] {
        match self {
            OrchestratorError::PhaseExecutionFailed { completed, .. } => completed,
            _ => &[],
        }
    }

    /// The failed phase and every result completed before it, for callers
    /// that report partial work. `None` for errors other than a phase failure.
    pub fn partial_report(&self) -> Option<Value> {
        match self {
            OrchestratorError::PhaseExecutionFailed {
                index,
                phase,
                reason,
                completed,
            } => Some(json!({
                "failed_phase": { "index": index, "phase": phase, "reason": reason },
                "completed": completed,
            })),
            _ => None,
        }
    }
}
