//! Contracts of the external collaborators the orchestrator drives.
//!
//! The orchestrator and build loop only see these traits. Model invocation,
//! prompt content and validation heuristics live behind them.

mod command;
mod json_utils;
mod validators;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use command::{CommandDecomposer, CommandSpec, CommandWorker, EX_TEMPFAIL};
pub use json_utils::extract_json_block;
pub use validators::{DEFAULT_MIN_BYTES, JsonSchemaValidator, NonTrivialContent};

/// What a worker returns for one task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerOutput {
    /// Free-text result, passed verbatim to later phases
    pub output: String,
    /// Optional machine-readable result (may carry `files` to write)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_result: Option<Value>,
}

impl WorkerOutput {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            structured_result: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Transient worker failure: {0}")]
    Transient(String),

    #[error("Worker failed: {0}")]
    Fatal(String),

    #[error("Worker timed out after {0:?}")]
    Timeout(Duration),
}

/// Performs the content-generation work for a task or phase.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Label recorded as the owning agent of build steps
    fn name(&self) -> &str;

    async fn invoke(&self, task: &str, context: &Value) -> Result<WorkerOutput, WorkerError>;
}

/// Splits a task into an ordered list of phase descriptions.
#[async_trait]
pub trait Decomposer: Send + Sync {
    fn name(&self) -> &str {
        "planner"
    }

    async fn decompose(&self, task: &str) -> Result<Vec<String>, WorkerError>;
}

/// Decides whether a capability's artifact is acceptable.
#[async_trait]
pub trait Validator: Send + Sync {
    async fn is_valid(&self, path: &Path) -> bool;
}
