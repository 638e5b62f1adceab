//! Approval gate for writes to protected paths.
//!
//! Workers are not trusted to modify the control-plane files of the project.
//! A write to a protected path becomes a pending record that a human later
//! approves or denies; approve/deny is the only way protected bytes change.

mod gate;
mod rules;

use std::path::PathBuf;

use thiserror::Error;

use crate::models::ApprovalStatus;

pub use gate::ApprovalGate;
pub use rules::ProtectionRules;

#[derive(Debug, Error)]
pub enum GateError {
    #[error("Approval not found: {0}")]
    NotFound(String),

    #[error("Approval {id} already resolved ({status})")]
    AlreadyResolved { id: String, status: ApprovalStatus },

    #[error("Approval {0} is being decided by another process")]
    Busy(String),

    #[error("Writes to {0} are forbidden")]
    Forbidden(String),

    #[error("Path {0} is outside the project root")]
    OutsideRoot(String),

    #[error("Approval I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GateError {
    /// Client-input errors leave state untouched and can be reported back.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            GateError::NotFound(_)
                | GateError::AlreadyResolved { .. }
                | GateError::Forbidden(_)
                | GateError::OutsideRoot(_)
        )
    }
}
