//! Durable state: build step history, capabilities and generated files.

mod snapshot;
mod state_store;

use std::path::PathBuf;

use thiserror::Error;

use crate::models::StepStatus;

pub use snapshot::{SCHEMA_VERSION, SystemState};
pub use state_store::{DEFAULT_STEP_RETENTION, StateStore};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("State storage I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Persisted state unavailable: {0}")]
    PersistenceUnavailable(String),

    #[error("Build step not found: {0}")]
    StepNotFound(String),

    #[error("Invalid step transition for {id} from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: StepStatus,
        to: StepStatus,
    },

    #[error("Capability not found: {0}")]
    CapabilityNotFound(String),
}
