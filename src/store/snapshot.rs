//! SystemState - the durable snapshot behind the state store.
//!
//! One JSON document holds the step history, the tracked capabilities and the
//! list of generated files. It is always replaced atomically.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::{BuildStep, Capability, StepStatus};
use crate::output::{read_if_exists, write_atomic};

use super::StoreError;

/// Current schema version for snapshot files.
/// Bump when adding/removing/modifying fields.
pub const SCHEMA_VERSION: u32 = 1;

/// Full persisted state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemState {
    /// Schema version for migration support
    pub schema_version: u32,
    /// Last time the snapshot was written, RFC 3339
    pub last_updated: String,
    /// Step history in insertion order
    #[serde(default)]
    pub build_steps: Vec<BuildStep>,
    /// Tracked capabilities in declaration order
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    /// Files written through the gate without needing approval
    #[serde(default)]
    pub generated_files: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Default for SystemState {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            last_updated: chrono::Utc::now().to_rfc3339(),
            build_steps: Vec::new(),
            capabilities: Vec::new(),
            generated_files: Vec::new(),
            metadata: Map::new(),
        }
    }
}

impl SystemState {
    /// Save the snapshot using the atomic write pattern.
    pub async fn save(&self, path: &Path) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(self)?;
        write_atomic(path, json.as_bytes())
            .await
            .map_err(|source| StoreError::Io {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Load a snapshot without any recovery side effects.
    ///
    /// Returns `Ok(None)` when no snapshot exists yet and
    /// `PersistenceUnavailable` when one exists but cannot be used.
    pub async fn load_snapshot(path: &Path) -> Result<Option<Self>, StoreError> {
        let bytes = read_if_exists(path)
            .await
            .map_err(|e| StoreError::PersistenceUnavailable(format!("{}: {}", path.display(), e)))?;

        let Some(bytes) = bytes else {
            return Ok(None);
        };

        let state: Self = serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::PersistenceUnavailable(format!("{}: {}", path.display(), e)))?;

        if state.schema_version != SCHEMA_VERSION {
            return Err(StoreError::PersistenceUnavailable(format!(
                "{}: schema version {} is not supported (expected {})",
                path.display(),
                state.schema_version,
                SCHEMA_VERSION
            )));
        }

        Ok(Some(state))
    }

    pub fn count_steps(&self, status: StepStatus) -> usize {
        self.build_steps.iter().filter(|s| s.status == status).count()
    }

    pub fn implemented_count(&self) -> usize {
        self.capabilities.iter().filter(|c| c.implemented).count()
    }
}
