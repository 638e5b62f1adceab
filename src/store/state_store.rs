use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::models::{BuildStep, Capability, StepStatus};

use super::{StoreError, SystemState};

/// Default number of steps kept in history.
pub const DEFAULT_STEP_RETENTION: usize = 1000;

/// Shared state store.
///
/// Every mutation holds the lock for the whole read-modify-write, including
/// the snapshot write when the store is durable.
pub struct StateStore {
    /// Snapshot location; `None` for an in-memory store
    path: Option<PathBuf>,
    retention: usize,
    inner: Mutex<SystemState>,
}

impl StateStore {
    /// Store without durable backing.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            retention: DEFAULT_STEP_RETENTION,
            inner: Mutex::new(SystemState::default()),
        }
    }

    /// Load the snapshot at `path`, degrading to an empty state when it is
    /// missing or unusable. No recovery is applied.
    pub async fn load(path: impl Into<PathBuf>, retention: usize) -> Self {
        let path = path.into();
        let state = match SystemState::load_snapshot(&path).await {
            Ok(Some(state)) => state,
            Ok(None) => {
                debug!("No state snapshot at {:?}, starting fresh", path);
                SystemState::default()
            }
            Err(e) => {
                warn!("{}. Starting with fresh state.", e);
                SystemState::default()
            }
        };

        Self {
            path: Some(path),
            retention: retention.max(1),
            inner: Mutex::new(state),
        }
    }

    /// Load, mark steps left `running` by a previous process as interrupted,
    /// and persist the result. Returns the store and the number of
    /// interrupted steps.
    pub async fn open(path: impl Into<PathBuf>, retention: usize) -> Result<(Self, usize), StoreError> {
        let store = Self::load(path, retention).await;
        let interrupted = store.mark_stale_running_as_interrupted().await?;
        if interrupted > 0 {
            info!("Marked {} stale running step(s) as interrupted", interrupted);
        }
        store.persist().await?;
        Ok((store, interrupted))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_durable(&self) -> bool {
        self.path.is_some()
    }

    /// Write the full snapshot atomically. No-op for in-memory stores.
    pub async fn persist(&self) -> Result<(), StoreError> {
        let mut state = self.inner.lock().await;
        self.persist_locked(&mut state).await
    }

    async fn persist_locked(&self, state: &mut SystemState) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        state.last_updated = chrono::Utc::now().to_rfc3339();
        state.save(path).await
    }

    /// Crash recovery: every step still `running` becomes `interrupted`.
    pub async fn mark_stale_running_as_interrupted(&self) -> Result<usize, StoreError> {
        let mut state = self.inner.lock().await;
        let mut count = 0;
        for step in state
            .build_steps
            .iter_mut()
            .filter(|s| s.status == StepStatus::Running)
        {
            step.status = StepStatus::Interrupted;
            step.error = Some("interrupted by process restart".to_string());
            step.touch();
            count += 1;
        }
        if count > 0 {
            self.persist_locked(&mut state).await?;
        }
        Ok(count)
    }

    // ========================================================================
    // Build steps
    // ========================================================================

    /// Append a step and return its identifier.
    ///
    /// A step whose identifier is already in the history gets a fresh one.
    pub async fn record_step(&self, mut step: BuildStep) -> Result<String, StoreError> {
        let mut state = self.inner.lock().await;

        if state.build_steps.iter().any(|s| s.id == step.id) {
            let fresh = uuid::Uuid::new_v4().to_string();
            warn!("Step id {} already recorded, using {}", step.id, fresh);
            step.id = fresh;
        }

        let id = step.id.clone();
        state.build_steps.push(step);
        self.apply_retention(&mut state);
        self.persist_locked(&mut state).await?;
        Ok(id)
    }

    /// Move a step to `status`. `detail` is stored as the result for
    /// completed steps and as the error for failed or interrupted ones.
    pub async fn update_step(
        &self,
        id: &str,
        status: StepStatus,
        detail: Option<String>,
    ) -> Result<BuildStep, StoreError> {
        let mut state = self.inner.lock().await;

        let step = state
            .build_steps
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| StoreError::StepNotFound(id.to_string()))?;

        if !step.status.can_transition(status) {
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from: step.status,
                to: status,
            });
        }

        step.status = status;
        match status {
            StepStatus::Completed => step.result = detail,
            StepStatus::Failed | StepStatus::Interrupted => step.error = detail,
            StepStatus::Pending | StepStatus::Running => {}
        }
        step.touch();
        let updated = step.clone();

        self.persist_locked(&mut state).await?;
        Ok(updated)
    }

    /// Steps in insertion order, optionally filtered by status.
    pub async fn query_steps(&self, status: Option<StepStatus>) -> Vec<BuildStep> {
        let state = self.inner.lock().await;
        state
            .build_steps
            .iter()
            .filter(|s| status.is_none_or(|wanted| s.status == wanted))
            .cloned()
            .collect()
    }

    pub async fn get_step(&self, id: &str) -> Option<BuildStep> {
        let state = self.inner.lock().await;
        state.build_steps.iter().find(|s| s.id == id).cloned()
    }

    /// Drop the oldest terminal steps beyond the retention limit.
    fn apply_retention(&self, state: &mut SystemState) {
        let excess = state.build_steps.len().saturating_sub(self.retention);
        if excess == 0 {
            return;
        }
        let mut dropped = 0;
        state.build_steps.retain(|s| {
            if dropped < excess && s.status.is_terminal() {
                dropped += 1;
                false
            } else {
                true
            }
        });
        debug!("Retention dropped {} step(s)", dropped);
    }

    // ========================================================================
    // Capabilities
    // ========================================================================

    /// Insert a capability or refresh an existing one with the same name.
    ///
    /// Description and file path are replaced; an existing `implemented`
    /// flag is only ever raised here, never cleared.
    pub async fn upsert_capability(&self, capability: Capability) -> Result<(), StoreError> {
        let mut state = self.inner.lock().await;
        match state
            .capabilities
            .iter_mut()
            .find(|c| c.name == capability.name)
        {
            Some(existing) => {
                existing.description = capability.description;
                existing.file_path = capability.file_path;
                existing.implemented |= capability.implemented;
            }
            None => state.capabilities.push(capability),
        }
        self.persist_locked(&mut state).await
    }

    pub async fn set_capability_implemented(
        &self,
        name: &str,
        implemented: bool,
    ) -> Result<(), StoreError> {
        let mut state = self.inner.lock().await;
        let capability = state
            .capabilities
            .iter_mut()
            .find(|c| c.name == name)
            .ok_or_else(|| StoreError::CapabilityNotFound(name.to_string()))?;

        if capability.implemented == implemented {
            return Ok(());
        }
        capability.implemented = implemented;
        self.persist_locked(&mut state).await
    }

    pub async fn list_capabilities(&self) -> Vec<Capability> {
        self.inner.lock().await.capabilities.clone()
    }

    pub async fn unimplemented_capabilities(&self) -> Vec<Capability> {
        let state = self.inner.lock().await;
        state
            .capabilities
            .iter()
            .filter(|c| !c.implemented)
            .cloned()
            .collect()
    }

    // ========================================================================
    // Generated files
    // ========================================================================

    pub async fn add_generated_file(&self, file_path: &str) -> Result<(), StoreError> {
        let mut state = self.inner.lock().await;
        if state.generated_files.iter().any(|f| f == file_path) {
            return Ok(());
        }
        state.generated_files.push(file_path.to_string());
        self.persist_locked(&mut state).await
    }

    pub async fn generated_files(&self) -> Vec<String> {
        self.inner.lock().await.generated_files.clone()
    }

    /// Clone of the whole state.
    pub async fn snapshot(&self) -> SystemState {
        self.inner.lock().await.clone()
    }
}
