//! Build status derivation from persisted state.
//!
//! Status is derived from the state snapshot and the approval records without
//! opening the store, so reading it never triggers crash recovery.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::approval::ApprovalGate;
use crate::models::{ApprovalStatus, StepStatus};
use crate::store::SystemState;

/// Build status derived from `.build-forge/`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    /// No snapshot exists yet
    NotStarted,
    /// A step is running right now
    InProgress,
    /// Protected writes wait for a human decision
    AwaitingApproval,
    /// The last recorded step was cut short by a restart
    Interrupted,
    /// Every tracked capability is implemented
    Complete,
    /// Capabilities remain and nothing is running
    Incomplete,
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildStatus::NotStarted => write!(f, "not_started"),
            BuildStatus::InProgress => write!(f, "in_progress"),
            BuildStatus::AwaitingApproval => write!(f, "awaiting_approval"),
            BuildStatus::Interrupted => write!(f, "interrupted"),
            BuildStatus::Complete => write!(f, "complete"),
            BuildStatus::Incomplete => write!(f, "incomplete"),
        }
    }
}

/// Step counts per status
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub interrupted: usize,
}

/// Information about the build derived from files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusInfo {
    pub status: BuildStatus,
    /// RFC 3339 time of the last persisted mutation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
    pub capabilities_total: usize,
    pub capabilities_implemented: usize,
    /// Names of unimplemented capabilities
    pub remaining: Vec<String>,
    pub steps: StepCounts,
    pub pending_approvals: usize,
    pub generated_files: usize,
}

/// Derive status from a snapshot and the number of undecided approvals.
///
/// Precedence: in_progress, awaiting_approval, complete, interrupted,
/// incomplete.
pub fn derive_status(snapshot: Option<&SystemState>, pending_approvals: usize) -> StatusInfo {
    let Some(state) = snapshot else {
        return StatusInfo {
            status: if pending_approvals > 0 {
                BuildStatus::AwaitingApproval
            } else {
                BuildStatus::NotStarted
            },
            last_updated: None,
            capabilities_total: 0,
            capabilities_implemented: 0,
            remaining: Vec::new(),
            steps: StepCounts::default(),
            pending_approvals,
            generated_files: 0,
        };
    };

    let steps = StepCounts {
        pending: state.count_steps(StepStatus::Pending),
        running: state.count_steps(StepStatus::Running),
        completed: state.count_steps(StepStatus::Completed),
        failed: state.count_steps(StepStatus::Failed),
        interrupted: state.count_steps(StepStatus::Interrupted),
    };
    let remaining: Vec<String> = state
        .capabilities
        .iter()
        .filter(|c| !c.implemented)
        .map(|c| c.name.clone())
        .collect();
    let last_interrupted = state
        .build_steps
        .last()
        .is_some_and(|s| s.status == StepStatus::Interrupted);

    let status = if steps.running > 0 {
        BuildStatus::InProgress
    } else if pending_approvals > 0 {
        BuildStatus::AwaitingApproval
    } else if !state.capabilities.is_empty() && remaining.is_empty() {
        BuildStatus::Complete
    } else if last_interrupted {
        BuildStatus::Interrupted
    } else if state.build_steps.is_empty() && state.capabilities.is_empty() {
        BuildStatus::NotStarted
    } else {
        BuildStatus::Incomplete
    };

    StatusInfo {
        status,
        last_updated: Some(state.last_updated.clone()),
        capabilities_total: state.capabilities.len(),
        capabilities_implemented: state.implemented_count(),
        remaining,
        steps,
        pending_approvals,
        generated_files: state.generated_files.len(),
    }
}

/// Load the snapshot at `state_path` and count pending approvals in `gate`.
pub async fn load_status(state_path: &Path, gate: &ApprovalGate) -> anyhow::Result<StatusInfo> {
    let snapshot = SystemState::load_snapshot(state_path).await?;
    let pending = gate
        .list_approvals(Some(ApprovalStatus::Pending))
        .await?
        .len();
    Ok(derive_status(snapshot.as_ref(), pending))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::ProtectionRules;
    use crate::models::{BuildStep, Capability};
    use tempfile::tempdir;

    fn state_with(capabilities: Vec<Capability>, steps: Vec<StepStatus>) -> SystemState {
        let mut state = SystemState::default();
        state.capabilities = capabilities;
        for status in steps {
            let mut step = BuildStep::new("builder", "task");
            step.status = status;
            state.build_steps.push(step);
        }
        state
    }

    #[test]
    fn test_no_snapshot() {
        assert_eq!(derive_status(None, 0).status, BuildStatus::NotStarted);
        assert_eq!(derive_status(None, 2).status, BuildStatus::AwaitingApproval);
    }

    #[test]
    fn test_status_precedence() {
        let mut done = Capability::new("api", "");
        done.implemented = true;
        let missing = Capability::new("core", "");

        let running = state_with(vec![missing.clone()], vec![StepStatus::Running]);
        assert_eq!(derive_status(Some(&running), 1).status, BuildStatus::InProgress);

        let waiting = state_with(vec![missing.clone()], vec![StepStatus::Completed]);
        assert_eq!(derive_status(Some(&waiting), 1).status, BuildStatus::AwaitingApproval);

        let complete = state_with(vec![done.clone()], vec![StepStatus::Interrupted]);
        assert_eq!(derive_status(Some(&complete), 0).status, BuildStatus::Complete);

        let interrupted = state_with(
            vec![done, missing.clone()],
            vec![StepStatus::Completed, StepStatus::Interrupted],
        );
        let info = derive_status(Some(&interrupted), 0);
        assert_eq!(info.status, BuildStatus::Interrupted);
        assert_eq!(info.remaining, vec!["core"]);
        assert_eq!(info.capabilities_implemented, 1);
        assert_eq!(info.steps.interrupted, 1);

        let incomplete = state_with(vec![missing], vec![StepStatus::Failed]);
        assert_eq!(derive_status(Some(&incomplete), 0).status, BuildStatus::Incomplete);
    }

    #[tokio::test]
    async fn test_load_status_reads_files_without_recovery() {
        let dir = tempdir().unwrap();
        let state_path = dir.path().join("state.json");
        let state = state_with(vec![Capability::new("api", "")], vec![StepStatus::Running]);
        state.save(&state_path).await.unwrap();

        let gate = ApprovalGate::new(dir.path(), dir.path().join("approvals"), ProtectionRules::default());
        let info = load_status(&state_path, &gate).await.unwrap();
        assert_eq!(info.status, BuildStatus::InProgress);

        // The running step is left alone on disk
        let reloaded = SystemState::load_snapshot(&state_path).await.unwrap().unwrap();
        assert_eq!(reloaded.count_steps(StepStatus::Running), 1);
    }
}
