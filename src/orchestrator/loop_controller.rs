use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::approval::ProtectionRules;
use crate::models::{ApprovalStatus, Capability, PendingApproval};
use crate::prompts::GoalTemplate;
use crate::store::{StateStore, StoreError};
use crate::workers::Validator;

use super::context::{OrchestrationContext, RunMode};
use super::engine::Orchestrator;
use super::state::{BuildSummary, LoopState, LoopStatus};

/// A capability the build must satisfy and how its artifact is judged.
#[derive(Clone)]
pub struct CapabilityTarget {
    pub capability: Capability,
    pub validator: Arc<dyn Validator>,
}

impl CapabilityTarget {
    pub fn new(capability: Capability, validator: Arc<dyn Validator>) -> Self {
        Self {
            capability,
            validator,
        }
    }

    pub fn name(&self) -> &str {
        &self.capability.name
    }
}

/// Drives Inspect → Diff → Resolve → Validate → Persist until no gaps remain
/// or the iteration cap is reached.
pub struct BuildLoop {
    orchestrator: Arc<Orchestrator>,
    store: Arc<StateStore>,
    root: PathBuf,
    goals: GoalTemplate,
    session: Map<String, Value>,
    cancel: CancellationToken,
}

impl BuildLoop {
    pub fn new(orchestrator: Arc<Orchestrator>, root: impl Into<PathBuf>) -> Self {
        let store = orchestrator.store().clone();
        Self {
            orchestrator,
            store,
            root: root.into(),
            goals: GoalTemplate::bundled(),
            session: Map::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_goal_template(mut self, goals: GoalTemplate) -> Self {
        self.goals = goals;
        self
    }

    pub fn with_session(mut self, session: Map<String, Value>) -> Self {
        self.session = session;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Run the loop. Only storage failures while persisting surface as
    /// errors; every other ending is reported in the summary.
    pub async fn run_until_converged(
        &self,
        targets: &[CapabilityTarget],
        max_iterations: u32,
    ) -> Result<BuildSummary, StoreError> {
        let guardrails = self
            .orchestrator
            .guardrails()
            .clone()
            .with_max_iterations(max_iterations);
        let mut state = LoopState::new(max_iterations);
        // Approval ids each capability's resolves produced during this run
        let mut awaiting: HashMap<String, Vec<String>> = HashMap::new();

        for target in targets {
            self.store.upsert_capability(target.capability.clone()).await?;
        }

        info!(
            "Starting build loop: {} capabilities, max {} iterations",
            targets.len(),
            max_iterations
        );

        loop {
            // Inspect + Diff
            let gaps = self.inspect(targets).await?;
            if gaps.is_empty() {
                self.store.persist().await?;
                info!("Build converged after {} iteration(s)", state.iteration);
                return Ok(BuildSummary::new(&state, LoopStatus::Converged, Vec::new()));
            }

            // Gaps blocked on a human decision are not sent to the worker again
            let pending = match self
                .orchestrator
                .gate()
                .list_approvals(Some(ApprovalStatus::Pending))
                .await
            {
                Ok(pending) => pending,
                Err(e) => {
                    error!("Cannot read approval records: {}", e);
                    self.store.persist().await?;
                    let status = LoopStatus::Failed {
                        error: e.to_string(),
                    };
                    return Ok(BuildSummary::new(&state, status, names(&gaps)));
                }
            };
            let mut open = Vec::with_capacity(gaps.len());
            for gap in &gaps {
                let blocking = blocking_approvals(gap, &pending, &awaiting);
                if blocking.is_empty() {
                    open.push(*gap);
                } else {
                    info!("{} is waiting on approval {}", gap.name(), blocking.join(", "));
                    state.record_pending(blocking);
                }
            }
            if open.is_empty() {
                info!("Every gap is waiting on a human decision");
                self.store.persist().await?;
                return Ok(BuildSummary::new(&state, LoopStatus::Incomplete, names(&gaps)));
            }

            if let Err(stop) = guardrails.check_before_iteration(state.iteration) {
                warn!("Stopping with {} gap(s): {}", gaps.len(), stop);
                self.store.persist().await?;
                return Ok(BuildSummary::new(&state, LoopStatus::Incomplete, names(&gaps)));
            }

            if self.cancel.is_cancelled() {
                self.store.persist().await?;
                return Ok(BuildSummary::new(&state, LoopStatus::Cancelled, names(&gaps)));
            }

            state.next_iteration();
            info!(
                "=== Iteration {} of {}: {} gap(s) ===",
                state.iteration,
                state.max_iterations,
                gaps.len()
            );

            // Resolve
            let ctx = OrchestrationContext::new(RunMode::Build {
                iteration: state.iteration,
            })
            .with_session(self.session.clone())
            .with_cancellation(self.cancel.clone());

            let mut generated: Vec<&str> = Vec::new();
            let mut failure = None;
            for gap in &open {
                if ctx.is_cancelled() {
                    break;
                }
                let goal = self.goals.render(&gap.capability);
                info!("Resolving {}", gap.name());

                match self.orchestrator.run(&goal, &ctx, 0, false).await {
                    Ok(outcome) if outcome.is_cancelled() => break,
                    Ok(outcome) => {
                        let pending = outcome.pending_approvals();
                        awaiting
                            .entry(gap.name().to_string())
                            .or_default()
                            .extend(pending.iter().map(|id| id.to_string()));
                        if pending.is_empty() {
                            generated.push(gap.name());
                        } else {
                            info!(
                                "{} is waiting on {} approval(s)",
                                gap.name(),
                                pending.len()
                            );
                        }
                        state.record_pending(pending);
                    }
                    Err(e) if e.is_fatal() => {
                        error!("Unrecoverable error resolving {}: {}", gap.name(), e);
                        failure = Some(e.to_string());
                        break;
                    }
                    Err(e) => warn!("Could not resolve {}: {}", gap.name(), e),
                }
            }

            // Validate
            for gap in &gaps {
                let valid = match &gap.capability.file_path {
                    Some(_) => self.check(gap).await,
                    // Nothing to inspect; a clean resolve is the only evidence
                    None => generated.contains(&gap.name()),
                };
                if valid {
                    self.store
                        .set_capability_implemented(gap.name(), true)
                        .await?;
                    state.record_resolved(gap.name());
                    info!("{} implemented", gap.name());
                }
            }

            // Persist
            self.store.persist().await?;

            if let Some(error) = failure {
                let remaining = self.remaining(targets).await;
                return Ok(BuildSummary::new(&state, LoopStatus::Failed { error }, remaining));
            }
            if self.cancel.is_cancelled() {
                info!("Build loop cancelled after iteration {}", state.iteration);
                let remaining = self.remaining(targets).await;
                return Ok(BuildSummary::new(&state, LoopStatus::Cancelled, remaining));
            }
        }
    }

    /// Re-check every target, syncing `implemented` both ways, and return
    /// the ones still missing.
    async fn inspect<'a>(
        &self,
        targets: &'a [CapabilityTarget],
    ) -> Result<Vec<&'a CapabilityTarget>, StoreError> {
        let tracked = self.store.list_capabilities().await;
        let mut gaps = Vec::new();

        for target in targets {
            let implemented = tracked
                .iter()
                .find(|c| c.name == target.capability.name)
                .is_some_and(|c| c.implemented);

            let valid = match &target.capability.file_path {
                Some(_) => self.check(target).await,
                None => implemented,
            };

            if valid != implemented {
                if !valid {
                    warn!("{} no longer validates", target.name());
                }
                self.store
                    .set_capability_implemented(target.name(), valid)
                    .await?;
            }
            if !valid {
                gaps.push(target);
            }
        }
        Ok(gaps)
    }

    async fn check(&self, target: &CapabilityTarget) -> bool {
        let Some(path) = &target.capability.file_path else {
            return false;
        };
        let path = self.root.join(ProtectionRules::normalize(path));
        target.validator.is_valid(&path).await
    }

    async fn remaining(&self, targets: &[CapabilityTarget]) -> Vec<String> {
        let unimplemented = self.store.unimplemented_capabilities().await;
        targets
            .iter()
            .filter(|t| unimplemented.iter().any(|c| c.name == t.capability.name))
            .map(|t| t.capability.name.clone())
            .collect()
    }
}

/// Pending approvals holding up `gap`: a write already queued for its
/// artifact, or one produced by its earlier resolves.
fn blocking_approvals<'p>(
    gap: &CapabilityTarget,
    pending: &'p [PendingApproval],
    awaiting: &HashMap<String, Vec<String>>,
) -> Vec<&'p str> {
    let artifact = gap.capability.file_path.as_deref().map(ProtectionRules::normalize);
    let earlier = awaiting.get(gap.name());
    pending
        .iter()
        .filter(|a| {
            artifact.as_deref() == Some(a.file_path.as_str())
                || earlier.is_some_and(|ids| ids.contains(&a.id))
        })
        .map(|a| a.id.as_str())
        .collect()
}

fn names(gaps: &[&CapabilityTarget]) -> Vec<String> {
    gaps.iter().map(|g| g.capability.name.clone()).collect()
}
