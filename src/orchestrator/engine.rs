//! Recursive task orchestrator.
//!
//! `run` checks the depth ceiling, asks the complexity policy whether to
//! decompose, and either executes the task directly or runs the decomposed
//! phases strictly in order, each seeing the results of the phases before it.

use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::approval::ApprovalGate;
use crate::models::{ApprovalStatus, BuildStep, StepStatus};
use crate::store::StateStore;
use crate::workers::{Decomposer, Worker, WorkerError, WorkerOutput};

use super::complexity::{ComplexityPolicy, KeywordComplexity};
use super::context::{OrchestrationContext, PhaseResult};
use super::error::OrchestratorError;
use super::guardrails::Guardrails;
use super::writes::{WriteReceipt, extract_file_writes};

// ============================================================================
// Outcome
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Direct,
    Decomposed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Completed,
    /// Cancellation was observed before a dispatch; `phases` holds what finished
    Cancelled,
}

/// Result of one `run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub task: String,
    pub kind: OutcomeKind,
    pub status: OutcomeStatus,
    /// Worker output, or the merged phase outputs
    pub output: String,
    /// Worker structured result, or the ordered `{phase, result}` list
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_result: Option<Value>,
    #[serde(default)]
    pub phases: Vec<PhaseResult>,
    #[serde(default)]
    pub writes: Vec<WriteReceipt>,
    /// Build steps recorded for this run, in order
    #[serde(default)]
    pub step_ids: Vec<String>,
}

impl Outcome {
    fn cancelled(task: &str, kind: OutcomeKind, phases: Vec<PhaseResult>) -> Self {
        Self {
            task: task.to_string(),
            kind,
            status: OutcomeStatus::Cancelled,
            output: String::new(),
            structured_result: None,
            phases,
            writes: Vec::new(),
            step_ids: Vec::new(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == OutcomeStatus::Cancelled
    }

    /// Approval ids of writes still waiting for a decision.
    pub fn pending_approvals(&self) -> Vec<&str> {
        self.writes
            .iter()
            .filter_map(|w| w.approval_id.as_deref())
            .collect()
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

pub struct Orchestrator {
    worker: Arc<dyn Worker>,
    decomposer: Arc<dyn Decomposer>,
    complexity: Arc<dyn ComplexityPolicy>,
    store: Arc<StateStore>,
    gate: Arc<ApprovalGate>,
    guardrails: Guardrails,
}

impl Orchestrator {
    pub fn new(
        worker: Arc<dyn Worker>,
        decomposer: Arc<dyn Decomposer>,
        store: Arc<StateStore>,
        gate: Arc<ApprovalGate>,
    ) -> Self {
        Self {
            worker,
            decomposer,
            complexity: Arc::new(KeywordComplexity::default()),
            store,
            gate,
            guardrails: Guardrails::default(),
        }
    }

    pub fn with_complexity(mut self, policy: Arc<dyn ComplexityPolicy>) -> Self {
        self.complexity = policy;
        self
    }

    pub fn with_guardrails(mut self, guardrails: Guardrails) -> Self {
        self.guardrails = guardrails;
        self
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn gate(&self) -> &Arc<ApprovalGate> {
        &self.gate
    }

    pub fn guardrails(&self) -> &Guardrails {
        &self.guardrails
    }

    /// Top-level entry point: depth 0, complexity check enabled.
    pub async fn run_task(
        &self,
        task: &str,
        ctx: &OrchestrationContext,
    ) -> Result<Outcome, OrchestratorError> {
        self.run(task, ctx, 0, false).await
    }

    /// Execute `task` at `depth`. Phases pass `is_phase = true`, which skips
    /// the complexity check so a phase is never decomposed again.
    pub fn run<'a>(
        &'a self,
        task: &'a str,
        ctx: &'a OrchestrationContext,
        depth: u32,
        is_phase: bool,
    ) -> BoxFuture<'a, Result<Outcome, OrchestratorError>> {
        async move {
            if let Err(stop) = self.guardrails.check_depth(depth) {
                warn!("Refusing '{}': {}", task, stop);
                return Err(OrchestratorError::RecursionLimitExceeded {
                    depth,
                    limit: self.guardrails.max_depth,
                });
            }

            if ctx.is_cancelled() {
                info!("Cancelled before dispatching '{}'", task);
                return Ok(Outcome::cancelled(task, OutcomeKind::Direct, Vec::new()));
            }

            if is_phase || !self.complexity.is_complex(task) {
                return self.execute_direct(task, ctx, depth).await;
            }

            let (phases, decompose_step) = self.decompose(task).await?;
            if phases.len() < 2 {
                debug!(
                    "Decomposition of '{}' gave {} phase(s), executing directly",
                    task,
                    phases.len()
                );
                let mut outcome = self.execute_direct(task, ctx, depth).await?;
                outcome.step_ids.insert(0, decompose_step);
                return Ok(outcome);
            }

            let mut outcome = self.execute_phases(task, &phases, ctx, depth).await?;
            outcome.step_ids.insert(0, decompose_step);
            Ok(outcome)
        }
        .boxed()
    }

    // ========================================================================
    // Decomposition
    // ========================================================================

    /// Ask the decomposer for phases, logged as one build step.
    async fn decompose(&self, task: &str) -> Result<(Vec<String>, String), OrchestratorError> {
        let step = BuildStep::new(self.decomposer.name(), format!("Decompose: {}", task));
        let step_id = self.store.record_step(step).await?;
        self.store
            .update_step(&step_id, StepStatus::Running, None)
            .await?;

        match self.decompose_with_timeout(task).await {
            Ok(phases) => {
                info!("Decomposed '{}' into {} phase(s)", task, phases.len());
                self.store
                    .update_step(
                        &step_id,
                        StepStatus::Completed,
                        Some(json!(phases).to_string()),
                    )
                    .await?;
                Ok((phases, step_id))
            }
            Err(e) => {
                warn!("Decomposition of '{}' failed: {}", task, e);
                self.store
                    .update_step(&step_id, StepStatus::Failed, Some(e.to_string()))
                    .await?;
                Err(OrchestratorError::Decomposition(e))
            }
        }
    }

    async fn decompose_with_timeout(&self, task: &str) -> Result<Vec<String>, WorkerError> {
        let timeout = self.guardrails.worker_timeout;
        tokio::time::timeout(timeout, self.decomposer.decompose(task))
            .await
            .unwrap_or(Err(WorkerError::Timeout(timeout)))
    }

    async fn execute_phases(
        &self,
        task: &str,
        phases: &[String],
        ctx: &OrchestrationContext,
        depth: u32,
    ) -> Result<Outcome, OrchestratorError> {
        let count = phases.len();
        let mut completed: Vec<PhaseResult> = Vec::with_capacity(count);
        let mut writes = Vec::new();
        let mut step_ids = Vec::new();

        for (i, phase) in phases.iter().enumerate() {
            let index = i + 1;
            if ctx.is_cancelled() {
                info!("Cancelled before phase {}/{} of '{}'", index, count, task);
                return Ok(Outcome::cancelled(task, OutcomeKind::Decomposed, completed));
            }

            info!("Phase {}/{}: {}", index, count, phase);
            let phase_ctx = ctx.for_phase(index, count, &completed);
            match self.run(phase, &phase_ctx, depth + 1, true).await {
                Ok(outcome) if outcome.is_cancelled() => {
                    return Ok(Outcome::cancelled(task, OutcomeKind::Decomposed, completed));
                }
                Ok(outcome) => {
                    writes.extend(outcome.writes);
                    step_ids.extend(outcome.step_ids);
                    completed.push(PhaseResult {
                        index,
                        phase: phase.clone(),
                        result: outcome.output,
                        structured_result: outcome.structured_result,
                    });
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("Phase {}/{} failed: {}", index, count, e);
                    return Err(OrchestratorError::PhaseExecutionFailed {
                        index,
                        phase: phase.clone(),
                        reason: e.to_string(),
                        completed,
                    });
                }
            }
        }

        Ok(Outcome {
            task: task.to_string(),
            kind: OutcomeKind::Decomposed,
            status: OutcomeStatus::Completed,
            output: merge_output(&completed),
            structured_result: Some(merge_structured(&completed)),
            phases: completed,
            writes,
            step_ids,
        })
    }

    // ========================================================================
    // Direct execution
    // ========================================================================

    async fn execute_direct(
        &self,
        task: &str,
        ctx: &OrchestrationContext,
        depth: u32,
    ) -> Result<Outcome, OrchestratorError> {
        let step_id = self
            .store
            .record_step(BuildStep::new(self.worker.name(), task))
            .await?;

        let worker_ctx = ctx.to_worker_context(
            depth,
            &self.store.generated_files().await,
            &self.store.list_capabilities().await,
        );

        self.store
            .update_step(&step_id, StepStatus::Running, None)
            .await?;
        debug!("Dispatching '{}' to {} (depth {})", task, self.worker.name(), depth);

        let output = match self.invoke_worker(task, &worker_ctx).await {
            Ok(output) => output,
            Err(e) => {
                self.store
                    .update_step(&step_id, StepStatus::Failed, Some(e.to_string()))
                    .await?;
                return Err(OrchestratorError::Worker {
                    task: task.to_string(),
                    source: e,
                });
            }
        };

        let writes = match self.apply_writes(task, output.structured_result.as_ref()).await {
            Ok(writes) => writes,
            Err(e) => {
                self.store
                    .update_step(&step_id, StepStatus::Failed, Some(e.to_string()))
                    .await?;
                return Err(e);
            }
        };

        self.store
            .update_step(&step_id, StepStatus::Completed, Some(output.output.clone()))
            .await?;

        Ok(Outcome {
            task: task.to_string(),
            kind: OutcomeKind::Direct,
            status: OutcomeStatus::Completed,
            output: output.output,
            structured_result: output.structured_result,
            phases: Vec::new(),
            writes,
            step_ids: vec![step_id],
        })
    }

    async fn invoke_worker(&self, task: &str, context: &Value) -> Result<WorkerOutput, WorkerError> {
        let timeout = self.guardrails.worker_timeout;
        tokio::time::timeout(timeout, self.worker.invoke(task, context))
            .await
            .unwrap_or(Err(WorkerError::Timeout(timeout)))
    }

    /// Route each requested file write through the approval gate.
    async fn apply_writes(
        &self,
        task: &str,
        structured: Option<&Value>,
    ) -> Result<Vec<WriteReceipt>, OrchestratorError> {
        let mut receipts = Vec::new();
        for write in extract_file_writes(structured) {
            let reason = write
                .reason
                .unwrap_or_else(|| format!("Requested by {}: {}", self.worker.name(), task));
            let approval = self
                .gate
                .request_write(&write.path, &write.content, &reason)
                .await?;
            if approval.status == ApprovalStatus::Approved {
                self.store.add_generated_file(&approval.file_path).await?;
            }
            receipts.push(WriteReceipt::from(&approval));
        }
        Ok(receipts)
    }
}

/// Phase outputs in order, each under its own heading.
fn merge_output(phases: &[PhaseResult]) -> String {
    phases
        .iter()
        .map(|p| format!("## Phase {}: {}\n\n{}", p.index, p.phase, p.result))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn merge_structured(phases: &[PhaseResult]) -> Value {
    Value::Array(
        phases
            .iter()
            .map(|p| json!({ "phase": p.phase, "result": p.result }))
            .collect(),
    )
}
