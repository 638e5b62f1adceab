//! Integration tests for orchestration, approvals and crash recovery.
//!
//! These tests drive the public API with scripted workers:
//! - Complexity checks and recursion bounds
//! - Phase context threading and failure handling
//! - Approval-gated writes from workers
//! - Crash recovery of running steps
//! - Build loop convergence

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};
use tempfile::{TempDir, tempdir};
use tokio_util::sync::CancellationToken;

use build_forge::approval::{ApprovalGate, GateError, ProtectionRules};
use build_forge::models::{ApprovalStatus, BuildStep, Capability, StepStatus};
use build_forge::orchestrator::{
    BuildLoop, CapabilityTarget, ComplexityPolicy, Guardrails, KeywordComplexity, LoopStatus,
    NeverComplex, OrchestrationContext, Orchestrator, OrchestratorError, OutcomeKind,
};
use build_forge::store::{StateStore, SystemState};
use build_forge::workers::{Decomposer, NonTrivialContent, Worker, WorkerError, WorkerOutput};

// ============================================================================
// Test doubles
// ============================================================================

type Respond = dyn Fn(&str, &Value) -> Result<WorkerOutput, WorkerError> + Send + Sync;

/// Worker that records every call and answers through a closure.
struct ScriptedWorker {
    calls: Mutex<Vec<(String, Value)>>,
    respond: Box<Respond>,
}

impl ScriptedWorker {
    fn new(
        respond: impl Fn(&str, &Value) -> Result<WorkerOutput, WorkerError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            respond: Box::new(respond),
        })
    }

    fn echo() -> Arc<Self> {
        Self::new(|task, _| Ok(WorkerOutput::text(format!("output of {}", task))))
    }

    fn tasks(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(t, _)| t.clone()).collect()
    }

    fn contexts(&self) -> Vec<Value> {
        self.calls.lock().unwrap().iter().map(|(_, c)| c.clone()).collect()
    }
}

#[async_trait]
impl Worker for ScriptedWorker {
    fn name(&self) -> &str {
        "builder"
    }

    async fn invoke(&self, task: &str, context: &Value) -> Result<WorkerOutput, WorkerError> {
        self.calls
            .lock()
            .unwrap()
            .push((task.to_string(), context.clone()));
        (self.respond)(task, context)
    }
}

struct FixedPhases(Vec<&'static str>);

#[async_trait]
impl Decomposer for FixedPhases {
    async fn decompose(&self, _task: &str) -> Result<Vec<String>, WorkerError> {
        Ok(self.0.iter().map(|p| p.to_string()).collect())
    }
}

/// Policy that counts how often it is consulted.
struct CountingPolicy {
    calls: AtomicUsize,
    complex: bool,
}

impl CountingPolicy {
    fn new(complex: bool) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            complex,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ComplexityPolicy for CountingPolicy {
    fn is_complex(&self, _task: &str) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.complex
    }
}

struct Harness {
    dir: TempDir,
    store: Arc<StateStore>,
    gate: Arc<ApprovalGate>,
}

impl Harness {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let rules = ProtectionRules::new(&["control/*"], &[], &[".env", ".git/**"]).unwrap();
        let gate = ApprovalGate::new(dir.path(), dir.path().join(".build-forge/approvals"), rules);
        Self {
            dir,
            store: Arc::new(StateStore::in_memory()),
            gate: Arc::new(gate),
        }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn orchestrator(&self, worker: Arc<ScriptedWorker>, phases: Vec<&'static str>) -> Orchestrator {
        Orchestrator::new(
            worker,
            Arc::new(FixedPhases(phases)),
            self.store.clone(),
            self.gate.clone(),
        )
    }
}

// ============================================================================
// Complexity and recursion
// ============================================================================

#[tokio::test]
async fn test_phase_runs_never_consult_complexity_policy() {
    let harness = Harness::new();
    let policy = CountingPolicy::new(true);
    let orch = harness
        .orchestrator(ScriptedWorker::echo(), vec!["a", "b", "c"])
        .with_complexity(policy.clone());
    let ctx = OrchestrationContext::default();

    orch.run("already a phase", &ctx, 1, true).await.unwrap();
    assert_eq!(policy.calls(), 0);

    // A decomposed run consults the policy once, for the top-level task only
    let outcome = orch.run_task("big task", &ctx).await.unwrap();
    assert_eq!(outcome.phases.len(), 3);
    assert_eq!(policy.calls(), 1);
}

#[tokio::test]
async fn test_depth_beyond_limit_is_refused() {
    let harness = Harness::new();
    let worker = ScriptedWorker::echo();
    let orch = harness
        .orchestrator(worker.clone(), vec![])
        .with_complexity(Arc::new(NeverComplex));
    let ctx = OrchestrationContext::default();

    for depth in 0..=2 {
        assert!(orch.run("task", &ctx, depth, false).await.is_ok());
    }
    for depth in [3, 10, u32::MAX] {
        let err = orch.run("task", &ctx, depth, false).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::RecursionLimitExceeded { limit: 2, .. }
        ));
    }
    assert_eq!(worker.tasks().len(), 3);
}

#[tokio::test]
async fn test_phase_over_ceiling_surfaces_recursion_error() {
    let harness = Harness::new();
    let worker = ScriptedWorker::echo();
    let orch = harness
        .orchestrator(worker.clone(), vec!["one", "two"])
        .with_complexity(CountingPolicy::new(true))
        .with_guardrails(Guardrails {
            max_depth: 0,
            ..Default::default()
        });

    let err = orch
        .run_task("split me", &OrchestrationContext::default())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        OrchestratorError::RecursionLimitExceeded { depth: 1, limit: 0 }
    ));
    assert!(worker.tasks().is_empty());
}

// ============================================================================
// Decomposition
// ============================================================================

#[tokio::test]
async fn test_multi_area_task_is_decomposed_and_merged_in_order() {
    let harness = Harness::new();
    let worker = ScriptedWorker::echo();
    let orch = harness
        .orchestrator(worker.clone(), vec!["Do X", "Do Y", "Do Z"])
        .with_complexity(Arc::new(KeywordComplexity::default()));

    let outcome = orch
        .run(
            "Do X and Y and Z across agents, tools, core, api",
            &OrchestrationContext::default(),
            0,
            false,
        )
        .await
        .unwrap();

    assert_eq!(outcome.kind, OutcomeKind::Decomposed);
    assert_eq!(worker.tasks(), vec!["Do X", "Do Y", "Do Z"]);
    assert_eq!(
        outcome.structured_result.unwrap(),
        json!([
            {"phase": "Do X", "result": "output of Do X"},
            {"phase": "Do Y", "result": "output of Do Y"},
            {"phase": "Do Z", "result": "output of Do Z"}
        ])
    );

    // One step for the decomposition, then one per phase, all completed
    let steps = harness.store.query_steps(None).await;
    assert_eq!(steps.len(), 4);
    assert_eq!(steps[0].agent, "planner");
    let phase_actions: Vec<&str> = steps[1..].iter().map(|s| s.action.as_str()).collect();
    assert_eq!(phase_actions, vec!["Do X", "Do Y", "Do Z"]);
    assert!(steps.iter().all(|s| s.status == StepStatus::Completed));
    assert_eq!(outcome.step_ids, steps.iter().map(|s| s.id.clone()).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_phase_k_sees_exactly_previous_outputs() {
    let harness = Harness::new();
    let worker = ScriptedWorker::echo();
    let phases = vec!["p1", "p2", "p3", "p4"];
    let orch = harness
        .orchestrator(worker.clone(), phases.clone())
        .with_complexity(CountingPolicy::new(true));

    orch.run_task("goal", &OrchestrationContext::default())
        .await
        .unwrap();

    for (k, context) in worker.contexts().iter().enumerate() {
        let previous = context["previous_phases"].as_array().unwrap();
        assert_eq!(previous.len(), k);
        for (j, entry) in previous.iter().enumerate() {
            assert_eq!(entry["phase"], phases[j]);
            assert_eq!(entry["result"], format!("output of {}", phases[j]));
        }
        assert_eq!(context["phase_index"], k + 1);
        assert_eq!(context["phase_count"], 4);
        assert_eq!(context["depth"], 1);
    }
}

#[tokio::test]
async fn test_failed_phase_aborts_remaining_phases() {
    let harness = Harness::new();
    let worker = ScriptedWorker::new(|task, _| {
        if task == "second" {
            Err(WorkerError::Fatal("compiler exploded".into()))
        } else {
            Ok(WorkerOutput::text("ok"))
        }
    });
    let orch = harness
        .orchestrator(worker.clone(), vec!["first", "second", "third"])
        .with_complexity(CountingPolicy::new(true));

    let err = orch
        .run_task("goal", &OrchestrationContext::default())
        .await
        .unwrap_err();

    match &err {
        OrchestratorError::PhaseExecutionFailed {
            index,
            phase,
            reason,
            completed,
        } => {
            assert_eq!(*index, 2);
            assert_eq!(phase, "second");
            assert!(reason.contains("compiler exploded"));
            assert_eq!(completed.len(), 1);
            assert_eq!(completed[0].phase, "first");
        }
        other => panic!("expected phase failure, got {:?}", other),
    }
    assert!(!err.is_fatal());
    assert_eq!(worker.tasks(), vec!["first", "second"]);

    let failed = harness.store.query_steps(Some(StepStatus::Failed)).await;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].action, "second");
}

#[tokio::test]
async fn test_cancellation_skips_next_phase() {
    let harness = Harness::new();
    let token = CancellationToken::new();
    let cancel = token.clone();
    let worker = ScriptedWorker::new(move |task, _| {
        cancel.cancel();
        Ok(WorkerOutput::text(format!("finished {}", task)))
    });
    let orch = harness
        .orchestrator(worker.clone(), vec!["one", "two", "three"])
        .with_complexity(CountingPolicy::new(true));

    let ctx = OrchestrationContext::default().with_cancellation(token);
    let outcome = orch.run_task("goal", &ctx).await.unwrap();

    assert!(outcome.is_cancelled());
    assert_eq!(outcome.phases.len(), 1);
    assert_eq!(outcome.phases[0].result, "finished one");
    assert_eq!(worker.tasks(), vec!["one"]);
}

// ============================================================================
// Approval-gated writes
// ============================================================================

#[tokio::test]
async fn test_protected_write_waits_for_approval() {
    let harness = Harness::new();
    let target = harness.root().join("control/core.cfg");
    std::fs::create_dir_all(target.parent().unwrap()).unwrap();
    std::fs::write(&target, b"mode=safe\n").unwrap();

    let worker = ScriptedWorker::new(|_, _| {
        Ok(WorkerOutput {
            output: "tuned".into(),
            structured_result: Some(json!({
                "files": [
                    { "path": "control/core.cfg", "content": "mode=fast\n", "reason": "speed up" },
                    { "path": "src/tool.rs", "content": "pub fn tool() {}\n" }
                ]
            })),
        })
    });
    let orch = harness
        .orchestrator(worker, vec![])
        .with_complexity(Arc::new(NeverComplex));

    let outcome = orch
        .run_task("tune the core", &OrchestrationContext::default())
        .await
        .unwrap();

    let pending = outcome.pending_approvals();
    assert_eq!(pending.len(), 1);
    assert_eq!(std::fs::read(&target).unwrap(), b"mode=safe\n");
    // Unprotected writes land immediately
    assert!(harness.root().join("src/tool.rs").exists());
    assert_eq!(harness.store.generated_files().await, vec!["src/tool.rs"]);

    let id = pending[0].to_string();
    let approved = harness.gate.approve(&id).await.unwrap();
    assert_eq!(approved.status, ApprovalStatus::Approved);
    assert_eq!(std::fs::read(&target).unwrap(), b"mode=fast\n");
}

#[tokio::test]
async fn test_second_decision_is_rejected_without_mutation() {
    let harness = Harness::new();
    let target = harness.root().join("control/limits.cfg");

    let denied = harness
        .gate
        .request_write("control/limits.cfg", "max=1\n", "tighten")
        .await
        .unwrap();
    harness.gate.deny(&denied.id).await.unwrap();
    assert!(!target.exists());

    for result in [
        harness.gate.approve(&denied.id).await,
        harness.gate.deny(&denied.id).await,
    ] {
        assert!(matches!(
            result,
            Err(GateError::AlreadyResolved {
                status: ApprovalStatus::Denied,
                ..
            })
        ));
    }
    assert!(!target.exists());

    let approved = harness
        .gate
        .request_write("control/limits.cfg", "max=2\n", "loosen")
        .await
        .unwrap();
    harness.gate.approve(&approved.id).await.unwrap();
    std::fs::write(&target, b"edited by hand\n").unwrap();

    assert!(matches!(
        harness.gate.approve(&approved.id).await,
        Err(GateError::AlreadyResolved { .. })
    ));
    assert_eq!(std::fs::read(&target).unwrap(), b"edited by hand\n");
}

// ============================================================================
// Crash recovery
// ============================================================================

#[tokio::test]
async fn test_running_step_is_interrupted_after_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.json");

    let stale_id = {
        let (store, interrupted) = StateStore::open(&path, 100).await.unwrap();
        assert_eq!(interrupted, 0);
        let id = store
            .record_step(BuildStep::new("builder", "write api"))
            .await
            .unwrap();
        store.update_step(&id, StepStatus::Running, None).await.unwrap();
        id
        // Dropped while running
    };

    let (store, interrupted) = StateStore::open(&path, 100).await.unwrap();
    assert_eq!(interrupted, 1);
    assert_eq!(
        store.get_step(&stale_id).await.unwrap().status,
        StepStatus::Interrupted
    );

    let mut retry = BuildStep::new("builder", "write api");
    retry.id = stale_id.clone();
    let new_id = store.record_step(retry).await.unwrap();
    assert_ne!(new_id, stale_id);
    assert_eq!(store.query_steps(None).await.len(), 2);
}

// ============================================================================
// Build loop
// ============================================================================

/// Worker that writes the file named on the goal's "Target file:" line.
fn file_writing_worker() -> Arc<ScriptedWorker> {
    ScriptedWorker::new(|task, _| {
        let files: Vec<Value> = task
            .lines()
            .filter_map(|l| l.strip_prefix("Target file: "))
            .map(|p| {
                json!({
                    "path": p.trim_end_matches('.'),
                    "content": "pub fn generated() -> u32 { 42 }\n"
                })
            })
            .collect();
        Ok(WorkerOutput {
            output: "generated".into(),
            structured_result: Some(json!({ "files": files })),
        })
    })
}

fn target(name: &str, file: &str) -> CapabilityTarget {
    CapabilityTarget::new(
        Capability::new(name, format!("{} module", name)).with_file(file),
        Arc::new(NonTrivialContent::default()),
    )
}

#[tokio::test]
async fn test_only_missing_capability_is_resolved() {
    let harness = Harness::new();
    let present = harness.root().join("src/b.rs");
    std::fs::create_dir_all(present.parent().unwrap()).unwrap();
    std::fs::write(&present, b"pub fn b() -> u32 { 2 }\n").unwrap();

    let worker = file_writing_worker();
    let orch = harness
        .orchestrator(worker.clone(), vec![])
        .with_complexity(Arc::new(NeverComplex));
    let build_loop = BuildLoop::new(Arc::new(orch), harness.root());

    let summary = build_loop
        .run_until_converged(&[target("A", "src/a.rs"), target("B", "src/b.rs")], 5)
        .await
        .unwrap();

    assert!(summary.converged);
    assert_eq!(summary.iterations, 1);
    assert_eq!(summary.resolved, vec!["A"]);

    let tasks = worker.tasks();
    assert_eq!(tasks.len(), 1);
    assert!(tasks[0].contains("src/a.rs"));
    assert_eq!(std::fs::read(&present).unwrap(), b"pub fn b() -> u32 { 2 }\n");

    let capabilities = harness.store.list_capabilities().await;
    assert!(capabilities.iter().all(|c| c.implemented));
}

#[tokio::test]
async fn test_failing_worker_hits_iteration_cap() {
    let harness = Harness::new();
    let worker = ScriptedWorker::new(|_, _| Err(WorkerError::Transient("rate limited".into())));
    let orch = harness
        .orchestrator(worker.clone(), vec![])
        .with_complexity(Arc::new(NeverComplex));
    let build_loop = BuildLoop::new(Arc::new(orch), harness.root());

    let summary = build_loop
        .run_until_converged(&[target("A", "src/a.rs")], 2)
        .await
        .unwrap();

    assert_eq!(summary.status, LoopStatus::Incomplete);
    assert!(!summary.converged);
    assert_eq!(summary.iterations, 2);
    assert_eq!(summary.remaining, vec!["A"]);
    assert_eq!(worker.tasks().len(), 2);
}

#[tokio::test]
async fn test_protected_capability_converges_after_approval() {
    let harness = Harness::new();
    let worker = file_writing_worker();
    let orch = Arc::new(
        harness
            .orchestrator(worker, vec![])
            .with_complexity(Arc::new(NeverComplex)),
    );
    let build_loop = BuildLoop::new(orch, harness.root());
    let targets = [target("core", "control/core.cfg")];

    let summary = build_loop.run_until_converged(&targets, 4).await.unwrap();
    assert_eq!(summary.status, LoopStatus::Incomplete);
    assert_eq!(summary.iterations, 1);
    assert_eq!(summary.pending_approvals.len(), 1);
    assert!(!harness.root().join("control/core.cfg").exists());
    // One request for the file, however many iterations were allowed
    let records = harness.gate.list_approvals(None).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].file_path, "control/core.cfg");

    harness
        .gate
        .approve(&summary.pending_approvals[0])
        .await
        .unwrap();

    let summary = build_loop.run_until_converged(&targets, 1).await.unwrap();
    assert!(summary.converged);
    assert_eq!(summary.iterations, 0);
}

// ============================================================================
// Durable build loop
// ============================================================================

fn durable_gate(root: &Path) -> Arc<ApprovalGate> {
    Arc::new(ApprovalGate::new(
        root,
        root.join(".build-forge/approvals"),
        ProtectionRules::default(),
    ))
}

fn implemented_on_disk(snapshot: &Value, name: &str) -> Option<bool> {
    snapshot["capabilities"]
        .as_array()?
        .iter()
        .find(|c| c["name"] == name)
        .and_then(|c| c["implemented"].as_bool())
}

#[tokio::test]
async fn test_finished_iteration_survives_on_disk() {
    let dir = tempdir().unwrap();
    let state_path = dir.path().join(".build-forge/state.json");
    let (store, _) = StateStore::open(&state_path, 100).await.unwrap();

    // What a crash at the start of each worker call would leave behind
    let seen: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let worker = {
        let seen = seen.clone();
        let state_path = state_path.clone();
        ScriptedWorker::new(move |task, _| {
            let raw = std::fs::read_to_string(&state_path).unwrap();
            seen.lock().unwrap().push(serde_json::from_str(&raw).unwrap());
            if task.contains("src/a.rs") {
                Ok(WorkerOutput {
                    output: "generated".into(),
                    structured_result: Some(json!({
                        "files": [{ "path": "src/a.rs", "content": "pub fn a() -> u32 { 1 }\n" }]
                    })),
                })
            } else {
                Err(WorkerError::Transient("no capacity".into()))
            }
        })
    };
    let orch = Orchestrator::new(
        worker.clone(),
        Arc::new(FixedPhases(vec![])),
        Arc::new(store),
        durable_gate(dir.path()),
    )
    .with_complexity(Arc::new(NeverComplex));
    let build_loop = BuildLoop::new(Arc::new(orch), dir.path());

    let summary = build_loop
        .run_until_converged(&[target("A", "src/a.rs"), target("B", "src/b.rs")], 2)
        .await
        .unwrap();
    assert_eq!(summary.status, LoopStatus::Incomplete);
    assert_eq!(summary.iterations, 2);

    // Calls: A and B in iteration 1, B again in iteration 2
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 3);
    assert_eq!(implemented_on_disk(&seen[0], "A"), Some(false));
    assert_eq!(implemented_on_disk(&seen[2], "A"), Some(true));
    assert_eq!(implemented_on_disk(&seen[2], "B"), Some(false));

    let snapshot = SystemState::load_snapshot(&state_path).await.unwrap().unwrap();
    assert_eq!(snapshot.implemented_count(), 1);
    assert_eq!(snapshot.count_steps(StepStatus::Completed), 1);
    assert_eq!(snapshot.count_steps(StepStatus::Failed), 2);
    assert_eq!(snapshot.generated_files, vec!["src/a.rs"]);
}

#[tokio::test]
async fn test_unrecoverable_resolve_error_stops_loop() {
    let dir = tempdir().unwrap();
    let state_path = dir.path().join(".build-forge/state.json");
    let (store, _) = StateStore::open(&state_path, 100).await.unwrap();

    let worker = file_writing_worker();
    let orch = Orchestrator::new(
        worker.clone(),
        Arc::new(FixedPhases(vec!["scaffold", "fill in"])),
        Arc::new(store),
        durable_gate(dir.path()),
    )
    .with_complexity(CountingPolicy::new(true))
    .with_guardrails(Guardrails {
        max_depth: 0,
        ..Default::default()
    });
    let build_loop = BuildLoop::new(Arc::new(orch), dir.path());

    let summary = build_loop
        .run_until_converged(&[target("A", "src/a.rs"), target("B", "src/b.rs")], 5)
        .await
        .unwrap();

    match &summary.status {
        LoopStatus::Failed { error } => assert!(error.contains("Recursion limit")),
        other => panic!("expected failure, got {:?}", other),
    }
    assert!(!summary.converged);
    assert_eq!(summary.iterations, 1);
    assert_eq!(summary.remaining, vec!["A", "B"]);
    // The loop stopped at A; B was never attempted
    assert!(worker.tasks().is_empty());

    let snapshot = SystemState::load_snapshot(&state_path).await.unwrap().unwrap();
    assert_eq!(snapshot.capabilities.len(), 2);
    assert_eq!(snapshot.implemented_count(), 0);
    assert_eq!(snapshot.build_steps.len(), 1);
    assert_eq!(snapshot.build_steps[0].agent, "planner");
    assert_eq!(snapshot.build_steps[0].status, StepStatus::Completed);
}
