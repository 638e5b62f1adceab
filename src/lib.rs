pub mod approval;
pub mod config;
pub mod mcp;
pub mod models;
pub mod orchestrator;
pub mod output;
pub mod prompts;
pub mod store;
pub mod workers;

// Re-export main types
pub use approval::{ApprovalGate, GateError, ProtectionRules};
pub use config::{CapabilitySpec, CliConfig, ValidatorSpec};
pub use models::{ApprovalStatus, BuildStep, Capability, PendingApproval, StepStatus};
pub use orchestrator::{
    BuildLoop, BuildSummary, CapabilityTarget, ComplexityPolicy, Guardrails, KeywordComplexity,
    LoopStatus, OrchestrationContext, Orchestrator, OrchestratorError, Outcome, RunMode,
};
pub use prompts::{GoalTemplate, resolve_goal_template};
pub use store::{StateStore, StoreError, SystemState};
pub use workers::{
    CommandDecomposer, CommandSpec, CommandWorker, Decomposer, Validator, Worker, WorkerError,
    WorkerOutput,
};

// Re-export MCP server
pub use mcp::{BuildForgeServer, BuildStatus};
