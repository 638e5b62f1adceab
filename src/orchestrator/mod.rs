pub mod complexity;
pub mod context;
pub mod engine;
pub mod error;
pub mod guardrails;
pub mod loop_controller;
pub mod state;
pub mod writes;

pub use complexity::{ComplexityPolicy, KeywordComplexity, NeverComplex};
pub use context::{OrchestrationContext, PhaseResult, RunMode};
pub use engine::{Orchestrator, Outcome, OutcomeKind, OutcomeStatus};
pub use error::OrchestratorError;
pub use guardrails::{GuardrailHardStop, Guardrails, GuardrailsConfig};
pub use loop_controller::{BuildLoop, CapabilityTarget};
pub use state::{BuildSummary, LoopState, LoopStatus};
pub use writes::{FileWrite, WriteReceipt, extract_file_writes};
