mod capabilities;
mod settings;

pub use capabilities::{CapabilitiesFile, CapabilitySpec, ValidatorSpec};
pub use settings::{
    AgentConfig, ApprovalConfig, BuildLoopConfig, CONFIG_FILE_NAMES, CliConfig, ComplexityConfig,
    GuardrailsConfig, OrchestratorConfig, StateConfig,
};
