//! Guardrails: hard limits on recursion, iterations and worker time.
//!
//! Guardrails enforce **hard stops** that no worker output can bypass:
//! - Recursion depth ceiling for decomposed tasks
//! - Maximum build-loop iterations
//! - Worker invocation timeout
//!
//! A hard stop is never retried. The boundary that can act on it (the
//! orchestrator for depth, the build loop for iterations) turns it into a
//! structured result.

use serde::{Deserialize, Serialize};
use std::time::Duration;

// Re-export from config for convenience
pub use crate::config::GuardrailsConfig;

// ============================================================================
// Hard Stops (non-bypassable limits)
// ============================================================================

/// Hard stops that end the current run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum GuardrailHardStop {
    /// A run was requested deeper than the configured ceiling
    RecursionLimitExceeded { depth: u32, limit: u32 },
    /// The build loop used up its iteration budget
    MaxIterationsExceeded { iteration: u32, limit: u32 },
}

impl std::fmt::Display for GuardrailHardStop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GuardrailHardStop::RecursionLimitExceeded { depth, limit } => {
                write!(f, "recursion depth {} exceeds limit {}", depth, limit)
            }
            GuardrailHardStop::MaxIterationsExceeded { iteration, limit } => {
                write!(f, "iteration {} reached limit {}", iteration, limit)
            }
        }
    }
}

// ============================================================================
// Guardrails Configuration
// ============================================================================

/// Numeric limits and the checks that enforce them.
#[derive(Debug, Clone)]
pub struct Guardrails {
    /// Deepest allowed `run` depth (top-level calls are depth 0)
    pub max_depth: u32,
    /// Build-loop iterations before reporting incomplete
    pub max_iterations: u32,
    /// Upper bound on a single worker invocation
    pub worker_timeout: Duration,
}

impl Default for Guardrails {
    fn default() -> Self {
        Self {
            max_depth: 2,
            max_iterations: 10,
            worker_timeout: Duration::from_secs(600), // 10 minutes
        }
    }
}

impl Guardrails {
    /// Create guardrails from configuration.
    pub fn from_config(config: &GuardrailsConfig) -> Self {
        Self {
            max_depth: config.max_depth,
            max_iterations: config.max_iterations,
            worker_timeout: Duration::from_secs(config.worker_timeout_secs.max(1)),
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    // ========================================================================
    // Hard Stop Checks
    // ========================================================================

    /// Check before starting a `run` at `depth`.
    pub fn check_depth(&self, depth: u32) -> Result<(), GuardrailHardStop> {
        if depth > self.max_depth {
            return Err(GuardrailHardStop::RecursionLimitExceeded {
                depth,
                limit: self.max_depth,
            });
        }
        Ok(())
    }

    /// Check before starting another build-loop iteration, given how many
    /// have already completed.
    pub fn check_before_iteration(&self, completed: u32) -> Result<(), GuardrailHardStop> {
        if completed >= self.max_iterations {
            return Err(GuardrailHardStop::MaxIterationsExceeded {
                iteration: completed,
                limit: self.max_iterations,
            });
        }
        Ok(())
    }
}
