//! Build-Forge MCP Server implementation.
//!
//! The human decision channel for protected writes, plus read-only build
//! status. Decisions are written to the same approval records the build
//! process reads, so they take effect on its next gate call.

use rmcp::{
    ServerHandler,
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{
        CallToolResult, Content, ErrorCode, ErrorData, Implementation, Role, ServerCapabilities,
        ServerInfo,
    },
    schemars::JsonSchema,
    tool, tool_handler, tool_router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::approval::{ApprovalGate, GateError};
use crate::config::CliConfig;
use crate::models::{ApprovalStatus, BuildStep, PendingApproval, StepStatus};
use crate::store::SystemState;

use super::status::load_status;

// ============================================================================
// Tool Parameters
// ============================================================================

/// Parameters for the approvals_list tool
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ApprovalsListParams {
    /// Filter by status: "pending", "approved" or "denied". Defaults to pending.
    pub status: Option<String>,
}

/// Parameters for tools addressing one approval
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ApprovalIdParams {
    /// Approval identifier
    pub id: String,
}

/// Parameters for the steps_list tool
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct StepsListParams {
    /// Filter by status: pending, running, completed, failed or interrupted
    pub status: Option<String>,
    /// Maximum number of most recent steps to return (default: 20)
    pub limit: Option<u32>,
}

/// Approval without its proposed content
#[derive(Debug, Serialize)]
struct ApprovalSummary<'a> {
    id: &'a str,
    file_path: &'a str,
    reason: &'a str,
    status: ApprovalStatus,
    requested_at: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reviewed_at: Option<&'a str>,
    content_bytes: usize,
}

impl<'a> From<&'a PendingApproval> for ApprovalSummary<'a> {
    fn from(approval: &'a PendingApproval) -> Self {
        Self {
            id: &approval.id,
            file_path: &approval.file_path,
            reason: &approval.reason,
            status: approval.status,
            requested_at: &approval.requested_at,
            reviewed_at: approval.reviewed_at.as_deref(),
            content_bytes: approval.content.len(),
        }
    }
}

// ============================================================================
// Server Implementation
// ============================================================================

/// Build-Forge MCP Server
#[derive(Clone)]
pub struct BuildForgeServer {
    tool_router: ToolRouter<Self>,
    config: Arc<CliConfig>,
    gate: Arc<ApprovalGate>,
}

#[tool_handler(router = self.tool_router)]
impl ServerHandler for BuildForgeServer {
    fn get_info(&self) -> ServerInfo {
        let instructions = format!(
            r#"Build-Forge: approval channel and status for a self-building project.

Writes to protected files are held as pending approvals until a human decides.

Available tools:
- approvals_list: List approval requests (pending by default)
- approval_get: Show one request including the proposed file content
- approval_approve: Apply the proposed content and mark the request approved
- approval_deny: Discard the proposed content and mark the request denied
- build_status: Derived build status (capabilities, steps, pending approvals)
- steps_list: Recent build steps

Project root: {}
"#,
            self.config.project_root.display()
        );

        ServerInfo {
            server_info: Implementation {
                name: "build-forge".to_string(),
                version: env!("CARGO_PKG_VERSION").to_owned(),
                title: Some("Build-Forge".to_string()),
                icons: None,
                website_url: None,
            },
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            instructions: Some(instructions),
            ..Default::default()
        }
    }
}

#[tool_router(router = tool_router)]
impl BuildForgeServer {
    /// Create with the given configuration (env overrides are the caller's choice)
    pub fn with_config(config: CliConfig) -> anyhow::Result<Self> {
        let gate = config.approval_gate()?;
        Ok(Self {
            tool_router: Self::tool_router(),
            config: Arc::new(config),
            gate: Arc::new(gate),
        })
    }

    /// Create with auto-detected config and `BUILD_FORGE_*` overrides.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::with_config(CliConfig::load_with_env(None)?)
    }

    // ========================================================================
    // Approval Tools
    // ========================================================================

    #[tool(
        name = "approvals_list",
        description = "List approval requests for protected file writes. Optional status filter: pending (default), approved, denied, or all."
    )]
    pub async fn approvals_list(
        &self,
        params: Parameters<ApprovalsListParams>,
    ) -> Result<CallToolResult, ErrorData> {
        let filter = match params.0.status.as_deref() {
            None => Some(ApprovalStatus::Pending),
            Some("all") => None,
            Some(s) => Some(s.parse::<ApprovalStatus>().map_err(|e| {
                ErrorData::new(ErrorCode::INVALID_PARAMS, e.to_string(), None)
            })?),
        };

        let approvals = self.gate.list_approvals(filter).await.map_err(gate_error)?;
        let summaries: Vec<ApprovalSummary<'_>> = approvals.iter().map(Into::into).collect();
        json_result(&summaries)
    }

    #[tool(
        name = "approval_get",
        description = "Show one approval request, including the full proposed content of the file."
    )]
    pub async fn approval_get(
        &self,
        params: Parameters<ApprovalIdParams>,
    ) -> Result<CallToolResult, ErrorData> {
        let approval = self.gate.get_approval(&params.0.id).await.map_err(gate_error)?;
        json_result(&approval)
    }

    #[tool(
        name = "approval_approve",
        description = "Approve a pending request: writes the proposed content to the protected file and marks the request approved."
    )]
    pub async fn approval_approve(
        &self,
        params: Parameters<ApprovalIdParams>,
    ) -> Result<CallToolResult, ErrorData> {
        let approval = self.gate.approve(&params.0.id).await.map_err(gate_error)?;
        json_result(&ApprovalSummary::from(&approval))
    }

    #[tool(
        name = "approval_deny",
        description = "Deny a pending request: discards the proposed content. The protected file is not touched."
    )]
    pub async fn approval_deny(
        &self,
        params: Parameters<ApprovalIdParams>,
    ) -> Result<CallToolResult, ErrorData> {
        let approval = self.gate.deny(&params.0.id).await.map_err(gate_error)?;
        json_result(&ApprovalSummary::from(&approval))
    }

    // ========================================================================
    // Read-Only Tools
    // ========================================================================

    #[tool(
        name = "build_status",
        description = "Get the build status: not_started, in_progress, awaiting_approval, interrupted, complete or incomplete, with capability and step counts."
    )]
    pub async fn build_status(&self) -> Result<CallToolResult, ErrorData> {
        let info = load_status(&self.config.state_path(), &self.gate)
            .await
            .map_err(|e| {
                ErrorData::new(
                    ErrorCode::INTERNAL_ERROR,
                    format!("Failed to derive status: {}", e),
                    None,
                )
            })?;
        json_result(&info)
    }

    #[tool(
        name = "steps_list",
        description = "List the most recent build steps, optionally filtered by status."
    )]
    pub async fn steps_list(
        &self,
        params: Parameters<StepsListParams>,
    ) -> Result<CallToolResult, ErrorData> {
        let status = params
            .0
            .status
            .as_deref()
            .map(str::parse::<StepStatus>)
            .transpose()
            .map_err(|e| ErrorData::new(ErrorCode::INVALID_PARAMS, e.to_string(), None))?;
        let limit = params.0.limit.unwrap_or(20) as usize;

        let snapshot = SystemState::load_snapshot(&self.config.state_path())
            .await
            .map_err(|e| {
                ErrorData::new(
                    ErrorCode::INTERNAL_ERROR,
                    format!("Failed to read state: {}", e),
                    None,
                )
            })?
            .unwrap_or_default();

        let steps: Vec<&BuildStep> = snapshot
            .build_steps
            .iter()
            .filter(|s| status.is_none_or(|wanted| s.status == wanted))
            .collect();
        let recent = &steps[steps.len().saturating_sub(limit)..];
        json_result(&recent)
    }
}

fn gate_error(e: GateError) -> ErrorData {
    let code = if e.is_client_error() {
        ErrorCode::INVALID_PARAMS
    } else {
        ErrorCode::INTERNAL_ERROR
    };
    ErrorData::new(code, e.to_string(), None)
}

fn json_result<T: Serialize + ?Sized>(value: &T) -> Result<CallToolResult, ErrorData> {
    let response = serde_json::to_string_pretty(value).map_err(|e| {
        ErrorData::new(
            ErrorCode::INTERNAL_ERROR,
            format!("Failed to serialize response: {}", e),
            None,
        )
    })?;

    Ok(CallToolResult::success(vec![
        Content::text(response).with_audience(vec![Role::Assistant]),
    ]))
}
