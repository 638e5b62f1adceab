use serde::{Deserialize, Serialize};

/// Decision state of a deferred write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Denied => "denied",
        }
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for ApprovalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(ApprovalStatus::Pending),
            "approved" => Ok(ApprovalStatus::Approved),
            "denied" => Ok(ApprovalStatus::Denied),
            other => Err(format!("unknown approval status '{}'", other)),
        }
    }
}

/// A queued file write awaiting a human decision.
///
/// `content` is the full replacement for `file_path`, not a diff. It is
/// cleared when the request is denied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingApproval {
    pub id: String,
    pub file_path: String,
    #[serde(default)]
    pub reason: String,
    pub content: String,
    /// RFC 3339
    pub requested_at: String,
    pub status: ApprovalStatus,
    /// RFC 3339, set once the request is resolved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewed_at: Option<String>,
}

impl PendingApproval {
    /// New pending request with a short identifier.
    pub fn new(file_path: impl Into<String>, content: impl Into<String>, reason: impl Into<String>) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        Self {
            id,
            file_path: file_path.into(),
            reason: reason.into(),
            content: content.into(),
            requested_at: chrono::Utc::now().to_rfc3339(),
            status: ApprovalStatus::Pending,
            reviewed_at: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == ApprovalStatus::Pending
    }

    pub(crate) fn resolve(&mut self, status: ApprovalStatus) {
        self.status = status;
        self.reviewed_at = Some(chrono::Utc::now().to_rfc3339());
        if status == ApprovalStatus::Denied {
            self.content.clear();
        }
    }
}
