use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::models::{ApprovalStatus, PendingApproval};

/// A file a worker asked to write, taken from `structured_result.files`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FileWrite {
    pub path: String,
    pub content: String,
    #[serde(default)]
    pub reason: Option<String>,
}

/// What happened to one requested write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteReceipt {
    pub path: String,
    pub status: ApprovalStatus,
    /// Approval to decide on, for deferred writes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<String>,
}

impl WriteReceipt {
    pub fn is_pending(&self) -> bool {
        self.status == ApprovalStatus::Pending
    }
}

impl From<&PendingApproval> for WriteReceipt {
    fn from(approval: &PendingApproval) -> Self {
        Self {
            path: approval.file_path.clone(),
            status: approval.status,
            approval_id: approval.is_pending().then(|| approval.id.clone()),
        }
    }
}

/// File writes carried by a worker's structured result. Malformed entries
/// are skipped.
pub fn extract_file_writes(structured: Option<&Value>) -> Vec<FileWrite> {
    let Some(files) = structured.and_then(|v| v.get("files")).and_then(Value::as_array) else {
        return Vec::new();
    };

    files
        .iter()
        .filter_map(|entry| match serde_json::from_value::<FileWrite>(entry.clone()) {
            Ok(write) => Some(write),
            Err(e) => {
                warn!("Ignoring malformed file write: {}", e);
                None
            }
        })
        .collect()
}
