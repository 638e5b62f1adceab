use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::models::{ApprovalStatus, PendingApproval};
use crate::output::{read_if_exists, write_atomic};

use super::{GateError, ProtectionRules};

/// Claims older than this were left behind by a decider that died mid-decision.
const STALE_CLAIM: Duration = Duration::from_secs(30);
const CLAIM_RETRY: Duration = Duration::from_millis(20);
const CLAIM_ATTEMPTS: u32 = 250;

/// Guards protected files from unreviewed modification.
///
/// Records live one JSON file per approval under `records_dir`, so a decision
/// taken by another process (CLI, MCP server) is seen on the next call. The
/// in-process lock orders calls within one gate; approve and deny also take
/// a `<id>.lock` claim file so gates in other processes cannot decide the
/// same record concurrently.
pub struct ApprovalGate {
    root: PathBuf,
    records_dir: PathBuf,
    rules: ProtectionRules,
    lock: Mutex<()>,
}

impl ApprovalGate {
    pub fn new(root: impl Into<PathBuf>, records_dir: impl Into<PathBuf>, rules: ProtectionRules) -> Self {
        Self {
            root: root.into(),
            records_dir: records_dir.into(),
            rules,
            lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn rules(&self) -> &ProtectionRules {
        &self.rules
    }

    pub fn is_protected(&self, path: &str) -> bool {
        self.rules.is_protected(path)
    }

    /// Normalize a requested path and resolve it under the project root.
    fn resolve_target(&self, path: &str) -> Result<(String, PathBuf), GateError> {
        let normalized = ProtectionRules::normalize(path);
        if normalized.is_empty() || ProtectionRules::escapes_root(&normalized) {
            return Err(GateError::OutsideRoot(path.to_string()));
        }
        if self.rules.is_forbidden(&normalized) {
            return Err(GateError::Forbidden(normalized));
        }
        let target = self.root.join(&normalized);
        Ok((normalized, target))
    }

    /// Write `content` to `path`, or defer it when the path is protected.
    ///
    /// Protected paths get a persisted pending record and the filesystem is
    /// left untouched. Other paths are written immediately and an
    /// already-approved record describing the write is returned.
    pub async fn request_write(
        &self,
        path: &str,
        content: &str,
        reason: &str,
    ) -> Result<PendingApproval, GateError> {
        let (normalized, target) = self.resolve_target(path)?;

        if self.rules.is_protected(&normalized) {
            let _guard = self.lock.lock().await;
            let approval = PendingApproval::new(&normalized, content, reason);
            self.save_record(&approval).await?;
            info!(
                "Write to protected path {} queued for approval ({})",
                normalized, approval.id
            );
            return Ok(approval);
        }

        write_atomic(&target, content.as_bytes())
            .await
            .map_err(|source| GateError::Io {
                path: target.clone(),
                source,
            })?;
        debug!("Wrote {} ({} bytes)", normalized, content.len());

        let mut approval = PendingApproval::new(&normalized, content, reason);
        approval.resolve(ApprovalStatus::Approved);
        Ok(approval)
    }

    /// All persisted approvals, oldest first, optionally filtered by status.
    pub async fn list_approvals(
        &self,
        status: Option<ApprovalStatus>,
    ) -> Result<Vec<PendingApproval>, GateError> {
        let _guard = self.lock.lock().await;

        let mut entries = match fs::read_dir(&self.records_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(GateError::Io {
                    path: self.records_dir.clone(),
                    source,
                });
            }
        };

        let mut approvals = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|source| GateError::Io {
            path: self.records_dir.clone(),
            source,
        })? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.read_record(&path).await {
                Ok(Some(approval)) => {
                    if status.is_none_or(|wanted| approval.status == wanted) {
                        approvals.push(approval);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable approval record {:?}: {}", path, e),
            }
        }

        approvals.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));
        Ok(approvals)
    }

    pub async fn get_approval(&self, id: &str) -> Result<PendingApproval, GateError> {
        let _guard = self.lock.lock().await;
        self.load_record(id)
            .await?
            .ok_or_else(|| GateError::NotFound(id.to_string()))
    }

    /// Apply the stored content to the target and mark the record approved.
    ///
    /// If the write fails the record stays pending.
    pub async fn approve(&self, id: &str) -> Result<PendingApproval, GateError> {
        let _guard = self.lock.lock().await;
        let _claim = self.claim(id).await?;
        let mut approval = self.pending_record(id).await?;

        let (_, target) = self.resolve_target(&approval.file_path)?;
        write_atomic(&target, approval.content.as_bytes())
            .await
            .map_err(|source| GateError::Io {
                path: target.clone(),
                source,
            })?;

        approval.resolve(ApprovalStatus::Approved);
        self.save_record(&approval).await?;
        info!("Approved {} -> {}", approval.id, approval.file_path);
        Ok(approval)
    }

    /// Mark the record denied and discard its content. Never touches the target.
    pub async fn deny(&self, id: &str) -> Result<PendingApproval, GateError> {
        let _guard = self.lock.lock().await;
        let _claim = self.claim(id).await?;
        let mut approval = self.pending_record(id).await?;

        approval.resolve(ApprovalStatus::Denied);
        self.save_record(&approval).await?;
        info!("Denied {} ({})", approval.id, approval.file_path);
        Ok(approval)
    }

    // ========================================================================
    // Record storage (callers hold the lock)
    // ========================================================================

    /// Take the cross-process claim on one record, waiting briefly while
    /// another decider holds it.
    async fn claim(&self, id: &str) -> Result<RecordClaim, GateError> {
        let path = self
            .record_path(id)
            .ok_or_else(|| GateError::NotFound(id.to_string()))?
            .with_extension("lock");

        for _ in 0..CLAIM_ATTEMPTS {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => return Ok(RecordClaim { path }),
                // No records dir means no record
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(GateError::NotFound(id.to_string()));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if claim_is_stale(&path).await {
                        warn!("Removing stale approval claim {:?}", path);
                        let _ = fs::remove_file(&path).await;
                        continue;
                    }
                    tokio::time::sleep(CLAIM_RETRY).await;
                }
                Err(source) => return Err(GateError::Io { path, source }),
            }
        }
        Err(GateError::Busy(id.to_string()))
    }

    async fn pending_record(&self, id: &str) -> Result<PendingApproval, GateError> {
        let approval = self
            .load_record(id)
            .await?
            .ok_or_else(|| GateError::NotFound(id.to_string()))?;

        if !approval.is_pending() {
            return Err(GateError::AlreadyResolved {
                id: id.to_string(),
                status: approval.status,
            });
        }
        Ok(approval)
    }

    fn record_path(&self, id: &str) -> Option<PathBuf> {
        let valid = !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
        valid.then(|| self.records_dir.join(format!("{}.json", id)))
    }

    async fn load_record(&self, id: &str) -> Result<Option<PendingApproval>, GateError> {
        match self.record_path(id) {
            Some(path) => self.read_record(&path).await,
            None => Ok(None),
        }
    }

    async fn read_record(&self, path: &Path) -> Result<Option<PendingApproval>, GateError> {
        let bytes = read_if_exists(path).await.map_err(|source| GateError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        match bytes {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn save_record(&self, approval: &PendingApproval) -> Result<(), GateError> {
        let path = self
            .record_path(&approval.id)
            .ok_or_else(|| GateError::NotFound(approval.id.clone()))?;
        let json = serde_json::to_string_pretty(approval)?;
        write_atomic(&path, json.as_bytes())
            .await
            .map_err(|source| GateError::Io { path, source })
    }
}

/// Held while one gate decides a record; the claim file goes away on drop.
struct RecordClaim {
    path: PathBuf,
}

impl Drop for RecordClaim {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to release approval claim {:?}: {}", self.path, e);
        }
    }
}

async fn claim_is_stale(path: &Path) -> bool {
    fs::metadata(path)
        .await
        .ok()
        .and_then(|m| m.modified().ok())
        .and_then(|t| t.elapsed().ok())
        .is_some_and(|age| age > STALE_CLAIM)
}
