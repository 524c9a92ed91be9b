//! Audit trail of state-changing operations
//!
//! Writes JSON lines to `<state dir>/cairn/audit.log`: every lockfile
//! change and every cache eviction, so a pinned digest or a vanished entry
//! can be traced back to the command that caused it.

use crate::cache::{CacheEntry, GcReport, PruneReport};
use crate::config::{schema::Config, ConfigManager};
use crate::lockfile::{RecordOutcome, ResolverCall};
use chrono::Utc;
use serde_json::json;
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// File-based audit logger that appends JSON lines
pub struct AuditLog {
    enabled: bool,
    path: PathBuf,
}

impl AuditLog {
    /// Create a new audit logger from config
    pub fn new(config: &Config) -> Self {
        Self {
            enabled: config.general.audit_log,
            path: ConfigManager::audit_log_path(),
        }
    }

    /// Logger writing to an explicit path
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            enabled: true,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// A lockfile key was written
    pub async fn lock_recorded(&self, call: &ResolverCall, output: &str, outcome: &RecordOutcome) {
        let (event, previous) = match outcome {
            RecordOutcome::Unchanged => return,
            RecordOutcome::Inserted => ("lock.insert", None),
            RecordOutcome::Replaced { previous } => ("lock.replace", Some(previous.as_str())),
        };
        self.log(
            event,
            &json!({
                "call": call.to_string(),
                "output": output,
                "previous": previous,
            }),
        )
        .await;
    }

    /// An explicit prune finished
    pub async fn pruned(&self, report: &PruneReport) {
        self.log(
            "cache.prune",
            &json!({
                "evicted": evicted_ids(&report.evicted),
                "freed_bytes": report.freed_bytes,
                "skipped": report.skipped.len(),
            }),
        )
        .await;
    }

    /// A GC pass evicted something
    pub async fn collected(&self, report: &GcReport) {
        if report.eviction.evicted.is_empty() {
            return;
        }
        self.log(
            "cache.gc",
            &json!({
                "keep_bytes": report.keep_bytes,
                "usage_before": report.usage_before,
                "usage_after": report.usage_after,
                "evicted": evicted_ids(&report.eviction.evicted),
            }),
        )
        .await;
    }

    /// Log an audit event as a JSON line
    ///
    /// Drops events on IO failure; auditing never fails the operation
    /// being audited.
    pub async fn log(&self, event: &str, data: &serde_json::Value) {
        if !self.enabled {
            return;
        }

        let entry = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "event": event,
            "data": data,
        });

        let mut line = match serde_json::to_string(&entry) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to serialize audit event: {}", e);
                return;
            }
        };
        line.push('\n');

        if let Err(e) = self.append(&line).await {
            warn!("Failed to write audit log: {}", e);
        }
    }

    async fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

fn evicted_ids(entries: &[CacheEntry]) -> Vec<&str> {
    entries.iter().map(|e| e.id.as_str()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_audit_log(dir: &TempDir, enabled: bool) -> AuditLog {
        AuditLog {
            enabled,
            path: dir.path().join("audit.log"),
        }
    }

    async fn lines(audit: &AuditLog) -> Vec<serde_json::Value> {
        let content = tokio::fs::read_to_string(&audit.path).await.unwrap();
        content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn records_lock_changes_but_not_noops() {
        let dir = TempDir::new().unwrap();
        let audit = test_audit_log(&dir, true);
        let call = ResolverCall::http_get("https://example.com/a.tgz");

        audit
            .lock_recorded(&call, "sha256:1", &RecordOutcome::Inserted)
            .await;
        audit
            .lock_recorded(&call, "sha256:1", &RecordOutcome::Unchanged)
            .await;
        audit
            .lock_recorded(
                &call,
                "sha256:2",
                &RecordOutcome::Replaced {
                    previous: "sha256:1".to_string(),
                },
            )
            .await;

        let lines = lines(&audit).await;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "lock.insert");
        assert_eq!(lines[1]["event"], "lock.replace");
        assert_eq!(lines[1]["data"]["previous"], "sha256:1");
        assert!(lines[0]["timestamp"].is_string());
    }

    #[tokio::test]
    async fn records_prune() {
        let dir = TempDir::new().unwrap();
        let audit = test_audit_log(&dir, true);
        audit
            .pruned(&PruneReport {
                freed_bytes: 42,
                ..PruneReport::default()
            })
            .await;

        let lines = lines(&audit).await;
        assert_eq!(lines[0]["event"], "cache.prune");
        assert_eq!(lines[0]["data"]["freed_bytes"], 42);
    }

    #[tokio::test]
    async fn skips_when_disabled() {
        let dir = TempDir::new().unwrap();
        let audit = test_audit_log(&dir, false);

        audit.log("should.not.appear", &serde_json::json!({})).await;

        assert!(!audit.path.exists());
    }
}
