//! Garbage collection of cache entries
//!
//! Two paths reclaim space. `prune` is an explicit sweep of everything
//! inactive. The automatic pass runs at most once per interval and only
//! evicts while usage exceeds the keep-bytes budget, oldest use first.
//! Both claim an entry under the set's lock before deleting its object and
//! skip anything a session is holding.

use crate::cache::entry::{CacheEntry, EntryId};
use crate::cache::set::{CacheEntrySet, SkipReason};
use crate::cache::size::{format_bytes, KeepBytes};
use crate::cache::store::ObjectStore;
use crate::error::{CairnError, CairnResult};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Tunables for GC
#[derive(Debug, Clone, PartialEq)]
pub struct GcPolicy {
    pub keep_bytes: KeepBytes,
    /// Minimum time between automatic passes
    pub interval: Duration,
    /// How long a released entry stays off-limits
    pub settle_delay: Duration,
}

impl Default for GcPolicy {
    fn default() -> Self {
        Self {
            keep_bytes: KeepBytes::default(),
            interval: Duration::from_secs(60),
            settle_delay: Duration::from_millis(500),
        }
    }
}

impl GcPolicy {
    pub fn validate(&self) -> CairnResult<()> {
        if self.interval.is_zero() {
            return Err(CairnError::InvalidGcConfig(
                "interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// An entry left in place
#[derive(Debug, Clone, Serialize)]
pub struct Skipped {
    pub id: EntryId,
    pub description: String,
    pub reason: SkipReason,
}

/// Result of an eviction sweep
#[derive(Debug, Clone, Default, Serialize)]
pub struct PruneReport {
    pub evicted: Vec<CacheEntry>,
    pub freed_bytes: u64,
    pub skipped: Vec<Skipped>,
}

impl PruneReport {
    pub fn evicted_count(&self) -> usize {
        self.evicted.len()
    }
}

/// Result of one automatic pass
#[derive(Debug, Clone, Serialize)]
pub struct GcReport {
    pub keep_bytes: u64,
    pub usage_before: u64,
    pub usage_after: u64,
    #[serde(flatten)]
    pub eviction: PruneReport,
}

/// Applies a [`GcPolicy`] to a shared entry set
pub struct GcManager {
    entries: Arc<CacheEntrySet>,
    store: Arc<dyn ObjectStore>,
    storage_root: PathBuf,
    policy: GcPolicy,
    /// Serializes passes and remembers when the last one started
    last_pass: Mutex<Option<Instant>>,
}

impl GcManager {
    /// `storage_root` is where percentage budgets are measured
    pub fn new(
        entries: Arc<CacheEntrySet>,
        store: Arc<dyn ObjectStore>,
        storage_root: impl Into<PathBuf>,
        policy: GcPolicy,
    ) -> CairnResult<Self> {
        policy.validate()?;
        Ok(Self {
            entries,
            store,
            storage_root: storage_root.into(),
            policy,
            last_pass: Mutex::new(None),
        })
    }

    pub fn entries(&self) -> &Arc<CacheEntrySet> {
        &self.entries
    }

    pub fn policy(&self) -> &GcPolicy {
        &self.policy
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    /// The byte budget GC enforces right now
    pub fn resolved_keep_bytes(&self) -> CairnResult<u64> {
        self.policy.keep_bytes.resolve(&self.storage_root)
    }

    /// Evict every inactive entry
    pub async fn prune(&self) -> PruneReport {
        let _pass = self.last_pass.lock().await;
        let mut report = PruneReport::default();

        for entry in self.entries.active_entries() {
            report.skipped.push(Skipped {
                id: entry.id,
                description: entry.description,
                reason: SkipReason::StillActive,
            });
        }

        let candidates = self.entries.inactive_candidates(None);
        if candidates.is_empty() {
            return report;
        }
        if !self.policy.settle_delay.is_zero() {
            tokio::time::sleep(self.policy.settle_delay).await;
        }

        for id in &candidates {
            self.evict(id, None, &mut report).await;
        }

        info!(
            "Pruned {} entries, freed {}",
            report.evicted_count(),
            format_bytes(report.freed_bytes)
        );
        report
    }

    /// Run a pass now, ignoring the throttle
    pub async fn run_once(&self) -> CairnResult<GcReport> {
        let mut last = self.last_pass.lock().await;
        *last = Some(Instant::now());
        self.pass().await
    }

    /// Run a pass unless one started within the interval
    pub async fn maybe_run(&self) -> CairnResult<Option<GcReport>> {
        let mut last = self.last_pass.lock().await;
        if let Some(at) = *last {
            if at.elapsed() < self.policy.interval {
                return Ok(None);
            }
        }
        *last = Some(Instant::now());
        self.pass().await.map(Some)
    }

    /// Entries a pass would evict right now, without evicting them
    pub fn plan(&self) -> CairnResult<Vec<CacheEntry>> {
        let keep = self.resolved_keep_bytes()?;
        let mut usage = self.entries.disk_space_bytes();
        let mut planned = Vec::new();
        if usage <= keep {
            return Ok(planned);
        }

        for id in self.entries.inactive_candidates(Some(self.policy.settle_delay)) {
            if usage < keep {
                break;
            }
            if let Some(entry) = self.entries.get(&id) {
                usage = usage.saturating_sub(entry.disk_space_bytes);
                planned.push(entry);
            }
        }
        Ok(planned)
    }

    async fn pass(&self) -> CairnResult<GcReport> {
        let keep = self.resolved_keep_bytes()?;
        let usage_before = self.entries.disk_space_bytes();
        let mut eviction = PruneReport::default();

        if usage_before > keep {
            debug!(
                "Cache usage {} exceeds budget {}",
                format_bytes(usage_before),
                format_bytes(keep)
            );
            let settle = Some(self.policy.settle_delay);
            for id in self.entries.inactive_candidates(settle) {
                if self.entries.disk_space_bytes() < keep {
                    break;
                }
                self.evict(&id, settle, &mut eviction).await;
            }
        }

        let usage_after = self.entries.disk_space_bytes();
        if usage_after > keep {
            warn!(
                "Cache usage {} still exceeds budget {}; no more evictable entries",
                format_bytes(usage_after),
                format_bytes(keep)
            );
        }
        if !eviction.evicted.is_empty() {
            info!(
                "GC evicted {} entries, freed {}",
                eviction.evicted_count(),
                format_bytes(eviction.freed_bytes)
            );
        }

        Ok(GcReport {
            keep_bytes: keep,
            usage_before,
            usage_after,
            eviction,
        })
    }

    async fn evict(&self, id: &EntryId, settle: Option<Duration>, report: &mut PruneReport) {
        let entry = match self.entries.claim(id, settle) {
            Ok(entry) => entry,
            Err(reason) => {
                let description = self
                    .entries
                    .get(id)
                    .map(|e| e.description)
                    .unwrap_or_default();
                report.skipped.push(Skipped {
                    id: id.clone(),
                    description,
                    reason,
                });
                return;
            }
        };

        match self.store.remove(id).await {
            Ok(()) => {
                self.entries.finish_eviction(id);
                debug!("Evicted {} ({})", id, entry.description);
                report.freed_bytes += entry.disk_space_bytes;
                report.evicted.push(entry);
            }
            Err(e) => {
                warn!("Failed to remove cache object {}: {}", id, e);
                self.entries.abort_eviction(id);
                report.skipped.push(Skipped {
                    id: id.clone(),
                    description: entry.description,
                    reason: SkipReason::RemovalFailed(e.to_string()),
                });
            }
        }
    }

    /// Start the background task. It wakes every interval and whenever an
    /// entry is registered, and runs a pass if the throttle allows.
    pub fn spawn(self: &Arc<Self>) -> GcHandle {
        let (stop, mut stop_rx) = watch::channel(false);
        let manager = Arc::clone(self);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.policy.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!("GC task started (interval {:?})", manager.policy.interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = manager.entries.registered() => {}
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }

                match manager.maybe_run().await {
                    Ok(Some(report)) if !report.eviction.evicted.is_empty() => {
                        debug!("GC pass: {} -> {}", report.usage_before, report.usage_after)
                    }
                    Ok(_) => {}
                    Err(e) => warn!("GC pass failed, retrying next interval: {}", e),
                }
            }
            debug!("GC task stopped");
        });

        GcHandle { stop, task }
    }
}

/// Handle to the background GC task
pub struct GcHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl GcHandle {
    /// Stop the task and wait for the current pass to finish
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::store::DirObjectStore;
    use crate::session::SessionId;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<DirObjectStore>,
        manager: Arc<GcManager>,
    }

    impl Fixture {
        async fn new(keep: KeepBytes, settle: Duration) -> Self {
            let dir = TempDir::new().unwrap();
            let store = Arc::new(DirObjectStore::open(dir.path()).await.unwrap());
            let policy = GcPolicy {
                keep_bytes: keep,
                interval: Duration::from_millis(50),
                settle_delay: settle,
            };
            let manager = GcManager::new(
                Arc::new(CacheEntrySet::new()),
                store.clone(),
                dir.path(),
                policy,
            )
            .unwrap();
            Self {
                _dir: dir,
                store,
                manager: Arc::new(manager),
            }
        }

        fn entries(&self) -> &Arc<CacheEntrySet> {
            self.manager.entries()
        }

        async fn add(&self, description: &str, size: usize) -> CacheEntry {
            let id = EntryId::generate();
            self.store.put(&id, &vec![0u8; size]).await.unwrap();
            let entry = self
                .entries()
                .insert(id, description, size as u64)
                .unwrap();
            // distinct last_used_at values
            tokio::time::sleep(Duration::from_millis(2)).await;
            entry
        }
    }

    struct FailingStore;

    #[async_trait]
    impl ObjectStore for FailingStore {
        async fn put(&self, _id: &EntryId, bytes: &[u8]) -> CairnResult<u64> {
            Ok(bytes.len() as u64)
        }

        async fn get(&self, id: &EntryId) -> CairnResult<Vec<u8>> {
            Err(CairnError::EntryNotFound(id.to_string()))
        }

        async fn remove(&self, id: &EntryId) -> CairnResult<()> {
            Err(CairnError::io(
                format!("removing {}", id),
                std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
            ))
        }
    }

    #[test]
    fn zero_interval_is_invalid() {
        let policy = GcPolicy {
            interval: Duration::ZERO,
            ..GcPolicy::default()
        };
        assert!(matches!(
            policy.validate(),
            Err(CairnError::InvalidGcConfig(_))
        ));
    }

    #[tokio::test]
    async fn prune_evicts_inactive_and_reports_active() {
        let fx = Fixture::new(KeepBytes::Absolute(0), Duration::ZERO).await;
        let idle = fx.add("idle", 100).await;
        let busy = fx.add("busy", 50).await;
        let _lease = fx.entries().acquire(&busy.id, SessionId::new()).unwrap();

        let report = fx.manager.prune().await;
        assert_eq!(report.evicted_count(), 1);
        assert_eq!(report.evicted[0].id, idle.id);
        assert_eq!(report.freed_bytes, 100);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].id, busy.id);
        assert_eq!(report.skipped[0].reason.to_string(), "still active");

        assert!(!fx.store.contains(&idle.id).await);
        assert!(fx.store.contains(&busy.id).await);
        assert_eq!(fx.entries().disk_space_bytes(), 50);
    }

    #[tokio::test]
    async fn prune_never_removes_entry_acquired_during_settle() {
        let fx = Fixture::new(KeepBytes::Absolute(0), Duration::from_millis(200)).await;
        let entry = fx.add("x", 10).await;

        let manager = Arc::clone(&fx.manager);
        let prune = tokio::spawn(async move { manager.prune().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let lease = fx.entries().acquire(&entry.id, SessionId::new()).unwrap();

        let report = prune.await.unwrap();
        assert_eq!(report.evicted_count(), 0);
        assert_eq!(report.skipped[0].reason, SkipReason::StillActive);
        assert!(fx.store.contains(lease.id()).await);
    }

    #[tokio::test]
    async fn prune_reports_removal_failure_and_keeps_entry() {
        let dir = TempDir::new().unwrap();
        let entries = Arc::new(CacheEntrySet::new());
        let entry = entries.register("stuck", 10).unwrap();
        let manager = GcManager::new(
            Arc::clone(&entries),
            Arc::new(FailingStore),
            dir.path(),
            GcPolicy {
                settle_delay: Duration::ZERO,
                ..GcPolicy::default()
            },
        )
        .unwrap();

        let report = manager.prune().await;
        assert_eq!(report.evicted_count(), 0);
        assert!(report.skipped[0]
            .reason
            .to_string()
            .starts_with("removal failed:"));
        // back in service
        assert!(entries.acquire(&entry.id, SessionId::new()).is_ok());
    }

    #[tokio::test]
    async fn gc_noop_under_budget() {
        let fx = Fixture::new(KeepBytes::Absolute(1000), Duration::ZERO).await;
        fx.add("a", 100).await;
        let report = fx.manager.run_once().await.unwrap();
        assert_eq!(report.keep_bytes, 1000);
        assert!(report.eviction.evicted.is_empty());
        assert_eq!(report.usage_after, 100);
    }

    #[tokio::test]
    async fn gc_evicts_lru_until_below_budget() {
        let fx = Fixture::new(KeepBytes::Absolute(100), Duration::ZERO).await;
        let oldest = fx.add("oldest", 60).await;
        let middle = fx.add("middle", 60).await;
        let newest = fx.add("newest", 60).await;
        fx.entries().touch(&oldest.id).unwrap();

        let planned = fx.manager.plan().unwrap();
        assert_eq!(
            planned.iter().map(|e| e.id.clone()).collect::<Vec<_>>(),
            vec![middle.id.clone(), newest.id.clone()]
        );

        let report = fx.manager.run_once().await.unwrap();
        assert_eq!(report.usage_before, 180);
        assert_eq!(report.usage_after, 60);
        let evicted: Vec<_> = report.eviction.evicted.iter().map(|e| e.id.clone()).collect();
        assert_eq!(evicted, vec![middle.id, newest.id]);
        assert!(fx.entries().get(&oldest.id).is_some());
    }

    #[tokio::test]
    async fn gc_skips_active_and_unsettled_entries() {
        let fx = Fixture::new(KeepBytes::Absolute(0), Duration::from_secs(60)).await;
        let held = fx.add("held", 10).await;
        let _lease = fx.entries().acquire(&held.id, SessionId::new()).unwrap();

        let released = fx.add("released", 10).await;
        fx.entries()
            .acquire(&released.id, SessionId::new())
            .unwrap()
            .release();

        let never_used = fx.add("never used", 10).await;

        let report = fx.manager.run_once().await.unwrap();
        let evicted: Vec<_> = report.eviction.evicted.iter().map(|e| e.id.clone()).collect();
        assert_eq!(evicted, vec![never_used.id]);
        assert!(fx.entries().get(&held.id).is_some());
        assert!(fx.entries().get(&released.id).is_some());
    }

    #[tokio::test]
    async fn maybe_run_is_throttled() {
        let fx = Fixture::new(KeepBytes::Absolute(0), Duration::ZERO).await;
        assert!(fx.manager.maybe_run().await.unwrap().is_some());
        assert!(fx.manager.maybe_run().await.unwrap().is_none());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(fx.manager.maybe_run().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn background_task_collects_after_registration() {
        let fx = Fixture::new(KeepBytes::Absolute(0), Duration::ZERO).await;
        let handle = fx.manager.spawn();

        let entry = fx.add("transient", 10).await;
        let mut gone = false;
        for _ in 0..100 {
            if fx.entries().get(&entry.id).is_none() {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.shutdown().await;

        assert!(gone, "background GC should evict over-budget entries");
        assert!(!fx.store.contains(&entry.id).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn percent_budget_is_whole_gib() {
        let fx = Fixture::new(KeepBytes::Percent(5.0), Duration::ZERO).await;
        let keep = fx.manager.resolved_keep_bytes().unwrap();
        assert_eq!(keep % crate::cache::size::GIB, 0);
    }
}
