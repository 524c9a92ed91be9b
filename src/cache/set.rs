//! The set of cached values and who is using them
//!
//! All metadata lives behind one mutex that is held only for in-memory
//! bookkeeping, never across I/O. Readers go through a published snapshot
//! and an atomic byte counter and never take that mutex. Eviction is a
//! claim-then-remove protocol: an entry is marked `evicting` under the
//! lock, after which it can no longer be acquired, so removal can never
//! race with a session picking the entry up.

use crate::cache::entry::{CacheEntry, EntryId};
use crate::error::{CairnError, CairnResult};
use crate::lockfile::store::write_atomic;
use crate::session::SessionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::debug;

const INDEX_VERSION: u32 = 1;

/// Why an entry was left in place by prune or GC
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    StillActive,
    Settling,
    AlreadyEvicting,
    Gone,
    RemovalFailed(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StillActive => write!(f, "still active"),
            Self::Settling => write!(f, "released too recently"),
            Self::AlreadyEvicting => write!(f, "eviction already in progress"),
            Self::Gone => write!(f, "no longer present"),
            Self::RemovalFailed(reason) => write!(f, "removal failed: {}", reason),
        }
    }
}

impl Serialize for SkipReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Identifies one outstanding lease
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct LeaseId(u64);

#[derive(Debug)]
struct Record {
    entry: CacheEntry,
    /// Outstanding leases and the session each belongs to
    holders: HashMap<LeaseId, SessionId>,
    released_at: Option<Instant>,
    evicting: bool,
}

impl Record {
    fn new(entry: CacheEntry) -> Self {
        Self {
            entry,
            holders: HashMap::new(),
            released_at: None,
            evicting: false,
        }
    }

    fn is_active(&self) -> bool {
        !self.holders.is_empty()
    }

    fn is_settled(&self, settle: Option<Duration>) -> bool {
        match (settle, self.released_at) {
            (Some(delay), Some(at)) => at.elapsed() >= delay,
            _ => true,
        }
    }

    fn mark_released(&mut self) {
        self.entry.actively_used = false;
        self.released_at = Some(Instant::now());
    }
}

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<EntryId, Record>,
    /// Ascending `last_used_at`, the eviction order
    lru: BTreeSet<(DateTime<Utc>, EntryId)>,
    /// Sessions whose leases were force-released; they may not lease again
    retired: HashSet<SessionId>,
    next_lease: u64,
}

impl Inner {
    fn record_mut(&mut self, id: &EntryId) -> CairnResult<&mut Record> {
        let record = self
            .records
            .get_mut(id)
            .ok_or_else(|| CairnError::EntryNotFound(id.to_string()))?;
        if record.evicting {
            return Err(CairnError::EntryEvicting(id.to_string()));
        }
        Ok(record)
    }

    fn insert(&mut self, record: Record) -> CairnResult<()> {
        let id = record.entry.id.clone();
        if self.records.contains_key(&id) {
            return Err(CairnError::Internal(format!("duplicate cache entry id {}", id)));
        }
        self.lru.insert((record.entry.last_used_at, id.clone()));
        self.records.insert(id, record);
        Ok(())
    }

    fn bump(&mut self, id: &EntryId) -> CairnResult<()> {
        let now = Utc::now();
        let record = self.record_mut(id)?;
        let previous = record.entry.last_used_at;
        record.entry.last_used_at = now;
        self.lru.remove(&(previous, id.clone()));
        self.lru.insert((now, id.clone()));
        Ok(())
    }

    fn check_session(&self, session: SessionId) -> CairnResult<()> {
        if self.retired.contains(&session) {
            return Err(CairnError::SessionNotFound(session.to_string()));
        }
        Ok(())
    }

    fn issue_lease(&mut self) -> LeaseId {
        self.next_lease += 1;
        LeaseId(self.next_lease)
    }

    fn hold(&mut self, id: &EntryId, session: SessionId) -> CairnResult<LeaseId> {
        self.check_session(session)?;
        self.bump(id)?;
        let lease = self.issue_lease();
        let record = self.record_mut(id)?;
        record.holders.insert(lease, session);
        record.entry.actively_used = true;
        record.released_at = None;
        Ok(lease)
    }

    /// Drop one lease. Returns true if the entry became inactive.
    fn drop_lease(&mut self, id: &EntryId, lease: LeaseId) -> bool {
        let Some(record) = self.records.get_mut(id) else {
            return false;
        };
        if record.holders.remove(&lease).is_none() || record.is_active() {
            return false;
        }
        record.mark_released();
        true
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    entries: Vec<CacheEntry>,
}

/// Shared registry of cache entries
#[derive(Debug, Default)]
pub struct CacheEntrySet {
    inner: Mutex<Inner>,
    snapshot: RwLock<Arc<Vec<CacheEntry>>>,
    total_bytes: AtomicU64,
    registered: Notify,
}

impl CacheEntrySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every entry, oldest first
    pub fn entry_set(&self) -> Vec<CacheEntry> {
        self.snapshot().as_ref().clone()
    }

    /// Shared snapshot without copying the entries
    pub fn snapshot(&self) -> Arc<Vec<CacheEntry>> {
        match self.snapshot.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Sum of `disk_space_bytes` over all entries
    pub fn disk_space_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    pub fn get(&self, id: &EntryId) -> Option<CacheEntry> {
        self.lock().records.get(id).map(|r| r.entry.clone())
    }

    /// Completes when an entry has been registered since the last wakeup
    pub fn registered(&self) -> Notified<'_> {
        self.registered.notified()
    }

    /// Record a newly materialized value under a fresh id
    pub fn register(&self, description: impl Into<String>, bytes: u64) -> CairnResult<CacheEntry> {
        self.insert(EntryId::generate(), description, bytes)
    }

    /// Record a value already materialized under `id`
    pub fn insert(
        &self,
        id: EntryId,
        description: impl Into<String>,
        bytes: u64,
    ) -> CairnResult<CacheEntry> {
        let entry = new_entry(id, description.into(), bytes);
        {
            let mut inner = self.lock();
            inner.insert(Record::new(entry.clone()))?;
            self.publish(&inner);
        }
        debug!("Registered cache entry {} ({} bytes)", entry.id, bytes);
        self.registered.notify_one();
        Ok(entry)
    }

    /// Register a value that is referenced by `session` from the moment it
    /// exists, so no GC pass can observe it unreferenced
    pub fn register_acquired(
        self: &Arc<Self>,
        description: impl Into<String>,
        bytes: u64,
        session: SessionId,
    ) -> CairnResult<EntryLease> {
        self.insert_acquired(EntryId::generate(), description, bytes, session)
    }

    /// [`Self::register_acquired`] for a caller-chosen id
    pub fn insert_acquired(
        self: &Arc<Self>,
        id: EntryId,
        description: impl Into<String>,
        bytes: u64,
        session: SessionId,
    ) -> CairnResult<EntryLease> {
        let mut entry = new_entry(id.clone(), description.into(), bytes);
        entry.actively_used = true;
        let mut record = Record::new(entry);
        let lease = {
            let mut inner = self.lock();
            inner.check_session(session)?;
            let lease = inner.issue_lease();
            record.holders.insert(lease, session);
            inner.insert(record)?;
            self.publish(&inner);
            lease
        };
        debug!(
            "Registered cache entry {} ({} bytes) held by session {}",
            id, bytes, session
        );
        self.registered.notify_one();
        Ok(EntryLease::new(Arc::clone(self), id, session, lease))
    }

    /// Mark an entry as just used
    pub fn touch(&self, id: &EntryId) -> CairnResult<CacheEntry> {
        let mut inner = self.lock();
        inner.bump(id)?;
        let entry = inner.record_mut(id)?.entry.clone();
        self.publish(&inner);
        Ok(entry)
    }

    /// Take a reference on behalf of `session`. Fails with
    /// `EntryEvicting` once GC has claimed the entry and with
    /// `SessionNotFound` once the session has been released.
    pub fn acquire(self: &Arc<Self>, id: &EntryId, session: SessionId) -> CairnResult<EntryLease> {
        let lease = {
            let mut inner = self.lock();
            let lease = inner.hold(id, session)?;
            self.publish(&inner);
            lease
        };
        Ok(EntryLease::new(Arc::clone(self), id.clone(), session, lease))
    }

    /// Drop the most recent lease `session` holds on `id`. Returns true if
    /// the entry became inactive.
    pub fn release(&self, id: &EntryId, session: SessionId) -> CairnResult<bool> {
        let mut inner = self.lock();
        let record = inner
            .records
            .get(id)
            .ok_or_else(|| CairnError::EntryNotFound(id.to_string()))?;

        let Some(lease) = record
            .holders
            .iter()
            .filter(|(_, holder)| **holder == session)
            .map(|(lease, _)| *lease)
            .max_by_key(|lease| lease.0)
        else {
            return Ok(false);
        };

        let now_inactive = inner.drop_lease(id, lease);
        if now_inactive {
            self.publish(&inner);
        }
        Ok(now_inactive)
    }

    /// Drop every reference held by `session` and retire it: leases it
    /// still owns become no-ops and it can take no new ones. Returns how
    /// many entries it was holding.
    pub fn release_session(&self, session: SessionId) -> usize {
        let mut inner = self.lock();
        inner.retired.insert(session);
        let mut released = 0;
        for record in inner.records.values_mut() {
            let before = record.holders.len();
            record.holders.retain(|_, holder| *holder != session);
            if record.holders.len() < before {
                released += 1;
                if !record.is_active() {
                    record.mark_released();
                }
            }
        }
        if released > 0 {
            self.publish(&inner);
        }
        released
    }

    fn release_lease(&self, id: &EntryId, lease: LeaseId) {
        let mut inner = self.lock();
        if inner.drop_lease(id, lease) {
            self.publish(&inner);
        }
    }

    /// Inactive, unclaimed entries in eviction order
    pub(crate) fn inactive_candidates(&self, settle: Option<Duration>) -> Vec<EntryId> {
        let inner = self.lock();
        inner
            .lru
            .iter()
            .filter_map(|(_, id)| {
                let record = inner.records.get(id)?;
                (!record.is_active() && !record.evicting && record.is_settled(settle))
                    .then(|| id.clone())
            })
            .collect()
    }

    pub(crate) fn active_entries(&self) -> Vec<CacheEntry> {
        self.lock()
            .records
            .values()
            .filter(|r| r.is_active())
            .map(|r| r.entry.clone())
            .collect()
    }

    /// Re-check eligibility and mark the entry as being evicted
    pub(crate) fn claim(
        &self,
        id: &EntryId,
        settle: Option<Duration>,
    ) -> Result<CacheEntry, SkipReason> {
        let mut inner = self.lock();
        let record = inner.records.get_mut(id).ok_or(SkipReason::Gone)?;
        if record.evicting {
            return Err(SkipReason::AlreadyEvicting);
        }
        if record.is_active() {
            return Err(SkipReason::StillActive);
        }
        if !record.is_settled(settle) {
            return Err(SkipReason::Settling);
        }
        record.evicting = true;
        Ok(record.entry.clone())
    }

    /// Forget a claimed entry after its object was removed
    pub(crate) fn finish_eviction(&self, id: &EntryId) -> Option<CacheEntry> {
        let mut inner = self.lock();
        let record = inner.records.remove(id)?;
        inner.lru.remove(&(record.entry.last_used_at, id.clone()));
        self.publish(&inner);
        Some(record.entry)
    }

    /// Return a claimed entry to service after a failed removal
    pub(crate) fn abort_eviction(&self, id: &EntryId) {
        if let Some(record) = self.lock().records.get_mut(id) {
            record.evicting = false;
        }
    }

    /// Persist entry metadata to a JSON index
    pub async fn save(&self, path: &Path) -> CairnResult<()> {
        let index = IndexFile {
            version: INDEX_VERSION,
            entries: self.entry_set(),
        };
        let json = serde_json::to_string_pretty(&index)?;
        write_atomic(path, json).await?;
        debug!("Saved {} cache entries to {}", index.entries.len(), path.display());
        Ok(())
    }

    /// Load entry metadata from a JSON index. A missing file is an empty
    /// set. Every loaded entry starts inactive.
    pub async fn load(path: &Path) -> CairnResult<Self> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => {
                return Err(CairnError::io(
                    format!("reading cache index {}", path.display()),
                    e,
                ))
            }
        };

        let index: IndexFile = serde_json::from_str(&content)?;
        if index.version != INDEX_VERSION {
            return Err(CairnError::User(format!(
                "cache index {} has unsupported version {}",
                path.display(),
                index.version
            )));
        }

        let set = Self::new();
        {
            let mut inner = set.lock();
            for mut entry in index.entries {
                entry.actively_used = false;
                let id = entry.id.clone();
                if let Some(old) = inner.records.remove(&id) {
                    inner.lru.remove(&(old.entry.last_used_at, id));
                }
                inner.insert(Record::new(entry))?;
            }
            set.publish(&inner);
        }
        debug!("Loaded {} cache entries from {}", set.len(), path.display());
        Ok(set)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Rebuild the read snapshot. Called with the inner lock held so
    /// snapshots are published in mutation order.
    fn publish(&self, inner: &Inner) {
        let mut entries: Vec<CacheEntry> = inner.records.values().map(|r| r.entry.clone()).collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        let total = entries.iter().map(|e| e.disk_space_bytes).sum();

        self.total_bytes.store(total, Ordering::Release);
        let entries = Arc::new(entries);
        match self.snapshot.write() {
            Ok(mut guard) => *guard = entries,
            Err(poisoned) => *poisoned.into_inner() = entries,
        }
    }
}

fn new_entry(id: EntryId, description: String, bytes: u64) -> CacheEntry {
    let now = Utc::now();
    CacheEntry {
        id,
        description,
        disk_space_bytes: bytes,
        created_at: now,
        last_used_at: now,
        actively_used: false,
    }
}

/// A session's reference to an entry, released on drop
#[derive(Debug)]
pub struct EntryLease {
    set: Arc<CacheEntrySet>,
    id: EntryId,
    session: SessionId,
    lease: LeaseId,
    released: bool,
}

impl EntryLease {
    fn new(set: Arc<CacheEntrySet>, id: EntryId, session: SessionId, lease: LeaseId) -> Self {
        Self {
            set,
            id,
            session,
            lease,
            released: false,
        }
    }

    pub fn id(&self) -> &EntryId {
        &self.id
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Release now instead of on drop
    pub fn release(mut self) {
        self.released = true;
        self.set.release_lease(&self.id, self.lease);
    }
}

impl Drop for EntryLease {
    fn drop(&mut self) {
        if !self.released {
            self.set.release_lease(&self.id, self.lease);
        }
    }
}
