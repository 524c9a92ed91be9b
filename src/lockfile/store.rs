//! Persistent resolver lockfile
//!
//! Lookups are served from an in-memory map loaded on open. Every mutation
//! runs a read-modify-write of the file under an exclusive [`FileLock`]
//! shared by every handle and process on the same path, and lands through
//! a temp file + rename. Readers never observe a partial file and
//! concurrent writers never lose each other's entries.

use crate::error::{CairnError, CairnResult};
use crate::filelock::FileLock;
use crate::lockfile::entry::{LockfileEntry, ResolverCall};
use crate::lockfile::format::{self, LockMap};
use crate::lockfile::resolver::LiveResolver;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// What to do when a key is recorded with a different output than the
/// one already locked (for example a tag whose upstream digest moved)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Replace the locked output and log a warning
    #[default]
    Overwrite,
    /// Refuse; only an explicit relock may change the output
    Reject,
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overwrite => write!(f, "overwrite"),
            Self::Reject => write!(f, "reject"),
        }
    }
}

/// Result of a record call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// New key written
    Inserted,
    /// Key already locked to the same output; file untouched
    Unchanged,
    /// Key existed with a different output
    Replaced { previous: String },
}

/// Output of `resolve_with`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub output: String,
    /// True when served from the lockfile without live resolution
    pub locked: bool,
}

/// A resolver lockfile bound to one path
pub struct Lockfile {
    path: PathBuf,
    policy: ConflictPolicy,
    entries: RwLock<Arc<LockMap>>,
}

impl Lockfile {
    /// Open a lockfile, loading its current content. A missing file is an
    /// empty lockfile; nothing is written until the first record.
    pub async fn open(path: impl Into<PathBuf>, policy: ConflictPolicy) -> CairnResult<Self> {
        let path = path.into();
        let map = read_map(&path).await?;
        debug!("Opened lockfile {} ({} entries)", path.display(), map.len());

        Ok(Self {
            path,
            policy,
            entries: RwLock::new(Arc::new(map)),
        })
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Configured conflict policy
    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Look up a pinned output. `None` is a miss: the caller resolves live
    /// and records the result.
    pub fn resolve(&self, call: &ResolverCall) -> Option<String> {
        self.snapshot().get(call).cloned()
    }

    /// Sorted snapshot of every entry
    pub fn entries(&self) -> Vec<LockfileEntry> {
        self.snapshot()
            .iter()
            .map(|(call, output)| LockfileEntry::new(call.clone(), output.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Pin `call` to `output` under the configured conflict policy
    pub async fn record(
        &self,
        call: ResolverCall,
        output: impl Into<String>,
    ) -> CairnResult<RecordOutcome> {
        self.upsert(call, output.into(), self.policy).await
    }

    /// Pin `call` to `output`, replacing any existing output
    pub async fn relock(
        &self,
        call: ResolverCall,
        output: impl Into<String>,
    ) -> CairnResult<RecordOutcome> {
        self.upsert(call, output.into(), ConflictPolicy::Overwrite)
            .await
    }

    /// Drop an entry. Returns false if it was not locked.
    pub async fn remove(&self, call: &ResolverCall) -> CairnResult<bool> {
        let _guard = FileLock::acquire(&self.path).await?;

        let mut map = read_map(&self.path).await?;
        if map.remove(call).is_none() {
            self.publish(map);
            return Ok(false);
        }

        write_atomic(&self.path, &format::render(&map)).await?;
        self.publish(map);
        info!("Unlocked {}", call);
        Ok(true)
    }

    /// Resolve from the lockfile, falling back to live resolution and
    /// recording its output on a miss
    pub async fn resolve_with(
        &self,
        call: &ResolverCall,
        resolver: &dyn LiveResolver,
    ) -> CairnResult<Resolution> {
        if let Some(output) = self.resolve(call) {
            debug!("Lockfile hit for {}", call);
            return Ok(Resolution {
                output,
                locked: true,
            });
        }

        debug!("Lockfile miss for {}, resolving live", call);
        let output = resolver.resolve(call).await?;
        self.record(call.clone(), output.clone()).await?;
        Ok(Resolution {
            output,
            locked: false,
        })
    }

    /// True if the file on disk is already in canonical form
    pub async fn verify(&self) -> CairnResult<bool> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
            Err(e) => {
                return Err(CairnError::io(
                    format!("reading lockfile {}", self.path.display()),
                    e,
                ))
            }
        };
        let map = format::parse(&self.path, &content)?;
        Ok(content.is_empty() || format::render(&map) == content)
    }

    async fn upsert(
        &self,
        call: ResolverCall,
        output: String,
        policy: ConflictPolicy,
    ) -> CairnResult<RecordOutcome> {
        call.check_inputs()
            .map_err(|reason| CairnError::User(format!("cannot lock {}: {}", call, reason)))?;
        let _guard = FileLock::acquire(&self.path).await?;

        let mut map = read_map(&self.path).await?;
        let outcome = match map.get(&call).cloned() {
            Some(existing) if existing == output => {
                self.publish(map);
                return Ok(RecordOutcome::Unchanged);
            }
            Some(existing) => match policy {
                ConflictPolicy::Reject => {
                    self.publish(map);
                    return Err(CairnError::LockConflict {
                        key: call.to_string(),
                        existing,
                        proposed: output,
                    })
                }
                ConflictPolicy::Overwrite => {
                    warn!("Relocking {}: {} -> {}", call, existing, output);
                    RecordOutcome::Replaced { previous: existing }
                }
            },
            None => RecordOutcome::Inserted,
        };

        debug!("Locking {} -> {}", call, output);
        map.insert(call, output);
        write_atomic(&self.path, &format::render(&map)).await?;
        self.publish(map);
        Ok(outcome)
    }

    fn snapshot(&self) -> Arc<LockMap> {
        match self.entries.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn publish(&self, map: LockMap) {
        let map = Arc::new(map);
        match self.entries.write() {
            Ok(mut guard) => *guard = map,
            Err(poisoned) => *poisoned.into_inner() = map,
        }
    }
}

async fn read_map(path: &Path) -> CairnResult<LockMap> {
    match fs::read_to_string(path).await {
        Ok(content) => format::parse(path, &content),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(LockMap::new()),
        Err(e) => Err(CairnError::io(
            format!("reading lockfile {}", path.display()),
            e,
        )),
    }
}

/// Write `content` to a sibling temp file, fsync, and rename over `path`
pub(crate) async fn write_atomic(path: &Path, content: impl AsRef<[u8]>) -> CairnResult<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "cairn".to_string());
    let tmp = dir.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4().simple()));

    fs::create_dir_all(dir)
        .await
        .map_err(|e| CairnError::io(format!("creating directory {}", dir.display()), e))?;

    let result = async {
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(content.as_ref()).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, path).await
    }
    .await;

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp).await;
        return Err(CairnError::io(format!("writing {}", path.display()), e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lockfile::entry::Primitive;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn digest(c: char) -> String {
        format!("sha256:{}", c.to_string().repeat(64))
    }

    async fn open(dir: &TempDir) -> Lockfile {
        Lockfile::open(dir.path().join("cairn.lock"), ConflictPolicy::Overwrite)
            .await
            .unwrap()
    }

    struct CountingResolver {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LiveResolver for CountingResolver {
        async fn resolve(&self, _call: &ResolverCall) -> CairnResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(digest('c'))
        }
    }

    #[tokio::test]
    async fn missing_file_is_empty_and_not_created() {
        let dir = TempDir::new().unwrap();
        let lock = open(&dir).await;
        assert!(lock.is_empty());
        assert!(lock
            .resolve(&ResolverCall::http_get("https://x"))
            .is_none());
        assert!(!lock.path().exists());
    }

    #[tokio::test]
    async fn resolves_pinned_example_without_resolver() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cairn.lock");
        let pinned = digest('7');
        std::fs::write(
            &path,
            format!(
                "[[\"version\",\"1\"]]\n[\"core\",\"container.from\",[\"alpine:3.18\",\"linux/amd64\"],\"{}\"]",
                pinned
            ),
        )
        .unwrap();

        let lock = Lockfile::open(&path, ConflictPolicy::Reject).await.unwrap();
        let resolver = CountingResolver {
            calls: AtomicUsize::new(0),
        };
        let res = lock
            .resolve_with(
                &ResolverCall::container_from("alpine:3.18", "linux/amd64"),
                &resolver,
            )
            .await
            .unwrap();

        assert_eq!(res.output, pinned);
        assert!(res.locked);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn miss_falls_back_and_records() {
        let dir = TempDir::new().unwrap();
        let lock = open(&dir).await;
        let resolver = CountingResolver {
            calls: AtomicUsize::new(0),
        };
        let call = ResolverCall::http_get("https://example.com/a.tgz");

        let first = lock.resolve_with(&call, &resolver).await.unwrap();
        let second = lock.resolve_with(&call, &resolver).await.unwrap();

        assert!(!first.locked);
        assert!(second.locked);
        assert_eq!(first.output, second.output);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn record_twice_is_byte_identical() {
        let dir = TempDir::new().unwrap();
        let lock = open(&dir).await;
        let call = ResolverCall::container_from("alpine:latest", "linux/amd64");

        assert_eq!(
            lock.record(call.clone(), digest('a')).await.unwrap(),
            RecordOutcome::Inserted
        );
        let once = std::fs::read(lock.path()).unwrap();

        assert_eq!(
            lock.record(call, digest('a')).await.unwrap(),
            RecordOutcome::Unchanged
        );
        let twice = std::fs::read(lock.path()).unwrap();
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn record_order_does_not_change_bytes() {
        let calls = vec![
            (ResolverCall::http_get("https://b"), digest('1')),
            (
                ResolverCall::container_from("alpine:latest", "linux/arm64"),
                digest('2'),
            ),
            (
                ResolverCall::git("commit", "https://g/r", "main", vec![]),
                digest('3'),
            ),
            (
                ResolverCall::container_from("alpine:latest", "linux/amd64"),
                digest('4'),
            ),
        ];

        let a = TempDir::new().unwrap();
        let lock_a = open(&a).await;
        for (call, out) in calls.iter() {
            lock_a.record(call.clone(), out.clone()).await.unwrap();
        }

        let b = TempDir::new().unwrap();
        let lock_b = open(&b).await;
        for (call, out) in calls.iter().rev() {
            lock_b.record(call.clone(), out.clone()).await.unwrap();
        }

        assert_eq!(
            std::fs::read(lock_a.path()).unwrap(),
            std::fs::read(lock_b.path()).unwrap()
        );
    }

    #[tokio::test]
    async fn concurrent_records_converge() {
        let dir = TempDir::new().unwrap();
        let lock = Arc::new(open(&dir).await);

        let mut handles = Vec::new();
        for i in 0..16i64 {
            let lock = Arc::clone(&lock);
            handles.push(tokio::spawn(async move {
                let call = ResolverCall::new("core", "http.get", [Primitive::Int(i)]);
                lock.record(call, format!("sha256:{:064}", i)).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let reopened = open(&dir).await;
        assert_eq!(reopened.len(), 16);
        assert!(reopened.verify().await.unwrap());

        // Same set recorded serially renders the same bytes
        let serial_dir = TempDir::new().unwrap();
        let serial = open(&serial_dir).await;
        for i in 0..16i64 {
            let call = ResolverCall::new("core", "http.get", [Primitive::Int(i)]);
            serial
                .record(call, format!("sha256:{:064}", i))
                .await
                .unwrap();
        }
        assert_eq!(
            std::fs::read(lock.path()).unwrap(),
            std::fs::read(serial.path()).unwrap()
        );
    }

    #[tokio::test]
    async fn platforms_are_distinct_entries() {
        let dir = TempDir::new().unwrap();
        let lock = open(&dir).await;
        let amd = ResolverCall::container_from("alpine:latest", "linux/amd64");
        let arm = ResolverCall::container_from("alpine:latest", "linux/arm64");

        lock.record(amd.clone(), digest('a')).await.unwrap();
        lock.record(arm.clone(), digest('b')).await.unwrap();

        assert_eq!(lock.resolve(&amd), Some(digest('a')));
        assert_eq!(lock.resolve(&arm), Some(digest('b')));
        assert_eq!(lock.len(), 2);
    }

    #[tokio::test]
    async fn overwrite_policy_replaces() {
        let dir = TempDir::new().unwrap();
        let lock = open(&dir).await;
        let call = ResolverCall::container_from("alpine:latest", "linux/amd64");

        lock.record(call.clone(), digest('a')).await.unwrap();
        let outcome = lock.record(call.clone(), digest('b')).await.unwrap();

        assert_eq!(
            outcome,
            RecordOutcome::Replaced {
                previous: digest('a')
            }
        );
        assert_eq!(lock.resolve(&call), Some(digest('b')));
    }

    #[tokio::test]
    async fn reject_policy_requires_relock() {
        let dir = TempDir::new().unwrap();
        let lock = Lockfile::open(dir.path().join("cairn.lock"), ConflictPolicy::Reject)
            .await
            .unwrap();
        let call = ResolverCall::container_from("alpine:latest", "linux/amd64");

        lock.record(call.clone(), digest('a')).await.unwrap();
        let err = lock.record(call.clone(), digest('b')).await.unwrap_err();
        assert!(matches!(err, CairnError::LockConflict { .. }));
        assert_eq!(lock.resolve(&call), Some(digest('a')));

        lock.relock(call.clone(), digest('b')).await.unwrap();
        assert_eq!(lock.resolve(&call), Some(digest('b')));
    }

    #[tokio::test]
    async fn corrupt_file_fails_open_and_is_not_overwritten() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cairn.lock");
        let garbage = "[[\"version\",\"1\"]]\n{not json\n";
        std::fs::write(&path, garbage).unwrap();

        let err = Lockfile::open(&path, ConflictPolicy::Overwrite)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CairnError::CorruptLockfile { line: 2, .. }));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), garbage);
    }

    #[tokio::test]
    async fn record_picks_up_external_edits() {
        let dir = TempDir::new().unwrap();
        let lock = open(&dir).await;
        lock.record(ResolverCall::http_get("https://a"), digest('a'))
            .await
            .unwrap();

        // Another handle writes behind our back
        let other = open(&dir).await;
        other
            .record(ResolverCall::http_get("https://b"), digest('b'))
            .await
            .unwrap();

        lock.record(ResolverCall::http_get("https://c"), digest('c'))
            .await
            .unwrap();
        assert_eq!(lock.len(), 3);
        assert_eq!(
            lock.resolve(&ResolverCall::http_get("https://b")),
            Some(digest('b'))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn handles_on_one_path_never_lose_records() {
        let dir = TempDir::new().unwrap();
        let first = Arc::new(open(&dir).await);
        let second = Arc::new(open(&dir).await);

        let mut handles = Vec::new();
        for i in 0..64i64 {
            let lock = if i % 2 == 0 {
                Arc::clone(&first)
            } else {
                Arc::clone(&second)
            };
            handles.push(tokio::spawn(async move {
                let call = ResolverCall::new("core", "http.get", [Primitive::Int(i)]);
                lock.record(call, format!("sha256:{:064}", i)).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let reopened = open(&dir).await;
        assert_eq!(reopened.len(), 64);
        assert!(reopened.verify().await.unwrap());
    }

    #[tokio::test]
    async fn rejected_record_still_refreshes_view() {
        let dir = TempDir::new().unwrap();
        let lock = Lockfile::open(dir.path().join("cairn.lock"), ConflictPolicy::Reject)
            .await
            .unwrap();
        let pinned = ResolverCall::http_get("https://a");
        lock.record(pinned.clone(), digest('a')).await.unwrap();

        let other = open(&dir).await;
        let added = ResolverCall::http_get("https://b");
        other.record(added.clone(), digest('b')).await.unwrap();
        assert!(lock.resolve(&added).is_none());

        let err = lock.record(pinned, digest('z')).await.unwrap_err();
        assert!(matches!(err, CairnError::LockConflict { .. }));
        assert_eq!(lock.resolve(&added), Some(digest('b')));
    }

    #[tokio::test]
    async fn non_finite_input_is_not_recorded() {
        let dir = TempDir::new().unwrap();
        let lock = open(&dir).await;
        let call = ResolverCall::new("core", "f", [Primitive::Float(f64::INFINITY)]);

        let err = lock.record(call.clone(), digest('a')).await.unwrap_err();
        assert!(err.to_string().contains("cannot lock"));
        assert!(lock.resolve(&call).is_none());
        assert!(!lock.path().exists());
    }

    #[tokio::test]
    async fn remove_entry() {
        let dir = TempDir::new().unwrap();
        let lock = open(&dir).await;
        let call = ResolverCall::http_get("https://a");
        lock.record(call.clone(), digest('a')).await.unwrap();

        assert!(lock.remove(&call).await.unwrap());
        assert!(!lock.remove(&call).await.unwrap());
        assert!(lock.resolve(&call).is_none());
        assert_eq!(
            std::fs::read_to_string(lock.path()).unwrap(),
            "[[\"version\",\"1\"]]\n"
        );
    }

    #[tokio::test]
    async fn verify_detects_unsorted_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cairn.lock");
        std::fs::write(
            &path,
            "[[\"version\",\"1\"]]\n[\"z\",\"f\",[],\"o\"]\n[\"a\",\"f\",[],\"o\"]\n",
        )
        .unwrap();

        let lock = Lockfile::open(&path, ConflictPolicy::Overwrite)
            .await
            .unwrap();
        assert!(!lock.verify().await.unwrap());

        lock.record(ResolverCall::new("m", "f", Vec::new()), "o")
            .await
            .unwrap();
        assert!(lock.verify().await.unwrap());
    }
}
