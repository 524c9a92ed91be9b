//! Content-addressed function call cache
//!
//! A call is keyed by its function name, its value arguments in canonical
//! JSON, and the digests of every workspace input it reads. Workspace
//! inputs are bound from the calling context rather than passed by the
//! caller, so they never appear among a function's invocable parameters.
//! Changing a file outside a function's selection leaves its key, and
//! therefore its cached result, untouched.

use crate::cache::{CacheEntrySet, EntryId, EntryLease, ObjectStore};
use crate::error::{CairnError, CairnResult};
use crate::session::SessionId;
use crate::workspace::{DirectoryHandle, FileHandle, PathSelector, WorkspaceRoot};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

/// How a parameter receives its value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParamKind {
    /// Supplied by the caller
    Value,
    /// A digested directory selection from the workspace
    WorkspaceDirectory(PathSelector),
    /// A digested workspace file
    WorkspaceFile { path: String },
}

impl ParamKind {
    pub fn is_workspace(&self) -> bool {
        !matches!(self, Self::Value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(flatten)]
    pub kind: ParamKind,
    /// Missing optional values bind as `null`
    #[serde(default)]
    pub optional: bool,
}

/// A callable function and its parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub name: String,
    #[serde(default)]
    pub params: Vec<ParamSpec>,
}

impl FunctionSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
        }
    }

    pub fn value(self, name: impl Into<String>) -> Self {
        self.param(name, ParamKind::Value, false)
    }

    pub fn optional_value(self, name: impl Into<String>) -> Self {
        self.param(name, ParamKind::Value, true)
    }

    pub fn directory(self, name: impl Into<String>, selector: PathSelector) -> Self {
        self.param(name, ParamKind::WorkspaceDirectory(selector), false)
    }

    pub fn file(self, name: impl Into<String>, path: impl Into<String>) -> Self {
        self.param(name, ParamKind::WorkspaceFile { path: path.into() }, false)
    }

    fn param(mut self, name: impl Into<String>, kind: ParamKind, optional: bool) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            kind,
            optional,
        });
        self
    }

    /// Parameters a caller may pass. Workspace inputs are excluded.
    pub fn invocable_params(&self) -> Vec<&ParamSpec> {
        self.params.iter().filter(|p| !p.kind.is_workspace()).collect()
    }

    pub fn get_param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }
}

/// Digest identifying one call
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct CallKey(String);

impl CallKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for CallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A resolved argument
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum BoundArg {
    Value(Value),
    Directory(DirectoryHandle),
    File(FileHandle),
}

/// A call with every argument resolved, ready to execute
#[derive(Debug, Clone, Serialize)]
pub struct BoundCall {
    pub function: String,
    pub args: BTreeMap<String, BoundArg>,
    pub key: CallKey,
}

impl BoundCall {
    fn new(function: &str, args: BTreeMap<String, BoundArg>) -> CairnResult<Self> {
        let key = call_key(function, &args)?;
        Ok(Self {
            function: function.to_string(),
            args,
            key,
        })
    }
}

/// Runs a call on a cache miss
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, call: &BoundCall) -> CairnResult<Value>;
}

/// Where a call is made from
#[derive(Debug, Clone)]
pub struct CallContext {
    pub workspace: WorkspaceRoot,
    /// When set, the result entry is leased to this session
    pub session: Option<SessionId>,
}

impl CallContext {
    pub fn new(workspace: WorkspaceRoot) -> Self {
        Self {
            workspace,
            session: None,
        }
    }

    pub fn with_session(mut self, session: SessionId) -> Self {
        self.session = Some(session);
        self
    }
}

#[derive(Debug)]
pub struct CallOutcome {
    pub key: CallKey,
    pub value: Value,
    pub entry: EntryId,
    pub cache_hit: bool,
    pub lease: Option<EntryLease>,
}

/// Memoizes call results as cache entries. The memo maps call keys to
/// entry ids only; result values are read back from the object store.
pub struct CallCache {
    entries: Arc<CacheEntrySet>,
    store: Arc<dyn ObjectStore>,
    memo: RwLock<HashMap<CallKey, EntryId>>,
    inflight: Mutex<HashMap<CallKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl CallCache {
    pub fn new(entries: Arc<CacheEntrySet>, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            entries,
            store,
            memo: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn entries(&self) -> &Arc<CacheEntrySet> {
        &self.entries
    }

    /// Bind arguments without executing, to inspect the call key
    pub async fn bind(
        &self,
        ctx: &CallContext,
        spec: &FunctionSpec,
        args: &BTreeMap<String, Value>,
    ) -> CairnResult<BoundCall> {
        for name in args.keys() {
            match spec.get_param(name) {
                Some(param) if param.kind.is_workspace() => {
                    return Err(CairnError::User(format!(
                        "'{}' of {} is supplied by the workspace and cannot be passed",
                        name, spec.name
                    )))
                }
                Some(_) => {}
                None => {
                    return Err(CairnError::User(format!(
                        "unknown argument '{}' for {}",
                        name, spec.name
                    )))
                }
            }
        }

        let mut bound = BTreeMap::new();
        for param in &spec.params {
            let arg = match &param.kind {
                ParamKind::Value => match args.get(&param.name) {
                    Some(value) => BoundArg::Value(value.clone()),
                    None if param.optional => BoundArg::Value(Value::Null),
                    None => {
                        return Err(CairnError::User(format!(
                            "missing argument '{}' for {}",
                            param.name, spec.name
                        )))
                    }
                },
                ParamKind::WorkspaceDirectory(selector) => {
                    BoundArg::Directory(ctx.workspace.select(selector).await?)
                }
                ParamKind::WorkspaceFile { path } => {
                    BoundArg::File(ctx.workspace.file(path).await?)
                }
            };
            bound.insert(param.name.clone(), arg);
        }

        BoundCall::new(&spec.name, bound)
    }

    /// Return the memoized result for this call or execute it
    pub async fn invoke(
        &self,
        ctx: &CallContext,
        spec: &FunctionSpec,
        args: &BTreeMap<String, Value>,
        executor: &dyn Executor,
    ) -> CairnResult<CallOutcome> {
        let call = self.bind(ctx, spec, args).await?;
        if let Some(hit) = self.lookup(&call.key, ctx.session).await {
            return Ok(hit);
        }

        let gate = self.gate(&call.key);
        let result = {
            let _guard = gate.lock().await;
            match self.lookup(&call.key, ctx.session).await {
                Some(hit) => Ok(hit),
                None => self.execute(ctx, call.clone(), executor).await,
            }
        };
        self.release_gate(&call.key, &gate);
        result
    }

    /// Number of memoized calls
    pub fn memo_len(&self) -> usize {
        self.read_memo().len()
    }

    /// Drop memo keys whose entry has left the entry set. Returns how
    /// many were dropped.
    pub fn purge_evicted(&self) -> usize {
        let mut memo = self.write_memo();
        let before = memo.len();
        memo.retain(|_, entry| self.entries.get(entry).is_some());
        before - memo.len()
    }

    async fn lookup(&self, key: &CallKey, session: Option<SessionId>) -> Option<CallOutcome> {
        let entry = self.read_memo().get(key).cloned()?;

        // the lease pins the object while it is read back
        let lease = match session {
            Some(session) => self.entries.acquire(&entry, session).map(Some),
            None => self.entries.touch(&entry).map(|_| None),
        };
        let lease = match lease {
            Ok(lease) => lease,
            Err(e) => {
                debug!("Dropping memo for {}: {}", key.short(), e);
                self.forget(key, &entry);
                return None;
            }
        };

        let value = match self.load(&entry).await {
            Ok(value) => value,
            Err(e) => {
                debug!("Dropping memo for {}: {}", key.short(), e);
                self.forget(key, &entry);
                return None;
            }
        };

        debug!("Call cache hit {}", key.short());
        Some(CallOutcome {
            key: key.clone(),
            value,
            entry,
            cache_hit: true,
            lease,
        })
    }

    async fn load(&self, entry: &EntryId) -> CairnResult<Value> {
        let bytes = self.store.get(entry).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn execute(
        &self,
        ctx: &CallContext,
        call: BoundCall,
        executor: &dyn Executor,
    ) -> CairnResult<CallOutcome> {
        debug!("Call cache miss {} for {}", call.key.short(), call.function);
        let value = executor.execute(&call).await?;

        let bytes = serde_json::to_vec(&value)?;
        let id = EntryId::generate();
        let size = self.store.put(&id, &bytes).await?;
        let description = format!("{} {}", call.function, call.key.short());

        let lease = match ctx.session {
            Some(session) => Some(
                self.entries
                    .insert_acquired(id.clone(), description, size, session)?,
            ),
            None => {
                self.entries.insert(id.clone(), description, size)?;
                None
            }
        };

        let purged = self.purge_evicted();
        if purged > 0 {
            debug!("Purged {} evicted call results", purged);
        }
        self.write_memo().insert(call.key.clone(), id.clone());

        Ok(CallOutcome {
            key: call.key,
            value,
            entry: id,
            cache_hit: false,
            lease,
        })
    }

    fn forget(&self, key: &CallKey, entry: &EntryId) {
        let mut memo = self.write_memo();
        if memo.get(key) == Some(entry) {
            memo.remove(key);
        }
    }

    fn read_memo(&self) -> RwLockReadGuard<'_, HashMap<CallKey, EntryId>> {
        match self.memo.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_memo(&self) -> RwLockWriteGuard<'_, HashMap<CallKey, EntryId>> {
        match self.memo.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn gate(&self, key: &CallKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut inflight = match self.inflight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(inflight.entry(key.clone()).or_default())
    }

    fn release_gate(&self, key: &CallKey, gate: &Arc<tokio::sync::Mutex<()>>) {
        let mut inflight = match self.inflight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if inflight.get(key).is_some_and(|g| Arc::ptr_eq(g, gate)) {
            inflight.remove(key);
        }
    }
}

fn call_key(function: &str, args: &BTreeMap<String, BoundArg>) -> CairnResult<CallKey> {
    let mut hasher = Sha256::new();
    hasher.update(b"cairn.call.v1\0");
    hasher.update(function.as_bytes());
    hasher.update(b"\0");

    for (name, arg) in args {
        hasher.update(name.as_bytes());
        hasher.update(b"\0");
        match arg {
            BoundArg::Value(value) => {
                // serde_json maps are ordered, so this is canonical
                hasher.update(b"value\0");
                hasher.update(serde_json::to_string(value)?.as_bytes());
            }
            BoundArg::Directory(handle) => {
                hasher.update(b"dir\0");
                hasher.update(handle.path.as_bytes());
                hasher.update(b"\0");
                hasher.update(handle.digest.as_str().as_bytes());
            }
            BoundArg::File(handle) => {
                hasher.update(b"file\0");
                hasher.update(handle.path.as_bytes());
                hasher.update(b"\0");
                hasher.update(handle.digest.as_str().as_bytes());
            }
        }
        hasher.update(b"\n");
    }

    Ok(CallKey(hex::encode(hasher.finalize())))
}
