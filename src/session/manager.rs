//! Live session registry
//!
//! Sessions hold leases on cache entries. A session that stops
//! heartbeating is reaped and its leases released, so a crashed client
//! cannot pin entries forever.

use crate::cache::CacheEntrySet;
use crate::error::{CairnError, CairnResult};
use crate::session::state::{Session, SessionId, SessionStatus};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Tracks open sessions and their heartbeats
#[derive(Debug)]
pub struct SessionManager {
    entries: Arc<CacheEntrySet>,
    sessions: Mutex<HashMap<SessionId, Session>>,
}

impl SessionManager {
    pub fn new(entries: Arc<CacheEntrySet>) -> Self {
        Self {
            entries,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Open a new session
    pub fn open(&self, name: impl Into<String>) -> SessionId {
        let session = Session::new(name);
        let id = session.id;
        info!("Opened session {} ({})", session.name, id.short());
        self.lock().insert(id, session);
        id
    }

    /// Record that the session is still alive
    pub fn heartbeat(&self, id: SessionId) -> CairnResult<()> {
        let mut sessions = self.lock();
        let session = sessions
            .get_mut(&id)
            .ok_or_else(|| CairnError::SessionNotFound(id.to_string()))?;
        session.last_heartbeat = Utc::now();
        Ok(())
    }

    /// Close a session and release every lease it holds. Returns the
    /// number of entries released.
    pub fn close(&self, id: SessionId) -> CairnResult<usize> {
        let session = self
            .lock()
            .remove(&id)
            .ok_or_else(|| CairnError::SessionNotFound(id.to_string()))?;
        let released = self.entries.release_session(id);
        info!(
            "Closed session {} ({}), released {} entries",
            session.name,
            id.short(),
            released
        );
        Ok(released)
    }

    /// Close every session whose last heartbeat is older than `timeout`
    pub fn reap_stale(&self, timeout: Duration) -> Vec<Session> {
        let timeout = chrono::Duration::from_std(timeout)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let now = Utc::now();

        let stale: Vec<Session> = {
            let mut sessions = self.lock();
            let ids: Vec<SessionId> = sessions
                .values()
                .filter(|s| s.is_stale(now, timeout))
                .map(|s| s.id)
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };

        stale
            .into_iter()
            .map(|mut session| {
                let released = self.entries.release_session(session.id);
                warn!(
                    "Reaped stale session {} ({}), released {} entries",
                    session.name,
                    session.id.short(),
                    released
                );
                session.status = SessionStatus::Reaped;
                session
            })
            .collect()
    }

    pub fn get(&self, id: SessionId) -> Option<Session> {
        self.lock().get(&id).cloned()
    }

    /// Open sessions, oldest first
    pub fn list(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.lock().values().cloned().collect();
        sessions.sort_by_key(|s| s.opened_at);
        sessions
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    /// Reap stale sessions every `interval` until the handle is shut down
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration, timeout: Duration) -> ReaperHandle {
        let (stop, mut stop_rx) = watch::channel(false);
        let manager = Arc::clone(self);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            debug!("Session reaper started (timeout {:?})", timeout);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        manager.reap_stale(timeout);
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Session reaper stopped");
        });

        ReaperHandle { stop, task }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, Session>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Handle to the background reaper
pub struct ReaperHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReaperHandle {
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }
}
