//! Process-wide session registry.
//!
//! The registry is the only owner of session state. The dispatcher and the
//! confirmation monitor mutate sessions exclusively through [`SessionRegistry::update`],
//! which runs the closure under the registry's write lock so two mutations of the
//! same session never interleave.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use indexmap::IndexMap;
use relay_store::{Session, SessionRepository, StoreError};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::clock::{DynClock, millis};
use crate::config::PersistenceConfig;
use crate::error::HostError;
use crate::identity::{IdentifierPolicy, short_id};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    SessionCreated(String),
    Emptied,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistOutcome {
    Full,
    /// Only the most recent `n` sessions could be written.
    Essential(usize),
    /// Nothing was written; state lives in memory only.
    Failed,
}

pub struct SessionRegistry {
    sessions: RwLock<IndexMap<String, Session>>,
    repo: Arc<dyn SessionRepository>,
    policy: IdentifierPolicy,
    clock: DynClock,
    events: broadcast::Sender<StoreEvent>,
    essential_limit: usize,
    degraded: AtomicBool,
    save_lock: Mutex<()>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.read().len())
            .field("degraded", &self.is_degraded())
            .finish()
    }
}

impl SessionRegistry {
    pub fn new(
        repo: Arc<dyn SessionRepository>,
        policy: IdentifierPolicy,
        clock: DynClock,
        persistence: &PersistenceConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            sessions: RwLock::new(IndexMap::new()),
            repo,
            policy,
            clock,
            events,
            essential_limit: persistence.essential_limit,
            degraded: AtomicBool::new(false),
            save_lock: Mutex::new(()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, IndexMap<String, Session>> {
        self.sessions.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, IndexMap<String, Session>> {
        self.sessions.write().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: StoreEvent) {
        // No subscribers is fine; the daemon may not be running (tests, tools).
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub fn clock(&self) -> &DynClock {
        &self.clock
    }

    pub fn policy(&self) -> &IdentifierPolicy {
        &self.policy
    }

    /// Startup reload. Failures leave the registry empty and in-memory only.
    pub fn load(&self) -> usize {
        let loaded = match self.repo.load_all() {
            Ok(sessions) => sessions,
            Err(err) => {
                warn!(error = %err, "could not load persisted sessions; starting empty");
                self.degraded.store(true, Ordering::SeqCst);
                return 0;
            }
        };
        let mut guard = self.write();
        let mut count = 0;
        for session in loaded {
            if !self.policy.accepts(session.id()) {
                warn!(id = %short_id(session.id()), "dropping persisted session with invalid id");
                continue;
            }
            guard.insert(session.id().to_string(), session);
            count += 1;
        }
        info!(sessions = count, "session registry loaded");
        count
    }

    /// Creates the session for `id`, or reactivates the existing one.
    pub fn upsert(&self, id: &str) -> Result<Session, HostError> {
        if !self.policy.accepts(id) {
            warn!(id = %short_id(id), "rejecting invalid wallet identifier");
            return Err(HostError::InvalidIdentifier(id.to_string()));
        }
        let now = self.clock.now_ms();
        let (session, created) = {
            let mut guard = self.write();
            match guard.get_mut(id) {
                Some(existing) => {
                    existing.touch(now);
                    (existing.clone(), false)
                }
                None => {
                    let session = Session::new(id, now);
                    guard.insert(id.to_string(), session.clone());
                    (session, true)
                }
            }
        };
        if created {
            info!(id = %short_id(id), "session created");
            self.emit(StoreEvent::SessionCreated(id.to_string()));
        } else {
            debug!(id = %short_id(id), "session reactivated");
        }
        self.persist();
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.read().get(id).cloned()
    }

    /// Snapshot of every session; order carries no meaning.
    pub fn all(&self) -> Vec<Session> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn remove(&self, id: &str) -> Option<Session> {
        let (removed, now_empty) = {
            let mut guard = self.write();
            let removed = guard.shift_remove(id);
            (removed, guard.is_empty())
        };
        if removed.is_some() {
            self.persist();
            if now_empty {
                self.emit(StoreEvent::Emptied);
            }
        }
        removed
    }

    /// Applies `f` to the session under the write lock. Does not persist.
    pub fn update<R>(&self, id: &str, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        let mut guard = self.write();
        guard.get_mut(id).map(f)
    }

    /// Removes sessions idle beyond `threshold` that never got an approval and
    /// have an empty ledger.
    pub fn cleanup_inactive(&self, threshold: Duration) -> usize {
        let now = self.clock.now_ms();
        let limit = millis(threshold);
        let (removed, now_empty) = {
            let mut guard = self.write();
            let before = guard.len();
            guard.retain(|_, s| {
                let idle = now.saturating_sub(s.last_activity) > limit;
                !(idle && !s.has_any_approval() && s.ledger.is_empty())
            });
            (before - guard.len(), guard.is_empty())
        };
        if removed > 0 {
            info!(removed, "cleaned up inactive sessions");
            self.persist();
            if now_empty {
                self.emit(StoreEvent::Emptied);
            }
        }
        removed
    }

    /// Trims every ledger to its `cap` most recent attempts.
    pub fn trim_ledgers(&self, cap: usize) -> usize {
        let dropped: usize = {
            let mut guard = self.write();
            guard.values_mut().map(|s| s.trim_ledger(cap)).sum()
        };
        if dropped > 0 {
            debug!(dropped, cap, "trimmed session ledgers");
        }
        self.persist();
        dropped
    }

    /// Replaces every session. Used by import.
    pub fn replace_all(&self, sessions: Vec<Session>) {
        let ids: Vec<String> = sessions.iter().map(|s| s.id().to_string()).collect();
        {
            let mut guard = self.write();
            guard.clear();
            for session in sessions {
                guard.insert(session.id().to_string(), session);
            }
        }
        self.persist();
        if ids.is_empty() {
            self.emit(StoreEvent::Emptied);
        }
        for id in ids {
            self.emit(StoreEvent::SessionCreated(id));
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Writes the full set; on failure falls back to the essential snapshot,
    /// and on a second failure keeps running in memory.
    pub fn persist(&self) -> PersistOutcome {
        let _save = self.save_lock.lock().unwrap_or_else(|e| e.into_inner());
        let snapshot = self.all();
        let now = self.clock.now_ms();

        let full_err: StoreError = match self.repo.save_all(&snapshot, now) {
            Ok(_) => {
                if self.degraded.swap(false, Ordering::SeqCst) {
                    info!("session persistence recovered");
                }
                return PersistOutcome::Full;
            }
            Err(err) => err,
        };
        self.degraded.store(true, Ordering::SeqCst);
        warn!(error = %full_err, "full session save failed; writing essential snapshot");

        match self.repo.save_essential(&snapshot, self.essential_limit) {
            Ok(kept) => {
                warn!(kept, total = snapshot.len(), "persisted essential session snapshot");
                PersistOutcome::Essential(kept)
            }
            Err(err) => {
                warn!(error = %err, "essential snapshot failed; continuing in memory only");
                PersistOutcome::Failed
            }
        }
    }
}
