//! Versioned, chunked persistence of the session set.
//!
//! Layout inside a [`KvStore`]:
//! - `sessions.meta`: [`StoreMeta`]
//! - `sessions.chunk.<i>`: up to `chunk_size` serialized `(id, Session)` pairs
//! - `sessions.essential`: reduced snapshot written when a full save cannot fit
//!
//! Loading prefers the metadata + chunks layout and falls back to the
//! essential record when no metadata exists.

use crate::{AttemptStatus, KvStore, Session, StoreError, StoreResult, Timestamp};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const META_KEY: &str = "sessions.meta";
pub const CHUNK_PREFIX: &str = "sessions.chunk.";
pub const ESSENTIAL_KEY: &str = "sessions.essential";
pub const FORMAT_VERSION: u32 = 1;
pub const DEFAULT_CHUNK_SIZE: usize = 500;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoreMeta {
    pub chunk_count: usize,
    pub total_sessions: usize,
    pub last_updated: Timestamp,
    pub version: u32,
    /// Sum of declared amounts across confirmed attempts.
    pub aggregate_volume: f64,
}

/// Persistence seam for the session registry.
pub trait SessionRepository: Send + Sync {
    fn load_all(&self) -> StoreResult<Vec<Session>>;

    /// Replaces the persisted set with `sessions`.
    fn save_all(&self, sessions: &[Session], now: Timestamp) -> StoreResult<StoreMeta>;

    /// Writes a single chunk record without touching metadata.
    fn append_chunk(&self, index: usize, sessions: &[Session]) -> StoreResult<()>;

    /// Writes the `limit` most recently active sessions as the fallback record.
    fn save_essential(&self, sessions: &[Session], limit: usize) -> StoreResult<usize>;
}

type Entry = (String, Session);

#[derive(Debug, Clone)]
pub struct ChunkedRepository<K> {
    kv: K,
    chunk_size: usize,
}

impl<K: KvStore> ChunkedRepository<K> {
    pub fn new(kv: K) -> Self {
        Self::with_chunk_size(kv, DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(kv: K, chunk_size: usize) -> Self {
        Self {
            kv,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn kv(&self) -> &K {
        &self.kv
    }

    pub fn chunk_key(index: usize) -> String {
        format!("{CHUNK_PREFIX}{index}")
    }

    pub fn read_meta(&self) -> StoreResult<Option<StoreMeta>> {
        match self.kv.get(META_KEY)? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| StoreError::CorruptRecord {
                    key: META_KEY.into(),
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    fn read_entries(&self, key: &str) -> StoreResult<Option<Vec<Entry>>> {
        match self.kv.get(key)? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| StoreError::CorruptRecord {
                    key: key.into(),
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    fn encode(sessions: &[Session]) -> StoreResult<String> {
        let entries: Vec<(&str, &Session)> = sessions.iter().map(|s| (s.id(), s)).collect();
        Ok(serde_json::to_string(&entries)?)
    }

    fn chunk_keys(&self) -> StoreResult<Vec<(usize, String)>> {
        Ok(self
            .kv
            .keys_with_prefix(CHUNK_PREFIX)?
            .into_iter()
            .filter_map(|key| {
                let index = key.strip_prefix(CHUNK_PREFIX)?.parse::<usize>().ok()?;
                Some((index, key))
            })
            .collect())
    }

    fn remove_chunks_from(&self, first_stale: usize) -> StoreResult<usize> {
        let mut removed = 0;
        for (index, key) in self.chunk_keys()? {
            if index >= first_stale {
                self.kv.remove(&key)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn push_entries(out: &mut Vec<Session>, entries: Vec<Entry>, source: &str) {
    for (id, session) in entries {
        if id != session.id() {
            warn!(record = source, %id, "session key does not match embedded id; skipping");
            continue;
        }
        out.push(session);
    }
}

fn aggregate_volume(sessions: &[Session]) -> f64 {
    sessions
        .iter()
        .flat_map(|s| s.ledger.iter())
        .filter(|a| a.status == AttemptStatus::Confirmed)
        .filter_map(|a| a.declared_amount())
        .sum()
}

impl<K: KvStore> SessionRepository for ChunkedRepository<K> {
    fn load_all(&self) -> StoreResult<Vec<Session>> {
        let mut sessions = Vec::new();
        let meta = match self.read_meta() {
            Ok(meta) => meta,
            Err(err) => {
                warn!(error = %err, "session metadata unreadable; trying essential record");
                None
            }
        };

        if let Some(meta) = meta {
            for index in 0..meta.chunk_count {
                let key = Self::chunk_key(index);
                match self.read_entries(&key) {
                    Ok(Some(entries)) => push_entries(&mut sessions, entries, &key),
                    Ok(None) => warn!(chunk = index, "session chunk missing; skipping"),
                    Err(err) => warn!(chunk = index, error = %err, "could not load session chunk"),
                }
            }
            info!(
                sessions = sessions.len(),
                chunks = meta.chunk_count,
                "loaded sessions from chunked store"
            );
            return Ok(sessions);
        }

        if let Some(entries) = self.read_entries(ESSENTIAL_KEY)? {
            push_entries(&mut sessions, entries, ESSENTIAL_KEY);
            info!(sessions = sessions.len(), "loaded sessions from essential record");
        }
        Ok(sessions)
    }

    fn save_all(&self, sessions: &[Session], now: Timestamp) -> StoreResult<StoreMeta> {
        let chunks: Vec<&[Session]> = sessions.chunks(self.chunk_size).collect();
        for (index, chunk) in chunks.iter().enumerate() {
            self.append_chunk(index, chunk)?;
        }

        let meta = StoreMeta {
            chunk_count: chunks.len(),
            total_sessions: sessions.len(),
            last_updated: now,
            version: FORMAT_VERSION,
            aggregate_volume: aggregate_volume(sessions),
        };
        self.kv.set(META_KEY, &serde_json::to_string(&meta)?)?;

        let removed = self.remove_chunks_from(chunks.len())?;
        debug!(
            sessions = meta.total_sessions,
            chunks = meta.chunk_count,
            stale_removed = removed,
            "saved session chunks"
        );
        Ok(meta)
    }

    fn append_chunk(&self, index: usize, sessions: &[Session]) -> StoreResult<()> {
        self.kv.set(&Self::chunk_key(index), &Self::encode(sessions)?)
    }

    fn save_essential(&self, sessions: &[Session], limit: usize) -> StoreResult<usize> {
        let mut recent: Vec<&Session> = sessions.iter().collect();
        recent.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        recent.truncate(limit);
        let kept: Vec<Session> = recent.into_iter().cloned().collect();

        // The chunked layout is now stale; drop it so loads use this record.
        self.kv.remove(META_KEY)?;
        self.remove_chunks_from(0)?;
        self.kv.set(ESSENTIAL_KEY, &Self::encode(&kept)?)?;
        Ok(kept.len())
    }
}
