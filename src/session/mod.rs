//! Session module - durable session storage
//!
//! The `SessionStore` is the only mutable shared resource in the runtime.
//! It owns every `Session` and serializes mutations per session key: a
//! read-modify-write runs under that session's exclusive lock while other
//! sessions proceed fully in parallel. Mutations are persisted before
//! `apply_mutation` returns, and an event id already recorded against a
//! session short-circuits to a duplicate no-op (idempotent replay).
//!
//! # Example
//!
//! ```
//! use yoctoclaw::session::{Applied, SessionStore};
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = SessionStore::new_memory();
//!
//!     let applied = store
//!         .apply_mutation("telegram:42", "evt-1", |session| {
//!             session.begin_turn("evt-1", "hello").map(|t| t.id.clone())
//!         })
//!         .await
//!         .unwrap();
//!     assert!(matches!(applied, Applied::Mutated(_)));
//!
//!     // Replaying the same event id is a no-op.
//!     let replay = store
//!         .apply_mutation("telegram:42", "evt-1", |_| ())
//!         .await
//!         .unwrap();
//!     assert!(matches!(replay, Applied::Duplicate));
//! }
//! ```

pub mod types;

pub use types::{Session, SessionStatus, Step, StepKind, StepStatus, Turn, TurnResult};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::warn;

use crate::error::Result;

/// Outcome of [`SessionStore::apply_mutation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied<R> {
    /// The mutation ran; carries the closure's return value.
    Mutated(R),
    /// The event id was already processed for this session; nothing ran.
    Duplicate,
}

impl<R> Applied<R> {
    /// Whether this outcome is a duplicate no-op.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Applied::Duplicate)
    }
}

/// Durable, keyed session store with per-session locking.
pub struct SessionStore {
    /// Each session sits behind its own mutex; holding the outer lock only
    /// long enough to clone the `Arc` keeps sessions independent.
    sessions: Arc<RwLock<HashMap<String, Arc<Mutex<Session>>>>>,
    storage_path: Option<PathBuf>,
}

impl SessionStore {
    /// In-memory store without persistence, for tests and ephemeral runs.
    pub fn new_memory() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            storage_path: None,
        }
    }

    /// File-backed store: one JSON record per session key under `path`.
    pub fn with_path(path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&path)?;
        Ok(Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            storage_path: Some(path),
        })
    }

    /// Get an existing session or create a new idle one, returning a
    /// snapshot. Created on first inbound event for an unseen key.
    pub async fn get_or_create(&self, key: &str) -> Result<Session> {
        let entry = self.entry(key).await?;
        let session = entry.lock().await;
        Ok(session.clone())
    }

    /// Snapshot of a session without creating it.
    pub async fn get(&self, key: &str) -> Result<Option<Session>> {
        {
            let sessions = self.sessions.read().await;
            if let Some(entry) = sessions.get(key) {
                let entry = Arc::clone(entry);
                drop(sessions);
                let session = entry.lock().await;
                return Ok(Some(session.clone()));
            }
        }

        if let Some(loaded) = self.load_from_disk(key).await? {
            let entry = self.cache(key, loaded).await;
            let session = entry.lock().await;
            return Ok(Some(session.clone()));
        }

        Ok(None)
    }

    /// Read-modify-write under the session's exclusive lock.
    ///
    /// If `event_id` was already processed for this session the closure
    /// never runs and `Applied::Duplicate` is returned. Otherwise the
    /// closure runs, the event id is recorded, the sequence counter is
    /// bumped, and the session is persisted before this returns.
    pub async fn apply_mutation<R>(
        &self,
        key: &str,
        event_id: &str,
        f: impl FnOnce(&mut Session) -> R,
    ) -> Result<Applied<R>> {
        let entry = self.entry(key).await?;
        let mut session = entry.lock().await;

        if session.has_processed(event_id) {
            return Ok(Applied::Duplicate);
        }

        let result = f(&mut session);
        session.record_processed(event_id);
        session.seq += 1;

        self.persist(&session).await?;
        Ok(Applied::Mutated(result))
    }

    /// Mark a session permanently failed, failing any open turn.
    pub async fn mark_failed(&self, key: &str, reason: &str) -> Result<()> {
        let entry = self.entry(key).await?;
        let mut session = entry.lock().await;

        if let Some(turn) = session.open_turn_mut() {
            for step in turn.steps.iter_mut() {
                if !step.is_terminal() {
                    step.fail(reason);
                }
            }
            turn.conclude(TurnResult::Error {
                message: reason.to_string(),
            })?;
        }
        session.status = SessionStatus::Failed;
        session.seq += 1;

        self.persist(&session).await?;
        Ok(())
    }

    /// All known session keys, from memory and disk.
    pub async fn keys(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = {
            let sessions = self.sessions.read().await;
            sessions.keys().cloned().collect()
        };

        if let Some(dir) = &self.storage_path {
            let mut entries = tokio::fs::read_dir(dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().map(|e| e == "json").unwrap_or(false) {
                    if let Ok(content) = tokio::fs::read_to_string(&path).await {
                        if let Ok(session) = serde_json::from_str::<Session>(&content) {
                            if !keys.contains(&session.key) {
                                keys.push(session.key);
                            }
                        }
                    }
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    /// Number of sessions currently held in memory.
    pub async fn cache_size(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn entry(&self, key: &str) -> Result<Arc<Mutex<Session>>> {
        {
            let sessions = self.sessions.read().await;
            if let Some(entry) = sessions.get(key) {
                return Ok(Arc::clone(entry));
            }
        }

        let session = match self.load_from_disk(key).await? {
            Some(session) => session,
            None => Session::new(key),
        };
        Ok(self.cache(key, session).await)
    }

    async fn cache(&self, key: &str, session: Session) -> Arc<Mutex<Session>> {
        let mut sessions = self.sessions.write().await;
        // A racing caller may have inserted first; keep theirs.
        Arc::clone(
            sessions
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(session))),
        )
    }

    async fn load_from_disk(&self, key: &str) -> Result<Option<Session>> {
        let Some(dir) = &self.storage_path else {
            return Ok(None);
        };
        let path = dir.join(format!("{}.json", sanitize_key(key)));
        if !path.exists() {
            return Ok(None);
        }
        let content = tokio::fs::read_to_string(&path).await?;
        match serde_json::from_str::<Session>(&content) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                warn!(key = %key, error = %e, "Unreadable session record, starting fresh");
                Ok(None)
            }
        }
    }

    /// Write the session record via temp file + atomic rename so a crash
    /// mid-write never leaves a half-written record.
    async fn persist(&self, session: &Session) -> Result<()> {
        let Some(dir) = &self.storage_path else {
            return Ok(());
        };
        let path = dir.join(format!("{}.json", sanitize_key(&session.key)));
        let tmp = dir.join(format!("{}.json.tmp", sanitize_key(&session.key)));

        let content = serde_json::to_string_pretty(session)?;
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

impl Clone for SessionStore {
    fn clone(&self) -> Self {
        Self {
            sessions: Arc::clone(&self.sessions),
            storage_path: self.storage_path.clone(),
        }
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new_memory()
    }
}

/// Percent-encode a session key into a safe, bijective filename.
fn sanitize_key(key: &str) -> String {
    let mut result = String::with_capacity(key.len() * 3);
    for c in key.chars() {
        match c {
            '/' => result.push_str("%2F"),
            '\\' => result.push_str("%5C"),
            ':' => result.push_str("%3A"),
            '*' => result.push_str("%2A"),
            '?' => result.push_str("%3F"),
            '"' => result.push_str("%22"),
            '<' => result.push_str("%3C"),
            '>' => result.push_str("%3E"),
            '|' => result.push_str("%7C"),
            '%' => result.push_str("%25"),
            c => result.push(c),
        }
    }
    result
}
