//! Session tracking: a time-based state machine producing the session id and
//! first/new flags stamped onto every envelope.
//!
//! State transitions are a pure function of `(persisted state, now)` plus
//! one side effect (persisting `{id, acquisition}` when a new session
//! starts), so the whole machine is deterministic under [`ManualClock`].
//!
//! [`ManualClock`]: crate::clock::ManualClock

use crate::clock::Clock;
use crate::envelope::ContextTags;
use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Tag keys the collector understands for session context.
pub const TAG_SESSION_ID: &str = "ai.session.id";
pub const TAG_SESSION_IS_FIRST: &str = "ai.session.isFirst";
pub const TAG_SESSION_IS_NEW: &str = "ai.session.isNew";

/// The durable slice of session state. Renewal time and the flags are
/// recomputed per access and never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSession {
    pub session_id: String,
    pub acquisition_time_ms: u64,
}

/// Durable storage for the session key-value pair.
pub trait SessionStore: Send + Sync {
    fn load(&self) -> Result<Option<PersistedSession>, PipelineError>;
    fn save(&self, session: &PersistedSession) -> Result<(), PipelineError>;
}

/// Session store backed by one small JSON file under the storage root.
#[derive(Debug)]
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(storage_root: &Path) -> Self {
        Self { path: storage_root.join("session.json") }
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self) -> Result<Option<PersistedSession>, PipelineError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, session: &PersistedSession) -> Result<(), PipelineError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_vec(session)?)?;
        Ok(())
    }
}

/// In-memory session store for tests.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    inner: Mutex<Option<PersistedSession>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(session: PersistedSession) -> Self {
        Self { inner: Mutex::new(Some(session)) }
    }

    pub fn saved(&self) -> Option<PersistedSession> {
        self.inner.lock().map(|guard| guard.clone()).unwrap_or(None)
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> Result<Option<PersistedSession>, PipelineError> {
        Ok(self.saved())
    }

    fn save(&self, session: &PersistedSession) -> Result<(), PipelineError> {
        if let Ok(mut guard) = self.inner.lock() {
            *guard = Some(session.clone());
        }
        Ok(())
    }
}

/// Session context computed for one telemetry access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTags {
    pub session_id: String,
    pub is_first: bool,
    pub is_new: bool,
}

impl SessionTags {
    /// Merge into an envelope tag map.
    pub fn apply(&self, tags: &mut ContextTags) {
        tags.insert(TAG_SESSION_ID.to_string(), self.session_id.clone());
        tags.insert(TAG_SESSION_IS_FIRST.to_string(), self.is_first.to_string());
        tags.insert(TAG_SESSION_IS_NEW.to_string(), self.is_new.to_string());
    }
}

#[derive(Debug)]
struct SessionState {
    session_id: String,
    acquisition_ms: u64,
    renewal_ms: u64,
}

/// Renewing session id generator.
///
/// Loads persisted state once at construction; every [`session_tags`] call
/// runs the renewal check against the injected clock.
///
/// [`session_tags`]: SessionManager::session_tags
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
    expiration: Duration,
    renewal: Duration,
    state: Mutex<SessionState>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        clock: Arc<dyn Clock>,
        expiration: Duration,
        renewal: Duration,
    ) -> Self {
        let persisted = store.load().unwrap_or_else(|e| {
            warn!(error = %e, "failed to load persisted session, starting fresh");
            None
        });
        // Absent state means "no prior session": acquisition 0 forces the
        // first access to start a session.
        let state = match persisted {
            Some(p) => SessionState {
                session_id: p.session_id,
                acquisition_ms: p.acquisition_time_ms,
                renewal_ms: 0,
            },
            None => SessionState { session_id: String::new(), acquisition_ms: 0, renewal_ms: 0 },
        };
        Self { store, clock, expiration, renewal, state: Mutex::new(state) }
    }

    /// Run the renewal check and return the session context for this access.
    pub fn session_tags(&self) -> SessionTags {
        let now = self.clock.now_millis();
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let is_first = state.acquisition_ms == 0 || state.renewal_ms == 0;
        let expiration_ms = u64::try_from(self.expiration.as_millis()).unwrap_or(u64::MAX);
        let renewal_ms = u64::try_from(self.renewal.as_millis()).unwrap_or(u64::MAX);
        let acq_expired = now.saturating_sub(state.acquisition_ms) > expiration_ms;
        let renewal_expired = now.saturating_sub(state.renewal_ms) > renewal_ms;

        if is_first || acq_expired || renewal_expired {
            state.session_id = Uuid::new_v4().to_string();
            state.acquisition_ms = now;
            state.renewal_ms = now;
            let persisted = PersistedSession {
                session_id: state.session_id.clone(),
                acquisition_time_ms: state.acquisition_ms,
            };
            if let Err(e) = self.store.save(&persisted) {
                warn!(error = %e, "failed to persist session state");
            }
            debug!(session_id = %state.session_id, is_first, "session renewed");
            SessionTags { session_id: state.session_id.clone(), is_first, is_new: true }
        } else {
            state.renewal_ms = now;
            SessionTags { session_id: state.session_id.clone(), is_first: false, is_new: false }
        }
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("expiration", &self.expiration)
            .field("renewal", &self.renewal)
            .finish_non_exhaustive()
    }
}
