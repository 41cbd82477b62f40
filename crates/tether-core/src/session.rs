//! Session registry.
//!
//! Tracks conversational sessions multiplexed over any transport. Every
//! mutation takes the registry's write lock, so concurrent callers never
//! observe a duplicated id or a lost revision bump.
//!
//! Ids are 128 random bits rendered as lowercase hex. Every id ever issued
//! stays reserved for the registry's lifetime, including ids of removed
//! sessions.

use crate::auth::{authorize, CredentialValidator};
use crate::config::SessionConfig;
use crate::error::{Result, TetherError};
use crate::event::{Event, Frame, StreamState};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::{debug, info};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Initializing,
    Active,
    Paused,
    Completed,
    Failed,
}

impl From<StreamState> for SessionState {
    fn from(state: StreamState) -> Self {
        match state {
            StreamState::Connecting => SessionState::Initializing,
            StreamState::Streaming => SessionState::Active,
            StreamState::Paused => SessionState::Paused,
            StreamState::Completed => SessionState::Completed,
            StreamState::Failed => SessionState::Failed,
        }
    }
}

/// A conversational session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub state: SessionState,
    pub model: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Number of patches applied. Never decreases.
    pub revision: u64,
}

impl Session {
    /// Time since the last recorded activity.
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_activity).to_std().unwrap_or_default()
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    sessions: HashMap<String, Session>,
    issued: HashSet<String>,
}

/// Thread-safe id-to-session map.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    inner: RwLock<RegistryInner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn random_id() -> String {
        let mut bytes = [0u8; SessionConfig::ID_BYTES];
        rand::rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// Start a session for `model` in state `Initializing` at revision 0.
    pub fn create(&self, model: impl Into<String>) -> Session {
        let mut inner = self.write();
        let id = loop {
            let candidate = Self::random_id();
            if inner.issued.insert(candidate.clone()) {
                break candidate;
            }
        };
        let now = Utc::now();
        let session = Session {
            id: id.clone(),
            state: SessionState::Initializing,
            model: model.into(),
            created_at: now,
            last_activity: now,
            revision: 0,
        };
        inner.sessions.insert(id, session.clone());
        info!("Created session {} for model {}", session.id, session.model);
        session
    }

    /// Create a session after checking the caller's bearer credential for
    /// the session-creation scope.
    pub async fn create_authorized(
        &self,
        validator: &dyn CredentialValidator,
        credential: &str,
        model: impl Into<String>,
    ) -> Result<Session> {
        authorize(validator, credential, SessionConfig::CREATE_SCOPE).await?;
        Ok(self.create(model))
    }

    /// Snapshot of a session.
    pub fn get(&self, id: &str) -> Option<Session> {
        self.read().sessions.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().sessions.contains_key(id)
    }

    fn with_session<T>(&self, id: &str, f: impl FnOnce(&mut Session) -> T) -> Result<T> {
        let mut inner = self.write();
        let session = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| TetherError::SessionNotFound {
                session_id: id.to_string(),
            })?;
        Ok(f(session))
    }

    /// Refresh `last_activity`.
    pub fn touch(&self, id: &str) -> Result<()> {
        self.with_session(id, |s| s.last_activity = Utc::now())
    }

    /// Increment the revision, returning the new value.
    pub fn bump_revision(&self, id: &str) -> Result<u64> {
        self.with_session(id, |s| {
            s.revision += 1;
            s.last_activity = Utc::now();
            s.revision
        })
    }

    pub fn set_state(&self, id: &str, state: SessionState) -> Result<()> {
        self.with_session(id, |s| {
            if s.state != state {
                debug!("Session {} {:?} -> {:?}", s.id, s.state, state);
            }
            s.state = state;
            s.last_activity = Utc::now();
        })
    }

    /// Apply one inbound frame to its session.
    ///
    /// Every event refreshes activity. `Patch` bumps the revision, `Status`
    /// sets the matching state, `Done` completes the session and `Error`
    /// fails it. The first token marks the session active.
    pub fn apply_frame(&self, frame: &Frame) -> Result<Session> {
        self.with_session(&frame.session_id, |s| {
            s.last_activity = Utc::now();
            match &frame.event {
                Event::Patch { .. } => s.revision += 1,
                Event::Status { state } => s.state = (*state).into(),
                Event::Token { .. } if s.state == SessionState::Initializing => {
                    s.state = SessionState::Active
                }
                Event::Done => s.state = SessionState::Completed,
                Event::Error { .. } => s.state = SessionState::Failed,
                _ => {}
            }
            s.clone()
        })
    }

    /// Delete a session. Its id stays reserved.
    pub fn remove(&self, id: &str) -> Option<Session> {
        let removed = self.write().sessions.remove(id);
        if removed.is_some() {
            info!("Removed session {}", id);
        }
        removed
    }

    /// Remove every session idle for longer than `max_idle`.
    pub fn remove_idle(&self, max_idle: Duration) -> Vec<Session> {
        let now = Utc::now();
        let mut inner = self.write();
        let expired: Vec<String> = inner
            .sessions
            .values()
            .filter(|s| s.idle_for(now) > max_idle)
            .map(|s| s.id.clone())
            .collect();
        let removed: Vec<Session> = expired
            .iter()
            .filter_map(|id| inner.sessions.remove(id))
            .collect();
        if !removed.is_empty() {
            info!("Expired {} idle sessions", removed.len());
        }
        removed
    }

    /// Snapshot of every live session.
    pub fn list(&self) -> Vec<Session> {
        self.read().sessions.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().sessions.is_empty()
    }
}
