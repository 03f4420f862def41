use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use super::backend::SessionBackend;

#[derive(Debug, Error)]
pub enum SessionStoreError {
    #[error("failed to open session database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("session database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("session path not configured")]
    MissingStore,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid session row for {platform}: {reason}")]
    InvalidRow { platform: String, reason: String },
}

pub type SessionStoreResult<T> = Result<T, SessionStoreError>;

/// How the stored session was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionRoute {
    Credentials,
    SecondFactor,
    SecondaryWindow,
}

impl SessionRoute {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionRoute::Credentials => "credentials",
            SessionRoute::SecondFactor => "second_factor",
            SessionRoute::SecondaryWindow => "secondary_window",
        }
    }
}

impl fmt::Display for SessionRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionRoute {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "credentials" => Ok(Self::Credentials),
            "second_factor" => Ok(Self::SecondFactor),
            "secondary_window" => Ok(Self::SecondaryWindow),
            other => Err(format!("unknown session route '{other}'")),
        }
    }
}

/// Captured authenticated state for one platform. Never mutated; a new
/// login produces a new value that replaces it.
#[derive(Clone, PartialEq)]
pub struct AuthSession {
    platform_id: String,
    state: Vec<u8>,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    route: SessionRoute,
}

impl fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSession")
            .field("platform_id", &self.platform_id)
            .field("state", &format_args!("<{} bytes>", self.state.len()))
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("route", &self.route)
            .finish()
    }
}

impl AuthSession {
    pub fn issue(
        platform_id: impl Into<String>,
        state: Vec<u8>,
        issued_at: DateTime<Utc>,
        ttl: Duration,
        route: SessionRoute,
    ) -> Self {
        Self {
            platform_id: platform_id.into(),
            state,
            issued_at,
            expires_at: issued_at + ttl,
            route,
        }
    }

    pub(crate) fn from_parts(
        platform_id: String,
        state: Vec<u8>,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        route: SessionRoute,
    ) -> Self {
        Self {
            platform_id,
            state,
            issued_at,
            expires_at,
            route,
        }
    }

    pub fn platform_id(&self) -> &str {
        &self.platform_id
    }

    /// Opaque engine blob; replayed byte for byte.
    pub fn state(&self) -> &[u8] {
        &self.state
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn route(&self) -> SessionRoute {
        self.route
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionEntry {
    pub platform_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub route: SessionRoute,
    pub state_bytes: usize,
    pub valid: bool,
}

/// Process-wide cache of authenticated sessions keyed by platform id.
///
/// Entries are swapped as whole `Arc`s, so a concurrent `get` observes either
/// the previous session or the new one.
#[derive(Default)]
pub struct SessionStore {
    entries: RwLock<HashMap<String, Arc<AuthSession>>>,
    backend: Option<Arc<dyn SessionBackend>>,
}

impl fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStore")
            .field("entries", &self.read().len())
            .field("persistent", &self.backend.is_some())
            .finish()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(backend: Arc<dyn SessionBackend>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            backend: Some(backend),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<AuthSession>>> {
        match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<AuthSession>>> {
        match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn get(&self, platform_id: &str) -> Option<Arc<AuthSession>> {
        self.get_at(platform_id, Utc::now())
    }

    /// Returns the session only while `now < expires_at`.
    pub fn get_at(&self, platform_id: &str, now: DateTime<Utc>) -> Option<Arc<AuthSession>> {
        let session = self.read().get(platform_id).cloned()?;
        if session.is_valid_at(now) {
            Some(session)
        } else {
            debug!(platform = platform_id, expired_at = %session.expires_at(), "cached session expired");
            None
        }
    }

    /// Last writer wins. The in-memory entry is replaced even when the
    /// write-through to the backend fails.
    pub fn put(&self, session: AuthSession) -> SessionStoreResult<Arc<AuthSession>> {
        let session = Arc::new(session);
        self.write()
            .insert(session.platform_id().to_string(), Arc::clone(&session));
        info!(
            platform = %session.platform_id(),
            expires_at = %session.expires_at(),
            route = %session.route(),
            "session stored"
        );
        if let Some(backend) = &self.backend {
            backend.save(&session)?;
        }
        Ok(session)
    }

    pub fn invalidate(&self, platform_id: &str) -> SessionStoreResult<bool> {
        let removed = self.write().remove(platform_id).is_some();
        let persisted = match &self.backend {
            Some(backend) => backend.delete(platform_id)?,
            None => false,
        };
        if removed || persisted {
            info!(platform = platform_id, "session invalidated");
        }
        Ok(removed || persisted)
    }

    pub fn list(&self) -> Vec<SessionEntry> {
        self.list_at(Utc::now())
    }

    pub fn list_at(&self, now: DateTime<Utc>) -> Vec<SessionEntry> {
        let mut entries: Vec<SessionEntry> = self
            .read()
            .values()
            .map(|session| SessionEntry {
                platform_id: session.platform_id().to_string(),
                issued_at: session.issued_at(),
                expires_at: session.expires_at(),
                route: session.route(),
                state_bytes: session.state().len(),
                valid: session.is_valid_at(now),
            })
            .collect();
        entries.sort_by(|a, b| a.platform_id.cmp(&b.platform_id));
        entries
    }

    pub fn purge_expired(&self, now: DateTime<Utc>) -> SessionStoreResult<usize> {
        let mut removed = {
            let mut entries = self.write();
            let before = entries.len();
            entries.retain(|_, session| session.is_valid_at(now));
            before - entries.len()
        };
        if let Some(backend) = &self.backend {
            removed = removed.max(backend.purge_expired(now)?);
        }
        Ok(removed)
    }

    /// Warms the cache from the backend, skipping expired rows and rows older
    /// than what is already cached.
    pub fn load_from_backend(&self) -> SessionStoreResult<usize> {
        let Some(backend) = &self.backend else {
            return Ok(0);
        };
        let now = Utc::now();
        let mut loaded = 0;
        let mut entries = self.write();
        for session in backend.load_all()? {
            if !session.is_valid_at(now) {
                continue;
            }
            let newer = entries
                .get(session.platform_id())
                .map(|current| session.issued_at() > current.issued_at())
                .unwrap_or(true);
            if newer {
                entries.insert(session.platform_id().to_string(), Arc::new(session));
                loaded += 1;
            }
        }
        if loaded > 0 {
            info!(loaded, "sessions restored from backend");
        }
        Ok(loaded)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
