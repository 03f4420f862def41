use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OpenFlags, Row};

use crate::sqlite::configure_connection;

use super::store::{AuthSession, SessionRoute, SessionStoreError, SessionStoreResult};

const SESSION_SCHEMA: &str = include_str!("../../../sql/sessions.sql");

/// Write-through persistence behind [`super::SessionStore`].
pub trait SessionBackend: Send + Sync {
    fn save(&self, session: &AuthSession) -> SessionStoreResult<()>;
    fn delete(&self, platform_id: &str) -> SessionStoreResult<bool>;
    fn load_all(&self) -> SessionStoreResult<Vec<AuthSession>>;
    fn purge_expired(&self, now: DateTime<Utc>) -> SessionStoreResult<usize>;
}

#[derive(Debug, Clone)]
pub struct SqliteSessionBackendBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteSessionBackendBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteSessionBackendBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> SessionStoreResult<SqliteSessionBackend> {
        let path = self.path.ok_or(SessionStoreError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }
        let backend = SqliteSessionBackend { path, flags };
        if !backend.flags.contains(OpenFlags::SQLITE_OPEN_READ_ONLY) {
            backend.initialize()?;
        }
        Ok(backend)
    }
}

#[derive(Debug, Clone)]
pub struct SqliteSessionBackend {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteSessionBackend {
    pub fn builder() -> SqliteSessionBackendBuilder {
        SqliteSessionBackendBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> SessionStoreResult<Self> {
        SqliteSessionBackendBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> SessionStoreResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            SessionStoreError::Open {
                source,
                path: self.path.clone(),
            }
        })?;
        configure_connection(&conn).map_err(|source| SessionStoreError::Open {
            source,
            path: self.path.clone(),
        })?;
        Ok(conn)
    }

    fn initialize(&self) -> SessionStoreResult<()> {
        let conn = self.open()?;
        conn.execute_batch(SESSION_SCHEMA)?;
        Ok(())
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<(String, Vec<u8>, String, String, String)> {
        Ok((
            row.get("platform_id")?,
            row.get("state")?,
            row.get("issued_at")?,
            row.get("expires_at")?,
            row.get("route")?,
        ))
    }
}

/// Fixed-width UTC text, so SQL string comparison orders by time.
fn stored_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(platform: &str, raw: &str) -> SessionStoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|err| SessionStoreError::InvalidRow {
            platform: platform.to_string(),
            reason: format!("bad timestamp '{raw}': {err}"),
        })
}

impl SessionBackend for SqliteSessionBackend {
    fn save(&self, session: &AuthSession) -> SessionStoreResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO auth_sessions (platform_id, state, issued_at, expires_at, route, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, CURRENT_TIMESTAMP)
             ON CONFLICT(platform_id) DO UPDATE SET
                state = excluded.state,
                issued_at = excluded.issued_at,
                expires_at = excluded.expires_at,
                route = excluded.route,
                updated_at = CURRENT_TIMESTAMP",
            params![
                session.platform_id(),
                session.state(),
                stored_timestamp(session.issued_at()),
                stored_timestamp(session.expires_at()),
                session.route().as_str(),
            ],
        )?;
        Ok(())
    }

    fn delete(&self, platform_id: &str) -> SessionStoreResult<bool> {
        let conn = self.open()?;
        let changed = conn.execute(
            "DELETE FROM auth_sessions WHERE platform_id = ?1",
            params![platform_id],
        )?;
        Ok(changed > 0)
    }

    fn load_all(&self) -> SessionStoreResult<Vec<AuthSession>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT platform_id, state, issued_at, expires_at, route
             FROM auth_sessions ORDER BY platform_id",
        )?;
        let rows = stmt.query_map([], Self::from_row)?;
        let mut sessions = Vec::new();
        for row in rows {
            let (platform_id, state, issued_at, expires_at, route) = row?;
            let issued_at = parse_timestamp(&platform_id, &issued_at)?;
            let expires_at = parse_timestamp(&platform_id, &expires_at)?;
            let route = route
                .parse::<SessionRoute>()
                .map_err(|reason| SessionStoreError::InvalidRow {
                    platform: platform_id.clone(),
                    reason,
                })?;
            sessions.push(AuthSession::from_parts(
                platform_id,
                state,
                issued_at,
                expires_at,
                route,
            ));
        }
        Ok(sessions)
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> SessionStoreResult<usize> {
        let conn = self.open()?;
        let removed = conn.execute(
            "DELETE FROM auth_sessions WHERE expires_at <= ?1",
            params![stored_timestamp(now)],
        )?;
        Ok(removed)
    }
}
