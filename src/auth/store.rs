// Session persistence

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::{Mutex, PoisonError, RwLock};

use super::types::Session;

/// Fixed key the single session lives under
pub const SESSION_KEY: &str = "relay:session";

/// Key-value storage for the one active session
///
/// Every write replaces the stored session as a whole.
pub trait SessionStore: Send + Sync {
    fn load(&self) -> Result<Option<Session>>;

    fn save(&self, session: &Session) -> Result<()>;

    fn delete(&self) -> Result<()>;

    /// Time of the last write, when the backend tracks it
    fn updated_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(None)
    }
}

/// SQLite-backed store using an `auth_kv` table
pub struct SqliteSessionStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteSessionStore {
    /// Open (or create) the database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let conn = rusqlite::Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database: {}", path.display()))?;

        Self::with_connection(conn)
    }

    /// Store backed by a private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory()
            .context("Failed to open in-memory SQLite database")?;

        Self::with_connection(conn)
    }

    fn with_connection(conn: rusqlite::Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS auth_kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )
        .context("Failed to create auth_kv table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, rusqlite::Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SessionStore for SqliteSessionStore {
    fn load(&self) -> Result<Option<Session>> {
        let conn = self.conn();
        let value: Option<String> = match conn.query_row(
            "SELECT value FROM auth_kv WHERE key = ?",
            [SESSION_KEY],
            |row| row.get(0),
        ) {
            Ok(value) => Some(value),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(e).context("Failed to load session from SQLite"),
        };

        value
            .map(|json| serde_json::from_str(&json).context("Failed to parse stored session"))
            .transpose()
    }

    fn save(&self, session: &Session) -> Result<()> {
        let json = serde_json::to_string(session).context("Failed to serialize session")?;
        let now = Utc::now().to_rfc3339();

        self.conn()
            .execute(
                "INSERT INTO auth_kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                [SESSION_KEY, json.as_str(), now.as_str()],
            )
            .context("Failed to save session to SQLite")?;

        Ok(())
    }

    fn delete(&self) -> Result<()> {
        self.conn()
            .execute("DELETE FROM auth_kv WHERE key = ?", [SESSION_KEY])
            .context("Failed to delete session from SQLite")?;

        Ok(())
    }

    fn updated_at(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn();
        let raw: String = match conn.query_row(
            "SELECT updated_at FROM auth_kv WHERE key = ?",
            [SESSION_KEY],
            |row| row.get(0),
        ) {
            Ok(raw) => raw,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
            Err(e) => return Err(e).context("Failed to read session timestamp"),
        };

        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .with_context(|| format!("Failed to parse datetime: {}", raw))
    }
}

/// Volatile store, used by tests and one-shot tooling
#[derive(Default)]
pub struct MemorySessionStore {
    session: RwLock<Option<Session>>,
}

impl MemorySessionStore {
    pub fn new(session: Option<Session>) -> Self {
        Self {
            session: RwLock::new(session),
        }
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> Result<Option<Session>> {
        Ok(self
            .session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn save(&self, session: &Session) -> Result<()> {
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = Some(session.clone());
        Ok(())
    }

    fn delete(&self) -> Result<()> {
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_session() -> Session {
        let mut session = Session::new(
            "T0".to_string(),
            Some("R0".to_string()),
            json!({"id": 42, "email": "a@b.c"}),
        );
        session.extra.insert("locale".to_string(), json!("uz"));
        session
    }

    #[test]
    fn test_sqlite_store_roundtrip() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        assert!(store.load().unwrap().is_none());
        assert!(store.updated_at().unwrap().is_none());

        store.save(&sample_session()).unwrap();
        assert_eq!(store.load().unwrap(), Some(sample_session()));
        assert!(store.updated_at().unwrap().is_some());
    }

    #[test]
    fn test_sqlite_store_replaces_whole_session() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        store.save(&sample_session()).unwrap();

        let replacement = Session::new("T1".to_string(), None, json!({"id": 1}));
        store.save(&replacement).unwrap();

        assert_eq!(store.load().unwrap(), Some(replacement));
    }

    #[test]
    fn test_sqlite_store_delete() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        store.save(&sample_session()).unwrap();
        store.delete().unwrap();
        assert!(store.load().unwrap().is_none());

        // Deleting a missing session is not an error
        store.delete().unwrap();
    }

    #[test]
    fn test_sqlite_store_persists_across_reopen() {
        let path = std::env::temp_dir()
            .join(format!("session-relay-{}", uuid::Uuid::new_v4()))
            .join("session.sqlite3");

        {
            let store = SqliteSessionStore::open(&path).unwrap();
            store.save(&sample_session()).unwrap();
        }

        let store = SqliteSessionStore::open(&path).unwrap();
        assert_eq!(store.load().unwrap(), Some(sample_session()));

        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    #[test]
    fn test_sqlite_store_rejects_corrupt_value() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        store
            .conn()
            .execute(
                "INSERT INTO auth_kv (key, value, updated_at) VALUES (?1, 'not json', '')",
                [SESSION_KEY],
            )
            .unwrap();

        assert!(store.load().is_err());
    }

    #[test]
    fn test_memory_store() {
        let store = MemorySessionStore::default();
        assert!(store.load().unwrap().is_none());

        store.save(&sample_session()).unwrap();
        assert_eq!(store.load().unwrap(), Some(sample_session()));

        store.delete().unwrap();
        assert!(store.load().unwrap().is_none());
    }
}
