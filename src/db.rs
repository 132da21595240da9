// Handles SQLite database operations

use crate::error::{ChatError, ChatResult};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Connection shared by the preference and session stores.
pub type SharedConnection = Arc<Mutex<Connection>>;

const SCHEMA_VERSION: i32 = 1;

const SCHEMA: &str = "
    PRAGMA foreign_keys = ON;

    CREATE TABLE IF NOT EXISTS app_config (
        key TEXT PRIMARY KEY,
        value TEXT
    );

    CREATE TABLE IF NOT EXISTS chat_sessions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        title TEXT NOT NULL,
        created_at TIMESTAMP NOT NULL
    );

    CREATE TABLE IF NOT EXISTS chat_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id INTEGER NOT NULL REFERENCES chat_sessions(id) ON DELETE CASCADE,
        user_message TEXT NOT NULL,
        model_response TEXT NOT NULL,
        timestamp TIMESTAMP NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_chat_history_session
        ON chat_history(session_id, id);
";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub id: i64,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

/// One completed request/response exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub session_id: i64,
    pub user_message: String,
    pub model_response: String,
    pub timestamp: DateTime<Utc>,
}

// Initialize SQLite Database at the given path
pub fn init_db(path: &Path) -> ChatResult<SharedConnection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| {
                ChatError::Persistence(format!(
                    "failed to create database directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }
    }

    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    apply_schema(&conn)?;
    info!(path = %path.display(), "opened chat database");

    Ok(Arc::new(Mutex::new(conn)))
}

/// Opens a private in-memory database with the full schema.
pub fn open_in_memory() -> ChatResult<SharedConnection> {
    let conn = Connection::open_in_memory()?;
    apply_schema(&conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

fn apply_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA)?;
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)
}

/// Inserts or updates a configuration key-value pair.
pub fn update_config_value(conn: &Connection, key: &str, value: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO app_config (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        [key, value],
    )?;
    Ok(())
}

/// Retrieves a configuration value by key. Returns `None` if the key doesn't exist.
pub fn get_config_value(conn: &Connection, key: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM app_config WHERE key = ?1",
        [key],
        |row| row.get::<_, Option<String>>(0),
    )
    .optional()
    .map(Option::flatten)
}

/// Key/value settings such as the selected model.
#[derive(Clone)]
pub struct PreferenceStore {
    conn: SharedConnection,
}

impl PreferenceStore {
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    pub async fn get(&self, key: &str) -> ChatResult<Option<String>> {
        let conn = self.conn.lock().await;
        Ok(get_config_value(&conn, key)?)
    }

    pub async fn set(&self, key: &str, value: &str) -> ChatResult<()> {
        let conn = self.conn.lock().await;
        update_config_value(&conn, key, value)?;
        debug!(key, "preference saved");
        Ok(())
    }
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        title: row.get(1)?,
        created_at: row.get(2)?,
    })
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<HistoryEntry> {
    Ok(HistoryEntry {
        id: row.get(0)?,
        session_id: row.get(1)?,
        user_message: row.get(2)?,
        model_response: row.get(3)?,
        timestamp: row.get(4)?,
    })
}

fn session_exists(conn: &Connection, id: i64) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM chat_sessions WHERE id = ?1)",
        params![id],
        |row| row.get(0),
    )
}

fn insert_session(conn: &Connection, title: &str) -> rusqlite::Result<Session> {
    let created_at = Utc::now();
    conn.execute(
        "INSERT INTO chat_sessions (title, created_at) VALUES (?1, ?2)",
        params![title, created_at],
    )?;

    Ok(Session {
        id: conn.last_insert_rowid(),
        title: title.to_string(),
        created_at,
    })
}

fn insert_entry(
    conn: &Connection,
    session_id: i64,
    user_message: &str,
    model_response: &str,
) -> rusqlite::Result<HistoryEntry> {
    let timestamp = Utc::now();
    conn.execute(
        "INSERT INTO chat_history (session_id, user_message, model_response, timestamp)
         VALUES (?1, ?2, ?3, ?4)",
        params![session_id, user_message, model_response, timestamp],
    )?;

    Ok(HistoryEntry {
        id: conn.last_insert_rowid(),
        session_id,
        user_message: user_message.to_string(),
        model_response: model_response.to_string(),
        timestamp,
    })
}

/// Owns the `chat_sessions` and `chat_history` tables.
///
/// Every method holds the connection lock for its whole body, and the
/// multi-statement ones run inside a transaction, so a delete and an
/// append against the same session never interleave.
#[derive(Clone)]
pub struct SessionStore {
    conn: SharedConnection,
}

impl SessionStore {
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    pub async fn create_session(&self, title: &str) -> ChatResult<Session> {
        let conn = self.conn.lock().await;
        let session = insert_session(&conn, title)?;
        info!(session_id = session.id, "created chat session");
        Ok(session)
    }

    /// Creates a session together with its first exchange.
    pub async fn start_session(
        &self,
        title: &str,
        user_message: &str,
        model_response: &str,
    ) -> ChatResult<(Session, HistoryEntry)> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let session = insert_session(&tx, title)?;
        let entry = insert_entry(&tx, session.id, user_message, model_response)?;
        tx.commit()?;

        info!(session_id = session.id, "created chat session");
        Ok((session, entry))
    }

    pub async fn get_session(&self, id: i64) -> ChatResult<Option<Session>> {
        let conn = self.conn.lock().await;
        let session = conn
            .query_row(
                "SELECT id, title, created_at FROM chat_sessions WHERE id = ?1",
                params![id],
                session_from_row,
            )
            .optional()?;
        Ok(session)
    }

    /// Most recently created session, if any.
    pub async fn latest_session(&self) -> ChatResult<Option<Session>> {
        let conn = self.conn.lock().await;
        let session = conn
            .query_row(
                "SELECT id, title, created_at FROM chat_sessions
                 ORDER BY created_at DESC, id DESC LIMIT 1",
                [],
                session_from_row,
            )
            .optional()?;
        Ok(session)
    }

    /// Newest first.
    pub async fn list_sessions(&self) -> ChatResult<Vec<Session>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, title, created_at FROM chat_sessions ORDER BY created_at DESC, id DESC",
        )?;
        let sessions = stmt
            .query_map([], session_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sessions)
    }

    pub async fn rename_session(&self, id: i64, title: &str) -> ChatResult<()> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE chat_sessions SET title = ?1 WHERE id = ?2",
            params![title, id],
        )?;

        if updated == 0 {
            return Err(ChatError::NotFound(id));
        }
        info!(session_id = id, "renamed chat session");
        Ok(())
    }

    /// Removes the session and its whole history in one transaction.
    pub async fn delete_session(&self, id: i64) -> ChatResult<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let entries = tx.execute("DELETE FROM chat_history WHERE session_id = ?1", params![id])?;
        let deleted = tx.execute("DELETE FROM chat_sessions WHERE id = ?1", params![id])?;

        if deleted == 0 {
            // dropping the transaction rolls it back
            return Err(ChatError::NotFound(id));
        }
        tx.commit()?;

        info!(session_id = id, entries, "deleted chat session");
        Ok(())
    }

    pub async fn append_history(
        &self,
        session_id: i64,
        user_message: &str,
        model_response: &str,
    ) -> ChatResult<HistoryEntry> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        if !session_exists(&tx, session_id)? {
            return Err(ChatError::NotFound(session_id));
        }
        let entry = insert_entry(&tx, session_id, user_message, model_response)?;
        tx.commit()?;

        debug!(session_id, entry_id = entry.id, "appended chat history");
        Ok(entry)
    }

    /// Appends an exchange and, in the same transaction, gives the session
    /// `title` if it is still untitled. A title set in the meantime is kept.
    pub async fn append_history_titled(
        &self,
        session_id: i64,
        user_message: &str,
        model_response: &str,
        title: &str,
    ) -> ChatResult<HistoryEntry> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        if !session_exists(&tx, session_id)? {
            return Err(ChatError::NotFound(session_id));
        }
        let entry = insert_entry(&tx, session_id, user_message, model_response)?;
        let titled = tx.execute(
            "UPDATE chat_sessions SET title = ?1 WHERE id = ?2 AND title = ''",
            params![title, session_id],
        )?;
        tx.commit()?;

        debug!(session_id, entry_id = entry.id, titled, "appended chat history");
        Ok(entry)
    }

    /// Chronological history; empty when the session has none or does not exist.
    pub async fn load_history(&self, session_id: i64) -> ChatResult<Vec<HistoryEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, session_id, user_message, model_response, timestamp
             FROM chat_history WHERE session_id = ?1 ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map(params![session_id], entry_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stores() -> (SharedConnection, SessionStore, PreferenceStore) {
        let conn = open_in_memory().unwrap();
        (
            conn.clone(),
            SessionStore::new(conn.clone()),
            PreferenceStore::new(conn),
        )
    }

    async fn count_rows(conn: &SharedConnection, sql: &str) -> i64 {
        conn.lock().await.query_row(sql, [], |row| row.get(0)).unwrap()
    }

    #[tokio::test]
    async fn preference_get_returns_none_when_unset() {
        let (_, _, prefs) = stores();
        assert_eq!(prefs.get("selected_model_name").await.unwrap(), None);
    }

    #[tokio::test]
    async fn preference_set_overwrites_existing_value() {
        let (conn, _, prefs) = stores();
        prefs.set("selected_model_name", "llama3.2:1b").await.unwrap();
        prefs.set("selected_model_name", "qwen2.5:7b").await.unwrap();

        assert_eq!(
            prefs.get("selected_model_name").await.unwrap().as_deref(),
            Some("qwen2.5:7b")
        );
        assert_eq!(count_rows(&conn, "SELECT COUNT(*) FROM app_config").await, 1);
    }

    #[tokio::test]
    async fn sessions_are_listed_newest_first() {
        let (_, store, _) = stores();
        let first = store.create_session("first").await.unwrap();
        let second = store.create_session("second").await.unwrap();
        let third = store.create_session("third").await.unwrap();

        let ids: Vec<i64> = store
            .list_sessions()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec![third.id, second.id, first.id]);
    }

    #[tokio::test]
    async fn equal_creation_times_fall_back_to_id_order() {
        let (conn, store, _) = stores();
        {
            let conn = conn.lock().await;
            let stamp = Utc::now();
            for title in ["a", "b", "c"] {
                conn.execute(
                    "INSERT INTO chat_sessions (title, created_at) VALUES (?1, ?2)",
                    params![title, stamp],
                )
                .unwrap();
            }
        }

        let titles: Vec<String> = store
            .list_sessions()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.title)
            .collect();
        assert_eq!(titles, vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn rename_updates_title_in_place() {
        let (_, store, _) = stores();
        let session = store.create_session("draft").await.unwrap();
        store.rename_session(session.id, "final").await.unwrap();

        let renamed = store.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(renamed.title, "final");
        assert_eq!(renamed.created_at, session.created_at);
    }

    #[tokio::test]
    async fn rename_unknown_session_is_not_found() {
        let (_, store, _) = stores();
        assert_eq!(
            store.rename_session(42, "nope").await,
            Err(ChatError::NotFound(42))
        );
    }

    #[tokio::test]
    async fn delete_removes_session_and_history() {
        let (conn, store, _) = stores();
        let keep = store.create_session("keep").await.unwrap();
        let doomed = store.create_session("doomed").await.unwrap();
        store.append_history(doomed.id, "q1", "a1").await.unwrap();
        store.append_history(doomed.id, "q2", "a2").await.unwrap();
        store.append_history(keep.id, "q", "a").await.unwrap();

        store.delete_session(doomed.id).await.unwrap();

        let ids: Vec<i64> = store
            .list_sessions()
            .await
            .unwrap()
            .iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec![keep.id]);
        assert!(store.load_history(doomed.id).await.unwrap().is_empty());
        assert_eq!(
            count_rows(
                &conn,
                "SELECT COUNT(*) FROM chat_history
                 WHERE session_id NOT IN (SELECT id FROM chat_sessions)"
            )
            .await,
            0
        );
        assert_eq!(store.load_history(keep.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_unknown_session_is_not_found() {
        let (_, store, _) = stores();
        assert_eq!(store.delete_session(3).await, Err(ChatError::NotFound(3)));
    }

    #[tokio::test]
    async fn deleted_ids_are_never_reused() {
        let (_, store, _) = stores();
        let first = store.create_session("one").await.unwrap();
        store.delete_session(first.id).await.unwrap();
        let second = store.create_session("two").await.unwrap();
        assert!(second.id > first.id);
    }

    #[tokio::test]
    async fn appended_entry_comes_back_last() {
        let (_, store, _) = stores();
        let session = store.create_session("chat").await.unwrap();
        let first = store.append_history(session.id, "hi", "hello").await.unwrap();
        let second = store
            .append_history(session.id, "how are you?", "fine")
            .await
            .unwrap();

        let history = store.load_history(session.id).await.unwrap();
        assert_eq!(history, vec![first, second]);
    }

    #[tokio::test]
    async fn append_to_missing_session_writes_nothing() {
        let (conn, store, _) = stores();
        assert_eq!(
            store.append_history(9, "hi", "hello").await,
            Err(ChatError::NotFound(9))
        );
        assert_eq!(count_rows(&conn, "SELECT COUNT(*) FROM chat_history").await, 0);
    }

    #[tokio::test]
    async fn titled_append_only_fills_an_empty_title() {
        let (_, store, _) = stores();
        let untitled = store.create_session("").await.unwrap();
        let named = store.create_session("Mine").await.unwrap();

        store
            .append_history_titled(untitled.id, "hi", "hello", "hi")
            .await
            .unwrap();
        store
            .append_history_titled(named.id, "hi", "hello", "hi")
            .await
            .unwrap();

        let untitled = store.get_session(untitled.id).await.unwrap().unwrap();
        let named = store.get_session(named.id).await.unwrap().unwrap();
        assert_eq!(untitled.title, "hi");
        assert_eq!(named.title, "Mine");
        assert_eq!(store.load_history(named.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn titled_append_to_missing_session_is_not_found() {
        let (conn, store, _) = stores();
        assert_eq!(
            store.append_history_titled(5, "hi", "hello", "hi").await,
            Err(ChatError::NotFound(5))
        );
        assert_eq!(count_rows(&conn, "SELECT COUNT(*) FROM chat_history").await, 0);
    }

    #[tokio::test]
    async fn load_history_of_missing_session_is_empty() {
        let (_, store, _) = stores();
        assert!(store.load_history(1234).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn start_session_records_first_exchange() {
        let (_, store, _) = stores();
        let (session, entry) = store.start_session("hello", "hello", "hi there").await.unwrap();

        assert_eq!(entry.session_id, session.id);
        assert_eq!(store.load_history(session.id).await.unwrap(), vec![entry]);
        assert_eq!(
            store.latest_session().await.unwrap().map(|s| s.id),
            Some(session.id)
        );
    }

    #[tokio::test]
    async fn init_db_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("chat.db");

        let conn = init_db(&path).unwrap();
        let store = SessionStore::new(conn);
        store.create_session("persisted").await.unwrap();

        assert!(path.exists());
    }
}
