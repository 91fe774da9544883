use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Most recently active non-admin chat.
pub const LAST_USER_KEY: &str = "last_user";
const ADMIN_MESSAGE_PREFIX: &str = "admin_message_";
const USER_MESSAGE_PREFIX: &str = "user_message_";
const ADMIN_RESPONSE_PREFIX: &str = "admin_response_";

/// Maps a message the admin sees back to the user chat it came from.
pub fn admin_message_key(admin_message_id: i64) -> String {
    format!("{ADMIN_MESSAGE_PREFIX}{admin_message_id}")
}

/// Last inbound content from a user (write-only history).
pub fn user_message_key(chat_id: i64) -> String {
    format!("{USER_MESSAGE_PREFIX}{chat_id}")
}

/// Last content the admin sent to a user (write-only history).
pub fn admin_response_key(chat_id: i64) -> String {
    format!("{ADMIN_RESPONSE_PREFIX}{chat_id}")
}

/// String-keyed persistent store for routing state, backed by SQLite.
#[derive(Clone)]
pub struct KvStore {
    conn: Arc<Mutex<Connection>>,
}

impl KvStore {
    /// Open or create the SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        // journal_mode PRAGMA always returns the resulting mode, so use query_row
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;

        Self::run_migrations(&conn)?;

        info!("Key-value store initialized at: {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            ",
        )
        .context("Failed to create kv table")?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM kv WHERE key = ?1",
                rusqlite::params![key],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("Failed to read key: {key}"))?;
        Ok(value)
    }

    /// Insert or overwrite a value. Last write wins.
    pub async fn put(&self, key: &str, value: &str) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at",
            rusqlite::params![key, value, now],
        )
        .with_context(|| format!("Failed to write key: {key}"))?;
        Ok(())
    }

    /// Number of keys starting with `prefix`.
    pub async fn count_prefix(&self, prefix: &str) -> Result<u64> {
        let conn = self.conn.lock().await;
        let pattern = format!("{}%", escape_like(prefix));
        let count: i64 = conn.query_row(
            "SELECT count(*) FROM kv WHERE key LIKE ?1 ESCAPE '\\'",
            rusqlite::params![pattern],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Entries accumulated under `admin_message_`; they are never expired.
    pub async fn admin_message_count(&self) -> Result<u64> {
        self.count_prefix(ADMIN_MESSAGE_PREFIX).await
    }
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
