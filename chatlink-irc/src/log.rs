//! SQLite message log, one database per connection.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chatlink_core::config::chat_log_dir;
use chatlink_core::session::LoggedMessage;
use chatlink_core::{MessageSink, MessageSinkProvider};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use std::sync::Arc;
use uuid::Uuid;

/// Log database file name inside a connection's log directory.
pub const LOG_FILE_NAME: &str = "messages.db";

/// Message log backed by one SQLite file.
///
/// `close` drops the database handle; later `record` calls fail.
pub struct SqliteMessageSink {
    conn: Mutex<Option<Connection>>,
}

impl SqliteMessageSink {
    /// Open (or create) the log at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        let conn = Connection::open(path).with_context(|| format!("opening {}", path.display()))?;
        Self::init(conn)
    }

    /// Open an in-memory log (for testing).
    pub fn open_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS messages (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                target    TEXT NOT NULL,
                sender    TEXT NOT NULL,
                text      TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                notice    INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_messages_target_ts ON messages(target, timestamp);
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Recent messages for a target, oldest first.
    pub fn recent(&self, target: &str, limit: usize) -> Result<Vec<LoggedMessage>> {
        let guard = self.conn.lock();
        let conn = guard.as_ref().context("message log is closed")?;
        let mut stmt = conn.prepare(
            "SELECT target, sender, text, timestamp, notice FROM messages
             WHERE target = ?1 ORDER BY timestamp DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![target, limit as i64], |row| {
            Ok(LoggedMessage {
                target: row.get(0)?,
                from: row.get(1)?,
                text: row.get(2)?,
                timestamp_ms: row.get(3)?,
                notice: row.get::<_, i64>(4)? != 0,
            })
        })?;
        let mut messages = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        messages.reverse();
        Ok(messages)
    }
}

impl MessageSink for SqliteMessageSink {
    fn record(&self, message: &LoggedMessage) -> Result<()> {
        let guard = self.conn.lock();
        let conn = guard.as_ref().context("message log is closed")?;
        conn.execute(
            "INSERT INTO messages (target, sender, text, timestamp, notice)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                message.target,
                message.from,
                message.text,
                message.timestamp_ms,
                message.notice as i64
            ],
        )?;
        Ok(())
    }

    fn last_timestamp(&self, target: &str) -> Result<Option<i64>> {
        let guard = self.conn.lock();
        let conn = guard.as_ref().context("message log is closed")?;
        let ts = conn
            .query_row(
                "SELECT MAX(timestamp) FROM messages WHERE target = ?1",
                params![target],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()?
            .flatten();
        Ok(ts)
    }

    fn close(&self) {
        if let Some(conn) = self.conn.lock().take()
            && let Err((_, e)) = conn.close()
        {
            tracing::warn!(error = %e, "Failed to close message log");
        }
    }
}

/// Opens `<root>/<connection id>/messages.db`.
#[derive(Debug, Clone)]
pub struct SqliteSinkProvider {
    root: PathBuf,
}

impl SqliteSinkProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, connection_id: Uuid) -> PathBuf {
        self.root.join(connection_id.to_string()).join(LOG_FILE_NAME)
    }
}

impl Default for SqliteSinkProvider {
    fn default() -> Self {
        Self::new(chat_log_dir())
    }
}

impl MessageSinkProvider for SqliteSinkProvider {
    fn open(&self, connection_id: Uuid) -> Result<Arc<dyn MessageSink>> {
        let path = self.path_for(connection_id);
        tracing::debug!(connection = %connection_id, path = %path.display(), "Opening message log");
        Ok(Arc::new(SqliteMessageSink::open(path)?))
    }
}
