//! SQLite-backed stores
//!
//! One pool: instance state (status, QR, operational log) in [`instances`],
//! conversations/messages in [`messages`], and the cross-process full-sync
//! lease in [`leases`]. All are `impl Store` blocks so callers hold a
//! single cheap-to-clone handle.

pub mod instances;
pub mod leases;
pub mod messages;

pub use instances::{Instance, InstanceLogEntry};
pub use messages::{
    Conversation, Direction, MAX_PAGE_LIMIT, DEFAULT_PAGE_LIMIT, Page, PageRequest, RemoteMessage,
    StoredMessage, UpsertOutcome,
};

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::Result;

const MIGRATIONS: &str = r#"
    CREATE TABLE IF NOT EXISTS instances (
        instance_name   TEXT PRIMARY KEY,
        status          TEXT NOT NULL DEFAULT 'disconnected',
        qr_code         TEXT,
        last_error      TEXT,
        created_at      TEXT NOT NULL,
        updated_at      TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS instance_logs (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        instance_name   TEXT NOT NULL REFERENCES instances (instance_name),
        event           TEXT NOT NULL,
        detail          TEXT,
        created_at      TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_instance_logs_instance
        ON instance_logs (instance_name, id);
    CREATE TABLE IF NOT EXISTS conversations (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        instance_name   TEXT NOT NULL,
        remote_jid      TEXT NOT NULL,
        display_name    TEXT,
        last_message_at INTEGER,
        UNIQUE (instance_name, remote_jid)
    );
    CREATE INDEX IF NOT EXISTS idx_conversations_recent
        ON conversations (instance_name, last_message_at);
    CREATE TABLE IF NOT EXISTS messages (
        instance_name   TEXT NOT NULL,
        external_id     TEXT NOT NULL,
        conversation_id INTEGER NOT NULL REFERENCES conversations (id),
        timestamp       INTEGER NOT NULL,
        direction       TEXT NOT NULL,
        content         TEXT,
        content_ts      INTEGER,
        delivery_status TEXT,
        status_ts       INTEGER,
        status_rank     INTEGER NOT NULL DEFAULT 0,
        revision        INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (instance_name, external_id)
    );
    CREATE INDEX IF NOT EXISTS idx_messages_page
        ON messages (conversation_id, timestamp DESC, external_id DESC);
    CREATE TABLE IF NOT EXISTS sync_leases (
        instance_name   TEXT PRIMARY KEY,
        owner           TEXT NOT NULL,
        expires_at      INTEGER NOT NULL
    );
"#;

/// Handle to the sync database. Clones share the pool.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (or create) the database file at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && let Err(e) = std::fs::create_dir_all(parent)
        {
            tracing::warn!("Store: could not create {:?}: {}", parent, e);
        }

        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;

        Self::with_pool(pool).await
    }

    /// Private in-memory database. A single pinned connection, since every
    /// SQLite `:memory:` connection is its own database.
    pub async fn in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;

        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<()> {
        // sqlx runs one statement per call
        for stmt in MIGRATIONS.split(';') {
            let trimmed = stmt.trim();
            if trimmed.is_empty() {
                continue;
            }
            sqlx::query(trimmed).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Row counts for `db stats`.
    pub async fn stats(&self) -> Result<StoreStats> {
        let (instances, conversations, messages): (i64, i64, i64) = sqlx::query_as(
            "SELECT (SELECT COUNT(*) FROM instances),
                    (SELECT COUNT(*) FROM conversations),
                    (SELECT COUNT(*) FROM messages)",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(StoreStats {
            instances,
            conversations,
            messages,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct StoreStats {
    pub instances: i64,
    pub conversations: i64,
    pub messages: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let store = Store::in_memory().await.unwrap();
        store.run_migrations().await.unwrap();
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.instances, 0);
        assert_eq!(stats.messages, 0);
    }

    #[tokio::test]
    async fn test_open_on_disk_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sync.db");
        let store = Store::open(&path).await.unwrap();
        store.create_instance("shop-1").await.unwrap();
        assert!(path.exists());

        // Reopen and see the same data
        drop(store);
        let reopened = Store::open(&path).await.unwrap();
        assert!(reopened.get_instance("shop-1").await.unwrap().is_some());
    }
}
