//! Dialogue memory backends.
//!
//! Three interchangeable stores behind one trait: a relational store
//! (SQLite, one row per non-system message), a key-value store (Redis hash,
//! one JSON array per user) and an in-process store for tests. System
//! messages are never persisted by any backend.

use std::path::Path;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use rusqlite::{params, Connection};
use std::sync::Arc;

use crate::config::RedisConfig;
use crate::dialogue::Message;
use crate::errors::MemoryError;

/// Persistent dialogue history for one user.
#[async_trait]
pub trait Memory: Send + Sync {
    /// Append messages. Backends skip `system` rows.
    async fn save(&self, messages: &[Message]) -> Result<(), MemoryError>;

    /// The stored history as a JSON array string (empty when none).
    async fn query_json(&self) -> Result<String, MemoryError>;

    /// The most recent `limit` messages in chronological order;
    /// `limit == 0` returns everything.
    async fn query_messages_limit(&self, limit: usize) -> Result<Vec<Message>, MemoryError>;

    /// Paginated query. `order` is "ASC" or "DESC" by creation time.
    /// Returns the page and the total row count.
    async fn query_messages_page(
        &self,
        order: &str,
        page: usize,
        page_size: usize,
    ) -> Result<(Vec<Message>, u64), MemoryError>;

    /// Purge the user's history.
    async fn clear(&self) -> Result<(), MemoryError>;
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

/// Shared SQLite handle with migrations applied.
///
/// Uses a sync `Mutex<Connection>` because rusqlite's `Connection` is not
/// `Sync`; statements here are small and index-backed.
pub struct SqliteStore {
    conn: StdMutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path` and run migrations.
    pub fn open(db_path: &Path) -> Result<Self, MemoryError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| MemoryError::Storage(e.to_string()))?;
            }
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: StdMutex::new(conn),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self, MemoryError> {
        let conn = Connection::open_in_memory()?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: StdMutex::new(conn),
        })
    }

    fn migrate(conn: &Connection) -> Result<(), MemoryError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS dialogue_messages (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 user_id TEXT NOT NULL,
                 idx INTEGER NOT NULL DEFAULT 0,
                 role TEXT NOT NULL,
                 content TEXT NOT NULL,
                 tool_call_id TEXT,
                 bot_id INTEGER,
                 created_at TEXT NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_dialogue_user
                 ON dialogue_messages(user_id, created_at);",
        )?;
        Ok(())
    }
}

/// Relational memory: one row per message, append-only.
pub struct SqliteMemory {
    store: Arc<SqliteStore>,
    user_id: String,
}

impl SqliteMemory {
    pub fn new(store: Arc<SqliteStore>, user_id: &str) -> Self {
        Self {
            store,
            user_id: user_id.to_string(),
        }
    }

    fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
        Ok(Message {
            role: row.get(0)?,
            content: row.get(1)?,
            tool_call_id: row.get::<_, Option<String>>(2)?.filter(|s| !s.is_empty()),
            tool_calls: None,
            bot_id: row.get::<_, Option<u32>>(3)?,
            bot_name: None,
        })
    }
}

#[async_trait]
impl Memory for SqliteMemory {
    async fn save(&self, messages: &[Message]) -> Result<(), MemoryError> {
        let conn = self.store.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        for (i, msg) in messages.iter().enumerate() {
            if msg.role == "system" {
                continue;
            }
            conn.execute(
                "INSERT INTO dialogue_messages
                     (user_id, idx, role, content, tool_call_id, bot_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    self.user_id,
                    i as i64,
                    msg.role,
                    msg.content,
                    msg.tool_call_id.as_deref().unwrap_or(""),
                    msg.bot_id,
                    now,
                ],
            )?;
        }
        Ok(())
    }

    async fn query_json(&self) -> Result<String, MemoryError> {
        let messages = self.query_messages_limit(0).await?;
        if messages.is_empty() {
            return Ok(String::new());
        }
        Ok(serde_json::to_string(&messages)?)
    }

    async fn query_messages_limit(&self, limit: usize) -> Result<Vec<Message>, MemoryError> {
        let conn = self.store.conn.lock().unwrap();
        let mut messages = if limit > 0 {
            let mut stmt = conn.prepare(
                "SELECT role, content, tool_call_id, bot_id FROM dialogue_messages
                 WHERE user_id = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![self.user_id, limit as i64], Self::row_to_message)?;
            let mut out: Vec<Message> = rows.collect::<rusqlite::Result<_>>()?;
            out.reverse();
            out
        } else {
            let mut stmt = conn.prepare(
                "SELECT role, content, tool_call_id, bot_id FROM dialogue_messages
                 WHERE user_id = ?1 ORDER BY created_at ASC, id ASC",
            )?;
            let rows = stmt.query_map(params![self.user_id], Self::row_to_message)?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        // Stored tool_call ids without content are display noise.
        for msg in &mut messages {
            if msg.content.is_empty() {
                msg.tool_call_id = None;
            }
        }
        Ok(messages)
    }

    async fn query_messages_page(
        &self,
        order: &str,
        page: usize,
        page_size: usize,
    ) -> Result<(Vec<Message>, u64), MemoryError> {
        let page = page.max(1);
        let page_size = if page_size == 0 { 20 } else { page_size };
        let conn = self.store.conn.lock().unwrap();

        let total: u64 = conn.query_row(
            "SELECT COUNT(*) FROM dialogue_messages WHERE user_id = ?1",
            params![self.user_id],
            |row| row.get(0),
        )?;

        let order_sql = if order.eq_ignore_ascii_case("DESC") {
            "DESC"
        } else {
            "ASC"
        };
        let sql = format!(
            "SELECT role, content, tool_call_id, bot_id FROM dialogue_messages
             WHERE user_id = ?1 ORDER BY created_at {}, id {} LIMIT ?2 OFFSET ?3",
            order_sql, order_sql
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![self.user_id, page_size as i64, ((page - 1) * page_size) as i64],
            Self::row_to_message,
        )?;
        let messages: Vec<Message> = rows.collect::<rusqlite::Result<_>>()?;
        Ok((messages, total))
    }

    async fn clear(&self) -> Result<(), MemoryError> {
        let conn = self.store.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM dialogue_messages WHERE user_id = ?1",
            params![self.user_id],
        )?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Redis
// ---------------------------------------------------------------------------

/// Key-value memory: the whole history as one JSON array in a hash field.
pub struct RedisMemory {
    client: redis::Client,
    hash_key: String,
    field: String,
    ttl_secs: u64,
}

impl RedisMemory {
    pub fn new(cfg: &RedisConfig, user_id: &str) -> Result<Self, MemoryError> {
        if cfg.addr.is_empty() {
            return Err(MemoryError::Storage("redis address not configured".into()));
        }
        let service = if cfg.service.is_empty() {
            "ai"
        } else {
            &cfg.service
        };
        let url = if cfg.password.is_empty() {
            format!("redis://{}/{}", cfg.addr, cfg.db)
        } else {
            format!("redis://:{}@{}/{}", cfg.password, cfg.addr, cfg.db)
        };
        let client =
            redis::Client::open(url).map_err(|e| MemoryError::Storage(e.to_string()))?;
        Ok(Self {
            client,
            hash_key: format!("{}:dialogue", service),
            field: user_id.to_string(),
            ttl_secs: 0,
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, MemoryError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| MemoryError::Storage(e.to_string()))
    }

    async fn read_all(&self) -> Result<Vec<Message>, MemoryError> {
        let mut conn = self.connection().await?;
        let value: Option<String> = conn
            .hget(&self.hash_key, &self.field)
            .await
            .map_err(|e| MemoryError::Storage(e.to_string()))?;
        match value {
            Some(json) if !json.is_empty() => Ok(serde_json::from_str(&json)?),
            _ => Ok(Vec::new()),
        }
    }
}

#[async_trait]
impl Memory for RedisMemory {
    async fn save(&self, messages: &[Message]) -> Result<(), MemoryError> {
        let mut all = self.read_all().await?;
        all.extend(messages.iter().filter(|m| m.role != "system").cloned());
        let json = serde_json::to_string(&all)?;

        let mut conn = self.connection().await?;
        conn.hset::<_, _, _, ()>(&self.hash_key, &self.field, json)
            .await
            .map_err(|e| MemoryError::Storage(e.to_string()))?;
        if self.ttl_secs > 0 {
            let _: Result<(), _> = conn.expire(&self.hash_key, self.ttl_secs as i64).await;
        }
        Ok(())
    }

    async fn query_json(&self) -> Result<String, MemoryError> {
        let mut conn = self.connection().await?;
        let value: Option<String> = conn
            .hget(&self.hash_key, &self.field)
            .await
            .map_err(|e| MemoryError::Storage(e.to_string()))?;
        Ok(value.unwrap_or_default())
    }

    async fn query_messages_limit(&self, limit: usize) -> Result<Vec<Message>, MemoryError> {
        let mut all = self.read_all().await?;
        if limit > 0 && all.len() > limit {
            all.drain(..all.len() - limit);
        }
        Ok(all)
    }

    async fn query_messages_page(
        &self,
        order: &str,
        page: usize,
        page_size: usize,
    ) -> Result<(Vec<Message>, u64), MemoryError> {
        let mut all = self.read_all().await?;
        let total = all.len() as u64;
        if order.eq_ignore_ascii_case("DESC") {
            all.reverse();
        }
        let page = page.max(1);
        let page_size = if page_size == 0 { 20 } else { page_size };
        let start = ((page - 1) * page_size).min(all.len());
        let end = (start + page_size).min(all.len());
        Ok((all[start..end].to_vec(), total))
    }

    async fn clear(&self) -> Result<(), MemoryError> {
        let mut conn = self.connection().await?;
        conn.hdel::<_, _, ()>(&self.hash_key, &self.field)
            .await
            .map_err(|e| MemoryError::Storage(e.to_string()))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-process
// ---------------------------------------------------------------------------

/// Test backend: a vector behind a mutex.
pub struct InProcessMemory {
    messages: StdMutex<Vec<Message>>,
}

impl InProcessMemory {
    pub fn new() -> Self {
        Self {
            messages: StdMutex::new(Vec::new()),
        }
    }
}

impl Default for InProcessMemory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Memory for InProcessMemory {
    async fn save(&self, messages: &[Message]) -> Result<(), MemoryError> {
        let mut store = self.messages.lock().unwrap();
        store.extend(messages.iter().filter(|m| m.role != "system").cloned());
        Ok(())
    }

    async fn query_json(&self) -> Result<String, MemoryError> {
        let store = self.messages.lock().unwrap();
        if store.is_empty() {
            return Ok(String::new());
        }
        Ok(serde_json::to_string(&*store)?)
    }

    async fn query_messages_limit(&self, limit: usize) -> Result<Vec<Message>, MemoryError> {
        let store = self.messages.lock().unwrap();
        if limit > 0 && store.len() > limit {
            Ok(store[store.len() - limit..].to_vec())
        } else {
            Ok(store.clone())
        }
    }

    async fn query_messages_page(
        &self,
        order: &str,
        page: usize,
        page_size: usize,
    ) -> Result<(Vec<Message>, u64), MemoryError> {
        let mut all = self.messages.lock().unwrap().clone();
        let total = all.len() as u64;
        if order.eq_ignore_ascii_case("DESC") {
            all.reverse();
        }
        let page = page.max(1);
        let page_size = if page_size == 0 { 20 } else { page_size };
        let start = ((page - 1) * page_size).min(all.len());
        let end = (start + page_size).min(all.len());
        Ok((all[start..end].to_vec(), total))
    }

    async fn clear(&self) -> Result<(), MemoryError> {
        self.messages.lock().unwrap().clear();
        Ok(())
    }
}

/// Select a memory backend by the configured `dialogStorage` value.
pub fn build_memory(
    storage: &str,
    user_id: &str,
    sqlite: Option<Arc<SqliteStore>>,
    redis_cfg: &RedisConfig,
) -> Option<Arc<dyn Memory>> {
    match storage.to_lowercase().as_str() {
        "postgres" | "sqlite" => sqlite.map(|store| {
            Arc::new(SqliteMemory::new(store, user_id)) as Arc<dyn Memory>
        }),
        "redis" => match RedisMemory::new(redis_cfg, user_id) {
            Ok(mem) => Some(Arc::new(mem) as Arc<dyn Memory>),
            Err(e) => {
                tracing::warn!("Failed to initialize redis memory: {}; running without", e);
                None
            }
        },
        "memory" => Some(Arc::new(InProcessMemory::new()) as Arc<dyn Memory>),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_memory() -> SqliteMemory {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        SqliteMemory::new(store, "u1")
    }

    #[tokio::test]
    async fn test_sqlite_append_and_query() {
        let mem = sqlite_memory();
        mem.save(&[Message::user("one")]).await.unwrap();
        mem.save(&[Message::assistant("two")]).await.unwrap();

        let all = mem.query_messages_limit(0).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].content, "one");
        assert_eq!(all[1].content, "two");
    }

    #[tokio::test]
    async fn test_sqlite_skips_system() {
        let mem = sqlite_memory();
        mem.save(&[Message::system("prompt"), Message::user("hello")])
            .await
            .unwrap();
        let all = mem.query_messages_limit(0).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].role, "user");
    }

    #[tokio::test]
    async fn test_sqlite_duplicate_rows_kept() {
        let mem = sqlite_memory();
        mem.save(&[Message::user("again")]).await.unwrap();
        mem.save(&[Message::user("again")]).await.unwrap();
        let all = mem.query_messages_limit(0).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_sqlite_limit_returns_latest() {
        let mem = sqlite_memory();
        for i in 0..5 {
            mem.save(&[Message::user(format!("m{}", i))]).await.unwrap();
        }
        let recent = mem.query_messages_limit(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].content, "m3");
        assert_eq!(recent[1].content, "m4");
    }

    #[tokio::test]
    async fn test_sqlite_pagination() {
        let mem = sqlite_memory();
        for i in 0..7 {
            mem.save(&[Message::user(format!("m{}", i))]).await.unwrap();
        }
        let (page, total) = mem.query_messages_page("ASC", 2, 3).await.unwrap();
        assert_eq!(total, 7);
        assert_eq!(page.len(), 3);
        assert_eq!(page[0].content, "m3");

        let (desc, _) = mem.query_messages_page("DESC", 1, 2).await.unwrap();
        assert_eq!(desc[0].content, "m6");
    }

    #[tokio::test]
    async fn test_sqlite_clear_scoped_to_user() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let a = SqliteMemory::new(store.clone(), "a");
        let b = SqliteMemory::new(store, "b");
        a.save(&[Message::user("from a")]).await.unwrap();
        b.save(&[Message::user("from b")]).await.unwrap();

        a.clear().await.unwrap();
        assert!(a.query_messages_limit(0).await.unwrap().is_empty());
        assert_eq!(b.query_messages_limit(0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_in_process_backend() {
        let mem = InProcessMemory::new();
        mem.save(&[Message::user("x"), Message::system("s")])
            .await
            .unwrap();
        assert_eq!(mem.query_messages_limit(0).await.unwrap().len(), 1);
        mem.clear().await.unwrap();
        assert!(mem.query_json().await.unwrap().is_empty());
    }

    #[test]
    fn test_build_memory_selection() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let redis_cfg = RedisConfig::default();
        assert!(build_memory("sqlite", "u", Some(store.clone()), &redis_cfg).is_some());
        assert!(build_memory("memory", "u", None, &redis_cfg).is_some());
        assert!(build_memory("redis", "u", None, &redis_cfg).is_none());
        assert!(build_memory("", "u", Some(store), &redis_cfg).is_none());
    }
}
