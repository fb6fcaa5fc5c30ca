//! Conversation persistence.
//!
//! SQLite-backed, one row per message. Appends run in a transaction that
//! also maintains the conversation row (title from the first user message,
//! `last_time` bump), which serialises concurrent appends per id and keeps
//! readers from ever seeing a partial message.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};

use crate::errors::ApiError;

const TITLE_MAX_CHARS: usize = 40;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub role: String,
    pub content: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub messages: Vec<StoredMessage>,
    pub last_time: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    pub message_count: i64,
    pub last_time: String,
}

#[derive(Clone)]
pub struct ConversationStore {
    pool: SqlitePool,
}

impl ConversationStore {
    pub async fn open(db_path: PathBuf) -> Result<Self, ApiError> {
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(ApiError::internal)?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), ApiError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                last_time TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(ApiError::internal)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY(conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(ApiError::internal)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_conversation
             ON messages(conversation_id)",
        )
        .execute(&self.pool)
        .await
        .map_err(ApiError::internal)?;

        Ok(())
    }

    pub async fn create(&self) -> Result<String, ApiError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();

        sqlx::query(
            "INSERT INTO conversations (id, title, created_at, last_time) VALUES (?, '', ?, ?)",
        )
        .bind(&id)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(ApiError::internal)?;

        Ok(id)
    }

    pub async fn append(&self, id: &str, role: &str, content: &str) -> Result<(), ApiError> {
        let now = chrono::Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await.map_err(ApiError::internal)?;

        sqlx::query(
            "INSERT OR IGNORE INTO conversations (id, title, created_at, last_time)
             VALUES (?, '', ?, ?)",
        )
        .bind(id)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(ApiError::internal)?;

        if role == "user" {
            // Only the first user message names the conversation.
            sqlx::query("UPDATE conversations SET title = ? WHERE id = ? AND title = ''")
                .bind(derive_title(content))
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(ApiError::internal)?;
        }

        sqlx::query("UPDATE conversations SET last_time = ? WHERE id = ?")
            .bind(&now)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(ApiError::internal)?;

        sqlx::query(
            "INSERT INTO messages (conversation_id, role, content, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(id)
        .bind(role)
        .bind(content)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(ApiError::internal)?;

        tx.commit().await.map_err(ApiError::internal)?;
        Ok(())
    }

    pub async fn load(&self, id: &str) -> Result<Conversation, ApiError> {
        let row = sqlx::query("SELECT id, title, last_time FROM conversations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(ApiError::internal)?
            .ok_or_else(|| ApiError::NotFound(format!("conversation '{}' not found", id)))?;

        let messages = self.history(id, 0).await?;

        Ok(Conversation {
            id: row.get("id"),
            title: row.get("title"),
            messages,
            last_time: row.get("last_time"),
        })
    }

    /// Most recent messages in chronological order; `limit = 0` means all.
    pub async fn history(&self, id: &str, limit: i64) -> Result<Vec<StoredMessage>, ApiError> {
        let rows = if limit > 0 {
            sqlx::query(
                "SELECT role, content, created_at FROM (
                    SELECT * FROM messages WHERE conversation_id = ? ORDER BY id DESC LIMIT ?
                 ) ORDER BY id ASC",
            )
            .bind(id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(ApiError::internal)?
        } else {
            sqlx::query(
                "SELECT role, content, created_at FROM messages
                 WHERE conversation_id = ? ORDER BY id ASC",
            )
            .bind(id)
            .fetch_all(&self.pool)
            .await
            .map_err(ApiError::internal)?
        };

        Ok(rows
            .iter()
            .map(|row| StoredMessage {
                role: row.get("role"),
                content: row.get("content"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    pub async fn list(&self) -> Result<Vec<ConversationSummary>, ApiError> {
        let rows = sqlx::query(
            "SELECT c.id, c.title, c.last_time, COUNT(m.id) AS msg_count
             FROM conversations c
             LEFT JOIN messages m ON c.id = m.conversation_id
             GROUP BY c.id
             ORDER BY c.last_time DESC
             LIMIT 100",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(ApiError::internal)?;

        Ok(rows
            .iter()
            .map(|row| ConversationSummary {
                id: row.get("id"),
                title: row.get("title"),
                message_count: row.get("msg_count"),
                last_time: row.get("last_time"),
            })
            .collect())
    }

    pub async fn delete(&self, id: &str) -> Result<(), ApiError> {
        sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(ApiError::internal)?;
        Ok(())
    }
}

fn derive_title(content: &str) -> String {
    let trimmed = content.trim();
    let chars: Vec<char> = trimmed.chars().collect();
    if chars.len() <= TITLE_MAX_CHARS {
        trimmed.to_string()
    } else {
        let head: String = chars[..TITLE_MAX_CHARS].iter().collect();
        format!("{}…", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> ConversationStore {
        let path = std::env::temp_dir().join(format!(
            "lorebase-conversations-{}.db",
            uuid::Uuid::new_v4()
        ));
        ConversationStore::open(path).await.unwrap()
    }

    #[tokio::test]
    async fn round_trip_and_title_from_first_user_message() {
        let store = test_store().await;
        let id = store.create().await.unwrap();

        store.append(&id, "user", "What is a Transformer?").await.unwrap();
        store.append(&id, "assistant", "A sequence model.").await.unwrap();
        store.append(&id, "user", "Thanks!").await.unwrap();

        let conversation = store.load(&id).await.unwrap();
        assert_eq!(conversation.title, "What is a Transformer?");
        assert_eq!(conversation.messages.len(), 3);
        assert_eq!(conversation.messages[0].role, "user");
        assert_eq!(conversation.messages[1].content, "A sequence model.");

        // created_at is non-decreasing within a conversation.
        let stamps: Vec<&String> = conversation
            .messages
            .iter()
            .map(|m| &m.created_at)
            .collect();
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn long_titles_are_truncated_to_forty_chars() {
        let store = test_store().await;
        let id = store.create().await.unwrap();

        let long = "x".repeat(80);
        store.append(&id, "user", &long).await.unwrap();

        let conversation = store.load(&id).await.unwrap();
        assert_eq!(conversation.title.chars().count(), TITLE_MAX_CHARS + 1);
        assert!(conversation.title.ends_with('…'));
    }

    #[tokio::test]
    async fn missing_conversation_is_not_found() {
        let store = test_store().await;
        let err = store.load("nope").await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_orders_by_recency_and_counts_messages() {
        let store = test_store().await;
        let first = store.create().await.unwrap();
        let second = store.create().await.unwrap();

        store.append(&first, "user", "older").await.unwrap();
        store.append(&second, "user", "newer").await.unwrap();

        let summaries = store.list().await.unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].id, second);
        assert_eq!(summaries[0].message_count, 1);
    }

    #[tokio::test]
    async fn delete_cascades_messages() {
        let store = test_store().await;
        let id = store.create().await.unwrap();
        store.append(&id, "user", "hello").await.unwrap();

        store.delete(&id).await.unwrap();
        assert!(store.load(&id).await.is_err());
    }

    #[tokio::test]
    async fn concurrent_appends_are_totally_ordered() {
        let store = test_store().await;
        let id = store.create().await.unwrap();

        let mut handles = Vec::new();
        for i in 0..10 {
            let store = store.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                store.append(&id, "user", &format!("message {}", i)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let conversation = store.load(&id).await.unwrap();
        assert_eq!(conversation.messages.len(), 10);
    }

    #[tokio::test]
    async fn limited_history_returns_most_recent_in_order() {
        let store = test_store().await;
        let id = store.create().await.unwrap();
        for i in 0..5 {
            store.append(&id, "user", &format!("m{}", i)).await.unwrap();
        }

        let recent = store.history(&id, 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].content, "m3");
        assert_eq!(recent[1].content, "m4");
    }
}
