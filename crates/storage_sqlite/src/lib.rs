use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use core_types::{ConversationId, MessageDraft, MessageId, Role};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

pub const CURRENT_DB_SCHEMA_VERSION: u32 = 1;

/// A persisted chat thread. Created on the first message of a thread;
/// `last_message_at` is touched on every subsequent message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub user_id: String,
    pub thread_id: String,
    pub started_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub role: Role,
    pub content: String,
    pub intent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub metadata: Value,
}

#[derive(Debug, Clone)]
pub struct ConversationStore {
    pool: SqlitePool,
}

impl ConversationStore {
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!(
            "sqlite://{}",
            path.as_ref().to_string_lossy()
        ))?
        .create_if_missing(true)
        // Cascade deletes rely on this; SQLite defaults it off.
        .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                thread_id TEXT NOT NULL UNIQUE,
                started_at TEXT NOT NULL,
                last_message_at TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT 'null'
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                intent TEXT,
                created_at TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT 'null',
                FOREIGN KEY(conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO metadata(key, value)
            VALUES ('schema_version', ?1)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(CURRENT_DB_SCHEMA_VERSION.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn schema_version(&self) -> Result<u32> {
        let row = sqlx::query("SELECT value FROM metadata WHERE key = 'schema_version'")
            .fetch_one(&self.pool)
            .await?;
        let version = row.get::<String, _>("value").parse::<u32>()?;
        Ok(version)
    }

    /// Insert a new conversation. Fails when `thread_id` is already taken.
    pub async fn create_conversation(
        &self,
        user_id: impl Into<String>,
        thread_id: impl Into<String>,
        metadata: Value,
    ) -> Result<Conversation> {
        let now = Utc::now();
        let id = ConversationId::new_v4();
        let user_id = user_id.into();
        let thread_id = thread_id.into();
        sqlx::query(
            r#"
            INSERT INTO conversations(id, user_id, thread_id, started_at, last_message_at, metadata)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(id.to_string())
        .bind(&user_id)
        .bind(&thread_id)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(serde_json::to_string(&metadata)?)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to create conversation for thread `{thread_id}`"))?;

        Ok(Conversation {
            id,
            user_id,
            thread_id,
            started_at: now,
            last_message_at: now,
            metadata,
        })
    }

    /// Get-or-create by thread id; the created-on-first-message path.
    pub async fn ensure_conversation(
        &self,
        user_id: impl Into<String>,
        thread_id: impl Into<String>,
    ) -> Result<Conversation> {
        let thread_id = thread_id.into();
        if let Some(existing) = self.find_by_thread(&thread_id).await? {
            return Ok(existing);
        }
        self.create_conversation(user_id, thread_id, Value::Null)
            .await
    }

    pub async fn find_by_thread(&self, thread_id: &str) -> Result<Option<Conversation>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, thread_id, started_at, last_message_at, metadata
            FROM conversations
            WHERE thread_id = ?1
            "#,
        )
        .bind(thread_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(map_conversation_row).transpose()
    }

    /// Insert one turn and touch the owning conversation's `last_message_at`.
    /// The conversation must already exist; the foreign key rejects orphans.
    pub async fn append_message(
        &self,
        conversation_id: ConversationId,
        draft: &MessageDraft,
    ) -> Result<StoredMessage> {
        let now = Utc::now();
        let id = MessageId::new_v4();
        sqlx::query(
            r#"
            INSERT INTO messages(id, conversation_id, role, content, intent, created_at, metadata)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(id.to_string())
        .bind(conversation_id.to_string())
        .bind(draft.role.as_str())
        .bind(&draft.content)
        .bind(&draft.intent)
        .bind(now.to_rfc3339())
        .bind(serde_json::to_string(&draft.metadata)?)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to append message to conversation {conversation_id}"))?;

        sqlx::query(r#"UPDATE conversations SET last_message_at = ?2 WHERE id = ?1"#)
            .bind(conversation_id.to_string())
            .bind(now.to_rfc3339())
            .execute(&self.pool)
            .await?;

        Ok(StoredMessage {
            id,
            conversation_id,
            role: draft.role,
            content: draft.content.clone(),
            intent: draft.intent.clone(),
            created_at: now,
            metadata: draft.metadata.clone(),
        })
    }

    pub async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, thread_id, started_at, last_message_at, metadata
            FROM conversations
            ORDER BY last_message_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(map_conversation_row).collect()
    }

    pub async fn list_messages(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, conversation_id, role, content, intent, created_at, metadata
            FROM messages
            WHERE conversation_id = ?1
            ORDER BY created_at ASC
            "#,
        )
        .bind(conversation_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(map_message_row).collect()
    }

    /// Delete a conversation; its messages go with it.
    pub async fn delete_conversation(&self, conversation_id: ConversationId) -> Result<()> {
        sqlx::query(r#"DELETE FROM conversations WHERE id = ?1"#)
            .bind(conversation_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn map_conversation_row(row: sqlx::sqlite::SqliteRow) -> Result<Conversation> {
    Ok(Conversation {
        id: Uuid::parse_str(row.get::<String, _>("id").as_str())?,
        user_id: row.get("user_id"),
        thread_id: row.get("thread_id"),
        started_at: parse_rfc3339(row.get::<String, _>("started_at"))?,
        last_message_at: parse_rfc3339(row.get::<String, _>("last_message_at"))?,
        metadata: parse_metadata(row.get::<String, _>("metadata"))?,
    })
}

fn map_message_row(row: sqlx::sqlite::SqliteRow) -> Result<StoredMessage> {
    let role: Role = row
        .get::<String, _>("role")
        .parse()
        .map_err(|err: anyhow::Error| err.context("invalid role in database"))?;
    Ok(StoredMessage {
        id: Uuid::parse_str(row.get::<String, _>("id").as_str())?,
        conversation_id: Uuid::parse_str(row.get::<String, _>("conversation_id").as_str())?,
        role,
        content: row.get("content"),
        intent: row.get("intent"),
        created_at: parse_rfc3339(row.get::<String, _>("created_at"))?,
        metadata: parse_metadata(row.get::<String, _>("metadata"))?,
    })
}

fn parse_rfc3339(value: String) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(&value)?.with_timezone(&Utc))
}

fn parse_metadata(value: String) -> Result<Value> {
    serde_json::from_str(&value).context("invalid metadata json in database")
}
