//! SQLite storage implementation.
//!
//! Idempotence is expressed at the SQL level: `INSERT OR IGNORE` for creates,
//! `UPDATE ... SET field = COALESCE(?, field)` for merge-on-update, and
//! `ORDER BY RANDOM()` for the polling fan-out query. Connection pooling via
//! sqlx; queries are plain runtime queries so no database is needed at build
//! time.

use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use crate::error::PersistenceError;
use crate::types::{
    Batch, BatchCreate, BatchStatus, BatchUpdate, Message, MessageCreate, MessageStatus,
    MessageUpdate, Usage,
};

use super::Storage;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS batch (
        id TEXT PRIMARY KEY,
        status TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS batch_status_idx ON batch(status)",
    "CREATE TABLE IF NOT EXISTS message (
        id TEXT PRIMARY KEY,
        batch_id TEXT NOT NULL,
        model_name TEXT NOT NULL,
        prompt_name TEXT NOT NULL,
        status TEXT NOT NULL,
        input TEXT NOT NULL,
        output TEXT,
        error TEXT,
        input_tokens INTEGER,
        output_tokens INTEGER,
        cache_creation_input_tokens INTEGER,
        cache_read_input_tokens INTEGER,
        FOREIGN KEY(batch_id) REFERENCES batch(id)
    )",
    "CREATE INDEX IF NOT EXISTS message_batch_id_idx ON message(batch_id)",
    "CREATE INDEX IF NOT EXISTS message_status_idx ON message(status)",
    "CREATE INDEX IF NOT EXISTS message_model_name_idx ON message(model_name)",
    "CREATE INDEX IF NOT EXISTS message_prompt_name_idx ON message(prompt_name)",
];

/// SQLite storage backend.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new storage instance with the given connection pool.
    ///
    /// # Example
    /// ```ignore
    /// let pool = SqlitePool::connect("sqlite://volley.db").await?;
    /// let storage = SqliteStorage::new(pool);
    /// storage.migrate().await?;
    /// ```
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create tables and indexes if they are missing. Safe to call on every
    /// startup.
    pub async fn migrate(&self) -> Result<(), PersistenceError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn parse_batch_status(s: &str) -> Result<BatchStatus, PersistenceError> {
    BatchStatus::parse(s)
        .ok_or_else(|| PersistenceError::Backend(format!("unknown batch status: {s}")))
}

fn parse_message_status(s: &str) -> Result<MessageStatus, PersistenceError> {
    MessageStatus::parse(s)
        .ok_or_else(|| PersistenceError::Backend(format!("unknown message status: {s}")))
}

impl Storage for SqliteStorage {
    async fn create_batch(&self, batch: BatchCreate) -> Result<(), PersistenceError> {
        sqlx::query("INSERT OR IGNORE INTO batch (id, status) VALUES (?, ?)")
            .bind(&batch.id)
            .bind(batch.status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_batch(&self, batch: BatchUpdate) -> Result<(), PersistenceError> {
        // Update-if-present: zero rows affected when the batch is unknown.
        sqlx::query("UPDATE batch SET status = ? WHERE id = ?")
            .bind(batch.status.as_str())
            .bind(&batch.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn random_batches(
        &self,
        limit: usize,
        status: BatchStatus,
    ) -> Result<Vec<String>, PersistenceError> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT id FROM batch WHERE status = ? ORDER BY RANDOM() LIMIT ?",
        )
        .bind(status.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn create_message(&self, message: MessageCreate) -> Result<(), PersistenceError> {
        sqlx::query(
            "INSERT OR IGNORE INTO
            message (id, batch_id, model_name, prompt_name, status, input)
            VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&message.id)
        .bind(&message.batch_id)
        .bind(&message.model_name)
        .bind(&message.prompt_name)
        .bind(message.status.as_str())
        .bind(&message.input)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_message(&self, update: MessageUpdate) -> Result<(), PersistenceError> {
        sqlx::query(
            "UPDATE message SET
                status = ?,
                output = COALESCE(?, output),
                error = COALESCE(?, error),
                input_tokens = COALESCE(?, input_tokens),
                output_tokens = COALESCE(?, output_tokens),
                cache_creation_input_tokens = COALESCE(?, cache_creation_input_tokens),
                cache_read_input_tokens = COALESCE(?, cache_read_input_tokens)
            WHERE id = ?",
        )
        .bind(update.status.as_str())
        .bind(&update.output)
        .bind(&update.error)
        .bind(update.usage.input_tokens)
        .bind(update.usage.output_tokens)
        .bind(update.usage.cache_creation_input_tokens)
        .bind(update.usage.cache_read_input_tokens)
        .bind(&update.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_batch(&self, id: &str) -> Result<Option<Batch>, PersistenceError> {
        let row = sqlx::query("SELECT id, status FROM batch WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| {
            Ok(Batch {
                id: row.try_get("id")?,
                status: parse_batch_status(row.try_get::<String, _>("status")?.as_str())?,
            })
        })
        .transpose()
    }

    async fn get_message(&self, id: &str) -> Result<Option<Message>, PersistenceError> {
        let row = sqlx::query(
            "SELECT id, batch_id, model_name, prompt_name, status, input, output, error,
                    input_tokens, output_tokens,
                    cache_creation_input_tokens, cache_read_input_tokens
            FROM message WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(Message {
                id: row.try_get("id")?,
                batch_id: row.try_get("batch_id")?,
                model_name: row.try_get("model_name")?,
                prompt_name: row.try_get("prompt_name")?,
                status: parse_message_status(row.try_get::<String, _>("status")?.as_str())?,
                input: row.try_get("input")?,
                output: row.try_get("output")?,
                error: row.try_get("error")?,
                usage: Usage {
                    input_tokens: row.try_get("input_tokens")?,
                    output_tokens: row.try_get("output_tokens")?,
                    cache_creation_input_tokens: row.try_get("cache_creation_input_tokens")?,
                    cache_read_input_tokens: row.try_get("cache_read_input_tokens")?,
                },
            })
        })
        .transpose()
    }
}
