//! # PostgreSQL Message Queue Client
//!
//! Calls the pgmq extension's SQL functions directly through sqlx. Every operation has
//! an executor-generic form so the store can publish, hide and archive messages inside
//! the same transaction that mutates task rows.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Executor, PgPool, Postgres};
use std::time::Duration;
use tracing::{debug, info, instrument};

use super::errors::{MessagingError, MessagingResult};
use super::message::QueuedMessage;
use super::queue::{duration_to_whole_seconds, DurableQueue};

/// pgmq rejects longer names (table prefixes must fit in an identifier)
const MAX_QUEUE_NAME_LENGTH: usize = 47;

#[derive(sqlx::FromRow)]
struct PgmqMessageRow {
    msg_id: i64,
    read_ct: i32,
    enqueued_at: DateTime<Utc>,
    vt: DateTime<Utc>,
    message: Option<Value>,
}

impl From<PgmqMessageRow> for QueuedMessage<Value> {
    fn from(row: PgmqMessageRow) -> Self {
        Self {
            msg_id: row.msg_id,
            read_count: row.read_ct,
            enqueued_at: row.enqueued_at,
            visible_at: row.vt,
            message: row.message.unwrap_or(Value::Null),
        }
    }
}

/// pgmq client over a shared connection pool
#[derive(Debug, Clone)]
pub struct PgmqClient {
    pool: PgPool,
}

impl PgmqClient {
    /// Create new pgmq client using existing connection pool (BYOP - Bring Your Own Pool)
    pub fn new_with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect with a dedicated pool
    pub async fn new(database_url: &str) -> MessagingResult<Self> {
        info!("🚀 Connecting to pgmq");
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| MessagingError::database_connection(e.to_string()))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn validate_queue_name(queue_name: &str) -> MessagingResult<()> {
        if queue_name.is_empty() || queue_name.len() > MAX_QUEUE_NAME_LENGTH {
            return Err(MessagingError::invalid_queue_name(
                queue_name,
                format!("length must be between 1 and {MAX_QUEUE_NAME_LENGTH}"),
            ));
        }
        if !queue_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(MessagingError::invalid_queue_name(
                queue_name,
                "only ASCII letters, digits and underscores are allowed",
            ));
        }
        Ok(())
    }

    /// `pgmq.send` on any executor
    pub async fn send_with<'e, E>(
        executor: E,
        queue_name: &str,
        message: &Value,
        delay: Duration,
    ) -> MessagingResult<i64>
    where
        E: Executor<'e, Database = Postgres>,
    {
        sqlx::query_scalar::<_, i64>("SELECT * FROM pgmq.send($1::text, $2::jsonb, $3::integer)")
            .bind(queue_name)
            .bind(message)
            .bind(duration_to_whole_seconds(delay))
            .fetch_one(executor)
            .await
            .map_err(|e| MessagingError::queue_operation(queue_name, "send", e.to_string()))
    }

    /// `pgmq.set_vt` on any executor; `false` when the message no longer exists
    pub async fn set_vt_with<'e, E>(
        executor: E,
        queue_name: &str,
        message_id: i64,
        timeout: Duration,
    ) -> MessagingResult<bool>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let updated = sqlx::query_scalar::<_, i64>(
            "SELECT msg_id FROM pgmq.set_vt($1::text, $2::bigint, $3::integer)",
        )
        .bind(queue_name)
        .bind(message_id)
        .bind(duration_to_whole_seconds(timeout))
        .fetch_optional(executor)
        .await
        .map_err(|e| MessagingError::queue_operation(queue_name, "set_vt", e.to_string()))?;
        Ok(updated.is_some())
    }

    /// `pgmq.archive` on any executor
    pub async fn archive_with<'e, E>(
        executor: E,
        queue_name: &str,
        message_id: i64,
    ) -> MessagingResult<bool>
    where
        E: Executor<'e, Database = Postgres>,
    {
        sqlx::query_scalar::<_, bool>("SELECT pgmq.archive($1::text, $2::bigint)")
            .bind(queue_name)
            .bind(message_id)
            .fetch_one(executor)
            .await
            .map_err(|e| MessagingError::queue_operation(queue_name, "archive", e.to_string()))
    }
}

#[async_trait]
impl DurableQueue for PgmqClient {
    #[instrument(skip(self))]
    async fn ensure_queue(&self, queue_name: &str) -> MessagingResult<()> {
        Self::validate_queue_name(queue_name)?;
        debug!("📋 Creating queue: {}", queue_name);

        sqlx::query("SELECT pgmq.create($1::text)")
            .bind(queue_name)
            .execute(&self.pool)
            .await
            .map_err(|e| MessagingError::queue_operation(queue_name, "create", e.to_string()))?;

        info!("✅ Queue ready: {}", queue_name);
        Ok(())
    }

    async fn send(&self, queue_name: &str, message: &Value) -> MessagingResult<i64> {
        let message_id = Self::send_with(&self.pool, queue_name, message, Duration::ZERO).await?;
        debug!(queue = %queue_name, msg_id = message_id, "📤 Message sent");
        Ok(message_id)
    }

    async fn read_with_poll(
        &self,
        queue_name: &str,
        limit: usize,
        visibility_timeout: Duration,
        poll_timeout: Duration,
    ) -> MessagingResult<Vec<QueuedMessage<Value>>> {
        let limit = i32::try_from(limit).unwrap_or(i32::MAX);
        let rows = sqlx::query_as::<_, PgmqMessageRow>(
            r#"
            SELECT msg_id, read_ct, enqueued_at, vt, message
            FROM pgmq.read_with_poll($1::text, $2::integer, $3::integer, $4::integer, $5::integer)
            "#,
        )
        .bind(queue_name)
        .bind(duration_to_whole_seconds(visibility_timeout))
        .bind(limit)
        .bind(duration_to_whole_seconds(poll_timeout).max(1))
        .bind(100_i32)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| MessagingError::queue_operation(queue_name, "read_with_poll", e.to_string()))?;

        if !rows.is_empty() {
            debug!(queue = %queue_name, count = rows.len(), "📥 Messages read");
        }
        Ok(rows.into_iter().map(QueuedMessage::from).collect())
    }

    async fn set_visibility_timeout_batch(
        &self,
        queue_name: &str,
        message_ids: &[i64],
        timeout: Duration,
    ) -> MessagingResult<()> {
        if message_ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            SELECT v.msg_id
            FROM unnest($2::bigint[]) AS ids(id),
                 LATERAL pgmq.set_vt($1::text, ids.id, $3::integer) AS v
            "#,
        )
        .bind(queue_name)
        .bind(message_ids)
        .bind(duration_to_whole_seconds(timeout))
        .execute(&self.pool)
        .await
        .map_err(|e| MessagingError::queue_operation(queue_name, "set_vt", e.to_string()))?;
        Ok(())
    }

    async fn archive(&self, queue_name: &str, message_id: i64) -> MessagingResult<bool> {
        Self::archive_with(&self.pool, queue_name, message_id).await
    }

    fn provider_name(&self) -> &'static str {
        "pgmq"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_name_validation() {
        assert!(PgmqClient::validate_queue_name("orders_tasks").is_ok());
        assert!(PgmqClient::validate_queue_name("").is_err());
        assert!(PgmqClient::validate_queue_name("orders-tasks").is_err());
        assert!(PgmqClient::validate_queue_name(&"q".repeat(48)).is_err());
    }

    #[tokio::test]
    async fn test_round_trip_against_database() {
        let Ok(database_url) = std::env::var("DATABASE_URL") else {
            println!("Skipping pgmq test - DATABASE_URL not set");
            return;
        };
        let client = PgmqClient::new(&database_url).await.unwrap();
        let queue = format!("pgmq_client_test_{}", std::process::id());
        client.ensure_queue(&queue).await.unwrap();

        let id = client
            .send(&queue, &serde_json::json!({"hello": "world"}))
            .await
            .unwrap();
        let batch = client
            .read_with_poll(&queue, 10, Duration::from_secs(30), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(batch.iter().any(|m| m.msg_id == id));

        assert!(client.archive(&queue, id).await.unwrap());
        assert!(!client.archive(&queue, id).await.unwrap());
    }
}
