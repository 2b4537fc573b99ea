//! Transactional outbox.
//!
//! Every event row is paired with an outbox row in the same transaction;
//! a background processor drains pending rows with SKIP LOCKED and hands
//! them to a publisher. Delivery is at-least-once; the processed_event
//! table is the dedup keyring consumers rely on.

pub mod webhook;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::Result;
use crate::store::{dialect, PgTx, Store};

/// Write an outbox row alongside the event that produced it. The outbox id
/// IS the emitting event id, which makes downstream dedup keys stable.
pub async fn enqueue(
    store: &Store,
    tx: &mut PgTx<'_>,
    event_id: Uuid,
    topic: &str,
    payload: &Value,
) -> Result<()> {
    let table = store.table("outbox");
    sqlx::query(&format!(
        "INSERT INTO {table} (id, topic, payload) VALUES ($1, $2, $3)"
    ))
    .bind(event_id)
    .bind(topic)
    .bind(payload)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[derive(Debug, Clone, FromRow)]
pub struct OutboxRow {
    pub id: Uuid,
    pub topic: String,
    pub payload: Value,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
}

/// Downstream sink for delivered events: a user callback or the webhook
/// fan-out engine.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: &Value) -> std::result::Result<(), String>;
}

/// A publisher that drops everything; useful when the embedding
/// application only consumes the durable tables.
pub struct NoopPublisher;

#[async_trait]
impl EventPublisher for NoopPublisher {
    async fn publish(&self, _topic: &str, _payload: &Value) -> std::result::Result<(), String> {
        Ok(())
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct OutboxStats {
    pub pending: i64,
    pub processed: i64,
    pub failed: i64,
    pub dead_lettered: i64,
}

#[derive(Clone)]
pub struct OutboxProcessor {
    store: Store,
    publisher: std::sync::Arc<dyn EventPublisher>,
    max_retries: i32,
    batch_size: i64,
}

impl OutboxProcessor {
    pub fn new(
        store: Store,
        publisher: std::sync::Arc<dyn EventPublisher>,
        max_retries: i32,
        batch_size: i64,
    ) -> Self {
        Self {
            store,
            publisher,
            max_retries,
            batch_size,
        }
    }

    /// Drain one batch. Rows are locked with SKIP LOCKED so concurrent
    /// processor instances partition the queue without static sharding.
    pub async fn process_batch(&self) -> Result<u64> {
        let outbox = self.store.table("outbox");
        let processed_table = self.store.table("processed_event");
        let dlq = self.store.table("dead_letter_queue");

        let mut tx = self.store.begin().await?;
        let batch: Vec<OutboxRow> = sqlx::query_as(&format!(
            "SELECT id, topic, payload, retry_count, created_at FROM {outbox} \
             WHERE processed_at IS NULL AND retry_count < $1 \
             ORDER BY created_at ASC LIMIT $2 {}",
            dialect::for_update_skip_locked()
        ))
        .bind(self.max_retries)
        .bind(self.batch_size)
        .fetch_all(&mut *tx)
        .await?;

        let mut delivered = 0u64;
        for row in &batch {
            // Claim the dedup slot first: if someone already delivered this
            // event id on this topic, mark it done and move on.
            let claimed = sqlx::query(&format!(
                "INSERT INTO {processed_table} (id, topic, payload) VALUES ($1, $2, $3) {}",
                dialect::on_conflict_do_nothing(&["id", "topic"])
            ))
            .bind(row.id)
            .bind(&row.topic)
            .bind(&row.payload)
            .execute(&mut *tx)
            .await?;

            if claimed.rows_affected() == 0 {
                sqlx::query(&format!(
                    "UPDATE {outbox} SET processed_at = NOW(), status = 'processed' WHERE id = $1"
                ))
                .bind(row.id)
                .execute(&mut *tx)
                .await?;
                continue;
            }

            match self.publisher.publish(&row.topic, &row.payload).await {
                Ok(()) => {
                    sqlx::query(&format!(
                        "UPDATE {outbox} SET processed_at = NOW(), status = 'processed' WHERE id = $1"
                    ))
                    .bind(row.id)
                    .execute(&mut *tx)
                    .await?;
                    delivered += 1;
                }
                Err(message) => {
                    tracing::warn!(event_id = %row.id, topic = %row.topic, error = %message, "publish failed");
                    // Release the dedup claim so the retry can publish.
                    sqlx::query(&format!(
                        "DELETE FROM {processed_table} WHERE id = $1 AND topic = $2"
                    ))
                    .bind(row.id)
                    .bind(&row.topic)
                    .execute(&mut *tx)
                    .await?;

                    let exhausted = row.retry_count + 1 >= self.max_retries;
                    if exhausted {
                        sqlx::query(&format!(
                            "INSERT INTO {dlq} (outbox_id, topic, payload, error_message, retry_count) \
                             VALUES ($1, $2, $3, $4, $5)"
                        ))
                        .bind(row.id)
                        .bind(&row.topic)
                        .bind(&row.payload)
                        .bind(&message)
                        .bind(row.retry_count + 1)
                        .execute(&mut *tx)
                        .await?;
                        sqlx::query(&format!(
                            "UPDATE {outbox} SET retry_count = retry_count + 1, last_error = $2, \
                             status = 'failed', processed_at = NOW() WHERE id = $1"
                        ))
                        .bind(row.id)
                        .bind(&message)
                        .execute(&mut *tx)
                        .await?;
                        tracing::error!(event_id = %row.id, "outbox row dead-lettered");
                    } else {
                        sqlx::query(&format!(
                            "UPDATE {outbox} SET retry_count = retry_count + 1, last_error = $2 \
                             WHERE id = $1"
                        ))
                        .bind(row.id)
                        .bind(&message)
                        .execute(&mut *tx)
                        .await?;
                    }
                }
            }
        }
        tx.commit().await?;
        Ok(delivered)
    }

    /// Prune delivered outbox rows and expired dedup keys.
    pub async fn cleanup(&self, retention_hours: i64) -> Result<u64> {
        let outbox = self.store.table("outbox");
        let processed_table = self.store.table("processed_event");
        let horizon = format!(
            "{} - {}",
            dialect::now(),
            dialect::interval_secs(retention_hours * 3600)
        );
        let removed_outbox = sqlx::query(&format!(
            "DELETE FROM {outbox} WHERE status = 'processed' AND processed_at < {horizon}"
        ))
        .execute(self.store.pool())
        .await?
        .rows_affected();
        let removed_keys = sqlx::query(&format!(
            "DELETE FROM {processed_table} WHERE created_at < {horizon}"
        ))
        .execute(self.store.pool())
        .await?
        .rows_affected();
        Ok(removed_outbox + removed_keys)
    }

    pub async fn stats(&self) -> Result<OutboxStats> {
        let outbox = self.store.table("outbox");
        let dlq = self.store.table("dead_letter_queue");
        let (pending, processed, failed): (i64, i64, i64) = sqlx::query_as(&format!(
            "SELECT COUNT(*) FILTER (WHERE processed_at IS NULL)::BIGINT, \
                    COUNT(*) FILTER (WHERE status = 'processed')::BIGINT, \
                    COUNT(*) FILTER (WHERE status = 'failed')::BIGINT \
             FROM {outbox}"
        ))
        .fetch_one(self.store.pool())
        .await?;
        let dead_lettered: i64 = sqlx::query_scalar(&format!(
            "SELECT {} FROM {dlq}",
            dialect::count_as_int("*")
        ))
        .fetch_one(self.store.pool())
        .await?;
        Ok(OutboxStats {
            pending,
            processed,
            failed,
            dead_lettered,
        })
    }
}
