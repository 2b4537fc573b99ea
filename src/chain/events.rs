//! Per-aggregate hash-chained event store.
//!
//! Each aggregate (one account, one transaction) has its own gap-free
//! sequence of events; every event's hash covers the previous hash plus the
//! canonical payload, so a single altered row breaks every hash after it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

use crate::chain::event_hash;
use crate::error::{LedgerError, Result};
use crate::store::{dialect, PgTx, Store};

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct LedgerEvent {
    pub id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub event_data: Value,
    pub sequence_number: i64,
    pub prev_hash: Option<String>,
    pub event_hash: String,
    pub correlation_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AppendEvent<'a> {
    pub aggregate_type: &'a str,
    pub aggregate_id: &'a str,
    pub event_type: &'a str,
    pub event_data: Value,
    pub correlation_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AppendedEvent {
    pub id: Uuid,
    pub sequence_number: i64,
    pub event_hash: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainVerification {
    pub valid: bool,
    pub event_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broken_at_version: Option<i64>,
}

const VERIFY_BATCH: i64 = 500;

#[derive(Clone)]
pub struct EventStore {
    store: Store,
}

impl EventStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Append one event to its aggregate chain inside the caller's
    /// transaction. The tail row is locked so two writers cannot both read
    /// the same predecessor; the unique (type, id, seq) index backstops the
    /// race and surfaces it as a retryable conflict.
    pub async fn append_event(&self, tx: &mut PgTx<'_>, event: AppendEvent<'_>) -> Result<AppendedEvent> {
        let table = self.store.table("ledger_event");
        let tail: Option<(i64, String)> = sqlx::query_as(&format!(
            "SELECT sequence_number, event_hash FROM {table} \
             WHERE aggregate_type = $1 AND aggregate_id = $2 \
             ORDER BY sequence_number DESC LIMIT 1 FOR UPDATE"
        ))
        .bind(event.aggregate_type)
        .bind(event.aggregate_id)
        .fetch_optional(&mut **tx)
        .await?;

        let (prev_seq, prev_hash) = match tail {
            Some((seq, hash)) => (seq, Some(hash)),
            None => (0, None),
        };
        let sequence_number = prev_seq + 1;
        let hash = event_hash(prev_hash.as_deref(), &event.event_data);

        let id: Uuid = sqlx::query_scalar(&format!(
            "INSERT INTO {table} \
             (aggregate_type, aggregate_id, event_type, event_data, sequence_number, prev_hash, event_hash, correlation_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) {}",
            dialect::returning(&["id"])
        ))
        .bind(event.aggregate_type)
        .bind(event.aggregate_id)
        .bind(event.event_type)
        .bind(&event.event_data)
        .bind(sequence_number)
        .bind(&prev_hash)
        .bind(&hash)
        .bind(event.correlation_id)
        .fetch_one(&mut **tx)
        .await?;

        Ok(AppendedEvent {
            id,
            sequence_number,
            event_hash: hash,
        })
    }

    /// Re-derive the whole chain for one aggregate in batches, reporting the
    /// first sequence number at which linkage or hashing breaks.
    pub async fn verify_hash_chain(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<ChainVerification> {
        let table = self.store.table("ledger_event");
        let mut after_seq = 0i64;
        let mut prev_hash: Option<String> = None;
        let mut event_count = 0i64;

        loop {
            let batch: Vec<(i64, Option<String>, String, Value)> = sqlx::query_as(&format!(
                "SELECT sequence_number, prev_hash, event_hash, event_data FROM {table} \
                 WHERE aggregate_type = $1 AND aggregate_id = $2 AND sequence_number > $3 \
                 ORDER BY sequence_number ASC LIMIT $4"
            ))
            .bind(aggregate_type)
            .bind(aggregate_id)
            .bind(after_seq)
            .bind(VERIFY_BATCH)
            .fetch_all(self.store.pool())
            .await?;

            if batch.is_empty() {
                break;
            }
            for (seq, stored_prev, stored_hash, data) in &batch {
                let expected_seq = event_count + 1;
                let expected_hash = event_hash(prev_hash.as_deref(), data);
                if *seq != expected_seq
                    || stored_prev.as_deref() != prev_hash.as_deref()
                    || *stored_hash != expected_hash
                {
                    tracing::error!(
                        aggregate_type,
                        aggregate_id,
                        sequence = seq,
                        "hash chain broken"
                    );
                    return Ok(ChainVerification {
                        valid: false,
                        event_count,
                        broken_at_version: Some(*seq),
                    });
                }
                prev_hash = Some(stored_hash.clone());
                event_count += 1;
                after_seq = *seq;
            }
        }

        Ok(ChainVerification {
            valid: true,
            event_count,
            broken_at_version: None,
        })
    }

    pub async fn list_events(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<Vec<LedgerEvent>> {
        let table = self.store.table("ledger_event");
        let events = sqlx::query_as(&format!(
            "SELECT id, aggregate_type, aggregate_id, event_type, event_data, sequence_number, \
                    prev_hash, event_hash, correlation_id, created_at \
             FROM {table} \
             WHERE aggregate_type = $1 AND aggregate_id = $2 \
             ORDER BY sequence_number ASC"
        ))
        .bind(aggregate_type)
        .bind(aggregate_id)
        .fetch_all(self.store.pool())
        .await?;
        Ok(events)
    }

    /// Rehash a payload exactly as append would; used by tests and
    /// reconciliation to prove a stored row still matches its data.
    pub fn expected_hash(prev_hash: Option<&str>, event_data: &Value) -> String {
        event_hash(prev_hash, event_data)
    }
}

/// Canonical payload helper: any serializable event body becomes the JSON
/// value that gets hashed and stored.
pub fn event_payload<T: Serialize>(body: &T) -> Result<Value> {
    serde_json::to_value(body).map_err(|e| LedgerError::Internal(format!("event payload: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::canonical_json;
    use serde_json::json;

    #[test]
    fn replayed_chain_verifies_by_hand() {
        // Simulate three appended events and re-derive them the way
        // verify_hash_chain does.
        let payloads = [
            json!({"event": "account.created", "balance": 0}),
            json!({"event": "account.credited", "amount": 10000}),
            json!({"event": "account.debited", "amount": 3000}),
        ];
        let mut prev: Option<String> = None;
        let mut rows = Vec::new();
        for (i, payload) in payloads.iter().enumerate() {
            let hash = event_hash(prev.as_deref(), payload);
            rows.push((i as i64 + 1, prev.clone(), hash.clone(), payload.clone()));
            prev = Some(hash);
        }

        let mut walk_prev: Option<String> = None;
        for (seq, stored_prev, stored_hash, data) in &rows {
            assert_eq!(stored_prev.as_deref(), walk_prev.as_deref(), "link at {seq}");
            assert_eq!(*stored_hash, event_hash(walk_prev.as_deref(), data));
            walk_prev = Some(stored_hash.clone());
        }
    }

    #[test]
    fn tampered_payload_changes_the_hash() {
        let original = json!({"amount": 10000});
        let tampered = json!({"amount": 10001});
        let hash = event_hash(None, &original);
        assert_ne!(hash, event_hash(None, &tampered));
        // And the canonical form is what is covered, not the raw text.
        assert_eq!(
            canonical_json(&original),
            canonical_json(&json!({"amount": 10000}))
        );
    }

    #[test]
    fn event_payload_round_trips_structs() {
        #[derive(Serialize)]
        struct Body {
            amount: i64,
            currency: &'static str,
        }
        let value = event_payload(&Body {
            amount: 42,
            currency: "USD",
        })
        .unwrap();
        assert_eq!(value, json!({"amount": 42, "currency": "USD"}));
    }
}
