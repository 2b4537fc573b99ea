//! Client-supplied idempotency keys.
//!
//! The first successful mutation under a (ledger, key) pair stores its
//! response; every later attempt inside the TTL gets that response back
//! verbatim, before any locks are taken.

use chrono::{Duration, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;
use crate::store::{dialect, PgTx, Store};

#[derive(Debug, Clone)]
pub struct StoredResponse {
    pub response: Value,
    pub status_code: i32,
}

pub async fn check(
    store: &Store,
    tx: &mut PgTx<'_>,
    ledger_id: Uuid,
    key: &str,
) -> Result<Option<StoredResponse>> {
    let table = store.table("idempotency_key");
    let row: Option<(Value, i32)> = sqlx::query_as(&format!(
        "SELECT response, status_code FROM {table} \
         WHERE ledger_id = $1 AND key = $2 AND expires_at > NOW()"
    ))
    .bind(ledger_id)
    .bind(key)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(row.map(|(response, status_code)| StoredResponse {
        response,
        status_code,
    }))
}

pub async fn store(
    store: &Store,
    tx: &mut PgTx<'_>,
    ledger_id: Uuid,
    key: &str,
    response: &Value,
    status_code: i32,
    ttl_hours: i64,
) -> Result<()> {
    let table = store.table("idempotency_key");
    let expires_at = Utc::now() + Duration::hours(ttl_hours);
    sqlx::query(&format!(
        "INSERT INTO {table} (ledger_id, key, response, status_code, expires_at) \
         VALUES ($1, $2, $3, $4, $5) {}",
        dialect::on_conflict_do_nothing(&["ledger_id", "key"])
    ))
    .bind(ledger_id)
    .bind(key)
    .bind(response)
    .bind(status_code)
    .bind(expires_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Worker hook: drop keys past their TTL.
pub async fn cleanup_expired(store: &Store) -> Result<u64> {
    let table = store.table("idempotency_key");
    let result = sqlx::query(&format!("DELETE FROM {table} WHERE expires_at <= NOW()"))
        .execute(store.pool())
        .await?;
    Ok(result.rows_affected())
}
