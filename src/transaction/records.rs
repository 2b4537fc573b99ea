//! Row-level helpers for transaction headers, status rows, and entries.
//! Shared by the transaction pipeline, the hold machinery, and the account
//! close sweep.

use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{LedgerError, Result};
use crate::store::{dialect, PgTx, Store};
use crate::transaction::{EntryRecord, TransactionRecord, TxStatus};

#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub ledger_id: Uuid,
    pub transaction_type: &'static str,
    pub reference: String,
    pub amount: i64,
    pub currency: String,
    pub description: Option<String>,
    pub correlation_id: Uuid,
    pub source_account_id: Option<Uuid>,
    pub destination_account_id: Option<Uuid>,
    pub is_hold: bool,
    pub is_reversal: bool,
    pub hold_expires_at: Option<chrono::DateTime<chrono::Utc>>,
    pub parent_id: Option<Uuid>,
    pub metadata: Option<Value>,
}

/// Cross-currency detail recorded on a destination entry.
#[derive(Debug, Clone)]
pub struct ExchangeDetail {
    pub original_amount: i64,
    pub original_currency: String,
    pub exchange_rate: f64,
}

#[derive(Debug, Clone)]
pub struct NewEntry {
    pub transaction_id: Uuid,
    pub account_id: Uuid,
    pub entry_type: &'static str,
    pub amount: i64,
    pub currency: String,
    pub balance_before: i64,
    pub balance_after: i64,
    pub account_version: i64,
    pub is_hot: bool,
    pub exchange: Option<ExchangeDetail>,
}

pub async fn insert_transaction(
    store: &Store,
    tx: &mut PgTx<'_>,
    new: &NewTransaction,
) -> Result<Uuid> {
    let table = store.table("transaction_record");
    let id: Uuid = sqlx::query_scalar(&format!(
        "INSERT INTO {table} \
         (ledger_id, transaction_type, reference, amount, currency, description, correlation_id, \
          source_account_id, destination_account_id, is_hold, is_reversal, hold_expires_at, parent_id, metadata) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14) {}",
        dialect::returning(&["id"])
    ))
    .bind(new.ledger_id)
    .bind(new.transaction_type)
    .bind(&new.reference)
    .bind(new.amount)
    .bind(&new.currency)
    .bind(&new.description)
    .bind(new.correlation_id)
    .bind(new.source_account_id)
    .bind(new.destination_account_id)
    .bind(new.is_hold)
    .bind(new.is_reversal)
    .bind(new.hold_expires_at)
    .bind(new.parent_id)
    .bind(new.metadata.clone().unwrap_or_else(|| json!({})))
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| {
        let mapped: LedgerError = e.into();
        if matches!(mapped, LedgerError::AlreadyExists(_)) {
            LedgerError::AlreadyExists(format!("reference already used: {}", new.reference))
        } else {
            mapped
        }
    })?;
    Ok(id)
}

pub async fn insert_status(
    store: &Store,
    tx: &mut PgTx<'_>,
    transaction_id: Uuid,
    status: &str,
    reason: Option<&str>,
) -> Result<()> {
    let table = store.table("transaction_status");
    sqlx::query(&format!(
        "INSERT INTO {table} (transaction_id, status, reason) VALUES ($1, $2, $3)"
    ))
    .bind(transaction_id)
    .bind(status)
    .bind(reason)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn insert_entry(store: &Store, tx: &mut PgTx<'_>, entry: &NewEntry) -> Result<Uuid> {
    let table = store.table("entry_record");
    let (original_amount, original_currency, exchange_rate) = match &entry.exchange {
        Some(x) => (
            Some(x.original_amount),
            Some(x.original_currency.clone()),
            Some(x.exchange_rate.to_string()),
        ),
        None => (None, None, None),
    };
    let id: Uuid = sqlx::query_scalar(&format!(
        "INSERT INTO {table} \
         (transaction_id, account_id, entry_type, amount, currency, balance_before, balance_after, \
          account_version, original_amount, original_currency, exchange_rate, is_hot) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) {}",
        dialect::returning(&["id"])
    ))
    .bind(entry.transaction_id)
    .bind(entry.account_id)
    .bind(entry.entry_type)
    .bind(entry.amount)
    .bind(&entry.currency)
    .bind(entry.balance_before)
    .bind(entry.balance_after)
    .bind(entry.account_version)
    .bind(original_amount)
    .bind(original_currency)
    .bind(exchange_rate)
    .bind(entry.is_hot)
    .fetch_one(&mut **tx)
    .await?;
    Ok(id)
}

const TRANSACTION_COLUMNS: &str =
    "id, ledger_id, transaction_type, reference, amount, currency, description, correlation_id, \
     source_account_id, destination_account_id, is_hold, is_reversal, hold_expires_at, parent_id, \
     refunded_amount, committed_amount, effective_date, metadata, created_at";

pub async fn load_transaction(store: &Store, id: Uuid) -> Result<Option<TransactionRecord>> {
    let table = store.table("transaction_record");
    Ok(sqlx::query_as(&format!(
        "SELECT {TRANSACTION_COLUMNS} FROM {table} WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(store.pool())
    .await?)
}

/// Lock the header row for the duration of the caller's transaction. The
/// row itself never changes (triggers enforce that); the lock serializes
/// status transitions against it.
pub async fn load_transaction_for_update(
    store: &Store,
    tx: &mut PgTx<'_>,
    id: Uuid,
) -> Result<Option<TransactionRecord>> {
    let table = store.table("transaction_record");
    Ok(sqlx::query_as(&format!(
        "SELECT {TRANSACTION_COLUMNS} FROM {table} WHERE id = $1 FOR UPDATE"
    ))
    .bind(id)
    .fetch_optional(&mut **tx)
    .await?)
}

pub async fn load_entries(store: &Store, transaction_id: Uuid) -> Result<Vec<EntryRecord>> {
    let table = store.table("entry_record");
    Ok(sqlx::query_as(&format!(
        "SELECT id, transaction_id, account_id, entry_type, amount, currency, balance_before, \
                balance_after, account_version, sequence_number::BIGINT, original_amount, \
                original_currency, exchange_rate, is_hot, created_at \
         FROM {table} WHERE transaction_id = $1 ORDER BY sequence_number ASC"
    ))
    .bind(transaction_id)
    .fetch_all(store.pool())
    .await?)
}

pub async fn current_status(store: &Store, transaction_id: Uuid) -> Result<TxStatus> {
    let table = store.table("transaction_status");
    let status: Option<String> = sqlx::query_scalar(&format!(
        "SELECT status FROM {table} WHERE transaction_id = $1 ORDER BY seq DESC LIMIT 1"
    ))
    .bind(transaction_id)
    .fetch_optional(store.pool())
    .await?;
    match status {
        Some(s) => TxStatus::parse(&s),
        None => Err(LedgerError::Internal(format!(
            "transaction {transaction_id} has no status rows"
        ))),
    }
}

pub async fn current_status_in_tx(
    store: &Store,
    tx: &mut PgTx<'_>,
    transaction_id: Uuid,
) -> Result<TxStatus> {
    let table = store.table("transaction_status");
    let status: Option<String> = sqlx::query_scalar(&format!(
        "SELECT status FROM {table} WHERE transaction_id = $1 ORDER BY seq DESC LIMIT 1"
    ))
    .bind(transaction_id)
    .fetch_optional(&mut **tx)
    .await?;
    match status {
        Some(s) => TxStatus::parse(&s),
        None => Err(LedgerError::Internal(format!(
            "transaction {transaction_id} has no status rows"
        ))),
    }
}

/// Accumulate a refund onto the parent header. Only this counter (and
/// committed_amount) survive the immutability trigger.
pub async fn add_refunded_amount(
    store: &Store,
    tx: &mut PgTx<'_>,
    transaction_id: Uuid,
    amount: i64,
) -> Result<()> {
    let table = store.table("transaction_record");
    sqlx::query(&format!(
        "UPDATE {table} SET refunded_amount = refunded_amount + $2 WHERE id = $1"
    ))
    .bind(transaction_id)
    .bind(amount)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn set_committed_amount(
    store: &Store,
    tx: &mut PgTx<'_>,
    transaction_id: Uuid,
    amount: i64,
) -> Result<()> {
    let table = store.table("transaction_record");
    sqlx::query(&format!(
        "UPDATE {table} SET committed_amount = $2 WHERE id = $1"
    ))
    .bind(transaction_id)
    .bind(amount)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
