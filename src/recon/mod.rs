//! Reconciliation: periodic re-proof of the ledger's invariants.
//!
//! The daily run scans everything past a persisted watermark (plus a full
//! balance sweep every Nth run); the fast run re-checks a fixed two-hour
//! window. Both persist a result row with per-step diagnostics, and the
//! watermark only advances after a clean run.

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::chain::blocks::BlockStore;
use crate::error::Result;
use crate::store::{dialect, Store};

/// Every Nth daily run sweeps all accounts instead of only touched ones.
const FULL_SCAN_EVERY: i64 = 10;
const FULL_SCAN_BATCH: i64 = 500;
const MISMATCH_LOG_LIMIT: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunType {
    Daily,
    Fast,
}

impl RunType {
    fn as_str(&self) -> &'static str {
        match self {
            RunType::Daily => "daily",
            RunType::Fast => "fast",
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ReconciliationReport {
    pub run_type: String,
    pub status: String,
    pub total_mismatches: i64,
    pub diagnostics: Value,
    pub started_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Reconciler {
    store: Store,
    blocks: BlockStore,
}

impl Reconciler {
    pub fn new(store: Store, blocks: BlockStore) -> Self {
        Self { store, blocks }
    }

    pub async fn run_daily(&self) -> Result<ReconciliationReport> {
        let (watermark, run_count) = self.load_watermark().await?;
        let since = watermark.unwrap_or(DateTime::UNIX_EPOCH);
        let full_scan = run_count % FULL_SCAN_EVERY == 0;
        let report = self.run(RunType::Daily, since, full_scan).await?;
        if report.status == "healthy" {
            self.advance_watermark().await?;
        }
        Ok(report)
    }

    pub async fn run_fast(&self) -> Result<ReconciliationReport> {
        let since = Utc::now() - Duration::hours(2);
        self.run(RunType::Fast, since, false).await
    }

    async fn run(
        &self,
        run_type: RunType,
        since: DateTime<Utc>,
        full_scan: bool,
    ) -> Result<ReconciliationReport> {
        let started_at = Utc::now();
        let mut mismatches: Vec<Value> = Vec::new();
        let mut diagnostics = serde_json::Map::new();

        let step0 = self.check_double_entry(since).await?;
        diagnostics.insert("step0_double_entry".to_string(), json!({"mismatches": step0.len()}));
        mismatches.extend(step0);

        let step0b = self.check_duplicate_entries(since).await?;
        diagnostics.insert("step0b_duplicates".to_string(), json!({"mismatches": step0b.len()}));
        mismatches.extend(step0b);

        let step0c = self.check_version_monotonicity(since).await?;
        diagnostics.insert("step0c_versions".to_string(), json!({"mismatches": step0c.len()}));
        mismatches.extend(step0c);

        let step1 = self.check_balance_projections(since, full_scan).await?;
        diagnostics.insert(
            "step1_balances".to_string(),
            json!({"mismatches": step1.len(), "full_scan": full_scan}),
        );
        mismatches.extend(step1);

        let step2 = self.check_system_accounts().await?;
        diagnostics.insert("step2_system_accounts".to_string(), json!({"mismatches": step2.len()}));
        mismatches.extend(step2);

        let blocks = self.blocks.verify_recent_blocks(since).await?;
        diagnostics.insert(
            "step3_blocks".to_string(),
            json!({"checked": blocks.blocks_checked, "valid": blocks.valid}),
        );
        if !blocks.valid {
            mismatches.push(json!({
                "step": "step3_blocks",
                "block_sequence": blocks.broken_block_sequence,
            }));
        }

        let total_mismatches = mismatches.len() as i64;
        let status = if total_mismatches == 0 {
            "healthy"
        } else {
            "mismatches_found"
        };
        if total_mismatches > 0 {
            for mismatch in mismatches.iter().take(MISMATCH_LOG_LIMIT) {
                tracing::error!(run_type = run_type.as_str(), %mismatch, "reconciliation mismatch");
            }
        }
        diagnostics.insert(
            "mismatches".to_string(),
            Value::Array(mismatches.into_iter().take(100).collect()),
        );

        let diagnostics = Value::Object(diagnostics);
        let table = self.store.table("reconciliation_result");
        sqlx::query(&format!(
            "INSERT INTO {table} (run_type, status, total_mismatches, diagnostics, started_at) \
             VALUES ($1, $2, $3, $4, $5)"
        ))
        .bind(run_type.as_str())
        .bind(status)
        .bind(total_mismatches)
        .bind(&diagnostics)
        .bind(started_at)
        .execute(self.store.pool())
        .await?;

        Ok(ReconciliationReport {
            run_type: run_type.as_str().to_string(),
            status: status.to_string(),
            total_mismatches,
            diagnostics,
            started_at,
        })
    }

    /// Step 0: Σ(credit) = Σ(debit) per transaction, ignoring voided and
    /// expired transactions, over entries newer than the watermark.
    async fn check_double_entry(&self, since: DateTime<Utc>) -> Result<Vec<Value>> {
        let entries = self.store.table("entry_record");
        let statuses = self.store.table("transaction_status");
        let rows: Vec<(Uuid, i64, i64)> = sqlx::query_as(&format!(
            "SELECT e.transaction_id, \
                    COALESCE(SUM(e.amount) FILTER (WHERE e.entry_type = 'CREDIT'), 0)::BIGINT, \
                    COALESCE(SUM(e.amount) FILTER (WHERE e.entry_type = 'DEBIT'), 0)::BIGINT \
             FROM {entries} e \
             WHERE e.created_at > $1 \
               AND (SELECT s.status FROM {statuses} s WHERE s.transaction_id = e.transaction_id \
                    ORDER BY s.seq DESC LIMIT 1) NOT IN ('voided', 'expired') \
               AND NOT EXISTS (SELECT 1 FROM {entries} x \
                               WHERE x.transaction_id = e.transaction_id AND x.exchange_rate IS NOT NULL) \
             GROUP BY e.transaction_id \
             HAVING COALESCE(SUM(e.amount) FILTER (WHERE e.entry_type = 'CREDIT'), 0) \
                 <> COALESCE(SUM(e.amount) FILTER (WHERE e.entry_type = 'DEBIT'), 0)"
        ))
        .bind(since)
        .fetch_all(self.store.pool())
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, credit, debit)| {
                json!({
                    "step": "step0_double_entry",
                    "transaction_id": id,
                    "credit": credit,
                    "debit": debit,
                })
            })
            .collect())
    }

    /// Step 0b: no (transaction, account, direction) appears twice among
    /// non-hot entries.
    async fn check_duplicate_entries(&self, since: DateTime<Utc>) -> Result<Vec<Value>> {
        let entries = self.store.table("entry_record");
        let rows: Vec<(Uuid, Uuid, String, i64)> = sqlx::query_as(&format!(
            "SELECT transaction_id, account_id, entry_type, {} \
             FROM {entries} WHERE created_at > $1 AND NOT is_hot \
             GROUP BY transaction_id, account_id, entry_type HAVING COUNT(*) > 1",
            dialect::count_as_int("*")
        ))
        .bind(since)
        .fetch_all(self.store.pool())
        .await?;
        Ok(rows
            .into_iter()
            .map(|(tx, account, direction, count)| {
                json!({
                    "step": "step0b_duplicates",
                    "transaction_id": tx,
                    "account_id": account,
                    "entry_type": direction,
                    "count": count,
                })
            })
            .collect())
    }

    /// Step 0c: per-account versions advance by exactly one.
    async fn check_version_monotonicity(&self, since: DateTime<Utc>) -> Result<Vec<Value>> {
        let versions = self.store.table("account_balance_version");
        let rows: Vec<(Uuid, i64, i64)> = sqlx::query_as(&format!(
            "SELECT account_id, version, prev FROM ( \
                 SELECT account_id, version, \
                        LAG(version) OVER (PARTITION BY account_id ORDER BY version) AS prev \
                 FROM {versions} \
                 WHERE account_id IN (SELECT DISTINCT account_id FROM {versions} WHERE created_at > $1) \
             ) gaps WHERE prev IS NOT NULL AND version <> prev + 1"
        ))
        .bind(since)
        .fetch_all(self.store.pool())
        .await?;
        Ok(rows
            .into_iter()
            .map(|(account, version, prev)| {
                json!({
                    "step": "step0c_versions",
                    "account_id": account,
                    "version": version,
                    "previous": prev,
                })
            })
            .collect())
    }

    /// Step 1: latest balance equals Σcredit − Σdebit of settled entries,
    /// for non-system accounts. Either the touched set or, periodically,
    /// every account via keyset pagination.
    async fn check_balance_projections(
        &self,
        since: DateTime<Utc>,
        full_scan: bool,
    ) -> Result<Vec<Value>> {
        let accounts = self.store.table("account_balance");
        let versions = self.store.table("account_balance_version");
        let entries = self.store.table("entry_record");

        let scope = if full_scan {
            String::new()
        } else {
            format!(
                "AND ab.id IN (SELECT DISTINCT account_id FROM {entries} WHERE created_at > $1)"
            )
        };
        let base = format!(
            "SELECT ab.id, lv.balance, \
                    COALESCE(agg.credit, 0)::BIGINT, COALESCE(agg.debit, 0)::BIGINT \
             FROM {accounts} ab \
             JOIN LATERAL (SELECT balance FROM {versions} v WHERE v.account_id = ab.id \
                           ORDER BY v.version DESC LIMIT 1) lv ON TRUE \
             LEFT JOIN LATERAL (SELECT SUM(amount) FILTER (WHERE entry_type = 'CREDIT') AS credit, \
                                       SUM(amount) FILTER (WHERE entry_type = 'DEBIT') AS debit \
                                FROM {entries} e WHERE e.account_id = ab.id AND NOT e.is_hot) agg ON TRUE \
             WHERE ab.holder_type <> 'system' {scope}"
        );

        let mut mismatches = Vec::new();
        if full_scan {
            let mut after = Uuid::nil();
            loop {
                let rows: Vec<(Uuid, i64, i64, i64)> = sqlx::query_as(&format!(
                    "{base} AND ab.id > $1 ORDER BY ab.id ASC LIMIT {FULL_SCAN_BATCH}"
                ))
                .bind(after)
                .fetch_all(self.store.pool())
                .await?;
                if rows.is_empty() {
                    break;
                }
                for (id, balance, credit, debit) in &rows {
                    if *balance != credit - debit {
                        mismatches.push(json!({
                            "step": "step1_balances",
                            "account_id": id,
                            "balance": balance,
                            "expected": credit - debit,
                        }));
                    }
                    after = *id;
                }
            }
        } else {
            let rows: Vec<(Uuid, i64, i64, i64)> = sqlx::query_as(&base)
                .bind(since)
                .fetch_all(self.store.pool())
                .await?;
            for (id, balance, credit, debit) in rows {
                if balance != credit - debit {
                    mismatches.push(json!({
                        "step": "step1_balances",
                        "account_id": id,
                        "balance": balance,
                        "expected": credit - debit,
                    }));
                }
            }
        }
        Ok(mismatches)
    }

    /// Step 2: for system accounts, the full entry net must equal the
    /// settled balance plus legs still staged for coalescing.
    async fn check_system_accounts(&self) -> Result<Vec<Value>> {
        let accounts = self.store.table("account_balance");
        let versions = self.store.table("account_balance_version");
        let entries = self.store.table("entry_record");
        let staged = self.store.table("hot_account_entry");

        let rows: Vec<(Uuid, i64, i64, i64)> = sqlx::query_as(&format!(
            "SELECT ab.id, lv.balance, \
                    COALESCE(agg.net, 0)::BIGINT, COALESCE(pending.net, 0)::BIGINT \
             FROM {accounts} ab \
             JOIN LATERAL (SELECT balance FROM {versions} v WHERE v.account_id = ab.id \
                           ORDER BY v.version DESC LIMIT 1) lv ON TRUE \
             LEFT JOIN LATERAL (SELECT SUM(CASE WHEN entry_type = 'CREDIT' THEN amount ELSE -amount END) AS net \
                                FROM {entries} e WHERE e.account_id = ab.id) agg ON TRUE \
             LEFT JOIN LATERAL (SELECT SUM(CASE WHEN entry_type = 'CREDIT' THEN amount ELSE -amount END) AS net \
                                FROM {staged} h WHERE h.account_id = ab.id AND h.status = 'pending') pending ON TRUE \
             WHERE ab.holder_type = 'system'"
        ))
        .fetch_all(self.store.pool())
        .await?;

        Ok(rows
            .into_iter()
            .filter(|(_, balance, entry_net, pending_net)| *entry_net != balance + pending_net)
            .map(|(id, balance, entry_net, pending_net)| {
                json!({
                    "step": "step2_system_accounts",
                    "account_id": id,
                    "balance": balance,
                    "entry_net": entry_net,
                    "pending_net": pending_net,
                })
            })
            .collect())
    }

    async fn load_watermark(&self) -> Result<(Option<DateTime<Utc>>, i64)> {
        let table = self.store.table("reconciliation_watermark");
        let row: Option<(Option<DateTime<Utc>>, i64)> = sqlx::query_as(&format!(
            "SELECT watermark, run_count FROM {table} WHERE id = 1"
        ))
        .fetch_optional(self.store.pool())
        .await?;
        Ok(row.unwrap_or((None, 0)))
    }

    /// Move the watermark to the newest entry and bump the run counter.
    /// Called only after a clean daily run.
    async fn advance_watermark(&self) -> Result<()> {
        let table = self.store.table("reconciliation_watermark");
        let entries = self.store.table("entry_record");
        sqlx::query(&format!(
            "INSERT INTO {table} (id, watermark, run_count, updated_at) \
             VALUES (1, (SELECT MAX(created_at) FROM {entries}), 1, NOW()) \
             ON CONFLICT (id) DO UPDATE \
               SET watermark = COALESCE((SELECT MAX(created_at) FROM {entries}), {table}.watermark), \
                   run_count = {table}.run_count + 1, updated_at = NOW()"
        ))
        .execute(self.store.pool())
        .await?;
        Ok(())
    }
}
