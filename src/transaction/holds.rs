//! Two-phase holds.
//!
//! A hold reserves funds by raising pending_debit on the source (and
//! pending_credit on the destination when one is named) without moving the
//! settled balance. Committing settles up to the held amount and releases
//! the reservation; voiding or expiry just releases it.

use chrono::{Duration, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::account::manager::Direction;
use crate::account::{Account, BalanceSnapshot, ChangeType};
use crate::chain::events::{event_payload, AppendEvent};
use crate::error::{LedgerError, Result};
use crate::outbox;
use crate::store::PgTx;
use crate::transaction::manager::TransactionManager;
use crate::transaction::records::{self, NewEntry, NewTransaction};
use crate::transaction::{idempotency, TransactionDto, TxStatus};

const DEFAULT_HOLD_MINUTES: i64 = 60;

#[derive(Debug, Clone)]
pub struct HoldRequest {
    pub ledger_id: Uuid,
    pub holder_id: String,
    pub amount: i64,
    pub reference: String,
    pub destination_holder_id: Option<String>,
    pub expires_in_minutes: Option<i64>,
    pub idempotency_key: Option<String>,
    pub metadata: Option<Value>,
}

impl TransactionManager {
    pub async fn hold(&self, req: HoldRequest) -> Result<TransactionDto> {
        if req.amount <= 0 {
            return Err(LedgerError::InvalidArgument(
                "amount must be a positive integer in minor units".to_string(),
            ));
        }
        if req.expires_in_minutes.is_some_and(|m| m <= 0) {
            return Err(LedgerError::InvalidArgument(
                "expires_in_minutes must be positive".to_string(),
            ));
        }
        if req.destination_holder_id.as_deref() == Some(req.holder_id.as_str()) {
            return Err(LedgerError::InvalidArgument(
                "hold destination must differ from the source".to_string(),
            ));
        }
        self.with_conflict_retry(|| self.try_hold(&req)).await
    }

    async fn try_hold(&self, req: &HoldRequest) -> Result<TransactionDto> {
        let source = self
            .accounts()
            .get_account(req.ledger_id, &req.holder_id)
            .await?;
        let destination = match &req.destination_holder_id {
            Some(holder) => Some(self.accounts().get_account(req.ledger_id, holder).await?),
            None => None,
        };
        if let Some(dest) = &destination {
            if dest.currency != source.currency {
                return Err(LedgerError::CurrencyMismatch {
                    expected: source.currency.clone(),
                    actual: dest.currency.clone(),
                });
            }
        }

        let mut tx = self.store().begin().await?;
        if let Some(key) = &req.idempotency_key {
            if let Some(stored) = idempotency::check(self.store(), &mut tx, req.ledger_id, key).await? {
                tx.rollback().await?;
                return Ok(serde_json::from_value(stored.response)?);
            }
        }

        let mut participants = vec![&source];
        if let Some(dest) = &destination {
            participants.push(dest);
        }
        let locked = self.lock_participants(&mut tx, &participants).await?;
        let source = &locked[&source.id];
        self.accounts().require_active(source)?;
        // The reservation itself must fit inside available funds.
        self.accounts().check_funds(source, req.amount, false)?;

        let expires_at =
            Utc::now() + Duration::minutes(req.expires_in_minutes.unwrap_or(DEFAULT_HOLD_MINUTES));
        let correlation_id = Uuid::new_v4();
        let hold_id = records::insert_transaction(
            self.store(),
            &mut tx,
            &NewTransaction {
                ledger_id: req.ledger_id,
                transaction_type: "transfer",
                reference: req.reference.clone(),
                amount: req.amount,
                currency: source.currency.clone(),
                description: None,
                correlation_id,
                source_account_id: Some(source.id),
                destination_account_id: destination.as_ref().map(|d| d.id),
                is_hold: true,
                is_reversal: false,
                hold_expires_at: Some(expires_at),
                parent_id: None,
                metadata: req.metadata.clone(),
            },
        )
        .await?;
        records::insert_status(self.store(), &mut tx, hold_id, "inflight", None).await?;

        // Pending counters move; settled balances do not, and no entries
        // are written until commit.
        let mut snapshot = BalanceSnapshot::of(source);
        snapshot.pending_debit += req.amount;
        self.accounts()
            .append_balance_version(&mut tx, source, &snapshot, ChangeType::Hold)
            .await?;
        if let Some(dest) = &destination {
            let dest = &locked[&dest.id];
            self.accounts().require_active(dest)?;
            let mut snapshot = BalanceSnapshot::of(dest);
            snapshot.pending_credit += req.amount;
            self.accounts()
                .append_balance_version(&mut tx, dest, &snapshot, ChangeType::Hold)
                .await?;
        }

        let dto = self
            .finish_posted(
                &mut tx,
                hold_id,
                req.ledger_id,
                correlation_id,
                "transaction.held",
                &req.idempotency_key,
                source.id,
            )
            .await?;
        tx.commit().await?;
        Ok(dto)
    }

    /// Settle a hold for up to its reserved amount. The full reservation is
    /// released regardless of how much is committed.
    pub async fn commit_hold(
        &self,
        ledger_id: Uuid,
        hold_id: Uuid,
        amount: Option<i64>,
    ) -> Result<TransactionDto> {
        if amount.is_some_and(|a| a <= 0) {
            return Err(LedgerError::InvalidArgument(
                "commit amount must be positive".to_string(),
            ));
        }
        self.with_conflict_retry(|| self.try_commit_hold(ledger_id, hold_id, amount))
            .await
    }

    async fn try_commit_hold(
        &self,
        ledger_id: Uuid,
        hold_id: Uuid,
        amount: Option<i64>,
    ) -> Result<TransactionDto> {
        let mut tx = self.store().begin().await?;
        let hold = self.load_open_hold(&mut tx, ledger_id, hold_id).await?;
        let status = records::current_status_in_tx(self.store(), &mut tx, hold.id).await?;
        if status != TxStatus::Inflight {
            return Err(LedgerError::Conflict(format!(
                "hold is {}, cannot commit",
                status.as_str()
            )));
        }

        let commit_amount = amount.unwrap_or(hold.amount);
        if commit_amount > hold.amount {
            return Err(LedgerError::InvalidArgument(format!(
                "commit amount {commit_amount} exceeds held amount {}",
                hold.amount
            )));
        }

        let source_id = hold
            .source_account_id
            .ok_or_else(|| LedgerError::Internal("hold without source account".to_string()))?;
        // Holds without a named destination settle against the world
        // account, keeping the committed movement double-entry balanced.
        let (destination_id, destination_account) = match hold.destination_account_id {
            Some(id) => (id, None),
            None => {
                let world = self
                    .ensure_system_account(
                        ledger_id,
                        &self.config().system_accounts.world.clone(),
                        &hold.currency,
                    )
                    .await?;
                (world.id, Some(world))
            }
        };

        let mut ids = vec![source_id, destination_id];
        ids.sort();
        ids.dedup();
        let mut source: Option<Account> = None;
        let mut destination: Option<Account> = destination_account;
        for id in ids {
            let account = self
                .accounts()
                .resolve_by_id_for_update(&mut tx, id, self.config().advanced.lock_mode)
                .await?;
            if id == source_id {
                source = Some(account);
            } else {
                destination = Some(account);
            }
        }
        let source = source.ok_or_else(|| LedgerError::Internal("source not locked".to_string()))?;
        let destination = destination
            .ok_or_else(|| LedgerError::Internal("destination not locked".to_string()))?;

        // Source: release the whole reservation, settle the committed part.
        let mut snapshot = BalanceSnapshot::of(&source);
        let balance_before = snapshot.balance;
        snapshot.pending_debit -= hold.amount;
        snapshot.balance -= commit_amount;
        snapshot.debit_balance += commit_amount;
        let source_version = self
            .accounts()
            .append_balance_version(&mut tx, &source, &snapshot, ChangeType::Commit)
            .await?;
        records::insert_entry(
            self.store(),
            &mut tx,
            &NewEntry {
                transaction_id: hold.id,
                account_id: source.id,
                entry_type: Direction::Debit.as_str(),
                amount: commit_amount,
                currency: source.currency.clone(),
                balance_before,
                balance_after: snapshot.balance,
                account_version: source_version,
                is_hot: false,
                exchange: None,
            },
        )
        .await?;

        // Destination: release pending_credit if it was reserved, settle in.
        let mut snapshot = BalanceSnapshot::of(&destination);
        let balance_before = snapshot.balance;
        if hold.destination_account_id.is_some() {
            snapshot.pending_credit -= hold.amount;
        }
        snapshot.balance += commit_amount;
        snapshot.credit_balance += commit_amount;
        let destination_version = self
            .accounts()
            .append_balance_version(&mut tx, &destination, &snapshot, ChangeType::Commit)
            .await?;
        records::insert_entry(
            self.store(),
            &mut tx,
            &NewEntry {
                transaction_id: hold.id,
                account_id: destination.id,
                entry_type: Direction::Credit.as_str(),
                amount: commit_amount,
                currency: destination.currency.clone(),
                balance_before,
                balance_after: snapshot.balance,
                account_version: destination_version,
                is_hot: false,
                exchange: None,
            },
        )
        .await?;

        records::set_committed_amount(self.store(), &mut tx, hold.id, commit_amount).await?;
        records::insert_status(self.store(), &mut tx, hold.id, "posted", None).await?;

        let dto = self
            .finish_posted(
                &mut tx,
                hold.id,
                ledger_id,
                hold.correlation_id,
                "transaction.hold_committed",
                &None,
                source_id,
            )
            .await?;
        tx.commit().await?;
        Ok(dto)
    }

    /// Release a hold without settling anything.
    pub async fn void_hold(
        &self,
        ledger_id: Uuid,
        hold_id: Uuid,
        reason: Option<String>,
    ) -> Result<TransactionDto> {
        self.with_conflict_retry(|| self.try_void_hold(ledger_id, hold_id, reason.as_deref()))
            .await
    }

    async fn try_void_hold(
        &self,
        ledger_id: Uuid,
        hold_id: Uuid,
        reason: Option<&str>,
    ) -> Result<TransactionDto> {
        let mut tx = self.store().begin().await?;
        let hold = self.load_open_hold(&mut tx, ledger_id, hold_id).await?;
        let status = records::current_status_in_tx(self.store(), &mut tx, hold.id).await?;
        if status != TxStatus::Inflight {
            return Err(LedgerError::Conflict(format!(
                "hold is {}, cannot void",
                status.as_str()
            )));
        }

        self.release_hold_reservation(&mut tx, &hold, ChangeType::Void)
            .await?;
        records::insert_status(self.store(), &mut tx, hold.id, "voided", reason).await?;

        let source_id = hold
            .source_account_id
            .ok_or_else(|| LedgerError::Internal("hold without source account".to_string()))?;
        let dto = self
            .finish_posted(
                &mut tx,
                hold.id,
                ledger_id,
                hold.correlation_id,
                "transaction.hold_voided",
                &None,
                source_id,
            )
            .await?;
        tx.commit().await?;
        Ok(dto)
    }

    /// Worker hook: expire open holds past their deadline. Each hold is
    /// handled in its own transaction under SKIP LOCKED so parallel
    /// instances partition naturally.
    pub async fn expire_due_holds(&self, batch: i64) -> Result<u64> {
        let table = self.store().table("transaction_record");
        let statuses = self.store().table("transaction_status");
        let mut expired = 0u64;
        loop {
            let mut tx = self.store().begin().await?;
            let due: Option<crate::transaction::TransactionRecord> = sqlx::query_as(&format!(
                "SELECT t.id, t.ledger_id, t.transaction_type, t.reference, t.amount, t.currency, \
                        t.description, t.correlation_id, t.source_account_id, t.destination_account_id, \
                        t.is_hold, t.is_reversal, t.hold_expires_at, t.parent_id, t.refunded_amount, \
                        t.committed_amount, t.effective_date, t.metadata, t.created_at \
                 FROM {table} t \
                 WHERE t.is_hold AND t.hold_expires_at < NOW() \
                   AND (SELECT s.status FROM {statuses} s WHERE s.transaction_id = t.id \
                        ORDER BY s.seq DESC LIMIT 1) = 'inflight' \
                 ORDER BY t.hold_expires_at ASC LIMIT 1 FOR UPDATE OF t SKIP LOCKED"
            ))
            .fetch_optional(&mut *tx)
            .await?;

            let Some(hold) = due else {
                tx.rollback().await?;
                break;
            };

            self.release_hold_reservation(&mut tx, &hold, ChangeType::Void)
                .await?;
            records::insert_status(self.store(), &mut tx, hold.id, "expired", Some("hold expired"))
                .await?;

            let chain_account = hold
                .source_account_id
                .ok_or_else(|| LedgerError::Internal("hold without source account".to_string()))?;
            let payload = event_payload(&json!({
                "transaction_id": hold.id,
                "ledger_id": hold.ledger_id,
                "status": "expired",
            }))?;
            let appended = self
                .events()
                .append_event(
                    &mut tx,
                    AppendEvent {
                        aggregate_type: "account",
                        aggregate_id: &chain_account.to_string(),
                        event_type: "transaction.hold_expired",
                        event_data: payload.clone(),
                        correlation_id: Some(hold.correlation_id),
                    },
                )
                .await?;
            outbox::enqueue(
                self.store(),
                &mut tx,
                appended.id,
                "ledger-transaction-hold-expired",
                &payload,
            )
            .await?;
            tx.commit().await?;

            expired += 1;
            if expired as i64 >= batch {
                break;
            }
        }
        if expired > 0 {
            tracing::info!(expired, "expired due holds");
        }
        Ok(expired)
    }

    async fn load_open_hold(
        &self,
        tx: &mut PgTx<'_>,
        ledger_id: Uuid,
        hold_id: Uuid,
    ) -> Result<crate::transaction::TransactionRecord> {
        let hold = records::load_transaction_for_update(self.store(), tx, hold_id)
            .await?
            .filter(|t| t.ledger_id == ledger_id)
            .ok_or_else(|| LedgerError::NotFound(format!("hold not found: {hold_id}")))?;
        if !hold.is_hold {
            return Err(LedgerError::InvalidArgument(format!(
                "transaction {hold_id} is not a hold"
            )));
        }
        Ok(hold)
    }

    /// Drop the pending counters a hold reserved, on both sides.
    async fn release_hold_reservation(
        &self,
        tx: &mut PgTx<'_>,
        hold: &crate::transaction::TransactionRecord,
        change_type: ChangeType,
    ) -> Result<()> {
        let source_id = hold
            .source_account_id
            .ok_or_else(|| LedgerError::Internal("hold without source account".to_string()))?;
        let mut ids = vec![source_id];
        if let Some(dest) = hold.destination_account_id {
            ids.push(dest);
        }
        ids.sort();
        for id in ids {
            let account = self
                .accounts()
                .resolve_by_id_for_update(tx, id, self.config().advanced.lock_mode)
                .await?;
            let mut snapshot = BalanceSnapshot::of(&account);
            if id == source_id {
                snapshot.pending_debit -= hold.amount;
            } else {
                snapshot.pending_credit -= hold.amount;
            }
            self.accounts()
                .append_balance_version(tx, &account, &snapshot, change_type)
                .await?;
        }
        Ok(())
    }

    /// Open holds, newest first, for the /holds/active route.
    pub async fn list_active_holds(
        &self,
        ledger_id: Uuid,
        limit: i64,
    ) -> Result<Vec<crate::transaction::TransactionRecord>> {
        let table = self.store().table("transaction_record");
        let statuses = self.store().table("transaction_status");
        Ok(sqlx::query_as(&format!(
            "SELECT t.id, t.ledger_id, t.transaction_type, t.reference, t.amount, t.currency, \
                    t.description, t.correlation_id, t.source_account_id, t.destination_account_id, \
                    t.is_hold, t.is_reversal, t.hold_expires_at, t.parent_id, t.refunded_amount, \
                    t.committed_amount, t.effective_date, t.metadata, t.created_at \
             FROM {table} t \
             WHERE t.ledger_id = $1 AND t.is_hold \
               AND (SELECT s.status FROM {statuses} s WHERE s.transaction_id = t.id \
                    ORDER BY s.seq DESC LIMIT 1) = 'inflight' \
             ORDER BY t.created_at DESC LIMIT $2"
        ))
        .bind(ledger_id)
        .bind(limit.clamp(1, 200))
        .fetch_all(self.store().pool())
        .await?)
    }
}

#[cfg(test)]
mod tests {
    use crate::account::BalanceSnapshot;

    #[test]
    fn hold_reservation_arithmetic_releases_in_full() {
        // hold 4000 against 10000, commit 3000: the reservation clears
        // entirely and only the committed part settles.
        let mut source = BalanceSnapshot {
            balance: 10000,
            credit_balance: 10000,
            debit_balance: 0,
            pending_credit: 0,
            pending_debit: 0,
        };
        source.pending_debit += 4000;
        assert_eq!(source.balance, 10000);

        let held = 4000;
        let committed = 3000;
        source.pending_debit -= held;
        source.balance -= committed;
        source.debit_balance += committed;
        assert_eq!(source.balance, 7000);
        assert_eq!(source.pending_debit, 0);
        assert_eq!(source.debit_balance, 3000);
    }
}
