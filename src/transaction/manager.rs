//! The single transactional template behind every money movement.
//!
//! Each operation runs as: idempotency short-circuit, ordered account
//! locks, policy validation, header + status insert, one entry and one
//! version row per leg, hash-chained event plus outbox row, commit. Legs
//! on hot system accounts are staged instead of locked.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::account::manager::{AccountManager, Direction};
use crate::account::{Account, ChangeType, HolderType};
use crate::chain::events::{event_payload, AppendEvent, EventStore};
use crate::config::{LedgerConfig, LockMode};
use crate::error::{LedgerError, Result};
use crate::outbox;
use crate::store::{dialect, PgTx, Store};
use crate::transaction::records::{self, ExchangeDetail, NewEntry, NewTransaction};
use crate::transaction::{idempotency, EntryRecord, TransactionDto, TransactionRecord, TxStatus};

const MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone)]
pub struct CreditRequest {
    pub ledger_id: Uuid,
    pub holder_id: String,
    pub amount: i64,
    pub reference: String,
    pub description: Option<String>,
    pub source_system_account: Option<String>,
    pub idempotency_key: Option<String>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct DebitRequest {
    pub ledger_id: Uuid,
    pub holder_id: String,
    pub amount: i64,
    pub reference: String,
    pub description: Option<String>,
    pub destination_system_account: Option<String>,
    pub allow_overdraft: bool,
    pub idempotency_key: Option<String>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub ledger_id: Uuid,
    pub source_holder_id: String,
    pub destination_holder_id: String,
    pub amount: i64,
    pub reference: String,
    pub description: Option<String>,
    pub exchange_rate: Option<f64>,
    pub idempotency_key: Option<String>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct MultiTransferDestination {
    pub holder_id: String,
    pub amount: i64,
}

#[derive(Debug, Clone)]
pub struct MultiTransferRequest {
    pub ledger_id: Uuid,
    pub source_holder_id: String,
    pub destinations: Vec<MultiTransferDestination>,
    pub reference: String,
    pub description: Option<String>,
    pub idempotency_key: Option<String>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct RefundRequest {
    pub ledger_id: Uuid,
    pub transaction_id: Uuid,
    pub reason: String,
    pub amount: Option<i64>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, serde::Serialize)]
pub struct TransactionView {
    #[serde(flatten)]
    pub transaction: TransactionRecord,
    pub status: TxStatus,
    pub entries: Vec<EntryRecord>,
}

#[derive(Clone)]
pub struct TransactionManager {
    store: Store,
    events: EventStore,
    accounts: AccountManager,
    config: Arc<LedgerConfig>,
}

impl TransactionManager {
    pub fn new(
        store: Store,
        events: EventStore,
        accounts: AccountManager,
        config: Arc<LedgerConfig>,
    ) -> Self {
        Self {
            store,
            events,
            accounts,
            config,
        }
    }

    pub(crate) fn store(&self) -> &Store {
        &self.store
    }

    pub(crate) fn events(&self) -> &EventStore {
        &self.events
    }

    pub(crate) fn accounts(&self) -> &AccountManager {
        &self.accounts
    }

    pub(crate) fn config(&self) -> &Arc<LedgerConfig> {
        &self.config
    }

    fn lock_mode(&self) -> LockMode {
        self.config.advanced.lock_mode
    }

    /// Bounded retry around one pipeline attempt: write conflicts under
    /// optimistic mode (or deadlocks under wait mode) get re-run with
    /// jittered backoff; everything else surfaces immediately. Each attempt
    /// runs under the configured transaction timeout.
    pub(crate) async fn with_conflict_retry<T, F, Fut>(&self, mut attempt_fn: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let timeout = Duration::from_millis(self.config.advanced.transaction_timeout_ms);
        let mut attempt = 0u32;
        loop {
            let outcome = match tokio::time::timeout(timeout, attempt_fn()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(LedgerError::Internal("transaction timed out".to_string())),
            };
            match outcome {
                Err(err) if err.is_retryable() && attempt + 1 < MAX_RETRIES => {
                    attempt += 1;
                    let jitter = rand::thread_rng().gen_range(0..50);
                    let delay = Duration::from_millis(50 * attempt as u64 + jitter);
                    tracing::warn!(attempt, "write conflict, retrying transaction");
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    pub async fn credit(&self, req: CreditRequest) -> Result<TransactionDto> {
        validate_amount(req.amount)?;
        self.with_conflict_retry(|| self.try_credit(&req)).await
    }

    async fn try_credit(&self, req: &CreditRequest) -> Result<TransactionDto> {
        let holder = self
            .accounts
            .get_account(req.ledger_id, &req.holder_id)
            .await?;
        let system_holder = req
            .source_system_account
            .clone()
            .unwrap_or_else(|| self.config.system_accounts.world.clone());
        let system = self
            .ensure_system_account(req.ledger_id, &system_holder, &holder.currency)
            .await?;
        if system.id == holder.id {
            return Err(LedgerError::InvalidArgument(
                "cannot credit a system account from itself".to_string(),
            ));
        }

        let mut tx = self.store.begin().await?;
        if let Some(hit) = self.idempotency_hit(&mut tx, req.ledger_id, &req.idempotency_key).await? {
            tx.rollback().await?;
            return Ok(hit);
        }

        let locked = self
            .lock_participants(&mut tx, &[&system, &holder])
            .await?;
        let holder = &locked[&holder.id];
        let system = &locked[&system.id];
        self.accounts.require_active(holder)?;

        let correlation_id = Uuid::new_v4();
        let transaction_id = records::insert_transaction(
            &self.store,
            &mut tx,
            &NewTransaction {
                ledger_id: req.ledger_id,
                transaction_type: "credit",
                reference: req.reference.clone(),
                amount: req.amount,
                currency: holder.currency.clone(),
                description: req.description.clone(),
                correlation_id,
                source_account_id: Some(system.id),
                destination_account_id: Some(holder.id),
                is_hold: false,
                is_reversal: false,
                hold_expires_at: None,
                parent_id: None,
                metadata: req.metadata.clone(),
            },
        )
        .await?;
        records::insert_status(&self.store, &mut tx, transaction_id, "posted", None).await?;

        self.apply_or_stage_leg(
            &mut tx,
            system,
            Direction::Debit,
            req.amount,
            ChangeType::Credit,
            transaction_id,
            None,
        )
        .await?;
        self.apply_or_stage_leg(
            &mut tx,
            holder,
            Direction::Credit,
            req.amount,
            ChangeType::Credit,
            transaction_id,
            None,
        )
        .await?;

        let dto = self
            .finish_posted(
                &mut tx,
                transaction_id,
                req.ledger_id,
                correlation_id,
                "transaction.posted",
                &req.idempotency_key,
                holder.id,
            )
            .await?;
        tx.commit().await?;
        Ok(dto)
    }

    pub async fn debit(&self, req: DebitRequest) -> Result<TransactionDto> {
        validate_amount(req.amount)?;
        self.with_conflict_retry(|| self.try_debit(&req)).await
    }

    async fn try_debit(&self, req: &DebitRequest) -> Result<TransactionDto> {
        let holder = self
            .accounts
            .get_account(req.ledger_id, &req.holder_id)
            .await?;
        let system_holder = req
            .destination_system_account
            .clone()
            .unwrap_or_else(|| self.config.system_accounts.world.clone());
        let system = self
            .ensure_system_account(req.ledger_id, &system_holder, &holder.currency)
            .await?;
        if system.id == holder.id {
            return Err(LedgerError::InvalidArgument(
                "cannot debit a system account into itself".to_string(),
            ));
        }

        let mut tx = self.store.begin().await?;
        if let Some(hit) = self.idempotency_hit(&mut tx, req.ledger_id, &req.idempotency_key).await? {
            tx.rollback().await?;
            return Ok(hit);
        }

        let locked = self
            .lock_participants(&mut tx, &[&holder, &system])
            .await?;
        let holder = &locked[&holder.id];
        let system = &locked[&system.id];
        self.accounts.require_active(holder)?;
        self.accounts
            .check_funds(holder, req.amount, req.allow_overdraft)?;

        let correlation_id = Uuid::new_v4();
        let transaction_id = records::insert_transaction(
            &self.store,
            &mut tx,
            &NewTransaction {
                ledger_id: req.ledger_id,
                transaction_type: "debit",
                reference: req.reference.clone(),
                amount: req.amount,
                currency: holder.currency.clone(),
                description: req.description.clone(),
                correlation_id,
                source_account_id: Some(holder.id),
                destination_account_id: Some(system.id),
                is_hold: false,
                is_reversal: false,
                hold_expires_at: None,
                parent_id: None,
                metadata: req.metadata.clone(),
            },
        )
        .await?;
        records::insert_status(&self.store, &mut tx, transaction_id, "posted", None).await?;

        self.apply_or_stage_leg(
            &mut tx,
            holder,
            Direction::Debit,
            req.amount,
            ChangeType::Debit,
            transaction_id,
            None,
        )
        .await?;
        self.apply_or_stage_leg(
            &mut tx,
            system,
            Direction::Credit,
            req.amount,
            ChangeType::Debit,
            transaction_id,
            None,
        )
        .await?;

        let dto = self
            .finish_posted(
                &mut tx,
                transaction_id,
                req.ledger_id,
                correlation_id,
                "transaction.posted",
                &req.idempotency_key,
                holder.id,
            )
            .await?;
        tx.commit().await?;
        Ok(dto)
    }

    pub async fn transfer(&self, req: TransferRequest) -> Result<TransactionDto> {
        validate_amount(req.amount)?;
        if let Some(rate) = req.exchange_rate {
            if !(rate.is_finite() && rate > 0.0) {
                return Err(LedgerError::InvalidArgument(
                    "exchange_rate must be a positive number".to_string(),
                ));
            }
        }
        if req.source_holder_id == req.destination_holder_id {
            return Err(LedgerError::InvalidArgument(
                "source and destination must differ".to_string(),
            ));
        }
        self.with_conflict_retry(|| self.try_transfer(&req)).await
    }

    async fn try_transfer(&self, req: &TransferRequest) -> Result<TransactionDto> {
        let source = self
            .accounts
            .get_account(req.ledger_id, &req.source_holder_id)
            .await?;
        let destination = self
            .accounts
            .get_account(req.ledger_id, &req.destination_holder_id)
            .await?;

        // Cross-currency needs an explicit rate; the destination leg is
        // recorded in its own currency with the conversion detail attached.
        let exchange = if source.currency != destination.currency {
            let Some(rate) = req.exchange_rate else {
                return Err(LedgerError::CurrencyMismatch {
                    expected: source.currency.clone(),
                    actual: destination.currency.clone(),
                });
            };
            Some(ExchangeDetail {
                original_amount: req.amount,
                original_currency: source.currency.clone(),
                exchange_rate: rate,
            })
        } else {
            None
        };
        let destination_amount = match &exchange {
            Some(x) => {
                let converted = (req.amount as f64 * x.exchange_rate).floor() as i64;
                if converted <= 0 {
                    return Err(LedgerError::InvalidArgument(
                        "converted amount rounds to zero".to_string(),
                    ));
                }
                converted
            }
            None => req.amount,
        };

        let mut tx = self.store.begin().await?;
        if let Some(hit) = self.idempotency_hit(&mut tx, req.ledger_id, &req.idempotency_key).await? {
            tx.rollback().await?;
            return Ok(hit);
        }

        let locked = self
            .lock_participants(&mut tx, &[&source, &destination])
            .await?;
        let source = &locked[&source.id];
        let destination = &locked[&destination.id];
        self.accounts.require_active(source)?;
        self.accounts.require_active(destination)?;
        self.accounts.check_funds(source, req.amount, false)?;

        let correlation_id = Uuid::new_v4();
        let transaction_id = records::insert_transaction(
            &self.store,
            &mut tx,
            &NewTransaction {
                ledger_id: req.ledger_id,
                transaction_type: "transfer",
                reference: req.reference.clone(),
                amount: req.amount,
                currency: source.currency.clone(),
                description: req.description.clone(),
                correlation_id,
                source_account_id: Some(source.id),
                destination_account_id: Some(destination.id),
                is_hold: false,
                is_reversal: false,
                hold_expires_at: None,
                parent_id: None,
                metadata: req.metadata.clone(),
            },
        )
        .await?;
        records::insert_status(&self.store, &mut tx, transaction_id, "posted", None).await?;

        self.apply_or_stage_leg(
            &mut tx,
            source,
            Direction::Debit,
            req.amount,
            ChangeType::Debit,
            transaction_id,
            None,
        )
        .await?;
        self.apply_or_stage_leg(
            &mut tx,
            destination,
            Direction::Credit,
            destination_amount,
            ChangeType::Credit,
            transaction_id,
            exchange.as_ref(),
        )
        .await?;

        let dto = self
            .finish_posted(
                &mut tx,
                transaction_id,
                req.ledger_id,
                correlation_id,
                "transaction.posted",
                &req.idempotency_key,
                source.id,
            )
            .await?;
        tx.commit().await?;
        Ok(dto)
    }

    pub async fn multi_transfer(&self, req: MultiTransferRequest) -> Result<TransactionDto> {
        if req.destinations.is_empty() {
            return Err(LedgerError::InvalidArgument(
                "at least one destination is required".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for dest in &req.destinations {
            validate_amount(dest.amount)?;
            if dest.holder_id == req.source_holder_id {
                return Err(LedgerError::InvalidArgument(
                    "source cannot be a destination".to_string(),
                ));
            }
            if !seen.insert(dest.holder_id.as_str()) {
                return Err(LedgerError::InvalidArgument(format!(
                    "duplicate destination: {}",
                    dest.holder_id
                )));
            }
        }
        self.with_conflict_retry(|| self.try_multi_transfer(&req))
            .await
    }

    async fn try_multi_transfer(&self, req: &MultiTransferRequest) -> Result<TransactionDto> {
        let total: i64 = req.destinations.iter().map(|d| d.amount).sum();
        let source = self
            .accounts
            .get_account(req.ledger_id, &req.source_holder_id)
            .await?;
        let mut participants = vec![source.clone()];
        for dest in &req.destinations {
            let account = self
                .accounts
                .get_account(req.ledger_id, &dest.holder_id)
                .await?;
            if account.currency != source.currency {
                return Err(LedgerError::CurrencyMismatch {
                    expected: source.currency.clone(),
                    actual: account.currency.clone(),
                });
            }
            participants.push(account);
        }

        let mut tx = self.store.begin().await?;
        if let Some(hit) = self.idempotency_hit(&mut tx, req.ledger_id, &req.idempotency_key).await? {
            tx.rollback().await?;
            return Ok(hit);
        }

        let refs: Vec<&Account> = participants.iter().collect();
        let locked = self.lock_participants(&mut tx, &refs).await?;
        let source = &locked[&source.id];
        self.accounts.require_active(source)?;
        self.accounts.check_funds(source, total, false)?;

        let destinations_meta: Vec<Value> = req
            .destinations
            .iter()
            .map(|d| json!({"holder_id": d.holder_id, "amount": d.amount}))
            .collect();
        let correlation_id = Uuid::new_v4();
        let transaction_id = records::insert_transaction(
            &self.store,
            &mut tx,
            &NewTransaction {
                ledger_id: req.ledger_id,
                transaction_type: "transfer",
                reference: req.reference.clone(),
                amount: total,
                currency: source.currency.clone(),
                description: req.description.clone(),
                correlation_id,
                source_account_id: Some(source.id),
                destination_account_id: None,
                is_hold: false,
                is_reversal: false,
                hold_expires_at: None,
                parent_id: None,
                metadata: Some(json!({
                    "multi": true,
                    "destinations": destinations_meta,
                })),
            },
        )
        .await?;
        records::insert_status(&self.store, &mut tx, transaction_id, "posted", None).await?;

        // One debit for the fan-out total, one credit per destination:
        // the credits sum to the debit, so double entry holds.
        self.apply_or_stage_leg(
            &mut tx,
            source,
            Direction::Debit,
            total,
            ChangeType::Debit,
            transaction_id,
            None,
        )
        .await?;
        for dest in &req.destinations {
            let account = participants
                .iter()
                .find(|a| a.holder_id == dest.holder_id)
                .expect("participant resolved above");
            let account = &locked[&account.id];
            self.accounts.require_active(account)?;
            self.apply_or_stage_leg(
                &mut tx,
                account,
                Direction::Credit,
                dest.amount,
                ChangeType::Credit,
                transaction_id,
                None,
            )
            .await?;
        }

        let dto = self
            .finish_posted(
                &mut tx,
                transaction_id,
                req.ledger_id,
                correlation_id,
                "transaction.posted",
                &req.idempotency_key,
                source.id,
            )
            .await?;
        tx.commit().await?;
        Ok(dto)
    }

    pub async fn refund(&self, req: RefundRequest) -> Result<TransactionDto> {
        if let Some(amount) = req.amount {
            validate_amount(amount)?;
        }
        self.with_conflict_retry(|| self.try_refund(&req)).await
    }

    async fn try_refund(&self, req: &RefundRequest) -> Result<TransactionDto> {
        let mut tx = self.store.begin().await?;
        if let Some(hit) = self.idempotency_hit(&mut tx, req.ledger_id, &req.idempotency_key).await? {
            tx.rollback().await?;
            return Ok(hit);
        }

        let parent = records::load_transaction_for_update(&self.store, &mut tx, req.transaction_id)
            .await?
            .ok_or_else(|| {
                LedgerError::NotFound(format!("transaction not found: {}", req.transaction_id))
            })?;
        if parent.ledger_id != req.ledger_id {
            return Err(LedgerError::NotFound(format!(
                "transaction not found: {}",
                req.transaction_id
            )));
        }
        if parent.is_hold {
            return Err(LedgerError::InvalidArgument(
                "holds are voided, not refunded".to_string(),
            ));
        }
        let parent_status = records::current_status_in_tx(&self.store, &mut tx, parent.id).await?;
        if !matches!(parent_status, TxStatus::Posted | TxStatus::Reversed) {
            return Err(LedgerError::Conflict(format!(
                "transaction is {}, not refundable",
                parent_status.as_str()
            )));
        }

        let remaining = parent.amount - parent.refunded_amount;
        let amount = req.amount.unwrap_or(remaining);
        if amount <= 0 || amount > remaining {
            return Err(LedgerError::InvalidArgument(format!(
                "refund amount {amount} exceeds unrefunded remainder {remaining}"
            )));
        }

        let parent_entries = records::load_entries(&self.store, parent.id).await?;
        if parent_entries.iter().any(|e| e.exchange_rate.is_some()) {
            return Err(LedgerError::InvalidArgument(
                "cross-currency transactions cannot be refunded automatically".to_string(),
            ));
        }
        // Partial refunds need an unambiguous pair of legs; fan-outs must be
        // reversed in full.
        let simple_pair = parent.source_account_id.is_some() && parent.destination_account_id.is_some();
        if !simple_pair && amount != remaining {
            return Err(LedgerError::InvalidArgument(
                "partial refund is only supported for two-leg transactions".to_string(),
            ));
        }

        let mut account_ids: Vec<Uuid> = parent_entries.iter().map(|e| e.account_id).collect();
        account_ids.sort();
        account_ids.dedup();
        let mut locked: HashMap<Uuid, Account> = HashMap::new();
        for id in &account_ids {
            let account = self
                .accounts
                .resolve_by_id_for_update(&mut tx, *id, self.lock_mode())
                .await?;
            locked.insert(*id, account);
        }

        let correlation_id = Uuid::new_v4();
        let refund_id = records::insert_transaction(
            &self.store,
            &mut tx,
            &NewTransaction {
                ledger_id: req.ledger_id,
                transaction_type: "correction",
                reference: format!("refund-{}-{}", parent.reference, parent.refunded_amount + amount),
                amount,
                currency: parent.currency.clone(),
                description: Some(req.reason.clone()),
                correlation_id,
                source_account_id: parent.destination_account_id,
                destination_account_id: parent.source_account_id,
                is_hold: false,
                is_reversal: true,
                hold_expires_at: None,
                parent_id: Some(parent.id),
                metadata: None,
            },
        )
        .await?;
        records::insert_status(&self.store, &mut tx, refund_id, "posted", None).await?;

        if simple_pair {
            let source = &locked[&parent.destination_account_id.expect("simple pair")];
            let destination = &locked[&parent.source_account_id.expect("simple pair")];
            self.accounts.require_active(source)?;
            self.accounts.require_active(destination)?;
            self.accounts.check_funds(source, amount, false)?;
            self.apply_or_stage_leg(
                &mut tx,
                source,
                Direction::Debit,
                amount,
                ChangeType::Refund,
                refund_id,
                None,
            )
            .await?;
            self.apply_or_stage_leg(
                &mut tx,
                destination,
                Direction::Credit,
                amount,
                ChangeType::Refund,
                refund_id,
                None,
            )
            .await?;
        } else {
            // Full reversal: every original leg gets its mirror image.
            for entry in parent_entries.iter().filter(|e| !e.is_hot) {
                let account = &locked[&entry.account_id];
                let direction = match entry.entry_type.as_str() {
                    "CREDIT" => Direction::Debit,
                    _ => Direction::Credit,
                };
                self.apply_or_stage_leg(
                    &mut tx,
                    account,
                    direction,
                    entry.amount,
                    ChangeType::Refund,
                    refund_id,
                    None,
                )
                .await?;
            }
        }

        records::add_refunded_amount(&self.store, &mut tx, parent.id, amount).await?;
        if parent.refunded_amount + amount == parent.amount {
            records::insert_status(&self.store, &mut tx, parent.id, "reversed", Some(&req.reason))
                .await?;
        }

        // The refund chains on the user-side account of the original
        // movement so that account's history shows both directions.
        let chain_account_id = account_ids
            .iter()
            .find(|id| !locked[id].is_system())
            .copied()
            .unwrap_or(account_ids[0]);
        let dto = self
            .finish_posted(
                &mut tx,
                refund_id,
                req.ledger_id,
                correlation_id,
                "transaction.refunded",
                &req.idempotency_key,
                chain_account_id,
            )
            .await?;
        tx.commit().await?;
        Ok(dto)
    }

    pub async fn get(&self, ledger_id: Uuid, transaction_id: Uuid) -> Result<TransactionView> {
        let transaction = records::load_transaction(&self.store, transaction_id)
            .await?
            .filter(|t| t.ledger_id == ledger_id)
            .ok_or_else(|| {
                LedgerError::NotFound(format!("transaction not found: {transaction_id}"))
            })?;
        let status = records::current_status(&self.store, transaction_id).await?;
        let entries = records::load_entries(&self.store, transaction_id).await?;
        Ok(TransactionView {
            transaction,
            status,
            entries,
        })
    }

    pub async fn list(
        &self,
        ledger_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<TransactionRecord>> {
        let table = self.store.table("transaction_record");
        let limit = limit.clamp(1, 200);
        Ok(sqlx::query_as(&format!(
            "SELECT id, ledger_id, transaction_type, reference, amount, currency, description, \
                    correlation_id, source_account_id, destination_account_id, is_hold, is_reversal, \
                    hold_expires_at, parent_id, refunded_amount, committed_amount, effective_date, \
                    metadata, created_at \
             FROM {table} WHERE ledger_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3"
        ))
        .bind(ledger_id)
        .bind(limit)
        .bind(offset.max(0))
        .fetch_all(self.store.pool())
        .await?)
    }

    pub async fn list_account_entries(
        &self,
        ledger_id: Uuid,
        holder_id: &str,
        limit: i64,
    ) -> Result<Vec<EntryRecord>> {
        let account = self.accounts.get_account(ledger_id, holder_id).await?;
        let table = self.store.table("entry_record");
        Ok(sqlx::query_as(&format!(
            "SELECT id, transaction_id, account_id, entry_type, amount, currency, balance_before, \
                    balance_after, account_version, sequence_number::BIGINT, original_amount, \
                    original_currency, exchange_rate, is_hot, created_at \
             FROM {table} WHERE account_id = $1 \
             ORDER BY sequence_number DESC LIMIT $2"
        ))
        .bind(account.id)
        .bind(limit.clamp(1, 500))
        .fetch_all(self.store.pool())
        .await?)
    }

    // ------------------------------------------------------------------
    // Shared pipeline pieces
    // ------------------------------------------------------------------

    pub(crate) async fn ensure_system_account(
        &self,
        ledger_id: Uuid,
        holder_id: &str,
        currency: &str,
    ) -> Result<Account> {
        self.accounts
            .create_account(crate::account::manager::CreateAccount {
                ledger_id,
                holder_id: holder_id.to_string(),
                holder_type: HolderType::System,
                currency: Some(currency.to_string()),
                allow_overdraft: true,
                overdraft_limit: 0,
                metadata: None,
            })
            .await
    }

    async fn idempotency_hit(
        &self,
        tx: &mut PgTx<'_>,
        ledger_id: Uuid,
        key: &Option<String>,
    ) -> Result<Option<TransactionDto>> {
        let Some(key) = key else { return Ok(None) };
        match idempotency::check(&self.store, tx, ledger_id, key).await? {
            Some(stored) => {
                let dto: TransactionDto = serde_json::from_value(stored.response)?;
                Ok(Some(dto))
            }
            None => Ok(None),
        }
    }

    /// Lock every participant in ascending account-id order. Hot system
    /// accounts are re-read without a lock; their state is advisory only
    /// because their legs are staged.
    pub(crate) async fn lock_participants(
        &self,
        tx: &mut PgTx<'_>,
        accounts: &[&Account],
    ) -> Result<HashMap<Uuid, Account>> {
        let mut ids: Vec<Uuid> = accounts.iter().map(|a| a.id).collect();
        ids.sort();
        ids.dedup();
        let mut locked = HashMap::with_capacity(ids.len());
        for id in ids {
            let original = accounts
                .iter()
                .find(|a| a.id == id)
                .expect("id came from the slice");
            let mode = if self.is_hot(original) {
                LockMode::Optimistic
            } else {
                self.lock_mode()
            };
            let account = self.accounts.resolve_by_id_for_update(tx, id, mode).await?;
            locked.insert(id, account);
        }
        Ok(locked)
    }

    pub(crate) fn is_hot(&self, account: &Account) -> bool {
        account.is_system() && self.config.is_hot_account(&account.holder_id)
    }

    /// Either mutate the account (entry + version row) or, for a hot
    /// account, write the entry and stage the balance effect for the
    /// coalescing worker.
    pub(crate) async fn apply_or_stage_leg(
        &self,
        tx: &mut PgTx<'_>,
        account: &Account,
        direction: Direction,
        amount: i64,
        change_type: ChangeType,
        transaction_id: Uuid,
        exchange: Option<&ExchangeDetail>,
    ) -> Result<()> {
        if self.is_hot(account) {
            records::insert_entry(
                &self.store,
                tx,
                &NewEntry {
                    transaction_id,
                    account_id: account.id,
                    entry_type: direction.as_str(),
                    amount,
                    currency: account.currency.clone(),
                    balance_before: 0,
                    balance_after: 0,
                    account_version: 0,
                    is_hot: true,
                    exchange: exchange.cloned(),
                },
            )
            .await?;
            let staged = self.store.table("hot_account_entry");
            sqlx::query(&format!(
                "INSERT INTO {staged} (account_id, transaction_id, entry_type, amount) \
                 VALUES ($1, $2, $3, $4)"
            ))
            .bind(account.id)
            .bind(transaction_id)
            .bind(direction.as_str())
            .bind(amount)
            .execute(&mut **tx)
            .await?;
            return Ok(());
        }
        self.accounts
            .apply_leg(tx, account, direction, amount, change_type, transaction_id, exchange)
            .await?;
        Ok(())
    }

    /// Tail of every posting pipeline: event, outbox, idempotency record.
    /// The event chains on the primary user account touched by the
    /// transaction, so one account's chain tells its whole story:
    /// creation, lifecycle changes, and every movement.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn finish_posted(
        &self,
        tx: &mut PgTx<'_>,
        transaction_id: Uuid,
        ledger_id: Uuid,
        correlation_id: Uuid,
        event_type: &str,
        idempotency_key: &Option<String>,
        chain_account_id: Uuid,
    ) -> Result<TransactionDto> {
        let table = self.store.table("transaction_record");
        let record: TransactionRecord = sqlx::query_as(&format!(
            "SELECT id, ledger_id, transaction_type, reference, amount, currency, description, \
                    correlation_id, source_account_id, destination_account_id, is_hold, is_reversal, \
                    hold_expires_at, parent_id, refunded_amount, committed_amount, effective_date, \
                    metadata, created_at \
             FROM {table} WHERE id = $1"
        ))
        .bind(transaction_id)
        .fetch_one(&mut **tx)
        .await?;
        let status = records::current_status_in_tx(&self.store, tx, transaction_id).await?;
        let dto = TransactionDto::from_record(&record, status);

        let payload = event_payload(&json!({
            "transaction_id": record.id,
            "ledger_id": ledger_id,
            "type": record.transaction_type,
            "reference": record.reference,
            "amount": record.amount,
            "currency": record.currency,
            "status": status.as_str(),
            "source_account_id": record.source_account_id,
            "destination_account_id": record.destination_account_id,
            "parent_id": record.parent_id,
        }))?;
        let appended = self
            .events
            .append_event(
                tx,
                AppendEvent {
                    aggregate_type: "account",
                    aggregate_id: &chain_account_id.to_string(),
                    event_type,
                    event_data: payload.clone(),
                    correlation_id: Some(correlation_id),
                },
            )
            .await?;
        let topic = format!("ledger-{}", event_type.replace('.', "-"));
        outbox::enqueue(&self.store, tx, appended.id, &topic, &payload).await?;

        if let Some(key) = idempotency_key {
            let response = serde_json::to_value(&dto)?;
            idempotency::store(
                &self.store,
                tx,
                ledger_id,
                key,
                &response,
                201,
                self.config.advanced.idempotency_ttl_hours,
            )
            .await?;
        }
        Ok(dto)
    }
}

impl TransactionManager {
    /// Coalesce staged hot-account legs into one version bump per account.
    /// Rows are claimed with SKIP LOCKED so concurrent instances never
    /// double-apply a leg.
    pub async fn coalesce_hot_accounts(&self) -> Result<u64> {
        let staged = self.store.table("hot_account_entry");
        let account_ids: Vec<Uuid> = sqlx::query_scalar(&format!(
            "SELECT DISTINCT account_id FROM {staged} WHERE status = 'pending'"
        ))
        .fetch_all(self.store.pool())
        .await?;

        let mut coalesced = 0u64;
        for account_id in account_ids {
            let mut tx = self.store.begin().await?;
            let rows: Vec<(Uuid, String, i64)> = sqlx::query_as(&format!(
                "SELECT id, entry_type, amount FROM {staged} \
                 WHERE account_id = $1 AND status = 'pending' \
                 ORDER BY created_at ASC LIMIT 500 {}",
                dialect::for_update_skip_locked()
            ))
            .bind(account_id)
            .fetch_all(&mut *tx)
            .await?;
            if rows.is_empty() {
                tx.rollback().await?;
                continue;
            }

            let account = self
                .accounts
                .resolve_by_id_for_update(&mut tx, account_id, LockMode::Wait)
                .await?;
            let mut snapshot = crate::account::BalanceSnapshot::of(&account);
            let mut net = 0i64;
            for (_, entry_type, amount) in &rows {
                if entry_type == "CREDIT" {
                    snapshot.credit_balance += amount;
                    net += amount;
                } else {
                    snapshot.debit_balance += amount;
                    net -= amount;
                }
            }
            snapshot.balance += net;
            let change_type = if net >= 0 {
                ChangeType::Credit
            } else {
                ChangeType::Debit
            };
            self.accounts
                .append_balance_version(&mut tx, &account, &snapshot, change_type)
                .await?;

            let ids: Vec<Uuid> = rows.iter().map(|(id, _, _)| *id).collect();
            sqlx::query(&format!(
                "UPDATE {staged} SET status = 'settled' WHERE id = ANY($1)"
            ))
            .bind(&ids)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            coalesced += rows.len() as u64;
        }
        if coalesced > 0 {
            tracing::info!(coalesced, "hot account legs coalesced");
        }
        Ok(coalesced)
    }
}

fn validate_amount(amount: i64) -> Result<()> {
    if amount <= 0 {
        return Err(LedgerError::InvalidArgument(
            "amount must be a positive integer in minor units".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amounts_must_be_positive() {
        assert!(validate_amount(1).is_ok());
        assert!(validate_amount(0).is_err());
        assert!(validate_amount(-5).is_err());
    }

    #[test]
    fn conversion_floors_to_minor_units() {
        // 20000 minor units at 0.8531 => 17062 exactly.
        let converted = (20000f64 * 0.8531).floor() as i64;
        assert_eq!(converted, 17062);
        // A rate that rounds below one unit is rejected upstream.
        let tiny = (1f64 * 0.4).floor() as i64;
        assert_eq!(tiny, 0);
    }
}
