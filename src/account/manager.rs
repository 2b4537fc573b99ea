//! Account lifecycle and balance projection.
//!
//! The parent row never changes after insert; every state change appends a
//! version row. Mutating managers reach accounts only through
//! [`AccountManager::resolve_for_update`], which applies the configured lock
//! mode and re-proves the HMAC checksum before any decision is made on the
//! balance.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::account::{
    compute_checksum, verify_checksum, Account, AccountStatus, BalanceSnapshot, ChangeType,
    HolderType,
};
use crate::chain::events::{event_payload, AppendEvent, EventStore};
use crate::config::{validate_currency, LedgerConfig, LockMode};
use crate::error::{LedgerError, Result};
use crate::outbox;
use crate::store::{advisory_key, dialect, PgTx, Store};
use crate::transaction::records;
use crate::util::cursor::Cursor;

/// Direction of a balance movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Credit,
    Debit,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Credit => "CREDIT",
            Direction::Debit => "DEBIT",
        }
    }

    pub fn inverse(&self) -> Self {
        match self {
            Direction::Credit => Direction::Debit,
            Direction::Debit => Direction::Credit,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateAccount {
    pub ledger_id: Uuid,
    pub holder_id: String,
    pub holder_type: HolderType,
    pub currency: Option<String>,
    pub allow_overdraft: bool,
    pub overdraft_limit: i64,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BalanceView {
    pub account_id: Uuid,
    pub currency: String,
    pub balance: i64,
    pub credit_balance: i64,
    pub debit_balance: i64,
    pub pending_credit: i64,
    pub pending_debit: i64,
    pub version: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub as_of: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct ListAccounts {
    pub ledger_id: Uuid,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
    pub status: Option<AccountStatus>,
    pub holder_type: Option<HolderType>,
    pub search: Option<String>,
    pub cursor: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct AccountPage {
    pub accounts: Vec<Account>,
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Extra columns recorded on lifecycle version rows.
#[derive(Debug, Clone, Default)]
pub struct LifecycleStamp {
    pub freeze_reason: Option<String>,
    pub frozen_by: Option<String>,
    pub closed_reason: Option<String>,
    pub closed_by: Option<String>,
}

const ACCOUNT_COLUMNS: &str = "ab.id, ab.ledger_id, ab.holder_id, ab.holder_type, ab.currency, \
     ab.allow_overdraft, ab.overdraft_limit, ab.metadata, ab.created_at, \
     lv.version, lv.balance, lv.credit_balance, lv.debit_balance, \
     lv.pending_credit, lv.pending_debit, lv.status, lv.checksum";

const CACHED_COLUMNS: &str = "ab.id, ab.ledger_id, ab.holder_id, ab.holder_type, ab.currency, \
     ab.allow_overdraft, ab.overdraft_limit, ab.metadata, ab.created_at, \
     ab.cached_version AS version, ab.cached_balance AS balance, \
     ab.cached_credit_balance AS credit_balance, ab.cached_debit_balance AS debit_balance, \
     ab.cached_pending_credit AS pending_credit, ab.cached_pending_debit AS pending_debit, \
     ab.cached_status AS status, ab.cached_checksum AS checksum";

#[derive(Clone)]
pub struct AccountManager {
    store: Store,
    events: EventStore,
    config: Arc<LedgerConfig>,
}

impl AccountManager {
    pub fn new(store: Store, events: EventStore, config: Arc<LedgerConfig>) -> Self {
        Self {
            store,
            events,
            config,
        }
    }

    fn secret(&self) -> &str {
        &self.config.advanced.hmac_secret
    }

    /// Create an account, or return the existing one for the same
    /// (ledger, holder, currency). The advisory lock closes the race where
    /// two creators pass the fast-path read simultaneously.
    pub async fn create_account(&self, req: CreateAccount) -> Result<Account> {
        let currency = match &req.currency {
            Some(c) => c.clone(),
            None => self.config.currency.clone(),
        };
        if !validate_currency(&currency) {
            return Err(LedgerError::InvalidArgument(format!(
                "invalid currency code: {currency}"
            )));
        }
        if req.holder_id.trim().is_empty() {
            return Err(LedgerError::InvalidArgument("holder_id is required".to_string()));
        }

        if let Some(existing) = self
            .find_account(req.ledger_id, &req.holder_id, Some(&currency))
            .await?
        {
            return Ok(existing);
        }

        let mut tx = self.store.begin().await?;
        let lock = advisory_key(&format!(
            "{}:{}:{}",
            req.ledger_id, req.holder_id, currency
        ));
        self.store.advisory_lock(&mut tx, lock).await?;

        // Re-check under the lock: a concurrent creator may have won.
        if let Some(existing) = self
            .find_account_in_tx(&mut tx, req.ledger_id, &req.holder_id, Some(&currency))
            .await?
        {
            tx.rollback().await?;
            return Ok(existing);
        }

        let accounts = self.store.table("account_balance");
        let account_id: Uuid = sqlx::query_scalar(&format!(
            "INSERT INTO {accounts} \
             (ledger_id, holder_id, holder_type, currency, allow_overdraft, overdraft_limit, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) {}",
            dialect::returning(&["id"])
        ))
        .bind(req.ledger_id)
        .bind(&req.holder_id)
        .bind(req.holder_type.as_str())
        .bind(&currency)
        .bind(req.allow_overdraft)
        .bind(req.overdraft_limit)
        .bind(req.metadata.clone().unwrap_or_else(|| json!({})))
        .fetch_one(&mut *tx)
        .await?;

        self.insert_version(
            &mut tx,
            account_id,
            1,
            &BalanceSnapshot::default(),
            AccountStatus::Active,
            ChangeType::Create,
            &LifecycleStamp::default(),
        )
        .await?;

        let payload = event_payload(&json!({
            "account_id": account_id,
            "ledger_id": req.ledger_id,
            "holder_id": req.holder_id,
            "holder_type": req.holder_type.as_str(),
            "currency": currency,
        }))?;
        let appended = self
            .events
            .append_event(
                &mut tx,
                AppendEvent {
                    aggregate_type: "account",
                    aggregate_id: &account_id.to_string(),
                    event_type: "account.created",
                    event_data: payload.clone(),
                    correlation_id: None,
                },
            )
            .await?;
        outbox::enqueue(&self.store, &mut tx, appended.id, "ledger-account-created", &payload)
            .await?;

        let account = self
            .load_by_id_in_tx(&mut tx, account_id)
            .await?
            .ok_or_else(|| LedgerError::Internal("account vanished mid-create".to_string()))?;
        tx.commit().await?;
        Ok(account)
    }

    pub async fn find_account(
        &self,
        ledger_id: Uuid,
        holder_id: &str,
        currency: Option<&str>,
    ) -> Result<Option<Account>> {
        let sql = self.select_account_sql(currency.is_some(), "");
        let query = sqlx::query_as::<_, Account>(&sql)
            .bind(ledger_id)
            .bind(holder_id);
        let query = match currency {
            Some(c) => query.bind(c),
            None => query,
        };
        let account = query.fetch_optional(self.store.pool()).await?;
        if let Some(account) = &account {
            verify_checksum(self.secret(), account)?;
        }
        Ok(account)
    }

    pub async fn get_account(&self, ledger_id: Uuid, holder_id: &str) -> Result<Account> {
        self.find_account(ledger_id, holder_id, None)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("account not found: {holder_id}")))
    }

    async fn find_account_in_tx(
        &self,
        tx: &mut PgTx<'_>,
        ledger_id: Uuid,
        holder_id: &str,
        currency: Option<&str>,
    ) -> Result<Option<Account>> {
        let sql = self.select_account_sql(currency.is_some(), "");
        let query = sqlx::query_as::<_, Account>(&sql)
            .bind(ledger_id)
            .bind(holder_id);
        let query = match currency {
            Some(c) => query.bind(c),
            None => query,
        };
        let account = query.fetch_optional(&mut **tx).await?;
        if let Some(account) = &account {
            verify_checksum(self.secret(), account)?;
        }
        Ok(account)
    }

    async fn load_by_id_in_tx(&self, tx: &mut PgTx<'_>, id: Uuid) -> Result<Option<Account>> {
        let accounts = self.store.table("account_balance");
        let versions = self.store.table("account_balance_version");
        let sql = format!(
            "SELECT {ACCOUNT_COLUMNS} FROM {accounts} ab \
             JOIN LATERAL (SELECT * FROM {versions} v WHERE v.account_id = ab.id \
                           ORDER BY v.version DESC LIMIT 1) lv ON TRUE \
             WHERE ab.id = $1"
        );
        Ok(sqlx::query_as(&sql).bind(id).fetch_optional(&mut **tx).await?)
    }

    fn select_account_sql(&self, with_currency: bool, lock_clause: &str) -> String {
        let accounts = self.store.table("account_balance");
        let versions = self.store.table("account_balance_version");
        let currency_filter = if with_currency { "AND ab.currency = $3" } else { "" };
        // A holder may carry one account per currency; without a currency
        // filter the oldest account is the holder's primary.
        if self.config.advanced.use_denormalized_balance {
            // O(1) fast path: the cached_* mirror serves the version data.
            format!(
                "SELECT {CACHED_COLUMNS} FROM {accounts} ab \
                 WHERE ab.ledger_id = $1 AND ab.holder_id = $2 {currency_filter} \
                 ORDER BY ab.created_at ASC LIMIT 1 {lock_clause}"
            )
        } else {
            format!(
                "SELECT {ACCOUNT_COLUMNS} FROM {accounts} ab \
                 JOIN LATERAL (SELECT * FROM {versions} v WHERE v.account_id = ab.id \
                               ORDER BY v.version DESC LIMIT 1) lv ON TRUE \
                 WHERE ab.ledger_id = $1 AND ab.holder_id = $2 {currency_filter} \
                 ORDER BY ab.created_at ASC LIMIT 1 {lock_clause}"
            )
        }
    }

    /// The sole path by which a mutating pipeline sees an account.
    pub async fn resolve_for_update(
        &self,
        tx: &mut PgTx<'_>,
        ledger_id: Uuid,
        holder_id: &str,
        mode: LockMode,
    ) -> Result<Account> {
        let lock_clause = match mode {
            LockMode::Wait => "FOR UPDATE OF ab",
            LockMode::NoWait => "FOR UPDATE OF ab NOWAIT",
            LockMode::Optimistic => "",
        };
        let sql = self.select_account_sql(false, lock_clause);
        let account: Option<Account> = sqlx::query_as(&sql)
            .bind(ledger_id)
            .bind(holder_id)
            .fetch_optional(&mut **tx)
            .await?;
        let account = account
            .ok_or_else(|| LedgerError::NotFound(format!("account not found: {holder_id}")))?;
        verify_checksum(self.secret(), &account)?;
        Ok(account)
    }

    /// Lock by account id; the transaction pipeline orders these calls by
    /// ascending UUID to keep multi-account acquisition deadlock-free.
    pub async fn resolve_by_id_for_update(
        &self,
        tx: &mut PgTx<'_>,
        account_id: Uuid,
        mode: LockMode,
    ) -> Result<Account> {
        let accounts = self.store.table("account_balance");
        let versions = self.store.table("account_balance_version");
        let lock_clause = match mode {
            LockMode::Wait => "FOR UPDATE OF ab",
            LockMode::NoWait => "FOR UPDATE OF ab NOWAIT",
            LockMode::Optimistic => "",
        };
        let sql = if self.config.advanced.use_denormalized_balance {
            format!("SELECT {CACHED_COLUMNS} FROM {accounts} ab WHERE ab.id = $1 {lock_clause}")
        } else {
            format!(
                "SELECT {ACCOUNT_COLUMNS} FROM {accounts} ab \
                 JOIN LATERAL (SELECT * FROM {versions} v WHERE v.account_id = ab.id \
                               ORDER BY v.version DESC LIMIT 1) lv ON TRUE \
                 WHERE ab.id = $1 {lock_clause}"
            )
        };
        let account: Option<Account> = sqlx::query_as(&sql)
            .bind(account_id)
            .fetch_optional(&mut **tx)
            .await?;
        let account = account
            .ok_or_else(|| LedgerError::NotFound(format!("account not found: {account_id}")))?;
        verify_checksum(self.secret(), &account)?;
        Ok(account)
    }

    async fn insert_version(
        &self,
        tx: &mut PgTx<'_>,
        account_id: Uuid,
        version: i64,
        snapshot: &BalanceSnapshot,
        status: AccountStatus,
        change_type: ChangeType,
        stamp: &LifecycleStamp,
    ) -> Result<()> {
        let versions = self.store.table("account_balance_version");
        let checksum = compute_checksum(self.secret(), snapshot, version);
        let frozen_at = stamp.freeze_reason.as_ref().map(|_| Utc::now());
        let closed_at = stamp.closed_by.as_ref().map(|_| Utc::now());
        sqlx::query(&format!(
            "INSERT INTO {versions} \
             (account_id, version, balance, credit_balance, debit_balance, pending_credit, pending_debit, \
              status, checksum, change_type, freeze_reason, frozen_by, frozen_at, closed_reason, closed_by, closed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)"
        ))
        .bind(account_id)
        .bind(version)
        .bind(snapshot.balance)
        .bind(snapshot.credit_balance)
        .bind(snapshot.debit_balance)
        .bind(snapshot.pending_credit)
        .bind(snapshot.pending_debit)
        .bind(status.as_str())
        .bind(&checksum)
        .bind(change_type.as_str())
        .bind(&stamp.freeze_reason)
        .bind(&stamp.frozen_by)
        .bind(frozen_at)
        .bind(&stamp.closed_reason)
        .bind(&stamp.closed_by)
        .bind(closed_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            // Under optimistic mode a duplicate (account_id, version) is the
            // conflict signal, not a data error.
            let mapped: LedgerError = e.into();
            if matches!(mapped, LedgerError::AlreadyExists(_)) {
                LedgerError::Conflict(format!(
                    "version {version} already written for account {account_id}"
                ))
            } else {
                mapped
            }
        })?;

        if self.config.advanced.use_denormalized_balance {
            let accounts = self.store.table("account_balance");
            sqlx::query(&format!(
                "UPDATE {accounts} SET cached_version = $2, cached_balance = $3, \
                 cached_credit_balance = $4, cached_debit_balance = $5, \
                 cached_pending_credit = $6, cached_pending_debit = $7, \
                 cached_status = $8, cached_checksum = $9 WHERE id = $1"
            ))
            .bind(account_id)
            .bind(version)
            .bind(snapshot.balance)
            .bind(snapshot.credit_balance)
            .bind(snapshot.debit_balance)
            .bind(snapshot.pending_credit)
            .bind(snapshot.pending_debit)
            .bind(status.as_str())
            .bind(&checksum)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    /// Append a version row whose balance numbers changed but whose status
    /// did not. Used by the transaction pipeline for every leg.
    pub(crate) async fn append_balance_version(
        &self,
        tx: &mut PgTx<'_>,
        account: &Account,
        snapshot: &BalanceSnapshot,
        change_type: ChangeType,
    ) -> Result<i64> {
        let status = account.status()?;
        let new_version = account.version + 1;
        self.insert_version(
            tx,
            account.id,
            new_version,
            snapshot,
            status,
            change_type,
            &LifecycleStamp::default(),
        )
        .await?;
        Ok(new_version)
    }

    /// Apply one movement to a locked account: computes the new balances,
    /// writes the entry row and the version row, and returns the new
    /// version plus the balance transition for the entry.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn apply_leg(
        &self,
        tx: &mut PgTx<'_>,
        account: &Account,
        direction: Direction,
        amount: i64,
        change_type: ChangeType,
        transaction_id: Uuid,
        exchange: Option<&records::ExchangeDetail>,
    ) -> Result<i64> {
        let mut snapshot = BalanceSnapshot::of(account);
        let balance_before = snapshot.balance;
        match direction {
            Direction::Credit => {
                snapshot.balance += amount;
                snapshot.credit_balance += amount;
            }
            Direction::Debit => {
                snapshot.balance -= amount;
                snapshot.debit_balance += amount;
            }
        }
        let new_version = self
            .append_balance_version(tx, account, &snapshot, change_type)
            .await?;
        records::insert_entry(
            &self.store,
            tx,
            &records::NewEntry {
                transaction_id,
                account_id: account.id,
                entry_type: direction.as_str(),
                amount,
                currency: account.currency.clone(),
                balance_before,
                balance_after: snapshot.balance,
                account_version: new_version,
                is_hot: false,
                exchange: exchange.cloned(),
            },
        )
        .await?;
        Ok(new_version)
    }

    /// The overdraft gate for debits and holds. System accounts are exempt:
    /// they absorb the counter-leg of user movements and may run negative.
    pub(crate) fn check_funds(
        &self,
        account: &Account,
        amount: i64,
        allow_overdraft_call: bool,
    ) -> Result<()> {
        if account.is_system() {
            return Ok(());
        }
        let floor = if account.allow_overdraft || allow_overdraft_call {
            -account.overdraft_limit
        } else {
            0
        };
        if account.available() - amount < floor {
            return Err(LedgerError::InsufficientBalance {
                available: account.available(),
                requested: amount,
            });
        }
        Ok(())
    }

    pub(crate) fn require_active(&self, account: &Account) -> Result<()> {
        match account.status()? {
            AccountStatus::Active => Ok(()),
            AccountStatus::Frozen => Err(LedgerError::AccountFrozen(account.holder_id.clone())),
            AccountStatus::Closed => Err(LedgerError::AccountClosed(account.holder_id.clone())),
        }
    }

    pub async fn freeze(
        &self,
        ledger_id: Uuid,
        holder_id: &str,
        reason: &str,
        frozen_by: &str,
    ) -> Result<Account> {
        let mut tx = self.store.begin().await?;
        let account = self
            .resolve_for_update(&mut tx, ledger_id, holder_id, LockMode::Wait)
            .await?;
        match account.status()? {
            // Re-freezing is a harmless no-op returning the current state.
            AccountStatus::Frozen => {
                tx.rollback().await?;
                return Ok(account);
            }
            AccountStatus::Closed => {
                tx.rollback().await?;
                return Err(LedgerError::AccountClosed(holder_id.to_string()));
            }
            AccountStatus::Active => {}
        }

        self.insert_version(
            &mut tx,
            account.id,
            account.version + 1,
            &BalanceSnapshot::of(&account),
            AccountStatus::Frozen,
            ChangeType::Freeze,
            &LifecycleStamp {
                freeze_reason: Some(reason.to_string()),
                frozen_by: Some(frozen_by.to_string()),
                ..Default::default()
            },
        )
        .await?;
        self.emit_lifecycle(&mut tx, &account, "account.frozen", json!({"reason": reason}))
            .await?;

        let updated = self
            .load_by_id_in_tx(&mut tx, account.id)
            .await?
            .ok_or_else(|| LedgerError::Internal("account vanished".to_string()))?;
        tx.commit().await?;
        Ok(updated)
    }

    pub async fn unfreeze(
        &self,
        ledger_id: Uuid,
        holder_id: &str,
        unfrozen_by: &str,
        reason: Option<&str>,
    ) -> Result<Account> {
        let mut tx = self.store.begin().await?;
        let account = self
            .resolve_for_update(&mut tx, ledger_id, holder_id, LockMode::Wait)
            .await?;
        match account.status()? {
            AccountStatus::Active => {
                tx.rollback().await?;
                return Ok(account);
            }
            AccountStatus::Closed => {
                tx.rollback().await?;
                return Err(LedgerError::AccountClosed(holder_id.to_string()));
            }
            AccountStatus::Frozen => {}
        }

        self.insert_version(
            &mut tx,
            account.id,
            account.version + 1,
            &BalanceSnapshot::of(&account),
            AccountStatus::Active,
            ChangeType::Unfreeze,
            &LifecycleStamp::default(),
        )
        .await?;
        self.emit_lifecycle(
            &mut tx,
            &account,
            "account.unfrozen",
            json!({"unfrozen_by": unfrozen_by, "reason": reason}),
        )
        .await?;

        let updated = self
            .load_by_id_in_tx(&mut tx, account.id)
            .await?
            .ok_or_else(|| LedgerError::Internal("account vanished".to_string()))?;
        tx.commit().await?;
        Ok(updated)
    }

    /// Close an account. A non-zero balance must be swept to another
    /// account of the same currency in the same transaction.
    pub async fn close(
        &self,
        ledger_id: Uuid,
        holder_id: &str,
        closed_by: &str,
        reason: Option<&str>,
        transfer_to_holder_id: Option<&str>,
    ) -> Result<Account> {
        let mut tx = self.store.begin().await?;
        let account = self
            .resolve_for_update(&mut tx, ledger_id, holder_id, LockMode::Wait)
            .await?;
        if account.status()? == AccountStatus::Closed {
            tx.rollback().await?;
            return Ok(account);
        }
        if account.pending_debit != 0 || account.pending_credit != 0 {
            tx.rollback().await?;
            return Err(LedgerError::Conflict(
                "account has open holds; resolve them before closing".to_string(),
            ));
        }

        if account.balance < 0 {
            tx.rollback().await?;
            return Err(LedgerError::Conflict(
                "account is overdrawn; settle the balance before closing".to_string(),
            ));
        }

        let mut snapshot = BalanceSnapshot::of(&account);
        if account.balance != 0 {
            let Some(destination_holder) = transfer_to_holder_id else {
                tx.rollback().await?;
                return Err(LedgerError::InvalidArgument(
                    "balance is non-zero; transfer_to_holder_id is required".to_string(),
                ));
            };
            let destination = self
                .resolve_for_update(&mut tx, ledger_id, destination_holder, LockMode::Wait)
                .await?;
            self.require_active(&destination)?;
            if destination.currency != account.currency {
                tx.rollback().await?;
                return Err(LedgerError::CurrencyMismatch {
                    expected: account.currency.clone(),
                    actual: destination.currency.clone(),
                });
            }

            let amount = account.balance;
            let correlation_id = Uuid::new_v4();
            let sweep = records::insert_transaction(
                &self.store,
                &mut tx,
                &records::NewTransaction {
                    ledger_id,
                    transaction_type: "transfer",
                    reference: format!("close-sweep-{}", account.id),
                    amount,
                    currency: account.currency.clone(),
                    description: Some(format!("sweep on close of {holder_id}")),
                    correlation_id,
                    source_account_id: Some(account.id),
                    destination_account_id: Some(destination.id),
                    is_hold: false,
                    is_reversal: false,
                    hold_expires_at: None,
                    parent_id: None,
                    metadata: None,
                },
            )
            .await?;
            records::insert_status(&self.store, &mut tx, sweep, "posted", None).await?;

            self.apply_leg(
                &mut tx,
                &account,
                Direction::Debit,
                amount,
                ChangeType::Debit,
                sweep,
                None,
            )
            .await?;
            self.apply_leg(
                &mut tx,
                &destination,
                Direction::Credit,
                amount,
                ChangeType::Credit,
                sweep,
                None,
            )
            .await?;
            snapshot.balance = 0;
            snapshot.debit_balance += amount;
        }

        // The close row sits on top of whatever the sweep produced.
        let closing_version = if account.balance != 0 {
            account.version + 2
        } else {
            account.version + 1
        };
        self.insert_version(
            &mut tx,
            account.id,
            closing_version,
            &snapshot,
            AccountStatus::Closed,
            ChangeType::Close,
            &LifecycleStamp {
                closed_reason: reason.map(|r| r.to_string()),
                closed_by: Some(closed_by.to_string()),
                ..Default::default()
            },
        )
        .await?;
        self.emit_lifecycle(
            &mut tx,
            &account,
            "account.closed",
            json!({"closed_by": closed_by, "reason": reason, "swept_to": transfer_to_holder_id}),
        )
        .await?;

        let updated = self
            .load_by_id_in_tx(&mut tx, account.id)
            .await?
            .ok_or_else(|| LedgerError::Internal("account vanished".to_string()))?;
        tx.commit().await?;
        Ok(updated)
    }

    async fn emit_lifecycle(
        &self,
        tx: &mut PgTx<'_>,
        account: &Account,
        event_type: &str,
        detail: Value,
    ) -> Result<()> {
        let payload = event_payload(&json!({
            "account_id": account.id,
            "holder_id": account.holder_id,
            "detail": detail,
        }))?;
        let appended = self
            .events
            .append_event(
                tx,
                AppendEvent {
                    aggregate_type: "account",
                    aggregate_id: &account.id.to_string(),
                    event_type,
                    event_data: payload.clone(),
                    correlation_id: None,
                },
            )
            .await?;
        let topic = format!("ledger-{}", event_type.replace('.', "-"));
        outbox::enqueue(&self.store, tx, appended.id, &topic, &payload).await
    }

    /// Current balance, or the balance as of a past instant re-aggregated
    /// from the entry log.
    pub async fn get_balance(
        &self,
        ledger_id: Uuid,
        holder_id: &str,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<BalanceView> {
        let account = self.get_account(ledger_id, holder_id).await?;
        match as_of {
            None => Ok(BalanceView {
                account_id: account.id,
                currency: account.currency.clone(),
                balance: account.balance,
                credit_balance: account.credit_balance,
                debit_balance: account.debit_balance,
                pending_credit: account.pending_credit,
                pending_debit: account.pending_debit,
                version: account.version,
                as_of: None,
            }),
            Some(at) => {
                let entries = self.store.table("entry_record");
                let (credit, debit): (Option<i64>, Option<i64>) = sqlx::query_as(&format!(
                    "SELECT SUM(CASE WHEN entry_type = 'CREDIT' THEN amount END)::BIGINT, \
                            SUM(CASE WHEN entry_type = 'DEBIT' THEN amount END)::BIGINT \
                     FROM {entries} WHERE account_id = $1 AND created_at <= $2"
                ))
                .bind(account.id)
                .bind(at)
                .fetch_one(self.store.pool())
                .await?;
                let credit = credit.unwrap_or(0);
                let debit = debit.unwrap_or(0);
                Ok(BalanceView {
                    account_id: account.id,
                    currency: account.currency.clone(),
                    balance: credit - debit,
                    credit_balance: credit,
                    debit_balance: debit,
                    pending_credit: 0,
                    pending_debit: 0,
                    version: account.version,
                    as_of: Some(at),
                })
            }
        }
    }

    pub async fn list(&self, req: ListAccounts) -> Result<AccountPage> {
        let accounts = self.store.table("account_balance");
        let versions = self.store.table("account_balance_version");

        let mut filters = vec!["ab.ledger_id = $1".to_string()];
        let mut bind_idx = 1;
        if req.holder_type.is_some() {
            bind_idx += 1;
            filters.push(format!("ab.holder_type = ${bind_idx}"));
        }
        if req.search.is_some() {
            bind_idx += 1;
            filters.push(format!("ab.holder_id ILIKE ${bind_idx}"));
        }
        if req.status.is_some() {
            bind_idx += 1;
            filters.push(format!("lv.status = ${bind_idx}"));
        }
        let where_clause = filters.join(" AND ");

        let base = format!(
            "FROM {accounts} ab \
             JOIN LATERAL (SELECT * FROM {versions} v WHERE v.account_id = ab.id \
                           ORDER BY v.version DESC LIMIT 1) lv ON TRUE \
             WHERE {where_clause}"
        );

        if let Some(encoded) = &req.cursor {
            // Cursor mode: keyset pagination, no COUNT.
            let cursor = Cursor::decode(encoded)?;
            let limit = req.limit.unwrap_or(50).clamp(1, 200);
            let sql = format!(
                "SELECT {ACCOUNT_COLUMNS} {base} \
                 AND (ab.created_at, ab.id) > (${}, ${}) \
                 ORDER BY ab.created_at ASC, ab.id ASC LIMIT {}",
                bind_idx + 1,
                bind_idx + 2,
                limit + 1
            );
            let mut rows: Vec<Account> = bind_list_filters(sqlx::query_as(&sql), &req)
                .bind(cursor.created_at)
                .bind(cursor.id)
                .fetch_all(self.store.pool())
                .await?;
            let has_more = rows.len() as i64 > limit;
            rows.truncate(limit as usize);
            let next_cursor = if has_more {
                rows.last().map(|a| {
                    Cursor {
                        created_at: a.created_at,
                        id: a.id,
                    }
                    .encode()
                })
            } else {
                None
            };
            Ok(AccountPage {
                accounts: rows,
                has_more,
                total: None,
                next_cursor,
            })
        } else if req.limit.is_some() && req.page.is_none() {
            // First page of cursor mode.
            let limit = req.limit.unwrap_or(50).clamp(1, 200);
            let sql = format!(
                "SELECT {ACCOUNT_COLUMNS} {base} ORDER BY ab.created_at ASC, ab.id ASC LIMIT {}",
                limit + 1
            );
            let mut rows: Vec<Account> = bind_list_filters(sqlx::query_as(&sql), &req)
                .fetch_all(self.store.pool())
                .await?;
            let has_more = rows.len() as i64 > limit;
            rows.truncate(limit as usize);
            let next_cursor = if has_more {
                rows.last().map(|a| {
                    Cursor {
                        created_at: a.created_at,
                        id: a.id,
                    }
                    .encode()
                })
            } else {
                None
            };
            Ok(AccountPage {
                accounts: rows,
                has_more,
                total: None,
                next_cursor,
            })
        } else {
            // Offset mode with a total count.
            let page = req.page.unwrap_or(1).max(1);
            let per_page = req.per_page.unwrap_or(25).clamp(1, 200);
            let offset = (page - 1) * per_page;
            let sql = format!(
                "SELECT {ACCOUNT_COLUMNS} {base} \
                 ORDER BY ab.created_at ASC, ab.id ASC LIMIT {per_page} OFFSET {offset}"
            );
            let rows: Vec<Account> = bind_list_filters(sqlx::query_as(&sql), &req)
                .fetch_all(self.store.pool())
                .await?;

            let count_sql = format!("SELECT {} {base}", dialect::count_as_int("*"));
            let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql).bind(req.ledger_id);
            if let Some(ht) = req.holder_type {
                count_query = count_query.bind(ht.as_str().to_string());
            }
            if let Some(search) = &req.search {
                count_query = count_query.bind(format!("%{search}%"));
            }
            if let Some(status) = req.status {
                count_query = count_query.bind(status.as_str().to_string());
            }
            let total: i64 = count_query.fetch_one(self.store.pool()).await?;

            Ok(AccountPage {
                has_more: offset + (rows.len() as i64) < total,
                accounts: rows,
                total: Some(total),
                next_cursor: None,
            })
        }
    }
}

/// Bind the shared list filters in the same order the WHERE clause
/// enumerates its placeholders.
fn bind_list_filters<'q>(
    query: sqlx::query::QueryAs<'q, sqlx::Postgres, Account, sqlx::postgres::PgArguments>,
    req: &ListAccounts,
) -> sqlx::query::QueryAs<'q, sqlx::Postgres, Account, sqlx::postgres::PgArguments> {
    let mut query = query.bind(req.ledger_id);
    if let Some(holder_type) = req.holder_type {
        query = query.bind(holder_type.as_str().to_string());
    }
    if let Some(search) = &req.search {
        query = query.bind(format!("%{search}%"));
    }
    if let Some(status) = req.status {
        query = query.bind(status.as_str().to_string());
    }
    query
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account_with(balance: i64, pending_debit: i64, allow_overdraft: bool, limit: i64) -> Account {
        Account {
            id: Uuid::new_v4(),
            ledger_id: Uuid::new_v4(),
            holder_id: "H1".to_string(),
            holder_type: "individual".to_string(),
            currency: "USD".to_string(),
            allow_overdraft,
            overdraft_limit: limit,
            metadata: None,
            created_at: Utc::now(),
            version: 1,
            balance,
            credit_balance: balance,
            debit_balance: 0,
            pending_credit: 0,
            pending_debit,
            status: "active".to_string(),
            checksum: None,
        }
    }

    fn manager_for_tests() -> AccountManager {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgresql://localhost/summa_test")
            .expect("lazy pool");
        let store = Store::from_pool(pool, "summa");
        let config = Arc::new(LedgerConfig::new("postgresql://localhost/summa_test"));
        AccountManager::new(store.clone(), EventStore::new(store), config)
    }

    #[tokio::test]
    async fn overdraft_gate_blocks_past_zero_without_permission() {
        let mgr = manager_for_tests();
        let account = account_with(5000, 0, false, 0);
        let err = mgr.check_funds(&account, 10000, false).unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance { .. }));
        mgr.check_funds(&account, 5000, false).unwrap();
    }

    #[tokio::test]
    async fn overdraft_limit_extends_the_floor() {
        let mgr = manager_for_tests();
        let account = account_with(5000, 0, true, 2000);
        mgr.check_funds(&account, 7000, false).unwrap();
        let err = mgr.check_funds(&account, 7001, false).unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance { .. }));
    }

    #[tokio::test]
    async fn per_call_overdraft_flag_uses_the_account_limit() {
        let mgr = manager_for_tests();
        let account = account_with(1000, 0, false, 500);
        assert!(mgr.check_funds(&account, 1200, false).is_err());
        mgr.check_funds(&account, 1200, true).unwrap();
    }

    #[tokio::test]
    async fn pending_debits_reduce_available_funds() {
        let mgr = manager_for_tests();
        let account = account_with(10000, 4000, false, 0);
        mgr.check_funds(&account, 6000, false).unwrap();
        assert!(mgr.check_funds(&account, 6001, false).is_err());
    }

    #[tokio::test]
    async fn system_accounts_bypass_the_gate() {
        let mgr = manager_for_tests();
        let mut account = account_with(0, 0, false, 0);
        account.holder_type = "system".to_string();
        mgr.check_funds(&account, 1_000_000, false).unwrap();
    }

    #[tokio::test]
    async fn frozen_and_closed_accounts_are_rejected() {
        let mgr = manager_for_tests();
        let mut account = account_with(100, 0, false, 0);
        mgr.require_active(&account).unwrap();
        account.status = "frozen".to_string();
        assert!(matches!(
            mgr.require_active(&account).unwrap_err(),
            LedgerError::AccountFrozen(_)
        ));
        account.status = "closed".to_string();
        assert!(matches!(
            mgr.require_active(&account).unwrap_err(),
            LedgerError::AccountClosed(_)
        ));
    }

    #[test]
    fn direction_inverse_swaps_sides() {
        assert_eq!(Direction::Credit.inverse(), Direction::Debit);
        assert_eq!(Direction::Debit.inverse(), Direction::Credit);
        assert_eq!(Direction::Credit.as_str(), "CREDIT");
    }
}
