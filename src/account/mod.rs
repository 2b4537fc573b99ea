//! Accounts: an immutable parent row plus an append-only stream of
//! versioned balance snapshots, each protected by an HMAC checksum.

pub mod manager;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::{LedgerError, Result};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HolderType {
    Individual,
    Organization,
    System,
}

impl HolderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HolderType::Individual => "individual",
            HolderType::Organization => "organization",
            HolderType::System => "system",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "individual" => Ok(HolderType::Individual),
            "organization" => Ok(HolderType::Organization),
            "system" => Ok(HolderType::System),
            other => Err(LedgerError::InvalidArgument(format!(
                "unknown holder type: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Frozen,
    Closed,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Frozen => "frozen",
            AccountStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(AccountStatus::Active),
            "frozen" => Ok(AccountStatus::Frozen),
            "closed" => Ok(AccountStatus::Closed),
            other => Err(LedgerError::Internal(format!(
                "unknown account status in storage: {other}"
            ))),
        }
    }
}

/// What produced a version row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Create,
    Credit,
    Debit,
    Hold,
    Commit,
    Void,
    Freeze,
    Unfreeze,
    Close,
    Refund,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Create => "create",
            ChangeType::Credit => "credit",
            ChangeType::Debit => "debit",
            ChangeType::Hold => "hold",
            ChangeType::Commit => "commit",
            ChangeType::Void => "void",
            ChangeType::Freeze => "freeze",
            ChangeType::Unfreeze => "unfreeze",
            ChangeType::Close => "close",
            ChangeType::Refund => "refund",
        }
    }
}

/// The joined view of an account: immutable parent columns plus the fields
/// of its latest version row. This is what managers operate on and what the
/// HTTP surface returns.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Account {
    pub id: Uuid,
    pub ledger_id: Uuid,
    pub holder_id: String,
    pub holder_type: String,
    pub currency: String,
    pub allow_overdraft: bool,
    pub overdraft_limit: i64,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub version: i64,
    pub balance: i64,
    pub credit_balance: i64,
    pub debit_balance: i64,
    pub pending_credit: i64,
    pub pending_debit: i64,
    pub status: String,
    pub checksum: Option<String>,
}

impl Account {
    pub fn status(&self) -> Result<AccountStatus> {
        AccountStatus::parse(&self.status)
    }

    pub fn is_system(&self) -> bool {
        self.holder_type == "system"
    }

    /// Funds a debit or hold may draw on: settled balance minus funds
    /// already reserved by open holds.
    pub fn available(&self) -> i64 {
        self.balance - self.pending_debit
    }
}

/// The balance numbers a version row snapshots; checksummed as a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BalanceSnapshot {
    pub balance: i64,
    pub credit_balance: i64,
    pub debit_balance: i64,
    pub pending_credit: i64,
    pub pending_debit: i64,
}

impl BalanceSnapshot {
    pub fn of(account: &Account) -> Self {
        Self {
            balance: account.balance,
            credit_balance: account.credit_balance,
            debit_balance: account.debit_balance,
            pending_credit: account.pending_credit,
            pending_debit: account.pending_debit,
        }
    }
}

/// checksum = HMAC-SHA256(secret, balance|credit|debit|pending_debit|pending_credit|version)
pub fn compute_checksum(secret: &str, snapshot: &BalanceSnapshot, version: i64) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    let material = format!(
        "{}|{}|{}|{}|{}|{}",
        snapshot.balance,
        snapshot.credit_balance,
        snapshot.debit_balance,
        snapshot.pending_debit,
        snapshot.pending_credit,
        version
    );
    mac.update(material.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a read account against its stored checksum. A missing checksum is
/// tolerated (pre-checksum rows); a mismatch is fatal to the request.
pub fn verify_checksum(secret: &str, account: &Account) -> Result<()> {
    let Some(stored) = &account.checksum else {
        return Ok(());
    };
    let expected = compute_checksum(secret, &BalanceSnapshot::of(account), account.version);
    if *stored != expected {
        tracing::error!(
            account_id = %account.id,
            version = account.version,
            "balance checksum mismatch"
        );
        return Err(LedgerError::ChainIntegrity(format!(
            "checksum mismatch on account {} version {}",
            account.id, account.version
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_account() -> Account {
        Account {
            id: Uuid::new_v4(),
            ledger_id: Uuid::new_v4(),
            holder_id: "H1".to_string(),
            holder_type: "individual".to_string(),
            currency: "USD".to_string(),
            allow_overdraft: false,
            overdraft_limit: 0,
            metadata: None,
            created_at: Utc::now(),
            version: 3,
            balance: 7000,
            credit_balance: 10000,
            debit_balance: 3000,
            pending_credit: 0,
            pending_debit: 0,
            status: "active".to_string(),
            checksum: None,
        }
    }

    #[test]
    fn checksum_covers_every_balance_field_and_the_version() {
        let secret = "secret";
        let base = BalanceSnapshot {
            balance: 7000,
            credit_balance: 10000,
            debit_balance: 3000,
            pending_credit: 0,
            pending_debit: 0,
        };
        let checksum = compute_checksum(secret, &base, 3);
        assert_ne!(checksum, compute_checksum(secret, &base, 4));
        let mut shifted = base;
        shifted.pending_debit = 1;
        assert_ne!(checksum, compute_checksum(secret, &shifted, 3));
        assert_ne!(checksum, compute_checksum("other", &base, 3));
        // Stable for equal inputs.
        assert_eq!(checksum, compute_checksum(secret, &base, 3));
    }

    #[test]
    fn verify_checksum_flags_tampered_balances() {
        let secret = "secret";
        let mut account = sample_account();
        account.checksum = Some(compute_checksum(
            secret,
            &BalanceSnapshot::of(&account),
            account.version,
        ));
        verify_checksum(secret, &account).unwrap();

        account.balance += 1;
        let err = verify_checksum(secret, &account).unwrap_err();
        assert!(matches!(err, LedgerError::ChainIntegrity(_)));
    }

    #[test]
    fn missing_checksum_is_tolerated() {
        let account = sample_account();
        verify_checksum("secret", &account).unwrap();
    }

    #[test]
    fn available_subtracts_pending_debits() {
        let mut account = sample_account();
        account.pending_debit = 4000;
        assert_eq!(account.available(), 3000);
    }
}
