//! The transaction pipeline: headers, status transitions, double-entry
//! legs, idempotency, holds.

pub mod holds;
pub mod idempotency;
pub mod manager;
pub mod records;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::{LedgerError, Result};

/// Transaction lifecycle states, recorded as append-only status rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Pending,
    Inflight,
    Posted,
    Voided,
    Expired,
    Reversed,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Pending => "pending",
            TxStatus::Inflight => "inflight",
            TxStatus::Posted => "posted",
            TxStatus::Voided => "voided",
            TxStatus::Expired => "expired",
            TxStatus::Reversed => "reversed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TxStatus::Pending),
            "inflight" => Ok(TxStatus::Inflight),
            "posted" => Ok(TxStatus::Posted),
            "voided" => Ok(TxStatus::Voided),
            "expired" => Ok(TxStatus::Expired),
            "reversed" => Ok(TxStatus::Reversed),
            other => Err(LedgerError::Internal(format!(
                "unknown transaction status in storage: {other}"
            ))),
        }
    }

    /// Legal transitions of the status machine.
    pub fn can_transition_to(&self, next: TxStatus) -> bool {
        matches!(
            (self, next),
            (TxStatus::Pending, TxStatus::Inflight)
                | (TxStatus::Pending, TxStatus::Posted)
                | (TxStatus::Inflight, TxStatus::Posted)
                | (TxStatus::Inflight, TxStatus::Voided)
                | (TxStatus::Inflight, TxStatus::Expired)
                | (TxStatus::Posted, TxStatus::Reversed)
        )
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct TransactionRecord {
    pub id: Uuid,
    pub ledger_id: Uuid,
    pub transaction_type: String,
    pub reference: String,
    pub amount: i64,
    pub currency: String,
    pub description: Option<String>,
    pub correlation_id: Uuid,
    pub source_account_id: Option<Uuid>,
    pub destination_account_id: Option<Uuid>,
    pub is_hold: bool,
    pub is_reversal: bool,
    pub hold_expires_at: Option<DateTime<Utc>>,
    pub parent_id: Option<Uuid>,
    pub refunded_amount: i64,
    pub committed_amount: i64,
    pub effective_date: DateTime<Utc>,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct EntryRecord {
    pub id: Uuid,
    pub transaction_id: Uuid,
    pub account_id: Uuid,
    pub entry_type: String,
    pub amount: i64,
    pub currency: String,
    pub balance_before: i64,
    pub balance_after: i64,
    pub account_version: i64,
    pub sequence_number: i64,
    pub original_amount: Option<i64>,
    pub original_currency: Option<String>,
    pub exchange_rate: Option<String>,
    pub is_hot: bool,
    pub created_at: DateTime<Utc>,
}

/// What every mutating operation returns (and what idempotency replays).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionDto {
    pub id: Uuid,
    pub transaction_type: String,
    pub reference: String,
    pub amount: i64,
    pub currency: String,
    pub status: TxStatus,
    pub correlation_id: Uuid,
    pub source_account_id: Option<Uuid>,
    pub destination_account_id: Option<Uuid>,
    pub is_hold: bool,
    pub is_reversal: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hold_expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl TransactionDto {
    pub fn from_record(record: &TransactionRecord, status: TxStatus) -> Self {
        Self {
            id: record.id,
            transaction_type: record.transaction_type.clone(),
            reference: record.reference.clone(),
            amount: record.amount,
            currency: record.currency.clone(),
            status,
            correlation_id: record.correlation_id,
            source_account_id: record.source_account_id,
            destination_account_id: record.destination_account_id,
            is_hold: record.is_hold,
            is_reversal: record.is_reversal,
            hold_expires_at: record.hold_expires_at,
            parent_id: record.parent_id,
            created_at: record.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_machine_permits_only_documented_transitions() {
        use TxStatus::*;
        assert!(Pending.can_transition_to(Inflight));
        assert!(Pending.can_transition_to(Posted));
        assert!(Inflight.can_transition_to(Posted));
        assert!(Inflight.can_transition_to(Voided));
        assert!(Inflight.can_transition_to(Expired));
        assert!(Posted.can_transition_to(Reversed));

        assert!(!Posted.can_transition_to(Voided));
        assert!(!Voided.can_transition_to(Posted));
        assert!(!Expired.can_transition_to(Posted));
        assert!(!Reversed.can_transition_to(Posted));
        assert!(!Posted.can_transition_to(Inflight));
    }

    #[test]
    fn status_round_trips_through_storage_form() {
        for status in [
            TxStatus::Pending,
            TxStatus::Inflight,
            TxStatus::Posted,
            TxStatus::Voided,
            TxStatus::Expired,
            TxStatus::Reversed,
        ] {
            assert_eq!(TxStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(TxStatus::parse("settled").is_err());
    }
}
