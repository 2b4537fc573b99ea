//! Declarative schema dictionary.
//!
//! Every table the ledger persists is described here; the migrator derives
//! an additive plan (create table / add column / add index) by diffing this
//! dictionary against the live database. Plugins contribute tables, or with
//! `extend` additional columns and indexes on existing tables.

pub mod migrator;
pub mod triggers;

use crate::error::{LedgerError, Result};
use crate::store::dialect;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Uuid,
    Text,
    BigInt,
    Integer,
    Boolean,
    Timestamp,
    Jsonb,
    Serial,
    BigSerial,
    TsVector,
}

impl ColumnType {
    pub fn sql(&self) -> &'static str {
        match self {
            ColumnType::Uuid => "UUID",
            ColumnType::Text => "TEXT",
            ColumnType::BigInt => "BIGINT",
            ColumnType::Integer => "INTEGER",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Timestamp => "TIMESTAMPTZ",
            ColumnType::Jsonb => "JSONB",
            ColumnType::Serial => "SERIAL",
            ColumnType::BigSerial => "BIGSERIAL",
            ColumnType::TsVector => "TSVECTOR",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ColumnDef {
    pub name: &'static str,
    pub ty: ColumnType,
    pub not_null: bool,
    pub default: Option<&'static str>,
    pub primary_key: bool,
    pub references: Option<&'static str>,
}

impl ColumnDef {
    pub fn new(name: &'static str, ty: ColumnType) -> Self {
        Self {
            name,
            ty,
            not_null: false,
            default: None,
            primary_key: false,
            references: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    pub fn default(mut self, expr: &'static str) -> Self {
        self.default = Some(expr);
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.not_null = true;
        self
    }

    pub fn references(mut self, target: &'static str) -> Self {
        self.references = Some(target);
        self
    }
}

#[derive(Debug, Clone)]
pub struct IndexDef {
    pub name: &'static str,
    pub columns: &'static [&'static str],
    pub unique: bool,
    pub where_clause: Option<&'static str>,
}

impl IndexDef {
    pub fn new(name: &'static str, columns: &'static [&'static str]) -> Self {
        Self {
            name,
            columns,
            unique: false,
            where_clause: None,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn filtered(mut self, clause: &'static str) -> Self {
        self.where_clause = Some(clause);
        self
    }
}

#[derive(Debug, Clone)]
pub struct TableDef {
    pub name: &'static str,
    pub columns: Vec<ColumnDef>,
    pub indexes: Vec<IndexDef>,
}

use ColumnType::*;

fn uuid_pk() -> ColumnDef {
    ColumnDef::new("id", Uuid)
        .primary_key()
        .default(dialect::generate_uuid())
}

fn created_at() -> ColumnDef {
    ColumnDef::new("created_at", Timestamp).not_null().default(dialect::now())
}

/// The full v1 table set.
pub fn dictionary() -> Vec<TableDef> {
    vec![
        TableDef {
            name: "ledger",
            columns: vec![
                uuid_pk(),
                ColumnDef::new("name", Text).not_null(),
                ColumnDef::new("metadata", Jsonb).default("'{}'::jsonb"),
                created_at(),
            ],
            indexes: vec![],
        },
        TableDef {
            name: "account_balance",
            columns: vec![
                uuid_pk(),
                ColumnDef::new("ledger_id", Uuid).not_null().references("ledger"),
                ColumnDef::new("holder_id", Text).not_null(),
                ColumnDef::new("holder_type", Text).not_null(),
                ColumnDef::new("currency", Text).not_null(),
                ColumnDef::new("allow_overdraft", Boolean).not_null().default("FALSE"),
                ColumnDef::new("overdraft_limit", BigInt).not_null().default("0"),
                ColumnDef::new("account_type", Text),
                ColumnDef::new("account_code", Text),
                ColumnDef::new("parent_account_id", Uuid),
                ColumnDef::new("normal_balance", Text),
                ColumnDef::new("indicator", Text),
                ColumnDef::new("metadata", Jsonb).default("'{}'::jsonb"),
                created_at(),
                // Denormalized mirror of the latest version row; the only
                // columns the immutability trigger lets change.
                ColumnDef::new("cached_version", BigInt),
                ColumnDef::new("cached_balance", BigInt),
                ColumnDef::new("cached_credit_balance", BigInt),
                ColumnDef::new("cached_debit_balance", BigInt),
                ColumnDef::new("cached_pending_credit", BigInt),
                ColumnDef::new("cached_pending_debit", BigInt),
                ColumnDef::new("cached_status", Text),
                ColumnDef::new("cached_checksum", Text),
            ],
            indexes: vec![
                IndexDef::new(
                    "idx_account_balance_ledger_holder_currency",
                    &["ledger_id", "holder_id", "currency"],
                )
                .unique(),
                IndexDef::new("idx_account_balance_holder", &["ledger_id", "holder_id"]),
            ],
        },
        TableDef {
            name: "account_balance_version",
            columns: vec![
                uuid_pk(),
                ColumnDef::new("account_id", Uuid).not_null().references("account_balance"),
                ColumnDef::new("version", BigInt).not_null(),
                ColumnDef::new("balance", BigInt).not_null(),
                ColumnDef::new("credit_balance", BigInt).not_null().default("0"),
                ColumnDef::new("debit_balance", BigInt).not_null().default("0"),
                ColumnDef::new("pending_credit", BigInt).not_null().default("0"),
                ColumnDef::new("pending_debit", BigInt).not_null().default("0"),
                ColumnDef::new("status", Text).not_null().default("'active'"),
                ColumnDef::new("checksum", Text),
                ColumnDef::new("change_type", Text).not_null(),
                ColumnDef::new("freeze_reason", Text),
                ColumnDef::new("frozen_by", Text),
                ColumnDef::new("frozen_at", Timestamp),
                ColumnDef::new("closed_reason", Text),
                ColumnDef::new("closed_by", Text),
                ColumnDef::new("closed_at", Timestamp),
                created_at(),
            ],
            indexes: vec![
                IndexDef::new(
                    "idx_account_balance_version_account_version",
                    &["account_id", "version"],
                )
                .unique(),
            ],
        },
        TableDef {
            name: "transaction_record",
            columns: vec![
                uuid_pk(),
                ColumnDef::new("ledger_id", Uuid).not_null().references("ledger"),
                ColumnDef::new("transaction_type", Text).not_null(),
                ColumnDef::new("reference", Text).not_null(),
                ColumnDef::new("amount", BigInt).not_null(),
                ColumnDef::new("currency", Text).not_null(),
                ColumnDef::new("description", Text),
                ColumnDef::new("correlation_id", Uuid).not_null(),
                ColumnDef::new("source_account_id", Uuid),
                ColumnDef::new("destination_account_id", Uuid),
                ColumnDef::new("is_hold", Boolean).not_null().default("FALSE"),
                ColumnDef::new("is_reversal", Boolean).not_null().default("FALSE"),
                ColumnDef::new("hold_expires_at", Timestamp),
                ColumnDef::new("parent_id", Uuid),
                ColumnDef::new("refunded_amount", BigInt).not_null().default("0"),
                ColumnDef::new("committed_amount", BigInt).not_null().default("0"),
                ColumnDef::new("effective_date", Timestamp).not_null().default(dialect::now()),
                ColumnDef::new("metadata", Jsonb).default("'{}'::jsonb"),
                created_at(),
            ],
            indexes: vec![
                IndexDef::new("idx_transaction_record_reference", &["ledger_id", "reference"]).unique(),
                IndexDef::new("idx_transaction_record_parent", &["parent_id"]),
                IndexDef::new("idx_transaction_record_correlation", &["correlation_id"]),
                IndexDef::new(
                    "idx_transaction_record_open_holds",
                    &["hold_expires_at"],
                )
                .filtered("is_hold AND hold_expires_at IS NOT NULL"),
            ],
        },
        TableDef {
            name: "transaction_status",
            columns: vec![
                uuid_pk(),
                ColumnDef::new("transaction_id", Uuid).not_null().references("transaction_record"),
                ColumnDef::new("status", Text).not_null(),
                ColumnDef::new("reason", Text),
                // Monotonic tiebreak: status rows written in one transaction
                // share a timestamp.
                ColumnDef::new("seq", BigSerial),
                created_at(),
            ],
            indexes: vec![IndexDef::new(
                "idx_transaction_status_transaction",
                &["transaction_id", "seq"],
            )],
        },
        TableDef {
            name: "entry_record",
            columns: vec![
                uuid_pk(),
                ColumnDef::new("transaction_id", Uuid).not_null().references("transaction_record"),
                ColumnDef::new("account_id", Uuid).not_null().references("account_balance"),
                ColumnDef::new("entry_type", Text).not_null(),
                ColumnDef::new("amount", BigInt).not_null(),
                ColumnDef::new("currency", Text).not_null(),
                ColumnDef::new("balance_before", BigInt).not_null(),
                ColumnDef::new("balance_after", BigInt).not_null(),
                ColumnDef::new("account_version", BigInt).not_null(),
                ColumnDef::new("sequence_number", BigSerial),
                ColumnDef::new("original_amount", BigInt),
                ColumnDef::new("original_currency", Text),
                ColumnDef::new("exchange_rate", Text),
                ColumnDef::new("is_hot", Boolean).not_null().default("FALSE"),
                created_at(),
            ],
            indexes: vec![
                IndexDef::new("idx_entry_record_transaction", &["transaction_id"]),
                IndexDef::new("idx_entry_record_account", &["account_id", "created_at"]),
                IndexDef::new("idx_entry_record_created", &["created_at"]),
            ],
        },
        TableDef {
            name: "ledger_event",
            columns: vec![
                uuid_pk(),
                ColumnDef::new("aggregate_type", Text).not_null(),
                ColumnDef::new("aggregate_id", Text).not_null(),
                ColumnDef::new("event_type", Text).not_null(),
                ColumnDef::new("event_data", Jsonb).not_null(),
                ColumnDef::new("sequence_number", BigInt).not_null(),
                ColumnDef::new("global_sequence", BigSerial),
                ColumnDef::new("prev_hash", Text),
                ColumnDef::new("event_hash", Text).not_null(),
                ColumnDef::new("correlation_id", Uuid),
                created_at(),
            ],
            indexes: vec![
                IndexDef::new(
                    "idx_ledger_event_aggregate_seq",
                    &["aggregate_type", "aggregate_id", "sequence_number"],
                )
                .unique(),
                IndexDef::new("idx_ledger_event_global_seq", &["global_sequence"]),
            ],
        },
        TableDef {
            name: "block_checkpoint",
            columns: vec![
                uuid_pk(),
                ColumnDef::new("ledger_id", Uuid),
                ColumnDef::new("block_sequence", BigInt).not_null(),
                ColumnDef::new("from_event_sequence", BigInt).not_null(),
                ColumnDef::new("to_event_sequence", BigInt).not_null(),
                ColumnDef::new("event_count", BigInt).not_null(),
                ColumnDef::new("events_hash", Text).not_null(),
                ColumnDef::new("block_hash", Text).not_null(),
                ColumnDef::new("merkle_root", Text),
                ColumnDef::new("prev_block_id", Uuid),
                ColumnDef::new("block_at", Timestamp).not_null().default(dialect::now()),
                ColumnDef::new("sealed_at", Timestamp).not_null().default(dialect::now()),
            ],
            indexes: vec![IndexDef::new("idx_block_checkpoint_sequence", &["block_sequence"]).unique()],
        },
        TableDef {
            name: "idempotency_key",
            columns: vec![
                ColumnDef::new("ledger_id", Uuid).not_null(),
                ColumnDef::new("key", Text).not_null(),
                ColumnDef::new("response", Jsonb).not_null(),
                ColumnDef::new("status_code", Integer).not_null().default("201"),
                ColumnDef::new("expires_at", Timestamp).not_null(),
                created_at(),
            ],
            indexes: vec![
                IndexDef::new("idx_idempotency_key_pk", &["ledger_id", "key"]).unique(),
                IndexDef::new("idx_idempotency_key_expiry", &["expires_at"]),
            ],
        },
        TableDef {
            name: "outbox",
            columns: vec![
                ColumnDef::new("id", Uuid).primary_key(),
                ColumnDef::new("topic", Text).not_null(),
                ColumnDef::new("payload", Jsonb).not_null(),
                ColumnDef::new("status", Text).not_null().default("'pending'"),
                ColumnDef::new("retry_count", Integer).not_null().default("0"),
                ColumnDef::new("last_error", Text),
                ColumnDef::new("processed_at", Timestamp),
                created_at(),
            ],
            indexes: vec![IndexDef::new("idx_outbox_pending", &["created_at"])
                .filtered("processed_at IS NULL")],
        },
        TableDef {
            name: "processed_event",
            columns: vec![
                ColumnDef::new("id", Uuid).not_null(),
                ColumnDef::new("topic", Text).not_null(),
                ColumnDef::new("payload", Jsonb),
                created_at(),
            ],
            indexes: vec![
                IndexDef::new("idx_processed_event_pk", &["id", "topic"]).unique(),
                IndexDef::new("idx_processed_event_created", &["created_at"]),
            ],
        },
        TableDef {
            name: "dead_letter_queue",
            columns: vec![
                uuid_pk(),
                ColumnDef::new("outbox_id", Uuid).not_null(),
                ColumnDef::new("topic", Text).not_null(),
                ColumnDef::new("payload", Jsonb).not_null(),
                ColumnDef::new("error_message", Text),
                ColumnDef::new("retry_count", Integer).not_null(),
                created_at(),
            ],
            indexes: vec![],
        },
        TableDef {
            name: "worker_lease",
            columns: vec![
                ColumnDef::new("worker_id", Text).primary_key(),
                ColumnDef::new("lease_holder", Text).not_null(),
                ColumnDef::new("lease_until", Timestamp).not_null(),
            ],
            indexes: vec![],
        },
        TableDef {
            name: "rate_limit_log",
            columns: vec![
                uuid_pk(),
                ColumnDef::new("key", Text).not_null(),
                created_at(),
            ],
            indexes: vec![IndexDef::new("idx_rate_limit_log_key", &["key", "created_at"])],
        },
        TableDef {
            name: "reconciliation_watermark",
            columns: vec![
                ColumnDef::new("id", Integer).primary_key(),
                ColumnDef::new("watermark", Timestamp),
                ColumnDef::new("run_count", BigInt).not_null().default("0"),
                ColumnDef::new("updated_at", Timestamp).not_null().default(dialect::now()),
            ],
            indexes: vec![],
        },
        TableDef {
            name: "reconciliation_result",
            columns: vec![
                uuid_pk(),
                ColumnDef::new("run_type", Text).not_null(),
                ColumnDef::new("status", Text).not_null(),
                ColumnDef::new("total_mismatches", BigInt).not_null().default("0"),
                ColumnDef::new("diagnostics", Jsonb).not_null(),
                ColumnDef::new("started_at", Timestamp).not_null(),
                ColumnDef::new("finished_at", Timestamp).not_null().default(dialect::now()),
            ],
            indexes: vec![IndexDef::new("idx_reconciliation_result_started", &["started_at"])],
        },
        TableDef {
            name: "hot_account_entry",
            columns: vec![
                uuid_pk(),
                ColumnDef::new("account_id", Uuid).not_null().references("account_balance"),
                ColumnDef::new("transaction_id", Uuid).not_null(),
                ColumnDef::new("entry_type", Text).not_null(),
                ColumnDef::new("amount", BigInt).not_null(),
                ColumnDef::new("status", Text).not_null().default("'pending'"),
                created_at(),
            ],
            indexes: vec![IndexDef::new("idx_hot_account_entry_pending", &["account_id", "created_at"])
                .filtered("status = 'pending'")],
        },
        TableDef {
            name: "webhook_endpoint",
            columns: vec![
                uuid_pk(),
                ColumnDef::new("url", Text).not_null(),
                ColumnDef::new("secret", Text).not_null(),
                ColumnDef::new("topics", Jsonb).not_null().default("'[]'::jsonb"),
                ColumnDef::new("active", Boolean).not_null().default("TRUE"),
                created_at(),
            ],
            indexes: vec![],
        },
        TableDef {
            name: "webhook_delivery",
            columns: vec![
                uuid_pk(),
                ColumnDef::new("endpoint_id", Uuid).not_null().references("webhook_endpoint"),
                ColumnDef::new("event_id", Uuid).not_null(),
                ColumnDef::new("attempt", Integer).not_null(),
                ColumnDef::new("status", Text).not_null(),
                ColumnDef::new("response_code", Integer),
                ColumnDef::new("error_message", Text),
                ColumnDef::new("next_attempt_at", Timestamp),
                created_at(),
            ],
            indexes: vec![IndexDef::new(
                "idx_webhook_delivery_event",
                &["event_id", "endpoint_id"],
            )],
        },
        TableDef {
            name: "migration",
            columns: vec![
                ColumnDef::new("id", Serial).primary_key(),
                ColumnDef::new("name", Text).not_null(),
                ColumnDef::new("hash", Text).not_null(),
                ColumnDef::new("applied_at", Timestamp).not_null().default(dialect::now()),
            ],
            indexes: vec![IndexDef::new("idx_migration_name", &["name"]).unique()],
        },
    ]
}

/// Merge plugin-contributed tables into a base dictionary.
///
/// A plugin may add whole tables, or with `extend` add columns/indexes to an
/// existing table. Collisions on table, column, or index names fail.
pub fn merge(base: &mut Vec<TableDef>, extra: Vec<TableDef>, extend: bool) -> Result<()> {
    for table in extra {
        match base.iter_mut().find(|t| t.name == table.name) {
            None => base.push(table),
            Some(existing) if extend => {
                for col in table.columns {
                    if existing.columns.iter().any(|c| c.name == col.name) {
                        return Err(LedgerError::InvalidArgument(format!(
                            "column collision on {}.{}",
                            table.name, col.name
                        )));
                    }
                    existing.columns.push(col);
                }
                for idx in table.indexes {
                    if existing.indexes.iter().any(|i| i.name == idx.name) {
                        return Err(LedgerError::InvalidArgument(format!(
                            "index collision on {}", idx.name
                        )));
                    }
                    existing.indexes.push(idx);
                }
            }
            Some(_) => {
                return Err(LedgerError::InvalidArgument(format!(
                    "table collision on {}",
                    table.name
                )))
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dictionary_contains_the_core_tables() {
        let tables = dictionary();
        for required in [
            "ledger",
            "account_balance",
            "account_balance_version",
            "transaction_record",
            "transaction_status",
            "entry_record",
            "ledger_event",
            "block_checkpoint",
            "idempotency_key",
            "outbox",
            "processed_event",
            "dead_letter_queue",
            "worker_lease",
            "rate_limit_log",
            "reconciliation_watermark",
            "reconciliation_result",
            "migration",
        ] {
            assert!(
                tables.iter().any(|t| t.name == required),
                "missing table {required}"
            );
        }
    }

    #[test]
    fn versions_are_unique_per_account() {
        let tables = dictionary();
        let versions = tables
            .iter()
            .find(|t| t.name == "account_balance_version")
            .unwrap();
        let idx = versions
            .indexes
            .iter()
            .find(|i| i.columns == ["account_id", "version"])
            .unwrap();
        assert!(idx.unique);
    }

    #[test]
    fn merge_adds_new_tables_and_rejects_collisions() {
        let mut base = dictionary();
        let plugin = vec![TableDef {
            name: "plugin_audit",
            columns: vec![uuid_pk()],
            indexes: vec![],
        }];
        merge(&mut base, plugin, false).unwrap();
        assert!(base.iter().any(|t| t.name == "plugin_audit"));

        let clash = vec![TableDef {
            name: "outbox",
            columns: vec![],
            indexes: vec![],
        }];
        assert!(merge(&mut base, clash, false).is_err());
    }

    #[test]
    fn merge_with_extend_appends_columns_and_rejects_duplicates() {
        let mut base = dictionary();
        let extra = vec![TableDef {
            name: "account_balance",
            columns: vec![ColumnDef::new("kyc_status", ColumnType::Text)],
            indexes: vec![],
        }];
        merge(&mut base, extra, true).unwrap();
        let account = base.iter().find(|t| t.name == "account_balance").unwrap();
        assert!(account.columns.iter().any(|c| c.name == "kyc_status"));

        let dup = vec![TableDef {
            name: "account_balance",
            columns: vec![ColumnDef::new("currency", ColumnType::Text)],
            indexes: vec![],
        }];
        assert!(merge(&mut base, dup, true).is_err());
    }
}
