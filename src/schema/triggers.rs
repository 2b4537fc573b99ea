//! Immutability trigger generation.
//!
//! Append-only tables get a BEFORE UPDATE OR DELETE trigger that raises
//! unconditionally. `account_balance` is special: its identity columns are
//! frozen but the cached_* mirror columns may be rewritten in place.

/// Tables that must never see UPDATE or DELETE once a row is inserted.
/// Tables absent from the dictionary are skipped at generation time.
pub const IMMUTABLE_TABLES: &[&str] = &[
    "account_balance",
    "account_balance_version",
    "transaction_record",
    "transaction_status",
    "entry_record",
    "ledger_event",
    "block_checkpoint",
    "merkle_node",
    "entity_status_log",
    "system_account",
    "system_account_version",
];

/// Columns on transaction_record that stay frozen; the refund and hold
/// paths accumulate onto refunded_amount / committed_amount in place.
const TRANSACTION_RECORD_FROZEN: &[&str] = &[
    "id",
    "ledger_id",
    "transaction_type",
    "reference",
    "amount",
    "currency",
    "description",
    "correlation_id",
    "source_account_id",
    "destination_account_id",
    "is_hold",
    "is_reversal",
    "hold_expires_at",
    "parent_id",
    "effective_date",
    "metadata",
    "created_at",
];

/// Identity columns on account_balance that the column-aware trigger pins.
const ACCOUNT_BALANCE_FROZEN: &[&str] = &[
    "id",
    "ledger_id",
    "holder_id",
    "holder_type",
    "currency",
    "allow_overdraft",
    "overdraft_limit",
    "account_type",
    "account_code",
    "parent_account_id",
    "normal_balance",
    "indicator",
    "metadata",
    "created_at",
];

pub fn immutability_function_sql(schema: &str) -> String {
    format!(
        r#"CREATE OR REPLACE FUNCTION {schema}.forbid_mutation() RETURNS trigger AS $$
BEGIN
    RAISE EXCEPTION 'table %.% is append-only', TG_TABLE_SCHEMA, TG_TABLE_NAME;
END;
$$ LANGUAGE plpgsql;"#
    )
}

/// The column-aware guard for account_balance: UPDATE is allowed only when
/// every frozen column is unchanged; DELETE always raises.
pub fn account_balance_guard_sql(schema: &str) -> String {
    let checks = ACCOUNT_BALANCE_FROZEN
        .iter()
        .map(|col| format!("OLD.{col} IS DISTINCT FROM NEW.{col}"))
        .collect::<Vec<_>>()
        .join("\n        OR ");
    format!(
        r#"CREATE OR REPLACE FUNCTION {schema}.forbid_account_balance_mutation() RETURNS trigger AS $$
BEGIN
    IF TG_OP = 'DELETE' THEN
        RAISE EXCEPTION 'table %.% is append-only', TG_TABLE_SCHEMA, TG_TABLE_NAME;
    END IF;
    IF {checks} THEN
        RAISE EXCEPTION 'immutable columns on %.% cannot change', TG_TABLE_SCHEMA, TG_TABLE_NAME;
    END IF;
    RETURN NEW;
END;
$$ LANGUAGE plpgsql;"#
    )
}

/// Column-aware guard for transaction_record: only the refund/commit
/// counters may move.
pub fn transaction_record_guard_sql(schema: &str) -> String {
    let checks = TRANSACTION_RECORD_FROZEN
        .iter()
        .map(|col| format!("OLD.{col} IS DISTINCT FROM NEW.{col}"))
        .collect::<Vec<_>>()
        .join("\n        OR ");
    format!(
        r#"CREATE OR REPLACE FUNCTION {schema}.forbid_transaction_record_mutation() RETURNS trigger AS $$
BEGIN
    IF TG_OP = 'DELETE' THEN
        RAISE EXCEPTION 'table %.% is append-only', TG_TABLE_SCHEMA, TG_TABLE_NAME;
    END IF;
    IF {checks} THEN
        RAISE EXCEPTION 'immutable columns on %.% cannot change', TG_TABLE_SCHEMA, TG_TABLE_NAME;
    END IF;
    RETURN NEW;
END;
$$ LANGUAGE plpgsql;"#
    )
}

pub fn trigger_sql(schema: &str, table: &str) -> String {
    let function = match table {
        "account_balance" => "forbid_account_balance_mutation",
        "transaction_record" => "forbid_transaction_record_mutation",
        _ => "forbid_mutation",
    };
    format!(
        r#"DROP TRIGGER IF EXISTS trg_{table}_immutable ON {schema}.{table};
CREATE TRIGGER trg_{table}_immutable
BEFORE UPDATE OR DELETE ON {schema}.{table}
FOR EACH ROW EXECUTE FUNCTION {schema}.{function}();"#
    )
}

/// All trigger statements for the tables that exist in the dictionary.
pub fn all_trigger_sql(schema: &str, dictionary_tables: &[&str]) -> Vec<String> {
    let mut statements = vec![
        immutability_function_sql(schema),
        account_balance_guard_sql(schema),
        transaction_record_guard_sql(schema),
    ];
    for table in IMMUTABLE_TABLES {
        if dictionary_tables.contains(table) {
            statements.push(trigger_sql(schema, table));
        }
    }
    statements
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_balance_guard_checks_every_frozen_column() {
        let sql = account_balance_guard_sql("summa");
        for col in ACCOUNT_BALANCE_FROZEN {
            assert!(
                sql.contains(&format!("OLD.{col} IS DISTINCT FROM NEW.{col}")),
                "missing check for {col}"
            );
        }
        // cached_* columns stay writable.
        assert!(!sql.contains("OLD.cached_balance"));
    }

    #[test]
    fn triggers_skip_tables_missing_from_the_dictionary() {
        let statements = all_trigger_sql("summa", &["ledger_event", "account_balance"]);
        let combined = statements.join("\n");
        assert!(combined.contains("trg_ledger_event_immutable"));
        assert!(combined.contains("trg_account_balance_immutable"));
        assert!(!combined.contains("trg_merkle_node_immutable"));
    }

    #[test]
    fn account_balance_routes_to_the_column_aware_guard() {
        let sql = trigger_sql("summa", "account_balance");
        assert!(sql.contains("forbid_account_balance_mutation"));
        let sql = trigger_sql("summa", "entry_record");
        assert!(sql.contains("summa.forbid_mutation"));
    }

    #[test]
    fn transaction_record_guard_leaves_the_counters_writable() {
        let sql = transaction_record_guard_sql("summa");
        assert!(sql.contains("OLD.reference IS DISTINCT FROM NEW.reference"));
        assert!(!sql.contains("OLD.refunded_amount"));
        assert!(!sql.contains("OLD.committed_amount"));
    }
}
