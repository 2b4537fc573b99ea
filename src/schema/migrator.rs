//! Additive migration planner.
//!
//! The plan is the diff between the declarative dictionary and the live
//! database: create missing tables, add missing columns, add missing
//! indexes. Nothing is ever dropped or retyped by an up migration. Each
//! applied plan is recorded in the migration table with a truncated SHA-256
//! of its up SQL.

use std::collections::{HashMap, HashSet};

use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::schema::{triggers, ColumnDef, TableDef};
use crate::store::{dialect, Store};

#[derive(Debug, Default)]
pub struct MigrationPlan {
    pub create_tables: Vec<TableDef>,
    /// (table, column)
    pub add_columns: Vec<(String, ColumnDef)>,
    /// (index name, CREATE INDEX statement)
    pub add_indexes: Vec<(String, String)>,
}

impl MigrationPlan {
    pub fn is_empty(&self) -> bool {
        self.create_tables.is_empty() && self.add_columns.is_empty() && self.add_indexes.is_empty()
    }

    /// Diff the dictionary against introspected state.
    pub fn diff(
        dictionary: &[TableDef],
        existing_tables: &HashSet<String>,
        existing_columns: &HashMap<String, HashSet<String>>,
        existing_indexes: &HashSet<String>,
        schema: &str,
    ) -> Self {
        let mut plan = MigrationPlan::default();
        for table in dictionary {
            if !existing_tables.contains(table.name) {
                plan.create_tables.push(table.clone());
            } else if let Some(columns) = existing_columns.get(table.name) {
                for col in &table.columns {
                    if !columns.contains(col.name) {
                        plan.add_columns.push((table.name.to_string(), col.clone()));
                    }
                }
            }
            for idx in &table.indexes {
                if !existing_indexes.contains(idx.name) {
                    plan.add_indexes
                        .push((idx.name.to_string(), index_sql(schema, table.name, idx)));
                }
            }
        }
        plan
    }

    /// Render the full up migration, immutability triggers last.
    pub fn up_sql(&self, schema: &str, dictionary: &[TableDef]) -> Vec<String> {
        let mut statements = vec![format!("CREATE SCHEMA IF NOT EXISTS {schema};")];
        for table in &self.create_tables {
            statements.push(create_table_sql(schema, table));
        }
        for (table, col) in &self.add_columns {
            statements.push(add_column_sql(schema, table, col));
        }
        for (_, sql) in &self.add_indexes {
            statements.push(sql.clone());
        }
        let table_names: Vec<&str> = dictionary.iter().map(|t| t.name).collect();
        statements.extend(triggers::all_trigger_sql(schema, &table_names));
        statements
    }

    /// Reverse of the plan: drop added indexes, columns, tables, in that order.
    pub fn down_sql(&self, schema: &str) -> Vec<String> {
        let mut statements = Vec::new();
        for (name, _) in self.add_indexes.iter().rev() {
            statements.push(format!("DROP INDEX IF EXISTS {schema}.{name};"));
        }
        for (table, col) in self.add_columns.iter().rev() {
            statements.push(format!(
                "ALTER TABLE {schema}.{table} DROP COLUMN IF EXISTS {};",
                col.name
            ));
        }
        for table in self.create_tables.iter().rev() {
            statements.push(format!("DROP TABLE IF EXISTS {schema}.{} CASCADE;", table.name));
        }
        statements
    }

    /// Truncated SHA-256 over the rendered up SQL, recorded with the plan.
    pub fn hash(&self, schema: &str, dictionary: &[TableDef]) -> String {
        let mut hasher = Sha256::new();
        for statement in self.up_sql(schema, dictionary) {
            hasher.update(statement.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(&hasher.finalize()[..8])
    }
}

fn column_sql(schema: &str, col: &ColumnDef) -> String {
    let mut sql = format!("{} {}", col.name, col.ty.sql());
    if col.primary_key {
        sql.push_str(" PRIMARY KEY");
    } else if col.not_null {
        sql.push_str(" NOT NULL");
    }
    if let Some(default) = col.default {
        sql.push_str(&format!(" DEFAULT {default}"));
    }
    if let Some(target) = col.references {
        sql.push_str(&format!(" REFERENCES {schema}.{target}(id)"));
    }
    sql
}

fn create_table_sql(schema: &str, table: &TableDef) -> String {
    let columns = table
        .columns
        .iter()
        .map(|col| column_sql(schema, col))
        .collect::<Vec<_>>()
        .join(",\n    ");
    format!(
        "CREATE TABLE IF NOT EXISTS {schema}.{} (\n    {columns}\n);",
        table.name
    )
}

fn add_column_sql(schema: &str, table: &str, col: &ColumnDef) -> String {
    // Additive only: added columns are nullable or defaulted so existing
    // rows stay valid.
    let mut sql = format!(
        "ALTER TABLE {schema}.{table} ADD COLUMN IF NOT EXISTS {} {}",
        col.name,
        col.ty.sql()
    );
    if let Some(default) = col.default {
        sql.push_str(&format!(" DEFAULT {default}"));
        if col.not_null {
            sql.push_str(" NOT NULL");
        }
    }
    if let Some(target) = col.references {
        sql.push_str(&format!(" REFERENCES {schema}.{target}(id)"));
    }
    sql.push(';');
    sql
}

fn index_sql(schema: &str, table: &str, idx: &crate::schema::IndexDef) -> String {
    let unique = if idx.unique { "UNIQUE " } else { "" };
    let mut sql = format!(
        "CREATE {unique}INDEX IF NOT EXISTS {} ON {schema}.{table} ({})",
        idx.name,
        idx.columns.join(", ")
    );
    if let Some(clause) = idx.where_clause {
        sql.push_str(&format!(" WHERE {clause}"));
    }
    sql.push(';');
    sql
}

pub struct Migrator {
    store: Store,
}

impl Migrator {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Introspect, diff, apply, record. Returns the number of statements run.
    pub async fn migrate(&self, name: &str, dictionary: &[TableDef]) -> Result<usize> {
        let schema = self.store.schema().to_string();
        let (tables, columns, indexes) = self.introspect(&schema).await?;
        let plan = MigrationPlan::diff(dictionary, &tables, &columns, &indexes, &schema);
        let hash = plan.hash(&schema, dictionary);
        let statements = plan.up_sql(&schema, dictionary);

        let mut tx = self.store.begin().await?;
        for statement in &statements {
            sqlx::raw_sql(statement).execute(&mut *tx).await?;
        }
        sqlx::query(&format!(
            "INSERT INTO {schema}.migration (name, hash) VALUES ($1, $2) {}",
            dialect::on_conflict_do_nothing(&["name"])
        ))
        .bind(name)
        .bind(&hash)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        tracing::info!(name, hash, statements = statements.len(), "schema migrated");
        Ok(statements.len())
    }

    async fn introspect(
        &self,
        schema: &str,
    ) -> Result<(
        HashSet<String>,
        HashMap<String, HashSet<String>>,
        HashSet<String>,
    )> {
        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT table_name FROM information_schema.tables WHERE table_schema = $1",
        )
        .bind(schema)
        .fetch_all(self.store.pool())
        .await?;

        let columns: Vec<(String, String)> = sqlx::query_as(
            "SELECT table_name, column_name FROM information_schema.columns WHERE table_schema = $1",
        )
        .bind(schema)
        .fetch_all(self.store.pool())
        .await?;

        let indexes: Vec<String> =
            sqlx::query_scalar("SELECT indexname FROM pg_indexes WHERE schemaname = $1")
                .bind(schema)
                .fetch_all(self.store.pool())
                .await?;

        let mut column_map: HashMap<String, HashSet<String>> = HashMap::new();
        for (table, column) in columns {
            column_map.entry(table).or_default().insert(column);
        }
        Ok((
            tables.into_iter().collect(),
            column_map,
            indexes.into_iter().collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{dictionary, ColumnType};

    fn empty_state() -> (
        HashSet<String>,
        HashMap<String, HashSet<String>>,
        HashSet<String>,
    ) {
        (HashSet::new(), HashMap::new(), HashSet::new())
    }

    #[test]
    fn empty_database_plans_every_table() {
        let dict = dictionary();
        let (tables, columns, indexes) = empty_state();
        let plan = MigrationPlan::diff(&dict, &tables, &columns, &indexes, "summa");
        assert_eq!(plan.create_tables.len(), dict.len());
        assert!(!plan.add_indexes.is_empty());
    }

    #[test]
    fn up_to_date_database_plans_nothing_but_triggers() {
        let dict = dictionary();
        let mut tables = HashSet::new();
        let mut columns: HashMap<String, HashSet<String>> = HashMap::new();
        let mut indexes = HashSet::new();
        for table in &dict {
            tables.insert(table.name.to_string());
            let cols = columns.entry(table.name.to_string()).or_default();
            for col in &table.columns {
                cols.insert(col.name.to_string());
            }
            for idx in &table.indexes {
                indexes.insert(idx.name.to_string());
            }
        }
        let plan = MigrationPlan::diff(&dict, &tables, &columns, &indexes, "summa");
        assert!(plan.is_empty());
    }

    #[test]
    fn missing_column_becomes_add_column() {
        let dict = dictionary();
        let mut tables = HashSet::new();
        let mut columns: HashMap<String, HashSet<String>> = HashMap::new();
        let mut indexes = HashSet::new();
        for table in &dict {
            tables.insert(table.name.to_string());
            let cols = columns.entry(table.name.to_string()).or_default();
            for col in &table.columns {
                cols.insert(col.name.to_string());
            }
            for idx in &table.indexes {
                indexes.insert(idx.name.to_string());
            }
        }
        columns
            .get_mut("account_balance")
            .unwrap()
            .remove("cached_balance");
        let plan = MigrationPlan::diff(&dict, &tables, &columns, &indexes, "summa");
        assert_eq!(plan.create_tables.len(), 0);
        assert_eq!(plan.add_columns.len(), 1);
        assert_eq!(plan.add_columns[0].0, "account_balance");
        assert_eq!(plan.add_columns[0].1.name, "cached_balance");
    }

    #[test]
    fn up_sql_creates_tables_before_triggers() {
        let dict = dictionary();
        let (tables, columns, indexes) = empty_state();
        let plan = MigrationPlan::diff(&dict, &tables, &columns, &indexes, "summa");
        let statements = plan.up_sql("summa", &dict);
        let first_trigger = statements
            .iter()
            .position(|s| s.contains("forbid_mutation"))
            .unwrap();
        let last_create = statements
            .iter()
            .rposition(|s| s.starts_with("CREATE TABLE"))
            .unwrap();
        assert!(last_create < first_trigger);
    }

    #[test]
    fn foreign_keys_are_rendered_in_create_and_add_column() {
        let dict = dictionary();
        let (tables, columns, indexes) = empty_state();
        let plan = MigrationPlan::diff(&dict, &tables, &columns, &indexes, "summa");
        let statements = plan.up_sql("summa", &dict);

        let versions = statements
            .iter()
            .find(|s| s.contains("CREATE TABLE IF NOT EXISTS summa.account_balance_version"))
            .unwrap();
        assert!(versions.contains("account_id UUID NOT NULL REFERENCES summa.account_balance(id)"));

        let entries = statements
            .iter()
            .find(|s| s.contains("CREATE TABLE IF NOT EXISTS summa.entry_record"))
            .unwrap();
        assert!(entries.contains("REFERENCES summa.transaction_record(id)"));
        assert!(entries.contains("REFERENCES summa.account_balance(id)"));

        let deliveries = statements
            .iter()
            .find(|s| s.contains("CREATE TABLE IF NOT EXISTS summa.webhook_delivery"))
            .unwrap();
        assert!(deliveries.contains("REFERENCES summa.webhook_endpoint(id)"));

        let added = add_column_sql(
            "summa",
            "plugin_audit",
            &ColumnDef::new("account_id", ColumnType::Uuid).references("account_balance"),
        );
        assert!(added.contains("REFERENCES summa.account_balance(id)"));
    }

    #[test]
    fn referenced_tables_are_created_before_their_dependents() {
        // CREATE TABLE statements run in dictionary order, so every
        // referenced table must appear before the tables that point at it.
        let dict = dictionary();
        for (position, table) in dict.iter().enumerate() {
            for col in &table.columns {
                if let Some(target) = col.references {
                    let target_position = dict
                        .iter()
                        .position(|t| t.name == target)
                        .expect("reference target exists in the dictionary");
                    assert!(
                        target_position < position,
                        "{}.{} references {} which is defined later",
                        table.name,
                        col.name,
                        target
                    );
                }
            }
        }
    }

    #[test]
    fn plan_hash_is_stable_and_short() {
        let dict = dictionary();
        let (tables, columns, indexes) = empty_state();
        let plan = MigrationPlan::diff(&dict, &tables, &columns, &indexes, "summa");
        let h1 = plan.hash("summa", &dict);
        let h2 = plan.hash("summa", &dict);
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 16);
    }

    #[test]
    fn down_sql_reverses_in_order() {
        let plan = MigrationPlan {
            create_tables: vec![TableDef {
                name: "plugin_audit",
                columns: vec![ColumnDef::new("id", ColumnType::Uuid).primary_key()],
                indexes: vec![],
            }],
            add_columns: vec![(
                "account_balance".to_string(),
                ColumnDef::new("kyc_status", ColumnType::Text),
            )],
            add_indexes: vec![],
        };
        let down = plan.down_sql("summa");
        assert_eq!(down.len(), 2);
        assert!(down[0].contains("DROP COLUMN IF EXISTS kyc_status"));
        assert!(down[1].contains("DROP TABLE IF EXISTS summa.plugin_audit"));
    }
}
