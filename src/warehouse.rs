//! The warehouse stage: reshapes base tables into dimension and fact tables in a SQLite file.
//!
//! Every table comes from one declarative [`Transform`]. Tables are rebuilt from scratch on each
//! run, each inside its own transaction, so a reader sees either the old table or the new one.

use crate::base::BaseStore;
use crate::error::Fatal;
use crate::table::{Row, Table, INGESTION_DATE};
use crate::{utils, Config, Result};
use anyhow::{bail, Context};
use chrono::{Datelike, NaiveDate};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row as _, SqlitePool, TypeInfo, ValueRef};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

const WAREHOUSE_SQLITE: &str = "warehouse.sqlite";
const DIM_DATE: &str = "dim_date";
const UNKNOWN: &str = "unknown";

/// How one base table becomes one warehouse table. Steps run in field order:
/// select, aliases, fill_null, scale, drop.
#[derive(Debug, Clone, Copy)]
pub struct Transform {
    /// The warehouse table written.
    pub table: &'static str,
    /// The base table read.
    pub entity: &'static str,
    /// Columns kept, in order. Empty keeps every column.
    pub select: &'static [&'static str],
    /// `(source, target)`: `target` becomes a copy of `source`.
    pub aliases: &'static [(&'static str, &'static str)],
    /// `(column, value)`: nulls in `column` become `value`.
    pub fill_null: &'static [(&'static str, &'static str)],
    /// `(source, target)`: `target` becomes `source` converted from milliunits to units.
    pub scale: &'static [(&'static str, &'static str)],
    /// Columns removed if present.
    pub drop: &'static [&'static str],
}

pub const TRANSFORMS: &[Transform] = &[
    Transform {
        table: "dim_accounts",
        entity: "accounts",
        select: &[],
        aliases: &[
            ("id", "account_id"),
            ("name", "account_name"),
            ("type", "account_type"),
        ],
        fill_null: &[("note", UNKNOWN)],
        scale: &[
            ("balance", "balance"),
            ("cleared_balance", "cleared_balance"),
            ("uncleared_balance", "uncleared_balance"),
        ],
        drop: &[
            "transfer_payee_id",
            "direct_import_linked",
            "direct_import_in_error",
            "last_reconciled_at",
            "debt_original_balance",
            "debt_interest_rates",
            "debt_minimum_payments",
            "debt_escrow_amounts",
            INGESTION_DATE,
        ],
    },
    Transform {
        table: "dim_categories",
        entity: "categories",
        select: &[
            "id",
            "name",
            "category_group_name",
            "hidden",
            "note",
            "budgeted",
            "activity",
            "balance",
            "deleted",
        ],
        aliases: &[("id", "category_id"), ("name", "category_name")],
        fill_null: &[("note", UNKNOWN)],
        scale: &[
            ("balance", "balance"),
            ("budgeted", "budgeted"),
            ("activity", "activity"),
        ],
        drop: &[],
    },
    Transform {
        table: "dim_payees",
        entity: "payees",
        select: &["id", "name", "deleted"],
        aliases: &[("id", "payee_id"), ("name", "payee_name")],
        fill_null: &[],
        scale: &[],
        drop: &[],
    },
    Transform {
        table: "fact_transactions",
        entity: "transactions",
        select: &[],
        aliases: &[
            ("id", "transaction_id"),
            ("date", "transaction_date"),
            ("memo", "transaction_memo"),
            ("cleared", "transaction_cleared"),
            ("approved", "transaction_approved"),
            ("flag_color", "transaction_flag_color"),
        ],
        fill_null: &[("memo", UNKNOWN)],
        scale: &[("amount", "transaction_amount")],
        drop: &[
            "transfer_transaction_id",
            "matched_transaction_id",
            "import_id",
            "subtransactions",
            "deleted",
            "flag_name",
            "account_name",
            "payee_name",
            "category_name",
            "import_payee_name",
            "import_payee_name_original",
            "debt_transaction_type",
            INGESTION_DATE,
        ],
    },
    Transform {
        table: "fact_scheduled_transactions",
        entity: "scheduled_transactions",
        select: &[],
        aliases: &[
            ("id", "scheduled_transaction_id"),
            ("date_first", "scheduled_transaction_first_date"),
            ("date_next", "scheduled_transaction_next_date"),
            ("frequency", "scheduled_transaction_frequency"),
            ("memo", "scheduled_transaction_memo"),
            ("flag_color", "scheduled_transaction_flag_color"),
        ],
        fill_null: &[("memo", UNKNOWN)],
        scale: &[("amount", "scheduled_transaction_amount")],
        drop: &[
            "subtransactions",
            "deleted",
            "flag_name",
            "account_name",
            "payee_name",
            "category_name",
            INGESTION_DATE,
        ],
    },
];

impl Transform {
    /// Applies the transform. Fails if a selected, aliased, filled or scaled column is missing.
    pub fn apply(&self, table: &Table) -> Result<Table> {
        let require = |column: &str| -> Result<()> {
            if !table.has_column(column) {
                bail!("{} has no '{column}' column", self.entity);
            }
            Ok(())
        };

        let mut columns: Vec<String> = if self.select.is_empty() {
            table.columns().to_vec()
        } else {
            for column in self.select {
                require(*column)?;
            }
            self.select.iter().map(|c| c.to_string()).collect()
        };
        let mut rows: Vec<Row> = table
            .rows()
            .iter()
            .map(|row| {
                columns
                    .iter()
                    .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Value::Null)))
                    .collect()
            })
            .collect();

        for (source, target) in self.aliases {
            require(*source)?;
            for row in rows.iter_mut() {
                let value = row.get(*source).cloned().unwrap_or(Value::Null);
                row.insert(target.to_string(), value);
            }
            push_column(&mut columns, target);
        }

        for (column, fill) in self.fill_null {
            require(*column)?;
            for row in rows.iter_mut() {
                let value = row.entry(column.to_string()).or_insert(Value::Null);
                if value.is_null() {
                    *value = Value::String(fill.to_string());
                }
            }
        }

        for (source, target) in self.scale {
            require(*source)?;
            for row in rows.iter_mut() {
                let value = row.get(*source).unwrap_or(&Value::Null);
                let scaled = to_units(value)
                    .with_context(|| format!("Unable to scale '{source}' in {}", self.entity))?;
                row.insert(target.to_string(), scaled);
            }
            push_column(&mut columns, target);
        }

        for column in self.drop {
            columns.retain(|c| c != column);
            for row in rows.iter_mut() {
                row.shift_remove(*column);
            }
        }

        Ok(Table::with_columns(columns, rows))
    }
}

fn push_column(columns: &mut Vec<String>, column: &str) {
    if !columns.iter().any(|c| c == column) {
        columns.push(column.to_string());
    }
}

/// Amounts arrive as integer hundredths. Converts through `Decimal` so the division is exact.
fn to_units(value: &Value) -> Result<Value> {
    let hundredths = match value {
        Value::Null => return Ok(Value::Null),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Decimal::from(i),
            None => n
                .as_f64()
                .and_then(Decimal::from_f64_retain)
                .with_context(|| format!("{n} is out of range"))?,
        },
        other => bail!("{other} is not a number"),
    };
    let units = hundredths / Decimal::ONE_HUNDRED;
    units
        .to_f64()
        .map(Value::from)
        .with_context(|| format!("{units} cannot be stored"))
}

/// The calendar dimension: one row per day from 2020-01-01 through 2030-12-31. `weekday` is ISO,
/// Monday is 1.
pub fn dim_date() -> Table {
    let (Some(first), Some(last)) = (
        NaiveDate::from_ymd_opt(2020, 1, 1),
        NaiveDate::from_ymd_opt(2030, 12, 31),
    ) else {
        return Table::default();
    };
    let rows = first
        .iter_days()
        .take_while(|d| *d <= last)
        .map(|d| {
            let weekday = d.weekday().number_from_monday();
            let mut row = Row::new();
            row.insert("date_id".into(), d.format("%Y-%m-%d").to_string().into());
            row.insert("year".into(), d.year().into());
            row.insert("month".into(), d.month().into());
            row.insert("day".into(), d.day().into());
            row.insert("weekday".into(), weekday.into());
            row.insert("is_weekday".into(), (weekday <= 5).into());
            row
        })
        .collect();
    Table::from_rows(rows)
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TableOutcome {
    Built { rows: usize },
    MissingBase,
    Failed { reason: String },
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct TableBuild {
    pub table: String,
    pub outcome: TableOutcome,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct WarehouseReport {
    pub path: PathBuf,
    pub tables: Vec<TableBuild>,
}

impl WarehouseReport {
    pub fn built(&self) -> usize {
        self.tables
            .iter()
            .filter(|t| matches!(t.outcome, TableOutcome::Built { .. }))
            .count()
    }
}

/// The warehouse SQLite file for `config`.
pub fn db_path(config: &Config) -> PathBuf {
    config.warehouse_path().join(WAREHOUSE_SQLITE)
}

/// Rebuilds every warehouse table from the current base tables.
///
/// A missing base table or a failing transform skips that one table. Fails with [`Fatal::NoData`]
/// if none of the configured entities has a base table.
pub async fn build(config: &Config) -> Result<WarehouseReport> {
    let base = BaseStore::new(config.base_path());
    if !config.entities().iter().any(|e| base.exists(e.name())) {
        return Err(Fatal::NoData.into());
    }

    let path = db_path(config);
    let warehouse = Warehouse::open(&path).await?;
    let mut tables = Vec::new();
    for transform in TRANSFORMS {
        let outcome = match build_table(&base, &warehouse, transform).await {
            Ok(Some(rows)) => {
                info!("Wrote {rows} rows to {}", transform.table);
                TableOutcome::Built { rows }
            }
            Ok(None) => {
                error!(
                    "The {} base table does not exist, skipping {}",
                    transform.entity, transform.table
                );
                TableOutcome::MissingBase
            }
            Err(e) => {
                error!("Failed to build {}: {e:#}", transform.table);
                TableOutcome::Failed {
                    reason: format!("{e:#}"),
                }
            }
        };
        tables.push(TableBuild {
            table: transform.table.to_string(),
            outcome,
        });
    }

    let dates = dim_date();
    let outcome = match warehouse.replace(DIM_DATE, &dates).await {
        Ok(rows) => {
            info!("Wrote {rows} rows to {DIM_DATE}");
            TableOutcome::Built { rows }
        }
        Err(e) => {
            error!("Failed to build {DIM_DATE}: {e:#}");
            TableOutcome::Failed {
                reason: format!("{e:#}"),
            }
        }
    };
    tables.push(TableBuild {
        table: DIM_DATE.to_string(),
        outcome,
    });

    warehouse.close().await;
    Ok(WarehouseReport { path, tables })
}

async fn build_table(
    base: &BaseStore,
    warehouse: &Warehouse,
    transform: &Transform,
) -> Result<Option<usize>> {
    let Some(table) = base.load(transform.entity).await? else {
        return Ok(None);
    };
    debug!("Transforming {} into {}", transform.entity, transform.table);
    let transformed = transform.apply(&table)?;
    Ok(Some(warehouse.replace(transform.table, &transformed).await?))
}

/// Column names and JSON values from a query.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

/// A connection pool on the warehouse SQLite file.
pub struct Warehouse {
    pool: SqlitePool,
}

impl Warehouse {
    /// Opens the warehouse for writing, creating the file and its directory if needed.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            utils::make_dir(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        Self::connect(options, path).await
    }

    /// Opens an existing warehouse read-only. Any write through this handle is rejected by SQLite.
    pub async fn open_read_only(path: &Path) -> Result<Self> {
        if !path.is_file() {
            bail!(
                "There is no warehouse at {}, run 'budget warehouse' first",
                path.display()
            );
        }
        let options = SqliteConnectOptions::new().filename(path).read_only(true);
        Self::connect(options, path).await
    }

    async fn connect(options: SqliteConnectOptions, path: &Path) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("Unable to open the warehouse at {}", path.display()))?;
        Ok(Self { pool })
    }

    /// Drops `name` and recreates it from `table` in one transaction. Returns the row count.
    pub async fn replace(&self, name: &str, table: &Table) -> Result<usize> {
        if table.columns().is_empty() {
            bail!("{name} has no columns");
        }
        let columns: Vec<String> = table.columns().iter().map(|c| quote(c)).collect();
        let create = format!("CREATE TABLE {} ({})", quote(name), columns.join(", "));
        let insert = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote(name),
            columns.join(", "),
            vec!["?"; columns.len()].join(", ")
        );

        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin warehouse transaction")?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote(name)))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to drop {name}"))?;
        sqlx::query(&create)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to create {name}"))?;
        for row in table.rows() {
            let mut query = sqlx::query(&insert);
            for column in table.columns() {
                query = match row.get(column).unwrap_or(&Value::Null) {
                    Value::Null => query.bind(None::<String>),
                    Value::Bool(b) => query.bind(*b),
                    Value::Number(n) => match n.as_i64() {
                        Some(i) => query.bind(i),
                        None => query.bind(n.as_f64()),
                    },
                    Value::String(s) => query.bind(s.clone()),
                    nested => query.bind(nested.to_string()),
                };
            }
            query
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Failed to insert into {name}"))?;
        }
        tx.commit()
            .await
            .with_context(|| format!("Failed to commit {name}"))?;
        Ok(table.len())
    }

    /// Runs `sql` and returns every row.
    pub async fn query(&self, sql: &str) -> Result<QueryResult> {
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .context("Query failed")?;
        let columns = rows
            .first()
            .map(|r| r.columns().iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();
        let rows = rows
            .iter()
            .map(|row| (0..row.len()).map(|i| cell(row, i)).collect())
            .collect::<Result<_>>()?;
        Ok(QueryResult { columns, rows })
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

fn cell(row: &SqliteRow, i: usize) -> Result<Value> {
    let raw = row.try_get_raw(i).context("Unable to read a column")?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let type_name = raw.type_info().name().to_string();
    Ok(match type_name.as_str() {
        "INTEGER" | "BOOLEAN" => row.try_get::<i64, _>(i)?.into(),
        "REAL" => row.try_get::<f64, _>(i)?.into(),
        "TEXT" | "DATE" | "TIME" | "DATETIME" => row.try_get::<String, _>(i)?.into(),
        other => Value::String(format!("<{other}>")),
    })
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{ACCOUNTS, PAYEES, TRANSACTIONS};
    use crate::error;
    use crate::test::TestEnv;
    use serde_json::json;

    fn table(rows: Value) -> Table {
        Table::from_rows(
            rows.as_array()
                .unwrap()
                .iter()
                .map(|r| r.as_object().unwrap().clone())
                .collect(),
        )
    }

    fn transform(name: &str) -> &'static Transform {
        TRANSFORMS.iter().find(|t| t.table == name).unwrap()
    }

    #[test]
    fn test_accounts_transform() {
        let accounts = table(json!([{
            "id": "a1", "name": "Checking", "type": "checking", "note": null,
            "balance": 250000, "cleared_balance": 240000, "uncleared_balance": 10000,
            "transfer_payee_id": "p", "ingestion_date": "2025-01-01T00:00:00"
        }]));

        let out = transform("dim_accounts").apply(&accounts).unwrap();

        let row = &out.rows()[0];
        assert_eq!(row["account_id"], json!("a1"));
        assert_eq!(row["account_type"], json!("checking"));
        assert_eq!(row["note"], json!("unknown"));
        assert_eq!(row["balance"], json!(2500.0));
        assert!(!out.has_column("transfer_payee_id"));
        assert!(!out.has_column(INGESTION_DATE));
        assert!(!row.contains_key(INGESTION_DATE));
    }

    #[test]
    fn test_scale_writes_target_and_keeps_source() {
        let transactions = table(json!([
            {"id": "t1", "date": "2025-10-20", "amount": -8743, "memo": null, "cleared": "cleared",
             "approved": true, "flag_color": null},
            {"id": "t2", "date": "2025-10-21", "amount": null, "memo": "m", "cleared": "cleared",
             "approved": false, "flag_color": "red"}
        ]));

        let out = transform("fact_transactions").apply(&transactions).unwrap();

        assert_eq!(out.rows()[0]["transaction_amount"], json!(-87.43));
        assert_eq!(out.rows()[0]["amount"], json!(-8743));
        assert_eq!(out.rows()[0]["memo"], json!("unknown"));
        // The alias was taken before the fill.
        assert_eq!(out.rows()[0]["transaction_memo"], Value::Null);
        assert_eq!(out.rows()[1]["transaction_amount"], Value::Null);
    }

    #[test]
    fn test_select_requires_columns() {
        let payees = table(json!([{"id": "p1", "name": "Grocer"}]));
        let err = transform("dim_payees").apply(&payees).unwrap_err();
        assert!(err.to_string().contains("'deleted'"));
    }

    #[test]
    fn test_dim_date() {
        let dates = dim_date();
        assert_eq!(dates.len(), 4018);
        let saturday = dates
            .rows()
            .iter()
            .find(|r| r["date_id"] == json!("2024-01-06"))
            .unwrap();
        assert_eq!(saturday["weekday"], json!(6));
        assert_eq!(saturday["is_weekday"], json!(false));
        let friday = dates
            .rows()
            .iter()
            .find(|r| r["date_id"] == json!("2024-01-05"))
            .unwrap();
        assert_eq!(friday["is_weekday"], json!(true));
    }

    #[tokio::test]
    async fn test_build_without_base_tables_is_no_data() {
        let env = TestEnv::new().await;
        let err = build(&env.config()).await.unwrap_err();
        assert_eq!(error::exit_code(&err), 40);
    }

    #[tokio::test]
    async fn test_build_skips_missing_and_broken_tables() {
        let env = TestEnv::new().await;
        let base = env.base();
        base.save(
            ACCOUNTS,
            "id",
            &table(json!([{"id": "a1", "name": "Checking", "type": "checking", "note": "n",
                "balance": 100, "cleared_balance": 100, "uncleared_balance": 0}])),
        )
        .await
        .unwrap();
        base.save(PAYEES, "id", &table(json!([{"id": "p1"}])))
            .await
            .unwrap();
        let config = env.config();

        let report = build(&config).await.unwrap();

        let outcome = |name: &str| {
            report
                .tables
                .iter()
                .find(|t| t.table == name)
                .unwrap()
                .outcome
                .clone()
        };
        assert_eq!(outcome("dim_accounts"), TableOutcome::Built { rows: 1 });
        assert!(matches!(outcome("dim_payees"), TableOutcome::Failed { .. }));
        assert_eq!(outcome("fact_transactions"), TableOutcome::MissingBase);
        assert_eq!(outcome(DIM_DATE), TableOutcome::Built { rows: 4018 });
        assert!(!base.exists(TRANSACTIONS));

        let warehouse = Warehouse::open_read_only(&db_path(&config)).await.unwrap();
        let result = warehouse
            .query("SELECT account_id, balance, note FROM dim_accounts")
            .await
            .unwrap();
        assert_eq!(result.columns, vec!["account_id", "balance", "note"]);
        assert_eq!(result.rows, vec![vec![json!("a1"), json!(1.0), json!("n")]]);
    }

    #[tokio::test]
    async fn test_read_only_rejects_writes() {
        let env = TestEnv::new().await;
        let path = db_path(&env.config());
        let warehouse = Warehouse::open(&path).await.unwrap();
        warehouse
            .replace("t", &table(json!([{"a": 1}])))
            .await
            .unwrap();
        warehouse.close().await;

        let read_only = Warehouse::open_read_only(&path).await.unwrap();
        assert!(read_only.query("INSERT INTO t (a) VALUES (2)").await.is_err());
        let count = read_only.query("SELECT COUNT(*) AS n FROM t").await.unwrap();
        assert_eq!(count.rows, vec![vec![json!(1)]]);
    }

    #[tokio::test]
    async fn test_rebuild_replaces_table() {
        let env = TestEnv::new().await;
        let path = db_path(&env.config());
        let warehouse = Warehouse::open(&path).await.unwrap();
        warehouse
            .replace("t", &table(json!([{"a": 1}, {"a": 2}])))
            .await
            .unwrap();
        warehouse
            .replace("t", &table(json!([{"b": "x"}])))
            .await
            .unwrap();
        let result = warehouse.query("SELECT * FROM t").await.unwrap();
        assert_eq!(result.columns, vec!["b"]);
        assert_eq!(result.rows, vec![vec![json!("x")]]);
    }
}
