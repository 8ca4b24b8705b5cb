//! Base table persistence: `base/<entity>.json`, always replaced as a whole file.
//!
//! ```json
//! {
//!   "entity": "accounts",
//!   "unique_id": "id",
//!   "columns": ["id", "balance", "ingestion_date"],
//!   "rows": [["a1", 500, "2025-01-02T08:00:00"]]
//! }
//! ```

use crate::table::{Row, Table};
use crate::{utils, Result};
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use tracing::debug;

#[derive(Debug, Serialize, Deserialize)]
struct BaseFile {
    entity: String,
    unique_id: String,
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

#[derive(Debug, Clone)]
pub struct BaseStore {
    root: PathBuf,
}

impl BaseStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self, entity: &str) -> PathBuf {
        self.root.join(format!("{entity}.json"))
    }

    pub fn exists(&self, entity: &str) -> bool {
        self.path(entity).is_file()
    }

    /// The persisted base table, or `None` before the first save. A file that cannot be read back
    /// is an error rather than an empty table.
    pub async fn load(&self, entity: &str) -> Result<Option<Table>> {
        let path = self.path(entity);
        let Some(content) = utils::read_if_exists(&path).await? else {
            debug!("No base table for {entity} yet");
            return Ok(None);
        };
        let file: BaseFile = serde_json::from_str(&content)
            .with_context(|| format!("The base table at {} is corrupt", path.display()))?;
        if file.entity != entity {
            bail!(
                "The base table at {} belongs to '{}', not '{entity}'",
                path.display(),
                file.entity
            );
        }

        let mut rows = Vec::with_capacity(file.rows.len());
        for (i, values) in file.rows.into_iter().enumerate() {
            if values.len() != file.columns.len() {
                bail!(
                    "Row {i} of {} has {} values for {} columns",
                    path.display(),
                    values.len(),
                    file.columns.len()
                );
            }
            let row: Row = file.columns.iter().cloned().zip(values).collect();
            rows.push(row);
        }
        Ok(Some(Table::with_columns(file.columns, rows)))
    }

    /// Replaces the base table for `entity` with `table`.
    pub async fn save(&self, entity: &str, unique_id: &str, table: &Table) -> Result<PathBuf> {
        let columns = table.columns().to_vec();
        let rows = table
            .rows()
            .iter()
            .map(|row| {
                columns
                    .iter()
                    .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
                    .collect()
            })
            .collect();
        let file = BaseFile {
            entity: entity.to_string(),
            unique_id: unique_id.to_string(),
            columns,
            rows,
        };
        let path = self.path(entity);
        let json = serde_json::to_string_pretty(&file)
            .with_context(|| format!("Unable to serialize the {entity} base table"))?;
        utils::write_atomic(&path, json)
            .await
            .with_context(|| format!("Unable to save the {entity} base table"))?;
        Ok(path)
    }
}
