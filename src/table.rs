//! The in-memory form of a base table, and the steps that turn a raw snapshot into one.

use crate::entity::Entity;
use crate::error::Fatal;
use crate::Result;
use chrono::{NaiveDate, NaiveDateTime};
use serde_json::{Map, Value};
use std::collections::HashSet;

/// The provenance column stamped onto every record.
pub const INGESTION_DATE: &str = "ingestion_date";

/// How ingestion timestamps are rendered.
pub const INGESTION_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// The field a non-object record is wrapped in.
const RECORD: &str = "record";

pub type Row = Map<String, Value>;

/// Rows plus the ordered union of their field names.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Row>,
}

impl Table {
    /// Builds a table from rows, with columns in first-seen order.
    pub fn from_rows(rows: Vec<Row>) -> Self {
        let mut table = Self {
            columns: Vec::new(),
            rows: Vec::new(),
        };
        table.extend(rows);
        table
    }

    /// Builds a table with a fixed column order. Columns found in `rows` but not in `columns`
    /// are appended.
    pub fn with_columns(columns: Vec<String>, rows: Vec<Row>) -> Self {
        let mut table = Self {
            columns,
            rows: Vec::new(),
        };
        table.extend(rows);
        table
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    /// `self`'s rows followed by `other`'s, with the union of both column lists.
    pub fn union(mut self, other: Table) -> Table {
        for column in other.columns {
            self.add_column(column);
        }
        self.rows.extend(other.rows);
        self
    }

    /// Keeps exactly one row per `unique_id` value.
    ///
    /// Rows are stably sorted by ingestion date, oldest first, and the first row seen for each id
    /// is kept. An older version of a record therefore wins over a newer one, and rows with the
    /// same ingestion date keep their existing order. A `null` or absent id counts as one key.
    ///
    /// Fails with [`Fatal::DuplicateResolution`] if the id column does not exist or any row lacks
    /// a usable ingestion date.
    pub fn deduplicate(self, entity: &str, unique_id: &str) -> Result<Table> {
        let failed = |reason: String| Fatal::DuplicateResolution {
            entity: entity.to_string(),
            reason,
        };
        if !self.has_column(unique_id) {
            return Err(failed(format!("there is no '{unique_id}' column")).into());
        }

        let mut dated = Vec::with_capacity(self.rows.len());
        for (i, row) in self.rows.into_iter().enumerate() {
            let stamp = row
                .get(INGESTION_DATE)
                .and_then(Value::as_str)
                .and_then(parse_ingestion_date)
                .ok_or_else(|| failed(format!("row {i} has no usable {INGESTION_DATE}")))?;
            dated.push((stamp, row));
        }
        dated.sort_by_key(|(stamp, _)| *stamp);

        let mut seen = HashSet::new();
        let rows = dated
            .into_iter()
            .filter_map(|(_, row)| {
                let key = row.get(unique_id).unwrap_or(&Value::Null).to_string();
                seen.insert(key).then_some(row)
            })
            .collect();
        Ok(Table {
            columns: self.columns,
            rows,
        })
    }

    fn extend(&mut self, rows: Vec<Row>) {
        for row in rows {
            for key in row.keys() {
                if !self.has_column(key) {
                    self.columns.push(key.clone());
                }
            }
            self.rows.push(row);
        }
    }

    fn add_column(&mut self, column: String) {
        if !self.has_column(&column) {
            self.columns.push(column);
        }
    }
}

/// Accepts the full `YYYY-MM-DDTHH:MM:SS` form, or a bare date as midnight.
pub fn parse_ingestion_date(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, INGESTION_DATE_FORMAT)
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// The records carried by a snapshot payload, one per row. Grouped payloads are flattened so that
/// each child becomes a row of its own.
pub fn records(entity: &Entity, payload: &Value) -> Vec<Row> {
    match entity.groups() {
        None => list(payload.get(entity.name())),
        Some(groups) => list(payload.get(&groups.container))
            .iter()
            .flat_map(|group| list(group.get(&groups.children)))
            .collect(),
    }
}

/// True when the payload holds no records at all. For a grouped payload that means no children
/// across all groups, even if the groups themselves are present.
pub fn is_empty_payload(entity: &Entity, payload: &Value) -> bool {
    records(entity, payload).is_empty()
}

/// Flattens `payload` and stamps every row with `fetched_at`.
pub fn from_snapshot(entity: &Entity, payload: &Value, fetched_at: NaiveDateTime) -> Table {
    let stamp = Value::String(fetched_at.format(INGESTION_DATE_FORMAT).to_string());
    let rows = records(entity, payload)
        .into_iter()
        .map(|mut row| {
            row.insert(INGESTION_DATE.to_string(), stamp.clone());
            row
        })
        .collect();
    Table::from_rows(rows)
}

fn list(value: Option<&Value>) -> Vec<Row> {
    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.iter().map(row).collect(),
        Some(other) => vec![row(other)],
    }
}

fn row(value: &Value) -> Row {
    match value {
        Value::Object(map) => map.clone(),
        other => {
            let mut map = Row::new();
            map.insert(RECORD.to_string(), other.clone());
            map
        }
    }
}
