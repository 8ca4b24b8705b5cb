//! Runs read-only SQL against the warehouse and renders the rows.

use crate::args::{QueryArgs, QueryFormat};
use crate::commands::Out;
use crate::warehouse::{self, QueryResult, Warehouse};
use crate::{Config, Result};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::{Debug, Display, Formatter};

/// Query result rows in the requested output format.
#[derive(Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Rows {
    /// JSON array of objects where each row is a self-describing object with column names as keys.
    Json(Value),
    /// Markdown table as a single formatted string.
    Table(String),
    /// CSV data as a properly escaped string.
    Csv(String),
}

impl Debug for Rows {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Rows::Json(v) => write!(f, "Rows::Json({v:?})"),
            Rows::Table(s) => write!(f, "Rows::Table({} chars)", s.len()),
            Rows::Csv(s) => write!(f, "Rows::Csv({} chars)", s.len()),
        }
    }
}

impl Display for Rows {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Rows::Json(v) => match serde_json::to_string_pretty(v) {
                Ok(s) => write!(f, "{s}"),
                Err(_) => write!(f, "{v:?}"),
            },
            Rows::Table(s) => write!(f, "{s}"),
            Rows::Csv(s) => write!(f, "{s}"),
        }
    }
}

impl Rows {
    pub fn render(result: &QueryResult, format: QueryFormat) -> Result<Self> {
        Ok(match format {
            QueryFormat::Json => Rows::Json(json(result)),
            QueryFormat::Table => Rows::Table(markdown(result)),
            QueryFormat::Csv => Rows::Csv(csv(result)?),
        })
    }
}

/// Execute a read-only SQL query against the warehouse.
///
/// The warehouse is opened read-only, so any write attempt (INSERT, UPDATE, DELETE, DROP) is
/// rejected by SQLite.
pub async fn query(config: Config, args: QueryArgs) -> Result<Out<Rows>> {
    let warehouse = Warehouse::open_read_only(&warehouse::db_path(&config)).await?;
    let result = warehouse.query(args.sql()).await;
    warehouse.close().await;
    let result = result?;
    let count = result.rows.len();
    let rows = Rows::render(&result, args.format())?;
    Ok(Out::new(format!("Query returned {count} rows"), rows))
}

fn json(result: &QueryResult) -> Value {
    Value::Array(
        result
            .rows
            .iter()
            .map(|row| {
                let object: Map<String, Value> =
                    result.columns.iter().cloned().zip(row.iter().cloned()).collect();
                Value::Object(object)
            })
            .collect(),
    )
}

fn text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn markdown(result: &QueryResult) -> String {
    let line = |cells: Vec<String>| format!("| {} |", cells.join(" | "));
    let mut lines = vec![
        line(result.columns.clone()),
        line(vec!["---".to_string(); result.columns.len()]),
    ];
    for row in &result.rows {
        lines.push(line(
            row.iter()
                .map(|v| text(v).replace('|', "\\|").replace('\n', " "))
                .collect(),
        ));
    }
    lines.join("\n")
}

fn csv(result: &QueryResult) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(&result.columns)
        .context("Unable to write the CSV header")?;
    for row in &result.rows {
        writer
            .write_record(row.iter().map(text))
            .context("Unable to write a CSV row")?;
    }
    let bytes = writer.into_inner().context("Unable to finish the CSV")?;
    String::from_utf8(bytes).context("The CSV is not valid UTF-8")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result() -> QueryResult {
        QueryResult {
            columns: vec!["payee_name".into(), "total".into()],
            rows: vec![
                vec![json!("PG&E | Electric"), json!(-142.67)],
                vec![json!("Starbucks, Inc"), Value::Null],
            ],
        }
    }

    #[test]
    fn test_json_rows() {
        let Rows::Json(v) = Rows::render(&result(), QueryFormat::Json).unwrap() else {
            panic!("expected json");
        };
        assert_eq!(v[1], json!({"payee_name": "Starbucks, Inc", "total": null}));
    }

    #[test]
    fn test_table_rows() {
        let rows = Rows::render(&result(), QueryFormat::Table).unwrap();
        let expected = "| payee_name | total |\n| --- | --- |\n| PG&E \\| Electric | -142.67 |\n\
            | Starbucks, Inc |  |";
        assert_eq!(rows.to_string(), expected);
    }

    #[test]
    fn test_csv_rows() {
        let rows = Rows::render(&result(), QueryFormat::Csv).unwrap();
        assert_eq!(
            rows.to_string(),
            "payee_name,total\nPG&E | Electric,-142.67\n\"Starbucks, Inc\",\n"
        );
    }
}
