//! These structs provide the CLI interface for the budget CLI.

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt::{Display, Formatter};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::error;
use tracing_subscriber::filter::LevelFilter;

/// budget: incrementally pulls your budgeting data into local files and a SQLite warehouse.
///
/// Each run asks the budgeting API only for what changed since the last run, stores the response
/// as a raw snapshot, merges snapshots into one deduplicated base table per record type and then
/// rebuilds dimension and fact tables for reporting.
///
/// Run `budget init` once to create the home directory, then `budget run` on a schedule. The API
/// token and budget id are read from API_TOKEN and BUDGET_ID (or the matching flags).
#[derive(Debug, Parser, Clone)]
pub struct Args {
    #[clap(flatten)]
    common: Common,

    #[command(subcommand)]
    command: Command,
}

impl Args {
    pub fn common(&self) -> &Common {
        &self.common
    }

    pub fn command(&self) -> &Command {
        &self.command
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Create the home directory and a default config.json.
    ///
    /// An existing config.json is left untouched. Edit it to change which entities are pulled,
    /// where the data layers live and how patient the client is with the API.
    Init,
    /// Run the whole pipeline: fetch, consolidate, then rebuild the warehouse.
    Run(CredentialArgs),
    /// Fetch new data for every entity into the raw layer.
    Fetch(CredentialArgs),
    /// Merge pending raw snapshots into the base tables and archive them.
    Consolidate,
    /// Rebuild the warehouse tables from the base tables.
    Warehouse,
    /// Run a read-only SQL query against the warehouse.
    Query(QueryArgs),
}

/// Arguments common to all subcommands.
#[derive(Debug, Parser, Clone)]
pub struct Common {
    /// The logging verbosity. One of, from least to most verbose:
    /// off, error, warn, info, debug, trace
    ///
    /// This can be overridden by RUST_LOG.
    #[arg(long, default_value_t = LevelFilter::INFO)]
    log_level: LevelFilter,

    /// How log lines are written to stderr: text or json (one object per line).
    #[arg(long, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// The directory where budget data and configuration is held. Defaults to ~/budget
    #[arg(long, env = "BUDGET_HOME", default_value_t = default_budget_home())]
    budget_home: DisplayPath,
}

impl Common {
    pub fn log_level(&self) -> LevelFilter {
        self.log_level
    }

    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }

    pub fn budget_home(&self) -> &DisplayPath {
        &self.budget_home
    }
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

serde_plain::derive_display_from_serialize!(LogFormat);
serde_plain::derive_fromstr_from_deserialize!(LogFormat);

/// (Not shown): Credentials for the commands that talk to the API.
#[derive(Debug, Parser, Clone, Default)]
pub struct CredentialArgs {
    /// The personal access token for the budgeting API.
    #[arg(long, env = "API_TOKEN", hide_env_values = true)]
    api_token: Option<String>,

    /// The id of the budget to pull, or "last-used".
    #[arg(long, env = "BUDGET_ID")]
    budget_id: Option<String>,
}

impl CredentialArgs {
    pub fn api_token(&self) -> Option<&str> {
        self.api_token.as_deref()
    }

    pub fn budget_id(&self) -> Option<&str> {
        self.budget_id.as_deref()
    }
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryFormat {
    /// An array of objects, one per row.
    #[default]
    Json,
    /// A markdown table.
    Table,
    Csv,
}

serde_plain::derive_display_from_serialize!(QueryFormat);
serde_plain::derive_fromstr_from_deserialize!(QueryFormat);

/// (Not shown): Args for the `budget query` command.
#[derive(Debug, Parser, Clone)]
pub struct QueryArgs {
    /// The SQL to run. Anything that writes is rejected.
    sql: String,

    /// The output format: json, table or csv.
    #[arg(long, default_value_t = QueryFormat::Json)]
    format: QueryFormat,
}

impl QueryArgs {
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn format(&self) -> QueryFormat {
        self.format
    }
}

fn default_budget_home() -> DisplayPath {
    DisplayPath(match dirs::home_dir() {
        Some(home) => home.join("budget"),
        None => {
            error!(
                "There was an error when trying to get your home directory. You can get around \
                this by providing --budget-home or BUDGET_HOME instead of relying on the default \
                budget home directory.",
            );
            PathBuf::from("budget")
        }
    })
}

#[derive(Debug, Default, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DisplayPath(PathBuf);

impl From<PathBuf> for DisplayPath {
    fn from(value: PathBuf) -> Self {
        DisplayPath(value)
    }
}

impl Deref for DisplayPath {
    type Target = Path;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<Path> for DisplayPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl Display for DisplayPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_string_lossy())
    }
}

impl FromStr for DisplayPath {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(PathBuf::from(s)))
    }
}

impl DisplayPath {
    pub fn path(&self) -> &Path {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query_args() {
        let args = Args::try_parse_from([
            "budget",
            "--log-format",
            "json",
            "--budget-home",
            "/tmp/b",
            "query",
            "SELECT 1",
            "--format",
            "csv",
        ])
        .unwrap();
        assert_eq!(args.common().log_format(), LogFormat::Json);
        assert_eq!(args.common().budget_home().path(), Path::new("/tmp/b"));
        let Command::Query(query) = args.command() else {
            panic!("expected the query command");
        };
        assert_eq!(query.sql(), "SELECT 1");
        assert_eq!(query.format(), QueryFormat::Csv);
    }

    #[test]
    fn test_parse_credentials() {
        let args = Args::try_parse_from([
            "budget",
            "fetch",
            "--api-token",
            "t0ken",
            "--budget-id",
            "b-1",
        ])
        .unwrap();
        let Command::Fetch(credentials) = args.command() else {
            panic!("expected the fetch command");
        };
        assert_eq!(credentials.api_token(), Some("t0ken"));
        assert_eq!(credentials.budget_id(), Some("b-1"));
    }

    #[test]
    fn test_unknown_format_is_rejected() {
        assert!(Args::try_parse_from(["budget", "--log-format", "xml", "init"]).is_err());
    }
}
