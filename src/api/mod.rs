//! The seam between the pipeline and the upstream budgeting API.

mod budget_client;
mod budget_test_client;

use crate::knowledge::Cursor;
use crate::{Config, Credentials, Result};

pub(crate) use budget_client::HttpBudget;
pub(crate) use budget_test_client::TestBudget;

/// The response header carrying `"<requests used>/<limit>"`.
pub const RATE_LIMIT_HEADER: &str = "X-Rate-Limit";

/// The query parameter that asks for records changed since a cursor.
pub const KNOWLEDGE_PARAM: &str = "last_knowledge_of_server";

const TEST_MODE_ENV: &str = "BUDGET_PIPELINE_TEST_MODE";

/// What came back from one request, whatever the status.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Reply {
    pub status: u16,
    pub rate_limit: Option<String>,
    pub body: String,
}

impl Reply {
    pub fn new(status: u16, rate_limit: Option<&str>, body: impl Into<String>) -> Self {
        Self {
            status,
            rate_limit: rate_limit.map(str::to_string),
            body: body.into(),
        }
    }
}

/// Fetches one entity's changes since `cursor`.
///
/// An `Err` means the request never produced a response (connection refused, timeout, a body
/// that could not be read). Those are the only failures worth retrying. Every HTTP status,
/// including errors, is an `Ok(Reply)`.
#[async_trait::async_trait]
pub trait Budget {
    async fn get(&mut self, entity: &str, cursor: &Cursor) -> Result<Reply>;
}

/// Whether to talk to the real API or to the seeded in-memory client.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub enum Mode {
    #[default]
    Http,
    Test,
}

impl Mode {
    /// `Mode::Test` when `BUDGET_PIPELINE_TEST_MODE` is set to something non-empty.
    pub fn from_env() -> Self {
        match std::env::var(TEST_MODE_ENV) {
            Ok(s) if !s.is_empty() => Mode::Test,
            _ => Mode::Http,
        }
    }
}

/// Builds the client for `mode`.
pub fn budget(
    config: &Config,
    credentials: &Credentials,
    mode: Mode,
) -> Result<Box<dyn Budget + Send>> {
    Ok(match mode {
        Mode::Http => Box::new(HttpBudget::new(config, credentials)?),
        Mode::Test => Box::new(TestBudget::default()),
    })
}
