//! The entity fetcher: pulls each entity's changes since its cached cursor, writes them to the raw
//! store, and only then advances the cursor.

use crate::api::{Budget, Reply};
use crate::entity::Entity;
use crate::error::Fatal;
use crate::knowledge::{Cursor, Cursors, KnowledgeCache};
use crate::raw::RawStore;
use crate::{Config, Result};
use anyhow::{bail, Context};
use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

/// The field in the response `data` object that carries the new cursor.
pub const SERVER_KNOWLEDGE: &str = "server_knowledge";

/// Warn once fewer than this many requests remain in the rate-limit window.
pub const LOW_REQUEST_BUDGET: i64 = 20;

/// What happened to one entity during a fetch run.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FetchOutcome {
    /// New data was written to `snapshot` and the cursor advanced to `cursor`.
    Saved { snapshot: PathBuf, cursor: Cursor },
    /// The server knowledge did not move, nothing was written.
    Unchanged { cursor: Cursor },
    /// The response could not be written to the raw store. The cursor was left alone so the
    /// same delta is fetched again next run.
    WriteFailed { reason: String },
    /// A rate-limit or server error response, nothing was written.
    Abandoned { status: u16 },
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct EntityFetch {
    pub entity: String,
    pub outcome: FetchOutcome,
}

/// Why the fetcher stopped before reaching the last entity.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Halt {
    /// The entity still has an unconsumed snapshot, so consolidation fell behind.
    PendingSnapshot { entity: String },
    /// The API answered 429.
    RateLimited { entity: String },
    /// The API answered with a 5xx status.
    ServerError { entity: String, status: u16 },
    /// The rate-limit header says only one request is left.
    RequestBudgetSpent { entity: String },
}

impl Display for Halt {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Halt::PendingSnapshot { entity } => {
                write!(f, "{entity} still has an unconsumed snapshot")
            }
            Halt::RateLimited { entity } => write!(f, "rate limited while fetching {entity}"),
            Halt::ServerError { entity, status } => {
                write!(f, "server error {status} while fetching {entity}")
            }
            Halt::RequestBudgetSpent { entity } => {
                write!(f, "request budget spent after fetching {entity}")
            }
        }
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize)]
pub struct FetchReport {
    pub entities: Vec<EntityFetch>,
    pub halt: Option<Halt>,
}

impl FetchReport {
    /// The number of entities that produced a new snapshot.
    pub fn saved(&self) -> usize {
        self.entities
            .iter()
            .filter(|e| matches!(e.outcome, FetchOutcome::Saved { .. }))
            .count()
    }
}

/// How a response status is handled.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum Status {
    Success,
    /// Configuration or credential problems. Retrying will not help.
    Rejected,
    RateLimited,
    ServerError,
    Unexpected,
}

pub(crate) fn classify(status: u16) -> Status {
    match status {
        200..=299 => Status::Success,
        400 | 401 | 403 | 404 | 409 => Status::Rejected,
        429 => Status::RateLimited,
        500..=599 => Status::ServerError,
        _ => Status::Unexpected,
    }
}

fn describe(status: u16) -> &'static str {
    match status {
        400 => "Bad request. The request could not be understood by the API due to malformed \
            syntax or validation errors.",
        401 => "Unauthorized. Please check your API token.",
        403 => "Forbidden. Access is denied.",
        404 => "Not found. The specified URI does not exist.",
        409 => "Conflict. The resource cannot be saved due to a conflict.",
        429 => "Too many requests. You have made too many requests in a short amount of time.",
        500 => "Internal server error. The API experienced an unexpected error.",
        503 => "Service unavailable. The API is temporarily disabled or a request timed out.",
        _ => "Unexpected response status.",
    }
}

/// The parsed `X-Rate-Limit` header, `"<used>/<limit>"`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) struct RateLimit {
    remaining: i64,
    limit: i64,
}

impl RateLimit {
    /// `None` unless both numbers parse and `limit - used` does not overflow.
    pub(crate) fn parse(header: &str) -> Option<Self> {
        let (used, limit) = header.split_once('/')?;
        let used: i64 = used.trim().parse().ok()?;
        let limit: i64 = limit.trim().parse().ok()?;
        Some(Self {
            remaining: limit.checked_sub(used)?,
            limit,
        })
    }

    pub(crate) fn remaining(&self) -> i64 {
        self.remaining
    }
}

/// Logs the request budget. Returns true when exactly one request is left and fetching must stop.
fn request_budget_spent(header: Option<&str>) -> bool {
    let Some(header) = header else {
        warn!("The rate limit header is missing");
        return false;
    };
    let Some(rate_limit) = RateLimit::parse(header) else {
        warn!("Unable to parse the rate limit header '{header}'");
        return false;
    };
    let remaining = rate_limit.remaining();
    info!(
        "Rate limit: {remaining}/{} requests remaining",
        rate_limit.limit
    );
    if remaining < LOW_REQUEST_BUDGET {
        warn!("Approaching the rate limit, consider pausing further requests");
    }
    if remaining == 1 {
        error!("Rate limit reached, ending requests here and moving on with what we have");
        return true;
    }
    false
}

#[derive(Deserialize)]
struct Envelope {
    data: Map<String, Value>,
}

/// Runs one fetch pass over the configured entities, strictly in order.
pub struct Fetcher<'a> {
    config: &'a Config,
    client: &'a mut (dyn Budget + Send),
    knowledge: KnowledgeCache,
    raw: RawStore,
    cursors: Cursors,
    clock: fn() -> NaiveDateTime,
}

impl<'a> Fetcher<'a> {
    /// Reads the knowledge cache. A corrupt cache fails here, before any request is made.
    pub async fn new(config: &'a Config, client: &'a mut (dyn Budget + Send)) -> Result<Self> {
        let knowledge = KnowledgeCache::new(config.knowledge_path());
        let cursors = knowledge.load().await?;
        Ok(Self {
            config,
            client,
            knowledge,
            raw: RawStore::new(config.raw_path(), config.processed_path()),
            cursors,
            clock: now,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_clock(mut self, clock: fn() -> NaiveDateTime) -> Self {
        self.clock = clock;
        self
    }

    /// Fetches every entity until one of them signals a halt.
    ///
    /// # Errors
    /// - [`Fatal::Rejected`] for 400, 401, 403, 404 and 409 responses.
    /// - [`Fatal::RetriesExhausted`] when the network keeps failing.
    /// - Any other status outside of 2xx, 429 and 5xx, or an unreadable 2xx body.
    pub async fn run(mut self) -> Result<FetchReport> {
        let mut report = FetchReport::default();
        let config = self.config;
        for entity in config.entities() {
            let name = entity.name();
            if self.raw.has_pending(name).await? {
                warn!(
                    "Raw data exists for {name}, processing the raw data we already have before \
                    fetching anything else"
                );
                report.halt = Some(Halt::PendingSnapshot {
                    entity: name.to_string(),
                });
                break;
            }
            let (outcome, halt) = self.fetch_entity(entity).await?;
            report.entities.push(EntityFetch {
                entity: name.to_string(),
                outcome,
            });
            if halt.is_some() {
                report.halt = halt;
                break;
            }
        }
        Ok(report)
    }

    async fn fetch_entity(&mut self, entity: &Entity) -> Result<(FetchOutcome, Option<Halt>)> {
        let name = entity.name();
        let cursor = self.cursors.get(name).cloned().unwrap_or_default();
        info!("Fetching {name} data since last knowledge: {cursor}");
        let reply = self.send(name, &cursor).await?;

        let (outcome, mut halt) = match classify(reply.status) {
            Status::Success => (self.record(name, &cursor, &reply.body).await?, None),
            Status::Rejected => {
                error!("{}", describe(reply.status));
                return Err(Fatal::Rejected {
                    entity: name.to_string(),
                    status: reply.status,
                }
                .into());
            }
            Status::RateLimited => {
                error!("{}", describe(reply.status));
                (
                    FetchOutcome::Abandoned {
                        status: reply.status,
                    },
                    Some(Halt::RateLimited {
                        entity: name.to_string(),
                    }),
                )
            }
            Status::ServerError => {
                error!("{} (status {})", describe(reply.status), reply.status);
                (
                    FetchOutcome::Abandoned {
                        status: reply.status,
                    },
                    Some(Halt::ServerError {
                        entity: name.to_string(),
                        status: reply.status,
                    }),
                )
            }
            Status::Unexpected => {
                bail!(
                    "Unexpected status {} fetching {name}: {}",
                    reply.status,
                    reply.body
                )
            }
        };

        if request_budget_spent(reply.rate_limit.as_deref()) && halt.is_none() {
            halt = Some(Halt::RequestBudgetSpent {
                entity: name.to_string(),
            });
        }
        Ok((outcome, halt))
    }

    /// Sends the request, retrying transport failures with a fixed delay.
    async fn send(&mut self, name: &str, cursor: &Cursor) -> Result<Reply> {
        let attempts = self.config.max_retries();
        let mut attempt = 1;
        loop {
            match self.client.get(name, cursor).await {
                Ok(reply) => return Ok(reply),
                Err(e) if attempt >= attempts => {
                    error!("Error fetching {name} data (attempt {attempt}/{attempts}): {e:#}");
                    error!("Max retries reached");
                    return Err(e.context(Fatal::RetriesExhausted {
                        entity: name.to_string(),
                        attempts,
                    }));
                }
                Err(e) => {
                    error!("Error fetching {name} data (attempt {attempt}/{attempts}): {e:#}");
                    tokio::time::sleep(self.config.retry_delay()).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Writes new data to the raw store and then advances the cursor. The cursor is never
    /// advanced unless the snapshot is on disk.
    async fn record(&mut self, name: &str, cursor: &Cursor, body: &str) -> Result<FetchOutcome> {
        let Envelope { mut data } = serde_json::from_str(body)
            .with_context(|| format!("Unable to parse the {name} response"))?;
        let knowledge = match data.remove(SERVER_KNOWLEDGE) {
            None | Some(Value::Null) => None,
            Some(v) => Some(
                serde_json::from_value::<Cursor>(v)
                    .with_context(|| format!("Unusable server knowledge for {name}"))?,
            ),
        };
        debug!("{name} new server knowledge: {knowledge:?}");

        let Some(knowledge) = knowledge.filter(|k| k != cursor) else {
            info!("No new data for {name}, skipping cache update");
            return Ok(FetchOutcome::Unchanged {
                cursor: cursor.clone(),
            });
        };

        let snapshot = match self
            .raw
            .write(name, &Value::Object(data), (self.clock)())
            .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!("{e:#}");
                return Ok(FetchOutcome::WriteFailed {
                    reason: format!("{e:#}"),
                });
            }
        };

        self.knowledge.update(name, &knowledge).await?;
        info!("Advanced {name} server knowledge from {cursor} to {knowledge}");
        self.cursors.insert(name.to_string(), knowledge.clone());
        Ok(FetchOutcome::Saved {
            snapshot: snapshot.path().to_path_buf(),
            cursor: knowledge,
        })
    }
}

fn now() -> NaiveDateTime {
    Local::now().naive_local()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::TestBudget;
    use crate::entity::{ACCOUNTS, CATEGORIES, PAYEES};
    use crate::error;
    use crate::test::TestEnv;
    use crate::utils;
    use serde_json::json;
    use std::time::Duration;

    fn accounts_reply(knowledge: i64) -> Value {
        json!({"accounts": [{"id": "a1", "balance": 500}], "server_knowledge": knowledge})
    }

    fn fixed() -> NaiveDateTime {
        chrono::NaiveDate::from_ymd_opt(2025, 3, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn ok(data: Value, rate_limit: &str) -> Reply {
        Reply::new(200, Some(rate_limit), json!({ "data": data }).to_string())
    }

    async fn fetch(env: &TestEnv, client: &mut TestBudget) -> Result<FetchReport> {
        let config = env.config();
        Fetcher::new(&config, client).await?.run().await
    }

    #[tokio::test]
    async fn test_first_fetch_writes_snapshot_then_cursor() {
        let env = TestEnv::with_entities(&[ACCOUNTS]).await;
        let mut client = TestBudget::empty();
        client.push(ACCOUNTS, Ok(ok(accounts_reply(42), "10/200")));

        let report = fetch(&env, &mut client).await.unwrap();

        assert_eq!(report.saved(), 1);
        assert!(report.halt.is_none());
        assert_eq!(client.calls(), &[(ACCOUNTS.to_string(), Cursor::from(0))]);

        let pending = env.raw().pending(ACCOUNTS).await.unwrap();
        assert_eq!(pending.len(), 1);
        let saved: Value = utils::deserialize(&pending[0]).await.unwrap();
        assert_eq!(saved, json!({"accounts": [{"id": "a1", "balance": 500}]}));

        let cursors = env.knowledge().load().await.unwrap();
        assert_eq!(cursors[ACCOUNTS], Cursor::from(42));
    }

    #[tokio::test]
    async fn test_fetch_is_idempotent_without_new_data() {
        let env = TestEnv::with_entities(&[ACCOUNTS]).await;
        env.knowledge()
            .update(ACCOUNTS, &Cursor::from(42))
            .await
            .unwrap();
        let mut client = TestBudget::empty();
        client.push(
            ACCOUNTS,
            Ok(ok(json!({"accounts": [], "server_knowledge": 42}), "11/200")),
        );
        let before = utils::read(env.knowledge().path()).await.unwrap();

        let report = fetch(&env, &mut client).await.unwrap();

        assert_eq!(
            report.entities[0].outcome,
            FetchOutcome::Unchanged {
                cursor: Cursor::from(42)
            }
        );
        assert_eq!(client.calls(), &[(ACCOUNTS.to_string(), Cursor::from(42))]);
        assert!(env.raw().pending(ACCOUNTS).await.unwrap().is_empty());
        assert_eq!(utils::read(env.knowledge().path()).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_unconsumed_snapshot_halts_and_refetches_after_archive() {
        // A previous run wrote the snapshot and died before saving the cursor.
        let env = TestEnv::with_entities(&[ACCOUNTS, PAYEES]).await;
        let snapshot = env
            .raw()
            .write(ACCOUNTS, &json!({"accounts": []}), fixed())
            .await
            .unwrap();
        let mut client = TestBudget::empty();

        let report = fetch(&env, &mut client).await.unwrap();

        assert_eq!(
            report.halt,
            Some(Halt::PendingSnapshot {
                entity: ACCOUNTS.into()
            })
        );
        assert!(client.calls().is_empty());

        env.raw().archive(&snapshot).await.unwrap();
        client.push(ACCOUNTS, Ok(ok(accounts_reply(42), "12/200")));
        client.push(
            PAYEES,
            Ok(ok(json!({"payees": [], "server_knowledge": 0}), "13/200")),
        );

        let report = fetch(&env, &mut client).await.unwrap();

        assert!(report.halt.is_none());
        assert_eq!(client.calls()[0], (ACCOUNTS.to_string(), Cursor::from(0)));
        assert_eq!(report.saved(), 1);
    }

    #[tokio::test]
    async fn test_pending_snapshot_stops_remaining_entities() {
        let env = TestEnv::with_entities(&[ACCOUNTS, CATEGORIES, PAYEES]).await;
        env.raw()
            .write(CATEGORIES, &json!({"category_groups": []}), now())
            .await
            .unwrap();
        let mut client = TestBudget::empty();
        client.push(ACCOUNTS, Ok(ok(accounts_reply(5), "1/200")));

        let report = fetch(&env, &mut client).await.unwrap();

        assert_eq!(report.entities.len(), 1);
        assert_eq!(
            report.halt,
            Some(Halt::PendingSnapshot {
                entity: CATEGORIES.into()
            })
        );
        assert_eq!(client.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_write_failure_leaves_cursor_and_continues() {
        let env = TestEnv::with_entities(&[ACCOUNTS, PAYEES]).await;
        // A directory squatting on the snapshot name makes the raw write fail.
        utils::make_dir(&env.raw().partition(ACCOUNTS).join("20250301120000.json"))
            .await
            .unwrap();
        let mut client = TestBudget::empty();
        client.push(ACCOUNTS, Ok(ok(accounts_reply(42), "1/200")));
        client.push(
            PAYEES,
            Ok(ok(
                json!({"payees": [{"id": "p1"}], "server_knowledge": 7}),
                "2/200",
            )),
        );
        let config = env.config();

        let report = Fetcher::new(&config, &mut client)
            .await
            .unwrap()
            .with_clock(fixed)
            .run()
            .await
            .unwrap();

        assert!(matches!(
            report.entities[0].outcome,
            FetchOutcome::WriteFailed { .. }
        ));
        assert!(matches!(
            report.entities[1].outcome,
            FetchOutcome::Saved { .. }
        ));
        let cursors = env.knowledge().load().await.unwrap();
        assert!(!cursors.contains_key(ACCOUNTS));
        assert_eq!(cursors[PAYEES], Cursor::from(7));
    }

    #[tokio::test]
    async fn test_client_error_is_fatal() {
        let env = TestEnv::with_entities(&[ACCOUNTS]).await;
        let mut client = TestBudget::empty();
        client.push(ACCOUNTS, Ok(Reply::new(401, Some("1/200"), "{}")));

        let err = fetch(&env, &mut client).await.unwrap_err();

        assert_eq!(error::exit_code(&err), 11);
        assert!(env.knowledge().load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rate_limited_response_halts_without_writing() {
        let env = TestEnv::with_entities(&[ACCOUNTS, PAYEES]).await;
        let mut client = TestBudget::empty();
        client.push(ACCOUNTS, Ok(Reply::new(429, Some("200/200"), "{}")));

        let report = fetch(&env, &mut client).await.unwrap();

        assert_eq!(
            report.halt,
            Some(Halt::RateLimited {
                entity: ACCOUNTS.into()
            })
        );
        assert_eq!(client.calls().len(), 1);
        assert!(env.raw().pending(ACCOUNTS).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_server_error_halts() {
        let env = TestEnv::with_entities(&[ACCOUNTS, PAYEES]).await;
        let mut client = TestBudget::empty();
        client.push(ACCOUNTS, Ok(Reply::new(503, None, "")));

        let report = fetch(&env, &mut client).await.unwrap();

        assert_eq!(
            report.halt,
            Some(Halt::ServerError {
                entity: ACCOUNTS.into(),
                status: 503
            })
        );
    }

    #[tokio::test]
    async fn test_unexpected_status_is_unclassified_error() {
        let env = TestEnv::with_entities(&[ACCOUNTS]).await;
        let mut client = TestBudget::empty();
        client.push(ACCOUNTS, Ok(Reply::new(302, None, "")));

        let err = fetch(&env, &mut client).await.unwrap_err();
        assert_eq!(error::exit_code(&err), error::UNCLASSIFIED);
    }

    #[tokio::test]
    async fn test_transport_failures_are_retried() {
        let env = TestEnv::with_entities(&[ACCOUNTS]).await;
        let mut client = TestBudget::empty();
        client
            .push(ACCOUNTS, Err("connection refused".into()))
            .push(ACCOUNTS, Err("connection reset".into()))
            .push(ACCOUNTS, Ok(ok(accounts_reply(3), "1/200")));

        let report = fetch(&env, &mut client).await.unwrap();

        assert_eq!(report.saved(), 1);
        assert_eq!(client.calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_wait_the_configured_delay() {
        let env = TestEnv::with_entities(&[ACCOUNTS]).await;
        let mut config = env.config();
        config.set_retries(3, 5);
        let mut client = TestBudget::empty();
        client
            .push(ACCOUNTS, Err("connection refused".into()))
            .push(ACCOUNTS, Err("connection reset".into()))
            .push(ACCOUNTS, Ok(ok(accounts_reply(3), "1/200")));

        let started = tokio::time::Instant::now();
        let report = Fetcher::new(&config, &mut client)
            .await
            .unwrap()
            .run()
            .await
            .unwrap();

        assert_eq!(report.saved(), 1);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(10), "waited {waited:?}");
        assert!(waited < Duration::from_secs(11), "waited {waited:?}");
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_fatal() {
        let env = TestEnv::with_entities(&[ACCOUNTS]).await;
        let mut client = TestBudget::empty();
        for _ in 0..3 {
            client.push(ACCOUNTS, Err("connection refused".into()));
        }

        let err = fetch(&env, &mut client).await.unwrap_err();

        assert_eq!(error::exit_code(&err), 20);
        assert!(format!("{err:#}").contains("connection refused"));
    }

    #[tokio::test]
    async fn test_last_request_in_budget_halts_after_saving() {
        let env = TestEnv::with_entities(&[ACCOUNTS, PAYEES]).await;
        let mut client = TestBudget::empty();
        client.push(ACCOUNTS, Ok(ok(accounts_reply(42), "199/200")));

        let report = fetch(&env, &mut client).await.unwrap();

        assert_eq!(report.saved(), 1);
        assert_eq!(
            report.halt,
            Some(Halt::RequestBudgetSpent {
                entity: ACCOUNTS.into()
            })
        );
        assert_eq!(client.calls().len(), 1);
    }

    #[test]
    fn test_rate_limit_parse() {
        let rate_limit = RateLimit::parse("36/200").unwrap();
        assert_eq!(rate_limit.remaining(), 164);
        assert_eq!(RateLimit::parse(" 199 / 200 ").unwrap().remaining(), 1);
        assert!(RateLimit::parse("36").is_none());
        assert!(RateLimit::parse("a/b").is_none());
        assert!(RateLimit::parse("-9223372036854775808/9223372036854775807").is_none());
        assert!(RateLimit::parse("1/-9223372036854775808").is_none());
    }

    #[test]
    fn test_request_budget_spent() {
        assert!(request_budget_spent(Some("199/200")));
        assert!(!request_budget_spent(Some("190/200")));
        assert!(!request_budget_spent(Some("200/200")));
        assert!(!request_budget_spent(None));
        assert!(!request_budget_spent(Some("garbage")));
        assert!(!request_budget_spent(Some(
            "-9223372036854775808/9223372036854775807"
        )));
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(200), Status::Success);
        assert_eq!(classify(409), Status::Rejected);
        assert_eq!(classify(422), Status::Unexpected);
        assert_eq!(classify(429), Status::RateLimited);
        assert_eq!(classify(502), Status::ServerError);
        assert_eq!(classify(301), Status::Unexpected);
    }
}
