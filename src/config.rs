//! Configuration file handling.
//!
//! The configuration file is stored at `$BUDGET_HOME/config.json`. It names the entities to pull,
//! where each data layer lives and how patient to be with the upstream API. Credentials are not
//! part of the file, see [`Credentials`].

use crate::entity::{self, Entity};
use crate::error::Fatal;
use crate::{utils, Result};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::{Debug, Formatter};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

const APP_NAME: &str = "budget-pipeline";
const CONFIG_VERSION: u8 = 1;
const CONFIG_JSON: &str = "config.json";
const BASE_URL: &str = "https://api.ynab.com/v1/budgets";
const KNOWLEDGE_JSON: &str = "data/server_knowledge_cache.json";
const RAW: &str = "data/raw";
const PROCESSED: &str = "data/processed";
const BASE: &str = "data/base";
const WAREHOUSE: &str = "data/warehouse";
const MAX_RETRIES: u32 = 3;
const RETRY_DELAY_SECS: u64 = 5;
const TIMEOUT_SECS: u64 = 30;

/// The `Config` object represents the configuration of the app. You instantiate it by providing
/// the path to `$BUDGET_HOME` and from there it loads `$BUDGET_HOME/config.json`. All relative
/// paths in the file are resolved against `$BUDGET_HOME`.
#[derive(Debug, Clone)]
pub struct Config {
    root: PathBuf,
    config_path: PathBuf,
    config_file: ConfigFile,
    base_url: Url,
}

impl Config {
    /// Creates the home directory, if needed, and writes a default `config.json` into it. An
    /// existing `config.json` is left alone and loaded instead.
    pub async fn create(dir: impl Into<PathBuf>) -> Result<Self> {
        let maybe_relative = dir.into();
        utils::make_dir(&maybe_relative)
            .await
            .context("Unable to create the budget home directory")?;
        let root = utils::canonicalize(&maybe_relative).await?;
        let config_path = root.join(CONFIG_JSON);
        if !config_path.is_file() {
            ConfigFile::default().save(&config_path).await?;
        }
        Self::load(root).await
    }

    /// This will
    /// - validate that `budget_home` and its config file exist
    /// - load and validate the config file
    /// - return the loaded configuration object
    pub async fn load(budget_home: impl Into<PathBuf>) -> Result<Self> {
        let maybe_relative = budget_home.into();
        let config_path = maybe_relative.join(CONFIG_JSON);
        if !config_path.is_file() {
            return Err(Fatal::MissingConfig(config_path).into());
        }
        let root = utils::canonicalize(&maybe_relative).await?;
        let config_path = root.join(CONFIG_JSON);
        let config_file = ConfigFile::load(&config_path).await?;
        let base_url = config_file.validate()?;
        Ok(Self {
            root,
            config_path,
            config_file,
            base_url,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// The configured entities in fetch and consolidation order.
    pub fn entities(&self) -> &[Entity] {
        &self.config_file.entities
    }

    pub fn entity(&self, name: &str) -> Option<&Entity> {
        self.entities().iter().find(|e| e.name() == name)
    }

    pub fn knowledge_path(&self) -> PathBuf {
        self.resolve(&self.config_file.knowledge_path)
    }

    pub fn raw_path(&self) -> PathBuf {
        self.resolve(&self.config_file.raw_path)
    }

    pub fn processed_path(&self) -> PathBuf {
        self.resolve(&self.config_file.processed_path)
    }

    pub fn base_path(&self) -> PathBuf {
        self.resolve(&self.config_file.base_path)
    }

    pub fn warehouse_path(&self) -> PathBuf {
        self.resolve(&self.config_file.warehouse_path)
    }

    pub fn max_retries(&self) -> u32 {
        self.config_file.max_retries
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.config_file.retry_delay_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.config_file.timeout_secs)
    }

    /// Checks if `p` is relative, and if so, resolves it. Returns it unchanged if it is absolute.
    fn resolve(&self, p: &Path) -> PathBuf {
        if p.is_absolute() {
            return p.to_path_buf();
        }
        self.root.join(p)
    }

    #[cfg(test)]
    pub(crate) fn set_entities(&mut self, entities: Vec<Entity>) {
        self.config_file.entities = entities;
    }

    #[cfg(test)]
    pub(crate) fn set_retries(&mut self, max_retries: u32, retry_delay_secs: u64) {
        self.config_file.max_retries = max_retries;
        self.config_file.retry_delay_secs = retry_delay_secs;
    }
}

/// Represents the serialization and deserialization format of the configuration file.
///
/// Example configuration:
/// ```json
/// {
///   "app_name": "budget-pipeline",
///   "config_version": 1,
///   "base_url": "https://api.ynab.com/v1/budgets",
///   "entities": [
///     { "name": "accounts", "unique_id": "id" },
///     { "name": "categories", "unique_id": "id",
///       "groups": { "container": "category_groups", "children": "categories" } }
///   ],
///   "knowledge_path": "data/server_knowledge_cache.json",
///   "raw_path": "data/raw",
///   "processed_path": "data/processed",
///   "base_path": "data/base",
///   "warehouse_path": "data/warehouse",
///   "max_retries": 3,
///   "retry_delay_secs": 5,
///   "timeout_secs": 30
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
struct ConfigFile {
    /// Application name, should always be "budget-pipeline"
    app_name: String,

    /// Configuration file version
    config_version: u8,

    /// The budgets endpoint of the API, without a trailing budget id
    base_url: String,

    /// Entities in the order they are fetched and consolidated
    entities: Vec<Entity>,

    knowledge_path: PathBuf,
    raw_path: PathBuf,
    processed_path: PathBuf,
    base_path: PathBuf,
    warehouse_path: PathBuf,

    /// Attempts per request when the network fails, including the first one
    max_retries: u32,

    /// Seconds to wait between attempts
    retry_delay_secs: u64,

    /// Seconds before an HTTP request is abandoned
    #[serde(default = "default_timeout_secs")]
    timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    TIMEOUT_SECS
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            app_name: APP_NAME.to_string(),
            config_version: CONFIG_VERSION,
            base_url: BASE_URL.to_string(),
            entities: entity::defaults(),
            knowledge_path: PathBuf::from(KNOWLEDGE_JSON),
            raw_path: PathBuf::from(RAW),
            processed_path: PathBuf::from(PROCESSED),
            base_path: PathBuf::from(BASE),
            warehouse_path: PathBuf::from(WAREHOUSE),
            max_retries: MAX_RETRIES,
            retry_delay_secs: RETRY_DELAY_SECS,
            timeout_secs: TIMEOUT_SECS,
        }
    }
}

impl ConfigFile {
    /// Loads a ConfigFile from the specified path. Anything other than a readable, well-formed
    /// file is reported as [`Fatal::CorruptConfig`].
    async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = utils::read(path)
            .await
            .map_err(|e| Fatal::CorruptConfig(format!("{e:#}")))?;
        let config: ConfigFile = serde_json::from_str(&content).map_err(|e| {
            Fatal::CorruptConfig(format!("unable to parse '{}': {e}", path.display()))
        })?;
        Ok(config)
    }

    /// Saves the ConfigFile to the specified path.
    async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let p = path.as_ref();
        let data = serde_json::to_string_pretty(self).context("Unable to serialize config")?;
        utils::write(p, data)
            .await
            .context("Unable to write config file")
    }

    /// The single fail-fast validation step. Returns the parsed base URL.
    fn validate(&self) -> Result<Url> {
        let corrupt = |msg: String| -> crate::Error { Fatal::CorruptConfig(msg).into() };
        if self.app_name != APP_NAME {
            return Err(corrupt(format!(
                "invalid app_name: expected '{APP_NAME}', got '{}'",
                self.app_name
            )));
        }
        if self.entities.is_empty() {
            return Err(corrupt("no entities are configured".into()));
        }
        let mut names = HashSet::new();
        for entity in &self.entities {
            if entity.name().trim().is_empty() {
                return Err(corrupt("an entity has an empty name".into()));
            }
            if entity.unique_id().trim().is_empty() {
                return Err(corrupt(format!(
                    "entity '{}' has an empty unique_id",
                    entity.name()
                )));
            }
            if !names.insert(entity.name()) {
                return Err(corrupt(format!(
                    "entity '{}' is listed more than once",
                    entity.name()
                )));
            }
        }
        if self.max_retries == 0 {
            return Err(corrupt("max_retries must be at least 1".into()));
        }
        let url = Url::parse(&self.base_url)
            .map_err(|e| corrupt(format!("invalid base_url '{}': {e}", self.base_url)))?;
        if url.cannot_be_a_base() {
            return Err(corrupt(format!("invalid base_url '{}'", self.base_url)));
        }
        Ok(url)
    }
}

/// The API token and budget id. These come from the command line or the environment, never from
/// `config.json`, and are handed explicitly to whatever talks to the API.
#[derive(Clone)]
pub struct Credentials {
    token: String,
    budget_id: String,
}

impl Credentials {
    /// Returns [`Fatal::MissingCredentials`] if either value is absent or blank.
    pub fn new(token: Option<&str>, budget_id: Option<&str>) -> Result<Self> {
        let token = token
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(Fatal::MissingCredentials("API_TOKEN is not set"))?;
        let budget_id = budget_id
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(Fatal::MissingCredentials("BUDGET_ID is not set"))?;
        Ok(Self {
            token: token.to_string(),
            budget_id: budget_id.to_string(),
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn budget_id(&self) -> &str {
        &self.budget_id
    }
}

impl Debug for Credentials {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &"<redacted>")
            .field("budget_id", &self.budget_id)
            .finish()
    }
}
