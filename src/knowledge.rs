//! The knowledge cache: one durable mapping of entity name to the server knowledge cursor it was
//! last synchronized to.

use crate::error::Fatal;
use crate::{utils, Result};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// An opaque synchronization token handed out by the API. It is usually an integer, but strings
/// are passed through untouched.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cursor {
    Number(i64),
    Text(String),
}

impl Default for Cursor {
    /// Asks for everything.
    fn default() -> Self {
        Cursor::Number(0)
    }
}

impl Display for Cursor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Cursor::Number(n) => write!(f, "{n}"),
            Cursor::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for Cursor {
    fn from(value: i64) -> Self {
        Cursor::Number(value)
    }
}

pub type Cursors = BTreeMap<String, Cursor>;

/// Reads and writes the cursor file. The whole mapping is rewritten on every update.
#[derive(Debug, Clone)]
pub struct KnowledgeCache {
    path: PathBuf,
}

impl KnowledgeCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the persisted cursors, or an empty mapping if nothing has been persisted yet. A
    /// file that exists but cannot be parsed is [`Fatal::CorruptKnowledge`].
    pub async fn load(&self) -> Result<Cursors> {
        let Some(content) = utils::read_if_exists(&self.path).await? else {
            debug!(
                "No knowledge cache at {}, starting from scratch",
                self.path.display()
            );
            return Ok(Cursors::new());
        };
        serde_json::from_str(&content)
            .map_err(|e| anyhow::Error::new(e).context(Fatal::CorruptKnowledge(self.path.clone())))
    }

    /// Sets `entity` to `cursor` in the persisted mapping, leaving all other entries untouched.
    /// Creates the containing directory on first write.
    pub async fn update(&self, entity: &str, cursor: &Cursor) -> Result<()> {
        let mut cursors = self.load().await?;
        if cursors.is_empty() && !self.path.is_file() {
            info!(
                "Creating the knowledge cache at {}, this is normal for the first run",
                self.path.display()
            );
        }
        cursors.insert(entity.to_string(), cursor.clone());
        let json =
            serde_json::to_string_pretty(&cursors).context("Unable to serialize the cursors")?;
        utils::write_atomic(&self.path, json)
            .await
            .with_context(|| format!("Unable to save the cursor for '{entity}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_load_missing_is_empty() {
        let dir = TempDir::new().unwrap();
        let cache = KnowledgeCache::new(dir.path().join("knowledge.json"));
        assert!(cache.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_creates_directory_and_keeps_other_entries() {
        let dir = TempDir::new().unwrap();
        let cache = KnowledgeCache::new(dir.path().join("data").join("knowledge.json"));

        cache.update("accounts", &Cursor::from(42)).await.unwrap();
        cache
            .update("payees", &Cursor::Text("abc".into()))
            .await
            .unwrap();
        cache.update("accounts", &Cursor::from(43)).await.unwrap();

        let cursors = cache.load().await.unwrap();
        assert_eq!(cursors.len(), 2);
        assert_eq!(cursors["accounts"], Cursor::Number(43));
        assert_eq!(cursors["payees"], Cursor::Text("abc".into()));

        let raw: serde_json::Value =
            serde_json::from_str(&utils::read(cache.path()).await.unwrap()).unwrap();
        assert_eq!(raw, serde_json::json!({"accounts": 43, "payees": "abc"}));
    }

    #[tokio::test]
    async fn test_corrupt_cache_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("knowledge.json");
        utils::write(&path, "{\"accounts\": ").await.unwrap();
        let cache = KnowledgeCache::new(&path);

        let err = cache.load().await.unwrap_err();
        assert_eq!(error::exit_code(&err), 5);

        // An update must not paper over the corruption either.
        let err = cache.update("accounts", &Cursor::from(1)).await.unwrap_err();
        assert_eq!(error::exit_code(&err), 5);
        assert_eq!(utils::read(&path).await.unwrap(), "{\"accounts\": ");
    }

    #[test]
    fn test_cursor_display() {
        assert_eq!(Cursor::default().to_string(), "0");
        assert_eq!(Cursor::Text("x1".into()).to_string(), "x1");
    }
}
