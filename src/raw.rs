//! The raw store and the processed archive.
//!
//! ```text
//! raw/<entity>/<YYYYMMDDHHMMSS>.json        written by the fetcher, at most one per entity
//! processed/<entity>/<YYYYMMDDHHMMSS>.json  moved here once merged into the base table
//! ```

use crate::{utils, Result};
use anyhow::{bail, Context};
use chrono::NaiveDateTime;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// How the fetch instant is encoded in a snapshot's file name.
pub const SNAPSHOT_FORMAT: &str = "%Y%m%d%H%M%S";

const EXTENSION: &str = "json";

/// One immutable fetch result for one entity.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Snapshot {
    entity: String,
    path: PathBuf,
    fetched_at: NaiveDateTime,
}

impl Snapshot {
    /// Recovers the fetch instant from a path like `raw/accounts/20240131120000.json`.
    pub fn from_path(entity: &str, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .with_context(|| format!("'{}' has no file name", path.display()))?;
        let fetched_at = NaiveDateTime::parse_from_str(&stem, SNAPSHOT_FORMAT).with_context(|| {
            format!(
                "'{}' is not named like a snapshot ({SNAPSHOT_FORMAT}.json)",
                path.display()
            )
        })?;
        Ok(Self {
            entity: entity.to_string(),
            path,
            fetched_at,
        })
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| file_name(self.fetched_at))
    }

    /// The provenance stamped onto every record in this snapshot.
    pub fn fetched_at(&self) -> NaiveDateTime {
        self.fetched_at
    }

    /// Parses the snapshot file.
    pub async fn load(&self) -> Result<Value> {
        utils::deserialize(&self.path).await
    }
}

fn file_name(fetched_at: NaiveDateTime) -> String {
    format!("{}.{EXTENSION}", fetched_at.format(SNAPSHOT_FORMAT))
}

#[derive(Debug, Clone)]
pub struct RawStore {
    raw: PathBuf,
    processed: PathBuf,
}

impl RawStore {
    pub fn new(raw: impl Into<PathBuf>, processed: impl Into<PathBuf>) -> Self {
        Self {
            raw: raw.into(),
            processed: processed.into(),
        }
    }

    /// The raw partition for `entity`.
    pub fn partition(&self, entity: &str) -> PathBuf {
        self.raw.join(entity)
    }

    /// The archive directory for `entity`.
    pub fn archive_dir(&self, entity: &str) -> PathBuf {
        self.processed.join(entity)
    }

    /// Writes `data` as a new snapshot for `entity`, creating the partition if needed. The file
    /// only appears under its final name once it is completely written. Fails if the name is
    /// already taken in the raw partition or in the archive.
    pub async fn write(
        &self,
        entity: &str,
        data: &Value,
        fetched_at: NaiveDateTime,
    ) -> Result<Snapshot> {
        let name = file_name(fetched_at);
        let path = self.partition(entity).join(&name);
        if path.exists() {
            bail!("A snapshot already exists at {}", path.display());
        }
        let archived = self.archive_dir(entity).join(&name);
        if archived.exists() {
            bail!(
                "A snapshot for the same instant was already archived at {}",
                archived.display()
            );
        }
        info!("Saving {entity} data to {}", path.display());
        let json = serde_json::to_string_pretty(data)
            .with_context(|| format!("Unable to serialize the {entity} data"))?;
        utils::write_atomic(&path, json)
            .await
            .with_context(|| format!("Error saving {entity} data"))?;
        Ok(Snapshot {
            entity: entity.to_string(),
            path,
            fetched_at,
        })
    }

    /// Every unconsumed snapshot file for `entity`, oldest first.
    pub async fn pending(&self, entity: &str) -> Result<Vec<PathBuf>> {
        utils::list_files(&self.partition(entity), EXTENSION).await
    }

    pub async fn has_pending(&self, entity: &str) -> Result<bool> {
        Ok(!self.pending(entity).await?.is_empty())
    }

    /// Moves a consumed snapshot into the processed archive under the same file name. The archive
    /// is append-only: an existing archived file is never replaced.
    pub async fn archive(&self, snapshot: &Snapshot) -> Result<PathBuf> {
        let dir = self.archive_dir(snapshot.entity());
        utils::make_dir(&dir).await?;
        let destination = dir.join(snapshot.file_name());
        if destination.exists() {
            bail!(
                "Refusing to replace the archived snapshot at {}",
                destination.display()
            );
        }
        debug!(
            "Moving {} to {}",
            snapshot.path().display(),
            destination.display()
        );
        utils::rename(snapshot.path(), &destination).await?;
        Ok(destination)
    }

    /// Deletes a snapshot that will never be consumed.
    pub async fn discard(&self, snapshot: &Snapshot) -> Result<()> {
        utils::remove(snapshot.path()).await
    }
}
