//! The base consolidator: merges each entity's pending raw snapshot into its base table and
//! archives the snapshot.
//!
//! Per entity the work moves through load, flatten, merge, dedup, save and archive, in that order.
//! A failure while deduplicating or archiving stops the whole run. A failure at any other
//! [`Stage`] gives up on that entity and moves on.

use crate::base::BaseStore;
use crate::entity::Entity;
use crate::error::Fatal;
use crate::raw::{RawStore, Snapshot};
use crate::table::{self, Table};
use crate::{Config, Result};
use anyhow::Context;
use serde::Serialize;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Load,
    Flatten,
    Merge,
    Save,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConsolidateOutcome {
    /// The snapshot is part of the base table and has been archived.
    Merged {
        archived: PathBuf,
        incoming: usize,
        rows: usize,
    },
    /// The raw partition was empty.
    NothingPending,
    /// The snapshot had no records and was deleted.
    EmptySnapshot { snapshot: PathBuf },
    /// More than one unconsumed snapshot, which the fetcher never produces. Left for an operator.
    TooManySnapshots { count: usize },
    /// Given up at `stage`. The snapshot stays in the raw partition.
    Failed { stage: Stage, reason: String },
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct EntityConsolidation {
    pub entity: String,
    pub outcome: ConsolidateOutcome,
}

#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize)]
pub struct ConsolidateReport {
    pub entities: Vec<EntityConsolidation>,
}

impl ConsolidateReport {
    pub fn merged(&self) -> usize {
        self.count(|o| matches!(o, ConsolidateOutcome::Merged { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| {
            matches!(
                o,
                ConsolidateOutcome::Failed { .. } | ConsolidateOutcome::TooManySnapshots { .. }
            )
        })
    }

    fn count(&self, f: impl Fn(&ConsolidateOutcome) -> bool) -> usize {
        self.entities.iter().filter(|e| f(&e.outcome)).count()
    }
}

pub struct Consolidator<'a> {
    config: &'a Config,
    raw: RawStore,
    base: BaseStore,
}

impl<'a> Consolidator<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self {
            config,
            raw: RawStore::new(config.raw_path(), config.processed_path()),
            base: BaseStore::new(config.base_path()),
        }
    }

    /// Consolidates every configured entity, in order.
    ///
    /// # Errors
    /// - [`Fatal::DuplicateResolution`] if a merged table cannot be deduplicated.
    /// - [`Fatal::MissingUniqueId`] if a snapshot has records but no unique id column.
    /// - [`Fatal::ArchiveMove`] if a merged snapshot cannot be moved out of the raw partition.
    pub async fn run(&self) -> Result<ConsolidateReport> {
        let mut report = ConsolidateReport::default();
        for entity in self.config.entities() {
            let outcome = self.consolidate(entity).await?;
            if let ConsolidateOutcome::Failed { stage, reason } = &outcome {
                error!(
                    "Consolidation of {} failed at {stage:?}: {reason}",
                    entity.name()
                );
            }
            report.entities.push(EntityConsolidation {
                entity: entity.name().to_string(),
                outcome,
            });
        }
        Ok(report)
    }

    async fn consolidate(&self, entity: &Entity) -> Result<ConsolidateOutcome> {
        let name = entity.name();
        let pending = self.raw.pending(name).await?;
        let path = match pending.as_slice() {
            [] => {
                debug!("No raw data for {name}");
                return Ok(ConsolidateOutcome::NothingPending);
            }
            [path] => path.clone(),
            _ => {
                warn!(
                    "{} unconsumed snapshots for {name}, expected one. Skipping {name} until the \
                    raw folder is cleaned up",
                    pending.len()
                );
                return Ok(ConsolidateOutcome::TooManySnapshots {
                    count: pending.len(),
                });
            }
        };

        // Load
        let loaded = match Snapshot::from_path(name, &path) {
            Ok(snapshot) => snapshot.load().await.map(|payload| (snapshot, payload)),
            Err(e) => Err(e),
        };
        let (snapshot, payload) = match loaded {
            Ok(loaded) => loaded,
            Err(e) => return Ok(failed(Stage::Load, e)),
        };
        info!("Consolidating {name} from {}", snapshot.file_name());

        // Flatten
        if table::is_empty_payload(entity, &payload) {
            info!("No records in {}, deleting it", snapshot.file_name());
            if let Err(e) = self.raw.discard(&snapshot).await {
                return Ok(failed(Stage::Flatten, e));
            }
            return Ok(ConsolidateOutcome::EmptySnapshot { snapshot: path });
        }
        let incoming = table::from_snapshot(entity, &payload, snapshot.fetched_at());
        if !incoming.has_column(entity.unique_id()) {
            return Err(Fatal::MissingUniqueId {
                entity: name.to_string(),
                column: entity.unique_id().to_string(),
            }
            .into());
        }
        let incoming_rows = incoming.len();

        // Merge
        let existing = match self.base.load(name).await {
            Ok(existing) => existing.unwrap_or_default(),
            Err(e) => return Ok(failed(Stage::Merge, e)),
        };
        let merged = existing.union(incoming);

        // Dedup
        let deduped: Table = merged.deduplicate(name, entity.unique_id())?;
        debug!(
            "{name}: {incoming_rows} incoming rows, {} rows after deduplication",
            deduped.len()
        );

        // Save
        let saved = match self.base.save(name, entity.unique_id(), &deduped).await {
            Ok(saved) => saved,
            Err(e) => return Ok(failed(Stage::Save, e)),
        };
        info!("Saved {} rows to {}", deduped.len(), saved.display());

        // Archive
        let archived = self
            .raw
            .archive(&snapshot)
            .await
            .with_context(|| Fatal::ArchiveMove {
                entity: name.to_string(),
                path: snapshot.path().to_path_buf(),
            })?;
        info!("Archived {name} snapshot to {}", archived.display());

        Ok(ConsolidateOutcome::Merged {
            archived,
            incoming: incoming_rows,
            rows: deduped.len(),
        })
    }
}

fn failed(stage: Stage, e: crate::Error) -> ConsolidateOutcome {
    ConsolidateOutcome::Failed {
        stage,
        reason: format!("{e:#}"),
    }
}
