//! Runs the stages in order: fetch, consolidate, warehouse.

use crate::api::Budget;
use crate::consolidate::{ConsolidateReport, Consolidator};
use crate::fetch::{FetchReport, Fetcher};
use crate::warehouse::{self, WarehouseReport};
use crate::{Config, Result};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct PipelineReport {
    pub fetch: FetchReport,
    pub consolidate: ConsolidateReport,
    pub warehouse: WarehouseReport,
}

/// Runs the whole pipeline once.
///
/// Consolidation runs even when fetching stopped early, so whatever was fetched before a rate
/// limit or server error still reaches the base tables. A fatal error in any stage ends the run.
pub async fn run(config: &Config, client: &mut (dyn Budget + Send)) -> Result<PipelineReport> {
    info!("Starting data pipeline");

    let fetch = Fetcher::new(config, client).await?.run().await?;
    match &fetch.halt {
        Some(halt) => warn!("Fetching stopped early: {halt}"),
        None => info!("Fetched {} entities with new data", fetch.saved()),
    }

    let consolidate = Consolidator::new(config).run().await?;
    info!(
        "Consolidated {} entities, {} failed",
        consolidate.merged(),
        consolidate.failed()
    );

    let warehouse = warehouse::build(config).await?;
    info!(
        "Built {} warehouse tables in {}",
        warehouse.built(),
        warehouse.path.display()
    );

    info!("Data pipeline completed");
    Ok(PipelineReport {
        fetch,
        consolidate,
        warehouse,
    })
}
