use crate::commands::Out;
use crate::consolidate::{ConsolidateReport, Consolidator};
use crate::{Config, Result};

/// Merges pending raw snapshots into the base tables.
pub async fn consolidate(config: Config) -> Result<Out<ConsolidateReport>> {
    let report = Consolidator::new(&config).run().await?;
    Ok(Out::new(
        format!(
            "Consolidated {} entities, {} failed",
            report.merged(),
            report.failed()
        ),
        report,
    ))
}
