use crate::commands::Out;
use crate::warehouse::{self, WarehouseReport};
use crate::{Config, Result};

/// Rebuilds the warehouse from the base tables.
pub async fn warehouse(config: Config) -> Result<Out<WarehouseReport>> {
    let report = warehouse::build(&config).await?;
    Ok(Out::new(
        format!(
            "Built {} of {} warehouse tables in {}",
            report.built(),
            report.tables.len(),
            report.path.display()
        ),
        report,
    ))
}
