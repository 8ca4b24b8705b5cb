use crate::api::{self, Mode};
use crate::commands::Out;
use crate::pipeline::{self, PipelineReport};
use crate::{Config, Credentials, Result};

/// Runs fetch, consolidate and warehouse in order.
pub async fn run(
    config: Config,
    credentials: Credentials,
    mode: Mode,
) -> Result<Out<PipelineReport>> {
    let mut client = api::budget(&config, &credentials, mode)?;
    let report = pipeline::run(&config, client.as_mut()).await?;
    let message = format!(
        "Data pipeline completed: {} fetched, {} consolidated, {} warehouse tables built",
        report.fetch.saved(),
        report.consolidate.merged(),
        report.warehouse.built()
    );
    Ok(Out::new(message, report))
}
