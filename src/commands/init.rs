use crate::commands::Out;
use crate::{Config, Result};
use anyhow::Context;
use std::path::Path;

/// Creates `budget_home` and a default `config.json` inside it. An existing `config.json` is kept.
///
/// # Errors
/// - Returns an error if the directory or file cannot be written, or if an existing
///   `config.json` does not validate.
pub async fn init(budget_home: &Path) -> Result<Out<()>> {
    let config = Config::create(budget_home)
        .await
        .context("Unable to create the budget home directory and config")?;
    Ok(format!(
        "The budget home is ready, configuration is at {}",
        config.config_path().display()
    )
    .into())
}
