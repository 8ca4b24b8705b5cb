use crate::api::{self, Mode};
use crate::commands::Out;
use crate::fetch::{FetchReport, Fetcher};
use crate::{Config, Credentials, Result};

/// Fetches every configured entity into the raw layer.
pub async fn fetch(
    config: Config,
    credentials: Credentials,
    mode: Mode,
) -> Result<Out<FetchReport>> {
    let mut client = api::budget(&config, &credentials, mode)?;
    let report = Fetcher::new(&config, client.as_mut()).await?.run().await?;
    let message = match &report.halt {
        Some(halt) => format!(
            "Fetched new data for {} entities, then stopped: {halt}",
            report.saved()
        ),
        None => format!("Fetched new data for {} entities", report.saved()),
    };
    Ok(Out::new(message, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity;
    use crate::test::TestEnv;

    #[tokio::test]
    async fn test_fetch_seeded() {
        let env = TestEnv::new().await;
        let credentials = Credentials::new(Some("token"), Some("last-used")).unwrap();

        let out = fetch(env.config(), credentials, Mode::Test).await.unwrap();

        assert_eq!(
            out.structure().unwrap().saved(),
            entity::defaults().len()
        );
        assert!(env.raw().has_pending(entity::PAYEES).await.unwrap());
    }
}
