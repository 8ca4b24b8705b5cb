//! Implements the `Budget` trait over HTTP with `reqwest`.

use crate::api::{Budget, Reply, KNOWLEDGE_PARAM, RATE_LIMIT_HEADER};
use crate::knowledge::Cursor;
use crate::{Config, Credentials, Result};
use anyhow::{anyhow, Context};
use tracing::trace;
use url::Url;

pub(crate) struct HttpBudget {
    client: reqwest::Client,
    base_url: Url,
    credentials: Credentials,
}

impl HttpBudget {
    pub(crate) fn new(config: &Config, credentials: &Credentials) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .context("Unable to build the HTTP client")?;
        Ok(Self {
            client,
            base_url: config.base_url().clone(),
            credentials: credentials.clone(),
        })
    }

    /// `{base_url}/{budget_id}/{entity}?last_knowledge_of_server={cursor}`
    fn url(&self, entity: &str, cursor: &Cursor) -> Result<Url> {
        entity_url(&self.base_url, self.credentials.budget_id(), entity, cursor)
    }
}

#[async_trait::async_trait]
impl Budget for HttpBudget {
    async fn get(&mut self, entity: &str, cursor: &Cursor) -> Result<Reply> {
        let url = self.url(entity, cursor)?;
        trace!("GET {url}");
        let response = self
            .client
            .get(url)
            .bearer_auth(self.credentials.token())
            .send()
            .await
            .with_context(|| format!("Request for '{entity}' failed"))?;

        let status = response.status().as_u16();
        let rate_limit = response
            .headers()
            .get(RATE_LIMIT_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .text()
            .await
            .with_context(|| format!("Unable to read the '{entity}' response body"))?;

        Ok(Reply {
            status,
            rate_limit,
            body,
        })
    }
}

fn entity_url(base: &Url, budget_id: &str, entity: &str, cursor: &Cursor) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| anyhow!("'{base}' cannot be used as a base URL"))?
        .pop_if_empty()
        .push(budget_id)
        .push(entity);
    url.query_pairs_mut()
        .append_pair(KNOWLEDGE_PARAM, &cursor.to_string());
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_url() {
        let base = Url::parse("https://api.ynab.com/v1/budgets").unwrap();
        let url = entity_url(&base, "b-123", "accounts", &Cursor::from(42)).unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.ynab.com/v1/budgets/b-123/accounts?last_knowledge_of_server=42"
        );
    }

    #[test]
    fn test_entity_url_trailing_slash() {
        let base = Url::parse("http://localhost:8080/v1/budgets/").unwrap();
        let url = entity_url(&base, "last-used", "payees", &Cursor::default()).unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:8080/v1/budgets/last-used/payees?last_knowledge_of_server=0"
        );
    }
}
