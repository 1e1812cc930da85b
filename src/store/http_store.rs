use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use super::{PolicySecretStore, Secret};
use crate::authorization::policy::Policy;

/// List envelope returned by the management plane.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse<T> {
    #[serde(default)]
    total_count: Option<u64>,
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

/// Fetches policies and secrets from the management plane over HTTP.
#[derive(Debug, Clone)]
pub struct HttpStore {
    base_url: String,
    token: Option<String>,
    http_client: Client,
}

impl HttpStore {
    pub fn new(base_url: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .context("creating HTTP client")?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        debug!("management store client initialized with base_url={}", base_url);

        Ok(Self {
            base_url,
            token,
            http_client,
        })
    }

    fn url(&self, resource: &str) -> String {
        format!("{}/v1/{}", self.base_url, resource)
    }

    async fn list<T: DeserializeOwned>(&self, resource: &str) -> Result<Vec<T>> {
        let url = self.url(resource);
        debug!("listing {} from management plane: {}", resource, url);

        let mut request = self.http_client.get(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("sending {resource} list request"))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!(
                "listing {} failed with status {}: {}",
                resource,
                status,
                body
            ));
        }

        let list: ListResponse<T> = response
            .json()
            .await
            .with_context(|| format!("parsing {resource} list response"))?;
        debug!(
            resource,
            total = list.total_count.unwrap_or(list.items.len() as u64),
            "management plane list fetched"
        );
        Ok(list.items)
    }
}

#[async_trait]
impl PolicySecretStore for HttpStore {
    async fn list_policies(&self) -> Result<Vec<Policy>> {
        self.list("policies").await
    }

    async fn list_secrets(&self) -> Result<Vec<Secret>> {
        self.list("secrets").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_trims_trailing_slash() {
        let store = HttpStore::new("http://127.0.0.1:8080/", None, Duration::from_secs(1)).unwrap();
        assert_eq!(store.url("policies"), "http://127.0.0.1:8080/v1/policies");
    }

    #[test]
    fn test_list_envelope_parsing() {
        let raw = r#"{"totalCount": 1, "items": [{"username": "alice", "id": "kid-1", "key": "s3cr3t", "expires": 0}]}"#;
        let list: ListResponse<Secret> = serde_json::from_str(raw).unwrap();
        assert_eq!(list.total_count, Some(1));
        assert_eq!(list.items[0].id, "kid-1");

        let empty: ListResponse<Secret> = serde_json::from_str("{}").unwrap();
        assert!(empty.items.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_store_errors() {
        let store = HttpStore::new("http://127.0.0.1:1", None, Duration::from_millis(200)).unwrap();
        assert!(store.list_policies().await.is_err());
    }
}
