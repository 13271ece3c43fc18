//! Configuration fetches from the policy server.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use crate::store::PolicyConfig;

/// Extension trait for reqwest::Response to handle common error patterns.
#[async_trait]
pub trait ResponseExt {
    /// Ensure the response status is successful, returning an error with details if not.
    ///
    /// # Errors
    ///
    /// Returns an error if the response status is not successful (2xx),
    /// including the status code and response body in the error message.
    async fn ensure_success(self, api_name: &str) -> Result<Self>
    where
        Self: Sized;
}

#[async_trait]
impl ResponseExt for reqwest::Response {
    async fn ensure_success(self, api_name: &str) -> Result<Self> {
        if !self.status().is_success() {
            let status = self.status();
            let error_text = self.text().await.unwrap_or_default();
            anyhow::bail!("{api_name} API error ({status}): {error_text}");
        }
        Ok(self)
    }
}

/// Where refreshed policies come from.
#[async_trait]
pub trait PolicySource: Send + Sync {
    async fn fetch_policy(&self) -> Result<PolicyConfig>;
}

/// Policy document served by `/apps`. Older servers use the short field
/// names and may send `null` for empty lists.
#[derive(Debug, Deserialize)]
struct RemotePolicy {
    #[serde(default, alias = "processes")]
    processes_to_monitor: Option<Vec<String>>,
    #[serde(default, alias = "urls")]
    urls_to_block: Option<Vec<String>>,
}

impl From<RemotePolicy> for PolicyConfig {
    fn from(remote: RemotePolicy) -> Self {
        let clean = |items: Option<Vec<String>>| {
            items
                .unwrap_or_default()
                .into_iter()
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect::<Vec<_>>()
        };
        PolicyConfig::new(
            clean(remote.processes_to_monitor),
            clean(remote.urls_to_block),
        )
    }
}

/// Client for `GET <config-host>/apps?client=<id>`.
pub struct ConfigClient {
    client: Client,
    base_url: String,
    client_id: String,
}

impl ConfigClient {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: &str, client_id: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build configuration HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            client_id: client_id.to_string(),
        })
    }

    /// Fetch the current policy for this client.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure, a non-2xx status or a malformed body.
    pub async fn fetch(&self) -> Result<PolicyConfig> {
        let url = format!("{}/apps", self.base_url);
        let remote: RemotePolicy = self
            .client
            .get(&url)
            .query(&[("client", self.client_id.as_str())])
            .send()
            .await
            .with_context(|| format!("Failed to reach {url}"))?
            .ensure_success("Configuration")
            .await?
            .json()
            .await
            .context("Failed to decode configuration response")?;

        let policy = PolicyConfig::from(remote);
        log::info!(
            "Fetched configuration for {}: {} processes, {} urls",
            self.client_id,
            policy.monitored_process_names.len(),
            policy.blocked_urls.len()
        );
        Ok(policy)
    }
}

#[async_trait]
impl PolicySource for ConfigClient {
    async fn fetch_policy(&self) -> Result<PolicyConfig> {
        self.fetch().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serve;
    use serde_json::json;

    #[tokio::test]
    async fn test_fetch_sends_client_and_parses_policy() {
        let (endpoint, mut requests) = serve(
            200,
            json!({"processes_to_monitor": ["A.exe", "B.exe"], "urls_to_block": ["bad.example.com"]}),
        )
        .await;

        let client = ConfigClient::new(&endpoint, "bac", Duration::from_secs(5)).unwrap();
        let policy = client.fetch().await.unwrap();

        assert_eq!(policy, PolicyConfig::new(["A.exe", "B.exe"], ["bad.example.com"]));
        let request_line = requests.recv().await.unwrap();
        assert!(request_line.starts_with("GET /apps?client=bac "));
    }

    #[tokio::test]
    async fn test_fetch_accepts_short_names_and_nulls() {
        let (endpoint, _requests) =
            serve(200, json!({"processes": ["A.exe", " "], "urls": null})).await;

        let client = ConfigClient::new(&endpoint, "bac", Duration::from_secs(5)).unwrap();
        let policy = client.fetch().await.unwrap();

        assert_eq!(policy, PolicyConfig::new(["A.exe"], Vec::<String>::new()));
    }

    #[tokio::test]
    async fn test_fetch_reports_server_error() {
        let (endpoint, _requests) = serve(500, json!({"error": "boom"})).await;

        let client = ConfigClient::new(&endpoint, "bac", Duration::from_secs(5)).unwrap();
        let error = client.fetch().await.unwrap_err();
        assert!(error.to_string().contains("Configuration API error"));
    }
}
