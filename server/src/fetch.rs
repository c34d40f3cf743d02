//! HTTP asset fetcher used by image post-processing.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

use rewind_common::images::AssetFetcher;

/// User-Agent sent to asset hosts.
const USER_AGENT: &str = "rewind-server/0.1";

pub struct HttpFetcher {
    client: reqwest::Client,
    /// Base URL for root-relative references such as `/img/a.png`.
    base_url: String,
}

impl HttpFetcher {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .context("Cannot build HTTP client")?;
        Ok(HttpFetcher {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn resolve(&self, url: &str) -> String {
        if url.starts_with('/') {
            format!("{}{}", self.base_url, url)
        } else {
            url.to_string()
        }
    }
}

#[async_trait]
impl AssetFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let url = self.resolve(url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;

        if !resp.status().is_success() {
            anyhow::bail!("GET {} returned {}", url, resp.status());
        }

        let bytes = resp.bytes().await.with_context(|| format!("Read body of {url}"))?;
        Ok(bytes.to_vec())
    }
}
