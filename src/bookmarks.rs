//! Client for the bookmark relay: a small local HTTP service that hands
//! URLs to the extraction backend.
//!
//! Extraction is slow (the relay proxies a headless fetch + summarize),
//! so `/intake` gets a long deadline; the status endpoints stay short.

use std::time::Duration;

use serde_json::{json, Value};

const INTAKE_TIMEOUT: Duration = Duration::from_secs(90);
const STATUS_TIMEOUT: Duration = Duration::from_secs(15);

pub struct BookmarkRelay {
    base_url: String,
    http: reqwest::Client,
}

impl BookmarkRelay {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// Submit a URL for extraction. A 2xx with a non-JSON body counts as
    /// accepted (the relay's contract does not promise JSON on success).
    pub async fn intake(&self, url: &str) -> anyhow::Result<Value> {
        let resp = self
            .http
            .post(format!("{}/intake", self.base_url))
            .timeout(INTAKE_TIMEOUT)
            .json(&json!({ "url": url }))
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            anyhow::bail!("bookmark relay returned {}: {}", status, body);
        }
        Ok(serde_json::from_str(&body).unwrap_or_else(|_| json!({ "status": "accepted" })))
    }

    pub async fn health(&self) -> anyhow::Result<Value> {
        self.get_json("/health").await
    }

    pub async fn recent(&self) -> anyhow::Result<Value> {
        self.get_json("/recent").await
    }

    async fn get_json(&self, path: &str) -> anyhow::Result<Value> {
        let resp = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .timeout(STATUS_TIMEOUT)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("bookmark relay returned {}", status);
        }
        Ok(resp.json().await?)
    }
}
