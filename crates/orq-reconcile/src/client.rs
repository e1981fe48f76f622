//! Native-protocol client for inference backends.
//!
//! The trait is the seam: cycles and the download worker talk to
//! `dyn BackendClient`, production uses the HTTP implementation, tests use
//! an in-process fake server.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Model names the backend currently serves.
    async fn list_models(&self, base_url: &str) -> Result<Vec<String>>;

    /// Ask the backend to download a model. Blocks until the backend
    /// reports completion (no streaming progress).
    async fn pull_model(&self, base_url: &str, model: &str) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelTag>,
}

#[derive(Debug, Deserialize)]
struct ModelTag {
    name: String,
}

#[derive(Debug, Deserialize)]
struct PullResponse {
    #[serde(default)]
    status: String,
}

/// reqwest-backed client with a per-attempt dial timeout.
pub struct HttpBackendClient {
    http: reqwest::Client,
}

impl HttpBackendClient {
    pub fn new(dial_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(dial_timeout)
            .build()
            .context("build backend http client")?;
        Ok(Self { http })
    }
}

#[async_trait]
impl BackendClient for HttpBackendClient {
    async fn list_models(&self, base_url: &str) -> Result<Vec<String>> {
        let url = format!("{}/api/tags", base_url.trim_end_matches('/'));
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("dial {url}"))?;

        if !resp.status().is_success() {
            return Err(anyhow!("{url} returned {}", resp.status()));
        }

        let tags: TagsResponse = resp
            .json()
            .await
            .with_context(|| format!("decode {url} response"))?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    async fn pull_model(&self, base_url: &str, model: &str) -> Result<()> {
        let url = format!("{}/api/pull", base_url.trim_end_matches('/'));
        let resp = self
            .http
            .post(&url)
            // Model pulls run far longer than a dial; the per-request
            // override keeps the short dial timeout for everything else.
            .timeout(Duration::from_secs(3600))
            .json(&serde_json::json!({ "name": model, "stream": false }))
            .send()
            .await
            .with_context(|| format!("dial {url}"))?;

        if !resp.status().is_success() {
            return Err(anyhow!("{url} returned {}", resp.status()));
        }

        let pull: PullResponse = resp
            .json()
            .await
            .with_context(|| format!("decode {url} response"))?;
        if pull.status != "success" {
            return Err(anyhow!("pull of {model} ended with status {:?}", pull.status));
        }
        Ok(())
    }
}
