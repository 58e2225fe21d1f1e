//! Engines backed by an inference worker over HTTP.

mod asr;
mod tts;

pub use asr::RemoteAsrEngine;
pub use tts::RemoteTtsEngine;

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::debug;

use audio_helper_core::config::EngineConfig;

/// Shared HTTP plumbing for one remote variant.
#[derive(Debug, Clone)]
pub(crate) struct WorkerClient {
    pub(crate) variant: String,
    pub(crate) config: EngineConfig,
    client: reqwest::Client,
    api_key: Option<String>,
}

impl WorkerClient {
    pub(crate) fn new(variant: &str, config: EngineConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        let api_key = config.resolve_api_key();
        Ok(Self {
            variant: variant.to_string(),
            config,
            client,
            api_key,
        })
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url.trim_end_matches('/'))
    }

    pub(crate) fn model(&self) -> &str {
        self.config.model.as_deref().unwrap_or(&self.variant)
    }

    pub(crate) fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self.client.post(self.url(path));
        match &self.api_key {
            Some(key) => request.header("Authorization", format!("Bearer {key}")),
            None => request,
        }
    }

    /// GET the configured health path, if any. Non-2xx fails construction.
    pub(crate) async fn check_health(&self) -> Result<()> {
        let Some(path) = self.config.health_path.as_deref() else {
            return Ok(());
        };
        let url = self.url(path);
        debug!(variant = %self.variant, url = %url, "Probing inference worker");
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Inference worker unreachable at {url}"))?;
        if !resp.status().is_success() {
            anyhow::bail!("Inference worker at {url} answered {}", resp.status());
        }
        Ok(())
    }
}

/// Bail with the worker's status and body on a non-2xx response.
pub(crate) async fn check_status(resp: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("{what} error {status}: {body}");
    }
    Ok(resp)
}
