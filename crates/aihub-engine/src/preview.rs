//! Workflow preview images served next to the websocket endpoint.

use std::time::Duration;

use aihub_contracts::store::HubConfig;
use anyhow::{bail, Context, Result};
use reqwest::blocking::Client as HttpClient;

const PREVIEW_TIMEOUT: Duration = Duration::from_secs(10);

/// Downloads `/workflows/{id}.png`. A missing or unreachable preview is not
/// an error for the caller, it just has nothing to show.
pub fn fetch_workflow_preview(config: &HubConfig, workflow_id: &str) -> Option<Vec<u8>> {
    match download_preview(config, workflow_id) {
        Ok(bytes) => Some(bytes),
        Err(err) => {
            tracing::debug!(workflow_id, "no workflow preview: {err:#}");
            None
        }
    }
}

fn download_preview(config: &HubConfig, workflow_id: &str) -> Result<Vec<u8>> {
    let url = config.preview_url(workflow_id);
    let http = HttpClient::builder()
        .timeout(PREVIEW_TIMEOUT)
        .build()
        .context("failed building http client")?;
    let response = http
        .get(&url)
        .header("api-key", &config.apikey)
        .send()
        .with_context(|| format!("failed downloading workflow preview ({url})"))?;
    if !response.status().is_success() {
        bail!("workflow preview download failed ({})", response.status().as_u16());
    }
    let bytes = response
        .bytes()
        .context("failed reading workflow preview bytes")?
        .to_vec();
    if bytes.is_empty() {
        bail!("workflow preview is empty");
    }
    Ok(bytes)
}
