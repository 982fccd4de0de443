//! HTTP client for the active-call snapshot and operator status endpoints.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::StatusCode;
use tracing::debug;

use callwatch_core::{MonitorConfig, SnapshotOutcome};
use callwatch_protocol::{ActiveCallRecord, OperatorStatusResponse, OperatorStatusUpdate};

const ACTIVE_CALLS_PATH: &str = "/api/calls/active";
const OPERATOR_STATUS_PATH: &str = "/api/operator/status";

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    api_base: String,
    token: String,
}

impl ApiClient {
    pub fn new(config: &MonitorConfig, token: &str) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            reqwest::header::HeaderValue::from_static("callwatch-console"),
        );
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(config.request_timeout_ms.max(1)))
            .build()
            .context("failed to create api client")?;

        Ok(Self {
            http,
            api_base: config.api_base_url.trim_end_matches('/').to_string(),
            token: token.trim().to_string(),
        })
    }

    /// Fetches the active-call snapshot. Never fails: every response maps to
    /// a [`SnapshotOutcome`] (503 is authoritative-empty, anything else that
    /// is not a 200 with a readable body is a plain failure).
    pub async fn fetch_active_calls(&self, owner_key: &str) -> SnapshotOutcome {
        let mut request = self
            .http
            .get(format!("{}{}", self.api_base, ACTIVE_CALLS_PATH))
            .bearer_auth(&self.token);
        if !owner_key.is_empty() {
            request = request.query(&[("owner", owner_key)]);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => return SnapshotOutcome::Failed(format!("request failed: {}", err)),
        };

        match response.status() {
            StatusCode::OK => match response.json::<Vec<ActiveCallRecord>>().await {
                Ok(records) => {
                    debug!(calls = records.len(), "Fetched active-call snapshot");
                    SnapshotOutcome::Calls(records)
                }
                Err(err) => SnapshotOutcome::Failed(format!("unreadable snapshot: {}", err)),
            },
            StatusCode::SERVICE_UNAVAILABLE => SnapshotOutcome::Unavailable,
            status => SnapshotOutcome::Failed(format!("snapshot returned {}", status)),
        }
    }

    pub async fn fetch_status(&self) -> Result<OperatorStatusResponse> {
        let response = self
            .http
            .get(format!("{}{}", self.api_base, OPERATOR_STATUS_PATH))
            .bearer_auth(&self.token)
            .send()
            .await
            .context("operator status request failed")?;
        read_status_response(response).await
    }

    pub async fn update_status(
        &self,
        update: &OperatorStatusUpdate,
    ) -> Result<OperatorStatusResponse> {
        let response = self
            .http
            .put(format!("{}{}", self.api_base, OPERATOR_STATUS_PATH))
            .bearer_auth(&self.token)
            .json(update)
            .send()
            .await
            .context("operator status update failed")?;
        read_status_response(response).await
    }
}

async fn read_status_response(response: reqwest::Response) -> Result<OperatorStatusResponse> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        bail!("operator status returned {}: {}", status, truncate(&body, 200));
    }
    response
        .json::<OperatorStatusResponse>()
        .await
        .context("unreadable operator status body")
}

fn truncate(text: &str, max_chars: usize) -> String {
    let mut truncated: String = text.chars().take(max_chars).collect();
    if text.chars().count() > max_chars {
        truncated.push('…');
    }
    truncated
}
