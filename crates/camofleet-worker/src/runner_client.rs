//! HTTP client wrapper for the runner sidecar.

use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;

use crate::models::{RunnerDeleteResponse, RunnerSessionDetail};

#[derive(Debug, thiserror::Error)]
pub enum RunnerClientError {
    /// The runner answered with a non-success status.
    #[error("runner returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    /// The runner could not be reached at all.
    #[error("runner unreachable: {0}")]
    Transport(#[from] reqwest::Error),
}

impl RunnerClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Status {
                status: StatusCode::NOT_FOUND,
                ..
            }
        )
    }
}

/// Pooled HTTP client bound to one runner base URL.
pub struct RunnerClient {
    base_url: String,
    client: reqwest::Client,
}

impl RunnerClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn decode<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, RunnerClientError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RunnerClientError::Status { status, body });
        }
        Ok(response.json().await?)
    }

    pub async fn health(&self) -> Result<serde_json::Value, RunnerClientError> {
        Self::decode(self.client.get(self.url("/health")).send().await?).await
    }

    pub async fn list_sessions(&self) -> Result<Vec<RunnerSessionDetail>, RunnerClientError> {
        Self::decode(self.client.get(self.url("/sessions")).send().await?).await
    }

    pub async fn create_session(
        &self,
        payload: &serde_json::Value,
    ) -> Result<RunnerSessionDetail, RunnerClientError> {
        Self::decode(
            self.client
                .post(self.url("/sessions"))
                .json(payload)
                .send()
                .await?,
        )
        .await
    }

    pub async fn get_session(
        &self,
        session_id: &str,
    ) -> Result<RunnerSessionDetail, RunnerClientError> {
        Self::decode(
            self.client
                .get(self.url(&format!("/sessions/{session_id}")))
                .send()
                .await?,
        )
        .await
    }

    pub async fn delete_session(
        &self,
        session_id: &str,
    ) -> Result<RunnerDeleteResponse, RunnerClientError> {
        Self::decode(
            self.client
                .delete(self.url(&format!("/sessions/{session_id}")))
                .send()
                .await?,
        )
        .await
    }

    pub async fn touch_session(
        &self,
        session_id: &str,
    ) -> Result<RunnerSessionDetail, RunnerClientError> {
        Self::decode(
            self.client
                .post(self.url(&format!("/sessions/{session_id}/touch")))
                .send()
                .await?,
        )
        .await
    }
}
