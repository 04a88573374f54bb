//! HTTP client for the remote sync API.
//!
//! `POST {base}/sync/push` takes a [`PushRequest`] and answers with one
//! outcome per item; `POST {base}/sync/pull` takes a [`PullRequest`] and
//! answers with a [`PullResponse`] page.

use crate::error::Result;
use async_trait::async_trait;
use roam_sync::{
    ItemOutcome, PullRequest, PullResponse, PushItem, RemoteStore, SyncError, SyncResult,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;

/// Request body for push.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    /// Sending device
    pub device_id: String,
    pub items: Vec<PushItem>,
}

/// Response for push.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    /// One outcome per pushed item, in order
    pub outcomes: Vec<ItemOutcome>,
}

/// [`RemoteStore`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpRemoteStore {
    client: reqwest::Client,
    base_url: String,
    device_id: String,
}

impl HttpRemoteStore {
    pub fn new(base_url: impl Into<String>, device_id: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("roam-agent/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            device_id: device_id.into(),
        })
    }

    async fn post<B: Serialize + Sync, R: DeserializeOwned>(&self, path: &str, body: &B) -> SyncResult<R> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| SyncError::network(format!("POST {url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(%url, %status, "remote store refused request");
            return Err(classify(status, &body));
        }

        response
            .json()
            .await
            .map_err(|e| SyncError::Serialization(format!("decoding response from {url}: {e}")))
    }
}

/// Server-side and throttling failures are transient; other client errors are
/// not.
fn classify(status: reqwest::StatusCode, body: &str) -> SyncError {
    let message = format!("HTTP {status}: {}", body.trim());
    let transient = status.is_server_error()
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT;
    if transient {
        SyncError::network(message)
    } else {
        SyncError::validation(message)
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn push(&self, items: Vec<PushItem>) -> SyncResult<Vec<ItemOutcome>> {
        let expected = items.len();
        let request = PushRequest {
            device_id: self.device_id.clone(),
            items,
        };
        let response: PushResponse = self.post("/sync/push", &request).await?;
        if response.outcomes.len() != expected {
            return Err(SyncError::Serialization(format!(
                "push returned {} outcomes for {expected} items",
                response.outcomes.len()
            )));
        }
        Ok(response.outcomes)
    }

    async fn pull(&self, request: PullRequest) -> SyncResult<PullResponse> {
        self.post("/sync/pull", &request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn status_classification() {
        assert!(classify(StatusCode::BAD_GATEWAY, "").is_retryable());
        assert!(classify(StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
        assert!(!classify(StatusCode::UNPROCESSABLE_ENTITY, "bad").is_retryable());
        assert!(matches!(
            classify(StatusCode::BAD_REQUEST, " nope "),
            SyncError::ValidationFailed(msg) if msg.ends_with("nope")
        ));
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let store = HttpRemoteStore::new("http://localhost:3000/", "d", Duration::from_secs(1)).unwrap();
        assert_eq!(store.base_url, "http://localhost:3000");
    }
}
