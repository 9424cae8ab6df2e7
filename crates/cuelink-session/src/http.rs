//! reqwest-backed implementation of [`SessionApi`] plus the read-only
//! discovery endpoints.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, instrument};

use cuelink_core::{CommandErrorCode, Session, SessionId, StreamId};

use crate::api::{
    BackendConfig, CreateSessionRequest, RenewResponse, SessionApi, SessionApiError, StreamInfo,
    SwitchStreamRequest, SwitchStreamResponse,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    code: Option<CommandErrorCode>,
    #[serde(default)]
    message: String,
}

#[derive(Clone, Debug)]
pub struct HttpBackend {
    base_url: String,
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Result<Self, SessionApiError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(user_agent())
            .build()
            .map_err(|e| SessionApiError::Network(e.to_string()))?;
        Ok(Self::with_client(base_url, client))
    }

    pub fn with_client(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url, client }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// `GET /api/streams`.
    #[instrument(skip(self))]
    pub async fn streams(&self) -> Result<Vec<StreamInfo>, SessionApiError> {
        let response = self.client.get(self.url("/api/streams")).send().await;
        decode(response).await
    }

    /// `GET /api/config`.
    #[instrument(skip(self))]
    pub async fn config(&self) -> Result<BackendConfig, SessionApiError> {
        let response = self.client.get(self.url("/api/config")).send().await;
        decode(response).await
    }
}

/// User agent reported in requests and in session `client_info`.
pub fn user_agent() -> String {
    format!("cuelink/{}", env!("CARGO_PKG_VERSION"))
}

#[async_trait]
impl SessionApi for HttpBackend {
    #[instrument(skip(self, request), fields(stream_id = %request.stream_id))]
    async fn create(&self, request: &CreateSessionRequest) -> Result<Session, SessionApiError> {
        let response = self
            .client
            .post(self.url("/api/sessions"))
            .json(request)
            .send()
            .await;
        decode(response).await
    }

    #[instrument(skip(self))]
    async fn renew(&self, session_id: &SessionId) -> Result<RenewResponse, SessionApiError> {
        let response = self
            .client
            .post(self.url(&format!("/api/sessions/{session_id}/renew")))
            .send()
            .await;
        decode(response).await
    }

    #[instrument(skip(self))]
    async fn switch_stream(
        &self,
        session_id: &SessionId,
        stream_id: &StreamId,
    ) -> Result<SwitchStreamResponse, SessionApiError> {
        let response = self
            .client
            .post(self.url(&format!("/api/sessions/{session_id}/switch_stream")))
            .json(&SwitchStreamRequest { stream_id })
            .send()
            .await;
        decode(response).await
    }

    #[instrument(skip(self))]
    async fn delete(&self, session_id: &SessionId) -> Result<(), SessionApiError> {
        let response = self
            .client
            .delete(self.url(&format!("/api/sessions/{session_id}")))
            .send()
            .await;
        let _ = check(response).await?;
        Ok(())
    }
}

async fn check(
    response: Result<reqwest::Response, reqwest::Error>,
) -> Result<reqwest::Response, SessionApiError> {
    let response = response.map_err(|e| SessionApiError::Network(e.to_string()))?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let (code, message) = match serde_json::from_str::<ErrorBody>(&body) {
        Ok(parsed) => (parsed.error.code, parsed.error.message),
        Err(_) => (
            None,
            status.canonical_reason().unwrap_or("request failed").to_string(),
        ),
    };
    debug!(status = status.as_u16(), ?code, %message, "backend rejected request");
    Err(SessionApiError::Rejected {
        status: status.as_u16(),
        code,
        message,
    })
}

async fn decode<T: DeserializeOwned>(
    response: Result<reqwest::Response, reqwest::Error>,
) -> Result<T, SessionApiError> {
    let response = check(response).await?;
    let bytes = response
        .bytes()
        .await
        .map_err(|e| SessionApiError::Network(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| SessionApiError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_trailing_slash() {
        let backend = HttpBackend::with_client("http://localhost:8001/", reqwest::Client::new());
        assert_eq!(backend.base_url(), "http://localhost:8001");
        assert_eq!(backend.url("/api/streams"), "http://localhost:8001/api/streams");
    }

    #[test]
    fn user_agent_names_crate() {
        assert!(user_agent().starts_with("cuelink/"));
    }
}
