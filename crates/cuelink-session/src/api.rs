//! Backend session surface: request/response shapes and the `SessionApi` seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use cuelink_core::{CommandErrorCode, Role, Session, SessionId, StreamId};

/// Identification sent with session creation. `extra` carries caller-supplied
/// fields; `user_agent` and `timestamp` are always filled in by the lifecycle.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub user_agent: String,
    pub timestamp: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub stream_id: StreamId,
    pub role_requested: Role,
    pub client_info: ClientInfo,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RenewResponse {
    pub session_id: SessionId,
    pub expires_at: i64,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct SwitchStreamRequest<'a> {
    pub stream_id: &'a StreamId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SwitchStreamResponse {
    pub session_id: SessionId,
    pub new_stream_id: StreamId,
    pub new_burnin_url: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamQuality {
    Low,
    Med,
    High,
}

/// One entry of `GET /api/streams`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub stream_id: StreamId,
    #[serde(default)]
    pub name: String,
    /// `usb`, `rtsp`, `file` or `capture`.
    #[serde(rename = "type", default)]
    pub source_type: String,
    #[serde(default)]
    pub available: bool,
    #[serde(default)]
    pub resolution: String,
    #[serde(default)]
    pub fps: f64,
    #[serde(default)]
    pub burnin_url: String,
    #[serde(default)]
    pub capabilities: Vec<StreamQuality>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    pub dev_ui: bool,
    pub replay: bool,
    pub multi_table: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendLimits {
    pub max_sessions: u32,
    pub session_ttl: u64,
    pub metadata_rate_hz: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamDefaults {
    pub available_streams: Vec<StreamId>,
    pub default_quality: StreamQuality,
}

impl Default for StreamDefaults {
    fn default() -> Self {
        Self {
            available_streams: Vec::new(),
            default_quality: StreamQuality::Med,
        }
    }
}

/// `GET /api/config`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub version: String,
    pub flags: FeatureFlags,
    pub limits: BackendLimits,
    pub streams: StreamDefaults,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionApiError {
    #[error("network error: {0}")]
    Network(String),

    #[error("backend rejected request (HTTP {status}): {message}")]
    Rejected {
        status: u16,
        code: Option<CommandErrorCode>,
        message: String,
    },

    #[error("unreadable backend response: {0}")]
    Decode(String),
}

impl SessionApiError {
    /// Network failures, 5xx and rate limiting are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Rejected { status, code, .. } => {
                *status >= 500
                    || *status == 429
                    || code.as_ref().is_some_and(|c| c.is_retryable())
            }
            Self::Decode(_) => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// The four session calls the lifecycle needs. Implemented over HTTP by
/// [`crate::HttpBackend`] and by in-process fakes in tests.
#[async_trait]
pub trait SessionApi: Send + Sync {
    async fn create(&self, request: &CreateSessionRequest) -> Result<Session, SessionApiError>;

    async fn renew(&self, session_id: &SessionId) -> Result<RenewResponse, SessionApiError>;

    async fn switch_stream(
        &self,
        session_id: &SessionId,
        stream_id: &StreamId,
    ) -> Result<SwitchStreamResponse, SessionApiError>;

    async fn delete(&self, session_id: &SessionId) -> Result<(), SessionApiError>;
}
