use std::time::Duration;

use cuelink_core::CommandErrorCode;
use serde_json::{Map, Value};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect to {url} failed: {message}")]
    Connect { url: String, message: String },

    #[error("no endpoint configured")]
    NoEndpoint,
}

/// Failure of one correlated `cmd.*` request.
#[derive(Clone, Debug, thiserror::Error)]
pub enum CommandError {
    #[error("command rejected: {code} ({message})")]
    Rejected {
        code: CommandErrorCode,
        /// Debug text from the backend; never shown to users.
        message: String,
        details: Option<Map<String, Value>>,
    },

    #[error("no reply after {0:?}")]
    Timeout(Duration),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed before reply")]
    TransportClosed,

    #[error("invalid command type: {0}")]
    InvalidKind(String),

    #[error("command payload must be a JSON object")]
    InvalidPayload,
}

impl CommandError {
    pub fn code(&self) -> Option<CommandErrorCode> {
        match self {
            Self::Rejected { code, .. } => Some(code.clone()),
            Self::Timeout(_) => Some(CommandErrorCode::Timeout),
            Self::NotConnected | Self::TransportClosed => Some(CommandErrorCode::Network),
            Self::InvalidKind(_) | Self::InvalidPayload => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.code().is_some_and(|c| c.is_retryable())
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &str {
        match self {
            Self::Rejected { code, .. } => code.as_str(),
            Self::Timeout(_) => "timeout",
            Self::NotConnected => "not_connected",
            Self::TransportClosed => "transport_closed",
            Self::InvalidKind(_) => "invalid_kind",
            Self::InvalidPayload => "invalid_payload",
        }
    }
}
