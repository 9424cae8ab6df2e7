use serde::{Deserialize, Serialize};

/// Machine-readable failure code carried by `cmd.error`.
/// Classifies codes the way callers need to react: retry later, re-authenticate,
/// or give up.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
pub enum CommandErrorCode {
    #[serde(rename = "ERR_INVALID_ARGUMENT")]
    #[error("invalid argument")]
    InvalidArgument,
    #[serde(rename = "ERR_PERMISSION_DENIED")]
    #[error("permission denied")]
    PermissionDenied,
    #[serde(rename = "ERR_NO_SIGNAL")]
    #[error("no signal")]
    NoSignal,
    #[serde(rename = "ERR_CAMERA_BUSY")]
    #[error("camera busy")]
    CameraBusy,
    #[serde(rename = "ERR_CALIBRATION_FAILED")]
    #[error("calibration failed")]
    CalibrationFailed,
    #[serde(rename = "ERR_SESSION_REPLACED")]
    #[error("session replaced")]
    SessionReplaced,
    #[serde(rename = "ERR_TIMEOUT")]
    #[error("timeout")]
    Timeout,
    #[serde(rename = "ERR_NETWORK")]
    #[error("network")]
    Network,
    #[serde(rename = "ERR_STREAM_UNAVAILABLE")]
    #[error("stream unavailable")]
    StreamUnavailable,
    #[serde(rename = "ERR_INVALID_STATE")]
    #[error("invalid state")]
    InvalidState,
    #[serde(rename = "ERR_RATE_LIMIT")]
    #[error("rate limited")]
    RateLimit,
    #[serde(rename = "ERR_INTERNAL")]
    #[error("internal error")]
    Internal,
    /// Code this client does not know, kept verbatim.
    #[serde(untagged)]
    #[error("{0}")]
    Unknown(String),
}

impl CommandErrorCode {
    /// Wire spelling, e.g. `ERR_CAMERA_BUSY`.
    pub fn as_str(&self) -> &str {
        match self {
            Self::InvalidArgument => "ERR_INVALID_ARGUMENT",
            Self::PermissionDenied => "ERR_PERMISSION_DENIED",
            Self::NoSignal => "ERR_NO_SIGNAL",
            Self::CameraBusy => "ERR_CAMERA_BUSY",
            Self::CalibrationFailed => "ERR_CALIBRATION_FAILED",
            Self::SessionReplaced => "ERR_SESSION_REPLACED",
            Self::Timeout => "ERR_TIMEOUT",
            Self::Network => "ERR_NETWORK",
            Self::StreamUnavailable => "ERR_STREAM_UNAVAILABLE",
            Self::InvalidState => "ERR_INVALID_STATE",
            Self::RateLimit => "ERR_RATE_LIMIT",
            Self::Internal => "ERR_INTERNAL",
            Self::Unknown(code) => code,
        }
    }

    /// Transient conditions worth re-issuing the command for.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CameraBusy | Self::Timeout | Self::Network | Self::RateLimit | Self::NoSignal
        )
    }

    /// The session behind this connection is gone; the UI must re-authenticate.
    pub fn requires_new_session(&self) -> bool {
        matches!(self, Self::SessionReplaced | Self::PermissionDenied)
    }
}
