use serde::{Deserialize, Serialize};

use crate::ids::{SessionId, StreamId};

/// Role granted to a session by the backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer,
    #[default]
    Operator,
    Developer,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Viewer => "viewer",
            Self::Operator => "operator",
            Self::Developer => "developer",
            Self::Admin => "admin",
        }
    }
}

/// A time-boxed, role-scoped grant binding this client to one stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub stream_id: StreamId,
    pub role: Role,
    #[serde(default)]
    pub permission_flags: Vec<String>,
    /// Socket endpoint, usually a path relative to the socket base URL.
    pub ws_url: String,
    /// Playback (burn-in) endpoint.
    pub burnin_url: String,
    /// Absolute expiry, epoch milliseconds.
    pub expires_at: i64,
}

impl Session {
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at
    }

    /// Remaining lifetime in milliseconds; negative once expired.
    pub fn ttl_ms(&self, now_ms: i64) -> i64 {
        self.expires_at - now_ms
    }

    pub fn has_permission(&self, flag: &str) -> bool {
        self.permission_flags.iter().any(|f| f == flag)
    }

    /// Absolute socket URL. Backends hand out `ws_url` as a path; an absolute
    /// `ws://`/`wss://` URL is used as-is.
    pub fn socket_url(&self, socket_base_url: &str) -> String {
        if self.ws_url.starts_with("ws://") || self.ws_url.starts_with("wss://") {
            return self.ws_url.clone();
        }
        let base = socket_base_url.trim_end_matches('/');
        if self.ws_url.starts_with('/') {
            format!("{base}{}", self.ws_url)
        } else {
            format!("{base}/{}", self.ws_url)
        }
    }
}
