use cuelink_core::SessionId;
use cuelink_store::StoreError;

use crate::api::SessionApiError;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Api(#[from] SessionApiError),

    #[error("session {session_id} arrived already expired (expires_at {expires_at})")]
    Expired {
        session_id: SessionId,
        expires_at: i64,
    },

    #[error("session store: {0}")]
    Store(#[from] StoreError),
}

impl SessionError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Api(e) if e.is_retryable())
    }
}
