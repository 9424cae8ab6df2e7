//! Persisted copy of the live session.

use std::sync::Arc;

use tracing::warn;

use cuelink_core::{Session, SessionId};
use cuelink_store::{KeyValueStore, StoreError};

pub const SESSION_ID_KEY: &str = "cuelink.session_id";
pub const SESSION_KEY: &str = "cuelink.session";

/// Two keys: the bare session id and the serialized [`Session`]. Both are
/// written and removed together.
#[derive(Clone)]
pub struct SessionCache {
    store: Arc<dyn KeyValueStore>,
}

impl SessionCache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn save(&self, session: &Session) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(session)?;
        self.store.set(SESSION_ID_KEY, session.session_id.as_str())?;
        self.store.set(SESSION_KEY, &encoded)
    }

    /// `Ok(None)` when nothing is cached. An entry that no longer decodes is
    /// removed and reported as absent.
    pub fn load(&self) -> Result<Option<Session>, StoreError> {
        let Some(raw) = self.store.get(SESSION_KEY)? else {
            return Ok(None);
        };
        match serde_json::from_str::<Session>(&raw) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                warn!(error = %e, "discarding unreadable cached session");
                self.clear()?;
                Ok(None)
            }
        }
    }

    pub fn session_id(&self) -> Result<Option<SessionId>, StoreError> {
        Ok(self.store.get(SESSION_ID_KEY)?.map(SessionId::from))
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        self.store.remove(SESSION_ID_KEY)?;
        self.store.remove(SESSION_KEY)
    }
}
