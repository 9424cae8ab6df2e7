//! Session acquisition, restoration, renewal and teardown.
//!
//! The lifecycle owns the live [`Session`] and is the only writer of the
//! persisted cache. Renewal runs on a single scheduler timer; any new schedule
//! replaces the previous one.

use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use cuelink_core::{
    Clock, Role, Scheduler, Session, SessionId, StreamId, Subscribers, Subscription, TimerHandle,
};
use cuelink_store::KeyValueStore;

use crate::api::{ClientInfo, CreateSessionRequest, SessionApi};
use crate::cache::SessionCache;
use crate::error::SessionError;
use crate::http::user_agent;
use crate::renewal::renewal_plan;

#[derive(Clone, Debug, PartialEq)]
pub struct SessionConfig {
    pub auto_renew: bool,
    /// Fraction of the remaining lifetime reserved as the renewal window.
    pub renew_window_ratio: f64,
    /// Upper bound on the renewal window.
    pub min_renew_window: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_renew: true,
            renew_window_ratio: 0.2,
            min_renew_window: Duration::from_millis(300_000),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClearReason {
    Deleted,
    Revoked(String),
}

#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    Created(Session),
    Restored(Session),
    Renewed {
        session_id: SessionId,
        expires_at: i64,
    },
    /// Renewal failed and a fresh session was created for the same stream.
    Replaced {
        previous: SessionId,
        session: Session,
    },
    StreamSwitched(Session),
    Cleared {
        session_id: Option<SessionId>,
        reason: ClearReason,
    },
}

pub struct SessionLifecycle {
    api: Arc<dyn SessionApi>,
    cache: SessionCache,
    config: SessionConfig,
    scheduler: Arc<dyn Scheduler>,
    clock: Arc<dyn Clock>,
    current: Mutex<Option<Session>>,
    renewal: Mutex<Option<TimerHandle>>,
    subscribers: Subscribers<SessionEvent>,
}

impl SessionLifecycle {
    pub fn new(
        api: Arc<dyn SessionApi>,
        store: Arc<dyn KeyValueStore>,
        config: SessionConfig,
        scheduler: Arc<dyn Scheduler>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new(Self {
            api,
            cache: SessionCache::new(store),
            config,
            scheduler,
            clock,
            current: Mutex::new(None),
            renewal: Mutex::new(None),
            subscribers: Subscribers::new(),
        })
    }

    pub fn current(&self) -> Option<Session> {
        self.current.lock().clone()
    }

    pub fn subscribe(
        &self,
        handler: impl Fn(&SessionEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribers.subscribe(handler)
    }

    pub fn has_pending_renewal(&self) -> bool {
        self.renewal
            .lock()
            .as_ref()
            .is_some_and(|timer| !timer.is_cancelled())
    }

    /// Acquire a new session for `stream_id`. `extra` is merged into the
    /// request's `client_info`.
    pub async fn create_session(
        self: &Arc<Self>,
        stream_id: &StreamId,
        role: Role,
        extra: Map<String, Value>,
    ) -> Result<Session, SessionError> {
        let session = self.acquire(stream_id, role, extra).await?;
        self.subscribers
            .emit(&SessionEvent::Created(session.clone()));
        Ok(session)
    }

    async fn acquire(
        self: &Arc<Self>,
        stream_id: &StreamId,
        role: Role,
        extra: Map<String, Value>,
    ) -> Result<Session, SessionError> {
        let request = CreateSessionRequest {
            stream_id: stream_id.clone(),
            role_requested: role,
            client_info: ClientInfo {
                user_agent: user_agent(),
                timestamp: self.clock.now_ms(),
                extra,
            },
        };
        let session = self.api.create(&request).await?;
        if session.is_expired_at(self.clock.now_ms()) {
            warn!(session_id = %session.session_id, expires_at = session.expires_at, "backend issued an expired session");
            return Err(SessionError::Expired {
                session_id: session.session_id,
                expires_at: session.expires_at,
            });
        }
        info!(
            session_id = %session.session_id,
            stream_id = %session.stream_id,
            role = session.role.as_str(),
            "session created"
        );
        self.activate(session.clone());
        if self.config.auto_renew {
            self.schedule_renewal();
        }
        Ok(session)
    }

    /// Reuse the cached session if it is still valid and the backend renews
    /// it. An expired entry is dropped without any network call. A restored
    /// session always gets a renewal timer.
    pub async fn restore_session(self: &Arc<Self>) -> Result<Option<Session>, SessionError> {
        let Some(mut session) = self.cache.load()? else {
            return Ok(None);
        };
        let now = self.clock.now_ms();
        if session.is_expired_at(now) {
            info!(session_id = %session.session_id, "cached session expired");
            self.clear_cache();
            return Ok(None);
        }

        match self.api.renew(&session.session_id).await {
            Ok(renewed) => {
                session.expires_at = renewed.expires_at;
                if session.is_expired_at(self.clock.now_ms()) {
                    warn!(
                        session_id = %session.session_id,
                        expires_at = session.expires_at,
                        "renewed session is already expired"
                    );
                    self.clear_cache();
                    return Ok(None);
                }
                info!(
                    session_id = %session.session_id,
                    expires_at = session.expires_at,
                    "session restored"
                );
                self.activate(session.clone());
                self.schedule_renewal();
                self.subscribers
                    .emit(&SessionEvent::Restored(session.clone()));
                Ok(Some(session))
            }
            Err(e) => {
                warn!(session_id = %session.session_id, error = %e, "cached session could not be renewed");
                self.clear_cache();
                Ok(None)
            }
        }
    }

    /// Extend `session_id`. Never fails loudly: returns whether the backend
    /// accepted the renewal.
    pub async fn renew_session(&self, session_id: &SessionId) -> bool {
        let renewed = match self.api.renew(session_id).await {
            Ok(renewed) => renewed,
            Err(e) => {
                warn!(%session_id, error = %e, "session renewal failed");
                return false;
            }
        };

        let updated = {
            let mut current = self.current.lock();
            match current.as_mut() {
                Some(session) if &session.session_id == session_id => {
                    session.expires_at = renewed.expires_at;
                    Some(session.clone())
                }
                _ => None,
            }
        };
        if let Some(session) = updated {
            self.persist(&session);
        }
        debug!(%session_id, expires_at = renewed.expires_at, "session renewed");
        self.subscribers.emit(&SessionEvent::Renewed {
            session_id: session_id.clone(),
            expires_at: renewed.expires_at,
        });
        true
    }

    /// Move the live session to another stream. Any failure leaves the session
    /// untouched and returns false.
    pub async fn switch_stream(&self, new_stream_id: &StreamId) -> bool {
        let Some(session_id) = self.current_id() else {
            warn!(stream_id = %new_stream_id, "no active session to switch");
            return false;
        };
        let switched = match self.api.switch_stream(&session_id, new_stream_id).await {
            Ok(switched) => switched,
            Err(e) => {
                warn!(%session_id, stream_id = %new_stream_id, error = %e, "stream switch failed");
                return false;
            }
        };
        info!(%session_id, stream_id = %switched.new_stream_id, "stream switched");
        self.rebind(&session_id, switched.new_stream_id, switched.new_burnin_url)
    }

    /// Mirror a server-pushed stream change into the live session.
    pub fn apply_stream_change(&self, new_stream_id: StreamId, play_url: String) -> bool {
        let Some(session_id) = self.current_id() else {
            return false;
        };
        self.rebind(&session_id, new_stream_id, play_url)
    }

    fn rebind(&self, session_id: &SessionId, stream_id: StreamId, burnin_url: String) -> bool {
        let updated = {
            let mut current = self.current.lock();
            match current.as_mut() {
                Some(session) if &session.session_id == session_id => {
                    session.stream_id = stream_id;
                    session.burnin_url = burnin_url;
                    Some(session.clone())
                }
                _ => None,
            }
        };
        match updated {
            Some(session) => {
                self.persist(&session);
                self.subscribers.emit(&SessionEvent::StreamSwitched(session));
                true
            }
            None => false,
        }
    }

    /// Best-effort backend deletion, then local teardown regardless of the
    /// outcome.
    pub async fn delete_session(&self, session_id: Option<&SessionId>) {
        let target = session_id.cloned().or_else(|| self.current_id());
        if let Some(id) = &target {
            if let Err(e) = self.api.delete(id).await {
                warn!(session_id = %id, error = %e, "backend session delete failed");
            }
        }
        self.clear_local(ClearReason::Deleted);
    }

    /// The server revoked the session; forget it without calling back.
    pub fn revoke_local(&self, reason: &str) {
        warn!(reason, "session revoked by server");
        self.clear_local(ClearReason::Revoked(reason.to_string()));
    }

    /// Stop renewal and release subscribers. The cached session is kept for
    /// the next restore.
    pub fn destroy(&self) {
        self.cancel_renewal();
        self.subscribers.clear();
    }

    fn current_id(&self) -> Option<SessionId> {
        self.current
            .lock()
            .as_ref()
            .map(|s| s.session_id.clone())
    }

    fn activate(&self, session: Session) {
        self.persist(&session);
        *self.current.lock() = Some(session);
    }

    fn persist(&self, session: &Session) {
        if let Err(e) = self.cache.save(session) {
            warn!(session_id = %session.session_id, error = %e, "failed to persist session");
        }
    }

    fn clear_cache(&self) {
        if let Err(e) = self.cache.clear() {
            warn!(error = %e, "failed to clear cached session");
        }
    }

    fn clear_local(&self, reason: ClearReason) {
        self.cancel_renewal();
        let previous = self.current.lock().take();
        self.clear_cache();
        self.subscribers.emit(&SessionEvent::Cleared {
            session_id: previous.map(|s| s.session_id),
            reason,
        });
    }

    fn cancel_renewal(&self) {
        if let Some(timer) = self.renewal.lock().take() {
            timer.cancel();
        }
    }

    /// Arm the renewal timer from the live session's expiry, replacing any
    /// previous timer.
    pub fn schedule_renewal(self: &Arc<Self>) {
        let Some(session) = self.current() else {
            self.cancel_renewal();
            return;
        };
        let ttl = session.ttl_ms(self.clock.now_ms());
        let min_window = self.config.min_renew_window.as_millis() as i64;
        let Some(plan) = renewal_plan(ttl, self.config.renew_window_ratio, min_window) else {
            debug!(session_id = %session.session_id, ttl, "no time left to schedule renewal");
            self.cancel_renewal();
            return;
        };

        debug!(
            session_id = %session.session_id,
            fire_in_ms = plan.fire_in_ms,
            "renewal scheduled"
        );
        let weak: Weak<Self> = Arc::downgrade(self);
        let task = async move {
            if let Some(lifecycle) = weak.upgrade() {
                lifecycle.on_renewal_due(session).await;
            }
        }
        .boxed();
        let timer = self.scheduler.after(plan.delay(), task);
        if let Some(previous) = self.renewal.lock().replace(timer) {
            previous.cancel();
        }
    }

    async fn on_renewal_due(self: Arc<Self>, due: Session) {
        if self.current_id().as_ref() != Some(&due.session_id) {
            debug!(session_id = %due.session_id, "renewal for a superseded session skipped");
            return;
        }
        if self.renew_session(&due.session_id).await {
            self.schedule_renewal();
            return;
        }

        let stream_id = self
            .current()
            .map(|s| s.stream_id)
            .unwrap_or(due.stream_id);
        match self.acquire(&stream_id, due.role, Map::new()).await {
            Ok(session) => {
                info!(
                    previous = %due.session_id,
                    session_id = %session.session_id,
                    "session replaced after failed renewal"
                );
                self.subscribers.emit(&SessionEvent::Replaced {
                    previous: due.session_id,
                    session,
                });
            }
            Err(e) => {
                error!(
                    session_id = %due.session_id,
                    error = %e,
                    "fallback session creation failed"
                );
                self.cancel_renewal();
            }
        }
    }
}
