//! `CueClient` owns one of each component and routes socket traffic between
//! them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use cuelink_core::envelope::{
    kind, CmdAckPayload, CmdErrorPayload, HeartbeatPayload, MetadataUpdate,
    ProtocolWelcomePayload, SessionRevokedPayload, StreamChangedAck, StreamChangedPayload,
};
use cuelink_core::{
    Clock, Envelope, Role, Scheduler, Session, StreamId, Subscribers, Subscription, SystemClock,
    TokioScheduler,
};
use cuelink_monitor::{ConnectionHealthState, HealthMonitor, TelemetryBuffer};
use cuelink_session::{
    BackendConfig, HttpBackend, SessionApi, SessionEvent, SessionLifecycle, StreamInfo,
};
use cuelink_store::KeyValueStore;
use cuelink_telemetry::{ClientMetrics, MetricsSnapshot};
use cuelink_transport::{CloseKind, CommandChannel, Endpoint, Transport};

use crate::error::ClientError;
use crate::settings::ClientSettings;

/// Client-level notifications that are not plain health or metadata updates.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientEvent {
    /// Another client took over this session; the socket will not reconnect.
    Superseded { reason: String },
    /// The server revoked the session; the local copy has been cleared.
    Revoked { reason: String, message: String },
    StreamChanged { stream_id: StreamId, play_url: String },
    /// Renewal failed and a new session replaced the old one.
    SessionReplaced(Session),
}

pub struct CueClient {
    settings: ClientSettings,
    http: HttpBackend,
    scheduler: Arc<dyn Scheduler>,
    transport: Arc<Transport>,
    commands: CommandChannel,
    health: Arc<HealthMonitor>,
    session: Arc<SessionLifecycle>,
    metadata: Arc<TelemetryBuffer<MetadataUpdate>>,
    metrics: Arc<ClientMetrics>,
    events: Subscribers<ClientEvent>,
    wiring: Mutex<Vec<Subscription>>,
    started: AtomicBool,
    destroyed: AtomicBool,
}

impl CueClient {
    /// Client talking to the backend over HTTP, with its own metrics.
    pub fn new(
        settings: ClientSettings,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<Arc<Self>, ClientError> {
        Self::with_metrics(settings, store, Arc::new(ClientMetrics::new()))
    }

    pub fn with_metrics(
        settings: ClientSettings,
        store: Arc<dyn KeyValueStore>,
        metrics: Arc<ClientMetrics>,
    ) -> Result<Arc<Self>, ClientError> {
        let http = HttpBackend::new(settings.api_base_url.clone())?;
        let api: Arc<dyn SessionApi> = Arc::new(http.clone());
        Ok(Self::assemble(settings, store, api, http, metrics))
    }

    /// Client whose session calls go through `api` instead of HTTP.
    pub fn with_api(
        settings: ClientSettings,
        store: Arc<dyn KeyValueStore>,
        api: Arc<dyn SessionApi>,
        metrics: Arc<ClientMetrics>,
    ) -> Result<Arc<Self>, ClientError> {
        let http = HttpBackend::new(settings.api_base_url.clone())?;
        Ok(Self::assemble(settings, store, api, http, metrics))
    }

    fn assemble(
        settings: ClientSettings,
        store: Arc<dyn KeyValueStore>,
        api: Arc<dyn SessionApi>,
        http: HttpBackend,
        metrics: Arc<ClientMetrics>,
    ) -> Arc<Self> {
        let scheduler: Arc<dyn Scheduler> = Arc::new(TokioScheduler);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let transport = Transport::new(
            settings.transport_config(),
            Arc::clone(&scheduler),
            Arc::clone(&clock),
            Some(Arc::clone(&metrics)),
        );
        let commands = CommandChannel::new(Arc::clone(&transport), Some(Arc::clone(&metrics)));
        let health = HealthMonitor::new(Arc::clone(&clock));
        let session = SessionLifecycle::new(
            api,
            store,
            settings.session_config(),
            Arc::clone(&scheduler),
            Arc::clone(&clock),
        );
        let metadata = TelemetryBuffer::new(settings.buffer_config(), clock);

        let client = Arc::new(Self {
            settings,
            http,
            scheduler,
            transport,
            commands,
            health,
            session,
            metadata,
            metrics,
            events: Subscribers::new(),
            wiring: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        });
        client.wire();
        client
    }

    fn wire(self: &Arc<Self>) {
        let mut subs = Vec::new();

        let health = Arc::clone(&self.health);
        subs.push(self.transport.on_connect(move |event| {
            debug!(url = %event.url, reconnected = event.reconnected, "socket connected");
            health.update_ws_connection(true);
        }));

        let health = Arc::clone(&self.health);
        let events = self.events.clone();
        subs.push(self.transport.on_disconnect(move |event| {
            health.update_ws_connection(false);
            if event.kind == CloseKind::Superseded {
                warn!(reason = %event.reason, "session superseded by another client");
                events.emit(&ClientEvent::Superseded {
                    reason: event.reason.clone(),
                });
            }
        }));

        let health = Arc::clone(&self.health);
        let metrics = Arc::clone(&self.metrics);
        subs.push(self.transport.on(kind::HEARTBEAT, move |envelope: &Envelope| {
            match envelope.payload_as::<HeartbeatPayload>() {
                Ok(heartbeat) => {
                    metrics.set_fps_ewma(heartbeat.fps_ewma);
                    health.update_heartbeat(envelope.ts(), &heartbeat);
                }
                Err(e) => warn!(error = %e, "unreadable heartbeat"),
            }
        }));

        let buffer = Arc::clone(&self.metadata);
        let metrics = Arc::clone(&self.metrics);
        subs.push(self.transport.on(kind::METADATA_UPDATE, move |envelope: &Envelope| {
            match envelope.payload_as::<MetadataUpdate>() {
                Ok(update) => {
                    metrics.record_metadata_pushed();
                    let evicted = buffer.push(update);
                    if evicted > 0 {
                        metrics.record_metadata_evicted(evicted as u64);
                    }
                }
                Err(e) => debug!(error = %e, "unreadable metadata update"),
            }
        }));

        subs.push(self.transport.on(kind::PROTOCOL_WELCOME, |envelope: &Envelope| {
            let welcome = envelope
                .payload_as::<ProtocolWelcomePayload>()
                .unwrap_or_default();
            info!(
                version = %welcome.version,
                negotiated = ?welcome.negotiated_version,
                features = ?welcome.features,
                "protocol welcome"
            );
        }));

        let session = Arc::clone(&self.session);
        let events = self.events.clone();
        subs.push(self.transport.on(kind::SESSION_REVOKED, move |envelope: &Envelope| {
            let revoked = envelope
                .payload_as::<SessionRevokedPayload>()
                .unwrap_or(SessionRevokedPayload {
                    reason: "unknown".into(),
                    message: String::new(),
                });
            session.revoke_local(&revoked.reason);
            events.emit(&ClientEvent::Revoked {
                reason: revoked.reason,
                message: revoked.message,
            });
        }));

        let transport: Weak<Transport> = Arc::downgrade(&self.transport);
        let session = Arc::clone(&self.session);
        let events = self.events.clone();
        subs.push(self.transport.on(kind::STREAM_CHANGED, move |envelope: &Envelope| {
            let Some(transport) = transport.upgrade() else {
                return;
            };
            let changed = match envelope.payload_as::<StreamChangedPayload>() {
                Ok(changed) => changed,
                Err(e) => {
                    warn!(error = %e, "unreadable stream.changed");
                    return;
                }
            };
            info!(reason = %changed.reason, play_url = %changed.play_url, "stream changed");
            let ack = StreamChangedAck {
                status: "ok".into(),
            };
            transport.send(
                kind::STREAM_CHANGED_ACK,
                serde_json::to_value(ack).unwrap_or_else(|_| json!({"status": "ok"})),
            );
            if let Some(stream_id) = changed.new_stream_id {
                session.apply_stream_change(stream_id.clone(), changed.play_url.clone());
                transport.set_stream_id(stream_id.clone());
                events.emit(&ClientEvent::StreamChanged {
                    stream_id,
                    play_url: changed.play_url,
                });
            }
        }));

        subs.push(self.transport.on(kind::CMD_ERROR, |envelope: &Envelope| {
            if let Ok(err) = envelope.payload_as::<CmdErrorPayload>() {
                warn!(
                    request_id = %err.request_id,
                    code = err.code.as_str(),
                    message = %err.message,
                    "command rejected"
                );
            }
        }));

        let metrics = Arc::clone(&self.metrics);
        subs.push(self.health.subscribe(move |state| {
            metrics.record_health_transition();
            info!(health = %state.health, fps = state.fps_ewma, "connection health changed");
        }));

        let metrics = Arc::clone(&self.metrics);
        subs.push(self.metadata.subscribe(move |_| metrics.record_metadata_emitted()));

        let client: Weak<Self> = Arc::downgrade(self);
        subs.push(self.session.subscribe(move |event| {
            if let SessionEvent::Replaced { session, .. } = event {
                if let Some(client) = client.upgrade() {
                    client.reconnect_as(session.clone());
                }
            }
        }));

        *self.wiring.lock() = subs;
    }

    /// Point the socket at a replacement session.
    fn reconnect_as(self: &Arc<Self>, session: Session) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        self.events
            .emit(&ClientEvent::SessionReplaced(session.clone()));
        let endpoint = self.endpoint_for(&session);
        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            transport.disconnect();
            if let Err(e) = transport.connect(endpoint).await {
                error!(error = %e, "reconnect with replacement session failed");
            }
        });
    }

    fn endpoint_for(&self, session: &Session) -> Endpoint {
        Endpoint {
            url: session.socket_url(&self.settings.ws_base_url),
            session_id: session.session_id.clone(),
            stream_id: session.stream_id.clone(),
        }
    }

    /// Restore the cached session or create one for `stream_id`, then open the
    /// socket. A failed open is returned but reconnection continues in the
    /// background.
    pub async fn initialize(self: &Arc<Self>, stream_id: &StreamId) -> Result<Session, ClientError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(ClientError::Destroyed);
        }
        if !self.started.swap(true, Ordering::SeqCst) {
            self.health.start(self.scheduler.as_ref());
            self.metadata.start(self.scheduler.as_ref());
        }

        let session = match self.session.restore_session().await? {
            Some(session) => session,
            None => {
                self.session
                    .create_session(stream_id, Role::Operator, Map::new())
                    .await?
            }
        };
        info!(
            session_id = %session.session_id,
            stream_id = %session.stream_id,
            "client initialized"
        );

        self.transport.connect(self.endpoint_for(&session)).await?;
        Ok(session)
    }

    /// Tear everything down. The cached session survives for the next run.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        for sub in self.wiring.lock().drain(..) {
            sub.unsubscribe();
        }
        self.commands.close();
        self.transport.destroy();
        self.health.destroy();
        self.metadata.destroy();
        self.session.destroy();
        self.events.clear();
        info!("client destroyed");
    }

    /// End the session on the backend and forget it locally.
    pub async fn logout(&self) {
        self.session.delete_session(None).await;
        self.transport.disconnect();
    }

    pub async fn streams(&self) -> Result<Vec<StreamInfo>, ClientError> {
        Ok(self.http.streams().await?)
    }

    pub async fn backend_config(&self) -> Result<BackendConfig, ClientError> {
        Ok(self.http.config().await?)
    }

    /// Move the session to `stream_id` and restamp outgoing envelopes with the
    /// stream the backend confirmed.
    pub async fn switch_stream(&self, stream_id: &StreamId) -> bool {
        if !self.session.switch_stream(stream_id).await {
            return false;
        }
        if let Some(session) = self.session.current() {
            self.transport.set_stream_id(session.stream_id);
        }
        true
    }

    pub async fn send_command(
        &self,
        command: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<CmdAckPayload, ClientError> {
        Ok(self.commands.send(command, payload, timeout).await?)
    }

    pub fn on_event(&self, handler: impl Fn(&ClientEvent) + Send + Sync + 'static) -> Subscription {
        self.events.subscribe(handler)
    }

    pub fn on_health(
        &self,
        handler: impl Fn(&ConnectionHealthState) + Send + Sync + 'static,
    ) -> Subscription {
        self.health.subscribe(handler)
    }

    /// Throttled metadata, at most one update per throttle interval.
    pub fn on_metadata(
        &self,
        handler: impl Fn(&MetadataUpdate) + Send + Sync + 'static,
    ) -> Subscription {
        self.metadata.subscribe(handler)
    }

    pub fn session(&self) -> Option<Session> {
        self.session.current()
    }

    pub fn health(&self) -> ConnectionHealthState {
        self.health.state()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}
