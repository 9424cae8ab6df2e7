//! Single persistent socket with envelope framing and automatic reconnection.
//!
//! Every open attempt gets a fresh generation number. Socket tasks and timers
//! carry the generation they were started for and are ignored once a newer
//! connect, reconnect or disconnect has moved the link on.

use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use cuelink_core::envelope::{
    kind, ClientHeartbeatPayload, ProtocolHelloPayload, ProtocolWelcomePayload,
    DEFAULT_PROTOCOL_VERSION, SUPPORTED_VERSIONS,
};
use cuelink_core::{
    Clock, Envelope, Scheduler, SessionId, StreamId, Subscribers, Subscription, TimerHandle,
    Topics,
};
use cuelink_telemetry::ClientMetrics;

use crate::error::TransportError;
use crate::policy::ReconnectPolicy;

/// Close code sent on a deliberate client disconnect.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Close code the backend uses when a newer connection took over this session.
pub const SUPERSEDED_CLOSURE: u16 = 4001;

const DISCONNECT_REASON: &str = "client disconnect";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Clone, Debug)]
pub struct TransportConfig {
    pub policy: ReconnectPolicy,
    /// Period of outgoing `client.heartbeat` envelopes.
    pub heartbeat_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            policy: ReconnectPolicy::default(),
            heartbeat_interval: Duration::from_secs(5),
        }
    }
}

/// Where to connect and which ids to stamp on outgoing envelopes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub url: String,
    pub session_id: SessionId,
    pub stream_id: StreamId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Connecting,
    Open,
    Closed,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}

/// Why a connection ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseKind {
    /// `disconnect()` was called.
    Intentional,
    /// Closed by the backend with [`SUPERSEDED_CLOSURE`]; never retried.
    Superseded,
    /// Anything else, including a failed open.
    Unexpected,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectEvent {
    pub url: String,
    /// The open came from the reconnect timer rather than `connect()`.
    pub reconnected: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DisconnectEvent {
    pub code: Option<u16>,
    pub reason: String,
    pub kind: CloseKind,
    /// Delay of the scheduled reconnect, if one was scheduled.
    pub reconnect_in: Option<Duration>,
    /// Reconnects fired since the last successful open.
    pub attempts: u32,
}

struct Link {
    endpoint: Option<Endpoint>,
    state: LinkState,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    generation: u64,
    attempts: u32,
    intentional: bool,
    terminated: bool,
    version: u32,
    handshake_complete: bool,
    reconnect_timer: Option<TimerHandle>,
    heartbeat_timer: Option<TimerHandle>,
}

impl Link {
    fn new() -> Self {
        Self {
            endpoint: None,
            state: LinkState::Idle,
            outbound: None,
            generation: 0,
            attempts: 0,
            intentional: false,
            terminated: false,
            version: DEFAULT_PROTOCOL_VERSION,
            handshake_complete: false,
            reconnect_timer: None,
            heartbeat_timer: None,
        }
    }
}

pub struct Transport {
    config: TransportConfig,
    scheduler: Arc<dyn Scheduler>,
    clock: Arc<dyn Clock>,
    metrics: Option<Arc<ClientMetrics>>,
    link: Mutex<Link>,
    handlers: Topics<Envelope>,
    on_connect: Subscribers<ConnectEvent>,
    on_disconnect: Subscribers<DisconnectEvent>,
}

impl Transport {
    pub fn new(
        config: TransportConfig,
        scheduler: Arc<dyn Scheduler>,
        clock: Arc<dyn Clock>,
        metrics: Option<Arc<ClientMetrics>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            scheduler,
            clock,
            metrics,
            link: Mutex::new(Link::new()),
            handlers: Topics::new(),
            on_connect: Subscribers::new(),
            on_disconnect: Subscribers::new(),
        })
    }

    /// Open the socket. A no-op while already open or connecting.
    ///
    /// A failed open is treated like an unexpected closure: the error is
    /// returned and a reconnect is scheduled.
    pub async fn connect(self: &Arc<Self>, endpoint: Endpoint) -> Result<(), TransportError> {
        let generation = {
            let mut link = self.link.lock();
            if matches!(link.state, LinkState::Open | LinkState::Connecting) {
                info!(state = link.state.as_str(), "connect ignored, link already active");
                return Ok(());
            }
            link.endpoint = Some(endpoint);
            link.intentional = false;
            link.terminated = false;
            link.reconnect_timer = None;
            link.generation += 1;
            link.state = LinkState::Connecting;
            link.generation
        };
        Arc::clone(self).open(generation, false).await
    }

    fn open(
        self: Arc<Self>,
        generation: u64,
        reconnected: bool,
    ) -> BoxFuture<'static, Result<(), TransportError>> {
        async move {
            let url = {
                let link = self.link.lock();
                match &link.endpoint {
                    Some(endpoint) => endpoint.url.clone(),
                    None => return Err(TransportError::NoEndpoint),
                }
            };
            debug!(%url, generation, "opening socket");

            match connect_async(url.as_str()).await {
                Ok((ws, _)) => {
                    self.on_open(generation, ws, url, reconnected);
                    Ok(())
                }
                Err(e) => {
                    warn!(%url, error = %e, "socket open failed");
                    self.on_closed(generation, None, e.to_string());
                    Err(TransportError::Connect {
                        url,
                        message: e.to_string(),
                    })
                }
            }
        }
        .boxed()
    }

    fn on_open(self: &Arc<Self>, generation: u64, mut ws: WsStream, url: String, reconnected: bool) {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut link = self.link.lock();
            if link.generation != generation {
                drop(link);
                debug!(%url, "socket opened after link moved on, closing it");
                tokio::spawn(async move {
                    let _ = ws.close(None).await;
                });
                return;
            }
            link.state = LinkState::Open;
            link.outbound = Some(tx);
            link.attempts = 0;
            link.version = DEFAULT_PROTOCOL_VERSION;
            link.handshake_complete = false;
            link.reconnect_timer = None;

            let weak = Arc::downgrade(self);
            link.heartbeat_timer = Some(self.scheduler.every(
                self.config.heartbeat_interval,
                Box::new(move || {
                    if let Some(transport) = weak.upgrade() {
                        transport.send_heartbeat();
                    }
                }),
            ));
        }

        tokio::spawn(pump(Arc::downgrade(self), generation, ws, rx));
        info!(%url, reconnected, "socket connected");

        let hello = ProtocolHelloPayload {
            supported_versions: SUPPORTED_VERSIONS.to_vec(),
        };
        match serde_json::to_value(&hello) {
            Ok(payload) => {
                self.send(kind::PROTOCOL_HELLO, payload);
            }
            Err(e) => warn!(error = %e, "failed to encode protocol.hello"),
        }

        self.on_connect.emit(&ConnectEvent { url, reconnected });
    }

    fn on_closed(self: &Arc<Self>, generation: u64, code: Option<u16>, reason: String) {
        let event = {
            let mut link = self.link.lock();
            if link.generation != generation {
                return;
            }
            link.state = LinkState::Closed;
            link.outbound = None;
            link.heartbeat_timer = None;
            link.handshake_complete = false;

            let kind = if link.intentional {
                CloseKind::Intentional
            } else if code == Some(SUPERSEDED_CLOSURE) {
                link.terminated = true;
                CloseKind::Superseded
            } else {
                CloseKind::Unexpected
            };

            let mut reconnect_in = None;
            if kind == CloseKind::Unexpected && !link.terminated {
                if self.config.policy.exhausted(link.attempts) {
                    warn!(
                        attempts = link.attempts,
                        "reconnect attempts exhausted, giving up"
                    );
                } else {
                    let delay = self.config.policy.delay_for(link.attempts);
                    let weak = Arc::downgrade(self);
                    link.reconnect_timer = Some(self.scheduler.after(
                        delay,
                        async move {
                            if let Some(transport) = weak.upgrade() {
                                transport.fire_reconnect(generation).await;
                            }
                        }
                        .boxed(),
                    ));
                    reconnect_in = Some(delay);
                }
            }

            DisconnectEvent {
                code,
                reason,
                kind,
                reconnect_in,
                attempts: link.attempts,
            }
        };

        match event.kind {
            CloseKind::Superseded => warn!(
                code = ?event.code,
                "connection superseded by a newer client, not reconnecting"
            ),
            _ => info!(
                code = ?event.code,
                reason = %event.reason,
                kind = ?event.kind,
                reconnect_in_ms = event.reconnect_in.map(|d| d.as_millis() as u64),
                "socket closed"
            ),
        }
        self.on_disconnect.emit(&event);
    }

    async fn fire_reconnect(self: Arc<Self>, generation: u64) {
        let next = {
            let mut link = self.link.lock();
            if link.generation != generation || link.intentional || link.terminated {
                return;
            }
            link.reconnect_timer = None;
            link.attempts += 1;
            link.generation += 1;
            link.state = LinkState::Connecting;
            (link.generation, link.attempts)
        };
        if let Some(metrics) = &self.metrics {
            metrics.record_reconnect();
        }
        info!(attempt = next.1, "reconnecting");
        let _ = self.open(next.0, true).await;
    }

    fn handle_text(&self, generation: u64, text: &str) {
        if self.link.lock().generation != generation {
            return;
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_envelope();
        }
        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, len = text.len(), "dropping malformed envelope");
                if let Some(metrics) = &self.metrics {
                    metrics.record_malformed();
                }
                return;
            }
        };
        if envelope.kind() == kind::PROTOCOL_WELCOME {
            self.complete_handshake(generation, &envelope);
        }
        self.handlers.dispatch(envelope.kind(), &envelope);
    }

    /// First `protocol.welcome` of a connection fixes the version stamped on
    /// outgoing envelopes.
    fn complete_handshake(&self, generation: u64, envelope: &Envelope) {
        let welcome: ProtocolWelcomePayload = match envelope.payload_as() {
            Ok(welcome) => welcome,
            Err(e) => {
                warn!(error = %e, "unreadable protocol.welcome");
                return;
            }
        };
        let declared = welcome.negotiated_version.unwrap_or(envelope.version());

        let mut link = self.link.lock();
        if link.generation != generation || link.handshake_complete {
            return;
        }
        link.handshake_complete = true;
        if SUPPORTED_VERSIONS.contains(&declared) {
            link.version = declared;
            info!(
                version = declared,
                server_version = %welcome.version,
                features = ?welcome.features,
                "protocol negotiated"
            );
        } else {
            warn!(
                declared,
                kept = link.version,
                "backend declared an unsupported protocol version"
            );
        }
    }

    /// Queue an envelope stamped with the negotiated version, the current time
    /// and the endpoint's ids. Returns false, with a warning, when not open.
    pub fn send(&self, kind: &str, payload: Value) -> bool {
        self.send_with(kind, payload, None, None)
    }

    pub fn send_with(
        &self,
        kind: &str,
        payload: Value,
        session_id: Option<SessionId>,
        stream_id: Option<StreamId>,
    ) -> bool {
        let link = self.link.lock();
        let (Some(tx), LinkState::Open) = (link.outbound.as_ref(), link.state) else {
            warn!(kind, "send while not connected, dropping");
            return false;
        };
        let (default_session, default_stream) = link
            .endpoint
            .as_ref()
            .map(|e| (e.session_id.clone(), e.stream_id.clone()))
            .unwrap_or_default();
        let envelope = Envelope::new(
            link.version,
            kind,
            self.clock.now_ms(),
            session_id.unwrap_or(default_session),
            stream_id.unwrap_or(default_stream),
            payload,
        );
        match envelope.to_json() {
            Ok(text) => tx.send(Message::Text(text.into())).is_ok(),
            Err(e) => {
                warn!(kind, error = %e, "failed to encode envelope");
                false
            }
        }
    }

    fn send_heartbeat(&self) {
        let payload = ClientHeartbeatPayload {
            ts_client: self.clock.now_ms(),
        };
        if let Ok(payload) = serde_json::to_value(payload) {
            self.send(kind::CLIENT_HEARTBEAT, payload);
        }
    }

    /// Close with code 1000. Stops heartbeats and cancels any pending reconnect.
    pub fn disconnect(&self) {
        let (was_open, outbound, attempts) = {
            let mut link = self.link.lock();
            link.intentional = true;
            link.reconnect_timer = None;
            link.heartbeat_timer = None;
            link.handshake_complete = false;
            link.generation += 1;
            let was_open = link.state == LinkState::Open;
            link.state = LinkState::Closed;
            (was_open, link.outbound.take(), link.attempts)
        };

        if let Some(tx) = outbound {
            let _ = tx.send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: DISCONNECT_REASON.to_string().into(),
            })));
        }

        if was_open {
            info!("socket disconnected by client");
            self.on_disconnect.emit(&DisconnectEvent {
                code: Some(NORMAL_CLOSURE),
                reason: DISCONNECT_REASON.to_string(),
                kind: CloseKind::Intentional,
                reconnect_in: None,
                attempts,
            });
        }
    }

    /// Subscribe to inbound envelopes of one type, or `"*"` for all.
    pub fn on(&self, kind: &str, handler: impl Fn(&Envelope) + Send + Sync + 'static) -> Subscription {
        self.handlers.subscribe(kind, handler)
    }

    pub fn on_connect(&self, handler: impl Fn(&ConnectEvent) + Send + Sync + 'static) -> Subscription {
        self.on_connect.subscribe(handler)
    }

    pub fn on_disconnect(
        &self,
        handler: impl Fn(&DisconnectEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.on_disconnect.subscribe(handler)
    }

    /// Change the stream id stamped on later envelopes.
    pub fn set_stream_id(&self, stream_id: StreamId) {
        if let Some(endpoint) = self.link.lock().endpoint.as_mut() {
            endpoint.stream_id = stream_id;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link.lock().state == LinkState::Open
    }

    pub fn state(&self) -> LinkState {
        self.link.lock().state
    }

    pub fn endpoint(&self) -> Option<Endpoint> {
        self.link.lock().endpoint.clone()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.link.lock().attempts
    }

    pub fn negotiated_version(&self) -> u32 {
        self.link.lock().version
    }

    pub fn is_reconnect_pending(&self) -> bool {
        self.link.lock().reconnect_timer.is_some()
    }

    /// Superseded by another client; only an explicit `connect` revives it.
    pub fn is_terminated(&self) -> bool {
        self.link.lock().terminated
    }

    /// Disconnect and drop every subscriber.
    pub fn destroy(&self) {
        self.disconnect();
        self.handlers.clear();
        self.on_connect.clear();
        self.on_disconnect.clear();
    }
}

/// Owns one socket: forwards queued frames out, parses inbound text frames.
async fn pump(
    transport: Weak<Transport>,
    generation: u64,
    ws: WsStream,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) {
    let (mut sink, mut stream) = ws.split();
    let mut close: (Option<u16>, String) = (None, String::new());

    loop {
        tokio::select! {
            queued = outbound.recv() => {
                let Some(msg) = queued else { break };
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = sink.send(msg).await {
                    warn!(error = %e, "socket write failed");
                    close.1 = e.to_string();
                    break;
                }
                if closing {
                    break;
                }
            }
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    let Some(transport) = transport.upgrade() else { break };
                    transport.handle_text(generation, text.as_str());
                }
                Some(Ok(Message::Close(frame))) => {
                    if let Some(frame) = frame {
                        close = (Some(u16::from(frame.code)), frame.reason.to_string());
                    }
                    break;
                }
                Some(Ok(Message::Binary(bytes))) => {
                    debug!(len = bytes.len(), "ignoring binary frame");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "socket read failed");
                    close.1 = e.to_string();
                    break;
                }
                None => break,
            }
        }
    }

    let _ = sink.close().await;
    if let Some(transport) = transport.upgrade() {
        transport.on_closed(generation, close.0, close.1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cuelink_core::{ManualClock, TokioScheduler};
    use serde_json::json;

    fn transport() -> Arc<Transport> {
        Transport::new(
            TransportConfig::default(),
            Arc::new(TokioScheduler),
            Arc::new(ManualClock::new(1_000)),
            None,
        )
    }

    #[test]
    fn starts_idle() {
        let t = transport();
        assert_eq!(t.state(), LinkState::Idle);
        assert!(!t.is_connected());
        assert_eq!(t.negotiated_version(), DEFAULT_PROTOCOL_VERSION);
        assert_eq!(t.reconnect_attempts(), 0);
        assert!(t.endpoint().is_none());
    }

    #[test]
    fn send_while_disconnected_is_noop() {
        let t = transport();
        assert!(!t.send(kind::CLIENT_HEARTBEAT, json!({"ts_client": 1})));
    }

    #[test]
    fn disconnect_when_idle_emits_nothing() {
        let t = transport();
        let seen = Arc::new(Mutex::new(0u32));
        let counter = Arc::clone(&seen);
        let _s = t.on_disconnect(move |_| *counter.lock() += 1);
        t.disconnect();
        assert_eq!(*seen.lock(), 0);
        assert_eq!(t.state(), LinkState::Closed);
    }

    #[test]
    fn malformed_text_is_dropped_without_dispatch() {
        let t = transport();
        let seen = Arc::new(Mutex::new(0u32));
        let counter = Arc::clone(&seen);
        let _s = t.on(kind::WILDCARD, move |_| *counter.lock() += 1);

        let generation = t.link.lock().generation;
        t.handle_text(generation, "{not json");
        t.handle_text(generation, r#"{"type":"heartbeat"}"#);
        assert_eq!(*seen.lock(), 0);

        t.handle_text(generation, r#"{"v":1,"type":"heartbeat","ts":5}"#);
        assert_eq!(*seen.lock(), 1);
    }

    #[test]
    fn first_welcome_fixes_version() {
        let t = transport();
        let generation = t.link.lock().generation;
        t.handle_text(
            generation,
            r#"{"v":1,"type":"protocol.welcome","ts":5,"payload":{"version":"1.5.0","negotiated_version":1}}"#,
        );
        assert!(t.link.lock().handshake_complete);
        assert_eq!(t.negotiated_version(), 1);

        // Unsupported declarations are ignored.
        t.link.lock().handshake_complete = false;
        t.handle_text(
            generation,
            r#"{"v":1,"type":"protocol.welcome","ts":6,"payload":{"negotiated_version":9}}"#,
        );
        assert_eq!(t.negotiated_version(), 1);
    }

    #[test]
    fn stale_generation_text_ignored() {
        let t = transport();
        let seen = Arc::new(Mutex::new(0u32));
        let counter = Arc::clone(&seen);
        let _s = t.on(kind::HEARTBEAT, move |_| *counter.lock() += 1);
        t.handle_text(42, r#"{"v":1,"type":"heartbeat","ts":5}"#);
        assert_eq!(*seen.lock(), 0);
    }

    #[tokio::test]
    async fn failed_open_schedules_reconnect() {
        let t = transport();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let _s = t.on_disconnect(move |e| sink.lock().push(e.clone()));

        // Port 9 on loopback refuses connections.
        let result = t
            .connect(Endpoint {
                url: "ws://127.0.0.1:9/ws".into(),
                session_id: SessionId::from("s1"),
                stream_id: StreamId::from("camera1"),
            })
            .await;
        assert!(matches!(result, Err(TransportError::Connect { .. })));
        assert_eq!(t.state(), LinkState::Closed);
        assert!(t.is_reconnect_pending());

        let events = events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, CloseKind::Unexpected);
        assert!(events[0].reconnect_in.is_some());
        drop(events);

        t.disconnect();
        assert!(!t.is_reconnect_pending());
    }
}
