//! Wire envelope and the payloads carried inside it.
//!
//! Every message in either direction is a JSON object of the shape
//! `{v, type, ts, session_id, stream_id, payload}`. The `type` tag is an open
//! string; the constants in [`kind`] cover the tags this client produces or
//! understands, anything else is still delivered to wildcard subscribers.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::CommandErrorCode;
use crate::ids::{RequestId, SessionId, StreamId};

/// Protocol version used until a handshake says otherwise.
pub const DEFAULT_PROTOCOL_VERSION: u32 = 1;

/// Versions offered in `protocol.hello`.
pub const SUPPORTED_VERSIONS: &[u32] = &[1];

pub mod kind {
    pub const HEARTBEAT: &str = "heartbeat";
    pub const CLIENT_HEARTBEAT: &str = "client.heartbeat";
    pub const METADATA_UPDATE: &str = "metadata.update";
    pub const STREAM_CHANGED: &str = "stream.changed";
    pub const STREAM_CHANGED_ACK: &str = "stream.changed.ack";
    pub const SESSION_REVOKED: &str = "session.revoked";
    pub const PROTOCOL_HELLO: &str = "protocol.hello";
    pub const PROTOCOL_WELCOME: &str = "protocol.welcome";
    pub const CMD_ACK: &str = "cmd.ack";
    pub const CMD_ERROR: &str = "cmd.error";
    /// Prefix shared by every client-issued command.
    pub const CMD_PREFIX: &str = "cmd.";
    /// Subscription topic matching every inbound envelope.
    pub const WILDCARD: &str = "*";
}

/// The versioned wire unit. Immutable once built.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    v: u32,
    #[serde(rename = "type")]
    kind: String,
    ts: i64,
    #[serde(default)]
    session_id: SessionId,
    #[serde(default)]
    stream_id: StreamId,
    #[serde(default = "empty_object")]
    payload: Value,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl Envelope {
    pub fn new(
        version: u32,
        kind: impl Into<String>,
        ts: i64,
        session_id: SessionId,
        stream_id: StreamId,
        payload: Value,
    ) -> Self {
        Self {
            v: version,
            kind: kind.into(),
            ts,
            session_id,
            stream_id,
            payload,
        }
    }

    /// Parse one inbound text frame.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn version(&self) -> u32 {
        self.v
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn ts(&self) -> i64 {
        self.ts
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Decode the payload into one of the typed payload structs.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

/// Upstream processing status reported in heartbeats.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    Running,
    Reconnecting,
    #[default]
    NoSignal,
    Error,
    /// A tag this client does not know yet.
    #[serde(other)]
    Unrecognized,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Reconnecting => "RECONNECTING",
            Self::NoSignal => "NO_SIGNAL",
            Self::Error => "ERROR",
            Self::Unrecognized => "UNRECOGNIZED",
        }
    }
}

/// `heartbeat` (server → client).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    #[serde(default)]
    pub alive: bool,
    #[serde(default)]
    pub last_frame_ts: i64,
    #[serde(default)]
    pub fps_ewma: f64,
    #[serde(default)]
    pub pipeline_state: PipelineState,
}

/// `client.heartbeat` (client → server).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientHeartbeatPayload {
    pub ts_client: i64,
}

/// One detected object in a metadata frame. Fields the client does not model
/// are kept in `extra`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(default)]
    pub bbox: Vec<f64>,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_id: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `metadata.update` (server → client), pushed at up to the backend's
/// configured rate.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataUpdate {
    pub frame_id: u64,
    #[serde(default)]
    pub ts_backend: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts_capture: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub img_w: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub img_h: Option<u32>,
    #[serde(default)]
    pub detected_count: u32,
    #[serde(default)]
    pub tracking_state: String,
    #[serde(default)]
    pub detections: Vec<Detection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prediction: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ar_paths: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_hz: Option<f64>,
}

/// `stream.changed` (server → client, must be acknowledged).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChangedPayload {
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub play_url: String,
    #[serde(default)]
    pub new_stream_id: Option<StreamId>,
}

/// `stream.changed.ack` (client → server).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChangedAck {
    pub status: String,
}

/// `session.revoked` (server → client).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRevokedPayload {
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

/// `protocol.hello` (client → server).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolHelloPayload {
    pub supported_versions: Vec<u32>,
}

/// `protocol.welcome` (server → client).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolWelcomePayload {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub connection_id: Option<String>,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub negotiated_version: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Accepted,
    Applied,
}

/// `cmd.ack` (server → client).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CmdAckPayload {
    pub request_id: RequestId,
    pub status: CommandStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_state: Option<Value>,
}

/// `cmd.error` (server → client). `message` is for debugging only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CmdErrorPayload {
    pub request_id: RequestId,
    pub code: CommandErrorCode,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Map<String, Value>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_backend_envelope() {
        let text = r#"{"v":1,"type":"heartbeat","ts":1700000000000,"session_id":"s1","stream_id":"camera1",
            "payload":{"alive":true,"last_frame_ts":1699999999900,"fps_ewma":29.7,"pipeline_state":"RUNNING"}}"#;
        let env = Envelope::parse(text).unwrap();
        assert_eq!(env.kind(), kind::HEARTBEAT);
        assert_eq!(env.version(), 1);
        assert_eq!(env.session_id().as_str(), "s1");

        let hb: HeartbeatPayload = env.payload_as().unwrap();
        assert!(hb.alive);
        assert_eq!(hb.pipeline_state, PipelineState::Running);
        assert!((hb.fps_ewma - 29.7).abs() < f64::EPSILON);
    }

    #[test]
    fn serializes_type_tag() {
        let env = Envelope::new(
            1,
            kind::CLIENT_HEARTBEAT,
            42,
            SessionId::from("s1"),
            StreamId::from("camera1"),
            json!({"ts_client": 42}),
        );
        let value: Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "client.heartbeat");
        assert_eq!(value["v"], 1);
        assert_eq!(value["payload"]["ts_client"], 42);
        assert_eq!(value["stream_id"], "camera1");
    }

    #[test]
    fn missing_ids_and_payload_default() {
        let env = Envelope::parse(r#"{"v":1,"type":"protocol.welcome","ts":5}"#).unwrap();
        assert!(env.session_id().is_empty());
        assert!(env.payload().as_object().is_some_and(|m| m.is_empty()));
    }

    #[test]
    fn rejects_non_envelope_json() {
        assert!(Envelope::parse("not json").is_err());
        assert!(Envelope::parse(r#"{"type":"heartbeat"}"#).is_err());
    }

    #[test]
    fn unknown_pipeline_state_is_unrecognized() {
        let hb: HeartbeatPayload =
            serde_json::from_value(json!({"pipeline_state": "WARMING_UP"})).unwrap();
        assert_eq!(hb.pipeline_state, PipelineState::Unrecognized);
    }

    #[test]
    fn heartbeat_defaults_when_fields_missing() {
        let hb: HeartbeatPayload = serde_json::from_value(json!({})).unwrap();
        assert_eq!(hb.pipeline_state, PipelineState::NoSignal);
        assert_eq!(hb.fps_ewma, 0.0);
        assert_eq!(hb.last_frame_ts, 0);
    }

    #[test]
    fn metadata_keeps_unmodelled_detection_fields() {
        let update: MetadataUpdate = serde_json::from_value(json!({
            "frame_id": 7,
            "ts_backend": 1000,
            "detected_count": 1,
            "tracking_state": "active",
            "detections": [{"label": "cue_ball", "score": 0.93, "x": 412, "y": 233}],
            "rate_hz": 10
        }))
        .unwrap();
        assert_eq!(update.frame_id, 7);
        assert_eq!(update.detections[0].label, "cue_ball");
        assert_eq!(update.detections[0].extra["x"], 412);
        assert_eq!(update.rate_hz, Some(10.0));
    }

    #[test]
    fn cmd_error_payload_decodes_code() {
        let payload: CmdErrorPayload = serde_json::from_value(json!({
            "request_id": "req_1",
            "code": "ERR_CAMERA_BUSY",
            "message": "device locked"
        }))
        .unwrap();
        assert_eq!(payload.code, CommandErrorCode::CameraBusy);
        assert_eq!(payload.request_id.as_str(), "req_1");
    }
}
