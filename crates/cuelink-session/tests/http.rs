//! HttpBackend against a local axum server.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};

use cuelink_core::{CommandErrorCode, Role, SessionId, StreamId};
use cuelink_session::{
    ClientInfo, CreateSessionRequest, HttpBackend, SessionApi, SessionApiError, StreamQuality,
};

type Seen = Arc<Mutex<Vec<Value>>>;

async fn create(State(seen): State<Seen>, Json(body): Json<Value>) -> Json<Value> {
    let stream_id = body["stream_id"].as_str().unwrap_or_default().to_string();
    seen.lock().push(body);
    Json(json!({
        "session_id": "sess-1",
        "stream_id": stream_id,
        "role": "operator",
        "permission_flags": ["control"],
        "ws_url": "/ws/control?session_id=sess-1",
        "burnin_url": format!("/burnin/{stream_id}.mjpg"),
        "expires_at": 4_102_444_800_000_i64
    }))
}

async fn renew(Path(id): Path<String>) -> (StatusCode, Json<Value>) {
    if id == "gone" {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": {"code": "ERR_NOT_FOUND", "message": "session not found"}})),
        );
    }
    (
        StatusCode::OK,
        Json(json!({"session_id": id, "expires_at": 4_102_444_900_000_i64, "status": "renewed"})),
    )
}

async fn switch(
    State(seen): State<Seen>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let stream_id = body["stream_id"].as_str().unwrap_or_default().to_string();
    seen.lock().push(body);
    if stream_id == "busy" {
        return (
            StatusCode::CONFLICT,
            Json(json!({"error": {"code": "ERR_CAMERA_BUSY", "message": "camera in use", "details": {"holder": "other"}}})),
        );
    }
    (
        StatusCode::OK,
        Json(json!({
            "session_id": id,
            "new_stream_id": stream_id,
            "new_burnin_url": format!("/burnin/{stream_id}.mjpg")
        })),
    )
}

async fn remove(Path(id): Path<String>) -> StatusCode {
    if id == "gone" {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::NO_CONTENT
    }
}

async fn streams() -> Json<Value> {
    Json(json!([{
        "stream_id": "camera1",
        "name": "Table 1",
        "type": "usb",
        "available": true,
        "resolution": "1920x1080",
        "fps": 30.0,
        "burnin_url": "/burnin/camera1.mjpg",
        "capabilities": ["low", "med", "high"]
    }]))
}

async fn config() -> Json<Value> {
    Json(json!({
        "version": "1.4.0",
        "flags": {"dev_ui": false, "replay": true, "multi_table": false},
        "limits": {"max_sessions": 4, "session_ttl": 600, "metadata_rate_hz": 10.0},
        "streams": {"available_streams": ["camera1"], "default_quality": "high"}
    }))
}

async fn spawn_backend() -> (HttpBackend, Seen) {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let router = Router::new()
        .route("/api/sessions", post(create))
        .route("/api/sessions/{id}/renew", post(renew))
        .route("/api/sessions/{id}/switch_stream", post(switch))
        .route("/api/sessions/{id}", delete(remove))
        .route("/api/streams", get(streams))
        .route("/api/config", get(config))
        .with_state(Arc::clone(&seen));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    (HttpBackend::new(format!("http://{addr}/")).unwrap(), seen)
}

#[tokio::test]
async fn create_posts_request_and_decodes_session() {
    let (backend, seen) = spawn_backend().await;
    let request = CreateSessionRequest {
        stream_id: StreamId::from("camera1"),
        role_requested: Role::Operator,
        client_info: ClientInfo {
            user_agent: "cuelink/test".into(),
            timestamp: 123,
            extra: Default::default(),
        },
    };

    let session = backend.create(&request).await.unwrap();

    assert_eq!(session.session_id.as_str(), "sess-1");
    assert_eq!(session.burnin_url, "/burnin/camera1.mjpg");
    let body = seen.lock()[0].clone();
    assert_eq!(body["role_requested"], "operator");
    assert_eq!(body["client_info"]["user_agent"], "cuelink/test");
    assert_eq!(body["client_info"]["timestamp"], 123);
}

#[tokio::test]
async fn renew_and_error_body() {
    let (backend, _) = spawn_backend().await;

    let renewed = backend.renew(&SessionId::from("sess-1")).await.unwrap();
    assert_eq!(renewed.expires_at, 4_102_444_900_000);
    assert_eq!(renewed.status, "renewed");

    let err = backend.renew(&SessionId::from("gone")).await.unwrap_err();
    match err {
        SessionApiError::Rejected {
            status,
            code,
            message,
        } => {
            assert_eq!(status, 404);
            assert_eq!(code, Some(CommandErrorCode::Unknown("ERR_NOT_FOUND".into())));
            assert_eq!(message, "session not found");
        }
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn switch_stream_sends_target() {
    let (backend, seen) = spawn_backend().await;
    let switched = backend
        .switch_stream(&SessionId::from("sess-1"), &StreamId::from("camera2"))
        .await
        .unwrap();
    assert_eq!(switched.new_stream_id.as_str(), "camera2");
    assert_eq!(switched.new_burnin_url, "/burnin/camera2.mjpg");
    assert_eq!(seen.lock()[0], json!({"stream_id": "camera2"}));

    let err = backend
        .switch_stream(&SessionId::from("sess-1"), &StreamId::from("busy"))
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(err.status(), Some(409));
}

#[tokio::test]
async fn delete_maps_status() {
    let (backend, _) = spawn_backend().await;
    backend.delete(&SessionId::from("sess-1")).await.unwrap();
    let err = backend.delete(&SessionId::from("gone")).await.unwrap_err();
    assert_eq!(err.status(), Some(500));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn discovery_endpoints() {
    let (backend, _) = spawn_backend().await;

    let streams = backend.streams().await.unwrap();
    assert_eq!(streams.len(), 1);
    assert_eq!(streams[0].stream_id.as_str(), "camera1");
    assert_eq!(streams[0].capabilities.len(), 3);

    let config = backend.config().await.unwrap();
    assert_eq!(config.version, "1.4.0");
    assert!(config.flags.replay);
    assert_eq!(config.limits.max_sessions, 4);
    assert_eq!(config.streams.default_quality, StreamQuality::High);
}

#[tokio::test]
async fn unreachable_backend_is_network_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let backend = HttpBackend::new(format!("http://{addr}")).unwrap();
    let err = backend.renew(&SessionId::from("sess-1")).await.unwrap_err();
    assert!(matches!(err, SessionApiError::Network(_)));
}
