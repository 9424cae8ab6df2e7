//! Request/reply correlation for `cmd.*` envelopes.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use cuelink_core::envelope::{kind, CmdAckPayload, CmdErrorPayload};
use cuelink_core::{Envelope, RequestId, Subscription};
use cuelink_telemetry::ClientMetrics;

use crate::error::CommandError;
use crate::transport::Transport;

type Pending = Arc<DashMap<RequestId, oneshot::Sender<Result<CmdAckPayload, CommandError>>>>;

/// Sends commands over a [`Transport`] and resolves them from `cmd.ack` /
/// `cmd.error` replies carrying the same `request_id`.
pub struct CommandChannel {
    transport: Arc<Transport>,
    pending: Pending,
    metrics: Option<Arc<ClientMetrics>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl CommandChannel {
    pub fn new(transport: Arc<Transport>, metrics: Option<Arc<ClientMetrics>>) -> Self {
        let pending: Pending = Arc::new(DashMap::new());

        let acks = Arc::clone(&pending);
        let ack_sub = transport.on(kind::CMD_ACK, move |envelope: &Envelope| {
            match envelope.payload_as::<CmdAckPayload>() {
                Ok(ack) => match acks.remove(&ack.request_id) {
                    Some((_, tx)) => {
                        let _ = tx.send(Ok(ack));
                    }
                    None => debug!(request_id = %ack.request_id, "ack for unknown request"),
                },
                Err(e) => warn!(error = %e, "unreadable cmd.ack"),
            }
        });

        let errors = Arc::clone(&pending);
        let error_sub = transport.on(kind::CMD_ERROR, move |envelope: &Envelope| {
            match envelope.payload_as::<CmdErrorPayload>() {
                Ok(err) => match errors.remove(&err.request_id) {
                    Some((_, tx)) => {
                        let _ = tx.send(Err(CommandError::Rejected {
                            code: err.code,
                            message: err.message,
                            details: err.details,
                        }));
                    }
                    None => debug!(request_id = %err.request_id, "error for unknown request"),
                },
                Err(e) => warn!(error = %e, "unreadable cmd.error"),
            }
        });

        let dropped = Arc::clone(&pending);
        let disconnect_sub = transport.on_disconnect(move |_| fail_all(&dropped));

        Self {
            transport,
            pending,
            metrics,
            subscriptions: Mutex::new(vec![ack_sub, error_sub, disconnect_sub]),
        }
    }

    /// Send `command` (which must start with `cmd.`) and wait for its reply.
    pub async fn send(
        &self,
        command: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<CmdAckPayload, CommandError> {
        if !command.starts_with(kind::CMD_PREFIX)
            || command == kind::CMD_ACK
            || command == kind::CMD_ERROR
        {
            return Err(CommandError::InvalidKind(command.to_string()));
        }
        let mut body = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            _ => return Err(CommandError::InvalidPayload),
        };

        let request_id = RequestId::generate();
        body.insert(
            "request_id".into(),
            Value::String(request_id.as_str().to_string()),
        );

        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id.clone(), tx);

        if !self.transport.send(command, Value::Object(body)) {
            self.pending.remove(&request_id);
            return Err(CommandError::NotConnected);
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_command_sent();
        }
        debug!(command, %request_id, "command sent");

        let result = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CommandError::TransportClosed),
            Err(_) => {
                self.pending.remove(&request_id);
                Err(CommandError::Timeout(timeout))
            }
        };
        if let (Err(e), Some(metrics)) = (&result, &self.metrics) {
            metrics.record_command_failed();
            debug!(command, %request_id, error_kind = e.error_kind(), "command failed");
        }
        result
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Fail every pending command and stop listening for replies.
    pub fn close(&self) {
        for sub in self.subscriptions.lock().drain(..) {
            sub.unsubscribe();
        }
        fail_all(&self.pending);
    }
}

fn fail_all(pending: &Pending) {
    let ids: Vec<RequestId> = pending.iter().map(|entry| entry.key().clone()).collect();
    for id in ids {
        if let Some((_, tx)) = pending.remove(&id) {
            let _ = tx.send(Err(CommandError::TransportClosed));
        }
    }
}
