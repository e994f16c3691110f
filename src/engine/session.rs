use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::{Duration, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::Inner;
use super::channel::{Connection, Frame};
use super::protocol::{AuthParams, Envelope, methods};
use super::request::{Delivery, handle_tool_request, queue_offline};
use crate::error::GatewayError;
use crate::store::OfflineResult;

const DELIVERY_BUFFER: usize = 64;

/// One agent connection: auth handshake, then the dispatch loop.
///
/// Requests run as their own tasks and feed replies back through the
/// delivery queue, so a session services several requests concurrently
/// and replies may interleave out of request order. When the loop exits,
/// anything still queued that is worth keeping goes to the offline
/// buffer.
pub(crate) async fn run_session(
    inner: Arc<Inner>,
    mut conn: Connection,
    shutdown: CancellationToken,
) {
    if !handshake(&inner, &mut conn).await {
        return;
    }
    let session_id = Uuid::new_v4();
    info!(session_id = %session_id, "agent session authenticated");

    let (delivery_tx, mut delivery_rx) = mpsc::channel::<Delivery>(DELIVERY_BUFFER);
    let outstanding: Arc<Mutex<HashSet<String>>> = Arc::default();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let ids: Vec<String> = outstanding
                    .lock()
                    .expect("outstanding lock poisoned")
                    .iter()
                    .cloned()
                    .collect();
                let notice =
                    Envelope::notification(methods::SHUTTING_DOWN, json!({ "request_ids": ids }));
                let _ = conn.outbound.send(notice).await;
                debug!(session_id = %session_id, outstanding = ids.len(), "session notified of shutdown");
                break;
            }
            maybe = conn.inbound.recv() => {
                match maybe {
                    None => {
                        debug!(session_id = %session_id, "agent disconnected");
                        break;
                    }
                    Some(Frame::Malformed(detail)) => {
                        let err = GatewayError::Parse(detail);
                        let _ = conn.outbound.send(Envelope::error_from(None, &err)).await;
                    }
                    Some(Frame::Message(envelope)) => {
                        dispatch_message(&inner, &conn, &delivery_tx, &outstanding, envelope).await;
                    }
                }
            }
            Some(delivery) = delivery_rx.recv() => {
                if conn.outbound.send(delivery.envelope.clone()).await.is_err() {
                    queue_offline(&inner, delivery).await;
                }
            }
        }
    }

    // Replies that raced the disconnect are kept, not lost.
    delivery_rx.close();
    while let Ok(delivery) = delivery_rx.try_recv() {
        queue_offline(&inner, delivery).await;
    }
}

/// First message must be `auth` with the shared bearer token, within the
/// configured deadline. No other method is accepted before that.
async fn handshake(inner: &Arc<Inner>, conn: &mut Connection) -> bool {
    let deadline = Duration::from_secs(inner.config.gateway.auth_deadline_secs);

    let first = match timeout(deadline, conn.inbound.recv()).await {
        Err(_) => {
            let err = GatewayError::NotAuthenticated("authentication deadline exceeded".into());
            let _ = conn.outbound.send(Envelope::error_from(None, &err)).await;
            warn!("connection closed: authentication deadline exceeded");
            return false;
        }
        Ok(None) => return false,
        Ok(Some(Frame::Malformed(detail))) => {
            let err = GatewayError::Parse(detail);
            let _ = conn.outbound.send(Envelope::error_from(None, &err)).await;
            return false;
        }
        Ok(Some(Frame::Message(envelope))) => envelope,
    };

    let id = first.id.clone();

    if first.method.as_deref() != Some(methods::AUTH) {
        let err = GatewayError::NotAuthenticated("first message must be auth".into());
        let _ = conn.outbound.send(Envelope::error_from(id, &err)).await;
        warn!("connection closed: unauthenticated method call");
        return false;
    }

    let token = first
        .params
        .and_then(|params| serde_json::from_value::<AuthParams>(params).ok())
        .map(|params| params.token);

    match token {
        Some(token) if token == inner.config.agent.token => {
            let _ = conn
                .outbound
                .send(Envelope::result(id, json!({ "ok": true })))
                .await;
            true
        }
        _ => {
            let err = GatewayError::NotAuthenticated("invalid agent token".into());
            let _ = conn.outbound.send(Envelope::error_from(id, &err)).await;
            warn!("connection closed: bad agent token");
            false
        }
    }
}

async fn dispatch_message(
    inner: &Arc<Inner>,
    conn: &Connection,
    delivery_tx: &mpsc::Sender<Delivery>,
    outstanding: &Arc<Mutex<HashSet<String>>>,
    envelope: Envelope,
) {
    if !envelope.version_ok() {
        let err = GatewayError::InvalidRequest("unsupported protocol version".into());
        let _ = conn
            .outbound
            .send(Envelope::error_from(envelope.id, &err))
            .await;
        return;
    }

    let method = envelope.method.clone();
    match method.as_deref() {
        Some(methods::TOOL_REQUEST) => {
            tokio::spawn(handle_tool_request(
                Arc::clone(inner),
                delivery_tx.clone(),
                Arc::clone(outstanding),
                envelope,
            ));
        }
        Some(methods::LIST_TOOLS) => {
            let reply = match serde_json::to_value(inner.registry.all_tools()) {
                Ok(tools) => Envelope::result(envelope.id, json!({ "tools": tools })),
                Err(e) => Envelope::error_from(envelope.id, &GatewayError::Internal(e.into())),
            };
            let _ = conn.outbound.send(reply).await;
        }
        Some(methods::GET_PENDING_RESULTS) => {
            let reply = match inner.store.drain_offline(&inner.config.agent.id).await {
                Ok(results) => {
                    info!(count = results.len(), "drained offline results");
                    Envelope::result(envelope.id, json!({ "results": render_offline(results) }))
                }
                Err(e) => Envelope::error_from(envelope.id, &GatewayError::Internal(e)),
            };
            let _ = conn.outbound.send(reply).await;
        }
        Some(methods::AUTH) => {
            let err = GatewayError::InvalidRequest("already authenticated".into());
            let _ = conn
                .outbound
                .send(Envelope::error_from(envelope.id, &err))
                .await;
        }
        Some(other) => {
            let err = GatewayError::MethodNotFound(format!("unknown method '{}'", other));
            let _ = conn
                .outbound
                .send(Envelope::error_from(envelope.id, &err))
                .await;
        }
        None => {
            let err = GatewayError::InvalidRequest("missing method".into());
            let _ = conn
                .outbound
                .send(Envelope::error_from(envelope.id, &err))
                .await;
        }
    }
}

fn render_offline(results: Vec<OfflineResult>) -> Vec<Value> {
    results
        .into_iter()
        .map(|result| {
            let mut obj = serde_json::Map::new();
            obj.insert("request_id".to_string(), json!(result.request_id));
            obj.insert("tool_name".to_string(), json!(result.tool_name));
            if let Value::Object(payload) = result.payload {
                obj.extend(payload);
            }
            Value::Object(obj)
        })
        .collect()
}
