use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::Duration as ChronoDuration;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::protocol::{Envelope, ToolRequestParams};
use super::{Inner, spawn_expiry_timer};
use crate::config::Decision;
use crate::error::{ExecutionErrorKind, GatewayError};
use crate::messenger::ApprovalPrompt;
use crate::registry::{ToolDefinition, validate_args};
use crate::store::{AuditEntry, InsertOutcome, OfflineResult, PendingRecord, Resolution};

/// A reply headed for the session that originated the request.
///
/// `retain` marks outcomes worth buffering offline when the session is
/// gone: results of dispatched or human-resolved requests. Pre-policy
/// rejections are not retained.
pub(crate) struct Delivery {
    pub request_id: String,
    pub tool_name: String,
    pub envelope: Envelope,
    pub retain: bool,
}

/// Run one `tool_request` through validation, policy, and dispatch or
/// the approval rendezvous. Spawned as its own task so a session can
/// carry several requests concurrently.
pub(crate) async fn handle_tool_request(
    inner: Arc<Inner>,
    deliveries: mpsc::Sender<Delivery>,
    outstanding: Arc<Mutex<HashSet<String>>>,
    envelope: Envelope,
) {
    let id = envelope.id.clone();
    let Some(request_id) = envelope.id_string() else {
        let err =
            GatewayError::InvalidRequest("tool_request requires a string or numeric id".into());
        send_delivery(&inner, &deliveries, reject("", "", id, &err)).await;
        return;
    };

    // In-flight duplicate guard; the pending table covers the longer horizon.
    let is_duplicate = {
        let mut inflight = inner.inflight.lock().expect("inflight lock poisoned");
        !inflight.insert(request_id.clone())
    };
    if is_duplicate {
        let err = GatewayError::InvalidRequest(format!(
            "duplicate request id '{}'",
            request_id
        ));
        send_delivery(&inner, &deliveries, reject(&request_id, "", id, &err)).await;
        return;
    }
    outstanding
        .lock()
        .expect("outstanding lock poisoned")
        .insert(request_id.clone());

    let outcome = process(&inner, &request_id, id, envelope.params).await;

    outstanding
        .lock()
        .expect("outstanding lock poisoned")
        .remove(&request_id);
    inner
        .inflight
        .lock()
        .expect("inflight lock poisoned")
        .remove(&request_id);

    if let Some(delivery) = outcome {
        send_delivery(&inner, &deliveries, delivery).await;
    }
}

async fn process(
    inner: &Arc<Inner>,
    request_id: &str,
    id: Option<Value>,
    params: Option<Value>,
) -> Option<Delivery> {
    // A request id that ever named a pending approval is spent.
    match inner.store.has_request(request_id).await {
        Ok(false) => {}
        Ok(true) => {
            let err = GatewayError::InvalidRequest(format!(
                "request id '{}' was already used",
                request_id
            ));
            return Some(reject(request_id, "", id, &err));
        }
        Err(e) => {
            error!(request_id, error = %e, "store lookup failed");
            let err = GatewayError::Internal(e);
            return Some(reject(request_id, "", id, &err));
        }
    }

    let params: ToolRequestParams = match params {
        Some(value) => match serde_json::from_value(value) {
            Ok(params) => params,
            Err(e) => {
                let err = GatewayError::InvalidRequest(format!("bad tool_request params: {}", e));
                return Some(reject(request_id, "", id, &err));
            }
        },
        None => {
            let err = GatewayError::InvalidRequest("tool_request requires params".into());
            return Some(reject(request_id, "", id, &err));
        }
    };

    let Some(def) = inner.registry.lookup(&params.tool) else {
        let err = GatewayError::UnknownTool(format!("unknown tool '{}'", params.tool));
        audit_terminal(
            inner,
            AuditEntry::new(
                request_id,
                &params.tool,
                &params.tool,
                Value::Object(params.args.clone()),
                Decision::Deny,
                Resolution::DeniedByPolicy,
            )
            .with_error_kind(err.kind_label()),
        )
        .await;
        return Some(reject(request_id, &params.tool, id, &err));
    };

    // Input validation comes before the signature is ever built, so a
    // crafted value cannot widen a policy pattern match.
    if let Err(err) = validate_args(Some(&def), &params.args) {
        audit_terminal(
            inner,
            AuditEntry::new(
                request_id,
                &def.name,
                &def.name,
                Value::Object(params.args.clone()),
                Decision::Deny,
                Resolution::DeniedByPolicy,
            )
            .with_error_kind(err.kind_label()),
        )
        .await;
        return Some(reject(request_id, &def.name, id, &err));
    }

    let signature = inner.registry.build_signature(&params.tool, &params.args);
    let decision = inner.config.policy.evaluate(&signature);
    debug!(request_id, signature = %signature, decision = %decision, "policy evaluated");

    match decision {
        Decision::Allow => {
            if !inner.bucket.try_acquire() {
                // Hard ceiling, no side effects: nothing is dispatched or audited.
                let err =
                    GatewayError::RateLimited("auto-allow budget exhausted; retry shortly".into());
                return Some(reject(request_id, &def.name, id, &err));
            }
            Some(
                execute_and_audit(
                    inner,
                    request_id,
                    id,
                    &def,
                    &signature,
                    &params.args,
                    Decision::Allow,
                )
                .await,
            )
        }
        Decision::Deny => {
            let err = GatewayError::PolicyDenied(format!("'{}' is denied by policy", signature));
            audit_terminal(
                inner,
                AuditEntry::new(
                    request_id,
                    &def.name,
                    &signature,
                    Value::Object(params.args.clone()),
                    Decision::Deny,
                    Resolution::DeniedByPolicy,
                ),
            )
            .await;
            Some(reject(request_id, &def.name, id, &err))
        }
        Decision::Ask => ask_flow(inner, request_id, id, def, signature, params.args).await,
    }
}

/// ASK path: persist the pending record, prompt the guardian, and wait
/// for whichever of the callback and the expiry timer reaches the
/// idempotent resolver first.
async fn ask_flow(
    inner: &Arc<Inner>,
    request_id: &str,
    id: Option<Value>,
    def: Arc<ToolDefinition>,
    signature: String,
    args: serde_json::Map<String, Value>,
) -> Option<Delivery> {
    let ttl = ChronoDuration::seconds(inner.config.approval_timeout_secs as i64);
    let record = PendingRecord::new(
        request_id,
        &def.name,
        &signature,
        Value::Object(args.clone()),
        ttl,
    );
    let expires_at = record.expires_at;

    // Register the waiter before the record becomes resolvable, so even
    // an instant callback finds someone to hand the resolution to.
    let (tx, rx) = oneshot::channel();
    inner
        .waiters
        .lock()
        .expect("waiters lock poisoned")
        .insert(request_id.to_string(), tx);

    let inserted = inner
        .store
        .insert_pending(record, inner.config.rate_limit.max_pending_approvals)
        .await;
    let rejection = match inserted {
        Ok(InsertOutcome::Inserted) => None,
        Ok(InsertOutcome::QuotaExceeded) => Some(GatewayError::RateLimited(
            "pending approval limit reached".into(),
        )),
        Ok(InsertOutcome::Duplicate) => Some(GatewayError::InvalidRequest(format!(
            "request id '{}' was already used",
            request_id
        ))),
        Err(e) => {
            error!(request_id, error = %e, "failed to persist pending approval");
            Some(GatewayError::Internal(e))
        }
    };
    if let Some(err) = rejection {
        inner
            .waiters
            .lock()
            .expect("waiters lock poisoned")
            .remove(request_id);
        return Some(reject(request_id, &def.name, id, &err));
    }

    let prompt = ApprovalPrompt {
        request_id: request_id.to_string(),
        tool_name: def.name.clone(),
        signature: signature.clone(),
        args: Value::Object(args.clone()),
        expires_at,
    };
    if let Err(e) = inner.messenger.request_approval(prompt).await {
        // The guardian never saw it; the expiry timer will settle things.
        warn!(request_id, error = %e, "failed to deliver approval prompt");
    }

    spawn_expiry_timer(Arc::clone(inner), request_id.to_string(), expires_at);

    let resolution = match rx.await {
        Ok(resolution) => resolution,
        Err(_) => {
            // Shutdown abandoned the waiter; the pending row survives for
            // the next boot's sweep.
            debug!(request_id, "approval wait abandoned");
            return None;
        }
    };

    Some(match resolution {
        Resolution::Approved => {
            info!(request_id, signature = %signature, "request approved by guardian");
            // Approval is explicit authorization; the auto-allow budget
            // does not apply.
            execute_and_audit(inner, request_id, id, &def, &signature, &args, Decision::Ask).await
        }
        Resolution::DeniedByUser => {
            let err = GatewayError::UserDenied("request denied by guardian".into());
            audit_terminal(
                inner,
                AuditEntry::new(
                    request_id,
                    &def.name,
                    &signature,
                    Value::Object(args),
                    Decision::Ask,
                    Resolution::DeniedByUser,
                ),
            )
            .await;
            retained(request_id, &def.name, Envelope::error_from(id, &err))
        }
        Resolution::TimedOut => {
            inner.messenger.notify_expired(request_id).await;
            let err = GatewayError::TimedOut(format!(
                "no decision within {}s",
                inner.config.approval_timeout_secs
            ));
            audit_terminal(
                inner,
                AuditEntry::new(
                    request_id,
                    &def.name,
                    &signature,
                    Value::Object(args),
                    Decision::Ask,
                    Resolution::TimedOut,
                ),
            )
            .await;
            retained(request_id, &def.name, Envelope::error_from(id, &err))
        }
        other => {
            warn!(request_id, resolution = %other, "unexpected resolution for waiting request");
            let err = GatewayError::Internal(anyhow::anyhow!(
                "unexpected resolution {} for waiting request",
                other
            ));
            retained(request_id, &def.name, Envelope::error_from(id, &err))
        }
    })
}

/// Dispatch to the owning service handler and audit the terminal state.
async fn execute_and_audit(
    inner: &Arc<Inner>,
    request_id: &str,
    id: Option<Value>,
    def: &ToolDefinition,
    signature: &str,
    args: &serde_json::Map<String, Value>,
    decision: Decision,
) -> Delivery {
    match dispatch_tool(inner, def, args).await {
        Ok(result) => {
            audit_terminal(
                inner,
                AuditEntry::new(
                    request_id,
                    &def.name,
                    signature,
                    Value::Object(args.clone()),
                    decision,
                    Resolution::Executed,
                )
                .with_result(result.clone()),
            )
            .await;
            retained(request_id, &def.name, Envelope::result(id, result))
        }
        Err(err) => {
            audit_terminal(
                inner,
                AuditEntry::new(
                    request_id,
                    &def.name,
                    signature,
                    Value::Object(args.clone()),
                    decision,
                    Resolution::ExecutionFailed,
                )
                .with_error_kind(err.kind_label()),
            )
            .await;
            retained(request_id, &def.name, Envelope::error_from(id, &err))
        }
    }
}

pub(crate) async fn dispatch_tool(
    inner: &Inner,
    def: &ToolDefinition,
    args: &serde_json::Map<String, Value>,
) -> Result<Value, GatewayError> {
    let handler = inner.handlers.get(&def.service).ok_or_else(|| GatewayError::Execution {
        kind: ExecutionErrorKind::Protocol,
        message: format!("no handler for service '{}'", def.service),
    })?;

    handler
        .execute(&def.name, args)
        .await
        .map_err(|e| GatewayError::Execution {
            kind: e.kind,
            message: e.message,
        })
}

/// Terminal processing for a pending approval whose waiting task is gone
/// (resolved after a restart, or the session task died). Executes if
/// approved, audits, and buffers the outcome for offline pickup.
pub(crate) async fn finalize_detached(
    inner: &Arc<Inner>,
    record: PendingRecord,
    resolution: Resolution,
) {
    let args = record
        .args
        .as_object()
        .cloned()
        .unwrap_or_default();

    let (payload, entry) = match resolution {
        Resolution::Approved => match inner.registry.lookup(&record.tool_name) {
            Some(def) => match dispatch_tool(inner, &def, &args).await {
                Ok(result) => (
                    json!({ "result": result.clone() }),
                    AuditEntry::new(
                        &record.request_id,
                        &record.tool_name,
                        &record.signature,
                        record.args.clone(),
                        Decision::Ask,
                        Resolution::Executed,
                    )
                    .with_result(result),
                ),
                Err(err) => (
                    payload_error(&err),
                    AuditEntry::new(
                        &record.request_id,
                        &record.tool_name,
                        &record.signature,
                        record.args.clone(),
                        Decision::Ask,
                        Resolution::ExecutionFailed,
                    )
                    .with_error_kind(err.kind_label()),
                ),
            },
            None => {
                let err = GatewayError::Execution {
                    kind: ExecutionErrorKind::Protocol,
                    message: format!("tool '{}' is no longer configured", record.tool_name),
                };
                (
                    payload_error(&err),
                    AuditEntry::new(
                        &record.request_id,
                        &record.tool_name,
                        &record.signature,
                        record.args.clone(),
                        Decision::Ask,
                        Resolution::ExecutionFailed,
                    )
                    .with_error_kind(err.kind_label()),
                )
            }
        },
        Resolution::DeniedByUser => {
            let err = GatewayError::UserDenied("request denied by guardian".into());
            (
                payload_error(&err),
                AuditEntry::new(
                    &record.request_id,
                    &record.tool_name,
                    &record.signature,
                    record.args.clone(),
                    Decision::Ask,
                    Resolution::DeniedByUser,
                ),
            )
        }
        Resolution::TimedOut => {
            inner.messenger.notify_expired(&record.request_id).await;
            let err = GatewayError::TimedOut("no decision before expiry".into());
            (
                payload_error(&err),
                AuditEntry::new(
                    &record.request_id,
                    &record.tool_name,
                    &record.signature,
                    record.args.clone(),
                    Decision::Ask,
                    Resolution::TimedOut,
                ),
            )
        }
        other => {
            warn!(request_id = %record.request_id, resolution = %other, "ignoring non-terminal detached resolution");
            return;
        }
    };

    audit_terminal(inner, entry).await;

    let offline = OfflineResult::new(&record.request_id, &record.tool_name, payload);
    if let Err(e) = inner.store.enqueue_offline(&inner.config.agent.id, offline).await {
        error!(request_id = %record.request_id, error = %e, "failed to queue offline result");
    }
}

/// Append the audit row; the agent learns the outcome only after this
/// returns.
pub(crate) async fn audit_terminal(inner: &Inner, entry: AuditEntry) {
    info!(
        request_id = %entry.request_id,
        signature = %entry.signature,
        decision = %entry.decision,
        resolution = %entry.resolution,
        "request settled"
    );
    if let Err(e) = inner.store.append_audit(entry).await {
        error!(error = %e, "failed to append audit entry");
    }
}

/// Hand a delivery to the session, or buffer it offline when the session
/// queue is closed and the outcome is worth keeping.
async fn send_delivery(inner: &Arc<Inner>, deliveries: &mpsc::Sender<Delivery>, delivery: Delivery) {
    if let Err(mpsc::error::SendError(delivery)) = deliveries.send(delivery).await {
        queue_offline(inner, delivery).await;
    }
}

pub(crate) async fn queue_offline(inner: &Inner, delivery: Delivery) {
    if !delivery.retain {
        debug!(request_id = %delivery.request_id, "dropping reply for closed session");
        return;
    }
    let offline = OfflineResult::new(
        &delivery.request_id,
        &delivery.tool_name,
        offline_payload(&delivery.envelope),
    );
    if let Err(e) = inner
        .store
        .enqueue_offline(&inner.config.agent.id, offline)
        .await
    {
        error!(request_id = %delivery.request_id, error = %e, "failed to queue offline result");
    }
}

/// Offline payload form of a reply envelope.
fn offline_payload(envelope: &Envelope) -> Value {
    if let Some(result) = &envelope.result {
        json!({ "result": result })
    } else if let Some(error) = &envelope.error {
        json!({ "error": { "code": error.code, "message": error.message } })
    } else {
        Value::Null
    }
}

fn payload_error(err: &GatewayError) -> Value {
    json!({ "error": { "code": err.code(), "message": err.wire_message() } })
}

fn reject(request_id: &str, tool_name: &str, id: Option<Value>, err: &GatewayError) -> Delivery {
    Delivery {
        request_id: request_id.to_string(),
        tool_name: tool_name.to_string(),
        envelope: Envelope::error_from(id, err),
        retain: false,
    }
}

fn retained(request_id: &str, tool_name: &str, envelope: Envelope) -> Delivery {
    Delivery {
        request_id: request_id.to_string(),
        tool_name: tool_name.to_string(),
        envelope,
        retain: true,
    }
}
