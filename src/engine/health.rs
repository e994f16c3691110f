use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info};

use super::Inner;

const ENDPOINT_REFRESH: Duration = Duration::from_secs(30);
const RECV_TIMEOUT: Duration = Duration::from_millis(500);

/// Snapshot served by the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: String,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthChecks {
    pub store: bool,
    pub messenger: bool,
    pub services: BTreeMap<String, bool>,
}

impl HealthReport {
    pub(crate) fn new(store: bool, messenger: bool, services: BTreeMap<String, bool>) -> Self {
        // Store and messenger are critical; service probes are informational.
        let status = if !store || !messenger {
            "unhealthy"
        } else if services.values().all(|ok| *ok) {
            "healthy"
        } else {
            "degraded"
        };
        Self {
            status: status.to_string(),
            checks: HealthChecks {
                store,
                messenger,
                services,
            },
        }
    }

    pub fn critical_ok(&self) -> bool {
        self.checks.store && self.checks.messenger
    }
}

pub(crate) async fn build_report(inner: &Inner) -> HealthReport {
    let store = inner.store.health_check().await;
    let messenger = inner.messenger.health_check().await;
    let services = inner
        .service_health
        .lock()
        .expect("service health lock poisoned")
        .iter()
        .map(|(name, ok)| (name.clone(), *ok))
        .collect();
    HealthReport::new(store, messenger, services)
}

/// Serve the unauthenticated read-only health endpoint.
///
/// tiny_http is blocking, so the listener runs on its own thread and
/// reads a cache an async task keeps current.
pub(crate) fn spawn_endpoint(inner: Arc<Inner>, port: u16) {
    let cache: Arc<Mutex<(String, bool)>> = Arc::new(Mutex::new(("{}".to_string(), false)));

    let refresher_cache = Arc::clone(&cache);
    let refresher_inner = Arc::clone(&inner);
    tokio::spawn(async move {
        loop {
            let report = build_report(&refresher_inner).await;
            let body = serde_json::to_string(&report).unwrap_or_else(|_| "{}".to_string());
            {
                let mut cache = refresher_cache.lock().expect("health cache lock poisoned");
                *cache = (body, report.critical_ok());
            }
            tokio::select! {
                _ = refresher_inner.shutdown.cancelled() => break,
                _ = tokio::time::sleep(ENDPOINT_REFRESH) => {}
            }
        }
    });

    let shutdown = inner.shutdown.clone();
    std::thread::spawn(move || {
        let server = match tiny_http::Server::http(("0.0.0.0", port)) {
            Ok(server) => server,
            Err(e) => {
                error!(port, error = %e, "failed to bind health endpoint");
                return;
            }
        };
        info!(port, "health endpoint listening");

        while !shutdown.is_cancelled() {
            match server.recv_timeout(RECV_TIMEOUT) {
                Ok(Some(request)) => {
                    let (body, critical_ok) =
                        cache.lock().expect("health cache lock poisoned").clone();
                    let code = if critical_ok { 200 } else { 503 };
                    let mut response =
                        tiny_http::Response::from_string(body).with_status_code(code);
                    if let Ok(header) = tiny_http::Header::from_bytes(
                        &b"Content-Type"[..],
                        &b"application/json"[..],
                    ) {
                        response = response.with_header(header);
                    }
                    if let Err(e) = request.respond(response) {
                        debug!(error = %e, "health response failed");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(error = %e, "health endpoint recv failed");
                    break;
                }
            }
        }
    });
}
