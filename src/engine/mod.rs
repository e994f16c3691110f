mod channel;
mod health;
mod limits;
pub mod protocol;
mod request;
mod session;

pub use channel::{Connection, Frame, memory_pair, spawn_tcp};
pub use health::{HealthChecks, HealthReport};

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::GatewayConfig;
use crate::dispatch::{HandlerFactory, HandlerRegistry, ServiceHandler};
use crate::error::GatewayError;
use crate::messenger::{Messenger, MessengerFactory, MessengerRegistry};
use crate::registry::ToolRegistry;
use crate::store::{PendingRecord, ResolveOutcome, Resolution, SqliteStore, Store};
use limits::TokenBucket;
use request::finalize_detached;

/// Shared engine state; everything a session or resolver task needs.
pub(crate) struct Inner {
    pub(crate) config: GatewayConfig,
    pub(crate) registry: ToolRegistry,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) messenger: Arc<dyn Messenger>,
    pub(crate) handlers: HashMap<String, Arc<dyn ServiceHandler>>,
    pub(crate) bucket: TokenBucket,
    /// Waiting request tasks, keyed by request id. The winning resolver
    /// removes the sender and hands over the resolution.
    pub(crate) waiters: Mutex<HashMap<String, oneshot::Sender<Resolution>>>,
    /// Request ids currently being processed anywhere in the gateway
    pub(crate) inflight: Mutex<HashSet<String>>,
    pub(crate) service_health: Mutex<HashMap<String, bool>>,
    pub(crate) shutdown: CancellationToken,
}

/// The gateway: one composite owning the registry, store, messenger,
/// per-service handlers and listener. Cloning shares the same instance.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
}

impl Gateway {
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::new()
    }

    /// One-time startup: probe services, settle anything that expired
    /// while the gateway was down, re-arm timers for surviving pendings,
    /// and start the background sweeper and health endpoint.
    ///
    /// Runs before any connection is accepted, so a stale pending can
    /// never be referenced by a new request.
    pub async fn start(&self) -> Result<(), GatewayError> {
        self.refresh_service_health().await;

        let swept = self
            .inner
            .store
            .sweep_stale(Utc::now())
            .await
            .map_err(GatewayError::Internal)?;
        for record in swept {
            info!(request_id = %record.request_id, "expired while down; resolving as timed out");
            settle_swept(&self.inner, record).await;
        }

        let waiting = self
            .inner
            .store
            .load_waiting()
            .await
            .map_err(GatewayError::Internal)?;
        for record in waiting {
            info!(
                request_id = %record.request_id,
                expires_at = %record.expires_at,
                "recovered pending approval"
            );
            spawn_expiry_timer(
                Arc::clone(&self.inner),
                record.request_id,
                record.expires_at,
            );
        }

        spawn_sweeper(Arc::clone(&self.inner));

        if let Some(port) = self.inner.config.gateway.health_port {
            health::spawn_endpoint(Arc::clone(&self.inner), port);
        }

        Ok(())
    }

    /// Start up and accept agent connections until shutdown.
    pub async fn serve(&self) -> Result<(), GatewayError> {
        self.start().await?;

        let addr = format!(
            "{}:{}",
            self.inner.config.gateway.host, self.inner.config.gateway.port
        );
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| GatewayError::Config(format!("failed to bind {}: {}", addr, e)))?;
        info!(addr = %addr, "gateway listening");

        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "agent connected");
                        self.attach(channel::spawn_tcp(stream));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        }

        info!("listener stopped");
        Ok(())
    }

    /// Run a session over an already-established connection. The TCP
    /// listener uses this; tests and embedders can attach their own.
    pub fn attach(&self, conn: Connection) -> tokio::task::JoinHandle<()> {
        tokio::spawn(session::run_session(
            Arc::clone(&self.inner),
            conn,
            self.inner.shutdown.clone(),
        ))
    }

    /// Apply a guardian decision (or a timeout) to a pending approval.
    ///
    /// This is the single resolve path: first caller wins, every later
    /// caller observes a no-op with the prior resolution. Messenger
    /// transports call this from their callbacks; a stale callback gets
    /// `AlreadyResolved` or `NotFound` to surface as an expired notice.
    pub async fn resolve_approval(
        &self,
        request_id: &str,
        resolution: Resolution,
    ) -> Result<ResolveOutcome, GatewayError> {
        resolve_on(&self.inner, request_id, resolution)
            .await
            .map_err(GatewayError::Internal)
    }

    pub async fn health(&self) -> HealthReport {
        health::build_report(&self.inner).await
    }

    /// Probe every service handler and record the results for the
    /// health surface. The gateway runs regardless of the outcomes.
    pub async fn refresh_service_health(&self) {
        for (name, handler) in &self.inner.handlers {
            let healthy = handler.health_check().await;
            if !healthy {
                warn!(service = %name, "service health probe failed");
            }
            self.inner
                .service_health
                .lock()
                .expect("service health lock poisoned")
                .insert(name.clone(), healthy);
        }
    }

    /// Token observed by sessions and background tasks; cancel to begin
    /// a graceful shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Graceful shutdown: stop accepting, notify sessions of their
    /// outstanding request ids, abandon waiting approvals (their rows
    /// survive for the next boot's sweep), and close the backends.
    pub async fn shutdown(&self) {
        info!("gateway shutting down");
        self.inner.shutdown.cancel();

        // Give sessions a beat to flush their shutting-down notices.
        tokio::time::sleep(Duration::from_millis(250)).await;

        self.inner
            .waiters
            .lock()
            .expect("waiters lock poisoned")
            .clear();

        for (name, handler) in &self.inner.handlers {
            handler.close().await;
            debug!(service = %name, "handler closed");
        }
        self.inner.messenger.close().await;
    }
}

/// Resolve a pending approval and route the resolution to whoever will
/// finish the request: the waiting task if one exists, detached terminal
/// processing otherwise. Losers of the race observe a no-op.
pub(crate) async fn resolve_on(
    inner: &Arc<Inner>,
    request_id: &str,
    resolution: Resolution,
) -> anyhow::Result<ResolveOutcome> {
    let outcome = inner.store.resolve_pending(request_id, resolution).await?;

    match &outcome {
        ResolveOutcome::Resolved(record) => {
            let waiter = inner
                .waiters
                .lock()
                .expect("waiters lock poisoned")
                .remove(request_id);
            match waiter {
                Some(tx) => {
                    if tx.send(resolution).is_err() {
                        // The waiting task died; finish here instead.
                        finalize_detached(inner, record.clone(), resolution).await;
                    }
                }
                None => finalize_detached(inner, record.clone(), resolution).await,
            }
        }
        ResolveOutcome::AlreadyResolved(prior) => {
            debug!(request_id, prior = %prior, "resolution raced and lost; no effect");
        }
        ResolveOutcome::NotFound => {
            debug!(request_id, "resolution for unknown request id");
        }
    }

    Ok(outcome)
}

/// Arm the per-request expiry timer that races the guardian callback
/// through the idempotent resolver.
pub(crate) fn spawn_expiry_timer(
    inner: Arc<Inner>,
    request_id: String,
    expires_at: DateTime<Utc>,
) {
    tokio::spawn(async move {
        let wait = (expires_at - Utc::now()).to_std().unwrap_or_default();
        tokio::select! {
            _ = inner.shutdown.cancelled() => {}
            _ = tokio::time::sleep(wait) => {
                if let Err(e) = resolve_on(&inner, &request_id, Resolution::TimedOut).await {
                    error!(request_id = %request_id, error = %e, "timeout resolution failed");
                }
            }
        }
    });
}

/// Hand a store-swept (already timed-out) record to its waiter, or
/// finish it detached.
async fn settle_swept(inner: &Arc<Inner>, record: PendingRecord) {
    let waiter = inner
        .waiters
        .lock()
        .expect("waiters lock poisoned")
        .remove(&record.request_id);
    match waiter {
        Some(tx) => {
            if tx.send(Resolution::TimedOut).is_err() {
                finalize_detached(inner, record, Resolution::TimedOut).await;
            }
        }
        None => finalize_detached(inner, record, Resolution::TimedOut).await,
    }
}

/// Periodic belt over the per-request timers: nothing stays waiting past
/// its expiry, even across timer loss or clock oddities.
fn spawn_sweeper(inner: Arc<Inner>) {
    tokio::spawn(async move {
        let period = Duration::from_secs(inner.config.sweep_interval_secs.max(1));
        loop {
            tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                _ = tokio::time::sleep(period) => {
                    match inner.store.sweep_stale(Utc::now()).await {
                        Ok(records) => {
                            for record in records {
                                settle_swept(&inner, record).await;
                            }
                        }
                        Err(e) => error!(error = %e, "pending sweep failed"),
                    }
                }
            }
        }
    });
}

/// Builder for assembling a [`Gateway`] from configuration plus optional
/// custom backends.
pub struct GatewayBuilder {
    config: GatewayConfig,
    config_dir: PathBuf,
    store: Option<Arc<dyn Store>>,
    messenger: Option<Arc<dyn Messenger>>,
    handlers: HandlerRegistry,
    messengers: MessengerRegistry,
}

impl GatewayBuilder {
    pub fn new() -> Self {
        Self {
            config: GatewayConfig::default(),
            config_dir: PathBuf::from("."),
            store: None,
            messenger: None,
            handlers: HandlerRegistry::new(),
            messengers: MessengerRegistry::new(),
        }
    }

    pub fn config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    /// Directory relative tool-file paths resolve against (usually the
    /// config file's directory).
    pub fn config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config_dir = dir.into();
        self
    }

    /// Override the persistent store (defaults to SQLite at
    /// `storage.path`).
    pub fn store(mut self, store: impl Store + 'static) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    /// Override the messenger adapter (defaults to the factory named by
    /// `messenger.type`).
    pub fn messenger(mut self, messenger: impl Messenger + 'static) -> Self {
        self.messenger = Some(Arc::new(messenger));
        self
    }

    /// Register an additional service handler factory.
    pub fn register_handler(mut self, name: impl Into<String>, factory: HandlerFactory) -> Self {
        self.handlers.register(name, factory);
        self
    }

    /// Register an additional messenger factory.
    pub fn register_messenger(
        mut self,
        name: impl Into<String>,
        factory: MessengerFactory,
    ) -> Self {
        self.messengers.register(name, factory);
        self
    }

    /// Validate everything and assemble the gateway. Any failure here is
    /// a fatal configuration error.
    pub fn build(self) -> Result<Gateway, GatewayError> {
        let config = self.config;
        config
            .validate()
            .map_err(|e| GatewayError::Config(e.to_string()))?;

        let mut registry = ToolRegistry::new();
        for (name, service) in &config.services {
            let path = GatewayConfig::resolve_tools_path(&self.config_dir, service);
            registry
                .load_service_file(name, &path)
                .map_err(|e| GatewayError::Config(format!("{:#}", e)))?;
        }

        let store: Arc<dyn Store> = match self.store {
            Some(store) => store,
            None => Arc::new(
                SqliteStore::new(&config.storage.path)
                    .map_err(|e| GatewayError::Config(e.to_string()))?,
            ),
        };

        let messenger = match self.messenger {
            Some(messenger) => messenger,
            None => self
                .messengers
                .build(&config.messenger)
                .map_err(|e| GatewayError::Config(e.to_string()))?,
        };

        let mut handlers = HashMap::new();
        let mut service_health = HashMap::new();
        for (name, service) in &config.services {
            let tools = registry.tools_for_service(name);
            let handler = self
                .handlers
                .build(name, service, tools)
                .map_err(|e| GatewayError::Config(e.to_string()))?;
            handlers.insert(name.clone(), handler);
            service_health.insert(name.clone(), false);
        }

        let bucket = TokenBucket::per_minute(config.rate_limit.max_requests_per_minute);

        info!(
            tools = registry.len(),
            services = handlers.len(),
            "gateway assembled"
        );

        Ok(Gateway {
            inner: Arc::new(Inner {
                config,
                registry,
                store,
                messenger,
                handlers,
                bucket,
                waiters: Mutex::new(HashMap::new()),
                inflight: Mutex::new(HashSet::new()),
                service_health: Mutex::new(service_health),
                shutdown: CancellationToken::new(),
            }),
        })
    }
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}
