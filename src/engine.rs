//! Engine: one configuration generation wired for serving.
//!
//! A generation owns its upstream contexts (pools, limiter, queue, worker
//! pool) and route table. Reload builds a fresh engine and swaps it in
//! atomically; in-flight requests and queued entries finish against the
//! generation they started with while the old workers drain.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{ServerSettings, Snapshot};
use crate::domain::error::ConfigError;
use crate::infra::executor::Executor;
use crate::infra::metrics::{HistoryRing, MetricsRegistry};
use crate::infra::queue::{UpstreamContext, spawn_workers};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
struct RouteEntry {
    prefix: String,
    upstream_id: String,
}

pub struct Engine {
    pub server: ServerSettings,
    upstreams: HashMap<String, Arc<UpstreamContext>>,
    routes: Vec<RouteEntry>,
    pub executor: Arc<Executor>,
    shutdown: CancellationToken,
    workers: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Engine {
    /// Build and start a generation: construct every upstream context and
    /// spawn its worker pool.
    ///
    /// # Errors
    ///
    /// Fails when the outbound HTTP client cannot be built (bad proxy URI).
    pub fn start(
        snapshot: Snapshot,
        registry: Arc<MetricsRegistry>,
        history: Arc<HistoryRing>,
    ) -> Result<Arc<Self>, ConfigError> {
        let client = build_client(&snapshot.server)?;
        let executor = Arc::new(Executor::new(client, Arc::clone(&registry), history));
        let shutdown = CancellationToken::new();

        let mut upstreams = HashMap::with_capacity(snapshot.upstreams.len());
        let mut routes = Vec::new();
        let mut workers = Vec::new();

        for upstream in snapshot.upstreams {
            let id = upstream.id.clone();
            routes.push(RouteEntry {
                prefix: format!("/api/{id}"),
                upstream_id: id.clone(),
            });
            for alias in &upstream.aliases {
                routes.push(RouteEntry {
                    prefix: format!("/api/{alias}"),
                    upstream_id: id.clone(),
                });
                routes.push(RouteEntry {
                    prefix: format!("/{alias}"),
                    upstream_id: id.clone(),
                });
            }

            let ctx = Arc::new(UpstreamContext::new(upstream, registry.upstream(&id)));
            workers.extend(spawn_workers(
                Arc::clone(&ctx),
                Arc::clone(&executor),
                Arc::clone(&registry),
                shutdown.clone(),
            ));
            upstreams.insert(id, ctx);
        }

        // Longest prefix wins.
        routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));

        info!(
            upstreams = upstreams.len(),
            workers = workers.len(),
            "engine generation started"
        );

        Ok(Arc::new(Self {
            server: snapshot.server,
            upstreams,
            routes,
            executor,
            shutdown,
            workers: parking_lot::Mutex::new(workers),
        }))
    }

    /// Longest-prefix route resolution. Returns the upstream context and
    /// the path suffix (always starting with `/`).
    #[must_use]
    pub fn resolve(&self, path: &str) -> Option<(Arc<UpstreamContext>, String)> {
        for route in &self.routes {
            if let Some(suffix) = match_prefix(path, &route.prefix) {
                let ctx = self.upstreams.get(&route.upstream_id)?;
                return Some((Arc::clone(ctx), suffix));
            }
        }
        None
    }

    #[must_use]
    pub fn upstream(&self, id: &str) -> Option<Arc<UpstreamContext>> {
        self.upstreams.get(id).cloned()
    }

    pub fn upstreams(&self) -> impl Iterator<Item = &Arc<UpstreamContext>> {
        self.upstreams.values()
    }

    /// Stop accepting queue work, cancel queued entries, and wait up to
    /// `drain` for in-flight workers.
    pub async fn drain(&self, drain: Duration) {
        self.shutdown.cancel();
        let mut canceled = 0;
        for ctx in self.upstreams.values() {
            canceled += ctx.queue.clear();
        }
        if canceled > 0 {
            info!(canceled, "canceled queued entries on shutdown");
        }

        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        let aborts: Vec<_> = handles.iter().map(tokio::task::JoinHandle::abort_handle).collect();
        let joined = futures_util::future::join_all(handles);
        if tokio::time::timeout(drain, joined).await.is_err() {
            warn!("drain window elapsed, aborting remaining workers");
            for abort in aborts {
                abort.abort();
            }
        }
    }
}

/// Prefix match on a path-segment boundary: `/api/gemini` matches
/// `/api/gemini` and `/api/gemini/v1/...` but not `/api/gemini2`.
fn match_prefix(path: &str, prefix: &str) -> Option<String> {
    let rest = path.strip_prefix(prefix)?;
    if rest.is_empty() {
        return Some("/".to_string());
    }
    rest.starts_with('/').then(|| rest.to_string())
}

fn build_client(server: &ServerSettings) -> Result<reqwest::Client, ConfigError> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        // Never follow redirects; the upstream's redirect belongs to the client.
        .redirect(reqwest::redirect::Policy::none());

    if let Some(proxy_uri) = &server.outbound_proxy {
        let proxy = reqwest::Proxy::all(proxy_uri).map_err(|e| {
            ConfigError::invalid("server.outbound_proxy", format!("{proxy_uri}: {e}"))
        })?;
        builder = builder.proxy(proxy);
        info!(proxy = %proxy_uri, "outbound proxy configured");
    }

    builder
        .build()
        .map_err(|e| ConfigError::invalid("server", format!("failed to build HTTP client: {e}")))
}

// ---------------------------------------------------------------------------
// Generation handle
// ---------------------------------------------------------------------------

/// The process-wide holder of the active generation plus the state that
/// survives reloads (metrics, history).
pub struct EngineHandle {
    current: ArcSwap<Engine>,
    registry: Arc<MetricsRegistry>,
    history: Arc<HistoryRing>,
}

impl EngineHandle {
    #[must_use]
    pub fn new(initial: Arc<Engine>, registry: Arc<MetricsRegistry>, history: Arc<HistoryRing>) -> Self {
        Self {
            current: ArcSwap::from(initial),
            registry,
            history,
        }
    }

    /// The active generation. Callers hold the returned `Arc` for the whole
    /// request so a concurrent reload cannot pull state out from under them.
    #[must_use]
    pub fn engine(&self) -> Arc<Engine> {
        self.current.load_full()
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<MetricsRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn history(&self) -> &Arc<HistoryRing> {
        &self.history
    }

    /// Validate and install a new generation. On success the old one drains
    /// in the background; on failure the previous generation keeps serving.
    ///
    /// # Errors
    ///
    /// Propagates snapshot build failures; nothing is swapped in that case.
    pub fn install(&self, snapshot: Snapshot) -> Result<(), ConfigError> {
        let next = Engine::start(snapshot, Arc::clone(&self.registry), Arc::clone(&self.history))?;
        let old = self.current.swap(next);
        let drain = old.server.drain;
        tokio::spawn(async move {
            old.drain(drain).await;
        });
        info!("configuration generation installed");
        Ok(())
    }
}
