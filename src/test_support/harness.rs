//! Top-level test harness: a fully-wired proxy serving on an ephemeral
//! port, built from an inline YAML document.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use crate::api::rest::routes::build_router;
use crate::api::rest::AppState;
use crate::config::model::ConfigFile;
use crate::config::build_snapshot;
use crate::engine::{Engine, EngineHandle};
use crate::infra::metrics::{HistoryRing, MetricsRegistry};

pub struct AppHarness {
    base_url: String,
    handle: Arc<EngineHandle>,
    client: reqwest::Client,
    server: tokio::task::JoinHandle<()>,
}

impl AppHarness {
    /// Build and serve a proxy from the given configuration document.
    ///
    /// # Panics
    ///
    /// Panics on invalid configuration; tests supply valid documents.
    pub async fn start(yaml: &str) -> Self {
        let file: ConfigFile = serde_yaml::from_str(yaml).expect("harness config parses");
        let snapshot = build_snapshot(&file).expect("harness config validates");

        let registry = Arc::new(MetricsRegistry::new());
        let history = Arc::new(HistoryRing::new(snapshot.server.history_size));
        let engine = Engine::start(snapshot, Arc::clone(&registry), Arc::clone(&history))
            .expect("engine starts");
        let handle = Arc::new(EngineHandle::new(engine, registry, history));

        let state = AppState {
            handle: Arc::clone(&handle),
            config_path: None,
        };
        let router = build_router(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind harness");
        let addr = listener.local_addr().expect("harness local addr");
        let server = tokio::spawn(async move {
            let _ = axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await;
        });

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("harness client");

        Self {
            base_url: format!("http://127.0.0.1:{}", addr.port()),
            handle,
            client,
            server,
        }
    }

    #[must_use]
    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    #[must_use]
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    #[must_use]
    pub fn handle(&self) -> &Arc<EngineHandle> {
        &self.handle
    }

    /// Convenience GET against the proxy.
    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .send()
            .await
            .expect("harness request")
    }

    /// Metrics summary as exposed on the control surface.
    #[must_use]
    pub fn metrics(&self) -> serde_json::Value {
        self.handle.registry().summary()
    }
}

impl Drop for AppHarness {
    fn drop(&mut self) {
        self.server.abort();
    }
}
