//! Router assembly: the control surface plus the proxy fallback that owns
//! the rest of the URL space.

use axum::Router;
use axum::routing::{get, post};

use super::AppState;
use super::handlers::{control, proxy};

#[must_use]
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/control/metrics", get(control::metrics))
        .route("/control/history", get(control::history))
        .route("/control/queues", get(control::queues))
        .route("/control/queues/{id}/clear", post(control::clear_queue))
        .route("/control/config/reload", post(control::reload_config))
        .fallback(proxy::proxy_handler)
        .with_state(state)
}
