//! Mock upstream server for integration tests.
//!
//! Records every request it receives and answers from scripted responders:
//! fixed responses, per-call sequences (e.g. 429 then 200), or responses
//! keyed on a request header (per-credential behavior).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use dashmap::DashMap;
use http::StatusCode;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;

#[derive(Clone, Debug)]
pub enum MockBody {
    Json(Value),
    Text(String),
    Sse(Vec<String>),
}

#[derive(Clone, Debug)]
pub struct MockResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: MockBody,
    /// Simulated upstream latency.
    pub delay: Option<Duration>,
}

impl MockResponse {
    #[must_use]
    pub fn json(status: u16, body: Value) -> Self {
        Self {
            status,
            headers: vec![],
            body: MockBody::Json(body),
            delay: None,
        }
    }

    #[must_use]
    pub fn ok() -> Self {
        Self::json(200, json!({ "ok": true }))
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    fn into_response(self) -> Response {
        let mut builder = Response::builder()
            .status(StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK));
        for (name, value) in &self.headers {
            builder = builder.header(name, value);
        }
        match self.body {
            MockBody::Json(value) => builder
                .header(http::header::CONTENT_TYPE, "application/json")
                .body(Body::from(value.to_string()))
                .expect("mock response"),
            MockBody::Text(text) => builder.body(Body::from(text)).expect("mock response"),
            MockBody::Sse(events) => {
                let payload: String = events
                    .iter()
                    .map(|e| format!("data: {e}\n\n"))
                    .collect();
                builder
                    .header(http::header::CONTENT_TYPE, "text/event-stream")
                    .body(Body::from(payload))
                    .expect("mock response")
            }
        }
    }
}

/// How a route answers across calls.
pub enum Responder {
    Fixed(MockResponse),
    /// Pops responses in order; the last one repeats.
    Sequence(Mutex<Vec<MockResponse>>),
    /// Answer per the value of one request header.
    PerHeader {
        header: String,
        responses: HashMap<String, MockResponse>,
        fallback: MockResponse,
    },
}

impl Responder {
    fn next(&self, req_headers: &http::HeaderMap) -> MockResponse {
        match self {
            Self::Fixed(response) => response.clone(),
            Self::Sequence(remaining) => {
                let mut remaining = remaining.lock();
                if remaining.len() > 1 {
                    remaining.remove(0)
                } else {
                    remaining.first().cloned().unwrap_or_else(MockResponse::ok)
                }
            }
            Self::PerHeader {
                header,
                responses,
                fallback,
            } => req_headers
                .get(header.as_str())
                .and_then(|v| v.to_str().ok())
                .and_then(|v| responses.get(v))
                .cloned()
                .unwrap_or_else(|| fallback.clone()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl RecordedRequest {
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

#[derive(Hash, Eq, PartialEq, Clone, Debug)]
struct RouteKey {
    method: String,
    path: String,
}

struct MockState {
    routes: DashMap<RouteKey, Arc<Responder>>,
    recorded: Mutex<Vec<RecordedRequest>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// A real listening HTTP server backing the proxy's upstream in tests.
pub struct MockUpstream {
    addr: SocketAddr,
    state: Arc<MockState>,
    server: tokio::task::JoinHandle<()>,
}

impl MockUpstream {
    pub async fn start() -> Self {
        let state = Arc::new(MockState {
            routes: DashMap::new(),
            recorded: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        });

        let router = Router::new()
            .fallback(record_and_answer)
            .with_state(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock upstream");
        let addr = listener.local_addr().expect("mock local addr");
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        Self {
            addr,
            state,
            server,
        }
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port())
    }

    pub fn mock(&self, method: &str, path: &str, response: MockResponse) {
        self.mock_with(method, path, Responder::Fixed(response));
    }

    pub fn mock_sequence(&self, method: &str, path: &str, responses: Vec<MockResponse>) {
        self.mock_with(method, path, Responder::Sequence(Mutex::new(responses)));
    }

    pub fn mock_with(&self, method: &str, path: &str, responder: Responder) {
        self.state.routes.insert(
            RouteKey {
                method: method.to_ascii_uppercase(),
                path: path.to_string(),
            },
            Arc::new(responder),
        );
    }

    #[must_use]
    pub fn recorded(&self) -> Vec<RecordedRequest> {
        self.state.recorded.lock().clone()
    }

    #[must_use]
    pub fn hits(&self) -> usize {
        self.state.recorded.lock().len()
    }

    /// Highest number of concurrently in-flight requests observed.
    #[must_use]
    pub fn max_concurrency(&self) -> usize {
        self.state.max_in_flight.load(Ordering::Acquire)
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn record_and_answer(State(state): State<Arc<MockState>>, req: Request) -> Response {
    let current = state.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
    state.max_in_flight.fetch_max(current, Ordering::AcqRel);

    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);
    let req_headers = req.headers().clone();
    let headers: HashMap<String, String> = req_headers
        .iter()
        .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
        .collect();
    let body = axum::body::to_bytes(req.into_body(), 16 * 1024 * 1024)
        .await
        .unwrap_or_default();

    state.recorded.lock().push(RecordedRequest {
        method: method.clone(),
        path: path.clone(),
        query,
        headers,
        body,
    });

    let responder = state.routes.get(&RouteKey {
        method,
        path: path.clone(),
    });

    let response = match responder {
        Some(responder) => {
            let response = responder.next(&req_headers);
            if let Some(delay) = response.delay {
                tokio::time::sleep(delay).await;
            }
            response.into_response()
        }
        None => (
            StatusCode::NOT_FOUND,
            axum::Json(json!({ "error": format!("no mock for {path}") })),
        )
            .into_response(),
    };

    state.in_flight.fetch_sub(1, Ordering::AcqRel);
    response
}
