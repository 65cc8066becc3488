//! Upstream executor: builds the outbound request, applies jitter, sends
//! with the overall timeout, streams the response back, and drives the
//! retry / key-rotation loop.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_core::Stream;
use futures_util::StreamExt;
use rand::Rng;
use tracing::{debug, warn};

use crate::domain::error::ProxyError;
use crate::domain::model::{RetryMode, Upstream};

use super::headers;
use super::limit::UpstreamLimiter;
use super::metrics::{HistoryRing, MetricsRegistry, UpstreamMetrics, mask_key};
use super::pool::{KeyLease, KeySelection, UpstreamPools};
use super::request::{BodyStream, CapturedBody, CapturedRequest, ProxyResponse};

/// Poll interval while a key is blocked only by in-flight concurrency,
/// which carries no time estimate.
const CONCURRENCY_POLL: Duration = Duration::from_millis(25);

/// Wait until an eligible key can be selected, or until `deadline`.
///
/// Deferred selections sleep until the earliest estimated admit instant
/// (or a short poll when only completions can unblock) and re-evaluate;
/// the waiting entry does not lose its place.
///
/// # Errors
///
/// Returns `ProxyError::QueueExpired` when the deadline passes first.
pub async fn acquire_key(
    upstream: &Upstream,
    pools: &UpstreamPools,
    limiter: &UpstreamLimiter,
    deadline: Instant,
) -> Result<KeyLease, ProxyError> {
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(ProxyError::QueueExpired {
                upstream: upstream.id.clone(),
            });
        }
        match pools.key.select(limiter, now) {
            KeySelection::Selected(lease) => return Ok(lease),
            KeySelection::Deferred(earliest) => {
                let wake = earliest
                    .unwrap_or_else(|| now + CONCURRENCY_POLL)
                    .min(deadline);
                tokio::time::sleep_until(wake.into()).await;
            }
        }
    }
}

pub struct Executor {
    client: reqwest::Client,
    metrics: Arc<MetricsRegistry>,
    history: Arc<HistoryRing>,
}

impl Executor {
    #[must_use]
    pub fn new(
        client: reqwest::Client,
        metrics: Arc<MetricsRegistry>,
        history: Arc<HistoryRing>,
    ) -> Self {
        Self {
            client,
            metrics,
            history,
        }
    }

    /// Run the dispatch/retry loop for one admitted request.
    ///
    /// The caller has already selected the initial key; rotation may swap
    /// it. At most `retry.attempts + 1` upstream dispatches happen.
    ///
    /// # Errors
    ///
    /// Terminal failures per the §7 taxonomy. Upstream error statuses are
    /// not errors: once retries are exhausted the response is returned
    /// verbatim.
    pub async fn execute(
        &self,
        upstream: &Upstream,
        pools: &UpstreamPools,
        limiter: &UpstreamLimiter,
        up_metrics: &UpstreamMetrics,
        request: &mut CapturedRequest,
        lease: KeyLease,
        deadline: Instant,
    ) -> Result<ProxyResponse, ProxyError> {
        let counts_usage = limiter.path_limited(&request.suffix);
        let host = upstream_host(&upstream.endpoint)?;
        let url = build_url(upstream, request);
        // The inbound Authorization header identified the proxy user; it is
        // the proxy's own credential space and never forwarded.
        let suppress_authorization = request.user.is_some();

        self.metrics
            .record_request(&upstream.id, &mask_key(lease.value()), counts_usage);
        self.history
            .record_request(&upstream.id, &mask_key(lease.value()));

        if upstream.randomness > 0.0 {
            let jitter = rand::rng().random_range(0.0..=upstream.randomness);
            tokio::time::sleep(Duration::from_secs_f64(jitter)).await;
        }

        let started = Instant::now();
        let mut lease = lease;
        let mut attempt: u32 = 0;

        // Variables bind once per request; retries reuse the binding and
        // only rotation replaces the key entry.
        let referenced = upstream.referenced_variables();
        let mut bindings = pools.bind(&referenced, lease.value());

        loop {
            let attempt_start = Instant::now();
            bindings.insert(upstream.key_variable.clone(), lease.value().to_string());
            let outbound_headers = headers::build_outbound_headers(
                &request.headers,
                &upstream.headers,
                &bindings,
                &host,
                suppress_authorization,
            )?;

            let mut builder = self
                .client
                .request(request.method.clone(), &url)
                .headers(outbound_headers)
                .timeout(upstream.request_timeout);
            builder = match &request.body {
                CapturedBody::Empty => builder,
                CapturedBody::Buffered(bytes) => builder.body(bytes.clone()),
                CapturedBody::Stream(_) => match request.body.take_stream() {
                    Some(stream) => builder.body(reqwest::Body::wrap_stream(stream)),
                    None => {
                        return Err(ProxyError::network(
                            &upstream.id,
                            "request body stream already consumed",
                        ));
                    }
                },
            };

            debug!(
                upstream = %upstream.id,
                key = %mask_key(lease.value()),
                attempt,
                %url,
                "dispatching upstream request"
            );

            match builder.send().await {
                Ok(response) => {
                    let status = response.status();
                    let elapsed = attempt_start.elapsed();
                    let can_retry = upstream.retry.method_retryable(&request.method)
                        && upstream.retry.status_retryable(status.as_u16())
                        && attempt < upstream.retry.attempts
                        && request.body.is_replayable();
                    let delay = retry_after_hint(&response)
                        .unwrap_or_else(|| upstream.retry.delay_for(attempt + 1));

                    if !can_retry {
                        lease.observe_success(elapsed);
                        let total = started.elapsed();
                        self.metrics
                            .record_response(&upstream.id, status.as_u16(), total);
                        self.history.record_response(
                            &upstream.id,
                            &mask_key(lease.value()),
                            status.as_u16(),
                            total,
                        );
                        return Ok(stream_back(response, lease));
                    }

                    warn!(
                        upstream = %upstream.id,
                        key = %mask_key(lease.value()),
                        status = status.as_u16(),
                        attempt,
                        "retryable upstream status"
                    );
                    lease.observe_failure(Instant::now());
                    lease = self
                        .next_attempt(upstream, pools, limiter, lease, delay, deadline)
                        .await?;
                }
                Err(err) => {
                    let elapsed = attempt_start.elapsed();
                    // Network-level failures are retryable by method alone.
                    let can_retry = upstream.retry.method_retryable(&request.method)
                        && attempt < upstream.retry.attempts
                        && request.body.is_replayable();
                    let delay = upstream.retry.delay_for(attempt + 1);

                    if !can_retry {
                        lease.observe_failure(Instant::now());
                        let total = started.elapsed();
                        let (proxy_err, synthetic_status) = if err.is_timeout() {
                            (
                                ProxyError::UpstreamTimeout {
                                    upstream: upstream.id.clone(),
                                    elapsed_ms: elapsed.as_millis() as u64,
                                },
                                504,
                            )
                        } else {
                            (ProxyError::network(&upstream.id, err.to_string()), 502)
                        };
                        self.metrics
                            .record_response(&upstream.id, synthetic_status, total);
                        self.history.record_response(
                            &upstream.id,
                            &mask_key(lease.value()),
                            synthetic_status,
                            total,
                        );
                        return Err(proxy_err);
                    }

                    warn!(
                        upstream = %upstream.id,
                        key = %mask_key(lease.value()),
                        error = %err,
                        attempt,
                        "upstream network failure, retrying"
                    );
                    lease.observe_failure(Instant::now());
                    lease = self
                        .next_attempt(upstream, pools, limiter, lease, delay, deadline)
                        .await?;
                }
            }

            attempt += 1;
            up_metrics.record_retry();
            if counts_usage {
                // Each dispatch binds a key; rotation may have changed it.
                up_metrics.record_request_key_only(&mask_key(lease.value()));
            }
        }
    }

    /// Prepare the next attempt: cooldown + re-select for `key_rotation`,
    /// plain sleep for the other modes.
    async fn next_attempt(
        &self,
        upstream: &Upstream,
        pools: &UpstreamPools,
        limiter: &UpstreamLimiter,
        lease: KeyLease,
        delay: Duration,
        deadline: Instant,
    ) -> Result<KeyLease, ProxyError> {
        match upstream.retry.mode {
            RetryMode::KeyRotation => {
                pools
                    .key
                    .cooldown(lease.value(), Instant::now() + upstream.retry.retry_after);
                drop(lease);
                acquire_key(upstream, pools, limiter, deadline).await
            }
            RetryMode::Default | RetryMode::Backoff => {
                if delay > Duration::ZERO {
                    tokio::time::sleep(delay).await;
                }
                Ok(lease)
            }
        }
    }
}

/// Target URL: base + captured suffix + original query string.
fn build_url(upstream: &Upstream, request: &CapturedRequest) -> String {
    match &request.query {
        Some(query) => format!("{}{}?{query}", upstream.endpoint, request.suffix),
        None => format!("{}{}", upstream.endpoint, request.suffix),
    }
}

/// Host (with any port) of the upstream base URL, for the `Host` header.
fn upstream_host(endpoint: &str) -> Result<String, ProxyError> {
    let rest = endpoint
        .strip_prefix("https://")
        .or_else(|| endpoint.strip_prefix("http://"))
        .ok_or_else(|| ProxyError::configuration(format!("invalid endpoint '{endpoint}'")))?;
    let host = rest.split('/').next().unwrap_or_default();
    if host.is_empty() {
        return Err(ProxyError::configuration(format!(
            "endpoint '{endpoint}' has no host"
        )));
    }
    Ok(host.to_string())
}

/// Integer-seconds `Retry-After` hint on a retryable response.
fn retry_after_hint(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(http::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Assemble the client-facing response; the key lease rides on the body
/// stream so the concurrency slot frees when streaming finishes.
fn stream_back(response: reqwest::Response, lease: KeyLease) -> ProxyResponse {
    let status = response.status();
    let mut resp_headers = response.headers().clone();
    headers::sanitize_response_headers(&mut resp_headers);

    let inner: BodyStream = Box::pin(
        response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| Box::new(e) as super::request::BoxError)),
    );

    ProxyResponse {
        status,
        headers: resp_headers,
        body: Box::pin(LeasedStream {
            inner,
            _lease: lease,
        }),
    }
}

/// A body stream that owns the key lease for its lifetime.
struct LeasedStream {
    inner: BodyStream,
    _lease: KeyLease,
}

impl Stream for LeasedStream {
    type Item = Result<Bytes, super::request::BoxError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joins_suffix_and_query() {
        let upstream = test_upstream("https://api.example.com");
        let request = captured("/v1/chat", Some("stream=true".into()));
        assert_eq!(
            build_url(&upstream, &request),
            "https://api.example.com/v1/chat?stream=true"
        );
        let request = captured("/", None);
        assert_eq!(build_url(&upstream, &request), "https://api.example.com/");
    }

    #[test]
    fn host_extraction() {
        assert_eq!(upstream_host("https://api.example.com").unwrap(), "api.example.com");
        assert_eq!(
            upstream_host("http://localhost:9000").unwrap(),
            "localhost:9000"
        );
        assert!(upstream_host("ftp://x").is_err());
        assert!(upstream_host("https://").is_err());
    }

    fn test_upstream(endpoint: &str) -> Upstream {
        use crate::domain::model::*;
        use std::collections::HashMap;
        Upstream {
            id: "test".into(),
            name: "test".into(),
            endpoint: endpoint.into(),
            aliases: vec![],
            headers: vec![],
            variables: HashMap::from([("keys".to_string(), vec!["k".to_string()])]),
            variable_weights: HashMap::new(),
            strategy: LbStrategy::RoundRobin,
            key_variable: "keys".into(),
            key_concurrency: true,
            randomness: 0.0,
            allowed_methods: None,
            path_filter: None,
            queue: QueueSettings {
                max_size: 10,
                expiry: Duration::from_secs(10),
                max_workers: 1,
            },
            quotas: QuotaSet {
                endpoint: None,
                key: None,
                ip: None,
                user: None,
                rate_limit_paths: PathPatterns::All,
            },
            retry: RetryPolicy::disabled(),
            request_timeout: Duration::from_secs(5),
            rewrite: None,
        }
    }

    fn captured(suffix: &str, query: Option<String>) -> CapturedRequest {
        CapturedRequest {
            method: http::Method::GET,
            suffix: suffix.into(),
            query,
            headers: http::HeaderMap::new(),
            body: CapturedBody::Empty,
            client_ip: "127.0.0.1".into(),
            user: None,
        }
    }
}
