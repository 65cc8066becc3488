//! Process-wide metrics registry and request history ring.
//!
//! Counters are atomics on the hot path; only the response-time aggregate
//! sits behind a short mutex. Key identifiers are masked before they reach
//! metrics, history or logs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Value, json};

/// Mask a credential for metrics and logs: first and last four characters
/// for long keys, all stars for short ones.
#[must_use]
pub fn mask_key(key: &str) -> String {
    if key.is_empty() {
        return "unknown".to_string();
    }
    if key.chars().count() <= 8 {
        return "*".repeat(key.chars().count());
    }
    let head: String = key.chars().take(4).collect();
    let tail: String = key.chars().rev().take(4).collect::<Vec<_>>().into_iter().rev().collect();
    format!("{head}...{tail}")
}

// ---------------------------------------------------------------------------
// History ring
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    Request,
    Response,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub kind: HistoryKind,
    /// Unix timestamp in milliseconds.
    pub timestamp_ms: u64,
    pub upstream_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
    /// Masked key identifier.
    pub key_id: String,
}

/// Bounded ring of recent request/response entries; oldest evicted.
#[derive(Debug)]
pub struct HistoryRing {
    capacity: usize,
    entries: Mutex<VecDeque<HistoryEntry>>,
}

impl HistoryRing {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    pub fn record_request(&self, upstream_id: &str, key_id: &str) {
        self.push(HistoryEntry {
            kind: HistoryKind::Request,
            timestamp_ms: unix_millis(),
            upstream_id: upstream_id.to_string(),
            status_code: None,
            elapsed_ms: None,
            key_id: key_id.to_string(),
        });
    }

    pub fn record_response(
        &self,
        upstream_id: &str,
        key_id: &str,
        status_code: u16,
        elapsed: Duration,
    ) {
        self.push(HistoryEntry {
            kind: HistoryKind::Response,
            timestamp_ms: unix_millis(),
            upstream_id: upstream_id.to_string(),
            status_code: Some(status_code),
            elapsed_ms: Some(elapsed.as_millis() as u64),
            key_id: key_id.to_string(),
        });
    }

    fn push(&self, entry: HistoryEntry) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<HistoryEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ---------------------------------------------------------------------------
// Per-upstream metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct TimeStats {
    count: u64,
    total_ms: f64,
    min_ms: f64,
    max_ms: f64,
}

#[derive(Debug, Default)]
pub struct QueueCounters {
    pub enqueued: AtomicU64,
    pub processed: AtomicU64,
    pub expired: AtomicU64,
    pub failed: AtomicU64,
    pub canceled: AtomicU64,
}

#[derive(Debug, Default)]
pub struct UpstreamMetrics {
    requests: AtomicU64,
    errors: AtomicU64,
    rate_limit_hits: AtomicU64,
    queue_hits: AtomicU64,
    retries: AtomicU64,
    responses_by_status: DashMap<u16, AtomicU64>,
    key_usage: DashMap<String, AtomicU64>,
    response_times: Mutex<TimeStats>,
    pub queue: QueueCounters,
}

impl UpstreamMetrics {
    pub fn record_request(&self, key_id: &str, counts_key_usage: bool) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if counts_key_usage {
            self.key_usage
                .entry(key_id.to_string())
                .or_default()
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_response(&self, status: u16, elapsed: Duration) {
        if status >= 400 {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        self.responses_by_status
            .entry(status)
            .or_default()
            .fetch_add(1, Ordering::Relaxed);

        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        let mut stats = self.response_times.lock();
        if stats.count == 0 {
            stats.min_ms = elapsed_ms;
            stats.max_ms = elapsed_ms;
        } else {
            stats.min_ms = stats.min_ms.min(elapsed_ms);
            stats.max_ms = stats.max_ms.max(elapsed_ms);
        }
        stats.count += 1;
        stats.total_ms += elapsed_ms;
    }

    pub fn record_rate_limit_hit(&self) {
        self.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queue_hit(&self) {
        self.queue_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Attribute a retry dispatch to its (possibly rotated) key without
    /// counting a new request.
    pub fn record_request_key_only(&self, key_id: &str) {
        self.key_usage
            .entry(key_id.to_string())
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn key_usage_of(&self, key_id: &str) -> u64 {
        self.key_usage
            .get(key_id)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    fn summary(&self) -> Value {
        let stats = self.response_times.lock();
        let avg_ms = if stats.count == 0 {
            0.0
        } else {
            stats.total_ms / stats.count as f64
        };
        let statuses: serde_json::Map<String, Value> = self
            .responses_by_status
            .iter()
            .map(|e| (e.key().to_string(), json!(e.value().load(Ordering::Relaxed))))
            .collect();
        let keys: serde_json::Map<String, Value> = self
            .key_usage
            .iter()
            .map(|e| (e.key().clone(), json!(e.value().load(Ordering::Relaxed))))
            .collect();

        json!({
            "requests": self.requests(),
            "errors": self.errors(),
            "rate_limit_hits": self.rate_limit_hits.load(Ordering::Relaxed),
            "queue_hits": self.queue_hits.load(Ordering::Relaxed),
            "retries": self.retries(),
            "responses_by_status": statuses,
            "key_usage": keys,
            "response_time_ms": {
                "min": if stats.count == 0 { 0.0 } else { stats.min_ms },
                "avg": avg_ms,
                "max": stats.max_ms,
            },
            "queue": {
                "enqueued": self.queue.enqueued.load(Ordering::Relaxed),
                "processed": self.queue.processed.load(Ordering::Relaxed),
                "expired": self.queue.expired.load(Ordering::Relaxed),
                "failed": self.queue.failed.load(Ordering::Relaxed),
                "canceled": self.queue.canceled.load(Ordering::Relaxed),
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Process-wide metrics, surviving configuration reloads.
#[derive(Debug)]
pub struct MetricsRegistry {
    started: Instant,
    start_time: SystemTime,
    total_requests: AtomicU64,
    total_errors: AtomicU64,
    total_rate_limit_hits: AtomicU64,
    upstreams: DashMap<String, std::sync::Arc<UpstreamMetrics>>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            start_time: SystemTime::now(),
            total_requests: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            total_rate_limit_hits: AtomicU64::new(0),
            upstreams: DashMap::new(),
        }
    }

    #[must_use]
    pub fn upstream(&self, id: &str) -> std::sync::Arc<UpstreamMetrics> {
        self.upstreams
            .entry(id.to_string())
            .or_default()
            .clone()
    }

    pub fn record_request(&self, id: &str, key_id: &str, counts_key_usage: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.upstream(id).record_request(key_id, counts_key_usage);
    }

    pub fn record_response(&self, id: &str, status: u16, elapsed: Duration) {
        if status >= 400 {
            self.total_errors.fetch_add(1, Ordering::Relaxed);
        }
        self.upstream(id).record_response(status, elapsed);
    }

    pub fn record_rate_limit_hit(&self, id: &str) {
        self.total_rate_limit_hits.fetch_add(1, Ordering::Relaxed);
        self.upstream(id).record_rate_limit_hit();
    }

    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    #[must_use]
    pub fn summary(&self) -> Value {
        let upstreams: serde_json::Map<String, Value> = self
            .upstreams
            .iter()
            .map(|e| (e.key().clone(), e.value().summary()))
            .collect();
        json!({
            "total_requests": self.total_requests.load(Ordering::Relaxed),
            "total_errors": self.total_errors.load(Ordering::Relaxed),
            "total_rate_limit_hits": self.total_rate_limit_hits.load(Ordering::Relaxed),
            "uptime_seconds": self.uptime().as_secs(),
            "start_time": self
                .start_time
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            "upstreams": upstreams,
        })
    }
}
