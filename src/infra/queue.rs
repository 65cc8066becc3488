//! Per-upstream admission queue and worker pool.
//!
//! Every proxied request is captured and enqueued; workers drain strictly
//! FIFO, skipping canceled and expired entries. A worker holding the head
//! entry waits out rate-limit deferrals in place, so blocked traffic keeps
//! its order while the deadline is honored.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use tokio::sync::{Notify, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::domain::error::ProxyError;
use crate::domain::model::Upstream;

use super::executor::{Executor, acquire_key};
use super::limit::UpstreamLimiter;
use super::metrics::{MetricsRegistry, UpstreamMetrics};
use super::pool::{KeySelection, UpstreamPools};
use super::request::{CapturedRequest, ProxyResponse};

pub type ReplySender = oneshot::Sender<Result<ProxyResponse, ProxyError>>;
pub type ReplyReceiver = oneshot::Receiver<Result<ProxyResponse, ProxyError>>;

/// One captured request waiting for dispatch.
#[derive(Debug)]
pub struct QueuedEntry {
    pub request: CapturedRequest,
    pub enqueued_at: Instant,
    pub deadline: Instant,
    pub reply: ReplySender,
}

/// Bounded FIFO of captured requests for one upstream.
pub struct AdmissionQueue {
    capacity: usize,
    entries: parking_lot::Mutex<VecDeque<QueuedEntry>>,
    depth: AtomicUsize,
    notify: Notify,
}

impl AdmissionQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: parking_lot::Mutex::new(VecDeque::new()),
            depth: AtomicUsize::new(0),
            notify: Notify::new(),
        }
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    /// Enqueue, rejecting at capacity. The rejected entry is handed back so
    /// the caller can answer its waiting client.
    pub fn submit(&self, entry: QueuedEntry) -> Result<(), QueuedEntry> {
        {
            let mut entries = self.entries.lock();
            if entries.len() >= self.capacity {
                return Err(entry);
            }
            entries.push_back(entry);
            self.depth.store(entries.len(), Ordering::Release);
        }
        self.notify.notify_one();
        Ok(())
    }

    fn try_pop(&self) -> Option<QueuedEntry> {
        let mut entries = self.entries.lock();
        let entry = entries.pop_front();
        self.depth.store(entries.len(), Ordering::Release);
        // Notify stores at most one wakeup, so a submit burst can leave
        // entries behind parked workers; chain the wakeup while the queue
        // is non-empty.
        if entry.is_some() && !entries.is_empty() {
            self.notify.notify_one();
        }
        entry
    }

    async fn next(&self) -> QueuedEntry {
        loop {
            if let Some(entry) = self.try_pop() {
                return entry;
            }
            self.notify.notified().await;
        }
    }

    /// Cancel every queued entry, answering their clients, and return the
    /// canceled count. New entries are accepted immediately afterwards.
    pub fn clear(&self) -> usize {
        let drained: Vec<QueuedEntry> = {
            let mut entries = self.entries.lock();
            let drained = entries.drain(..).collect();
            self.depth.store(0, Ordering::Release);
            drained
        };
        let count = drained.len();
        for entry in drained {
            let _ = entry.reply.send(Err(ProxyError::Canceled));
        }
        count
    }
}

// ---------------------------------------------------------------------------
// Upstream context & workers
// ---------------------------------------------------------------------------

/// Everything the request path needs for one upstream, for one
/// configuration generation.
pub struct UpstreamContext {
    pub upstream: Arc<Upstream>,
    pub pools: UpstreamPools,
    pub limiter: UpstreamLimiter,
    pub queue: AdmissionQueue,
    pub metrics: Arc<UpstreamMetrics>,
}

impl UpstreamContext {
    #[must_use]
    pub fn new(upstream: Upstream, metrics: Arc<UpstreamMetrics>) -> Self {
        let pools = UpstreamPools::new(&upstream);
        let limiter = UpstreamLimiter::new(&upstream.quotas);
        let queue = AdmissionQueue::new(upstream.queue.max_size);
        Self {
            upstream: Arc::new(upstream),
            pools,
            limiter,
            queue,
            metrics,
        }
    }
}

/// Spawn the worker pool for one upstream. Workers exit on `shutdown`.
pub fn spawn_workers(
    ctx: Arc<UpstreamContext>,
    executor: Arc<Executor>,
    registry: Arc<MetricsRegistry>,
    shutdown: CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
    let count = ctx.upstream.queue.max_workers;
    (0..count)
        .map(|worker_id| {
            let ctx = Arc::clone(&ctx);
            let executor = Arc::clone(&executor);
            let registry = Arc::clone(&registry);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                run_worker(worker_id, ctx, executor, registry, shutdown).await;
            })
        })
        .collect()
}

async fn run_worker(
    worker_id: usize,
    ctx: Arc<UpstreamContext>,
    executor: Arc<Executor>,
    registry: Arc<MetricsRegistry>,
    shutdown: CancellationToken,
) {
    debug!(upstream = %ctx.upstream.id, worker_id, "worker started");
    loop {
        let entry = tokio::select! {
            entry = ctx.queue.next() => entry,
            () = shutdown.cancelled() => break,
        };
        process_entry(&ctx, &executor, &registry, entry).await;
    }
    debug!(upstream = %ctx.upstream.id, worker_id, "worker stopped");
}

async fn process_entry(
    ctx: &UpstreamContext,
    executor: &Executor,
    registry: &MetricsRegistry,
    entry: QueuedEntry,
) {
    let QueuedEntry {
        mut request,
        enqueued_at,
        deadline,
        mut reply,
    } = entry;

    if reply.is_closed() {
        ctx.metrics.queue.canceled.fetch_add(1, Ordering::Relaxed);
        return;
    }
    if Instant::now() > deadline {
        ctx.metrics.queue.expired.fetch_add(1, Ordering::Relaxed);
        let _ = reply.send(Err(ProxyError::QueueExpired {
            upstream: ctx.upstream.id.clone(),
        }));
        return;
    }

    let outcome = tokio::select! {
        result = dispatch(ctx, executor, registry, &mut request, deadline) => Some(result),
        () = reply.closed() => None,
    };

    match outcome {
        None => {
            // Client went away; the dropped future tears down any in-flight
            // upstream connection.
            debug!(upstream = %ctx.upstream.id, "queued request canceled by client");
            ctx.metrics.queue.canceled.fetch_add(1, Ordering::Relaxed);
        }
        Some(result) => {
            match &result {
                Ok(_) => {
                    ctx.metrics.queue.processed.fetch_add(1, Ordering::Relaxed);
                }
                Err(ProxyError::QueueExpired { .. }) => {
                    ctx.metrics.queue.expired.fetch_add(1, Ordering::Relaxed);
                    info!(
                        upstream = %ctx.upstream.id,
                        waited_ms = enqueued_at.elapsed().as_millis() as u64,
                        "queued request expired"
                    );
                }
                Err(_) => {
                    ctx.metrics.queue.failed.fetch_add(1, Ordering::Relaxed);
                }
            }
            let _ = reply.send(result);
        }
    }
}

/// Admission (endpoint/ip/user), key selection, then execution. Deferrals
/// sleep in place; the deadline converts into `queue_expired`.
async fn dispatch(
    ctx: &UpstreamContext,
    executor: &Executor,
    registry: &MetricsRegistry,
    request: &mut CapturedRequest,
    deadline: Instant,
) -> Result<ProxyResponse, ProxyError> {
    let mut waited = false;
    let mut mark_blocked = |registry: &MetricsRegistry| {
        if !waited {
            waited = true;
            registry.record_rate_limit_hit(&ctx.upstream.id);
            ctx.metrics.record_queue_hit();
        }
    };

    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(ProxyError::QueueExpired {
                upstream: ctx.upstream.id.clone(),
            });
        }
        match ctx.limiter.try_admit(
            &request.suffix,
            &request.client_ip,
            request.user.as_deref(),
            now,
        ) {
            Ok(()) => break,
            Err(free_at) => {
                mark_blocked(registry);
                debug!(
                    upstream = %ctx.upstream.id,
                    wait_ms = free_at.saturating_duration_since(now).as_millis() as u64,
                    "admission blocked by rate limit"
                );
                tokio::time::sleep_until(free_at.min(deadline).into()).await;
            }
        }
    }

    let lease = match ctx.pools.key.select(&ctx.limiter, Instant::now()) {
        KeySelection::Selected(lease) => lease,
        KeySelection::Deferred(_) => {
            mark_blocked(registry);
            acquire_key(&ctx.upstream, &ctx.pools, &ctx.limiter, deadline).await?
        }
    };

    executor
        .execute(
            &ctx.upstream,
            &ctx.pools,
            &ctx.limiter,
            &ctx.metrics,
            request,
            lease,
            deadline,
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, Method};
    use std::time::Duration;

    use crate::infra::request::CapturedBody;

    fn entry(deadline_in: Duration) -> (QueuedEntry, ReplyReceiver) {
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        (
            QueuedEntry {
                request: CapturedRequest {
                    method: Method::GET,
                    suffix: "/".into(),
                    query: None,
                    headers: HeaderMap::new(),
                    body: CapturedBody::Empty,
                    client_ip: "127.0.0.1".into(),
                    user: None,
                },
                enqueued_at: now,
                deadline: now + deadline_in,
                reply: tx,
            },
            rx,
        )
    }

    #[test]
    fn queue_bounds_enforced() {
        let queue = AdmissionQueue::new(2);
        let (e1, _r1) = entry(Duration::from_secs(5));
        let (e2, _r2) = entry(Duration::from_secs(5));
        let (e3, _r3) = entry(Duration::from_secs(5));
        assert!(queue.submit(e1).is_ok());
        assert!(queue.submit(e2).is_ok());
        assert_eq!(queue.depth(), 2);
        assert!(queue.submit(e3).is_err());
        assert_eq!(queue.depth(), 2);
    }

    #[test]
    fn pop_preserves_fifo() {
        let queue = AdmissionQueue::new(10);
        let mut receivers = Vec::new();
        for i in 0..3 {
            let (mut e, r) = entry(Duration::from_secs(5));
            e.request.suffix = format!("/{i}");
            queue.submit(e).unwrap();
            receivers.push(r);
        }
        for i in 0..3 {
            let popped = queue.try_pop().unwrap();
            assert_eq!(popped.request.suffix, format!("/{i}"));
        }
        assert!(queue.try_pop().is_none());
    }

    #[tokio::test]
    async fn clear_cancels_waiting_clients() {
        let queue = AdmissionQueue::new(10);
        let (e1, r1) = entry(Duration::from_secs(5));
        let (e2, r2) = entry(Duration::from_secs(5));
        queue.submit(e1).unwrap();
        queue.submit(e2).unwrap();

        assert_eq!(queue.clear(), 2);
        assert_eq!(queue.depth(), 0);
        assert!(matches!(r1.await.unwrap(), Err(ProxyError::Canceled)));
        assert!(matches!(r2.await.unwrap(), Err(ProxyError::Canceled)));

        // Accepts new entries right away.
        let (e3, _r3) = entry(Duration::from_secs(5));
        assert!(queue.submit(e3).is_ok());
    }

    #[tokio::test]
    async fn next_wakes_on_submit() {
        let queue = Arc::new(AdmissionQueue::new(4));
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let (e, _r) = entry(Duration::from_secs(5));
        queue.submit(e).unwrap();
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("worker woke")
            .unwrap();
        assert_eq!(got.request.suffix, "/");
    }
}
