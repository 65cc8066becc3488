//! Sliding-window rate limiting.
//!
//! One window guards one (scope, identifier) pair. The endpoint scope has a
//! single window per upstream; ip, user and key scopes hold one window per
//! identifier, created lazily. Multi-scope admission is peek-then-commit
//! under a per-upstream admission lock, so decisions are linearizable: a
//! request is either counted in every applicable scope or in none.

use std::collections::VecDeque;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::domain::model::{PathPatterns, QuotaSet};
use crate::domain::quota::Quota;

/// A sliding counter over one quota. Samples older than the window are
/// evicted before every decision, so `samples.len() <= limit` always holds
/// after an admission.
#[derive(Debug)]
pub struct SlidingWindow {
    quota: Quota,
    samples: VecDeque<Instant>,
}

impl SlidingWindow {
    #[must_use]
    pub fn new(quota: Quota) -> Self {
        Self {
            quota,
            samples: VecDeque::with_capacity(quota.limit as usize),
        }
    }

    fn evict(&mut self, now: Instant) {
        while let Some(front) = self.samples.front() {
            if now.duration_since(*front) >= self.quota.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Check headroom without recording. On a block, returns the instant
    /// the oldest sample leaves the window.
    pub fn peek(&mut self, now: Instant) -> Result<(), Instant> {
        self.evict(now);
        if (self.samples.len() as u32) < self.quota.limit {
            Ok(())
        } else {
            let oldest = *self.samples.front().expect("full window has samples");
            Err(oldest + self.quota.window)
        }
    }

    /// Record one admission. Callers must have observed headroom under the
    /// same lock.
    pub fn record(&mut self, now: Instant) {
        self.samples.push_back(now);
    }

    /// Peek and record in one step.
    pub fn try_admit(&mut self, now: Instant) -> Result<(), Instant> {
        self.peek(now)?;
        self.record(now);
        Ok(())
    }

    #[must_use]
    pub fn occupancy(&mut self, now: Instant) -> u32 {
        self.evict(now);
        self.samples.len() as u32
    }
}

/// Lazily-populated windows for one keyed scope (ip, user or key).
#[derive(Debug)]
pub struct WindowMap {
    quota: Quota,
    windows: DashMap<String, Mutex<SlidingWindow>>,
}

impl WindowMap {
    #[must_use]
    pub fn new(quota: Quota) -> Self {
        Self {
            quota,
            windows: DashMap::new(),
        }
    }

    pub fn with<R>(&self, id: &str, f: impl FnOnce(&mut SlidingWindow) -> R) -> R {
        let entry = self
            .windows
            .entry(id.to_string())
            .or_insert_with(|| Mutex::new(SlidingWindow::new(self.quota)));
        let mut window = entry.lock();
        f(&mut window)
    }

    pub fn peek(&self, id: &str, now: Instant) -> Result<(), Instant> {
        self.with(id, |w| w.peek(now))
    }

    pub fn record(&self, id: &str, now: Instant) {
        self.with(id, |w| w.record(now));
    }

    pub fn try_admit(&self, id: &str, now: Instant) -> Result<(), Instant> {
        self.with(id, |w| w.try_admit(now))
    }
}

/// All quota windows of one upstream.
///
/// Endpoint, ip and user scopes are consumed together at dispatch
/// admission (`try_admit`); the key scope is consumed inside key selection
/// (`try_admit_key`), one admission per selected key.
#[derive(Debug)]
pub struct UpstreamLimiter {
    endpoint: Option<Mutex<SlidingWindow>>,
    ip: Option<WindowMap>,
    user: Option<WindowMap>,
    key: Option<WindowMap>,
    limited_paths: PathPatterns,
    admission: Mutex<()>,
}

impl UpstreamLimiter {
    #[must_use]
    pub fn new(quotas: &QuotaSet) -> Self {
        Self {
            endpoint: quotas.endpoint.map(|q| Mutex::new(SlidingWindow::new(q))),
            ip: quotas.ip.map(WindowMap::new),
            user: quotas.user.map(WindowMap::new),
            key: quotas.key.map(WindowMap::new),
            limited_paths: quotas.rate_limit_paths.clone(),
            admission: Mutex::new(()),
        }
    }

    /// Whether the path counts toward endpoint admission and key-usage
    /// accounting.
    #[must_use]
    pub fn path_limited(&self, suffix: &str) -> bool {
        self.limited_paths.matches(suffix)
    }

    /// Admit one request across the endpoint, ip and user scopes, checked
    /// in that order (cheapest first, first block wins). All-or-nothing:
    /// a blocked scope leaves the earlier scopes unrecorded.
    ///
    /// # Errors
    ///
    /// Returns the earliest instant at which the blocking scope frees a
    /// slot.
    pub fn try_admit(
        &self,
        suffix: &str,
        ip: &str,
        user: Option<&str>,
        now: Instant,
    ) -> Result<(), Instant> {
        let _guard = self.admission.lock();

        let endpoint_applies = self.endpoint.is_some() && self.path_limited(suffix);
        if endpoint_applies {
            self.endpoint
                .as_ref()
                .expect("checked above")
                .lock()
                .peek(now)?;
        }
        if let Some(windows) = &self.ip {
            windows.peek(ip, now)?;
        }
        if let (Some(windows), Some(user)) = (&self.user, user) {
            windows.peek(user, now)?;
        }

        if endpoint_applies {
            self.endpoint
                .as_ref()
                .expect("checked above")
                .lock()
                .record(now);
        }
        if let Some(windows) = &self.ip {
            windows.record(ip, now);
        }
        if let (Some(windows), Some(user)) = (&self.user, user) {
            windows.record(user, now);
        }
        Ok(())
    }

    /// Headroom check for one key, without recording.
    pub fn peek_key(&self, key: &str, now: Instant) -> Result<(), Instant> {
        match &self.key {
            Some(windows) => windows.peek(key, now),
            None => Ok(()),
        }
    }

    /// Consume one key-scope admission for the selected key.
    pub fn try_admit_key(&self, key: &str, now: Instant) -> Result<(), Instant> {
        match &self.key {
            Some(windows) => windows.try_admit(key, now),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn quota(limit: u32, secs: u64) -> Quota {
        Quota {
            limit,
            window: Duration::from_secs(secs),
        }
    }

    fn quotas(
        endpoint: Option<Quota>,
        key: Option<Quota>,
        ip: Option<Quota>,
        user: Option<Quota>,
    ) -> QuotaSet {
        QuotaSet {
            endpoint,
            key,
            ip,
            user,
            rate_limit_paths: PathPatterns::All,
        }
    }

    #[test]
    fn window_admits_up_to_limit() {
        let mut window = SlidingWindow::new(quota(2, 1));
        let t0 = Instant::now();
        assert!(window.try_admit(t0).is_ok());
        assert!(window.try_admit(t0).is_ok());
        let next = window.try_admit(t0).unwrap_err();
        assert_eq!(next, t0 + Duration::from_secs(1));
    }

    #[test]
    fn window_slides() {
        let mut window = SlidingWindow::new(quota(2, 1));
        let t0 = Instant::now();
        window.try_admit(t0).unwrap();
        window.try_admit(t0 + Duration::from_millis(500)).unwrap();

        // At t0+1s the first sample leaves the window.
        assert!(window.try_admit(t0 + Duration::from_millis(999)).is_err());
        assert!(window.try_admit(t0 + Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn soundness_over_any_interval() {
        // Admissions in any contiguous window of length W never exceed N.
        let mut window = SlidingWindow::new(quota(3, 10));
        let t0 = Instant::now();
        let mut admitted: Vec<Instant> = Vec::new();
        for i in 0..200 {
            let now = t0 + Duration::from_millis(i * 137);
            if window.try_admit(now).is_ok() {
                admitted.push(now);
            }
        }
        for (i, start) in admitted.iter().enumerate() {
            let in_window = admitted[i..]
                .iter()
                .take_while(|t| t.duration_since(*start) < Duration::from_secs(10))
                .count();
            assert!(in_window <= 3, "window starting at sample {i} holds {in_window}");
        }
    }

    #[test]
    fn multi_scope_block_leaves_no_partial_count() {
        // ip allows 1, endpoint allows 10: the second request from the same
        // ip must not consume an endpoint slot.
        let limiter = UpstreamLimiter::new(&quotas(
            Some(quota(10, 60)),
            None,
            Some(quota(1, 60)),
            None,
        ));
        let now = Instant::now();
        assert!(limiter.try_admit("/v1", "1.2.3.4", None, now).is_ok());
        assert!(limiter.try_admit("/v1", "1.2.3.4", None, now).is_err());

        // Other ips still have the full endpoint budget: 9 slots remain.
        for i in 0..9 {
            let ip = format!("10.0.0.{i}");
            assert!(limiter.try_admit("/v1", &ip, None, now).is_ok(), "slot {i}");
        }
        assert!(limiter.try_admit("/v1", "10.0.0.99", None, now).is_err());
    }

    #[test]
    fn user_scope_counts_per_credential() {
        let limiter =
            UpstreamLimiter::new(&quotas(None, None, None, Some(quota(1, 60))));
        let now = Instant::now();
        assert!(limiter.try_admit("/", "ip", Some("alice"), now).is_ok());
        assert!(limiter.try_admit("/", "ip", Some("alice"), now).is_err());
        assert!(limiter.try_admit("/", "ip", Some("bob"), now).is_ok());
        // No user credential: the user scope does not apply.
        assert!(limiter.try_admit("/", "ip", None, now).is_ok());
    }

    #[test]
    fn endpoint_scope_applies_only_to_limited_paths() {
        let mut set = quotas(Some(quota(1, 60)), None, None, None);
        set.rate_limit_paths =
            PathPatterns::compile("test", &["^/v1/chat.*".to_string()]).unwrap();
        let limiter = UpstreamLimiter::new(&set);
        let now = Instant::now();

        assert!(limiter.try_admit("/v1/chat/completions", "ip", None, now).is_ok());
        assert!(limiter.try_admit("/v1/chat/completions", "ip", None, now).is_err());
        // Unlimited path: always admitted.
        assert!(limiter.try_admit("/v1/models", "ip", None, now).is_ok());
        assert!(limiter.try_admit("/v1/models", "ip", None, now).is_ok());
    }

    #[test]
    fn key_scope_is_separate_from_admission() {
        let limiter = UpstreamLimiter::new(&quotas(None, Some(quota(1, 60)), None, None));
        let now = Instant::now();
        assert!(limiter.try_admit_key("A", now).is_ok());
        let blocked = limiter.try_admit_key("A", now).unwrap_err();
        assert!(blocked > now);
        assert!(limiter.try_admit_key("B", now).is_ok());
        // peek never consumes.
        assert!(limiter.peek_key("B", now).is_err());
        assert!(limiter.peek_key("C", now).is_ok());
        assert!(limiter.peek_key("C", now).is_ok());
    }

    #[test]
    fn unlimited_scopes_always_admit() {
        let limiter = UpstreamLimiter::new(&quotas(None, None, None, None));
        let now = Instant::now();
        for _ in 0..1000 {
            assert!(limiter.try_admit("/", "ip", Some("u"), now).is_ok());
            assert!(limiter.try_admit_key("k", now).is_ok());
        }
    }
}
