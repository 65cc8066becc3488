//! Variable pools, per-key state, and load-balanced selection.
//!
//! Non-key variables are picked purely by strategy. The key variable
//! additionally passes an eligibility check (failure cooldown, concurrency,
//! key-window headroom); when no key is eligible the caller receives the
//! earliest instant at which one might become so and defers.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;

use crate::domain::model::{LbStrategy, Upstream};

use super::limit::UpstreamLimiter;

/// EWMA smoothing factor for per-key response times.
const EWMA_ALPHA: f64 = 0.3;

// ---------------------------------------------------------------------------
// KeyState
// ---------------------------------------------------------------------------

/// Hot-path state for one credential value. All fields are atomics; time
/// fields are nanoseconds since the pool epoch (0 = never).
#[derive(Debug, Default)]
pub struct KeyState {
    in_flight: AtomicU32,
    last_used_ns: AtomicU64,
    ewma_micros: AtomicU64,
    requests: AtomicU64,
    last_failure_ns: AtomicU64,
    cooldown_until_ns: AtomicU64,
}

impl KeyState {
    #[must_use]
    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Smoothed response time; `None` until the first sample.
    #[must_use]
    pub fn response_time(&self) -> Option<Duration> {
        match self.ewma_micros.load(Ordering::Relaxed) {
            0 => None,
            micros => Some(Duration::from_micros(micros)),
        }
    }

    /// Offset of the last observed failure from the pool epoch.
    #[must_use]
    pub fn last_failure(&self) -> Option<Duration> {
        match self.last_failure_ns.load(Ordering::Relaxed) {
            0 => None,
            nanos => Some(Duration::from_nanos(nanos)),
        }
    }

    fn observe_response_time(&self, elapsed: Duration) {
        let sample = elapsed.as_micros().max(1) as u64;
        let old = self.ewma_micros.load(Ordering::Relaxed);
        let next = if old == 0 {
            sample
        } else {
            ((old as f64) * (1.0 - EWMA_ALPHA) + (sample as f64) * EWMA_ALPHA) as u64
        };
        self.ewma_micros.store(next.max(1), Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Plain variable pools (non-key)
// ---------------------------------------------------------------------------

/// An ordered pool of interchangeable values with a strategy cursor.
/// `least_requests` and `fastest_response` need per-key state, which only
/// the key pool tracks, so plain pools degrade them to round-robin.
#[derive(Debug)]
pub struct VariablePool {
    values: Vec<String>,
    weights: Option<Vec<f64>>,
    cursor: AtomicUsize,
}

impl VariablePool {
    #[must_use]
    pub fn new(values: Vec<String>, weights: Option<Vec<f64>>) -> Self {
        debug_assert!(!values.is_empty(), "pools are non-empty after validation");
        Self {
            values,
            weights,
            cursor: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn pick(&self, strategy: LbStrategy) -> &str {
        let index = match strategy {
            LbStrategy::Random => rand::rng().random_range(0..self.values.len()),
            LbStrategy::Weighted => match &self.weights {
                Some(weights) => weighted_pick(weights, (0..self.values.len()).collect()),
                None => self.advance(),
            },
            _ => self.advance(),
        };
        &self.values[index]
    }

    fn advance(&self) -> usize {
        self.cursor.fetch_add(1, Ordering::AcqRel) % self.values.len()
    }
}

/// Cumulative-weight pick over the given candidate indices. Falls back to
/// the first candidate when all weights are zero.
fn weighted_pick(weights: &[f64], candidates: Vec<usize>) -> usize {
    let total: f64 = candidates.iter().map(|i| weights[*i]).sum();
    if total <= 0.0 {
        return candidates[0];
    }
    let mut roll = rand::rng().random_range(0.0..total);
    for index in &candidates {
        roll -= weights[*index];
        if roll < 0.0 {
            return *index;
        }
    }
    *candidates.last().expect("candidates are non-empty")
}

// ---------------------------------------------------------------------------
// Key pool
// ---------------------------------------------------------------------------

/// Outcome of a key selection attempt.
pub enum KeySelection {
    Selected(KeyLease),
    /// Nothing eligible; `Some(at)` is the earliest instant a key might
    /// free up, `None` when only in-flight completions can unblock (the
    /// caller polls briefly).
    Deferred(Option<Instant>),
}

/// Holds one in-flight use of a key; dropping releases the concurrency
/// slot. Completion observations feed the EWMA and failure tracking.
pub struct KeyLease {
    value: String,
    state: Arc<KeyState>,
    pool_epoch: Instant,
}

impl KeyLease {
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    #[must_use]
    pub fn state(&self) -> &KeyState {
        &self.state
    }

    pub fn observe_success(&self, elapsed: Duration) {
        self.state.observe_response_time(elapsed);
    }

    pub fn observe_failure(&self, now: Instant) {
        self.state
            .last_failure_ns
            .store(nanos_since(self.pool_epoch, now), Ordering::Relaxed);
    }
}

impl Drop for KeyLease {
    fn drop(&mut self) {
        self.state.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The rotated credential pool of one upstream.
#[derive(Debug)]
pub struct KeyPool {
    epoch: Instant,
    values: Vec<String>,
    weights: Option<Vec<f64>>,
    states: Vec<Arc<KeyState>>,
    strategy: LbStrategy,
    key_concurrency: bool,
    cursor: AtomicUsize,
    select_lock: Mutex<()>,
}

impl KeyPool {
    #[must_use]
    pub fn new(
        values: Vec<String>,
        weights: Option<Vec<f64>>,
        strategy: LbStrategy,
        key_concurrency: bool,
    ) -> Self {
        let states = values.iter().map(|_| Arc::new(KeyState::default())).collect();
        Self {
            epoch: Instant::now(),
            values,
            weights,
            states,
            strategy,
            key_concurrency,
            cursor: AtomicUsize::new(0),
            select_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn values(&self) -> &[String] {
        &self.values
    }

    #[must_use]
    pub fn state_of(&self, key: &str) -> Option<&Arc<KeyState>> {
        self.values
            .iter()
            .position(|v| v == key)
            .map(|i| &self.states[i])
    }

    /// Put a key into failure cooldown (used by key-rotation retries).
    pub fn cooldown(&self, key: &str, until: Instant) {
        if let Some(index) = self.values.iter().position(|v| v == key) {
            self.states[index]
                .cooldown_until_ns
                .store(nanos_since(self.epoch, until), Ordering::Relaxed);
        }
    }

    /// Select an eligible key per the strategy, consuming one key-window
    /// admission for the chosen key. Serialized by the selection lock so
    /// concurrent workers observe a consistent pool.
    pub fn select(&self, limiter: &UpstreamLimiter, now: Instant) -> KeySelection {
        let _guard = self.select_lock.lock();

        let mut eligible: Vec<usize> = Vec::with_capacity(self.values.len());
        let mut earliest: Option<Instant> = None;
        let consider = |candidate: Option<Instant>, earliest: &mut Option<Instant>| {
            if let Some(at) = candidate {
                *earliest = Some(earliest.map_or(at, |cur| cur.min(at)));
            }
        };

        for (index, state) in self.states.iter().enumerate() {
            let cooldown_ns = state.cooldown_until_ns.load(Ordering::Relaxed);
            let cooldown_until = (cooldown_ns != 0
                && nanos_since(self.epoch, now) < cooldown_ns)
                .then(|| self.epoch + Duration::from_nanos(cooldown_ns));

            let window_block = limiter.peek_key(&self.values[index], now).err();
            let concurrency_block = !self.key_concurrency && state.in_flight() > 0;

            if cooldown_until.is_none() && window_block.is_none() && !concurrency_block {
                eligible.push(index);
            } else {
                // Estimate when this key could free up; concurrency has no
                // deadline, so it contributes no estimate.
                let candidate = match (cooldown_until, window_block) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    (Some(a), None) => Some(a),
                    (None, Some(b)) => Some(b),
                    (None, None) => None,
                };
                consider(candidate, &mut earliest);
            }
        }

        if eligible.is_empty() {
            return KeySelection::Deferred(earliest);
        }

        let index = self.choose(&eligible);
        let value = self.values[index].clone();

        // The peek above and this admission run under the selection lock,
        // so the headroom observation still holds.
        if limiter.try_admit_key(&value, now).is_err() {
            return KeySelection::Deferred(earliest);
        }

        let state = Arc::clone(&self.states[index]);
        state.in_flight.fetch_add(1, Ordering::AcqRel);
        state
            .last_used_ns
            .store(nanos_since(self.epoch, now), Ordering::Relaxed);
        state.requests.fetch_add(1, Ordering::Relaxed);

        KeySelection::Selected(KeyLease {
            value,
            state,
            pool_epoch: self.epoch,
        })
    }

    fn choose(&self, eligible: &[usize]) -> usize {
        match self.strategy {
            LbStrategy::RoundRobin => self.round_robin(eligible),
            LbStrategy::Random => eligible[rand::rng().random_range(0..eligible.len())],
            LbStrategy::LeastRequests => self.least_requests(eligible),
            LbStrategy::FastestResponse => {
                // Entries with no sample yet are warmed first.
                let unknown: Vec<usize> = eligible
                    .iter()
                    .copied()
                    .filter(|i| self.states[*i].response_time().is_none())
                    .collect();
                if unknown.is_empty() {
                    eligible
                        .iter()
                        .copied()
                        .min_by_key(|i| self.states[*i].response_time().unwrap_or_default())
                        .expect("eligible is non-empty")
                } else {
                    self.least_requests(&unknown)
                }
            }
            LbStrategy::Weighted => match &self.weights {
                Some(weights) => weighted_pick(weights, eligible.to_vec()),
                None => self.round_robin(eligible),
            },
        }
    }

    /// Next index after the last served, skipping non-eligible entries.
    fn round_robin(&self, eligible: &[usize]) -> usize {
        let start = self.cursor.load(Ordering::Acquire);
        let chosen = (0..self.values.len())
            .map(|offset| (start + offset) % self.values.len())
            .find(|index| eligible.contains(index))
            .expect("eligible is non-empty");
        self.cursor.store(chosen + 1, Ordering::Release);
        chosen
    }

    fn least_requests(&self, eligible: &[usize]) -> usize {
        eligible
            .iter()
            .copied()
            .min_by_key(|i| {
                let state = &self.states[*i];
                (state.in_flight(), state.last_used_ns.load(Ordering::Relaxed))
            })
            .expect("eligible is non-empty")
    }
}

fn nanos_since(epoch: Instant, t: Instant) -> u64 {
    t.saturating_duration_since(epoch).as_nanos() as u64
}

// ---------------------------------------------------------------------------
// Per-upstream pool set
// ---------------------------------------------------------------------------

/// The key pool plus the plain pools of one upstream, and the binding step
/// that resolves every header-referenced variable for a request.
#[derive(Debug)]
pub struct UpstreamPools {
    strategy: LbStrategy,
    key_variable: String,
    pub key: KeyPool,
    others: HashMap<String, VariablePool>,
}

impl UpstreamPools {
    #[must_use]
    pub fn new(upstream: &Upstream) -> Self {
        let key_values = upstream.key_values().to_vec();
        let key_weights = upstream.variable_weights.get(&upstream.key_variable).cloned();
        let key = KeyPool::new(
            key_values,
            key_weights,
            upstream.strategy,
            upstream.key_concurrency,
        );

        let mut others = HashMap::new();
        for (name, values) in &upstream.variables {
            if name != &upstream.key_variable {
                others.insert(
                    name.clone(),
                    VariablePool::new(
                        values.clone(),
                        upstream.variable_weights.get(name).cloned(),
                    ),
                );
            }
        }

        Self {
            strategy: upstream.strategy,
            key_variable: upstream.key_variable.clone(),
            key,
            others,
        }
    }

    /// Bind every referenced non-key variable plus the leased key value.
    #[must_use]
    pub fn bind(&self, referenced: &[&str], key_value: &str) -> HashMap<String, String> {
        let mut bindings = HashMap::with_capacity(referenced.len());
        bindings.insert(self.key_variable.clone(), key_value.to_string());
        for name in referenced {
            if *name == self.key_variable {
                continue;
            }
            if let Some(pool) = self.others.get(*name) {
                bindings.insert((*name).to_string(), pool.pick(self.strategy).to_string());
            }
        }
        bindings
    }
}
