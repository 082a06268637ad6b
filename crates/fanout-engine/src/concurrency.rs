//! Adaptive admission control
//!
//! Gates task launches on a per-work-type limit and a global limit. Limits
//! move with observed results: a work type that keeps failing gets its limit
//! halved, one that keeps succeeding earns slots back one at a time.
//! `acquire` never fails; it waits until a slot frees.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Retained latency samples per work type
const LATENCY_HISTORY: usize = 50;

/// Adaptive concurrency configuration
///
/// # Example
///
/// ```
/// use fanout_engine::concurrency::AdaptiveConcurrencyConfig;
///
/// let config = AdaptiveConcurrencyConfig::default()
///     .with_global_max(20)
///     .with_default_limit(2);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdaptiveConcurrencyConfig {
    /// Global maximum in-flight tasks across all work types
    pub global_max: usize,

    /// Starting limit for a work type that has no recorded results yet
    pub default_limit: usize,

    /// Floor for adaptive scale-down
    pub per_type_min: usize,

    /// Ceiling for adaptive scale-up
    pub per_type_max: usize,

    /// Success rate at or above which a limit grows by 1
    /// (only when the window holds no failures)
    pub scale_up_threshold: f64,

    /// Failure rate at or above which a limit is halved
    pub scale_down_threshold: f64,

    /// Results required in the window before any adjustment
    pub min_samples: usize,
}

impl Default for AdaptiveConcurrencyConfig {
    fn default() -> Self {
        Self {
            global_max: 30,
            default_limit: 3,
            per_type_min: 1,
            per_type_max: 10,
            scale_up_threshold: 0.9,
            scale_down_threshold: 0.5,
            min_samples: 3,
        }
    }
}

impl AdaptiveConcurrencyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_global_max(mut self, max: usize) -> Self {
        self.global_max = max.max(1);
        self
    }

    pub fn with_default_limit(mut self, limit: usize) -> Self {
        self.default_limit = limit.max(1);
        self
    }

    pub fn with_per_type_min(mut self, min: usize) -> Self {
        self.per_type_min = min.max(1);
        self
    }

    pub fn with_per_type_max(mut self, max: usize) -> Self {
        self.per_type_max = max.max(1);
        self
    }

    pub fn with_scale_up_threshold(mut self, threshold: f64) -> Self {
        self.scale_up_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    pub fn with_scale_down_threshold(mut self, threshold: f64) -> Self {
        self.scale_down_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    pub fn with_min_samples(mut self, samples: usize) -> Self {
        self.min_samples = samples.max(1);
        self
    }

    /// Starting limit clamped into the adaptive band.
    fn initial_limit(&self) -> usize {
        self.default_limit
            .clamp(self.per_type_min, self.per_type_max)
    }
}

/// Rolling per-type result window
#[derive(Debug, Default)]
struct ResultWindow {
    success: u32,
    failure: u32,
    latencies: Vec<Duration>,
}

impl ResultWindow {
    fn record(&mut self, success: bool, latency: Duration) {
        if success {
            self.success += 1;
        } else {
            self.failure += 1;
        }
        if self.latencies.len() >= LATENCY_HISTORY {
            self.latencies.remove(0);
        }
        self.latencies.push(latency);
    }

    fn total(&self) -> u32 {
        self.success + self.failure
    }

    fn reset(&mut self) {
        self.success = 0;
        self.failure = 0;
    }
}

#[derive(Debug)]
struct TypeState {
    in_flight: usize,
    limit: usize,
    window: ResultWindow,
}

struct Waiter {
    work_type: String,
    tx: oneshot::Sender<()>,
}

struct Inner {
    types: HashMap<String, TypeState>,
    global_in_flight: usize,
    waiters: VecDeque<Waiter>,
}

/// Per-type counters for observability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkTypeStats {
    pub in_flight: usize,
    pub limit: usize,
    pub avg_latency_ms: u64,
}

/// Controller snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyStats {
    pub global_in_flight: usize,
    pub global_max: usize,
    pub queued_acquires: usize,
    pub by_type: HashMap<String, WorkTypeStats>,
}

/// Admission gate with per-work-type and global limits
///
/// Slots are handed to waiters directly on release, so the counters can
/// never overshoot a limit between a wakeup and a re-check.
pub struct AdaptiveConcurrencyController {
    config: AdaptiveConcurrencyConfig,
    inner: Mutex<Inner>,
}

impl AdaptiveConcurrencyController {
    pub fn new(config: AdaptiveConcurrencyConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                types: HashMap::new(),
                global_in_flight: 0,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Acquire a slot for `work_type`, waiting as long as it takes.
    ///
    /// Returns once both the global counter and the per-type counter are
    /// below their limits; both are incremented before this returns.
    pub async fn acquire(&self, work_type: &str) {
        loop {
            let rx = {
                let mut inner = self.inner.lock();
                if self.admissible(&mut inner, work_type) {
                    self.charge(&mut inner, work_type);
                    return;
                }
                let (tx, rx) = oneshot::channel();
                inner.waiters.push_back(Waiter {
                    work_type: work_type.to_string(),
                    tx,
                });
                debug!(work_type, queued = inner.waiters.len(), "acquire queued");
                rx
            };

            // A successful recv means the releaser already charged the
            // counters on our behalf.
            if rx.await.is_ok() {
                return;
            }
        }
    }

    /// Try to acquire without waiting. Returns false when at a limit.
    pub fn try_acquire(&self, work_type: &str) -> bool {
        let mut inner = self.inner.lock();
        if self.admissible(&mut inner, work_type) {
            self.charge(&mut inner, work_type);
            true
        } else {
            false
        }
    }

    /// Release a slot for `work_type`.
    ///
    /// Safe to call spuriously: a release with nothing in flight logs a
    /// warning and leaves the counters untouched.
    pub fn release(&self, work_type: &str) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let held = match inner.types.get_mut(work_type) {
            Some(state) if state.in_flight > 0 => {
                state.in_flight -= 1;
                true
            }
            _ => false,
        };
        if !held {
            warn!(work_type, "release with no slot held, ignoring");
            return;
        }
        inner.global_in_flight = inner.global_in_flight.saturating_sub(1);

        self.hand_off(inner);
    }

    /// Feed one task outcome into the adaptive policy.
    ///
    /// Once `min_samples` results have accumulated for the type: a failure
    /// rate at or above the scale-down threshold halves the limit (floor
    /// `per_type_min`); an all-success window at or above the scale-up
    /// threshold raises it by 1 (ceiling `per_type_max`). Other work types
    /// are never touched.
    pub fn report_result(&self, work_type: &str, success: bool, latency: Duration) {
        let mut inner = self.inner.lock();
        let initial = self.config.initial_limit();
        let state = inner
            .types
            .entry(work_type.to_string())
            .or_insert_with(|| TypeState {
                in_flight: 0,
                limit: initial,
                window: ResultWindow::default(),
            });

        state.window.record(success, latency);
        if state.window.total() < self.config.min_samples as u32 {
            return;
        }

        let total = state.window.total() as f64;
        let failure_rate = state.window.failure as f64 / total;
        let success_rate = state.window.success as f64 / total;
        let old_limit = state.limit;

        if failure_rate >= self.config.scale_down_threshold {
            state.limit = (state.limit / 2).max(self.config.per_type_min);
        } else if success_rate >= self.config.scale_up_threshold && state.window.failure == 0 {
            state.limit = (state.limit + 1).min(self.config.per_type_max);
        }

        state.window.reset();
        let new_limit = state.limit;

        if new_limit != old_limit {
            debug!(work_type, old_limit, new_limit, "adaptive limit adjusted");
        }
        if new_limit > old_limit {
            // A raised limit may admit queued acquires.
            self.hand_off(&mut inner);
        }
    }

    /// Current limit for a work type.
    pub fn limit(&self, work_type: &str) -> usize {
        self.inner
            .lock()
            .types
            .get(work_type)
            .map(|s| s.limit)
            .unwrap_or_else(|| self.config.initial_limit())
    }

    /// Current in-flight count for a work type.
    pub fn in_flight(&self, work_type: &str) -> usize {
        self.inner
            .lock()
            .types
            .get(work_type)
            .map(|s| s.in_flight)
            .unwrap_or(0)
    }

    pub fn global_in_flight(&self) -> usize {
        self.inner.lock().global_in_flight
    }

    /// Number of acquires currently waiting for a slot.
    pub fn queue_depth(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    pub fn stats(&self) -> ConcurrencyStats {
        let inner = self.inner.lock();
        ConcurrencyStats {
            global_in_flight: inner.global_in_flight,
            global_max: self.config.global_max,
            queued_acquires: inner.waiters.len(),
            by_type: inner
                .types
                .iter()
                .map(|(k, s)| {
                    let avg = if s.window.latencies.is_empty() {
                        Duration::ZERO
                    } else {
                        s.window.latencies.iter().sum::<Duration>()
                            / s.window.latencies.len() as u32
                    };
                    (
                        k.clone(),
                        WorkTypeStats {
                            in_flight: s.in_flight,
                            limit: s.limit,
                            avg_latency_ms: avg.as_millis() as u64,
                        },
                    )
                })
                .collect(),
        }
    }

    fn admissible(&self, inner: &mut Inner, work_type: &str) -> bool {
        if inner.global_in_flight >= self.config.global_max {
            return false;
        }
        let initial = self.config.initial_limit();
        let state = inner
            .types
            .entry(work_type.to_string())
            .or_insert_with(|| TypeState {
                in_flight: 0,
                limit: initial,
                window: ResultWindow::default(),
            });
        state.in_flight < state.limit
    }

    fn charge(&self, inner: &mut Inner, work_type: &str) {
        inner.global_in_flight += 1;
        if let Some(state) = inner.types.get_mut(work_type) {
            state.in_flight += 1;
        }
    }

    /// Grant freed capacity to the first admissible waiter, if any.
    ///
    /// Counters are charged before the waiter is woken; a waiter that went
    /// away (dropped receiver) gets its charge rolled back and the next one
    /// is tried.
    fn hand_off(&self, inner: &mut Inner) {
        loop {
            if inner.global_in_flight >= self.config.global_max {
                return;
            }
            let idx = {
                let types = &inner.types;
                inner.waiters.iter().position(|w| {
                    types
                        .get(&w.work_type)
                        .map(|s| s.in_flight < s.limit)
                        .unwrap_or(true)
                })
            };
            let Some(idx) = idx else { return };
            let Some(waiter) = inner.waiters.remove(idx) else {
                return;
            };

            self.ensure_type(inner, &waiter.work_type);
            self.charge(inner, &waiter.work_type);

            if waiter.tx.send(()).is_ok() {
                return;
            }

            // Waiter abandoned the acquire; roll back and keep looking.
            if let Some(state) = inner.types.get_mut(&waiter.work_type) {
                state.in_flight -= 1;
            }
            inner.global_in_flight -= 1;
        }
    }

    fn ensure_type(&self, inner: &mut Inner, work_type: &str) {
        let initial = self.config.initial_limit();
        inner
            .types
            .entry(work_type.to_string())
            .or_insert_with(|| TypeState {
                in_flight: 0,
                limit: initial,
                window: ResultWindow::default(),
            });
    }
}
