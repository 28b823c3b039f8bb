//! Throughput-driven controller for the hash token pool.
//!
//! Every check interval the tuner computes aggregate hashing throughput from
//! the bytes reported by progress callbacks, then grows or shrinks the pool
//! looking for the size that maximizes bytes/second. Once throughput drops
//! past the observed optimum, it freezes there for the rest of the run.
//!
//! Workers never block on the tuner; the only shared state is the token pool
//! and one atomic byte counter. Internal state is guarded by a single lock,
//! held only while reading or updating counters.

use crate::pool::{CancelFlag, TokenPool};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(5);
const MAX_HISTORY: usize = 64;

// Decision thresholds, in percent
const EXPLORE_GAIN_PCT: f64 = 1.0;
const REGRESSION_PCT: f64 = -1.0;
const HYSTERESIS_PCT: f64 = 2.0;

/// Tuner bounds and cadence.
#[derive(Debug, Clone)]
pub struct TunerConfig {
    pub check_interval: Duration,
    pub min_tokens: usize,
    pub max_tokens: usize,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            min_tokens: 1,
            max_tokens: 16,
        }
    }
}

/// One throughput observation.
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub pool_size: usize,
    pub bytes_per_sec: f64,
    pub at: Instant,
}

struct TunerState {
    best: usize,
    best_throughput: f64,
    prev_throughput: Option<f64>,
    last_grew: bool,
    frozen: bool,
    history: Vec<Sample>,
}

/// Cooperative controller that owns the pool size.
pub struct Tuner {
    pool: Arc<TokenPool>,
    config: TunerConfig,
    bytes: AtomicU64,
    state: Mutex<TunerState>,
}

impl Tuner {
    pub fn new(pool: Arc<TokenPool>, mut config: TunerConfig) -> Arc<Self> {
        if config.check_interval < MIN_CHECK_INTERVAL {
            config.check_interval = MIN_CHECK_INTERVAL;
        }
        config.max_tokens = config.max_tokens.max(config.min_tokens).max(1);
        let best = pool.size();
        Arc::new(Self {
            pool,
            config,
            bytes: AtomicU64::new(0),
            state: Mutex::new(TunerState {
                best,
                best_throughput: 0.0,
                prev_throughput: None,
                last_grew: false,
                frozen: false,
                history: Vec::new(),
            }),
        })
    }

    /// Account bytes hashed since the last tick. Called from hash progress
    /// callbacks on worker threads.
    pub fn add_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn is_frozen(&self) -> bool {
        self.state.lock().unwrap().frozen
    }

    /// Pool size that produced the highest observed throughput so far.
    pub fn best_size(&self) -> usize {
        self.state.lock().unwrap().best
    }

    pub fn history(&self) -> Vec<Sample> {
        self.state.lock().unwrap().history.clone()
    }

    /// Run the control loop until cancelled. Sleeps in short slices so
    /// cancellation is observed promptly.
    pub fn run(&self, stop: &CancelFlag) {
        let slice = Duration::from_millis(100);
        let mut last = Instant::now();
        loop {
            let mut slept = Duration::ZERO;
            while slept < self.config.check_interval {
                if stop.is_cancelled() {
                    return;
                }
                std::thread::sleep(slice);
                slept += slice;
            }
            let now = Instant::now();
            self.tick(now - last);
            last = now;
        }
    }

    /// One control step over the bytes accumulated during `elapsed`.
    pub fn tick(&self, elapsed: Duration) {
        let bytes = self.bytes.swap(0, Ordering::Relaxed);
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return;
        }
        let throughput = bytes as f64 / secs;
        let size = self.pool.size();

        let mut st = self.state.lock().unwrap();
        if st.history.len() == MAX_HISTORY {
            st.history.remove(0);
        }
        st.history.push(Sample {
            pool_size: size,
            bytes_per_sec: throughput,
            at: Instant::now(),
        });

        // Hysteresis compares against the record *before* this sample, so a
        // new record can still trigger growth.
        let prior_best = st.best_throughput;
        if throughput > st.best_throughput {
            st.best = size;
            st.best_throughput = throughput;
        }

        if st.frozen {
            return;
        }

        let prev = match st.prev_throughput.replace(throughput) {
            Some(prev) => prev,
            None => {
                self.grow(&mut st, size);
                return;
            }
        };

        let delta_pct = if prev > 0.0 {
            (throughput - prev) / prev * 100.0
        } else if throughput > 0.0 {
            100.0
        } else {
            0.0
        };

        if st.last_grew && delta_pct > EXPLORE_GAIN_PCT {
            // Last increase paid off; keep exploring upward.
            self.grow(&mut st, size);
        } else if delta_pct < REGRESSION_PCT && size > st.best {
            self.freeze_at_best(&mut st, size);
        } else if prior_best > 0.0 && throughput > prior_best * (1.0 + HYSTERESIS_PCT / 100.0) {
            self.grow(&mut st, size);
        } else {
            st.last_grew = false;
        }
    }

    fn grow(&self, st: &mut TunerState, size: usize) {
        if size >= self.config.max_tokens {
            debug!(size, "tuner reached upper bound, freezing");
            st.frozen = true;
            st.last_grew = false;
            return;
        }
        self.pool.grow();
        st.last_grew = true;
        debug!(size = size + 1, "tuner grew hash pool");
    }

    fn freeze_at_best(&self, st: &mut TunerState, size: usize) {
        let target = st.best.max(self.config.min_tokens);
        let mut current = size;
        while current > target {
            // A held token can't be drained; skip rather than block.
            if !self.pool.try_shrink() {
                break;
            }
            current -= 1;
        }
        st.frozen = true;
        st.last_grew = false;
        debug!(size = current, best = st.best, "tuner froze at optimum");
    }
}
