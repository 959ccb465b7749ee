//! Inter-batch rate limiting for the probing loop.
//!
//! The driver calls [`RateLimiter::wait`] once per batch of sends; the
//! limiter tops the inter-batch gap up to `batch_size / rate` so the
//! long-run rate approaches the target. If the host cannot sustain the
//! target the limiter never throttles and the achieved-rate statistic
//! simply comes out below target.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::Error;

/// How the limiter burns the remaining batch period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateLimitingMethod {
    /// `thread::sleep` for the remainder; accuracy bounded by the OS sleep
    /// granularity.
    #[default]
    Sleep,
    /// Spin until the deadline; accurate but burns a core.
    Busy,
}

impl FromStr for RateLimitingMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s.to_ascii_lowercase().as_str() {
            "sleep" => Ok(RateLimitingMethod::Sleep),
            "busy" => Ok(RateLimitingMethod::Busy),
            other => Err(Error::InvalidArgument(format!(
                "unknown rate limiting method: {other} (expected sleep or busy)"
            ))),
        }
    }
}

impl fmt::Display for RateLimitingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitingMethod::Sleep => write!(f, "sleep"),
            RateLimitingMethod::Busy => write!(f, "busy"),
        }
    }
}

/// Counters shared with the statistics logger thread.
pub struct RateLimiterShared {
    target_rate: u64,
    batch_size: u64,
    started: Instant,
    wait_calls: AtomicU64,
}

impl RateLimiterShared {
    pub fn statistics(&self) -> RateLimiterStatistics {
        let wait_calls = self.wait_calls.load(Ordering::Relaxed);
        let elapsed = self.started.elapsed().as_secs_f64();
        let achieved_rate = if elapsed > 0.0 {
            (wait_calls * self.batch_size) as f64 / elapsed
        } else {
            0.0
        };
        RateLimiterStatistics {
            target_rate: self.target_rate,
            achieved_rate,
            wait_calls,
        }
    }
}

/// Snapshot of the limiter's pacing over the run window.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterStatistics {
    pub target_rate: u64,
    /// Average rate over the run, counting one batch per wait call.
    pub achieved_rate: f64,
    pub wait_calls: u64,
}

impl fmt::Display for RateLimiterStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "target_rate={}pps achieved_rate={:.0}pps wait_calls={}",
            self.target_rate, self.achieved_rate, self.wait_calls
        )
    }
}

/// Paces batches of sends toward a target packets-per-second rate.
pub struct RateLimiter {
    method: RateLimitingMethod,
    /// Per-batch period; zero disables throttling.
    period: Duration,
    deadline_base: Instant,
    shared: Arc<RateLimiterShared>,
}

impl RateLimiter {
    /// A `rate` of 0 disables throttling entirely.
    pub fn new(rate: u64, batch_size: u64, method: RateLimitingMethod) -> Self {
        let period = if rate > 0 {
            Duration::from_secs_f64(batch_size as f64 / rate as f64)
        } else {
            Duration::ZERO
        };

        let precision = sleep_precision();
        if method == RateLimitingMethod::Sleep && !period.is_zero() && period < precision {
            warn!(
                "batch period {:?} is below the sleep granularity {:?}; \
                 the achieved rate will fall short (consider the busy method)",
                period, precision
            );
        }

        let now = Instant::now();
        Self {
            method,
            period,
            deadline_base: now,
            shared: Arc::new(RateLimiterShared {
                target_rate: rate,
                batch_size,
                started: now,
                wait_calls: AtomicU64::new(0),
            }),
        }
    }

    /// Block until the current batch's period has elapsed.
    ///
    /// Called by the driver after every batch of sends. Keeps an absolute
    /// schedule: oversleep on one batch is recovered on the next, and when
    /// the sender cannot keep up no debt accumulates.
    pub fn wait(&mut self) {
        self.shared.wait_calls.fetch_add(1, Ordering::Relaxed);
        if self.period.is_zero() {
            return;
        }

        let deadline = self.deadline_base + self.period;
        let now = Instant::now();
        if now < deadline {
            match self.method {
                RateLimitingMethod::Sleep => thread::sleep(deadline - now),
                RateLimitingMethod::Busy => {
                    while Instant::now() < deadline {
                        std::hint::spin_loop();
                    }
                }
            }
        }
        // When the sender fell behind by more than a full period, restart
        // the schedule from now instead of accumulating debt.
        let now = Instant::now();
        self.deadline_base = if now.duration_since(deadline) > self.period {
            now
        } else {
            deadline
        };
    }

    pub fn statistics(&self) -> RateLimiterStatistics {
        self.shared.statistics()
    }

    /// Handle for the logger thread to snapshot statistics concurrently.
    pub fn shared(&self) -> Arc<RateLimiterShared> {
        Arc::clone(&self.shared)
    }
}

/// Smallest observable sleep, measured once at construction.
fn sleep_precision() -> Duration {
    let mut best = Duration::from_secs(1);
    for _ in 0..3 {
        let start = Instant::now();
        thread::sleep(Duration::from_nanos(1));
        best = best.min(start.elapsed());
    }
    best
}
