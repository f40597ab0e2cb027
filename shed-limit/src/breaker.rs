//! Client-side adaptive throttling.
//!
//! [`SreBreaker`] implements the adaptive throttling described in the Google SRE book:
//! a client tracks how many requests it sent (`total`) and how many the dependency
//! accepted (`accepts`), and starts rejecting locally with probability
//!
//! ```text
//! max(0, (total - k * accepts) / (total + 1))
//! ```
//!
//! where `k = 1 / success_ratio`.
//!
//! There is no closed/open/half-open state machine and no recovery timer. The breaker
//! is "open" only in the sense that the drop probability is above zero, and it closes
//! again as soon as successes bring `k * accepts` back above `total`, or as failures
//! age out of the window.

use std::num::NonZeroUsize;
use std::time::Duration;

use parking_lot::Mutex;
use quanta::Clock;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::CircuitBreaker;
use crate::Rejected;
use crate::window::DEFAULT_BUCKET_COUNT;
use crate::window::DEFAULT_WINDOW;
use crate::window::RollingWindow;

/// Configuration for [`SreBreaker`].
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SreOptions {
    /// Fraction of requests expected to succeed when the dependency is healthy.
    pub success_ratio: f64,
    /// Below this many requests in the window the breaker never rejects.
    pub request_floor: u64,
    /// Total statistics horizon.
    pub window: Duration,
    /// Number of buckets the window is divided into.
    pub bucket_count: NonZeroUsize,
}

impl Default for SreOptions {
    fn default() -> Self {
        Self {
            success_ratio: 0.6,
            request_floor: 100,
            window: DEFAULT_WINDOW,
            bucket_count: DEFAULT_BUCKET_COUNT,
        }
    }
}

impl SreOptions {
    pub fn with_success_ratio(mut self, success_ratio: f64) -> Self {
        self.success_ratio = success_ratio;
        self
    }

    pub fn with_request_floor(mut self, request_floor: u64) -> Self {
        self.request_floor = request_floor;
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_bucket_count(mut self, bucket_count: NonZeroUsize) -> Self {
        self.bucket_count = bucket_count;
        self
    }
}

/// A probabilistic circuit breaker driven by the observed accept ratio.
#[derive(Debug)]
pub struct SreBreaker {
    stat: RollingWindow,
    k: f64,
    request_floor: u64,
    rng: Mutex<StdRng>,
}

impl SreBreaker {
    pub fn new(options: SreOptions) -> Self {
        Self::with_clock(options, Clock::new())
    }

    pub fn with_clock(options: SreOptions, clock: Clock) -> Self {
        let bucket_duration = options.window / options.bucket_count.get() as u32;
        Self {
            stat: RollingWindow::with_clock(options.bucket_count, bucket_duration, clock),
            k: 1.0 / options.success_ratio.max(f64::EPSILON),
            request_floor: options.request_floor,
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Replace the random source with a seeded one, for reproducible decisions.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// `(accepts, total)` over the window, including the bucket being written.
    pub fn summary(&self) -> (u64, u64) {
        let (accepts, total) = self.stat.reduce_with_current(|buckets| {
            buckets.fold((0.0, 0), |(accepts, total), bucket| {
                (accepts + bucket.sum(), total + bucket.count())
            })
        });
        (accepts as u64, total)
    }

    /// Probability that the next call is rejected.
    pub fn drop_ratio(&self) -> f64 {
        let (accepts, total) = self.summary();
        self.ratio(accepts, total)
    }

    fn ratio(&self, accepts: u64, total: u64) -> f64 {
        let requests = self.k * accepts as f64;
        if total < self.request_floor || (total as f64) < requests {
            return 0.0;
        }
        ((total as f64 - requests) / (total + 1) as f64).max(0.0)
    }

    fn true_on_proba(&self, proba: f64) -> bool {
        self.rng.lock().random::<f64>() < proba
    }
}

impl CircuitBreaker for SreBreaker {
    fn allow(&self) -> Result<(), Rejected> {
        let (accepts, total) = self.summary();
        let dr = self.ratio(accepts, total);
        if dr > 0.0 && self.true_on_proba(dr) {
            Err(Rejected::NotAllowed)
        } else {
            Ok(())
        }
    }

    fn mark_success(&self) {
        self.stat.accumulate(1.0);
    }

    // Counts toward total only, so repeated failures (and local rejections marked as
    // failures) push the drop ratio up.
    fn mark_failed(&self) {
        self.stat.accumulate(0.0);
    }
}
