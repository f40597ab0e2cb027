//! BBR-style adaptive concurrency limiting.
//!
//! [`BbrLimiter`] borrows its idea from TCP BBR congestion control: the concurrency a
//! service can sustain is roughly its best recent throughput multiplied by its best
//! recent latency (Little's Law). While CPU usage is above a threshold, requests that
//! would push in-flight concurrency past that estimate are shed.
//!
//! Once shedding starts, a drop episode is recorded. For one second afterwards the
//! ceiling keeps being enforced even if CPU dips below the threshold, so a single
//! quiet sample does not flip the limiter straight back to accepting everything.

use std::fmt::Debug;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use parking_lot::Mutex;
use quanta::Clock;
use quanta::Instant;
use tracing::debug;

use crate::Done;
use crate::Limiter;
use crate::Rejected;
use crate::cpu::CpuUsage;
use crate::window::DEFAULT_BUCKET_COUNT;
use crate::window::DEFAULT_WINDOW;
use crate::window::RollingWindow;
use crate::window::fold;

/// How long a drop episode keeps the ceiling enforced after CPU recovers.
const COOLDOWN: Duration = Duration::from_secs(1);

/// Configuration for [`BbrLimiter`].
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct BbrOptions {
    /// Total statistics horizon.
    pub window: Duration,
    /// Number of buckets the window is divided into.
    pub bucket_count: NonZeroUsize,
    /// CPU usage (per-mille) at or above which shedding is considered.
    pub cpu_threshold: i64,
}

impl Default for BbrOptions {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            bucket_count: DEFAULT_BUCKET_COUNT,
            cpu_threshold: 800,
        }
    }
}

impl BbrOptions {
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_bucket_count(mut self, bucket_count: NonZeroUsize) -> Self {
        self.bucket_count = bucket_count;
        self
    }

    pub fn with_cpu_threshold(mut self, cpu_threshold: i64) -> Self {
        self.cpu_threshold = cpu_threshold;
        self
    }
}

/// A read-only snapshot of the limiter's view of the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Stat {
    /// Smoothed CPU usage, per-mille.
    pub cpu: i64,
    pub in_flight: i64,
    /// Current concurrency ceiling.
    pub max_in_flight: i64,
    /// Lowest per-bucket average latency, in milliseconds.
    pub min_rt: i64,
    /// Highest per-bucket completion count.
    pub max_pass: i64,
}

#[derive(Debug, Clone, Copy)]
struct CounterCache {
    value: i64,
    observed_at: u64,
}

/// A window reduction memoized for one bucket duration.
#[derive(Debug, Default)]
struct Cached {
    slot: Mutex<Option<CounterCache>>,
}

impl Cached {
    fn get_or_refresh(&self, now: u64, ttl: u64, refresh: impl FnOnce() -> i64) -> i64 {
        let mut slot = self.slot.lock();
        if let Some(cache) = *slot
            && now.saturating_sub(cache.observed_at) < ttl
        {
            return cache.value;
        }
        let value = refresh();
        *slot = Some(CounterCache {
            value,
            observed_at: now,
        });
        value
    }
}

struct Inner {
    cpu: Box<dyn CpuUsage>,
    pass_stat: RollingWindow,
    rt_stat: RollingWindow,
    in_flight: AtomicI64,
    cpu_threshold: i64,
    /// Nanos since anchor at which the current drop episode began, 0 when none
    prev_drop: AtomicU64,
    max_pass_cache: Cached,
    min_rt_cache: Cached,
    bucket_ns: u64,
    buckets_per_second: f64,
    clock: Clock,
    anchor: Instant,
}

impl Inner {
    fn now_ns(&self) -> u64 {
        self.clock.now().duration_since(self.anchor).as_nanos() as u64
    }

    fn max_pass(&self) -> i64 {
        self.max_pass_cache
            .get_or_refresh(self.now_ns(), self.bucket_ns, || {
                (self.pass_stat.reduce(fold::max_bucket_sum) as i64).max(1)
            })
    }

    fn min_rt(&self) -> i64 {
        self.min_rt_cache
            .get_or_refresh(self.now_ns(), self.bucket_ns, || {
                self.rt_stat
                    .reduce(fold::min_bucket_avg)
                    .map_or(1, |avg| avg.ceil() as i64)
                    .max(1)
            })
    }

    fn max_in_flight(&self) -> i64 {
        let estimate =
            self.max_pass() as f64 * self.min_rt() as f64 * self.buckets_per_second / 1000.0;
        (estimate + 0.5).floor() as i64
    }

    fn over_limit(&self) -> bool {
        let in_flight = self.in_flight.load(Ordering::Acquire);
        in_flight > 1 && in_flight > self.max_in_flight()
    }

    fn should_drop(&self) -> bool {
        let now = self.now_ns();

        if self.cpu.usage() < self.cpu_threshold {
            let prev = self.prev_drop.load(Ordering::Acquire);
            if prev == 0 {
                return false;
            }
            if now.saturating_sub(prev) < COOLDOWN.as_nanos() as u64 {
                return self.over_limit();
            }
            if self
                .prev_drop
                .compare_exchange(prev, 0, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                debug!("cpu recovered; drop episode ended");
            }
            return false;
        }

        let drop = self.over_limit();
        if drop
            && self
                .prev_drop
                .compare_exchange(0, now.max(1), Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            debug!(
                in_flight = self.in_flight.load(Ordering::Relaxed),
                max_in_flight = self.max_in_flight(),
                "cpu over threshold; drop episode started"
            );
        }
        drop
    }
}

/// An adaptive limiter that sheds load based on CPU, throughput and latency.
///
/// Cloning is cheap; all clones share the same statistics.
#[derive(Clone)]
pub struct BbrLimiter {
    inner: Arc<Inner>,
}

impl Debug for BbrLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BbrLimiter")
            .field("cpu_threshold", &self.inner.cpu_threshold)
            .field("in_flight", &self.inner.in_flight.load(Ordering::Relaxed))
            .field("window", &self.inner.pass_stat.window())
            .field("bucket_count", &self.inner.pass_stat.size())
            .finish()
    }
}

impl BbrLimiter {
    /// Creates a new `BbrLimiter` reading CPU usage from `cpu`.
    ///
    /// `cpu` is typically a shared [`CpuSampler`](crate::CpuSampler), but any
    /// `Fn() -> i64` works.
    pub fn new<C>(cpu: C, options: BbrOptions) -> Self
    where
        C: CpuUsage + 'static,
    {
        Self::with_clock(cpu, options, Clock::new())
    }

    pub fn with_clock<C>(cpu: C, options: BbrOptions, clock: Clock) -> Self
    where
        C: CpuUsage + 'static,
    {
        let bucket_duration = options.window / options.bucket_count.get() as u32;
        let pass_stat =
            RollingWindow::with_clock(options.bucket_count, bucket_duration, clock.clone());
        let rt_stat =
            RollingWindow::with_clock(options.bucket_count, bucket_duration, clock.clone());
        let bucket_ns = pass_stat.bucket_duration().as_nanos() as u64;
        let anchor = clock.now();

        Self {
            inner: Arc::new(Inner {
                cpu: Box::new(cpu),
                pass_stat,
                rt_stat,
                in_flight: AtomicI64::new(0),
                cpu_threshold: options.cpu_threshold,
                prev_drop: AtomicU64::new(0),
                max_pass_cache: Cached::default(),
                min_rt_cache: Cached::default(),
                bucket_ns,
                buckets_per_second: Duration::from_secs(1).as_nanos() as f64 / bucket_ns as f64,
                clock,
                anchor,
            }),
        }
    }

    /// Snapshot of the current statistics. May refresh the cached reductions.
    pub fn stat(&self) -> Stat {
        Stat {
            cpu: self.inner.cpu.usage(),
            in_flight: self.inner.in_flight.load(Ordering::Acquire),
            max_in_flight: self.inner.max_in_flight(),
            min_rt: self.inner.min_rt(),
            max_pass: self.inner.max_pass(),
        }
    }
}

impl Limiter for BbrLimiter {
    fn allow(&self) -> Result<Done, Rejected> {
        if self.inner.should_drop() {
            return Err(Rejected::LimitExceeded);
        }

        self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
        let start = self.inner.clock.now();
        let inner = Arc::clone(&self.inner);

        Ok(Done::new(move |_info| {
            let rt = inner.clock.now().duration_since(start);
            inner
                .rt_stat
                .accumulate((rt.as_nanos() as f64 / 1_000_000.0).ceil());
            inner.in_flight.fetch_sub(1, Ordering::AcqRel);
            inner.pass_stat.accumulate(1.0);
        }))
    }
}
