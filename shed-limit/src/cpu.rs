//! Smoothed CPU usage.
//!
//! [`CpuSampler`] owns a daemon thread which reads a [`CpuSource`] on a fixed tick and
//! folds each reading into an exponentially weighted moving average. Readers only ever
//! perform an atomic load.
//!
//! Usage is expressed per-mille: `0..=1000`.

use std::any::Any;
use std::fmt::Debug;
use std::panic;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use sysinfo::System;
use tracing::error;
use tracing::info;
use tracing::warn;

/// Upper bound of a per-mille usage reading.
pub const MAX_USAGE: u64 = 1000;

#[derive(Debug, thiserror::Error)]
pub enum CpuError {
    #[error("cpu usage unavailable: {0}")]
    Unavailable(String),
}

/// A raw, instantaneous CPU usage reading.
pub trait CpuSource: Send {
    /// Read the current usage, per-mille.
    ///
    /// # Errors
    ///
    /// Returns `CpuError` if the underlying statistics could not be read. The sampler
    /// keeps its previous average when this happens.
    fn read(&mut self) -> Result<u64, CpuError>;

    /// Number of cores the reading is averaged over, if the source knows it.
    ///
    /// Quota scaling divides this by the configured quota. Sources that return `None`
    /// fall back to [`thread::available_parallelism`], which already honours cgroup
    /// limits and so only suits readings that are relative to the container.
    fn cores(&self) -> Option<usize> {
        None
    }
}

/// Whole-system CPU usage as reported by the OS.
#[derive(Debug)]
pub struct SystemCpu {
    system: System,
}

impl SystemCpu {
    pub fn new() -> Self {
        let mut system = System::new();
        // Usage is a delta between refreshes; take the baseline now.
        system.refresh_cpu_usage();
        Self { system }
    }
}

impl Default for SystemCpu {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuSource for SystemCpu {
    fn read(&mut self) -> Result<u64, CpuError> {
        self.system.refresh_cpu_usage();
        let percent = self.system.global_cpu_usage();
        if !percent.is_finite() || percent < 0.0 {
            return Err(CpuError::Unavailable(format!(
                "global usage reported as {percent}"
            )));
        }
        Ok((f64::from(percent) * 10.0).round() as u64)
    }

    // Global usage is averaged over every host core, not just the ones our quota grants.
    fn cores(&self) -> Option<usize> {
        match self.system.cpus().len() {
            0 => None,
            n => Some(n),
        }
    }
}

/// Anything the limiter can ask for the current (smoothed) CPU usage.
pub trait CpuUsage: Send + Sync {
    /// Current usage, per-mille.
    fn usage(&self) -> i64;
}

impl<F> CpuUsage for F
where
    F: Fn() -> i64 + Send + Sync,
{
    fn usage(&self) -> i64 {
        self()
    }
}

/// Sampling configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SamplerOptions {
    /// Time between two readings.
    pub interval: Duration,
    /// Weight of the previous average in each update, `0.0..1.0`.
    pub decay: f64,
    /// CPU quota (in cores) of the container the process runs in, if any.
    pub quota: Option<f64>,
}

impl Default for SamplerOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            decay: 0.95,
            quota: None,
        }
    }
}

impl SamplerOptions {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_decay(mut self, decay: f64) -> Self {
        self.decay = decay.clamp(0.0, 1.0);
        self
    }

    /// Rescale readings for a process limited to `quota` cores.
    ///
    /// OS-reported usage is relative to every core on the host. Inside a container with
    /// a fixed quota that under-reports how close the process is to its own limit, so
    /// each reading is multiplied by `cores / quota` before smoothing.
    pub fn with_quota(mut self, quota: f64) -> Self {
        self.quota = Some(quota);
        self
    }
}

struct Shared {
    usage: AtomicI64,
    restarts: AtomicU64,
    started: AtomicBool,
    options: SamplerOptions,
    source: Mutex<Option<Box<dyn CpuSource>>>,
}

impl Shared {
    fn record(&self, raw: u64, scale: f64) {
        let sample = ((raw as f64 * scale) as u64).min(MAX_USAGE);
        let prev = self.usage.load(Ordering::Relaxed);
        self.usage
            .store(smooth(prev, sample, self.options.decay), Ordering::Relaxed);
    }
}

/// A supervised background sampler of CPU usage.
///
/// Cloning is cheap; all clones share the same average and daemon thread. The thread
/// is started on the first call to [`start`](Self::start) or [`usage`](Self::usage)
/// and stops once every handle has been dropped.
#[derive(Clone)]
pub struct CpuSampler {
    shared: Arc<Shared>,
}

impl Debug for CpuSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuSampler")
            .field("usage", &self.shared.usage.load(Ordering::Relaxed))
            .field("restarts", &self.shared.restarts.load(Ordering::Relaxed))
            .field("options", &self.shared.options)
            .finish()
    }
}

impl CpuSampler {
    pub fn new<S>(source: S, options: SamplerOptions) -> Self
    where
        S: CpuSource + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                usage: AtomicI64::new(0),
                restarts: AtomicU64::new(0),
                started: AtomicBool::new(false),
                options,
                source: Mutex::new(Some(Box::new(source))),
            }),
        }
    }

    /// Sample whole-system usage with [`SystemCpu`].
    pub fn system(options: SamplerOptions) -> Self {
        Self::new(SystemCpu::new(), options)
    }

    /// Spawn the sampling thread. Subsequent calls do nothing.
    pub fn start(&self) {
        if self.shared.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(source) = self.shared.source.lock().take() else {
            return;
        };

        let options = self.shared.options;
        let scale = match options.quota {
            Some(quota) => match source.cores() {
                Some(cores) => quota_scale(cores, quota),
                None => match thread::available_parallelism() {
                    Ok(cores) => quota_scale(cores.get(), quota),
                    Err(e) => {
                        warn!(error = %e, "unable to count cores; cpu quota ignored");
                        1.0
                    }
                },
            },
            None => 1.0,
        };

        let shared = Arc::downgrade(&self.shared);
        let spawned = thread::Builder::new()
            .name("cpu-sampler".to_string())
            .spawn(move || supervise(shared, source, options.interval, scale));
        if let Err(e) = spawned {
            error!(error = %e, "failed to spawn cpu sampler");
        }
    }

    /// Smoothed usage, per-mille. Never blocks.
    pub fn usage(&self) -> i64 {
        if !self.shared.started.load(Ordering::Relaxed) {
            self.start();
        }
        self.shared.usage.load(Ordering::Relaxed)
    }

    /// Number of times the sampling loop has been relaunched after a panic.
    pub fn restarts(&self) -> u64 {
        self.shared.restarts.load(Ordering::Relaxed)
    }
}

impl CpuUsage for CpuSampler {
    fn usage(&self) -> i64 {
        CpuSampler::usage(self)
    }
}

fn smooth(prev: i64, sample: u64, decay: f64) -> i64 {
    (prev as f64 * decay + sample as f64 * (1.0 - decay)) as i64
}

fn quota_scale(cores: usize, quota: f64) -> f64 {
    if quota > 0.0 {
        cores as f64 / quota
    } else {
        1.0
    }
}

fn supervise(shared: Weak<Shared>, mut source: Box<dyn CpuSource>, interval: Duration, scale: f64) {
    info!(?interval, scale, "cpu sampler started");

    loop {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            sample(&shared, source.as_mut(), interval, scale)
        }));
        let Err(payload) = outcome else {
            break;
        };
        let Some(shared) = shared.upgrade() else {
            break;
        };
        let restarts = shared.restarts.fetch_add(1, Ordering::Relaxed) + 1;
        error!(
            panic = panic_message(payload.as_ref()),
            restarts, "cpu sampler panicked; restarting"
        );
    }

    info!("cpu sampler stopped");
}

// Returns once every CpuSampler handle has been dropped.
fn sample(shared: &Weak<Shared>, source: &mut dyn CpuSource, interval: Duration, scale: f64) {
    loop {
        thread::sleep(interval);
        let Some(shared) = shared.upgrade() else {
            return;
        };
        match source.read() {
            Ok(raw) => shared.record(raw, scale),
            Err(e) => warn!(error = %e, "cpu usage read failed; keeping previous average"),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "unknown panic"
    }
}
