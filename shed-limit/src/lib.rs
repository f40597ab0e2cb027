//! # shed-limit
//!
//! `shed-limit` provides adaptive overload protection for in-process call sites.
//!
//! ## Core Philosophy
//!
//! Static rate limits have to be tuned by hand and go stale as soon as the workload
//! changes. `shed-limit` instead derives its decisions from what the process has
//! recently observed: latency, throughput, in-flight concurrency, CPU load and the
//! success ratio of calls to a dependency.
//!
//! ## Key Concepts
//!
//! * **Rolling Windows**: Every signal is aggregated into a ring of time buckets
//!   ([`RollingWindow`]) which rotate lazily as time advances. No timers.
//! * **BBR Limiter**: [`BbrLimiter`] estimates the sustainable concurrency from the best
//!   recent throughput and latency, and sheds requests above it while CPU is hot.
//! * **SRE Breaker**: [`SreBreaker`] rejects calls to a failing dependency with a
//!   probability that tracks how far the accept ratio has fallen below target.
//! * **CPU Sampler**: [`CpuSampler`] smooths CPU usage on a supervised daemon thread so
//!   the limiter can read it with a single atomic load.
//!
//! ## Example
//!
//! ```rust
//! use shed_limit::{BbrLimiter, BbrOptions, DoneInfo, Limiter};
//!
//! // A fixed CPU reading stands in for a CpuSampler here.
//! let limiter = BbrLimiter::new(|| 100_i64, BbrOptions::default());
//!
//! match limiter.allow() {
//!     Ok(done) => {
//!         // Request admitted, do the work...
//!         done.done(DoneInfo::ok());
//!     }
//!     Err(rejected) => {
//!         // Request shed
//!         eprintln!("{rejected}");
//!     }
//! }
//! ```

use std::error::Error;
use std::fmt::Debug;
use std::sync::Arc;

pub mod breaker;
pub mod cpu;
mod group;
pub mod limiter;
pub mod window;

pub use breaker::SreBreaker;
pub use breaker::SreOptions;
pub use cpu::CpuSampler;
pub use cpu::CpuUsage;
pub use cpu::SamplerOptions;
pub use group::Group;
pub use limiter::BbrLimiter;
pub use limiter::BbrOptions;
pub use limiter::Stat;
pub use window::RollingWindow;

/// Reasons why a request might be rejected at admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Rejected {
    /// The adaptive limiter shed the request because the process is overloaded.
    #[error("limit exceeded; request shed")]
    LimitExceeded,

    /// The circuit breaker probabilistically dropped the request.
    #[error("circuit breaker not allowed")]
    NotAllowed,
}

/// The outcome of an admitted request, handed back through [`Done::done`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DoneInfo<'a> {
    pub err: Option<&'a (dyn Error + 'static)>,
}

impl<'a> DoneInfo<'a> {
    /// The request completed successfully.
    pub fn ok() -> Self {
        Self { err: None }
    }

    /// The request completed with `err`.
    pub fn failed(err: &'a (dyn Error + 'static)) -> Self {
        Self { err: Some(err) }
    }

    pub fn is_ok(&self) -> bool {
        self.err.is_none()
    }
}

type DoneFn = Box<dyn for<'a> FnOnce(DoneInfo<'a>) + Send>;

/// Completion handle for an admitted request.
///
/// Callers must invoke [`Done::done`] once the unit of work finishes, whether it
/// succeeded or not. A handle that is dropped instead leaves the request counted as
/// in-flight and its latency unrecorded; nothing enforces the call.
#[must_use = "an admitted request must report completion through `done`"]
pub struct Done {
    f: DoneFn,
}

impl Done {
    pub fn new<F>(f: F) -> Self
    where
        F: for<'a> FnOnce(DoneInfo<'a>) + Send + 'static,
    {
        Self { f: Box::new(f) }
    }

    /// Report completion. Consumes the handle, so it can only be called once.
    pub fn done(self, info: DoneInfo<'_>) {
        (self.f)(info)
    }
}

impl Debug for Done {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Done").finish_non_exhaustive()
    }
}

/// Admission control for a unit of work.
///
/// Limiters must be `Send` and `Sync` to allow sharing across thread boundaries
/// via `Arc`.
pub trait Limiter: Debug + Send + Sync {
    /// Decide whether a request may start.
    ///
    /// This method never blocks beyond the short internal window locks.
    ///
    /// # Errors
    ///
    /// Returns [`Rejected::LimitExceeded`] if the request should be shed.
    fn allow(&self) -> Result<Done, Rejected>;
}

/// Client-side protection of a dependency.
pub trait CircuitBreaker: Debug + Send + Sync {
    /// Decide whether a call to the dependency may proceed.
    ///
    /// # Errors
    ///
    /// Returns [`Rejected::NotAllowed`] if the call should be dropped.
    fn allow(&self) -> Result<(), Rejected>;

    /// Record a successful call.
    fn mark_success(&self);

    /// Record a failed call. Calls rejected locally should be marked failed too.
    fn mark_failed(&self);
}

impl<L> Limiter for Arc<L>
where
    L: Limiter + ?Sized,
{
    fn allow(&self) -> Result<Done, Rejected> {
        (**self).allow()
    }
}

impl<B> CircuitBreaker for Arc<B>
where
    B: CircuitBreaker + ?Sized,
{
    fn allow(&self) -> Result<(), Rejected> {
        (**self).allow()
    }

    fn mark_success(&self) {
        (**self).mark_success()
    }

    fn mark_failed(&self) {
        (**self).mark_failed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering;

    #[test]
    fn done_reports_outcome() {
        let failed = Arc::new(AtomicBool::new(false));
        let seen = failed.clone();
        let done = Done::new(move |info| seen.store(!info.is_ok(), Ordering::SeqCst));

        let err = std::io::Error::other("boom");
        done.done(DoneInfo::failed(&err));

        assert!(failed.load(Ordering::SeqCst));
    }

    #[test]
    fn rejected_reasons_are_distinct() {
        assert_ne!(Rejected::LimitExceeded, Rejected::NotAllowed);
        assert_eq!(
            Rejected::LimitExceeded.to_string(),
            "limit exceeded; request shed"
        );
        assert_eq!(
            Rejected::NotAllowed.to_string(),
            "circuit breaker not allowed"
        );
    }
}
