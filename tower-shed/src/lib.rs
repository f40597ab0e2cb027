//! # Tower Shed
//!
//! `tower-shed` wraps [Tower](https://github.com/tower-rs/tower) services with the
//! adaptive admission controls from [`shed_limit`].
//!
//! ## Layers
//!
//! 1. [`LimitLayer`]: server-side load shedding. Each request asks the
//!    [`shed_limit::Limiter`] for admission. Rejected requests fail immediately with
//!    [`ShedError::LimitExceeded`] and never reach the inner service. Admitted requests
//!    report their latency and outcome back to the limiter when the response resolves.
//! 2. [`BreakerLayer`]: client-side protection of a dependency. Calls the
//!    [`shed_limit::CircuitBreaker`] drops fail with [`ShedError::NotAllowed`]; every
//!    other outcome is marked on the breaker.
//!
//! Neither layer queues or waits. `poll_ready` is delegated to the inner service.
//!
//! Rejections are counted on the `admission_rejected` OpenTelemetry counter, tagged with
//! a `reason` attribute.
//!
//! ## Feature Flags
//!
//! - `axum`: Enables `IntoResponse` for [`ShedError`], allowing automatic conversion
//!   to HTTP status codes (429, 503, 500).

mod error;
mod layer;
mod service;
mod utils;

#[cfg(test)]
mod tests;

pub use error::ShedError;
pub use layer::BreakerLayer;
pub use layer::LimitLayer;
pub use service::BreakerFuture;
pub use service::BreakerService;
pub use service::LimitFuture;
pub use service::LimitService;
pub use utils::ServiceBuilderExt;
pub use utils::SharedBreaker;
pub use utils::SharedLimiter;
