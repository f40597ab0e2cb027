use std::sync::Arc;

use tower::Layer;

use crate::service::BreakerService;
use crate::service::LimitService;

/// Applies adaptive load shedding to requests.
#[derive(Debug)]
pub struct LimitLayer<L>
where
    L: ?Sized,
{
    limiter: Arc<L>,
}

impl<L> Clone for LimitLayer<L>
where
    L: ?Sized,
{
    fn clone(&self) -> Self {
        Self {
            limiter: Arc::clone(&self.limiter),
        }
    }
}

impl<L> LimitLayer<L>
where
    L: ?Sized,
{
    /// Create a LimitLayer. Every service it wraps shares `limiter`.
    pub fn new(limiter: Arc<L>) -> Self {
        LimitLayer { limiter }
    }
}

impl<L, S> Layer<S> for LimitLayer<L>
where
    L: ?Sized,
{
    type Service = LimitService<L, S>;

    fn layer(&self, service: S) -> Self::Service {
        LimitService::new(service, self.limiter.clone())
    }
}

/// Applies a circuit breaker to calls made through the wrapped service.
#[derive(Debug, Clone)]
pub struct BreakerLayer<B> {
    breaker: B,
}

impl<B> BreakerLayer<B> {
    /// Create a BreakerLayer. `breaker` is cloned into every service it wraps, so
    /// pass an `Arc` to share statistics.
    pub fn new(breaker: B) -> Self {
        BreakerLayer { breaker }
    }
}

impl<B, S> Layer<S> for BreakerLayer<B>
where
    B: Clone,
{
    type Service = BreakerService<B, S>;

    fn layer(&self, service: S) -> Self::Service {
        BreakerService::new(service, self.breaker.clone())
    }
}
