use std::sync::Arc;

use tower::ServiceBuilder;
use tower::layer::util::Stack;

use shed_limit::CircuitBreaker;
use shed_limit::Limiter;

use crate::BreakerLayer;
use crate::LimitLayer;

/// Shared, type-erased limiter handle.
pub type SharedLimiter = Arc<dyn Limiter>;

/// Shared, type-erased breaker handle.
pub type SharedBreaker = Arc<dyn CircuitBreaker>;

/// Service Builder Extension with additional useful functions for tower::ServiceBuilder.
pub trait ServiceBuilderExt<L> {
    /// Shed load on the server side of a call.
    fn adaptive_limit(
        self,
        limiter: SharedLimiter,
    ) -> ServiceBuilder<Stack<LimitLayer<dyn Limiter>, L>>;

    /// Protect a dependency on the client side of a call.
    fn circuit_breaker(
        self,
        breaker: SharedBreaker,
    ) -> ServiceBuilder<Stack<BreakerLayer<SharedBreaker>, L>>;
}

impl<L> ServiceBuilderExt<L> for ServiceBuilder<L> {
    fn adaptive_limit(
        self,
        limiter: SharedLimiter,
    ) -> ServiceBuilder<Stack<LimitLayer<dyn Limiter>, L>> {
        self.layer(LimitLayer::new(limiter))
    }

    fn circuit_breaker(
        self,
        breaker: SharedBreaker,
    ) -> ServiceBuilder<Stack<BreakerLayer<SharedBreaker>, L>> {
        self.layer(BreakerLayer::new(breaker))
    }
}
