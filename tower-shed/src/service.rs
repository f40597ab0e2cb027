use std::error::Error;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::task::ready;

use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use pin_project_lite::pin_project;
use tower::BoxError;
use tower::Service;

use shed_limit::CircuitBreaker;
use shed_limit::Done;
use shed_limit::DoneInfo;
use shed_limit::Limiter;

use crate::error::ShedError;

#[derive(Clone, Debug)]
struct AdmissionMetrics {
    rejected: Counter<u64>,
}

impl AdmissionMetrics {
    fn new(scope: &'static str) -> Self {
        let meter = global::meter(scope);
        Self {
            rejected: meter.u64_counter("admission_rejected").build(),
        }
    }

    fn record(&self, error: &ShedError) {
        self.rejected
            .add(1, &[KeyValue::new("reason", error.reason())]);
    }
}

/// Reports the outcome of an admitted request to its limiter.
///
/// A response future dropped before completion (for example by a client disconnect
/// or an outer timeout) still releases its in-flight slot.
struct Completion(Option<Done>);

impl Completion {
    fn finish(&mut self, err: Option<&(dyn Error + 'static)>) {
        if let Some(done) = self.0.take() {
            done.done(DoneInfo { err });
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if self.0.is_some() {
            let cancelled = ShedError::Inner("request dropped before completion".to_string());
            let err: &(dyn Error + 'static) = &cancelled;
            self.finish(Some(err));
        }
    }
}

pin_project! {
    #[project = LimitFutureProj]
    enum LimitFutureState<F> {
        Admitted {
            #[pin]
            inner: F,
            completion: Completion,
        },
        Rejected {
            error: ShedError,
        },
    }
}

pin_project! {
    /// Response future of [`LimitService`].
    pub struct LimitFuture<F> {
        #[pin]
        state: LimitFutureState<F>,
    }
}

impl<F, T> Future for LimitFuture<F>
where
    F: Future<Output = Result<T, BoxError>>,
{
    type Output = Result<T, BoxError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project().state.project() {
            LimitFutureProj::Admitted { inner, completion } => {
                let result = ready!(inner.poll(cx));
                match &result {
                    Ok(_) => completion.finish(None),
                    Err(e) => {
                        let err: &(dyn Error + 'static) = &**e;
                        completion.finish(Some(err))
                    }
                }
                Poll::Ready(result)
            }
            LimitFutureProj::Rejected { error } => Poll::Ready(Err(Box::new(error.clone()))),
        }
    }
}

/// Sheds requests the wrapped [`Limiter`] rejects and reports completions of the
/// ones it admits.
#[derive(Debug)]
pub struct LimitService<L, S>
where
    L: ?Sized,
{
    inner: S,
    limiter: Arc<L>,
    metrics: AdmissionMetrics,
}

impl<L, S> Clone for LimitService<L, S>
where
    L: ?Sized,
    S: Clone,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: Arc::clone(&self.limiter),
            metrics: self.metrics.clone(),
        }
    }
}

impl<L, S> LimitService<L, S>
where
    L: ?Sized,
{
    pub fn new(inner: S, limiter: Arc<L>) -> Self {
        Self {
            inner,
            limiter,
            metrics: AdmissionMetrics::new("limit_service"),
        }
    }
}

impl<L, S, Req> Service<Req> for LimitService<L, S>
where
    L: Limiter + ?Sized,
    S: Service<Req, Error = BoxError>,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = LimitFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let state = match self.limiter.allow() {
            Ok(done) => LimitFutureState::Admitted {
                inner: self.inner.call(req),
                completion: Completion(Some(done)),
            },
            Err(rejected) => {
                let error = ShedError::from(rejected);
                self.metrics.record(&error);
                LimitFutureState::Rejected { error }
            }
        };
        LimitFuture { state }
    }
}

pin_project! {
    #[project = BreakerFutureProj]
    enum BreakerFutureState<F, B> {
        Allowed {
            #[pin]
            inner: F,
            breaker: B,
        },
        Rejected {
            error: ShedError,
        },
    }
}

pin_project! {
    /// Response future of [`BreakerService`].
    pub struct BreakerFuture<F, B> {
        #[pin]
        state: BreakerFutureState<F, B>,
    }
}

impl<F, B, T> Future for BreakerFuture<F, B>
where
    F: Future<Output = Result<T, BoxError>>,
    B: CircuitBreaker,
{
    type Output = Result<T, BoxError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project().state.project() {
            BreakerFutureProj::Allowed { inner, breaker } => {
                let result = ready!(inner.poll(cx));
                if result.is_ok() {
                    breaker.mark_success();
                } else {
                    breaker.mark_failed();
                }
                Poll::Ready(result)
            }
            BreakerFutureProj::Rejected { error } => Poll::Ready(Err(Box::new(error.clone()))),
        }
    }
}

/// Guards calls to a dependency with a [`CircuitBreaker`].
///
/// Every outcome is fed back to the breaker. Calls the breaker rejects locally are
/// marked failed as well, so a dependency that keeps failing stays throttled.
///
/// `B` is cloned into every response future, so it is normally an `Arc` around the
/// breaker (for example the handle returned by [`shed_limit::Group::get`]).
#[derive(Debug, Clone)]
pub struct BreakerService<B, S> {
    inner: S,
    breaker: B,
    metrics: AdmissionMetrics,
}

impl<B, S> BreakerService<B, S> {
    pub fn new(inner: S, breaker: B) -> Self {
        Self {
            inner,
            breaker,
            metrics: AdmissionMetrics::new("breaker_service"),
        }
    }
}

impl<B, S, Req> Service<Req> for BreakerService<B, S>
where
    B: CircuitBreaker + Clone,
    S: Service<Req, Error = BoxError>,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = BreakerFuture<S::Future, B>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let state = match self.breaker.allow() {
            Ok(()) => BreakerFutureState::Allowed {
                inner: self.inner.call(req),
                breaker: self.breaker.clone(),
            },
            Err(rejected) => {
                self.breaker.mark_failed();
                let error = ShedError::from(rejected);
                self.metrics.record(&error);
                BreakerFutureState::Rejected { error }
            }
        };
        BreakerFuture { state }
    }
}
