use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::task::Context;
use std::task::Poll;

use shed_limit::BbrLimiter;
use shed_limit::BbrOptions;
use shed_limit::CircuitBreaker;
use shed_limit::Done;
use shed_limit::Limiter;
use shed_limit::Rejected;
use shed_limit::SreBreaker;
use shed_limit::SreOptions;
use tower::BoxError;
use tower::Layer;
use tower::Service;
use tower::ServiceBuilder;
use tower::ServiceExt;

use super::*;

use futures::future::Ready;
use futures::future::ready;
use more_asserts::assert_lt;

#[derive(Clone, Default)]
struct MockService {
    pub count: Arc<AtomicUsize>,
    pub fail: bool,
}

impl Service<()> for MockService {
    type Response = ();
    type Error = BoxError;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: ()) -> Self::Future {
        self.count.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            ready(Err("dependency unavailable".into()))
        } else {
            ready(Ok(()))
        }
    }
}

// A limiter that admits while open and records every reported outcome
#[derive(Debug, Default)]
struct Gate {
    closed: AtomicBool,
    outcomes: Arc<Mutex<Vec<bool>>>,
}

impl Limiter for Gate {
    fn allow(&self) -> Result<Done, Rejected> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Rejected::LimitExceeded);
        }
        let outcomes = self.outcomes.clone();
        Ok(Done::new(move |info| {
            outcomes.lock().unwrap().push(info.is_ok())
        }))
    }
}

// A breaker that allows while open and counts marks
#[derive(Debug, Default)]
struct Switch {
    open: AtomicBool,
    successes: AtomicUsize,
    failures: AtomicUsize,
}

impl CircuitBreaker for Switch {
    fn allow(&self) -> Result<(), Rejected> {
        if self.open.load(Ordering::SeqCst) {
            Err(Rejected::NotAllowed)
        } else {
            Ok(())
        }
    }

    fn mark_success(&self) {
        self.successes.fetch_add(1, Ordering::SeqCst);
    }

    fn mark_failed(&self) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }
}

fn shed_error(err: &BoxError) -> Option<&ShedError> {
    err.downcast_ref::<ShedError>()
}

#[tokio::test]
async fn test_admitted_request_reports_completion() {
    let gate = Arc::new(Gate::default());
    let mock = MockService::default();
    let mut service = LimitLayer::new(gate.clone()).layer(mock.clone());

    service.ready().await.unwrap().call(()).await.unwrap();

    assert_eq!(mock.count.load(Ordering::SeqCst), 1);
    assert_eq!(*gate.outcomes.lock().unwrap(), vec![true]);
}

#[tokio::test]
async fn test_rejected_request_never_reaches_inner() {
    let gate = Arc::new(Gate::default());
    gate.closed.store(true, Ordering::SeqCst);
    let mock = MockService::default();
    let mut service = LimitService::new(mock.clone(), gate.clone());

    let err = service.ready().await.unwrap().call(()).await.unwrap_err();

    assert_eq!(shed_error(&err), Some(&ShedError::LimitExceeded));
    assert_eq!(mock.count.load(Ordering::SeqCst), 0);
    assert!(gate.outcomes.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_inner_error_reported_as_failure() {
    let gate = Arc::new(Gate::default());
    let mock = MockService {
        fail: true,
        ..Default::default()
    };
    let mut service = LimitService::new(mock, gate.clone());

    let err = service.ready().await.unwrap().call(()).await.unwrap_err();

    assert!(shed_error(&err).is_none());
    assert_eq!(err.to_string(), "dependency unavailable");
    assert_eq!(*gate.outcomes.lock().unwrap(), vec![false]);
}

#[tokio::test]
async fn test_dropped_response_releases_in_flight() {
    let limiter = Arc::new(BbrLimiter::new(|| 0_i64, BbrOptions::default()));
    let mut service = LimitService::new(MockService::default(), limiter.clone());

    let fut = service.ready().await.unwrap().call(());
    assert_eq!(limiter.stat().in_flight, 1);

    drop(fut);
    assert_eq!(limiter.stat().in_flight, 0);
}

#[tokio::test]
async fn test_in_flight_tracked_until_response() {
    let (mock, mut handle) = tower_test::mock::pair::<(), &'static str>();
    let limiter = Arc::new(BbrLimiter::new(|| 0_i64, BbrOptions::default()));
    let mut service = LimitLayer::new(limiter.clone()).layer(mock);

    handle.allow(1);
    let fut = service.ready().await.unwrap().call(());
    assert_eq!(limiter.stat().in_flight, 1);

    let (_req, send) = handle.next_request().await.unwrap();
    send.send_response("ok");

    assert_eq!(fut.await.unwrap(), "ok");
    assert_eq!(limiter.stat().in_flight, 0);
}

#[tokio::test]
async fn test_shared_state_across_clones() {
    let gate = Arc::new(Gate::default());
    let layer = LimitLayer::new(gate.clone());

    let mut svc1 = layer.layer(MockService::default());
    let mut svc2 = layer.clone().layer(MockService::default());

    svc1.ready().await.unwrap().call(()).await.unwrap();
    svc2.ready().await.unwrap().call(()).await.unwrap();
    assert_eq!(gate.outcomes.lock().unwrap().len(), 2);

    gate.closed.store(true, Ordering::SeqCst);
    assert!(svc2.ready().await.unwrap().call(()).await.is_err());
}

#[tokio::test]
async fn test_breaker_marks_inner_outcomes() {
    let switch = Arc::new(Switch::default());
    let mut ok = BreakerLayer::new(switch.clone()).layer(MockService::default());
    let mut failing = BreakerService::new(
        MockService {
            fail: true,
            ..Default::default()
        },
        switch.clone(),
    );

    ok.ready().await.unwrap().call(()).await.unwrap();
    ok.ready().await.unwrap().call(()).await.unwrap();
    let _ = failing.ready().await.unwrap().call(()).await.unwrap_err();

    assert_eq!(switch.successes.load(Ordering::SeqCst), 2);
    assert_eq!(switch.failures.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_breaker_rejection_counts_as_failure() {
    let switch = Arc::new(Switch::default());
    switch.open.store(true, Ordering::SeqCst);
    let mock = MockService::default();
    let mut service = BreakerLayer::new(switch.clone()).layer(mock.clone());

    let err = service.ready().await.unwrap().call(()).await.unwrap_err();

    assert_eq!(shed_error(&err), Some(&ShedError::NotAllowed));
    assert_eq!(mock.count.load(Ordering::SeqCst), 0);
    assert_eq!(switch.failures.load(Ordering::SeqCst), 1);
    assert_eq!(switch.successes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_sre_breaker_throttles_failing_dependency() {
    let breaker = Arc::new(
        SreBreaker::new(SreOptions::default().with_request_floor(10)).with_seed(42),
    );
    let mock = MockService {
        fail: true,
        ..Default::default()
    };
    let mut service = BreakerLayer::new(breaker.clone()).layer(mock.clone());

    let mut not_allowed = 0;
    for _ in 0..1000 {
        let err = service.ready().await.unwrap().call(()).await.unwrap_err();
        if shed_error(&err) == Some(&ShedError::NotAllowed) {
            not_allowed += 1;
        }
    }

    // Only the first few calls get through once the floor is reached
    assert_lt!(mock.count.load(Ordering::SeqCst), 50);
    assert_eq!(not_allowed + mock.count.load(Ordering::SeqCst), 1000);
    assert_eq!(breaker.summary(), (0, 1000));
}

#[tokio::test]
async fn test_builder_extension_stacks_both_layers() {
    let limiter: SharedLimiter = Arc::new(BbrLimiter::new(|| 0_i64, BbrOptions::default()));
    let breaker: SharedBreaker = Arc::new(SreBreaker::new(SreOptions::default()));
    let mock = MockService::default();

    let mut service = ServiceBuilder::new()
        .adaptive_limit(limiter)
        .circuit_breaker(breaker.clone())
        .service(mock.clone());

    for _ in 0..10 {
        service.ready().await.unwrap().call(()).await.unwrap();
    }

    assert_eq!(mock.count.load(Ordering::SeqCst), 10);
    assert!(breaker.allow().is_ok());
}
