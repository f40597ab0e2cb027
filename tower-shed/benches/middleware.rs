use std::hint::black_box;
use std::sync::Arc;

use criterion::BenchmarkId;
use criterion::Criterion;
use criterion::Throughput;
use criterion::criterion_group;
use criterion::criterion_main;
use futures::stream::FuturesUnordered;
use futures::stream::StreamExt;
use http::Request;
use http::Response;
use shed_limit::BbrLimiter;
use shed_limit::BbrOptions;
use shed_limit::CircuitBreaker;
use shed_limit::Limiter;
use shed_limit::SreBreaker;
use shed_limit::SreOptions;
use tower::BoxError;
use tower::Service;
use tower::ServiceBuilder;
use tower::ServiceExt;
use tower::service_fn;
use tower::util::BoxCloneSyncService;
use tower_shed::BreakerLayer;
use tower_shed::LimitLayer;

type BenchService = BoxCloneSyncService<Request<String>, Response<String>, BoxError>;

const BURSTS: [usize; 3] = [1, 64, 1024];

async fn echo(req: Request<String>) -> Result<Response<String>, BoxError> {
    Ok(Response::new(req.into_body()))
}

/// Issue `burst` concurrent calls through `svc` and count the ones that were shed.
async fn drive(svc: BenchService, burst: usize) -> usize {
    let mut calls: FuturesUnordered<_> = (0..burst)
        .map(|_| {
            let mut svc = svc.clone();
            async move {
                let req = Request::new("ping".to_string());
                svc.ready().await?.call(req).await
            }
        })
        .collect();

    let mut shed = 0;
    while let Some(res) = calls.next().await {
        if black_box(res).is_err() {
            shed += 1;
        }
    }
    shed
}

fn bench_group(
    c: &mut Criterion,
    rt: &tokio::runtime::Runtime,
    name: &str,
    cases: &[(&str, BenchService)],
) {
    let mut group = c.benchmark_group(name);
    for burst in BURSTS {
        group.throughput(Throughput::Elements(burst as u64));
        for (case, svc) in cases {
            group.bench_with_input(BenchmarkId::new(*case, burst), &burst, |b, &burst| {
                b.to_async(rt).iter(|| drive(svc.clone(), burst));
            });
        }
    }
    group.finish();
}

fn limited(limiter: Arc<BbrLimiter>) -> BenchService {
    BoxCloneSyncService::new(
        ServiceBuilder::new()
            .layer(LimitLayer::new(limiter))
            .service(service_fn(echo)),
    )
}

fn guarded(breaker: Arc<SreBreaker>) -> BenchService {
    BoxCloneSyncService::new(
        ServiceBuilder::new()
            .layer(BreakerLayer::new(breaker))
            .service(service_fn(echo)),
    )
}

fn bench_middleware(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(8)
        .enable_all()
        .build()
        .unwrap();
    let _guard = rt.enter();

    // Admit path: CPU below threshold, the limiter only counts.
    let cool = Arc::new(BbrLimiter::new(|| 100_i64, BbrOptions::default()));

    // Reject path: CPU over threshold with two requests held open against a cold
    // ceiling of zero, so every further call is shed.
    let hot = Arc::new(BbrLimiter::new(|| 950_i64, BbrOptions::default()));
    let held: Vec<_> = (0..2).map(|_| hot.allow().unwrap()).collect();
    assert!(hot.allow().is_err());

    let healthy = Arc::new(SreBreaker::new(SreOptions::default()));
    let tripped = Arc::new(SreBreaker::new(SreOptions::default()));
    for _ in 0..1_000_000 {
        tripped.mark_failed();
    }

    bench_group(
        c,
        &rt,
        "LimitLayer",
        &[
            ("baseline", BoxCloneSyncService::new(service_fn(echo))),
            ("admit", limited(cool.clone())),
            ("shed", limited(hot.clone())),
        ],
    );

    bench_group(
        c,
        &rt,
        "BreakerLayer",
        &[
            ("healthy", guarded(healthy.clone())),
            ("tripped", guarded(tripped.clone())),
        ],
    );

    bench_group(
        c,
        &rt,
        "Stacked",
        &[(
            "limit+breaker",
            BoxCloneSyncService::new(
                ServiceBuilder::new()
                    .layer(LimitLayer::new(cool))
                    .layer(BreakerLayer::new(healthy))
                    .service(service_fn(echo)),
            ),
        )],
    );

    drop(held);
}

criterion_group!(benches, bench_middleware);
criterion_main!(benches);
