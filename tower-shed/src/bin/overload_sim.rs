//! Drive a limiter-wrapped mock service past its capacity and report what got shed.
//!
//! The mock service burns simulated CPU in proportion to its in-flight requests, so
//! the limiter sees load rise as concurrency grows.
//!
//! ```text
//! RUST_LOG=shed_limit=debug cargo run --features sim --bin overload_sim -- --concurrency 512
//! ```

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use clap::Parser;
use hdrhistogram::Histogram;
use shed_limit::BbrLimiter;
use shed_limit::BbrOptions;
use shed_limit::CpuSampler;
use shed_limit::SamplerOptions;
use shed_limit::cpu::CpuError;
use shed_limit::cpu::CpuSource;
use shed_limit::cpu::MAX_USAGE;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tower::BoxError;
use tower::Layer;
use tower::Service;
use tower::ServiceExt;
use tower::service_fn;
use tower_shed::LimitLayer;
use tower_shed::ShedError;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(about = "Simulate an overloaded service behind an adaptive limiter")]
struct Args {
    /// Total number of requests to send
    #[arg(long, default_value_t = 50_000)]
    requests: u64,

    /// Number of concurrent clients
    #[arg(long, default_value_t = 256)]
    concurrency: u64,

    /// Time the mock service spends on each request
    #[arg(long, value_parser = humantime::parse_duration, default_value = "20ms")]
    latency: Duration,

    /// Simulated CPU usage with nothing in flight, per-mille
    #[arg(long, default_value_t = 200)]
    base_cpu: u64,

    /// Simulated CPU added by every in-flight request, per-mille
    #[arg(long, default_value_t = 8)]
    cpu_per_request: u64,

    /// Sample real system CPU instead of the simulation
    #[arg(long)]
    system_cpu: bool,

    /// CPU sampling tick
    #[arg(long, value_parser = humantime::parse_duration, default_value = "100ms")]
    sample_interval: Duration,

    /// Limiter statistics horizon
    #[arg(long, value_parser = humantime::parse_duration, default_value = "10s")]
    window: Duration,

    /// Limiter shedding threshold, per-mille
    #[arg(long, default_value_t = 800)]
    cpu_threshold: i64,
}

/// CPU usage derived from the mock service's own concurrency.
struct SimulatedCpu {
    in_flight: Arc<AtomicU64>,
    base: u64,
    per_request: u64,
}

impl CpuSource for SimulatedCpu {
    fn read(&mut self) -> Result<u64, CpuError> {
        let in_flight = self.in_flight.load(Ordering::Relaxed);
        Ok((self.base + in_flight * self.per_request).min(MAX_USAGE))
    }
}

#[derive(Default)]
struct Outcomes {
    admitted: u64,
    shed: u64,
    failed: u64,
}

/// Share of `requests` sent by `client`. The first `requests % clients` clients send
/// one extra, so every request is sent exactly once.
fn requests_for_client(requests: u64, clients: u64, client: u64) -> u64 {
    let clients = clients.max(1);
    requests / clients + u64::from(client < requests % clients)
}

fn new_histogram() -> Result<Histogram<u64>, BoxError> {
    Ok(Histogram::<u64>::new_with_bounds(1, 60_000_000, 3)?)
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    info!(?args, "starting overload simulation");

    let in_flight = Arc::new(AtomicU64::new(0));
    let sampler_options = SamplerOptions::default().with_interval(args.sample_interval);
    let sampler = if args.system_cpu {
        CpuSampler::system(sampler_options)
    } else {
        CpuSampler::new(
            SimulatedCpu {
                in_flight: in_flight.clone(),
                base: args.base_cpu,
                per_request: args.cpu_per_request,
            },
            sampler_options,
        )
    };
    sampler.start();

    let limiter = Arc::new(BbrLimiter::new(
        sampler.clone(),
        BbrOptions::default()
            .with_window(args.window)
            .with_cpu_threshold(args.cpu_threshold),
    ));

    let latency = args.latency;
    let load = in_flight.clone();
    let svc = LimitLayer::new(limiter.clone()).layer(service_fn(move |_req: ()| {
        let load = load.clone();
        async move {
            load.fetch_add(1, Ordering::Relaxed);
            sleep(latency).await;
            load.fetch_sub(1, Ordering::Relaxed);
            Ok::<_, BoxError>(())
        }
    }));

    let start = Instant::now();
    let mut tasks = JoinSet::new();

    for client in 0..args.concurrency.max(1) {
        let per_client = requests_for_client(args.requests, args.concurrency, client);
        if per_client == 0 {
            break;
        }
        let mut local_svc = svc.clone();
        let mut hist = new_histogram()?;
        tasks.spawn(async move {
            let mut outcomes = Outcomes::default();
            for _ in 0..per_client {
                let req_start = Instant::now();
                let res = match local_svc.ready().await {
                    Ok(ready_svc) => ready_svc.call(()).await,
                    Err(e) => Err(e),
                };
                match res {
                    Ok(()) => {
                        outcomes.admitted += 1;
                        hist.saturating_record(req_start.elapsed().as_micros() as u64);
                    }
                    Err(e) if e.downcast_ref::<ShedError>() == Some(&ShedError::LimitExceeded) => {
                        outcomes.shed += 1;
                        // Back off briefly so shed clients don't spin
                        sleep(Duration::from_millis(1)).await;
                    }
                    Err(_) => outcomes.failed += 1,
                }
            }
            (outcomes, hist)
        });
    }

    let mut total = Outcomes::default();
    let mut latencies = new_histogram()?;
    while let Some(task) = tasks.join_next().await {
        let (outcomes, hist) = task?;
        total.admitted += outcomes.admitted;
        total.shed += outcomes.shed;
        total.failed += outcomes.failed;
        latencies.add(hist)?;
    }

    let elapsed = start.elapsed();
    let sent = total.admitted + total.shed + total.failed;
    let stat = limiter.stat();

    println!("--- Overload Simulation ---");
    println!("Total Duration:  {:.2?}", elapsed);
    println!("Admitted/Total:  {}/{}", total.admitted, sent);
    println!("Shed:            {}", total.shed);
    println!("Failed:          {}", total.failed);
    println!(
        "Goodput:         {:.2} req/sec",
        total.admitted as f64 / elapsed.as_secs_f64()
    );
    if total.admitted > 0 {
        println!("P50 (Admitted):  {}µs", latencies.value_at_quantile(0.5));
        println!("P99 (Admitted):  {}µs", latencies.value_at_quantile(0.99));
    }
    println!(
        "Limiter:         cpu={} max_pass={} min_rt={}ms max_in_flight={}",
        stat.cpu, stat.max_pass, stat.min_rt, stat.max_in_flight
    );
    println!("Sampler Restarts: {}", sampler.restarts());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requests_spread_across_clients() {
        let shares: Vec<u64> = (0..4).map(|c| requests_for_client(10, 4, c)).collect();
        assert_eq!(shares, vec![3, 3, 2, 2]);
    }

    #[test]
    fn test_more_clients_than_requests() {
        let shares: Vec<u64> = (0..8).map(|c| requests_for_client(3, 8, c)).collect();
        assert_eq!(shares.iter().sum::<u64>(), 3);
        assert_eq!(&shares[..4], &[1, 1, 1, 0]);
    }

    #[test]
    fn test_zero_clients_sends_everything_from_one() {
        assert_eq!(requests_for_client(7, 0, 0), 7);
    }
}
