use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use bytes::Bytes;
use chrono::Utc;
use hdrhistogram::Histogram;
use rand::Rng;
use tokio::sync::Barrier;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tower::BoxError;
use tower::service_fn;
use tower_bucket::Method;
use tower_bucket::RequestSpec;
use tower_bucket::Route;
use tower_bucket::Scheduler;
use tower_bucket::SchedulerConfig;
use tower_bucket::SchedulerError;
use tracing_subscriber::EnvFilter;

const BUCKET_LIMIT: u32 = 5;
const BUCKET_WINDOW: Duration = Duration::from_secs(1);

/// A fake REST API enforcing a fixed window per path and occasionally
/// failing like a real one does.
#[derive(Default)]
struct SimulatedApi {
    windows: Mutex<HashMap<String, (Instant, u32)>>,
    overruns: Mutex<u64>,
}

impl SimulatedApi {
    async fn handle(&self, req: http::Request<Bytes>) -> Result<http::Response<Bytes>, BoxError> {
        let (latency, bad_gateway, global) = {
            let mut rng = rand::rng();
            (
                Duration::from_millis(rng.random_range(5..50)),
                rng.random_bool(0.01),
                rng.random_bool(0.002),
            )
        };
        sleep(latency).await;

        let now = Utc::now();
        let date = now.to_rfc2822();

        if bad_gateway {
            return Ok(http::Response::builder()
                .status(502)
                .header(http::header::DATE, date)
                .body(Bytes::new())?);
        }
        if global {
            return Ok(http::Response::builder()
                .status(429)
                .header(http::header::DATE, date)
                .header("retry-after", "0.2")
                .header("x-ratelimit-global", "true")
                .body(Bytes::from_static(br#"{"global": true}"#))?);
        }

        let (remaining, reset_in) = {
            let mut windows = self.windows.lock().map_err(|_| "poisoned")?;
            let entry = windows
                .entry(req.uri().path().to_string())
                .or_insert_with(|| (Instant::now(), 0));
            if entry.0.elapsed() >= BUCKET_WINDOW {
                *entry = (Instant::now(), 0);
            }
            entry.1 += 1;
            let reset_in = BUCKET_WINDOW.saturating_sub(entry.0.elapsed());
            (BUCKET_LIMIT as i64 - entry.1 as i64, reset_in)
        };
        let reset = (now.timestamp_millis() as f64 + reset_in.as_millis() as f64) / 1000.0;

        if remaining < 0 {
            *self.overruns.lock().map_err(|_| "poisoned")? += 1;
            return Ok(http::Response::builder()
                .status(429)
                .header(http::header::DATE, date)
                .header("retry-after", format!("{:.3}", reset_in.as_secs_f64()))
                .header("x-ratelimit-limit", BUCKET_LIMIT)
                .header("x-ratelimit-remaining", 0)
                .header("x-ratelimit-reset", format!("{reset:.3}"))
                .body(Bytes::new())?);
        }

        Ok(http::Response::builder()
            .status(200)
            .header(http::header::DATE, date)
            .header("x-ratelimit-limit", BUCKET_LIMIT)
            .header("x-ratelimit-remaining", remaining)
            .header("x-ratelimit-reset", format!("{reset:.3}"))
            .body(Bytes::new())?)
    }
}

#[derive(Default)]
struct FailureCounter {
    timeouts: usize,
    exhausted: usize,
    status: usize,
    other: usize,
}

async fn run_load_test(name: &str, channels: u64, total_reqs: usize) -> Result<(), BoxError> {
    let api = Arc::new(SimulatedApi::default());
    let transport = {
        let api = Arc::clone(&api);
        service_fn(move |req: http::Request<Bytes>| {
            let api = Arc::clone(&api);
            async move { api.handle(req).await }
        })
    };
    let scheduler = Scheduler::new(
        transport,
        SchedulerConfig::new()
            .with_api_base(http::Uri::from_static("https://api.invalid/v10"))
            .with_retry_base_delay(Duration::from_millis(100))
            .with_max_retries(3),
    );

    let mut hist_elapsed = Histogram::<u64>::new_with_bounds(1, 600_000_000, 3)?;
    let mut tasks = JoinSet::new();
    let mut failures = FailureCounter::default();
    let barrier = Arc::new(Barrier::new(total_reqs));
    let start = Instant::now();

    for i in 0..total_reqs {
        let scheduler = scheduler.clone();
        let barrier = Arc::clone(&barrier);
        let channel = i as u64 % channels;
        tasks.spawn(async move {
            barrier.wait().await;
            let req_start = Instant::now();
            let route = Route::new(Method::Post, "/channels/{channel_id}/messages")
                .param("channel_id", channel);
            let res = scheduler.submit(route, RequestSpec::new()).await;
            (res, req_start.elapsed())
        });
    }

    let mut success_count = 0;
    while let Some(task) = tasks.join_next().await {
        let (res, elapsed) = task?;
        match res {
            Ok(_) => {
                success_count += 1;
                hist_elapsed.record(elapsed.as_micros() as u64)?;
            }
            Err(SchedulerError::TransportAbort(_)) => failures.timeouts += 1,
            Err(SchedulerError::RetriesExhausted { .. }) => failures.exhausted += 1,
            Err(SchedulerError::HttpStatus(_)) => failures.status += 1,
            Err(_) => failures.other += 1,
        }
    }

    let total_duration = start.elapsed();
    let overruns = *api.overruns.lock().map_err(|_| "poisoned")?;

    println!("--- {} ---", name);
    println!("Total Duration:  {:.2?}", total_duration);
    println!("Success/Total:   {}/{}", success_count, total_reqs);
    println!(
        "Success Rate:    {:.2} req/sec",
        success_count as f64 / total_duration.as_secs_f64()
    );
    println!("Buckets Alive:   {}", scheduler.registry().len());
    println!("Bucket 429s:     {}", overruns);

    if success_count > 0 {
        println!("P50 (Elapsed):   {}µs", hist_elapsed.value_at_quantile(0.5));
        println!("P99 (Elapsed):   {}µs", hist_elapsed.value_at_quantile(0.99));
        println!("Max (Elapsed):   {}µs", hist_elapsed.max());
    }

    let total_errors = failures.timeouts + failures.exhausted + failures.status + failures.other;
    println!("Errors:          {}", total_errors);
    if total_errors > 0 {
        println!("  └─ Aborted:    {}", failures.timeouts);
        println!("  └─ Exhausted:  {}", failures.exhausted);
        println!("  └─ Status:     {}", failures.status);
        if failures.other > 0 {
            println!("  └─ Other:      {}", failures.other);
        }
    }
    println!();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    run_load_test("Single Bucket", 1, 50).await?;
    run_load_test("Few Buckets", 10, 500).await?;
    run_load_test("Many Buckets", 1_000, 5_000).await?;

    Ok(())
}
