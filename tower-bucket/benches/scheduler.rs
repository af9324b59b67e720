use bytes::Bytes;
use criterion::Criterion;
use criterion::criterion_group;
use criterion::criterion_main;
use futures::stream::FuturesUnordered;
use futures::stream::StreamExt;
use std::hint::black_box;
use tower::BoxError;
use tower::service_fn;
use tower_bucket::Method;
use tower_bucket::RequestSpec;
use tower_bucket::Route;
use tower_bucket::Scheduler;
use tower_bucket::SchedulerConfig;

async fn noop_handler(_req: http::Request<Bytes>) -> Result<http::Response<Bytes>, BoxError> {
    Ok(http::Response::new(Bytes::new()))
}

fn messages(channel: u64) -> Route {
    Route::new(Method::Post, "/channels/{channel_id}/messages").param("channel_id", channel)
}

fn bench_submit(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();
    let scheduler = {
        let _guard = rt.enter();
        Scheduler::new(service_fn(noop_handler), SchedulerConfig::new())
    };

    let mut group = c.benchmark_group("submit");

    group.bench_function("uncontended", |b| {
        b.to_async(&rt).iter(|| {
            let scheduler = scheduler.clone();
            async move { black_box(scheduler.submit(messages(1), RequestSpec::new()).await) }
        });
    });

    for burst_size in [10, 100] {
        group.bench_function(format!("one_bucket/{burst_size}"), |b| {
            b.to_async(&rt).iter(|| {
                let scheduler = scheduler.clone();
                async move {
                    let mut futures: FuturesUnordered<_> = (0..burst_size)
                        .map(|_| scheduler.submit(messages(1), RequestSpec::new()))
                        .collect();
                    while let Some(res) = futures.next().await {
                        let _ = black_box(res);
                    }
                }
            });
        });

        group.bench_function(format!("many_buckets/{burst_size}"), |b| {
            b.to_async(&rt).iter(|| {
                let scheduler = scheduler.clone();
                async move {
                    let mut futures: FuturesUnordered<_> = (0..burst_size)
                        .map(|channel| scheduler.submit(messages(channel), RequestSpec::new()))
                        .collect();
                    while let Some(res) = futures.next().await {
                        let _ = black_box(res);
                    }
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_submit);
criterion_main!(benches);
