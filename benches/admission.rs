use criterion::{black_box, criterion_group, criterion_main, Criterion};
use gatekeep::{AdmissionLayer, IdentityMode, InMemoryStore, Limiter, LimiterConfig};
use http::{Request, Response};
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::{service_fn, Service, ServiceBuilder};

fn limiter(max: u32) -> Limiter<InMemoryStore> {
    let config = LimiterConfig::new(IdentityMode::IpOnly, max, Duration::from_secs(30)).unwrap();
    Limiter::new(config, Arc::new(InMemoryStore::new()))
}

// Every iteration uses a fresh address, so each decision takes the "unseen identity" path.
fn admission_unseen_identities(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let limiter = limiter(100);
    let next = AtomicU64::new(0);

    c.bench_function("admission_unseen_identity", |b| {
        b.to_async(&rt).iter(|| {
            let n = next.fetch_add(1, Ordering::Relaxed);
            let address = format!("10.{}.{}.{}", (n >> 16) & 0xff, (n >> 8) & 0xff, n & 0xff);
            let limiter = &limiter;
            async move {
                let _ = black_box(limiter.allow_request(black_box(&address), "").await);
            }
        });
    });
}

// One address hammered past its budget: measures the read-only blocked path.
fn admission_blocked_identity(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let limiter = limiter(1);
    rt.block_on(async {
        let _ = limiter.allow_request("10.0.0.1", "").await;
        let _ = limiter.allow_request("10.0.0.1", "").await;
    });

    c.bench_function("admission_blocked_identity", |b| {
        b.to_async(&rt).iter(|| async {
            let _ = black_box(limiter.allow_request(black_box("10.0.0.1"), "").await);
        });
    });
}

fn middleware_round_trip(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let svc = ServiceBuilder::new().layer(AdmissionLayer::new(limiter(u32::MAX))).service(
        service_fn(|_req: Request<()>| async { Ok::<_, Infallible>(Response::new(String::new())) }),
    );

    c.bench_function("middleware_admitted_request", |b| {
        b.to_async(&rt).iter(|| async {
            let mut local_svc = svc.clone();
            let req = Request::builder().header("x-real-ip", "10.0.0.1").body(()).unwrap();
            let _ = black_box(local_svc.call(req).await);
        });
    });
}

criterion_group!(benches, admission_unseen_identities, admission_blocked_identity, middleware_round_trip);
criterion_main!(benches);
