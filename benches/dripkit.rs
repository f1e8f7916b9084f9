//! DripKit offline cache engine benchmarks
//!
//! Run with: cargo bench -p dripkit-bench

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;
use url::Url;

use dripkit_bench::{populated_cache, route_shell, shell_manifest, ORIGIN};
use dripkit_cache::CacheStorage;
use dripkit_fetch::Request;
use dripkit_sw::{OfflineWorker, WorkerConfig, WorkerHost};
use dripkit_test::MemoryBackend;

fn bench_url(s: &str) -> Url {
    Url::parse(s).expect("bench URL")
}

fn cache_benchmarks(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let mut group = c.benchmark_group("cache");

    for entries in [16usize, 128, 1024] {
        group.throughput(Throughput::Elements(entries as u64));
        group.bench_with_input(BenchmarkId::new("populate", entries), &entries, |b, &n| {
            b.iter(|| {
                rt.block_on(async {
                    let storage = CacheStorage::new();
                    populated_cache(&storage, "bench-v1", n).await
                })
            })
        });
    }

    // Hit path against a warm cache.
    let storage = CacheStorage::new();
    let cache = rt.block_on(populated_cache(&storage, "bench-hot", 1024));
    let request = Request::get(bench_url(&format!("{ORIGIN}/assets/chunk-512.css")));
    group.bench_function("match_hit", |b| {
        b.iter(|| rt.block_on(cache.match_request(&request)))
    });

    group.finish();
}

fn install_benchmarks(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let mut group = c.benchmark_group("install");

    for entries in [8usize, 64, 256] {
        let backend = MemoryBackend::new();
        let manifest = shell_manifest("bench-v1", entries);
        rt.block_on(route_shell(&backend, &manifest));

        group.throughput(Throughput::Elements(entries as u64));
        group.bench_with_input(
            BenchmarkId::new("shell", entries),
            &manifest,
            |b, manifest| {
                b.iter(|| {
                    rt.block_on(async {
                        let storage = CacheStorage::new();
                        let (events, _rx) = tokio::sync::mpsc::unbounded_channel();
                        let mut worker = OfflineWorker::new(
                            bench_url(&format!("{ORIGIN}/")),
                            WorkerConfig::new(manifest.clone()),
                            storage,
                            Arc::new(backend.clone()),
                            events,
                        );
                        worker.on_install().await
                    })
                })
            },
        );
    }

    group.finish();
}

fn fetch_benchmarks(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let mut group = c.benchmark_group("fetch");

    let backend = MemoryBackend::new();
    let manifest = shell_manifest("bench-v1", 64);
    rt.block_on(route_shell(&backend, &manifest));

    let storage = CacheStorage::new();
    let (host, _events) = WorkerHost::new(storage, Arc::new(backend.clone()));
    rt.block_on(host.register(
        bench_url(&format!("{ORIGIN}/sw.js")),
        bench_url(&format!("{ORIGIN}/")),
        WorkerConfig::new(manifest),
    ))
    .expect("bench registration");

    let warm = bench_url(&format!("{ORIGIN}/assets/chunk-7.css"));
    group.bench_function("cache_first_hit", |b| {
        b.iter(|| rt.block_on(host.handle_fetch(Request::get(warm.clone()))))
    });

    rt.block_on(backend.route_ok("https://cdn.example/widget.js", "widget"));
    let passthrough = bench_url("https://cdn.example/widget.js");
    group.bench_function("cross_origin_passthrough", |b| {
        b.iter(|| rt.block_on(host.handle_fetch(Request::get(passthrough.clone()))))
    });

    group.finish();
}

criterion_group!(
    benches,
    cache_benchmarks,
    install_benchmarks,
    fetch_benchmarks,
);

criterion_main!(benches);
