//! DripKit Smoke Harness
//!
//! Drives the offline cache engine end to end against an in-memory
//! network: installs the LocalDrip shell, verifies cache-first serving
//! and the offline navigation fallback, then forces a v1 → v2 rollover
//! with the skip-waiting directive. Prints a JSON summary and exits
//! non-zero on any failed check.

use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tracing::{error, info};
use url::Url;

use dripkit_cache::CacheStorage;
use dripkit_common::{init_logging, LogConfig};
use dripkit_fetch::Request;
use dripkit_sw::{ClientKind, ShellManifest, WorkerConfig, WorkerEvent, WorkerHost};
use dripkit_test::MemoryBackend;

const ORIGIN: &str = "https://localdrip.test";

const SHELL_PATHS: [&str; 6] = [
    "/",
    "/portal/consumer-demo",
    "/portal/consumer-demo/home",
    "/portal/consumer-demo/order",
    "/portal/consumer-demo/profile",
    "/manifest.json",
];

/// Pass/fail collector for the staged checks.
struct Checks {
    passed: u32,
    failures: Vec<String>,
}

impl Checks {
    fn new() -> Self {
        Self {
            passed: 0,
            failures: Vec::new(),
        }
    }

    fn check(&mut self, name: &str, ok: bool) {
        if ok {
            info!(check = name, "PASS");
            self.passed += 1;
        } else {
            error!(check = name, "FAIL");
            self.failures.push(name.to_string());
        }
    }
}

fn url(s: &str) -> Url {
    Url::parse(s).expect("static URL")
}

fn origin_url(path: &str) -> Url {
    url(&format!("{ORIGIN}{path}"))
}

#[tokio::main]
async fn main() {
    init_logging(LogConfig::default());
    info!("Starting DripKit smoke harness");
    let start = Instant::now();
    let mut checks = Checks::new();

    let backend = MemoryBackend::new();
    backend.route_ok(&format!("{ORIGIN}/sw.js"), "// dripkit worker v1").await;
    for path in SHELL_PATHS {
        backend
            .route_ok(&format!("{ORIGIN}{path}"), format!("shell:{path}"))
            .await;
    }
    backend.route_ok(&format!("{ORIGIN}/menu.css"), "menu styles").await;

    let storage = CacheStorage::new();
    let (host, mut events) = WorkerHost::new(storage.clone(), Arc::new(backend.clone()));

    // One open tab, uncontrolled until the first version activates.
    let tab = host
        .registry()
        .connect(origin_url("/"), ClientKind::Window)
        .await;

    // ---- v1: register, install, immediate takeover ----
    let v1 = WorkerConfig::new(ShellManifest::new("localdrip-v1", SHELL_PATHS));
    let registered = host
        .register(origin_url("/sw.js"), origin_url("/"), v1)
        .await;
    checks.check("v1 registers", matches!(&registered, Ok(r) if r.active.is_some()));
    checks.check(
        "v1 cache is the only cache",
        storage.keys().await == vec!["localdrip-v1"],
    );
    let shell_cache = storage.open("localdrip-v1").await;
    checks.check(
        "v1 shell fully cached",
        shell_cache.len().await == SHELL_PATHS.len(),
    );
    let controller = host.registry().get(tab.id).await.and_then(|c| c.controller);
    checks.check("open tab claimed by v1", controller.is_some());

    // ---- cache-first serving ----
    let before = backend.total_requests().await;
    let warm = host.handle_fetch(Request::get(origin_url("/"))).await;
    checks.check(
        "warm fetch served from cache",
        matches!(&warm, Ok(r) if r.from_cache),
    );
    checks.check(
        "warm fetch skipped the network",
        backend.total_requests().await == before,
    );

    let cold = host.handle_fetch(Request::get(origin_url("/menu.css"))).await;
    checks.check(
        "cold fetch hits the network",
        matches!(&cold, Ok(r) if !r.from_cache && r.ok()),
    );
    let warmed = host.handle_fetch(Request::get(origin_url("/menu.css"))).await;
    checks.check(
        "cold fetch populated the cache",
        matches!(&warmed, Ok(r) if r.from_cache),
    );

    // ---- offline behavior ----
    backend.set_offline(true);
    let nav = host
        .handle_fetch(Request::navigate(origin_url("/specials/today")))
        .await;
    checks.check(
        "offline navigation falls back to the shell root",
        matches!(&nav, Ok(r) if r.from_cache && r.text().ok().as_deref() == Some("shell:/")),
    );
    let subresource = host.handle_fetch(Request::get(origin_url("/latte.png"))).await;
    checks.check(
        "offline subresource propagates the failure",
        subresource.is_err(),
    );
    backend.set_offline(false);

    // ---- v2 rollover forced by the skip-waiting directive ----
    backend.route_ok(&format!("{ORIGIN}/sw.js"), "// dripkit worker v2").await;
    let v2 = WorkerConfig::new(ShellManifest::new("localdrip-v2", SHELL_PATHS))
        .wait_for_directive();
    let staged = host
        .register(origin_url("/sw.js"), origin_url("/"), v2)
        .await;
    checks.check(
        "v2 stages behind v1",
        matches!(&staged, Ok(r) if r.waiting.is_some() && r.active.is_some()),
    );
    let mut names = storage.keys().await;
    names.sort();
    checks.check(
        "both cache generations exist while v2 waits",
        names == vec!["localdrip-v1", "localdrip-v2"],
    );

    let directive = host
        .post_message(&origin_url("/"), json!({ "type": "SKIP_WAITING" }))
        .await;
    checks.check("skip-waiting directive recognized", matches!(directive, Ok(true)));
    checks.check(
        "v2 cache is the only cache after takeover",
        storage.keys().await == vec!["localdrip-v2"],
    );

    let registration = host.get_registration(&origin_url("/")).await;
    checks.check(
        "v2 controls the scope",
        matches!(&registration, Some(r) if r.active.is_some() && r.waiting.is_none()),
    );
    let controller = host.registry().get(tab.id).await.and_then(|c| c.controller);
    checks.check(
        "open tab moved to v2",
        controller.is_some() && controller == registration.and_then(|r| r.active),
    );

    let refetched = host.handle_fetch(Request::get(origin_url("/"))).await;
    checks.check(
        "shell served from the v2 cache",
        matches!(&refetched, Ok(r) if r.from_cache),
    );

    let mut controller_changes = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, WorkerEvent::ControllerChange { .. }) {
            controller_changes += 1;
        }
    }
    checks.check(
        "controller change announced per takeover",
        controller_changes == 2,
    );

    let summary = json!({
        "status": if checks.failures.is_empty() { "pass" } else { "fail" },
        "passed": checks.passed,
        "failed": checks.failures,
        "caches": storage.keys().await,
        "elapsed_ms": start.elapsed().as_millis(),
    });
    println!("{summary}");

    if !checks.failures.is_empty() {
        std::process::exit(1);
    }
}
