// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic cache-engine usage example.
//!
//! Demonstrates:
//! 1. Building an engine over the in-memory cluster and a slow origin
//! 2. Reading through each of the four strategies
//! 3. Write-through and write-behind writes
//! 4. Derived entries and dependency invalidation
//! 5. Rate limiting and a simulated cluster outage
//! 6. Stats and raw metrics
//! 7. Clean shutdown
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```
//!
//! Set `REDIS_URL` to run the same flow against a real Redis instead.

use std::sync::Arc;
use std::time::{Duration, Instant};

use cache_engine::{
    CacheEngine, CacheEngineConfig, CacheStore, InMemoryOrigin, InMemoryStore, ReadOptions, ReadStrategy,
    WriteMode,
};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install metrics recorder (captures everything the engine emits)
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           cache-engine: Basic Usage Example                   ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and start the engine
    // ─────────────────────────────────────────────────────────────────────────
    println!("📦 Configuring cache-engine...");

    let origin = Arc::new(
        InMemoryOrigin::with_records([
            ("alice", json!({"id": "alice", "name": "Alice", "plan": "pro"})),
            ("bob", json!({"id": "bob", "name": "Bob", "plan": "free"})),
            ("carol", json!({"id": "carol", "name": "Carol", "plan": "team"})),
        ])
        .with_latency(Duration::from_millis(80)),
    );

    let memory = Arc::new(InMemoryStore::new());
    let engine = match std::env::var("REDIS_URL") {
        Ok(url) => {
            let config = CacheEngineConfig {
                redis_url: Some(url),
                key_prefix: Some("demo:".into()),
                rate_max_tokens: 5,
                ..Default::default()
            };
            println!("   └─ Using Redis cluster");
            CacheEngine::connect(config, origin.clone()).await?
        }
        Err(_) => {
            let config = CacheEngineConfig {
                rate_max_tokens: 5,
                ..Default::default()
            };
            println!("   └─ Using in-memory cluster");
            CacheEngine::new(config, memory.clone(), origin.clone())
        }
    };
    engine.start().await?;
    println!("   ✅ Engine state: {}", engine.state());

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Reads through every strategy
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📖 Reading 'alice' through each strategy (cold, then warm):");
    for strategy in ReadStrategy::ALL {
        engine.invalidate("alice").await?;
        let opts = ReadOptions::default().with_strategy(strategy);

        let started = Instant::now();
        engine.get("alice", &opts).await?;
        let cold = started.elapsed();

        let started = Instant::now();
        let record = engine.get("alice", &opts).await?;
        let warm = started.elapsed();

        println!(
            "   └─ {:<13} cold {:>7.2?}  warm {:>7.2?}  → {}",
            strategy.as_str(),
            cold,
            warm,
            record.map(|r| r["name"].to_string()).unwrap_or_default()
        );
    }

    let negative = ReadOptions::default().with_strategy(ReadStrategy::Negative);
    let before = origin.fetch_count();
    for _ in 0..3 {
        engine.get("mallory", &negative).await?;
    }
    println!(
        "   └─ 'mallory' (missing) read 3x with negative caching: {} origin fetch",
        origin.fetch_count() - before
    );

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Writes
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n✍️  Writing...");
    let outcome = engine
        .set("dave", &json!({"id": "dave", "name": "Dave", "plan": "free"}), WriteMode::WriteThrough)
        .await?;
    println!("   └─ write-through dave: {}", serde_json::to_string(&outcome)?);

    let outcome = engine
        .patch("bob", &json!({"plan": "pro"}), WriteMode::WriteBehind)
        .await?;
    println!("   └─ write-behind patch bob: {}", outcome.record);
    tokio::time::sleep(Duration::from_millis(300)).await;
    println!("   └─ origin now has bob as: {}", origin.record("bob").unwrap_or_default());

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Derived entries
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔗 Derived entries:");
    engine
        .put_derived("carol", "billing", "carol", &json!({"monthly": 49}), Duration::from_secs(300))
        .await?;
    println!("   └─ billing:carol = {:?}", engine.get_derived("billing", "carol").await);
    let outcome = engine
        .set("carol", &json!({"id": "carol", "name": "Carol", "plan": "free"}), WriteMode::WriteThrough)
        .await?;
    println!(
        "   └─ after writing carol: {} dependent(s) dropped, billing:carol = {:?}",
        outcome.dependents_invalidated,
        engine.get_derived("billing", "carol").await
    );

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Rate limiting and outage
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🚦 Rate limiting (5 per minute):");
    for i in 1..=7 {
        match engine.admit("10.0.0.1").await {
            Ok(()) => println!("   └─ request {i}: admitted"),
            Err(e) => println!(
                "   └─ request {i}: {} (HTTP {}, retry after {:?}s)",
                e,
                e.http_status_code(),
                e.retry_after_secs()
            ),
        }
    }

    if engine.config().redis_url.is_none() {
        println!("\n💥 Simulating a cluster outage...");
        memory.set_unavailable(true);
        let opts = ReadOptions::default().with_strategy(ReadStrategy::Singleflight);
        for _ in 0..6 {
            engine.get("alice", &opts).await?;
        }
        println!("   └─ reads still served from origin, circuit: {}", engine.breaker().state());
        match engine.set("erin", &json!({"id": "erin"}), WriteMode::WriteBehind).await {
            Ok(_) => println!("   └─ write-behind unexpectedly accepted"),
            Err(e) => println!("   └─ write-behind refused: {e}"),
        }
        memory.set_unavailable(false);
        println!("   └─ cluster back, {} keys live", memory.len());
        println!("   └─ sample key present: {}", memory.get(&engine.key_for("dave")).await?.is_some());
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Stats and metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📊 Stats:");
    let stats = engine.stats().await;
    println!("{}", serde_json::to_string_pretty(&stats)?);

    let version = engine.invalidate_all().await;
    println!("\n♻️  invalidate_all → cache version {version}");

    println!("\n📈 Raw metrics:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 7. Clean shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    engine.shutdown().await;
    println!("   ✅ Shutdown complete! State: {}", engine.state());

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

/// Dump all captured metrics grouped by kind
fn dump_metrics(snapshotter: &Snapshotter) {
    let snapshot = snapshotter.snapshot();

    let mut counters: Vec<_> = vec![];
    let mut gauges: Vec<_> = vec![];
    let mut histograms: Vec<_> = vec![];

    for (composite_key, _, _, value) in snapshot.into_vec() {
        let (_, key) = composite_key.into_parts();
        let name = key.name().to_string();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() {
            String::new()
        } else {
            format!("{{{}}}", labels.join(","))
        };

        match value {
            DebugValue::Counter(v) => counters.push((name, label_str, v)),
            DebugValue::Gauge(v) => gauges.push((name, label_str, v.into_inner())),
            DebugValue::Histogram(samples) => {
                let count = samples.len();
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                histograms.push((name, label_str, count, sum));
            }
        }
    }

    counters.sort();
    gauges.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    histograms.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

    if !counters.is_empty() {
        println!("   ┌─ Counters");
        for (name, labels, value) in &counters {
            println!("   │  └─ {}{} = {}", name, labels, value);
        }
    }
    if !gauges.is_empty() {
        println!("   ├─ Gauges");
        for (name, labels, value) in &gauges {
            println!("   │  └─ {}{} = {:.2}", name, labels, value);
        }
    }
    if !histograms.is_empty() {
        println!("   └─ Histograms");
        for (name, labels, count, sum) in &histograms {
            let avg = if *count > 0 { sum / *count as f64 } else { 0.0 };
            println!("      └─ {}{} count={} avg={:.4}", name, labels, count, avg);
        }
    }
    if counters.is_empty() && gauges.is_empty() && histograms.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
}
