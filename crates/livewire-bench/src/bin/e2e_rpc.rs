//! End-to-end RPC benchmark for Livewire.
//!
//! Runs many engines against one responder over an in-process hub and reports
//! completed calls per second. Settings come from `livewire.toml` if present.

use anyhow::Result;
use livewire_bench::{rpc_pair, wait_connected, CTRL_CHANNEL};
use livewire_core::{LiveConfig, RpcEngine, RpcError};
use livewire_transport::{MemoryHub, Principal};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Barrier;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const WARMUP_SECS: u64 = 1;
const BENCH_SECS: u64 = 5;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "livewire_core=info,livewire_transport=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = LiveConfig::load()?;
    livewire_core::metrics::describe_metrics();

    let args: Vec<String> = std::env::args().collect();
    let num_clients = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║            Livewire End-to-End RPC Benchmark                 ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    run_rpc_benchmark(&config, num_clients).await;
    Ok(())
}

async fn run_rpc_benchmark(config: &LiveConfig, num_clients: usize) {
    println!("📊 RPC Benchmark: {} clients", num_clients);
    println!(
        "   Timeout: {}ms, Max pending: {}",
        config.rpc.default_timeout_ms, config.rpc.max_pending
    );
    println!("   Warmup: {}s, Measurement: {}s", WARMUP_SECS, BENCH_SECS);
    println!();

    let hub = MemoryHub::new();
    let (_first, _responder) = rpc_pair(&hub, config.rpc_options()).await;

    let completed = Arc::new(AtomicU64::new(0));
    let failed = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(num_clients + 1));

    let mut handles = Vec::new();
    for client_id in 0..num_clients {
        let mut engine =
            RpcEngine::new(hub.transport(Principal::Anonymous), config.rpc_options());
        let completed = Arc::clone(&completed);
        let failed = Arc::clone(&failed);
        let barrier = Arc::clone(&barrier);

        handles.push(tokio::spawn(async move {
            engine.attach(CTRL_CHANNEL).await;
            wait_connected(engine.watch_status()).await;
            barrier.wait().await;
            run_client(client_id, &engine, &completed, &failed).await;
        }));
    }

    // Wait for all clients to connect
    barrier.wait().await;
    println!("✓ All {} clients connected", num_clients);

    println!("⏳ Warming up for {}s...", WARMUP_SECS);
    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    completed.store(0, Ordering::SeqCst);
    failed.store(0, Ordering::SeqCst);
    let start = Instant::now();

    println!("📈 Measuring for {}s...", BENCH_SECS);
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed();
    let total_calls = completed.load(Ordering::SeqCst);
    let total_failed = failed.load(Ordering::SeqCst);
    let calls_per_sec = total_calls as f64 / elapsed.as_secs_f64();

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                         RESULTS                              ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!(
        "║  Clients:              {:>10}                           ║",
        num_clients
    );
    println!(
        "║  Duration:             {:>10.2}s                          ║",
        elapsed.as_secs_f64()
    );
    println!(
        "║  Completed Calls:      {:>10}                           ║",
        total_calls
    );
    println!(
        "║  Failed Calls:         {:>10}                           ║",
        total_failed
    );
    println!(
        "║  Throughput:           {:>10.0} calls/s                  ║",
        calls_per_sec
    );
    println!("╚══════════════════════════════════════════════════════════════╝");

    for handle in handles {
        handle.abort();
    }
}

async fn run_client(
    client_id: usize,
    engine: &RpcEngine,
    completed: &AtomicU64,
    failed: &AtomicU64,
) {
    let mut seq = 0u64;
    loop {
        seq += 1;
        match engine
            .call::<_, Value>("echo", &(client_id, seq), None)
            .await
        {
            Ok(_) => {
                completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(RpcError::NotConnected { .. }) => break,
            Err(e) => {
                tracing::warn!(client = client_id, error = %e, "Call failed");
                failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        tokio::task::yield_now().await;
    }
}
