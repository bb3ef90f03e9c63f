//! End-to-end round-trip benchmark for the gateway.
//!
//! Runs the full pipeline in-process: N origin clients issue READs against
//! a memory target while one observer receives a notification stream.

use futures_util::future::join_all;
use gateway_protocol::{Operation, Request};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tenvis_gateway_core::{CommunicationManager, ManagerConfig};
use tenvis_gateway_plugin::{MemoryOrigin, MemoryTarget};

const WARMUP_SECS: u64 = 1;
const BENCH_SECS: u64 = 5;
const WAIT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args: Vec<String> = std::env::args().collect();
    let num_clients: usize = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║           Gateway End-to-End Round-Trip Benchmark            ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    let manager = CommunicationManager::new(ManagerConfig::default());
    let target = Arc::new(MemoryTarget::new("coap"));
    target.insert("dev", "/temp", vec![0u8; 64]);
    manager.register(target.clone())?;

    let origins: Vec<_> = (0..num_clients)
        .map(|i| Arc::new(MemoryOrigin::new(format!("client-{i}"))))
        .collect();
    for origin in &origins {
        manager.register(origin.clone())?;
    }
    let observer = Arc::new(MemoryOrigin::new("observer"));
    manager.register(observer.clone())?;
    manager.start().await?;

    observer
        .request(Request::new(Operation::Observe, "/coap/dev/temp"))
        .await?
        .wait(WAIT)
        .await?;

    println!("Round trips: {} clients", num_clients);
    println!("   Warmup: {}s, Measurement: {}s", WARMUP_SECS, BENCH_SECS);
    println!();

    let completed = Arc::new(AtomicU64::new(0));
    let failed = Arc::new(AtomicU64::new(0));
    let running = Arc::new(AtomicBool::new(true));

    let clients = origins.iter().map(|origin| {
        let origin = origin.clone();
        let completed = completed.clone();
        let failed = failed.clone();
        let running = running.clone();
        tokio::spawn(async move {
            while running.load(Ordering::Relaxed) {
                let request = Request::new(Operation::Read, "/coap/dev/temp");
                let outcome = match origin.request(request).await {
                    Ok(pending) => pending.wait(WAIT).await.map(|_| ()),
                    Err(e) => Err(e),
                };
                match outcome {
                    Ok(()) => completed.fetch_add(1, Ordering::Relaxed),
                    Err(_) => failed.fetch_add(1, Ordering::Relaxed),
                };
            }
        })
    });
    let clients: Vec<_> = clients.collect();

    let notifier = {
        let target = target.clone();
        let running = running.clone();
        tokio::spawn(async move {
            let mut value = 0u64;
            while running.load(Ordering::Relaxed) {
                value += 1;
                if target
                    .notify("dev", "/temp", value.to_string().into_bytes())
                    .await
                    .is_err()
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
    };

    println!("Warming up for {}s...", WARMUP_SECS);
    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    completed.store(0, Ordering::SeqCst);
    let pushed_before = observer.pushed_count();
    let start = Instant::now();

    println!("Measuring for {}s...", BENCH_SECS);
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed();
    let total = completed.load(Ordering::SeqCst);
    let pushed = observer.pushed_count() - pushed_before;

    running.store(false, Ordering::SeqCst);
    join_all(clients).await;
    let _ = notifier.await;
    let stats = manager.stats();
    manager.stop().await?;

    let per_sec = total as f64 / elapsed.as_secs_f64();

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
        "║  Round trips:          {:>10}                           ║",
        total
    );
    println!(
        "║  Throughput:           {:>10.0} req/s                    ║",
        per_sec
    );
    println!(
        "║  Per-Client:           {:>10.0} req/s                    ║",
        per_sec / num_clients as f64
    );
    println!(
        "║  Notifications:        {:>10}                           ║",
        pushed
    );
    println!(
        "║  Failed:               {:>10}                           ║",
        failed.load(Ordering::SeqCst)
    );
    println!(
        "║  Faults:               {:>10}                           ║",
        stats.faults
    );
    println!("╚══════════════════════════════════════════════════════════════╝");

    Ok(())
}
