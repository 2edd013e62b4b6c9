//! Several limiters (one per simulated worker process) sharing one store
//! must never let more than the project limit run at once.

mod common;

use piecework::concurrency::{ConcurrencyLimiter, MemorySlotStore, SlotStore, SqliteSlotStore};
use piecework::storage::database::open_pool;
use proptest::prop_assert;
use proptest::prop_assert_eq;
use proptest::test_runner::{Config, TestRunner};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Run `jobs` acquire/hold/release cycles spread over `workers` limiters,
/// the limiters taking turns over `stores`; returns (peak concurrently held,
/// completed jobs)
async fn contend(stores: &[Arc<dyn SlotStore>], limit: u32, workers: usize, jobs: usize) -> (usize, usize) {
    let limiters: Vec<Arc<ConcurrencyLimiter>> = (0..workers)
        .map(|i| {
            let store = Arc::clone(&stores[i % stores.len()]);
            Arc::new(ConcurrencyLimiter::new(store, common::limiter_settings(limit)))
        })
        .collect();

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for job in 0..jobs {
        let limiter = Arc::clone(&limiters[job % workers]);
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        let completed = Arc::clone(&completed);
        handles.push(tokio::spawn(async move {
            let slot = limiter.acquire("acme").await.unwrap();
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            running.fetch_sub(1, Ordering::SeqCst);
            limiter.release(&slot).await.unwrap();
            completed.fetch_add(1, Ordering::SeqCst);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    (peak.load(Ordering::SeqCst), completed.load(Ordering::SeqCst))
}

#[test]
fn in_flight_never_exceeds_the_limit() {
    let mut runner = TestRunner::new(Config {
        cases: 24,
        ..Config::default()
    });

    runner
        .run(&(1u32..4, 1usize..5, 1usize..16), |(limit, workers, jobs)| {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(4)
                .enable_all()
                .build()
                .unwrap();
            let (peak, completed) = rt.block_on(async {
                let store: Arc<dyn SlotStore> = Arc::new(MemorySlotStore::new());
                contend(&[store], limit, workers, jobs).await
            });

            prop_assert!(peak <= limit as usize, "peak {} over limit {}", peak, limit);
            prop_assert_eq!(completed, jobs);
            Ok(())
        })
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sqlite_store_holds_the_limit_across_pools() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("locks.db");

    // Two pools on one file stand in for two worker processes
    let first = SqliteSlotStore::new(open_pool(&path).await.unwrap());
    first.init_schema().await.unwrap();
    let second = SqliteSlotStore::new(open_pool(&path).await.unwrap());
    second.set_project_limit("acme", 2).await.unwrap();

    let first: Arc<dyn SlotStore> = Arc::new(first);
    let second: Arc<dyn SlotStore> = Arc::new(second);

    let (peak, completed) = contend(&[first, second], 10, 4, 12).await;
    assert_eq!(completed, 12);
    assert!(peak <= 2, "peak {} over the project override", peak);
}
