use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::engine::ReservationEngine;
use crate::model::now_ms;

/// Cleanup Reconciler loop: purge lapsed ledger rows every `every`.
/// A failed pass is logged by the engine and simply retried next tick.
pub async fn run_reconciler(engine: Arc<ReservationEngine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if let Err(e) = engine.reconcile(now_ms()).await {
            debug!("reconcile pass failed, retrying next tick: {e}");
        }
    }
}

/// Drop expired holds from stores that keep them around after expiry.
pub async fn run_hold_sweeper(engine: Arc<ReservationEngine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if let Err(e) = engine.sweep_holds().await {
            debug!("hold sweep skipped: {e}");
        }
    }
}

/// Compact the ledger log once enough appends have piled up since the last
/// compaction.
pub async fn run_compactor(engine: Arc<ReservationEngine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let appends = engine.ledger().appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.ledger().compact().await {
            Ok(()) => info!(appends, rows = engine.ledger().len(), "compacted ledger log"),
            Err(e) => warn!("ledger compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::holds::MemoryHoldStore;
    use crate::ledger::Ledger;
    use crate::model::ClaimRequest;
    use crate::observability::RecordingMetrics;
    use std::path::PathBuf;
    use std::sync::atomic::Ordering;

    fn test_log_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotguard_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn engine(name: &str) -> (Arc<ReservationEngine>, Arc<RecordingMetrics>) {
        let ledger = Arc::new(Ledger::open(test_log_path(name)).unwrap());
        let metrics = Arc::new(RecordingMetrics::new());
        let engine = ReservationEngine::new(
            Arc::new(MemoryHoldStore::new()),
            ledger,
            metrics.clone(),
            EngineConfig::default(),
        );
        (Arc::new(engine), metrics)
    }

    #[tokio::test]
    async fn reconciler_purges_on_its_first_tick() {
        let (engine, metrics) = engine("reconciler_tick.log");

        // The loop reconciles against the wall clock, so let a 1s hold lapse.
        engine.claim(ClaimRequest::new("S1", "C1", 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_100)).await;

        let task = tokio::spawn(run_reconciler(engine.clone(), Duration::from_secs(60)));
        for _ in 0..50 {
            if engine.ledger().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        task.abort();

        assert!(engine.ledger().is_empty());
        assert_eq!(metrics.reconciled.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn reconciler_keeps_running_after_a_failed_pass() {
        let (engine, metrics) = engine("reconciler_failure.log");

        engine.claim(ClaimRequest::new("S1", "C1", 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_100)).await;

        engine.ledger().set_write_budget(Some(0)).await;
        let task = tokio::spawn(run_reconciler(engine.clone(), Duration::from_millis(50)));
        for _ in 0..100 {
            if engine.ledger().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        task.abort();

        assert!(engine.ledger().is_empty());
        assert_eq!(metrics.reconcile_failures.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.reconciled.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn compactor_rewrites_log_past_threshold() {
        let (engine, _metrics) = engine("compactor.log");

        for i in 0..5 {
            engine.claim(ClaimRequest::new("S1", format!("C{i}"), 900)).await.unwrap();
        }
        assert_eq!(engine.ledger().appends_since_compact().await, 1);

        for _ in 0..5 {
            engine.claim(ClaimRequest::new("S2", "C1", 900)).await.unwrap();
        }
        assert_eq!(engine.ledger().appends_since_compact().await, 6);

        let task = tokio::spawn(run_compactor(engine.clone(), 5));
        for _ in 0..50 {
            if engine.ledger().appends_since_compact().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        task.abort();

        assert_eq!(engine.ledger().appends_since_compact().await, 0);
        assert_eq!(engine.ledger().len(), 2);
    }
}
