use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use super::*;
use crate::holds::{MemoryHoldStore, StoreError};
use crate::observability::RecordingMetrics;

fn test_log_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("slotguard_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn engine_with(name: &str, holds: Arc<dyn HoldStore>) -> (ReservationEngine, Arc<RecordingMetrics>) {
    let ledger = Arc::new(Ledger::open(test_log_path(name)).unwrap());
    let metrics = Arc::new(RecordingMetrics::new());
    let config = EngineConfig {
        hold_ttl_secs: 900,
        claim_timeout: Duration::from_millis(200),
    };
    let engine = ReservationEngine::new(holds, ledger, metrics.clone(), config);
    (engine, metrics)
}

fn test_engine(name: &str) -> (ReservationEngine, Arc<RecordingMetrics>) {
    engine_with(name, Arc::new(MemoryHoldStore::new()))
}

fn expect_reserved(outcome: ClaimOutcome) -> Reservation {
    match outcome {
        ClaimOutcome::Reserved(r) => r,
        other => panic!("expected reservation, got {other:?}"),
    }
}

fn expect_conflict(outcome: ClaimOutcome) -> SlotConflict {
    match outcome {
        ClaimOutcome::Conflict(c) => c,
        other => panic!("expected conflict, got {other:?}"),
    }
}

/// Writes through to a real store, then sits on the reply while `stall` is set,
/// like a network partition after the server committed.
struct StallingStore {
    inner: MemoryHoldStore,
    stall: AtomicBool,
}

#[async_trait]
impl HoldStore for StallingStore {
    async fn claim(&self, claim: HoldClaim<'_>) -> Result<ClaimReply, StoreError> {
        let reply = self.inner.claim(claim).await?;
        if self.stall.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        Ok(reply)
    }

    async fn holder(&self, slot_id: &str) -> Result<Option<String>, StoreError> {
        self.inner.holder(slot_id).await
    }
}

struct DownStore;

#[async_trait]
impl HoldStore for DownStore {
    async fn claim(&self, _claim: HoldClaim<'_>) -> Result<ClaimReply, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn holder(&self, _slot_id: &str) -> Result<Option<String>, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
}

// ── Claim semantics ──────────────────────────────────────

#[tokio::test]
async fn example_scenario() {
    let (engine, metrics) = test_engine("example.log");

    let c1 = engine
        .claim(ClaimRequest::new("S1", "C1", 900).with_alternatives(["S2"]))
        .await
        .unwrap();
    assert!(c1.is_reserved());
    let reservation = expect_reserved(c1);
    assert_eq!(reservation.reservation_id(), "S1:C1");
    let ttl_ms = reservation.expires_at - reservation.created_at;
    assert!((900_000..=901_000).contains(&ttl_ms), "ttl_ms = {ttl_ms}");

    let c2 = engine.claim(engine.request("S1", "C2")).await.unwrap();
    assert!(!c2.is_reserved());
    let conflict = expect_conflict(c2);
    assert_eq!(conflict.holder, "C1");
    assert_eq!(conflict.alternatives, vec!["S2".to_string()]);

    assert_eq!(metrics.created(), 1);
    assert_eq!(metrics.conflicts(), 1);
    assert!(metrics.errors().is_empty());
}

#[tokio::test]
async fn same_candidate_reclaims_without_conflict() {
    let (engine, metrics) = test_engine("reclaim.log");

    let first = expect_reserved(engine.claim(engine.request("S1", "C1")).await.unwrap());
    let second = expect_reserved(engine.claim(engine.request("S1", "C1")).await.unwrap());

    assert_eq!(first.id, second.id);
    assert!(second.expires_at >= first.expires_at);
    assert_eq!(engine.reservations_for_slot("S1").len(), 1);
    assert_eq!(metrics.created(), 2);
    assert_eq!(metrics.conflicts(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_produce_exactly_one_holder() {
    let (engine, metrics) = test_engine("concurrent.log");
    let engine = Arc::new(engine);
    const N: usize = 50;

    let handles: Vec<_> = (0..N)
        .map(|i| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.claim(engine.request("hot", format!("C{i}"))).await.unwrap() })
        })
        .collect();
    let outcomes = futures::future::join_all(handles).await;

    let winners: Vec<Reservation> = outcomes
        .into_iter()
        .map(|o| o.unwrap())
        .filter_map(|o| match o {
            ClaimOutcome::Reserved(r) => Some(r),
            ClaimOutcome::Conflict(_) => None,
        })
        .collect();
    assert_eq!(winners.len(), 1);
    assert_eq!(metrics.created(), 1);
    assert_eq!(metrics.conflicts(), (N - 1) as u64);

    let holder = engine.current_holder("hot").await.unwrap().unwrap();
    assert_eq!(holder, winners[0].key.candidate_id);
    assert_eq!(engine.reservations_for_slot("hot").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn expired_hold_is_claimable_by_another_candidate() {
    let (engine, _metrics) = test_engine("ttl_expiry.log");

    expect_reserved(engine.claim(ClaimRequest::new("S1", "C1", 1)).await.unwrap());
    expect_conflict(engine.claim(ClaimRequest::new("S1", "C2", 1)).await.unwrap());

    tokio::time::advance(Duration::from_millis(1_100)).await;

    let r = expect_reserved(engine.claim(ClaimRequest::new("S1", "C2", 1)).await.unwrap());
    assert_eq!(r.reservation_id(), "S1:C2");
    // The first candidate's row lingers until reconciliation.
    assert_eq!(engine.reservations_for_slot("S1").len(), 2);
}

#[tokio::test]
async fn alternatives_reach_the_losing_claimant() {
    let (engine, _metrics) = test_engine("alternatives.log");

    engine
        .claim(engine.request("X", "A").with_alternatives(["Y", "Z"]))
        .await
        .unwrap();
    let conflict = expect_conflict(
        engine
            .claim(engine.request("X", "B").with_alternatives(["Q"]))
            .await
            .unwrap(),
    );
    assert_eq!(conflict.alternatives, vec!["Y".to_string(), "Z".to_string()]);

    // B's losing claim stored nothing.
    let again = expect_conflict(engine.claim(engine.request("X", "C")).await.unwrap());
    assert_eq!(again.alternatives, vec!["Y".to_string(), "Z".to_string()]);
}

#[tokio::test]
async fn winner_without_alternatives_yields_empty_list() {
    let (engine, _metrics) = test_engine("no_alternatives.log");

    engine.claim(engine.request("X", "A")).await.unwrap();
    let conflict = expect_conflict(engine.claim(engine.request("X", "B")).await.unwrap());
    assert!(conflict.alternatives.is_empty());
}

#[tokio::test]
async fn reclaim_replaces_alternatives() {
    let (engine, _metrics) = test_engine("reclaim_alternatives.log");

    engine.claim(engine.request("X", "A").with_alternatives(["Y"])).await.unwrap();
    engine.claim(engine.request("X", "A").with_alternatives(["W", "X", "W"])).await.unwrap();

    let conflict = expect_conflict(engine.claim(engine.request("X", "B")).await.unwrap());
    assert_eq!(conflict.alternatives, vec!["W".to_string()]);
}

#[tokio::test]
async fn invalid_request_touches_nothing() {
    let (engine, metrics) = test_engine("invalid.log");

    let err = engine.claim(ClaimRequest::new("", "C1", 900)).await.unwrap_err();
    match &err {
        ReservationError::Invalid(errors) => assert_eq!(errors[0].field, "slotId"),
        other => panic!("expected validation error, got {other:?}"),
    }
    assert!(!err.is_retryable());

    let err = engine.claim(ClaimRequest::new("S1", "C1", 0)).await.unwrap_err();
    assert!(matches!(err, ReservationError::Invalid(_)));

    assert!(engine.current_holder("S1").await.unwrap().is_none());
    assert!(engine.ledger().is_empty());
    assert_eq!(metrics.errors(), vec![ErrorReason::InvalidPayload, ErrorReason::InvalidPayload]);
    assert_eq!(metrics.created() + metrics.conflicts(), 0);
}

// ── Failure handling ─────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn timeout_is_unknown_and_retry_converges() {
    let store = Arc::new(StallingStore {
        inner: MemoryHoldStore::new(),
        stall: AtomicBool::new(true),
    });
    let (engine, metrics) = engine_with("timeout_retry.log", store.clone());

    let err = engine.claim(engine.request("S1", "C1")).await.unwrap_err();
    assert!(matches!(err, ReservationError::OutcomeUnknown { .. }));
    assert!(err.is_retryable());
    assert_eq!(metrics.errors(), vec![ErrorReason::OutcomeUnknown]);

    // The store committed before the reply was lost.
    assert_eq!(engine.current_holder("S1").await.unwrap().as_deref(), Some("C1"));
    assert!(engine.reservations_for_slot("S1").is_empty());

    store.stall.store(false, Ordering::SeqCst);
    let r = expect_reserved(engine.claim(engine.request("S1", "C1")).await.unwrap());
    assert_eq!(r.reservation_id(), "S1:C1");

    let conflict = expect_conflict(engine.claim(engine.request("S1", "C2")).await.unwrap());
    assert_eq!(conflict.holder, "C1");
    assert_eq!(engine.reservations_for_slot("S1").len(), 1);
}

#[tokio::test]
async fn store_failure_is_a_system_error() {
    let (engine, metrics) = engine_with("store_down.log", Arc::new(DownStore));

    let err = engine.claim(engine.request("S1", "C1")).await.unwrap_err();
    assert!(matches!(err, ReservationError::Store(StoreError::Unavailable(_))));
    assert_eq!(metrics.errors(), vec![ErrorReason::SystemError]);
    assert!(engine.ledger().is_empty());
}

// ── Reconciliation ───────────────────────────────────────

#[tokio::test]
async fn reconcile_purges_lapsed_reservations() {
    let (engine, metrics) = test_engine("engine_reconcile.log");

    engine.claim(ClaimRequest::new("S1", "C1", 1)).await.unwrap();
    engine.claim(ClaimRequest::new("S2", "C2", 900)).await.unwrap();

    let later = now_ms() + 5_000;
    assert_eq!(engine.reconcile(later).await.unwrap(), 1);
    assert_eq!(engine.reconcile(later).await.unwrap(), 0);

    assert!(engine.reservations_for_slot("S1").is_empty());
    assert_eq!(engine.reservations_for_slot("S2").len(), 1);
    assert_eq!(metrics.reconciled.load(Ordering::Relaxed), 1);
}

#[tokio::test(start_paused = true)]
async fn sweep_reports_expired_holds() {
    let (engine, metrics) = test_engine("sweep.log");

    engine.claim(ClaimRequest::new("S1", "C1", 1)).await.unwrap();
    engine.claim(ClaimRequest::new("S2", "C1", 900)).await.unwrap();
    tokio::time::advance(Duration::from_secs(2)).await;

    assert_eq!(engine.sweep_holds().await.unwrap(), 1);
    assert_eq!(metrics.swept.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn failed_reconcile_is_counted_and_retried() {
    let (engine, metrics) = test_engine("engine_reconcile_failure.log");

    engine.claim(ClaimRequest::new("S1", "C1", 1)).await.unwrap();
    engine.claim(ClaimRequest::new("S2", "C2", 900)).await.unwrap();
    let later = now_ms() + 5_000;

    engine.ledger().set_write_budget(Some(0)).await;
    assert!(engine.reconcile(later).await.is_err());
    assert_eq!(engine.ledger().len(), 2);
    assert_eq!(metrics.reconcile_failures.load(Ordering::Relaxed), 1);
    assert_eq!(metrics.reconciled.load(Ordering::Relaxed), 0);

    assert_eq!(engine.reconcile(later).await.unwrap(), 1);
    assert!(engine.reservations_for_slot("S1").is_empty());
    assert_eq!(engine.reservations_for_slot("S2").len(), 1);
    assert_eq!(metrics.reconcile_failures.load(Ordering::Relaxed), 1);
    assert_eq!(metrics.reconciled.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn ledger_failure_after_hold_counts_created_once() {
    let (engine, metrics) = test_engine("ledger_failure.log");

    engine.ledger().set_write_budget(Some(0)).await;
    let err = engine.claim(engine.request("S1", "C1")).await.unwrap_err();
    assert!(matches!(err, ReservationError::Ledger(_)));
    assert!(err.is_retryable());
    assert_eq!(metrics.created(), 1);
    assert_eq!(metrics.conflicts(), 0);
    assert_eq!(metrics.errors(), vec![ErrorReason::SystemError]);

    // The hold stands, so the retry re-claims and records the row.
    let r = expect_reserved(engine.claim(engine.request("S1", "C1")).await.unwrap());
    assert_eq!(r.reservation_id(), "S1:C1");
    assert_eq!(engine.reservations_for_slot("S1").len(), 1);
    assert_eq!(metrics.created(), 2);
}
