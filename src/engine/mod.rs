mod alternatives;
mod error;
mod validate;
#[cfg(test)]
mod tests;

pub use error::{FieldError, ReservationError};

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::holds::{ClaimReply, HoldClaim, HoldStore};
use crate::ledger::{Ledger, LedgerError};
use crate::limits::DEFAULT_HOLD_TTL_SECS;
use crate::model::*;
use crate::observability::{ErrorReason, ReservationMetrics};

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// TTL applied to holds and alternative lists.
    pub hold_ttl_secs: u64,
    /// How long a claim may wait on the hold store before its outcome is
    /// reported as unknown.
    pub claim_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hold_ttl_secs: DEFAULT_HOLD_TTL_SECS,
            claim_timeout: Duration::from_secs(2),
        }
    }
}

/// The reservation core: claims go to the hold store, winners are recorded
/// in the ledger, and lapsed ledger rows are reconciled away.
pub struct ReservationEngine {
    holds: Arc<dyn HoldStore>,
    ledger: Arc<Ledger>,
    metrics: Arc<dyn ReservationMetrics>,
    config: EngineConfig,
}

impl ReservationEngine {
    pub fn new(
        holds: Arc<dyn HoldStore>,
        ledger: Arc<Ledger>,
        metrics: Arc<dyn ReservationMetrics>,
        config: EngineConfig,
    ) -> Self {
        Self {
            holds,
            ledger,
            metrics,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn metrics(&self) -> &Arc<dyn ReservationMetrics> {
        &self.metrics
    }

    /// A claim carrying the configured hold TTL.
    pub fn request(&self, slot_id: impl Into<String>, candidate_id: impl Into<String>) -> ClaimRequest {
        ClaimRequest::new(slot_id, candidate_id, self.config.hold_ttl_secs)
    }

    /// Atomic claim. On success the hold is written by the store and a ledger
    /// row is recorded afterwards; the two are separate systems, so a crash in
    /// between leaves a hold without a row until the candidate re-claims.
    pub async fn claim(&self, req: ClaimRequest) -> Result<ClaimOutcome, ReservationError> {
        if let Err(errors) = validate::validate_claim(&req) {
            self.metrics.reservation_error(ErrorReason::InvalidPayload);
            return Err(ReservationError::Invalid(errors));
        }
        let ClaimRequest {
            slot_id,
            candidate_id,
            ttl_secs,
            alternatives,
        } = req;
        let alternatives = alternatives::normalize(&slot_id, alternatives);

        let hold = HoldClaim {
            slot_id: &slot_id,
            candidate_id: &candidate_id,
            ttl_secs,
            alternatives: &alternatives,
        };
        let reply = match tokio::time::timeout(self.config.claim_timeout, self.holds.claim(hold)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                error!(%slot_id, %candidate_id, "hold store claim failed: {e}");
                self.metrics.reservation_error(ErrorReason::SystemError);
                return Err(e.into());
            }
            Err(_) => {
                warn!(%slot_id, %candidate_id, timeout = ?self.config.claim_timeout, "hold store claim timed out, outcome unknown");
                self.metrics.reservation_error(ErrorReason::OutcomeUnknown);
                return Err(ReservationError::OutcomeUnknown {
                    slot_id,
                    timeout: self.config.claim_timeout,
                });
            }
        };

        match reply {
            ClaimReply::Claimed => {
                // The hold is written, so the claim counts as created even if
                // recording it below fails.
                self.metrics.reservation_created();
                let now = now_ms();
                let expires_at = now.saturating_add((ttl_secs as Ms).saturating_mul(1000));
                let key = ReservationKey::new(slot_id, candidate_id);
                let reservation = match self.ledger.record(key, now, expires_at).await {
                    Ok(r) => r,
                    Err(e) => {
                        error!("ledger record failed after hold was written: {e}");
                        self.metrics.reservation_error(ErrorReason::SystemError);
                        return Err(e.into());
                    }
                };
                debug!(reservation_id = %reservation.reservation_id(), expires_at, "slot reserved");
                Ok(ClaimOutcome::Reserved(reservation))
            }
            ClaimReply::Conflict { holder, alternatives } => {
                debug!(%slot_id, %candidate_id, %holder, "slot conflict");
                self.metrics.reservation_conflict();
                Ok(ClaimOutcome::Conflict(SlotConflict {
                    slot_id,
                    holder,
                    alternatives,
                }))
            }
        }
    }

    /// Cleanup Reconciler pass: delete ledger rows with `expires_at < now`.
    pub async fn reconcile(&self, now: Ms) -> Result<usize, LedgerError> {
        match self.ledger.reconcile(now).await {
            Ok(deleted) => {
                if deleted > 0 {
                    info!(deleted, "reconciled expired reservations");
                } else {
                    debug!("reconcile: nothing expired");
                }
                self.metrics.reconciled(deleted);
                Ok(deleted)
            }
            Err(e) => {
                error!("reconciliation pass failed: {e}");
                self.metrics.reconcile_failed();
                Err(e)
            }
        }
    }

    /// Free memory held by expired holds. A no-op for stores with native expiry.
    pub async fn sweep_holds(&self) -> Result<usize, ReservationError> {
        let swept = self.holds.sweep_expired().await?;
        if swept > 0 {
            debug!(swept, "swept expired holds");
            self.metrics.holds_swept(swept);
        }
        Ok(swept)
    }

    pub async fn current_holder(&self, slot_id: &str) -> Result<Option<String>, ReservationError> {
        Ok(self.holds.holder(slot_id).await?)
    }

    /// Ledger rows for a slot, including dead rows not yet reconciled.
    pub fn reservations_for_slot(&self, slot_id: &str) -> Vec<Reservation> {
        self.ledger.rows_for_slot(slot_id)
    }
}
