use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type the ledger stores.
pub type Ms = i64;

pub fn now_ms() -> Ms {
    Utc::now().timestamp_millis()
}

/// Render a ledger timestamp as UTC. Out-of-range values clamp to the epoch.
pub fn to_utc(ms: Ms) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Composite identity of a reservation row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReservationKey {
    pub slot_id: String,
    pub candidate_id: String,
}

impl ReservationKey {
    pub fn new(slot_id: impl Into<String>, candidate_id: impl Into<String>) -> Self {
        Self {
            slot_id: slot_id.into(),
            candidate_id: candidate_id.into(),
        }
    }

    /// Client-facing reservation id: `<slotId>:<candidateId>`.
    pub fn reservation_id(&self) -> String {
        format!("{}:{}", self.slot_id, self.candidate_id)
    }
}

/// A durable ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub key: ReservationKey,
    pub created_at: Ms,
    pub expires_at: Ms,
}

impl Reservation {
    pub fn reservation_id(&self) -> String {
        self.key.reservation_id()
    }

    /// Rows at or past `expires_at` are logically dead until reconciled.
    pub fn is_live(&self, now: Ms) -> bool {
        self.expires_at > now
    }

    /// Fold another record for the same key into this row. Commutative:
    /// earliest creation wins, latest expiry wins, the oldest id is kept.
    pub fn merge(&mut self, other: &Reservation) {
        debug_assert_eq!(self.key, other.key);
        if (other.created_at, other.id) < (self.created_at, self.id) {
            self.created_at = other.created_at;
            self.id = other.id;
        }
        self.expires_at = self.expires_at.max(other.expires_at);
    }
}

/// Ledger log record format. Flat, one record per durable change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEvent {
    Recorded(Reservation),
    /// One reconciliation pass. Each key is removed only if its row still
    /// carries the listed `expires_at`.
    Purged { at: Ms, rows: Vec<(ReservationKey, Ms)> },
}

/// Input to the claim operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRequest {
    pub slot_id: String,
    pub candidate_id: String,
    pub ttl_secs: u64,
    pub alternatives: Vec<String>,
}

impl ClaimRequest {
    pub fn new(slot_id: impl Into<String>, candidate_id: impl Into<String>, ttl_secs: u64) -> Self {
        Self {
            slot_id: slot_id.into(),
            candidate_id: candidate_id.into(),
            ttl_secs,
            alternatives: Vec::new(),
        }
    }

    pub fn with_alternatives<I, S>(mut self, alternatives: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.alternatives = alternatives.into_iter().map(Into::into).collect();
        self
    }
}

/// A losing claim: who holds the slot and what they proposed instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotConflict {
    pub slot_id: String,
    pub holder: String,
    pub alternatives: Vec<String>,
}

/// Business outcome of a claim. Timeouts are not an outcome; they surface
/// as `ReservationError::OutcomeUnknown`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Reserved(Reservation),
    Conflict(SlotConflict),
}

impl ClaimOutcome {
    pub fn is_reserved(&self) -> bool {
        matches!(self, ClaimOutcome::Reserved(_))
    }
}
