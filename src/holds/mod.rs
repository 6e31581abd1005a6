//! Fast Hold Store: short-lived "who holds this slot" entries.
//!
//! The check-and-set in [`HoldStore::claim`] must be indivisible inside the
//! store itself. Callers never lock around it.

mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use memory::MemoryHoldStore;
#[cfg(feature = "redis")]
pub use redis::RedisHoldStore;

use async_trait::async_trait;
use thiserror::Error;

/// Key of the holder entry for a slot.
pub fn hold_key(slot_id: &str) -> String {
    format!("slot:{slot_id}")
}

/// Key of the alternative-slot list for a slot.
pub fn alternatives_key(slot_id: &str) -> String {
    format!("alt:{slot_id}")
}

/// One atomic claim attempt.
#[derive(Debug, Clone, Copy)]
pub struct HoldClaim<'a> {
    pub slot_id: &'a str,
    pub candidate_id: &'a str,
    pub ttl_secs: u64,
    pub alternatives: &'a [String],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimReply {
    /// Hold written (fresh or refreshed by the same candidate).
    Claimed,
    /// Someone else holds the slot. Nothing was written.
    Conflict { holder: String, alternatives: Vec<String> },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("hold store unavailable: {0}")]
    Unavailable(String),

    #[error("unexpected hold store reply: {0}")]
    Protocol(String),
}

#[async_trait]
pub trait HoldStore: Send + Sync {
    /// Read the current hold and write `candidate_id` with a fresh TTL if the
    /// slot is free or already held by the same candidate, as one indivisible
    /// step. On conflict, return the holder and its stored alternatives
    /// without mutating anything.
    async fn claim(&self, claim: HoldClaim<'_>) -> Result<ClaimReply, StoreError>;

    /// Current live holder, if any.
    async fn holder(&self, slot_id: &str) -> Result<Option<String>, StoreError>;

    /// Drop expired entries. Stores with native expiry have nothing to do.
    async fn sweep_expired(&self) -> Result<usize, StoreError> {
        Ok(0)
    }
}
