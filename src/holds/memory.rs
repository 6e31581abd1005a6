use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;

use super::{ClaimReply, HoldClaim, HoldStore, StoreError};

#[derive(Debug, Clone)]
struct SlotHold {
    holder: String,
    alternatives: Vec<String>,
    expires_at: Instant,
}

impl SlotHold {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// In-process hold store for single-node deployments and tests.
///
/// A slot's holder and alternatives share one map entry, and the claim runs
/// under that entry's shard lock, so the check-and-set cannot interleave with
/// another claim on the same slot. Expired holds read as absent straight away;
/// `sweep_expired` reclaims their memory.
pub struct MemoryHoldStore {
    slots: DashMap<String, SlotHold>,
}

impl Default for MemoryHoldStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHoldStore {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }

    /// Entries still in memory, expired or not.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn claim_now(&self, claim: HoldClaim<'_>, now: Instant) -> ClaimReply {
        let fresh = SlotHold {
            holder: claim.candidate_id.to_string(),
            alternatives: claim.alternatives.to_vec(),
            expires_at: now + Duration::from_secs(claim.ttl_secs),
        };
        match self.slots.entry(claim.slot_id.to_string()) {
            Entry::Occupied(mut e) => {
                let current = e.get();
                if current.is_live(now) && current.holder != claim.candidate_id {
                    return ClaimReply::Conflict {
                        holder: current.holder.clone(),
                        alternatives: current.alternatives.clone(),
                    };
                }
                e.insert(fresh);
            }
            Entry::Vacant(e) => {
                e.insert(fresh);
            }
        }
        ClaimReply::Claimed
    }
}

#[async_trait]
impl HoldStore for MemoryHoldStore {
    async fn claim(&self, claim: HoldClaim<'_>) -> Result<ClaimReply, StoreError> {
        Ok(self.claim_now(claim, Instant::now()))
    }

    async fn holder(&self, slot_id: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        Ok(self
            .slots
            .get(slot_id)
            .filter(|h| h.is_live(now))
            .map(|h| h.holder.clone()))
    }

    async fn sweep_expired(&self) -> Result<usize, StoreError> {
        let now = Instant::now();
        let mut swept = 0;
        self.slots.retain(|_, h| {
            let live = h.is_live(now);
            if !live {
                swept += 1;
            }
            live
        });
        Ok(swept)
    }
}
