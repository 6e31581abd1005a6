/// Longest accepted slot id, in bytes.
pub const MAX_SLOT_ID_LEN: usize = 256;

/// Longest accepted candidate id, in bytes.
pub const MAX_CANDIDATE_ID_LEN: usize = 256;

/// Most alternative slot ids a single claim may carry.
pub const MAX_ALTERNATIVES: usize = 20;

/// Upper bound on a hold's TTL (24h).
pub const MAX_HOLD_TTL_SECS: u64 = 86_400;

/// Default hold TTL (15 minutes).
pub const DEFAULT_HOLD_TTL_SECS: u64 = 900;
