//! Redis / KeyDB hold store.
//!
//! The claim runs as a Lua script, so the read of `slot:<id>` and the
//! conditional writes of `slot:<id>` and `alt:<id>` execute as one command on
//! the server. Multiple engine instances can share one store.

use async_trait::async_trait;
use fred::clients::Pool;
use fred::interfaces::{ClientLike, KeysInterface, LuaInterface};
use fred::types::Builder;
use fred::types::config::{Config, ReconnectPolicy};
use tracing::info;

use super::{ClaimReply, HoldClaim, HoldStore, StoreError, alternatives_key, hold_key};

/// KEYS: hold key, alternatives key.
/// ARGV: candidate id, ttl seconds, alternatives as a JSON array.
/// Returns `{"claimed"}` or `{"conflict", holder, alternatives_json}`.
const CLAIM_SCRIPT: &str = r#"
    local holder = redis.call('GET', KEYS[1])
    if (not holder) or holder == ARGV[1] then
        redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[2])
        redis.call('SET', KEYS[2], ARGV[3], 'EX', ARGV[2])
        return {'claimed'}
    end
    local alts = redis.call('GET', KEYS[2])
    if not alts then
        alts = '[]'
    end
    return {'conflict', holder, alts}
"#;

const POOL_SIZE: usize = 4;

pub struct RedisHoldStore {
    pool: Pool,
}

fn unavailable(e: fred::error::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

impl RedisHoldStore {
    /// Connect a pool to `url` (`redis://` or `rediss://`) and verify it with PING.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let config = Config::from_url(url).map_err(unavailable)?;
        let mut builder = Builder::from_config(config);
        builder.set_policy(ReconnectPolicy::new_exponential(0, 100, 30_000, 2));
        let pool = builder.build_pool(POOL_SIZE).map_err(unavailable)?;
        pool.init().await.map_err(unavailable)?;
        let _: String = pool.ping(None).await.map_err(unavailable)?;
        info!(pool_size = POOL_SIZE, "redis hold store connected");
        Ok(Self { pool })
    }
}

/// Decode the script's reply.
fn parse_reply(reply: Vec<String>) -> Result<ClaimReply, StoreError> {
    match reply.as_slice() {
        [status] if status == "claimed" => Ok(ClaimReply::Claimed),
        [status, holder, alts] if status == "conflict" => {
            let alternatives: Vec<String> = serde_json::from_str(alts)
                .map_err(|e| StoreError::Protocol(format!("bad alternatives payload: {e}")))?;
            Ok(ClaimReply::Conflict {
                holder: holder.clone(),
                alternatives,
            })
        }
        other => Err(StoreError::Protocol(format!("{other:?}"))),
    }
}

#[async_trait]
impl HoldStore for RedisHoldStore {
    async fn claim(&self, claim: HoldClaim<'_>) -> Result<ClaimReply, StoreError> {
        let alternatives = serde_json::to_string(claim.alternatives)
            .map_err(|e| StoreError::Protocol(e.to_string()))?;
        let reply: Vec<String> = self
            .pool
            .eval(
                CLAIM_SCRIPT,
                vec![hold_key(claim.slot_id), alternatives_key(claim.slot_id)],
                vec![
                    claim.candidate_id.to_string(),
                    claim.ttl_secs.to_string(),
                    alternatives,
                ],
            )
            .await
            .map_err(unavailable)?;
        parse_reply(reply)
    }

    async fn holder(&self, slot_id: &str) -> Result<Option<String>, StoreError> {
        self.pool.get(hold_key(slot_id)).await.map_err(unavailable)
    }
}
