use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use thiserror::Error;

use crate::engine::EngineConfig;
use crate::limits::{DEFAULT_HOLD_TTL_SECS, MAX_HOLD_TTL_SECS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum HoldStoreKind {
    /// In-process holds. Only correct with a single engine instance.
    Memory,
    /// Shared Redis / KeyDB holds. Needs the `redis` feature.
    Redis,
}

/// Server configuration. Every flag can also come from its `SLOTGUARD_*`
/// environment variable.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Interview-slot reservation engine", long_about = None)]
pub struct Config {
    #[arg(long, env = "SLOTGUARD_BIND", default_value = "0.0.0.0")]
    pub bind: String,

    #[arg(long, env = "SLOTGUARD_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Directory holding the ledger log.
    #[arg(long, env = "SLOTGUARD_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    #[arg(long, env = "SLOTGUARD_HOLD_TTL_SECS", default_value_t = DEFAULT_HOLD_TTL_SECS)]
    pub hold_ttl_secs: u64,

    /// Claims waiting longer than this on the hold store report an unknown outcome.
    #[arg(long, env = "SLOTGUARD_CLAIM_TIMEOUT_MS", default_value_t = 2000)]
    pub claim_timeout_ms: u64,

    #[arg(long, env = "SLOTGUARD_RECONCILE_INTERVAL_SECS", default_value_t = 60)]
    pub reconcile_interval_secs: u64,

    #[arg(long, env = "SLOTGUARD_SWEEP_INTERVAL_SECS", default_value_t = 5)]
    pub sweep_interval_secs: u64,

    /// Ledger appends since the last compaction that trigger a rewrite.
    #[arg(long, env = "SLOTGUARD_COMPACT_THRESHOLD", default_value_t = 1000)]
    pub compact_threshold: u64,

    #[arg(long, env = "SLOTGUARD_HOLD_STORE", value_enum, default_value_t = HoldStoreKind::Memory)]
    pub hold_store: HoldStoreKind,

    #[arg(long, env = "SLOTGUARD_REDIS_URL")]
    pub redis_url: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("hold TTL must be between 1 and {MAX_HOLD_TTL_SECS} seconds, got {0}")]
    HoldTtl(u64),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("--hold-store redis requires --redis-url")]
    MissingRedisUrl,
    #[error("--hold-store redis requires building with the `redis` feature")]
    RedisNotCompiled,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hold_ttl_secs == 0 || self.hold_ttl_secs > MAX_HOLD_TTL_SECS {
            return Err(ConfigError::HoldTtl(self.hold_ttl_secs));
        }
        for (name, value) in [
            ("claim timeout", self.claim_timeout_ms),
            ("reconcile interval", self.reconcile_interval_secs),
            ("sweep interval", self.sweep_interval_secs),
            ("compact threshold", self.compact_threshold),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.hold_store == HoldStoreKind::Redis {
            if !cfg!(feature = "redis") {
                return Err(ConfigError::RedisNotCompiled);
            }
            if self.redis_url.as_deref().is_none_or(str::is_empty) {
                return Err(ConfigError::MissingRedisUrl);
            }
        }
        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            hold_ttl_secs: self.hold_ttl_secs,
            claim_timeout: Duration::from_millis(self.claim_timeout_ms),
        }
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join("ledger.log")
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}
