//! Runtime configuration.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Preferred bucket env var, plus the legacy name older deployments used.
/// Setting both to different values is rejected at startup — the state
/// store must never be ambiguous.
pub const STATE_BUCKET_ENV: &str = "CAPSTAN_STATE_BUCKET";
pub const STATE_BUCKET_ENV_LEGACY: &str = "STATE_STORAGE_BUCKET";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Bucket (or filesystem namespace) holding blocks and manifests.
    pub state_bucket: String,
    /// States serialized at or under this size stay inline (bytes).
    #[serde(default = "default_inline_threshold")]
    pub inline_threshold_bytes: usize,
    /// Hard cap on loop iterations regardless of workflow config.
    #[serde(default = "default_global_loop_cap")]
    pub global_loop_cap: u32,
    /// Per-execution default when the workflow does not configure one.
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: u32,
    #[serde(default = "default_max_branch_iterations")]
    pub max_branch_iterations: u32,
    /// Bounded length of the `state_history` append log.
    #[serde(default = "default_state_history_limit")]
    pub state_history_limit: usize,
    /// Distributed-map children in flight at once.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Segments per chunk when a partition exceeds the chunk threshold.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Estimated executions above which the partition is chunked.
    #[serde(default = "default_chunk_threshold")]
    pub chunk_threshold: u64,
    /// Idempotency record TTL.
    #[serde(default = "default_execution_ttl_hours")]
    pub execution_ttl_hours: u64,
    /// Per-execution self-heal budget (circuit breaker).
    #[serde(default = "default_max_heal_attempts")]
    pub max_heal_attempts: u32,
}

fn default_inline_threshold() -> usize {
    200 * 1024
}
fn default_global_loop_cap() -> u32 {
    100
}
fn default_max_loop_iterations() -> u32 {
    10
}
fn default_max_branch_iterations() -> u32 {
    10
}
fn default_state_history_limit() -> usize {
    200
}
fn default_max_concurrency() -> usize {
    5
}
fn default_chunk_size() -> usize {
    50
}
fn default_chunk_threshold() -> u64 {
    100
}
fn default_execution_ttl_hours() -> u64 {
    24
}
fn default_max_heal_attempts() -> u32 {
    3
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            state_bucket: "capstan-state-dev".to_string(),
            inline_threshold_bytes: default_inline_threshold(),
            global_loop_cap: default_global_loop_cap(),
            max_loop_iterations: default_max_loop_iterations(),
            max_branch_iterations: default_max_branch_iterations(),
            state_history_limit: default_state_history_limit(),
            max_concurrency: default_max_concurrency(),
            chunk_size: default_chunk_size(),
            chunk_threshold: default_chunk_threshold(),
            execution_ttl_hours: default_execution_ttl_hours(),
            max_heal_attempts: default_max_heal_attempts(),
        }
    }
}

impl CoreConfig {
    /// Resolve from the environment, failing fast on a missing or
    /// ambiguous state bucket.
    pub fn from_env() -> Result<Self> {
        let bucket = resolve_state_bucket(
            std::env::var(STATE_BUCKET_ENV).ok(),
            std::env::var(STATE_BUCKET_ENV_LEGACY).ok(),
        )?;
        Ok(Self {
            state_bucket: bucket,
            ..Self::default()
        })
    }
}

/// Bucket name resolution. Exactly one source must win: if both env vars
/// are set they must agree, and at least one must be present.
pub fn resolve_state_bucket(
    preferred: Option<String>,
    legacy: Option<String>,
) -> Result<String> {
    match (preferred, legacy) {
        (Some(a), Some(b)) if a != b => Err(Error::Config(format!(
            "ambiguous state bucket: {STATE_BUCKET_ENV}={a} but {STATE_BUCKET_ENV_LEGACY}={b}"
        ))),
        (Some(a), _) => Ok(a),
        (None, Some(b)) => Ok(b),
        (None, None) => Err(Error::Config(format!(
            "no state bucket configured: set {STATE_BUCKET_ENV} (or legacy {STATE_BUCKET_ENV_LEGACY})"
        ))),
    }
}
