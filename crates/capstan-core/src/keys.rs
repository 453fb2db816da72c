//! Reserved state-bag metadata keys.
//!
//! These keys are populated by the kernel on `init` and maintained across
//! every sync; user deltas may read them but the kernel owns their
//! lifecycle. `__next_node` is a consumed-on-read control signal.

pub const SEGMENT_TO_RUN: &str = "segment_to_run";
pub const LOOP_COUNTER: &str = "loop_counter";
pub const STATE_HISTORY: &str = "state_history";
pub const MAX_LOOP_ITERATIONS: &str = "max_loop_iterations";
pub const MAX_BRANCH_ITERATIONS: &str = "max_branch_iterations";
pub const DISTRIBUTED_MODE: &str = "distributed_mode";
pub const DISTRIBUTED_STRATEGY: &str = "distributed_strategy";
pub const MAX_CONCURRENCY: &str = "max_concurrency";
pub const NEXT_NODE: &str = "__next_node";
pub const SELF_HEALING_METADATA: &str = "_self_healing_metadata";
pub const CURRENT_MANIFEST_ID: &str = "current_manifest_id";
pub const BRANCH_ERRORS: &str = "_branch_errors";

/// All keys the kernel seeds on `init`.
pub const RESERVED: &[&str] = &[
    SEGMENT_TO_RUN,
    LOOP_COUNTER,
    STATE_HISTORY,
    MAX_LOOP_ITERATIONS,
    MAX_BRANCH_ITERATIONS,
    DISTRIBUTED_MODE,
    DISTRIBUTED_STRATEGY,
    MAX_CONCURRENCY,
];
