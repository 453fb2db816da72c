//! The state kernel — the single pipe every state transition flows
//! through.
//!
//! Init, sync, and aggregate all enter through [`StateKernel::sync`];
//! nothing else writes blocks or manifests. The kernel merges, offloads
//! oversized subtrees to the blob store behind pointers, commits in two
//! phases, and enqueues orphaned blocks for garbage collection.

pub mod hydrate;
pub mod kernel;
pub mod merge;
pub mod offload;

pub use kernel::{StateKernel, SyncContext, SyncOutcome, SyncStatus};
pub use merge::{BranchDelta, ReducerKind, SyncDelta};
