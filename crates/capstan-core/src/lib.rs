//! Core types for Capstan — the workflow execution data model.
//!
//! Everything the other crates agree on lives here: the state-bag value
//! model, the workflow graph, segments, manifests, execution records,
//! the error enum, and configuration.

pub mod config;
pub mod error;
pub mod execution;
pub mod keys;
pub mod manifest;
pub mod segment;
pub mod value;
pub mod workflow;

pub use config::CoreConfig;
pub use error::{Error, Result};
pub use execution::{ExecutionRecord, ExecutionStatus, IdempotencyRecord, TaskTokenRecord};
pub use manifest::{block_key, manifest_key, new_manifest_id, Manifest};
pub use segment::{ExitBoundary, LoopAnalysis, LoopInfo, PartitionMap, Segment, SegmentType};
pub use value::{BlockPointer, StateBag, Value};
pub use workflow::{Edge, EdgeType, Node, NodeType, Ring, WorkflowDefinition};
