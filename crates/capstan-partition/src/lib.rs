//! The partitioner — slices a workflow DAG into ordered segments at
//! suspension boundaries and estimates execution volume for quota/ETA.

pub mod chunk;
pub mod partition;

pub use chunk::{plan_chunks, Chunk, DEFAULT_MAX_CHUNKS};
pub use partition::Partitioner;
