//! Chunk planning for extreme-length workflows.
//!
//! External orchestrators cap event history; a partition whose estimate
//! crosses the threshold is split into chunks that run as sub-executions,
//! each chunk's final state seeding the next.

use capstan_core::{Error, PartitionMap, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_CHUNKS: usize = 10;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_index: usize,
    pub start_segment: u32,
    /// Inclusive.
    pub end_segment: u32,
    pub segment_count: usize,
    pub is_first_chunk: bool,
    pub is_last_chunk: bool,
}

/// Slice a partition into chunks of `chunk_size` segments. When the
/// partition is so long that `chunk_size` would produce more than
/// `max_chunks` chunks, the chunk size grows instead — the chunk count
/// is the harder limit. Coverage is validated: the chunks must tile the
/// segment list exactly.
pub fn plan_chunks(
    partition: &PartitionMap,
    chunk_size: usize,
    max_chunks: usize,
) -> Result<Vec<Chunk>> {
    let total_segments = partition.total_segments();
    if total_segments == 0 {
        return Err(Error::Validation("cannot chunk an empty partition".into()));
    }
    if chunk_size == 0 {
        return Err(Error::Validation("chunk_size must be positive".into()));
    }

    let actual_chunk_size = chunk_size
        .max(total_segments.div_ceil(max_chunks.max(1)))
        .max(1);
    let total_chunks = total_segments.div_ceil(actual_chunk_size);

    let mut chunks = Vec::with_capacity(total_chunks);
    for chunk_index in 0..total_chunks {
        let start = chunk_index * actual_chunk_size;
        let end = ((chunk_index + 1) * actual_chunk_size).min(total_segments);
        chunks.push(Chunk {
            chunk_index,
            start_segment: start as u32,
            end_segment: (end - 1) as u32,
            segment_count: end - start,
            is_first_chunk: chunk_index == 0,
            is_last_chunk: chunk_index == total_chunks - 1,
        });
    }

    let covered: usize = chunks.iter().map(|c| c.segment_count).sum();
    if covered != total_segments {
        return Err(Error::Internal(format!(
            "chunk coverage mismatch: {covered} != {total_segments}"
        )));
    }
    Ok(chunks)
}
