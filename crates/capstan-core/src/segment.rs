//! Segments — immutable slices of a workflow produced by the partitioner.

use crate::workflow::Edge;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentType {
    Normal,
    Hitp,
    Branch,
    Loop,
}

/// Why a segment ended where it did.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitBoundary {
    Hitp,
    BranchFanout,
    /// Back-edge to this loop header.
    LoopBackEdge { header: String },
    AsyncCallback,
    Terminal,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Segment {
    /// Dense, 0-based.
    pub segment_id: u32,
    pub segment_type: SegmentType,
    /// Node ids in execution order (topological within the segment).
    pub nodes: Vec<String>,
    /// Edges internal to the segment.
    pub edges: Vec<Edge>,
    pub entry_node: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_boundary: Option<ExitBoundary>,
}

impl Segment {
    /// Terminal means the workflow ends after this segment. A plain cut
    /// (`exit_boundary: None`) just hands off to the next segment.
    pub fn is_terminal(&self) -> bool {
        matches!(self.exit_boundary, Some(ExitBoundary::Terminal))
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LoopInfo {
    pub header: String,
    pub body_segments: u32,
    pub configured_max: u32,
    /// `min(configured_max, global cap)`.
    pub effective_max: u32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LoopAnalysis {
    pub loops: Vec<LoopInfo>,
    pub total_loop_weighted_segments: u64,
}

/// Ordered segment list plus the loop-weighted execution estimate used
/// for quota and ETA.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PartitionMap {
    pub segments: Vec<Segment>,
    pub estimated_executions: u64,
    pub loop_analysis: LoopAnalysis,
}

impl PartitionMap {
    pub fn total_segments(&self) -> usize {
        self.segments.len()
    }

    pub fn segment(&self, id: u32) -> Option<&Segment> {
        self.segments.get(id as usize)
    }
}
