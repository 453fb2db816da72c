//! Segment execution: dispatch nodes, route between them, and compute
//! the transition at the boundary.

use crate::advice;
use crate::context::RunContext;
use crate::handler::HandlerRegistry;
use crate::heal::{ErrorCategory, ErrorClassifier};
use crate::mask::sanitize_for_logging;
use crate::routing::{RouteTarget, RoutingResolver};
use capstan_core::{
    keys, EdgeType, Error, ExitBoundary, Node, NodeType, PartitionMap, Result, Segment,
    SegmentType, StateBag, Value, WorkflowDefinition,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    Complete,
    PausedForHitp,
    BranchFanout,
    LoopContinue,
    AsyncChildStarted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentStatus {
    Succeeded,
    FailedDeterministic,
    FailedSemantic,
    Aborted,
}

#[derive(Clone, Debug)]
pub struct SegmentFailure {
    /// Short stable error code.
    pub code: String,
    /// Sanitized message.
    pub message: String,
    /// Classifier explanation.
    pub reason: String,
}

/// One child of a distributed-map fan-out.
#[derive(Clone, Debug)]
pub struct BranchSpec {
    pub branch_index: usize,
    pub entry_node: String,
    pub allow_failure: bool,
}

#[derive(Clone, Debug)]
pub struct SegmentOutcome {
    pub status: SegmentStatus,
    pub transition: Transition,
    /// Full working state after the segment.
    pub state: StateBag,
    /// Accumulated delta for the kernel sync.
    pub delta: StateBag,
    pub next_segment: Option<u32>,
    /// Populated on `BranchFanout`.
    pub branch_plan: Vec<BranchSpec>,
    /// Hint for the kernel's loop counter.
    pub is_loop_body: bool,
    pub failure: Option<SegmentFailure>,
}

impl SegmentOutcome {
    fn failed(
        status: SegmentStatus,
        state: StateBag,
        delta: StateBag,
        failure: SegmentFailure,
    ) -> Self {
        Self {
            status,
            transition: Transition::Complete,
            state,
            delta,
            next_segment: None,
            branch_plan: Vec::new(),
            is_loop_body: false,
            failure: Some(failure),
        }
    }
}

pub struct SegmentRunner {
    workflow: Arc<WorkflowDefinition>,
    partition: Arc<PartitionMap>,
    registry: Arc<HandlerRegistry>,
    classifier: ErrorClassifier,
    global_loop_cap: u32,
}

impl SegmentRunner {
    pub fn new(
        workflow: Arc<WorkflowDefinition>,
        partition: Arc<PartitionMap>,
        registry: Arc<HandlerRegistry>,
        global_loop_cap: u32,
    ) -> Self {
        Self {
            workflow,
            partition,
            registry,
            classifier: ErrorClassifier::new(),
            global_loop_cap,
        }
    }

    pub fn partition(&self) -> &PartitionMap {
        &self.partition
    }

    pub fn workflow(&self) -> &WorkflowDefinition {
        &self.workflow
    }

    /// Execute one segment against the given state. Node failures are
    /// encoded in the outcome status; `Err` is reserved for structural
    /// problems (unknown segment id).
    pub async fn run_segment(
        &self,
        segment_id: u32,
        state: StateBag,
        ctx: &RunContext,
    ) -> Result<SegmentOutcome> {
        let segment = self
            .partition
            .segment(segment_id)
            .ok_or_else(|| Error::Validation(format!("unknown segment {segment_id}")))?
            .clone();

        let mut state = state;
        let mut delta = StateBag::new();

        // Loop cap gate at entry: a loop body never starts a pass past
        // its budget.
        if segment.segment_type == SegmentType::Loop {
            let counter = state.get_u64(keys::LOOP_COUNTER).unwrap_or(0);
            let max = self.effective_loop_cap(&state);
            if counter >= max {
                return Ok(SegmentOutcome::failed(
                    SegmentStatus::FailedSemantic,
                    state,
                    delta,
                    SegmentFailure {
                        code: "LoopLimitExceeded".into(),
                        message: format!("loop_counter {counter} reached max_loop_iterations {max}"),
                        reason: "loop cap enforced at segment entry".into(),
                    },
                ));
            }
        }

        let suggested_fix = state
            .get_path(&format!("{}.suggested_fix", keys::SELF_HEALING_METADATA))
            .and_then(Value::as_str)
            .map(String::from);

        let mut current = segment.entry_node.clone();
        let mut steps = 0usize;
        let max_steps = segment.nodes.len() * 4 + 8;

        loop {
            if ctx.is_cancelled() {
                info!(segment = segment_id, node = %current, "segment aborted by cancel flag");
                return Ok(SegmentOutcome::failed(
                    SegmentStatus::Aborted,
                    state,
                    delta,
                    SegmentFailure {
                        code: "Aborted".into(),
                        message: "execution cancelled".into(),
                        reason: "cooperative cancel flag observed between nodes".into(),
                    },
                ));
            }
            if ctx.deadline_exceeded() {
                // A blown wall-clock budget is transient on the first
                // strike; the circuit breaker escalates repeats.
                return Ok(self.classify_failure(
                    Error::operator(&current, "timeout: segment wall-clock budget exceeded"),
                    ctx,
                    state,
                    delta,
                ));
            }
            steps += 1;
            if steps > max_steps {
                return Ok(SegmentOutcome::failed(
                    SegmentStatus::FailedSemantic,
                    state,
                    delta,
                    SegmentFailure {
                        code: "LoopLimitExceeded".into(),
                        message: format!("segment {segment_id} exceeded {max_steps} node steps"),
                        reason: "intra-segment routing never reached a boundary".into(),
                    },
                ));
            }

            let Some(node) = self.workflow.node(&current).cloned() else {
                return Ok(SegmentOutcome::failed(
                    SegmentStatus::FailedSemantic,
                    state,
                    delta,
                    SegmentFailure {
                        code: "InvalidTargetError".into(),
                        message: format!("node '{current}' not found in workflow"),
                        reason: "segment references a missing node".into(),
                    },
                ));
            };

            // Async-callback LLM nodes do not run inline; the child is
            // started and completion arrives by external callback.
            if node.is_async_callback() {
                let mut marker = StateBag::new();
                marker.insert("_async_pending", Value::str(node.id.clone()));
                merge_into(&mut state, &mut delta, marker);
                let next_segment = self.next_sequential(segment_id);
                return Ok(SegmentOutcome {
                    status: SegmentStatus::Succeeded,
                    transition: Transition::AsyncChildStarted,
                    state,
                    delta,
                    next_segment,
                    branch_plan: Vec::new(),
                    is_loop_body: false,
                    failure: None,
                });
            }

            let node_exec = self.with_advice(&node, suggested_fix.as_deref());
            match self.registry.execute(&node_exec, &state, ctx).await {
                Ok(node_delta) => {
                    debug!(
                        node = %node.id,
                        state = %sanitize_for_logging(&node_delta),
                        "node executed"
                    );
                    merge_into(&mut state, &mut delta, node_delta);
                }
                Err(e) => return Ok(self.classify_failure(e, ctx, state, delta)),
            }

            // Branch fan-out ends the segment without normal routing.
            if node.node_type == NodeType::Branch && self.dynamic_targets(&node.id).len() >= 2 {
                let branch_plan = self.branch_plan(&node);
                let next_segment = self.next_sequential(segment_id);
                return Ok(SegmentOutcome {
                    status: SegmentStatus::Succeeded,
                    transition: Transition::BranchFanout,
                    state,
                    delta,
                    next_segment,
                    branch_plan,
                    is_loop_body: false,
                    failure: None,
                });
            }

            let resolver = RoutingResolver::for_nodes(&self.workflow.nodes, node.effective_ring());
            let target =
                match resolver.resolve_next_target(&node.id, &mut state, &self.workflow.edges) {
                    Ok(target) => target,
                    Err(e) => {
                        warn!(node = %node.id, "routing failed: {e}");
                        // Routing violations are never self-healed.
                        return Ok(SegmentOutcome::failed(
                            SegmentStatus::FailedSemantic,
                            state,
                            delta,
                            SegmentFailure {
                                code: e.code().to_string(),
                                message: e.to_string(),
                                reason: "routing policy".into(),
                            },
                        ));
                    }
                };
            // The control signal is consumed on read; never persist it.
            delta.remove(keys::NEXT_NODE);

            let target_id = match target {
                RouteTarget::End => {
                    return Ok(SegmentOutcome {
                        status: SegmentStatus::Succeeded,
                        transition: Transition::Complete,
                        state,
                        delta,
                        next_segment: None,
                        branch_plan: Vec::new(),
                        is_loop_body: false,
                        failure: None,
                    });
                }
                RouteTarget::Node(id) => id,
            };

            // Routing back to a loop header is the back-edge even though
            // the header lives in the same segment.
            let crosses_boundary = !segment.nodes.contains(&target_id)
                || (segment.segment_type == SegmentType::Loop
                    && target_id == segment.entry_node);
            if !crosses_boundary {
                current = target_id;
                continue;
            }

            return Ok(self.boundary_outcome(&segment, &target_id, state, delta));
        }
    }

    fn boundary_outcome(
        &self,
        segment: &Segment,
        target_id: &str,
        state: StateBag,
        delta: StateBag,
    ) -> SegmentOutcome {
        let next_segment = self.segment_of(target_id);
        let (transition, is_loop_body) = match &segment.exit_boundary {
            Some(ExitBoundary::Hitp) => (Transition::PausedForHitp, false),
            Some(ExitBoundary::BranchFanout) => (Transition::BranchFanout, false),
            Some(ExitBoundary::AsyncCallback) => (Transition::AsyncChildStarted, false),
            Some(ExitBoundary::LoopBackEdge { header }) if target_id == header => {
                (Transition::LoopContinue, true)
            }
            _ => (Transition::Complete, false),
        };

        SegmentOutcome {
            status: SegmentStatus::Succeeded,
            transition,
            state,
            delta,
            next_segment,
            branch_plan: Vec::new(),
            is_loop_body,
            failure: None,
        }
    }

    fn classify_failure(
        &self,
        error: Error,
        ctx: &RunContext,
        state: StateBag,
        delta: StateBag,
    ) -> SegmentOutcome {
        let code = error.code().to_string();
        let message = error.to_string();
        let (category, reason) = self.classifier.classify(&code, &message, ctx.healing_count);
        let status = match category {
            ErrorCategory::Deterministic => SegmentStatus::FailedDeterministic,
            ErrorCategory::Semantic => SegmentStatus::FailedSemantic,
        };
        warn!(code = %code, reason = %reason, "segment failed: {message}");
        SegmentOutcome::failed(status, state, delta, SegmentFailure {
            code,
            message,
            reason,
        })
    }

    /// Clone the node with self-heal advice injected into its prompt.
    /// Injection is idempotent — an earlier block is replaced.
    fn with_advice(&self, node: &Node, suggested_fix: Option<&str>) -> Node {
        let Some(fix) = suggested_fix else {
            return node.clone();
        };
        if !matches!(node.node_type, NodeType::Llm | NodeType::Agent) {
            return node.clone();
        }
        let mut patched = node.clone();
        if let Some(prompt) = node.config.get("prompt").and_then(|v| v.as_str()) {
            let injected = advice::inject_advice(prompt, fix);
            if let serde_json::Value::Object(ref mut map) = patched.config {
                map.insert("prompt".into(), serde_json::Value::String(injected));
            }
        }
        patched
    }

    fn effective_loop_cap(&self, state: &StateBag) -> u64 {
        let configured = state
            .get_u64(keys::MAX_LOOP_ITERATIONS)
            .unwrap_or(self.global_loop_cap as u64);
        configured.min(self.global_loop_cap as u64)
    }

    fn dynamic_targets(&self, node_id: &str) -> Vec<String> {
        self.workflow
            .edges
            .iter()
            .filter(|e| e.edge_type == EdgeType::Dynamic && e.source == node_id)
            .map(|e| e.target.clone())
            .collect()
    }

    fn branch_plan(&self, branch_node: &Node) -> Vec<BranchSpec> {
        let default_allow = branch_node.config_bool("allow_failure").unwrap_or(false);
        self.dynamic_targets(&branch_node.id)
            .into_iter()
            .enumerate()
            .map(|(branch_index, entry_node)| {
                let allow_failure = self
                    .workflow
                    .node(&entry_node)
                    .and_then(|n| n.config_bool("allow_failure"))
                    .unwrap_or(default_allow);
                BranchSpec {
                    branch_index,
                    entry_node,
                    allow_failure,
                }
            })
            .collect()
    }

    fn segment_of(&self, node_id: &str) -> Option<u32> {
        self.partition
            .segments
            .iter()
            .find(|s| s.nodes.iter().any(|n| n == node_id))
            .map(|s| s.segment_id)
    }

    fn next_sequential(&self, segment_id: u32) -> Option<u32> {
        let next = segment_id + 1;
        self.partition.segment(next).map(|s| s.segment_id)
    }
}

/// Top-level merge of a node delta into both the working state and the
/// accumulated segment delta.
fn merge_into(state: &mut StateBag, delta_acc: &mut StateBag, node_delta: StateBag) {
    for (key, value) in node_delta {
        state.insert(key.clone(), value.clone());
        delta_acc.insert(key, value);
    }
}
