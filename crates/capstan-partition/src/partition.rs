//! DAG -> ordered segment list.
//!
//! Boundary rules: a cut falls between node N and its successor when the
//! connecting edge is a HITP gate, when N fans out over >= 2 dynamic
//! edges, when the successor heads a dynamic-iteration loop, or when N
//! is an LLM node completed by external callback. Within a segment,
//! nodes run in topological order; disconnected components run in
//! deterministic id order. Loops are found with one SCC pass and weight
//! the execution estimate by `min(configured_max, global cap)`.

use capstan_core::{
    CoreConfig, Edge, EdgeType, Error, ExitBoundary, LoopAnalysis, LoopInfo, Node, NodeType,
    PartitionMap, Result, Segment, SegmentType, WorkflowDefinition,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

pub struct Partitioner {
    config: CoreConfig,
}

impl Partitioner {
    pub fn new(config: CoreConfig) -> Self {
        Self { config }
    }

    /// Partition a standalone workflow.
    pub fn partition(&self, workflow: &WorkflowDefinition) -> Result<PartitionMap> {
        self.partition_with_registry(workflow, &HashMap::new())
    }

    /// Partition with subgraph references resolvable through `registry`.
    /// Circular subgraph references are rejected before any slicing.
    pub fn partition_with_registry(
        &self,
        workflow: &WorkflowDefinition,
        registry: &HashMap<String, WorkflowDefinition>,
    ) -> Result<PartitionMap> {
        workflow.validate()?;
        check_subgraph_cycles(workflow, registry, &mut vec![workflow.workflow_id.clone()])?;

        let graph = Graph::build(workflow);
        let sccs = graph.tarjan_sccs();
        let loops = graph.identify_loops(&sccs);
        let order = graph.linear_order(&sccs)?;

        let segments = self.cut_segments(workflow, &graph, &order, &loops);
        let (estimated_executions, loop_analysis) =
            self.estimate(workflow, &segments, &loops);

        debug!(
            workflow = %workflow.workflow_id,
            segments = segments.len(),
            estimated_executions,
            "partitioned"
        );

        Ok(PartitionMap {
            segments,
            estimated_executions,
            loop_analysis,
        })
    }

    fn cut_segments(
        &self,
        workflow: &WorkflowDefinition,
        graph: &Graph<'_>,
        order: &[usize],
        loops: &[LoopMembership],
    ) -> Vec<Segment> {
        let loop_of = |idx: usize| loops.iter().position(|l| l.members.contains(&idx));

        let mut segments: Vec<Segment> = Vec::new();
        let mut current: Vec<usize> = Vec::new();

        let flush = |segments: &mut Vec<Segment>,
                     current: &mut Vec<usize>,
                     boundary: Option<ExitBoundary>| {
            if current.is_empty() {
                return;
            }
            let node_ids: Vec<String> = current
                .iter()
                .map(|&i| graph.nodes[i].id.clone())
                .collect();
            let id_set: HashSet<&str> = node_ids.iter().map(String::as_str).collect();
            let internal_edges: Vec<Edge> = workflow
                .edges
                .iter()
                .filter(|e| {
                    id_set.contains(e.source.as_str()) && id_set.contains(e.target.as_str())
                })
                .cloned()
                .collect();

            let in_loop = current.iter().all(|&i| loop_of(i).is_some())
                && loop_of(current[0]).is_some();
            let segment_type = if in_loop {
                SegmentType::Loop
            } else {
                match boundary {
                    Some(ExitBoundary::Hitp) => SegmentType::Hitp,
                    Some(ExitBoundary::BranchFanout) => SegmentType::Branch,
                    _ => SegmentType::Normal,
                }
            };

            segments.push(Segment {
                segment_id: segments.len() as u32,
                segment_type,
                entry_node: node_ids[0].clone(),
                nodes: node_ids,
                edges: internal_edges,
                exit_boundary: boundary,
            });
            current.clear();
        };

        enum Cut {
            No,
            /// Cut belongs to the entering edge (e.g. the successor heads
            /// a loop); the closing segment keeps no special boundary.
            Plain,
            At(ExitBoundary),
        }

        for (pos, &idx) in order.iter().enumerate() {
            current.push(idx);
            let node = graph.nodes[idx];
            let next = order.get(pos + 1).copied();

            let cut = match next {
                None => Cut::At(ExitBoundary::Terminal),
                Some(next_idx) => {
                    let next_node = graph.nodes[next_idx];
                    if graph.has_hitp_edge(idx, next_idx) {
                        Cut::At(ExitBoundary::Hitp)
                    } else if node.node_type == NodeType::Branch
                        && graph.dynamic_out_degree(idx) >= 2
                    {
                        Cut::At(ExitBoundary::BranchFanout)
                    } else if node.is_async_callback() {
                        Cut::At(ExitBoundary::AsyncCallback)
                    } else if let Some(l) = loop_of(idx) {
                        if loop_of(next_idx) != Some(l) {
                            // Leaving the loop body closes it with its
                            // back-edge boundary.
                            Cut::At(ExitBoundary::LoopBackEdge {
                                header: loops[l].header_id.clone(),
                            })
                        } else {
                            Cut::No
                        }
                    } else if loop_of(next_idx)
                        .map(|l| loops[l].dynamic && loops[l].header_id == next_node.id)
                        .unwrap_or(false)
                    {
                        Cut::Plain
                    } else {
                        Cut::No
                    }
                }
            };

            match cut {
                Cut::No => {}
                Cut::Plain => flush(&mut segments, &mut current, None),
                Cut::At(boundary) => flush(&mut segments, &mut current, Some(boundary)),
            }
        }
        flush(&mut segments, &mut current, Some(ExitBoundary::Terminal));

        segments
    }

    fn estimate(
        &self,
        workflow: &WorkflowDefinition,
        segments: &[Segment],
        loops: &[LoopMembership],
    ) -> (u64, LoopAnalysis) {
        let mut infos = Vec::new();
        let mut total_weighted: u64 = 0;
        let mut estimated: u64 = 0;

        for membership in loops {
            let header = workflow.node(&membership.header_id);
            let configured = header
                .and_then(|n| n.config_u64("max_iterations"))
                .unwrap_or(self.config.max_loop_iterations as u64)
                as u32;
            let effective = configured.min(self.config.global_loop_cap);
            let body_segments = segments
                .iter()
                .filter(|s| {
                    s.segment_type == SegmentType::Loop
                        && s.nodes
                            .iter()
                            .all(|n| membership.member_ids.contains(n.as_str()))
                })
                .count() as u32;
            total_weighted += body_segments as u64 * effective as u64;
            infos.push(LoopInfo {
                header: membership.header_id.clone(),
                body_segments,
                configured_max: configured,
                effective_max: effective,
            });
        }

        for segment in segments {
            if segment.segment_type == SegmentType::Loop {
                continue;
            }
            estimated += 1;
        }
        estimated += total_weighted;

        (
            estimated,
            LoopAnalysis {
                loops: infos,
                total_loop_weighted_segments: total_weighted,
            },
        )
    }
}

/// Depth-first guard against circular subgraph references.
fn check_subgraph_cycles(
    workflow: &WorkflowDefinition,
    registry: &HashMap<String, WorkflowDefinition>,
    stack: &mut Vec<String>,
) -> Result<()> {
    for node in &workflow.nodes {
        if node.node_type != NodeType::Subgraph {
            continue;
        }
        let Some(reference) = node.config_str("workflow_ref") else {
            return Err(Error::Validation(format!(
                "subgraph node '{}' has no workflow_ref",
                node.id
            )));
        };
        if stack.iter().any(|s| s == reference) {
            return Err(Error::Validation(format!(
                "circular subgraph reference: {} -> {}",
                stack.join(" -> "),
                reference
            )));
        }
        if let Some(child) = registry.get(reference) {
            stack.push(reference.to_string());
            check_subgraph_cycles(child, registry, stack)?;
            stack.pop();
        }
    }
    Ok(())
}

struct LoopMembership {
    header_id: String,
    members: HashSet<usize>,
    member_ids: HashSet<String>,
    dynamic: bool,
}

struct Graph<'a> {
    nodes: Vec<&'a Node>,
    index_of: HashMap<&'a str, usize>,
    adjacency: Vec<Vec<usize>>,
    edges: &'a [Edge],
}

impl<'a> Graph<'a> {
    fn build(workflow: &'a WorkflowDefinition) -> Self {
        let nodes: Vec<&Node> = workflow.nodes.iter().collect();
        let index_of: HashMap<&str, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.as_str(), i))
            .collect();
        let mut adjacency = vec![Vec::new(); nodes.len()];
        for edge in &workflow.edges {
            if let (Some(&s), Some(&t)) = (
                index_of.get(edge.source.as_str()),
                index_of.get(edge.target.as_str()),
            ) {
                adjacency[s].push(t);
            }
        }
        for next in &mut adjacency {
            next.sort_unstable();
            next.dedup();
        }
        Self {
            nodes,
            index_of,
            adjacency,
            edges: &workflow.edges,
        }
    }

    fn has_hitp_edge(&self, from: usize, to: usize) -> bool {
        let (from_id, to_id) = (&self.nodes[from].id, &self.nodes[to].id);
        self.edges.iter().any(|e| {
            e.edge_type == EdgeType::Hitp && &e.source == from_id && &e.target == to_id
        })
    }

    fn dynamic_out_degree(&self, from: usize) -> usize {
        let from_id = &self.nodes[from].id;
        self.edges
            .iter()
            .filter(|e| e.edge_type == EdgeType::Dynamic && &e.source == from_id)
            .count()
    }

    /// Iterative Tarjan — user graphs are untrusted, so no recursion.
    fn tarjan_sccs(&self) -> Vec<Vec<usize>> {
        let n = self.nodes.len();
        let mut index = vec![usize::MAX; n];
        let mut low = vec![0usize; n];
        let mut on_stack = vec![false; n];
        let mut stack: Vec<usize> = Vec::new();
        let mut sccs: Vec<Vec<usize>> = Vec::new();
        let mut next_index = 0usize;

        for start in 0..n {
            if index[start] != usize::MAX {
                continue;
            }
            let mut frames: Vec<(usize, usize)> = vec![(start, 0)];
            while let Some(frame) = frames.last_mut() {
                let (v, child_pos) = (frame.0, frame.1);
                if child_pos == 0 {
                    index[v] = next_index;
                    low[v] = next_index;
                    next_index += 1;
                    stack.push(v);
                    on_stack[v] = true;
                }
                if child_pos < self.adjacency[v].len() {
                    let w = self.adjacency[v][child_pos];
                    frame.1 += 1;
                    if index[w] == usize::MAX {
                        frames.push((w, 0));
                    } else if on_stack[w] {
                        low[v] = low[v].min(index[w]);
                    }
                } else {
                    if low[v] == index[v] {
                        let mut component = Vec::new();
                        loop {
                            let w = stack.pop().expect("tarjan stack");
                            on_stack[w] = false;
                            component.push(w);
                            if w == v {
                                break;
                            }
                        }
                        component.sort_unstable();
                        sccs.push(component);
                    }
                    frames.pop();
                    if let Some(parent) = frames.last() {
                        let p = parent.0;
                        low[p] = low[p].min(low[v]);
                    }
                }
            }
        }
        sccs
    }

    /// Loops are SCCs with more than one node, or a self-edge.
    fn identify_loops(&self, sccs: &[Vec<usize>]) -> Vec<LoopMembership> {
        let mut loops = Vec::new();
        for scc in sccs {
            let is_loop = scc.len() > 1
                || scc
                    .first()
                    .is_some_and(|&v| self.adjacency[v].contains(&v));
            if !is_loop {
                continue;
            }
            let members: HashSet<usize> = scc.iter().copied().collect();
            let header_idx = self.loop_header(&members);
            let header = self.nodes[header_idx];
            let dynamic = header.config_bool("dynamic_iterations").unwrap_or(true);
            loops.push(LoopMembership {
                header_id: header.id.clone(),
                member_ids: scc.iter().map(|&i| self.nodes[i].id.clone()).collect(),
                members,
                dynamic,
            });
        }
        loops
    }

    /// Header preference: the loop-typed node, else the entry from
    /// outside the component, else the smallest id.
    fn loop_header(&self, members: &HashSet<usize>) -> usize {
        if let Some(&idx) = members
            .iter()
            .find(|&&i| self.nodes[i].node_type == NodeType::Loop)
        {
            return idx;
        }
        let mut entries: Vec<usize> = members
            .iter()
            .copied()
            .filter(|&i| {
                let id = &self.nodes[i].id;
                self.edges.iter().any(|e| {
                    &e.target == id
                        && self
                            .index_of
                            .get(e.source.as_str())
                            .map(|s| !members.contains(s))
                            .unwrap_or(false)
                })
            })
            .collect();
        entries.sort_by_key(|&i| self.nodes[i].id.clone());
        entries
            .first()
            .copied()
            .unwrap_or_else(|| *members.iter().min().expect("nonempty scc"))
    }

    /// Deterministic linear order: Kahn over the SCC condensation with
    /// smallest-entry-id tie-breaking, headers first inside loops.
    fn linear_order(&self, sccs: &[Vec<usize>]) -> Result<Vec<usize>> {
        let n = self.nodes.len();
        let mut scc_of = vec![usize::MAX; n];
        for (scc_id, scc) in sccs.iter().enumerate() {
            for &v in scc {
                scc_of[v] = scc_id;
            }
        }

        // Condensation edges and in-degrees.
        let mut cond_out: Vec<HashSet<usize>> = vec![HashSet::new(); sccs.len()];
        let mut in_degree = vec![0usize; sccs.len()];
        for v in 0..n {
            for &w in &self.adjacency[v] {
                let (a, b) = (scc_of[v], scc_of[w]);
                if a != b && cond_out[a].insert(b) {
                    in_degree[b] += 1;
                }
            }
        }

        // Deterministic ready set keyed by smallest node id in the SCC.
        let scc_key = |scc_id: usize| -> &str {
            sccs[scc_id]
                .iter()
                .map(|&v| self.nodes[v].id.as_str())
                .min()
                .expect("nonempty scc")
        };

        let mut ready: BTreeMap<(String, usize), usize> = BTreeMap::new();
        for scc_id in 0..sccs.len() {
            if in_degree[scc_id] == 0 {
                ready.insert((scc_key(scc_id).to_string(), scc_id), scc_id);
            }
        }

        let mut order = Vec::with_capacity(n);
        let mut placed_sccs = 0;
        while let Some((key, scc_id)) = ready.iter().next().map(|(k, v)| (k.clone(), *v)) {
            ready.remove(&key);
            placed_sccs += 1;
            order.extend(self.order_within_scc(&sccs[scc_id]));
            for &next in &cond_out[scc_id] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.insert((scc_key(next).to_string(), next), next);
                }
            }
        }

        if placed_sccs != sccs.len() {
            return Err(Error::Internal(
                "condensation is not a DAG; SCC pass is broken".into(),
            ));
        }
        Ok(order)
    }

    fn order_within_scc(&self, scc: &[usize]) -> Vec<usize> {
        if scc.len() == 1 {
            return scc.to_vec();
        }
        let members: HashSet<usize> = scc.iter().copied().collect();
        let header = self.loop_header(&members);

        let mut placed: HashSet<usize> = HashSet::new();
        let mut order = vec![header];
        placed.insert(header);

        while order.len() < scc.len() {
            // Prefer nodes whose intra-SCC predecessors are all placed;
            // fall back to smallest id so inner cycles still terminate.
            let mut candidates: Vec<usize> = scc
                .iter()
                .copied()
                .filter(|v| !placed.contains(v))
                .collect();
            candidates.sort_by_key(|&v| self.nodes[v].id.clone());

            let next = candidates
                .iter()
                .copied()
                .find(|&v| {
                    let id = &self.nodes[v].id;
                    self.edges
                        .iter()
                        .filter(|e| &e.target == id)
                        .filter_map(|e| self.index_of.get(e.source.as_str()))
                        .filter(|s| members.contains(s))
                        .all(|s| placed.contains(s) || *s == v)
                })
                .unwrap_or(candidates[0]);

            placed.insert(next);
            order.push(next);
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capstan_core::Node;

    fn wf(nodes: Vec<Node>, edges: Vec<Edge>) -> WorkflowDefinition {
        WorkflowDefinition {
            workflow_id: "wf-1".into(),
            name: "t".into(),
            nodes,
            edges,
        }
    }

    fn partitioner() -> Partitioner {
        Partitioner::new(CoreConfig::default())
    }

    #[test]
    fn linear_chain_is_one_segment() {
        let workflow = wf(
            vec![
                Node::new("a", NodeType::Operator),
                Node::new("b", NodeType::Operator),
                Node::new("c", NodeType::Operator),
            ],
            vec![Edge::normal("a", "b"), Edge::normal("b", "c")],
        );
        let map = partitioner().partition(&workflow).unwrap();
        assert_eq!(map.segments.len(), 1);
        assert_eq!(map.segments[0].nodes, vec!["a", "b", "c"]);
        assert_eq!(
            map.segments[0].exit_boundary,
            Some(ExitBoundary::Terminal)
        );
        assert_eq!(map.estimated_executions, 1);
    }

    #[test]
    fn hitp_edge_cuts_the_graph() {
        let workflow = wf(
            vec![
                Node::new("a", NodeType::Operator),
                Node::new("gate", NodeType::Hitp),
                Node::new("b", NodeType::Operator),
            ],
            vec![Edge::normal("a", "gate"), Edge::hitp("gate", "b")],
        );
        let map = partitioner().partition(&workflow).unwrap();
        assert_eq!(map.segments.len(), 2);
        assert_eq!(map.segments[0].segment_type, SegmentType::Hitp);
        assert_eq!(map.segments[0].exit_boundary, Some(ExitBoundary::Hitp));
        assert_eq!(map.segments[1].nodes, vec!["b"]);
    }

    #[test]
    fn branch_fanout_cuts_before_children() {
        let workflow = wf(
            vec![
                Node::new("fan", NodeType::Branch),
                Node::new("c1", NodeType::Operator),
                Node::new("c2", NodeType::Operator),
            ],
            vec![Edge::dynamic("fan", "c1"), Edge::dynamic("fan", "c2")],
        );
        let map = partitioner().partition(&workflow).unwrap();
        assert_eq!(map.segments[0].segment_type, SegmentType::Branch);
        assert_eq!(
            map.segments[0].exit_boundary,
            Some(ExitBoundary::BranchFanout)
        );
    }

    #[test]
    fn loop_scc_is_detected_and_weighted() {
        let workflow = wf(
            vec![
                Node::new("start", NodeType::Operator),
                Node::new("head", NodeType::Loop)
                    .with_config(serde_json::json!({"max_iterations": 5})),
                Node::new("body", NodeType::Operator),
                Node::new("done", NodeType::Operator),
            ],
            vec![
                Edge::normal("start", "head"),
                Edge::normal("head", "body"),
                Edge::normal("body", "head"),
                Edge::normal("head", "done"),
            ],
        );
        let map = partitioner().partition(&workflow).unwrap();
        assert_eq!(map.loop_analysis.loops.len(), 1);
        let info = &map.loop_analysis.loops[0];
        assert_eq!(info.header, "head");
        assert_eq!(info.effective_max, 5);
        assert!(info.body_segments >= 1);
        // start segment (1) + loop body segments * 5 + done segment (1)
        assert_eq!(
            map.estimated_executions,
            2 + map.loop_analysis.total_loop_weighted_segments
        );
        assert!(map
            .segments
            .iter()
            .any(|s| s.segment_type == SegmentType::Loop));
    }

    #[test]
    fn loop_cap_bounds_the_estimate() {
        let workflow = wf(
            vec![
                Node::new("head", NodeType::Loop)
                    .with_config(serde_json::json!({"max_iterations": 100_000})),
                Node::new("body", NodeType::Operator),
            ],
            vec![Edge::normal("head", "body"), Edge::normal("body", "head")],
        );
        let map = partitioner().partition(&workflow).unwrap();
        let info = &map.loop_analysis.loops[0];
        assert_eq!(info.effective_max, CoreConfig::default().global_loop_cap);
    }

    #[test]
    fn async_callback_llm_cuts() {
        let workflow = wf(
            vec![
                Node::new("ask", NodeType::Llm)
                    .with_config(serde_json::json!({"async_callback": true})),
                Node::new("after", NodeType::Operator),
            ],
            vec![Edge::normal("ask", "after")],
        );
        let map = partitioner().partition(&workflow).unwrap();
        assert_eq!(map.segments.len(), 2);
        assert_eq!(
            map.segments[0].exit_boundary,
            Some(ExitBoundary::AsyncCallback)
        );
    }

    #[test]
    fn disconnected_components_order_deterministically() {
        let workflow = wf(
            vec![
                Node::new("z", NodeType::Operator),
                Node::new("a", NodeType::Operator),
            ],
            vec![],
        );
        let map = partitioner().partition(&workflow).unwrap();
        assert_eq!(map.segments[0].nodes, vec!["a", "z"]);
    }

    #[test]
    fn dangling_edge_is_rejected() {
        let workflow = wf(
            vec![Node::new("a", NodeType::Operator)],
            vec![Edge::normal("a", "ghost")],
        );
        assert!(partitioner().partition(&workflow).is_err());
    }

    #[test]
    fn circular_subgraph_reference_is_rejected() {
        let parent = wf(
            vec![Node::new("sub", NodeType::Subgraph)
                .with_config(serde_json::json!({"workflow_ref": "child"}))],
            vec![],
        );
        let mut child = wf(
            vec![Node::new("back", NodeType::Subgraph)
                .with_config(serde_json::json!({"workflow_ref": "wf-1"}))],
            vec![],
        );
        child.workflow_id = "child".into();

        let mut registry = HashMap::new();
        registry.insert("child".to_string(), child);
        let err = partitioner()
            .partition_with_registry(&parent, &registry)
            .unwrap_err();
        assert!(err.to_string().contains("circular subgraph"));
    }
}
