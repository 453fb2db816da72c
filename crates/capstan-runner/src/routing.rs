//! Node-centric routing.
//!
//! Priority: an explicit `__next_node` set by the node (consumed on
//! read), else the single outgoing normal edge, else END. Multiple
//! outgoing edges without `__next_node` is an authoring error — the
//! graph needs a route_condition node. Every resolved target passes an
//! O(1) whitelist lookup and the ring policy before it is returned.

use capstan_core::{keys, Edge, EdgeType, Error, Node, NodeType, Result, Ring, StateBag};
use std::collections::HashSet;
use tracing::debug;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteTarget {
    Node(String),
    End,
}

pub struct RoutingResolver {
    valid_node_ids: HashSet<String>,
    restricted_nodes: HashSet<String>,
    current_ring: Ring,
}

impl RoutingResolver {
    /// Build a resolver for the given node set and caller ring level.
    pub fn for_nodes(nodes: &[Node], current_ring: Ring) -> Self {
        let valid_node_ids = nodes.iter().map(|n| n.id.clone()).collect();
        let restricted_nodes = restricted_for(nodes, current_ring);
        Self {
            valid_node_ids,
            restricted_nodes,
            current_ring,
        }
    }

    pub fn resolve_next_target(
        &self,
        current_node_id: &str,
        state: &mut StateBag,
        edges: &[Edge],
    ) -> Result<RouteTarget> {
        // Priority 1: the node named its successor.
        if let Some(value) = state.pop(keys::NEXT_NODE) {
            let target = value
                .as_str()
                .ok_or_else(|| {
                    Error::InvalidTarget(format!(
                        "__next_node set by '{current_node_id}' is not a string"
                    ))
                })?
                .to_string();
            self.validate_target(&target, current_node_id, "explicit")?;
            debug!(from = current_node_id, to = %target, "routed (explicit)");
            return Ok(RouteTarget::Node(target));
        }

        // Priority 2: follow the graph.
        let outgoing: Vec<&Edge> = edges
            .iter()
            .filter(|e| e.source == current_node_id && e.edge_type != EdgeType::Dynamic)
            .collect();

        match outgoing.len() {
            0 => {
                debug!(from = current_node_id, "routed to END");
                Ok(RouteTarget::End)
            }
            1 => {
                let target = outgoing[0].target.clone();
                self.validate_target(&target, current_node_id, "edge")?;
                debug!(from = current_node_id, to = %target, "routed (edge)");
                Ok(RouteTarget::Node(target))
            }
            n => Err(Error::RoutingAmbiguity {
                node: current_node_id.to_string(),
                outgoing: n,
            }),
        }
    }

    fn validate_target(&self, target: &str, source: &str, method: &str) -> Result<()> {
        if !self.valid_node_ids.contains(target) {
            return Err(Error::InvalidTarget(format!(
                "'{target}' does not exist in the current manifest (from '{source}', method {method})"
            )));
        }
        if self.restricted_nodes.contains(target) {
            return Err(Error::UnauthorizedRouting(format!(
                "'{target}' is restricted for ring {} callers (from '{source}')",
                self.current_ring.level()
            )));
        }
        Ok(())
    }
}

/// Ring policy: agents (ring 3) may not target kernel or governor
/// nodes; trusted authors (ring 2) may not target kernel nodes; rings
/// 0/1 are unrestricted.
fn restricted_for(nodes: &[Node], ring: Ring) -> HashSet<String> {
    nodes
        .iter()
        .filter(|n| {
            let target_ring = n.effective_ring();
            match ring {
                Ring::Agent => {
                    target_ring == Ring::Kernel || n.node_type == NodeType::Governor
                }
                Ring::Trusted => target_ring == Ring::Kernel,
                Ring::Kernel | Ring::Governor => false,
            }
        })
        .map(|n| n.id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use capstan_core::Value;

    fn nodes() -> Vec<Node> {
        vec![
            Node::new("a", NodeType::Operator),
            Node::new("b", NodeType::Operator),
            Node::new("c", NodeType::Operator),
            Node {
                ring: Some(Ring::Kernel),
                ..Node::new("kernel_op", NodeType::Operator)
            },
            Node::new("gov", NodeType::Governor),
        ]
    }

    #[test]
    fn explicit_next_node_wins_and_is_consumed() {
        let resolver = RoutingResolver::for_nodes(&nodes(), Ring::Trusted);
        let mut state = StateBag::new();
        state.insert(keys::NEXT_NODE, Value::str("c"));
        let edges = vec![Edge::normal("a", "b")];

        let target = resolver.resolve_next_target("a", &mut state, &edges).unwrap();
        assert_eq!(target, RouteTarget::Node("c".into()));
        assert!(state.get(keys::NEXT_NODE).is_none());
    }

    #[test]
    fn single_edge_routes_through() {
        let resolver = RoutingResolver::for_nodes(&nodes(), Ring::Trusted);
        let mut state = StateBag::new();
        let edges = vec![Edge::normal("a", "b")];
        let target = resolver.resolve_next_target("a", &mut state, &edges).unwrap();
        assert_eq!(target, RouteTarget::Node("b".into()));
    }

    #[test]
    fn no_edges_means_end() {
        let resolver = RoutingResolver::for_nodes(&nodes(), Ring::Trusted);
        let mut state = StateBag::new();
        let target = resolver.resolve_next_target("c", &mut state, &[]).unwrap();
        assert_eq!(target, RouteTarget::End);
    }

    #[test]
    fn multiple_edges_without_next_node_is_ambiguous() {
        let resolver = RoutingResolver::for_nodes(&nodes(), Ring::Trusted);
        let mut state = StateBag::new();
        let edges = vec![Edge::normal("a", "b"), Edge::normal("a", "c")];
        let err = resolver
            .resolve_next_target("a", &mut state, &edges)
            .unwrap_err();
        assert!(matches!(err, Error::RoutingAmbiguity { .. }));
    }

    #[test]
    fn unknown_target_is_invalid() {
        let resolver = RoutingResolver::for_nodes(&nodes(), Ring::Trusted);
        let mut state = StateBag::new();
        state.insert(keys::NEXT_NODE, Value::str("ghost"));
        let err = resolver
            .resolve_next_target("a", &mut state, &[])
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTarget(_)));
    }

    #[test]
    fn agent_ring_cannot_target_kernel_or_governor() {
        let resolver = RoutingResolver::for_nodes(&nodes(), Ring::Agent);
        for target in ["kernel_op", "gov"] {
            let mut state = StateBag::new();
            state.insert(keys::NEXT_NODE, Value::str(target));
            let err = resolver
                .resolve_next_target("a", &mut state, &[])
                .unwrap_err();
            assert!(matches!(err, Error::UnauthorizedRouting(_)), "{target}");
        }
    }

    #[test]
    fn trusted_ring_can_target_governor_but_not_kernel() {
        let resolver = RoutingResolver::for_nodes(&nodes(), Ring::Trusted);
        let mut state = StateBag::new();
        state.insert(keys::NEXT_NODE, Value::str("gov"));
        assert!(resolver.resolve_next_target("a", &mut state, &[]).is_ok());

        state.insert(keys::NEXT_NODE, Value::str("kernel_op"));
        assert!(matches!(
            resolver.resolve_next_target("a", &mut state, &[]),
            Err(Error::UnauthorizedRouting(_))
        ));
    }

    #[test]
    fn governor_ring_is_unrestricted() {
        let resolver = RoutingResolver::for_nodes(&nodes(), Ring::Governor);
        let mut state = StateBag::new();
        state.insert(keys::NEXT_NODE, Value::str("kernel_op"));
        assert!(resolver.resolve_next_target("a", &mut state, &[]).is_ok());
    }
}
