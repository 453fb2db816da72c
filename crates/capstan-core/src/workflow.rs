//! Workflow definitions — a directed multigraph of typed nodes.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Operator,
    Llm,
    Subgraph,
    RouteCondition,
    Hitp,
    Branch,
    Loop,
    Aggregator,
    Governor,
    Agent,
}

/// Trust level of a node author. Gates routing policy: higher rings are
/// barred from targeting lower-ring node types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ring {
    Kernel,
    Governor,
    Trusted,
    Agent,
}

impl Ring {
    pub fn level(self) -> u8 {
        match self {
            Ring::Kernel => 0,
            Ring::Governor => 1,
            Ring::Trusted => 2,
            Ring::Agent => 3,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ring: Option<Ring>,
}

impl Node {
    pub fn new(id: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            id: id.into(),
            node_type,
            config: serde_json::Value::Null,
            ring: None,
        }
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    /// Effective ring: explicit assignment wins, otherwise derived from
    /// the node type.
    pub fn effective_ring(&self) -> Ring {
        self.ring.unwrap_or(match self.node_type {
            NodeType::Agent => Ring::Agent,
            NodeType::Governor => Ring::Governor,
            _ => Ring::Trusted,
        })
    }

    pub fn config_u64(&self, key: &str) -> Option<u64> {
        self.config.get(key).and_then(|v| v.as_u64())
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }

    pub fn config_bool(&self, key: &str) -> Option<bool> {
        self.config.get(key).and_then(|v| v.as_bool())
    }

    /// LLM nodes completed by an external callback instead of inline.
    pub fn is_async_callback(&self) -> bool {
        self.node_type == NodeType::Llm && self.config_bool("async_callback").unwrap_or(false)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeType {
    #[default]
    #[serde(alias = "edge")]
    Normal,
    Hitp,
    Dynamic,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Edge {
    #[serde(rename = "type", default)]
    pub edge_type: EdgeType,
    pub source: String,
    pub target: String,
}

impl Edge {
    pub fn normal(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            edge_type: EdgeType::Normal,
            source: source.into(),
            target: target.into(),
        }
    }

    pub fn hitp(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            edge_type: EdgeType::Hitp,
            source: source.into(),
            target: target.into(),
        }
    }

    pub fn dynamic(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            edge_type: EdgeType::Dynamic,
            source: source.into(),
            target: target.into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub workflow_id: String,
    #[serde(default)]
    pub name: String,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl WorkflowDefinition {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn node_ids(&self) -> HashSet<&str> {
        self.nodes.iter().map(|n| n.id.as_str()).collect()
    }

    pub fn outgoing(&self, node_id: &str) -> Vec<&Edge> {
        self.edges.iter().filter(|e| e.source == node_id).collect()
    }

    pub fn incoming(&self, node_id: &str) -> Vec<&Edge> {
        self.edges.iter().filter(|e| e.target == node_id).collect()
    }

    /// Save-time graph validation: every edge endpoint must name an
    /// existing node. Failures list every offending edge.
    pub fn validate(&self) -> Result<()> {
        let ids = self.node_ids();
        let mut invalid = Vec::new();
        for edge in &self.edges {
            if !ids.contains(edge.source.as_str()) {
                invalid.push(format!(
                    "edge {} -> {}: source '{}' not found",
                    edge.source, edge.target, edge.source
                ));
            }
            if !ids.contains(edge.target.as_str()) {
                invalid.push(format!(
                    "edge {} -> {}: target '{}' not found",
                    edge.source, edge.target, edge.target
                ));
            }
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                invalid.push(format!("duplicate node id '{}'", node.id));
            }
        }

        if invalid.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(format!(
                "invalid routing graph: {}",
                invalid.join("; ")
            )))
        }
    }

    /// Stricter save-time check: additionally reject nodes that have
    /// multiple outgoing normal edges without a route_condition — the
    /// resolver would fail them at runtime anyway.
    pub fn validate_strict(&self) -> Result<()> {
        self.validate()?;
        for node in &self.nodes {
            // Route conditions and loop headers pick their successor at
            // runtime via __next_node.
            if matches!(node.node_type, NodeType::RouteCondition | NodeType::Loop) {
                continue;
            }
            let normal_out = self
                .outgoing(&node.id)
                .iter()
                .filter(|e| e.edge_type == EdgeType::Normal)
                .count();
            if normal_out > 1 {
                return Err(Error::Validation(format!(
                    "node '{}' has {} outgoing normal edges; insert a route_condition node",
                    node.id, normal_out
                )));
            }
        }
        Ok(())
    }
}
