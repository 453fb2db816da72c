//! Node handlers and their registry.
//!
//! Each node type is a self-contained handler implementing the
//! NodeHandler trait; the runner dispatches through the registry. A
//! handler receives the rendered view of its node and returns a state
//! delta — it never writes state directly.

use crate::context::RunContext;
use crate::llm::{LlmClient, LlmRequest};
use crate::template::render_json;
use async_trait::async_trait;
use capstan_core::{keys, Error, Node, NodeType, Result, StateBag, Value};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::debug;

/// The NodeHandler trait — implement this to support a node type.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    /// The node type this handler executes.
    fn handles(&self) -> NodeType;

    /// Execute the node against a read-only view of state and return
    /// the delta to merge. Handlers check `ctx` between external calls.
    async fn execute(&self, node: &Node, state: &StateBag, ctx: &RunContext) -> Result<StateBag>;
}

pub struct HandlerRegistry {
    handlers: HashMap<NodeType, Arc<dyn NodeHandler>>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler. Replaces any existing handler for the type.
    pub fn register(&mut self, handler: impl NodeHandler + 'static) {
        self.handlers.insert(handler.handles(), Arc::new(handler));
    }

    pub fn get(&self, node_type: NodeType) -> Option<Arc<dyn NodeHandler>> {
        self.handlers.get(&node_type).cloned()
    }

    pub async fn execute(
        &self,
        node: &Node,
        state: &StateBag,
        ctx: &RunContext,
    ) -> Result<StateBag> {
        match self.handlers.get(&node.node_type) {
            Some(handler) => handler.execute(node, state, ctx).await,
            None => Err(Error::operator(
                &node.id,
                format!("no handler registered for node type {:?}", node.node_type),
            )),
        }
    }
}

/// Registry with every built-in handler wired to the given LLM client.
pub fn default_registry(llm: Arc<dyn LlmClient>) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register(OperatorHandler);
    registry.register(LlmNodeHandler::new(llm.clone(), NodeType::Llm));
    registry.register(LlmNodeHandler::new(llm, NodeType::Agent));
    registry.register(RouteConditionHandler);
    registry.register(HitpGateHandler);
    registry.register(BranchHandler);
    registry.register(LoopHeaderHandler);
    registry.register(SubgraphHandler);
    registry.register(AggregatorMarkerHandler);
    registry.register(GovernorMarkerHandler);
    registry
}

// ===========================================================================
// Operator
// ===========================================================================

/// Deterministic operators: the rendered `output` object is the delta.
/// `fail_with` lets test workflows raise a configured error message.
pub struct OperatorHandler;

#[async_trait]
impl NodeHandler for OperatorHandler {
    fn handles(&self) -> NodeType {
        NodeType::Operator
    }

    async fn execute(&self, node: &Node, state: &StateBag, _ctx: &RunContext) -> Result<StateBag> {
        let rendered = render_json(&node.config, state);

        if let Some(message) = rendered.get("fail_with").and_then(|v| v.as_str()) {
            return Err(Error::operator(&node.id, message));
        }

        let delta = match rendered.get("output") {
            Some(output) if output.is_object() => StateBag::from_json(output.clone()),
            Some(other) => {
                let mut bag = StateBag::new();
                bag.insert_json(node.id.clone(), other.clone());
                bag
            }
            None => StateBag::new(),
        };
        debug!(node = %node.id, keys = delta.len(), "operator executed");
        Ok(delta)
    }
}

// ===========================================================================
// LLM / Agent
// ===========================================================================

/// Shared implementation for llm and agent nodes. Agent output lands
/// under `agent_output` with provenance metadata for the governance
/// post-pass; plain LLM output lands under the configured output key.
pub struct LlmNodeHandler {
    client: Arc<dyn LlmClient>,
    node_type: NodeType,
}

impl LlmNodeHandler {
    pub fn new(client: Arc<dyn LlmClient>, node_type: NodeType) -> Self {
        Self { client, node_type }
    }
}

#[async_trait]
impl NodeHandler for LlmNodeHandler {
    fn handles(&self) -> NodeType {
        self.node_type
    }

    async fn execute(&self, node: &Node, state: &StateBag, ctx: &RunContext) -> Result<StateBag> {
        ctx.checkpoint()?;
        let rendered = render_json(&node.config, state);

        let prompt = rendered
            .get("prompt")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let request = LlmRequest {
            model: rendered
                .get("model")
                .and_then(|v| v.as_str())
                .unwrap_or("default")
                .to_string(),
            prompt,
            system: rendered
                .get("system")
                .and_then(|v| v.as_str())
                .map(String::from),
            max_tokens: rendered
                .get("max_tokens")
                .and_then(|v| v.as_u64())
                .map(|n| n as u32),
        };

        let response = self.client.complete(request).await?;

        let mut delta = StateBag::new();
        let gas = state
            .get("_gas_used")
            .and_then(|v| match v {
                Value::Scalar(s) => s.as_f64(),
                _ => None,
            })
            .unwrap_or(0.0);
        delta.insert_json("_gas_used", serde_json::json!(gas + response.cost));

        if self.node_type == NodeType::Agent {
            delta.insert("agent_output", Value::str(response.text.clone()));
            let mut meta = StateBag::new();
            meta.insert("agent_id", Value::str(node.id.clone()));
            if let Some(plan) = rendered.get("plan").and_then(|v| v.as_str()) {
                meta.insert("plan", Value::str(plan));
                meta.insert("plan_hash", Value::str(stable_hash(plan)));
            }
            delta.insert("_agent_meta", Value::Map(meta));
            return Ok(delta);
        }

        if rendered
            .get("parse_json")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            let parsed: serde_json::Value =
                serde_json::from_str(&response.text).map_err(|e| {
                    Error::operator(&node.id, format!("invalid JSON in LLM response: {e}"))
                })?;
            if let serde_json::Value::Object(map) = parsed {
                for (key, value) in map {
                    delta.insert_json(key, value);
                }
            } else {
                return Err(Error::operator(
                    &node.id,
                    "invalid JSON in LLM response: expected an object",
                ));
            }
        } else {
            let output_key = rendered
                .get("output_key")
                .and_then(|v| v.as_str())
                .unwrap_or("llm_output");
            delta.insert(output_key.to_string(), Value::str(response.text));
        }
        Ok(delta)
    }
}

fn stable_hash(text: &str) -> String {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

// ===========================================================================
// Route condition
// ===========================================================================

/// Evaluates ordered `routes` conditions and writes `__next_node`.
/// Config shape: `{"routes": [{"when": {"path": "k", "equals": v},
/// "target": "node"}], "default": "node"}`.
pub struct RouteConditionHandler;

#[async_trait]
impl NodeHandler for RouteConditionHandler {
    fn handles(&self) -> NodeType {
        NodeType::RouteCondition
    }

    async fn execute(&self, node: &Node, state: &StateBag, _ctx: &RunContext) -> Result<StateBag> {
        let mut delta = StateBag::new();

        if let Some(routes) = node.config.get("routes").and_then(|v| v.as_array()) {
            for route in routes {
                let Some(when) = route.get("when") else {
                    continue;
                };
                let path = when.get("path").and_then(|v| v.as_str()).unwrap_or("");
                let expected = when.get("equals").cloned().unwrap_or(serde_json::Value::Null);
                let actual = state
                    .get_path(path)
                    .map(Value::to_json)
                    .unwrap_or(serde_json::Value::Null);
                if actual == expected {
                    if let Some(target) = route.get("target").and_then(|v| v.as_str()) {
                        delta.insert(keys::NEXT_NODE, Value::str(target));
                        return Ok(delta);
                    }
                }
            }
        }

        if let Some(default) = node.config.get("default").and_then(|v| v.as_str()) {
            delta.insert(keys::NEXT_NODE, Value::str(default));
        }
        Ok(delta)
    }
}

// ===========================================================================
// Structural markers
// ===========================================================================

/// The gate itself does no work; the pause happens at the segment
/// boundary. It renders the approval prompt for the HITP surface.
pub struct HitpGateHandler;

#[async_trait]
impl NodeHandler for HitpGateHandler {
    fn handles(&self) -> NodeType {
        NodeType::Hitp
    }

    async fn execute(&self, node: &Node, state: &StateBag, _ctx: &RunContext) -> Result<StateBag> {
        let mut delta = StateBag::new();
        if let Some(prompt) = node.config.get("prompt").and_then(|v| v.as_str()) {
            delta.insert(
                "_hitp_prompt",
                Value::str(crate::template::render_str(prompt, state)),
            );
        }
        Ok(delta)
    }
}

/// Flags distributed mode; the fan-out plan is computed by the runner
/// from the dynamic edges.
pub struct BranchHandler;

#[async_trait]
impl NodeHandler for BranchHandler {
    fn handles(&self) -> NodeType {
        NodeType::Branch
    }

    async fn execute(&self, _node: &Node, _state: &StateBag, _ctx: &RunContext) -> Result<StateBag> {
        let mut delta = StateBag::new();
        delta.insert(keys::DISTRIBUTED_MODE, Value::bool(true));
        Ok(delta)
    }
}

/// Loop headers steer the iteration: re-enter the body, or take the
/// exit edge once the `until` condition holds. The hard cap itself is
/// enforced by the runner at segment entry, not here.
///
/// Config shape: `{"body": "node", "exit": "node",
/// "until": {"path": "k", "equals": v}, "max_iterations": N}`.
pub struct LoopHeaderHandler;

#[async_trait]
impl NodeHandler for LoopHeaderHandler {
    fn handles(&self) -> NodeType {
        NodeType::Loop
    }

    async fn execute(&self, node: &Node, state: &StateBag, _ctx: &RunContext) -> Result<StateBag> {
        let mut delta = StateBag::new();
        if let Some(max) = node.config_u64("max_iterations") {
            delta.insert(keys::MAX_LOOP_ITERATIONS, Value::uint(max));
        }

        let exit_now = node
            .config
            .get("until")
            .map(|until| {
                let path = until.get("path").and_then(|v| v.as_str()).unwrap_or("");
                let expected = until.get("equals").cloned().unwrap_or(serde_json::Value::Bool(true));
                let actual = state
                    .get_path(path)
                    .map(Value::to_json)
                    .unwrap_or(serde_json::Value::Null);
                actual == expected
            })
            .unwrap_or(false);

        let target = if exit_now {
            node.config_str("exit")
        } else {
            node.config_str("body")
        };
        if let Some(target) = target {
            delta.insert(keys::NEXT_NODE, Value::str(target));
        }
        Ok(delta)
    }
}

/// Fire-and-forget child start; completion arrives by callback.
pub struct SubgraphHandler;

#[async_trait]
impl NodeHandler for SubgraphHandler {
    fn handles(&self) -> NodeType {
        NodeType::Subgraph
    }

    async fn execute(&self, node: &Node, _state: &StateBag, _ctx: &RunContext) -> Result<StateBag> {
        let reference = node.config_str("workflow_ref").ok_or_else(|| {
            Error::validation(format!("subgraph node '{}' has no workflow_ref", node.id))
        })?;
        let mut delta = StateBag::new();
        delta.insert("_subgraph_started", Value::str(reference));
        Ok(delta)
    }
}

pub struct AggregatorMarkerHandler;

#[async_trait]
impl NodeHandler for AggregatorMarkerHandler {
    fn handles(&self) -> NodeType {
        NodeType::Aggregator
    }

    async fn execute(&self, _node: &Node, _state: &StateBag, _ctx: &RunContext) -> Result<StateBag> {
        Ok(StateBag::new())
    }
}

pub struct GovernorMarkerHandler;

#[async_trait]
impl NodeHandler for GovernorMarkerHandler {
    fn handles(&self) -> NodeType {
        NodeType::Governor
    }

    async fn execute(&self, _node: &Node, _state: &StateBag, _ctx: &RunContext) -> Result<StateBag> {
        Ok(StateBag::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;

    fn ctx() -> RunContext {
        RunContext::default()
    }

    #[tokio::test]
    async fn operator_renders_output_from_state() {
        let node = Node::new("op", NodeType::Operator).with_config(serde_json::json!({
            "output": {"greeting": "hi {{name}}"}
        }));
        let state = StateBag::from_json(serde_json::json!({"name": "ada"}));
        let delta = OperatorHandler.execute(&node, &state, &ctx()).await.unwrap();
        assert_eq!(delta.get_str("greeting"), Some("hi ada"));
    }

    #[tokio::test]
    async fn operator_fail_with_raises() {
        let node = Node::new("op", NodeType::Operator)
            .with_config(serde_json::json!({"fail_with": "SecurityViolation: bad"}));
        let err = OperatorHandler
            .execute(&node, &StateBag::new(), &ctx())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("SecurityViolation"));
    }

    #[tokio::test]
    async fn llm_handler_parses_json_output() {
        let client = Arc::new(ScriptedLlmClient::new(vec![Ok(r#"{"answer": 42}"#.into())]));
        let handler = LlmNodeHandler::new(client, NodeType::Llm);
        let node = Node::new("ask", NodeType::Llm).with_config(serde_json::json!({
            "prompt": "solve", "parse_json": true
        }));
        let delta = handler.execute(&node, &StateBag::new(), &ctx()).await.unwrap();
        assert_eq!(delta.get_u64("answer"), Some(42));
        assert!(delta.get("_gas_used").is_some());
    }

    #[tokio::test]
    async fn llm_handler_invalid_json_is_operator_error() {
        let client = Arc::new(ScriptedLlmClient::new(vec![Ok("not json".into())]));
        let handler = LlmNodeHandler::new(client, NodeType::Llm);
        let node = Node::new("ask", NodeType::Llm)
            .with_config(serde_json::json!({"prompt": "p", "parse_json": true}));
        let err = handler
            .execute(&node, &StateBag::new(), &ctx())
            .await
            .unwrap_err();
        assert!(err.to_string().to_lowercase().contains("invalid json"));
    }

    #[tokio::test]
    async fn agent_output_carries_provenance() {
        let client = Arc::new(ScriptedLlmClient::new(vec![Ok("done".into())]));
        let handler = LlmNodeHandler::new(client, NodeType::Agent);
        let node = Node::new("bot", NodeType::Agent).with_config(serde_json::json!({
            "prompt": "act", "plan": "step 1 then step 2"
        }));
        let delta = handler.execute(&node, &StateBag::new(), &ctx()).await.unwrap();
        assert_eq!(delta.get_str("agent_output"), Some("done"));
        assert_eq!(
            delta.get_path("_agent_meta.agent_id").and_then(Value::as_str),
            Some("bot")
        );
        assert!(delta.get_path("_agent_meta.plan_hash").is_some());
    }

    #[tokio::test]
    async fn route_condition_sets_next_node() {
        let node = Node::new("route", NodeType::RouteCondition).with_config(serde_json::json!({
            "routes": [
                {"when": {"path": "verdict", "equals": "yes"}, "target": "approve"},
                {"when": {"path": "verdict", "equals": "no"}, "target": "reject"}
            ],
            "default": "review"
        }));
        let state = StateBag::from_json(serde_json::json!({"verdict": "no"}));
        let delta = RouteConditionHandler
            .execute(&node, &state, &ctx())
            .await
            .unwrap();
        assert_eq!(delta.get_str(keys::NEXT_NODE), Some("reject"));

        let delta = RouteConditionHandler
            .execute(&node, &StateBag::new(), &ctx())
            .await
            .unwrap();
        assert_eq!(delta.get_str(keys::NEXT_NODE), Some("review"));
    }

    #[tokio::test]
    async fn gas_accumulates_across_calls() {
        let client = Arc::new(ScriptedLlmClient::new(vec![Ok("a".into())]).with_cost(0.25));
        let handler = LlmNodeHandler::new(client, NodeType::Llm);
        let node = Node::new("ask", NodeType::Llm).with_config(serde_json::json!({"prompt": "p"}));
        let state = StateBag::from_json(serde_json::json!({"_gas_used": 1.5}));
        let delta = handler.execute(&node, &state, &ctx()).await.unwrap();
        let gas = match delta.get("_gas_used").unwrap() {
            Value::Scalar(s) => s.as_f64().unwrap(),
            _ => panic!(),
        };
        assert!((gas - 1.75).abs() < 1e-9);
    }
}
