//! Tests for the segment runner: dispatch, routing, boundaries,
//! failure classification, and advice injection.

use capstan_core::{
    keys, CoreConfig, Edge, Node, NodeType, StateBag, Value, WorkflowDefinition,
};
use capstan_partition::Partitioner;
use capstan_runner::{
    default_registry, RunContext, ScriptedLlmClient, SegmentRunner, SegmentStatus, Transition,
};
use std::sync::Arc;

fn build_runner(
    workflow: WorkflowDefinition,
    llm: Arc<ScriptedLlmClient>,
) -> SegmentRunner {
    let config = CoreConfig::default();
    let partition = Partitioner::new(config.clone())
        .partition(&workflow)
        .expect("partition");
    SegmentRunner::new(
        Arc::new(workflow),
        Arc::new(partition),
        Arc::new(default_registry(llm)),
        config.global_loop_cap,
    )
}

fn op(id: &str, output: serde_json::Value) -> Node {
    Node::new(id, NodeType::Operator).with_config(serde_json::json!({"output": output}))
}

fn init_state() -> StateBag {
    StateBag::from_json(serde_json::json!({
        "segment_to_run": 0,
        "loop_counter": 0,
        "max_loop_iterations": 10
    }))
}

// ===========================================================================
// Straight-line execution
// ===========================================================================

#[tokio::test]
async fn three_operators_complete_in_order() {
    let workflow = WorkflowDefinition {
        workflow_id: "wf".into(),
        name: "t".into(),
        nodes: vec![
            op("n1", serde_json::json!({"k1": "a"})),
            op("n2", serde_json::json!({"k2": "b"})),
            op("n3", serde_json::json!({"k3": "c"})),
        ],
        edges: vec![Edge::normal("n1", "n2"), Edge::normal("n2", "n3")],
    };
    let runner = build_runner(workflow, Arc::new(ScriptedLlmClient::default()));

    let outcome = runner
        .run_segment(0, init_state(), &RunContext::default())
        .await
        .unwrap();

    assert_eq!(outcome.status, SegmentStatus::Succeeded);
    assert_eq!(outcome.transition, Transition::Complete);
    assert_eq!(outcome.next_segment, None);
    assert_eq!(outcome.state.get_str("k1"), Some("a"));
    assert_eq!(outcome.state.get_str("k2"), Some("b"));
    assert_eq!(outcome.state.get_str("k3"), Some("c"));
    assert_eq!(outcome.delta.get_str("k1"), Some("a"));
}

// ===========================================================================
// Templates see upstream writes
// ===========================================================================

#[tokio::test]
async fn later_nodes_template_over_earlier_deltas() {
    let workflow = WorkflowDefinition {
        workflow_id: "wf".into(),
        name: "t".into(),
        nodes: vec![
            op("n1", serde_json::json!({"name": "ada"})),
            op("n2", serde_json::json!({"greeting": "hello {{name}}"})),
        ],
        edges: vec![Edge::normal("n1", "n2")],
    };
    let runner = build_runner(workflow, Arc::new(ScriptedLlmClient::default()));
    let outcome = runner
        .run_segment(0, init_state(), &RunContext::default())
        .await
        .unwrap();
    assert_eq!(outcome.state.get_str("greeting"), Some("hello ada"));
}

// ===========================================================================
// HITP boundary
// ===========================================================================

#[tokio::test]
async fn hitp_gate_pauses_with_next_segment() {
    let workflow = WorkflowDefinition {
        workflow_id: "wf".into(),
        name: "t".into(),
        nodes: vec![
            op("a", serde_json::json!({"step": "a"})),
            Node::new("gate", NodeType::Hitp)
                .with_config(serde_json::json!({"prompt": "approve {{step}}?"})),
            op("b", serde_json::json!({"step": "b"})),
        ],
        edges: vec![Edge::normal("a", "gate"), Edge::hitp("gate", "b")],
    };
    let runner = build_runner(workflow, Arc::new(ScriptedLlmClient::default()));

    let outcome = runner
        .run_segment(0, init_state(), &RunContext::default())
        .await
        .unwrap();

    assert_eq!(outcome.transition, Transition::PausedForHitp);
    assert_eq!(outcome.next_segment, Some(1));
    assert_eq!(outcome.state.get_str("_hitp_prompt"), Some("approve a?"));
}

// ===========================================================================
// Branch fan-out
// ===========================================================================

#[tokio::test]
async fn branch_node_emits_fanout_plan() {
    let workflow = WorkflowDefinition {
        workflow_id: "wf".into(),
        name: "t".into(),
        nodes: vec![
            Node::new("fan", NodeType::Branch)
                .with_config(serde_json::json!({"allow_failure": true})),
            op("c1", serde_json::json!({"r1": 1})),
            op("c2", serde_json::json!({"r2": 2})),
            op("c3", serde_json::json!({"r3": 3})),
        ],
        edges: vec![
            Edge::dynamic("fan", "c1"),
            Edge::dynamic("fan", "c2"),
            Edge::dynamic("fan", "c3"),
        ],
    };
    let runner = build_runner(workflow, Arc::new(ScriptedLlmClient::default()));

    let outcome = runner
        .run_segment(0, init_state(), &RunContext::default())
        .await
        .unwrap();

    assert_eq!(outcome.transition, Transition::BranchFanout);
    assert_eq!(outcome.branch_plan.len(), 3);
    assert_eq!(outcome.branch_plan[0].entry_node, "c1");
    assert!(outcome.branch_plan.iter().all(|b| b.allow_failure));
    assert_eq!(
        outcome.state.get_bool(keys::DISTRIBUTED_MODE),
        Some(true)
    );
}

// ===========================================================================
// Loop behavior
// ===========================================================================

fn loop_workflow() -> WorkflowDefinition {
    WorkflowDefinition {
        workflow_id: "wf".into(),
        name: "t".into(),
        nodes: vec![
            op("start", serde_json::json!({"started": true})),
            Node::new("head", NodeType::Loop).with_config(serde_json::json!({
                "max_iterations": 5,
                "body": "body",
                "exit": "done",
                "until": {"path": "finished", "equals": true}
            })),
            op("body", serde_json::json!({"work": "done-some"})),
            op("done", serde_json::json!({"wrapped_up": true})),
        ],
        edges: vec![
            Edge::normal("start", "head"),
            Edge::normal("head", "body"),
            Edge::normal("body", "head"),
            Edge::normal("head", "done"),
        ],
    }
}

#[tokio::test]
async fn loop_body_emits_loop_continue() {
    let runner = build_runner(loop_workflow(), Arc::new(ScriptedLlmClient::default()));
    // Segment 1 is the loop body ([head, body]).
    let mut state = init_state();
    state.insert(keys::MAX_LOOP_ITERATIONS, Value::uint(5));

    let outcome = runner
        .run_segment(1, state, &RunContext::default())
        .await
        .unwrap();

    assert_eq!(outcome.transition, Transition::LoopContinue);
    assert!(outcome.is_loop_body);
    assert_eq!(outcome.next_segment, Some(1));
}

#[tokio::test]
async fn loop_entry_past_cap_fails_semantically() {
    let runner = build_runner(loop_workflow(), Arc::new(ScriptedLlmClient::default()));
    let mut state = init_state();
    state.insert(keys::MAX_LOOP_ITERATIONS, Value::uint(5));
    state.insert(keys::LOOP_COUNTER, Value::uint(5));

    let outcome = runner
        .run_segment(1, state, &RunContext::default())
        .await
        .unwrap();

    assert_eq!(outcome.status, SegmentStatus::FailedSemantic);
    let failure = outcome.failure.unwrap();
    assert_eq!(failure.code, "LoopLimitExceeded");
    assert_eq!(outcome.state.get_u64(keys::LOOP_COUNTER), Some(5));
}

#[tokio::test]
async fn loop_exits_when_until_condition_holds() {
    let runner = build_runner(loop_workflow(), Arc::new(ScriptedLlmClient::default()));
    let mut state = init_state();
    state.insert("finished", Value::bool(true));

    let outcome = runner
        .run_segment(1, state, &RunContext::default())
        .await
        .unwrap();

    assert_eq!(outcome.transition, Transition::Complete);
    assert_eq!(outcome.next_segment, Some(2));
}

// ===========================================================================
// Failure classification
// ===========================================================================

#[tokio::test]
async fn semantic_operator_failure_is_not_healable() {
    let workflow = WorkflowDefinition {
        workflow_id: "wf".into(),
        name: "t".into(),
        nodes: vec![Node::new("bad", NodeType::Operator)
            .with_config(serde_json::json!({"fail_with": "SecurityViolation: untrusted jump"}))],
        edges: vec![],
    };
    let runner = build_runner(workflow, Arc::new(ScriptedLlmClient::default()));
    let outcome = runner
        .run_segment(0, init_state(), &RunContext::default())
        .await
        .unwrap();
    assert_eq!(outcome.status, SegmentStatus::FailedSemantic);
}

#[tokio::test]
async fn invalid_llm_json_is_deterministic() {
    let workflow = WorkflowDefinition {
        workflow_id: "wf".into(),
        name: "t".into(),
        nodes: vec![Node::new("ask", NodeType::Llm)
            .with_config(serde_json::json!({"prompt": "p", "parse_json": true}))],
        edges: vec![],
    };
    let llm = Arc::new(ScriptedLlmClient::new(vec![Ok("{broken".into())]));
    let runner = build_runner(workflow, llm);
    let outcome = runner
        .run_segment(0, init_state(), &RunContext::default())
        .await
        .unwrap();
    assert_eq!(outcome.status, SegmentStatus::FailedDeterministic);
}

#[tokio::test]
async fn routing_ambiguity_fails_semantically() {
    let workflow = WorkflowDefinition {
        workflow_id: "wf".into(),
        name: "t".into(),
        nodes: vec![
            op("a", serde_json::json!({"x": 1})),
            op("b", serde_json::json!({})),
            op("c", serde_json::json!({})),
        ],
        edges: vec![Edge::normal("a", "b"), Edge::normal("a", "c")],
    };
    let runner = build_runner(workflow, Arc::new(ScriptedLlmClient::default()));
    let outcome = runner
        .run_segment(0, init_state(), &RunContext::default())
        .await
        .unwrap();
    assert_eq!(outcome.status, SegmentStatus::FailedSemantic);
    assert_eq!(outcome.failure.unwrap().code, "RoutingAmbiguityError");
}

// ===========================================================================
// Advice injection
// ===========================================================================

#[tokio::test]
async fn suggested_fix_reaches_the_prompt_exactly_once() {
    let workflow = WorkflowDefinition {
        workflow_id: "wf".into(),
        name: "t".into(),
        nodes: vec![Node::new("ask", NodeType::Llm)
            .with_config(serde_json::json!({"prompt": "Summarize the input."}))],
        edges: vec![],
    };
    let llm = Arc::new(ScriptedLlmClient::new(vec![Ok("fine".into())]));
    let runner = build_runner(workflow, llm.clone());

    let mut state = init_state();
    state.insert_json(
        keys::SELF_HEALING_METADATA,
        serde_json::json!({"suggested_fix": "Escape JSON special chars."}),
    );

    let outcome = runner
        .run_segment(0, state, &RunContext::default().with_healing_count(1))
        .await
        .unwrap();
    assert_eq!(outcome.status, SegmentStatus::Succeeded);

    let prompts = llm.seen_prompts();
    assert_eq!(prompts.len(), 1);
    assert_eq!(prompts[0].matches("<user_advice>").count(), 1);
    assert!(prompts[0].contains("Escape JSON special chars."));
}

// ===========================================================================
// Cancellation
// ===========================================================================

#[tokio::test]
async fn cancelled_context_aborts_before_work() {
    let workflow = WorkflowDefinition {
        workflow_id: "wf".into(),
        name: "t".into(),
        nodes: vec![op("a", serde_json::json!({"x": 1}))],
        edges: vec![],
    };
    let runner = build_runner(workflow, Arc::new(ScriptedLlmClient::default()));
    let ctx = RunContext::default();
    ctx.cancel_token().cancel();

    let outcome = runner.run_segment(0, init_state(), &ctx).await.unwrap();
    assert_eq!(outcome.status, SegmentStatus::Aborted);
    assert!(outcome.state.get("x").is_none());
}
