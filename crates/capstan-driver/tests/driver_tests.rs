//! End-to-end scenarios over the in-process driver with in-memory
//! stores and a scripted LLM client.

use capstan_core::{
    keys, CoreConfig, Edge, ExecutionStatus, Node, NodeType, StateBag, Value, WorkflowDefinition,
};
use capstan_driver::{DriverDeps, GcWorker, SubmitRequest, WorkflowDriver};
use capstan_governance::{default_constitution, GovernanceRing, GuardrailConfig};
use capstan_kernel::StateKernel;
use capstan_runner::{default_registry, ScriptedLlmClient};
use capstan_store::{
    BlobStore, ExecutionStore, GcQueue, ManifestStore, MemoryBlobStore, MemoryExecutionStore,
    MemoryGcQueue, MemoryIdempotencyStore, MemoryManifestStore, MemoryTokenStore, TokenStore,
};
use std::sync::Arc;

struct Harness {
    driver: WorkflowDriver,
    blobs: Arc<MemoryBlobStore>,
    manifests: Arc<MemoryManifestStore>,
    gc: Arc<MemoryGcQueue>,
    tokens: Arc<MemoryTokenStore>,
    executions: Arc<MemoryExecutionStore>,
    kernel: Arc<StateKernel>,
    governance: Arc<GovernanceRing>,
    llm: Arc<ScriptedLlmClient>,
}

fn harness(llm: ScriptedLlmClient) -> Harness {
    let config = CoreConfig::default();
    let blobs = Arc::new(MemoryBlobStore::new());
    let manifests = Arc::new(MemoryManifestStore::new());
    let gc = Arc::new(MemoryGcQueue::default());
    let tokens = Arc::new(MemoryTokenStore::new());
    let executions = Arc::new(MemoryExecutionStore::new());
    let idempotency = Arc::new(MemoryIdempotencyStore::new());
    let kernel = Arc::new(StateKernel::new(
        blobs.clone(),
        manifests.clone(),
        gc.clone(),
        config.clone(),
    ));
    let governance = Arc::new(GovernanceRing::new(
        GuardrailConfig::default(),
        default_constitution(),
    ));
    let llm = Arc::new(llm);

    let driver = WorkflowDriver::new(DriverDeps {
        kernel: kernel.clone(),
        executions: executions.clone(),
        idempotency,
        tokens: tokens.clone(),
        governance: governance.clone(),
        registry: Arc::new(default_registry(llm.clone())),
        notifier: None,
        config,
    });

    Harness {
        driver,
        blobs,
        manifests,
        gc,
        tokens,
        executions,
        kernel,
        governance,
        llm,
    }
}

fn op(id: &str, output: serde_json::Value) -> Node {
    Node::new(id, NodeType::Operator).with_config(serde_json::json!({"output": output}))
}

fn wf(id: &str, nodes: Vec<Node>, edges: Vec<Edge>) -> WorkflowDefinition {
    WorkflowDefinition {
        workflow_id: id.into(),
        name: id.into(),
        nodes,
        edges,
    }
}

fn submit_req(workflow: WorkflowDefinition, initial: serde_json::Value) -> SubmitRequest {
    SubmitRequest {
        workflow,
        initial_state: initial,
        idempotency_key: None,
        owner_id: "owner-1".into(),
    }
}

// ===========================================================================
// 1. Happy path, inline state
// ===========================================================================

#[tokio::test]
async fn happy_path_three_operators() {
    let h = harness(ScriptedLlmClient::default());
    let workflow = wf(
        "wf-happy",
        vec![
            op("n1", serde_json::json!({"k1": "a"})),
            op("n2", serde_json::json!({"k2": "b"})),
            op("n3", serde_json::json!({"k3": "c"})),
        ],
        vec![Edge::normal("n1", "n2"), Edge::normal("n2", "n3")],
    );

    let outcome = h
        .driver
        .submit(submit_req(workflow, serde_json::json!({})))
        .await
        .unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Succeeded);
    let output = outcome.output.unwrap();
    assert_eq!(output["k1"], "a");
    assert_eq!(output["k2"], "b");
    assert_eq!(output["k3"], "c");
    assert_eq!(output[keys::LOOP_COUNTER], 0);

    // Init manifest plus one per committed segment, all committed and
    // chained.
    let manifests = h.manifests.list(&outcome.execution_arn).await.unwrap();
    assert_eq!(manifests.len(), 2);
    assert!(manifests.iter().all(|m| m.committed));
    assert_eq!(
        manifests[1].previous_manifest_id.as_deref(),
        Some(manifests[0].manifest_id.as_str())
    );
}

// ===========================================================================
// 2. Large payload offload
// ===========================================================================

#[tokio::test]
async fn large_payload_is_pointerized() {
    let h = harness(ScriptedLlmClient::default());
    let documents: Vec<String> = (0..300).map(|i| format!("{i}:{}", "x".repeat(1024))).collect();
    let workflow = wf(
        "wf-big",
        vec![op("producer", serde_json::json!({"documents": documents}))],
        vec![],
    );

    let outcome = h
        .driver
        .submit(submit_req(workflow, serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Succeeded);

    let record = h.executions.get(&outcome.execution_arn).await.unwrap();
    let manifest_id = record.current_manifest_id.unwrap();
    let manifest = h
        .manifests
        .get(&outcome.execution_arn, &manifest_id)
        .await
        .unwrap();

    assert!(manifest.pointer_map.contains_key("documents"));

    // Inline snapshot (the root block) stays under the threshold and
    // holds no pointer beneath another pointer.
    let root_key = format!(
        "workflows/owner-1/wf-big/{}/blocks/{}",
        outcome.execution_arn, manifest.checksum
    );
    let root = h.blobs.get(&root_key).await.unwrap();
    assert!(root.len() <= 200 * 1024);
    let inline: StateBag = serde_json::from_slice(&root).unwrap();
    assert!(!inline.has_nested_pointer());
    assert!(inline.get("documents").unwrap().is_pointer());

    // Hydration restores the full payload.
    let hydrated = h
        .kernel
        .hydrate(&outcome.execution_arn, &manifest_id)
        .await
        .unwrap();
    assert_eq!(
        hydrated.get("documents").and_then(Value::as_seq).unwrap().len(),
        300
    );
}

// ===========================================================================
// 3. HITP pause and resume
// ===========================================================================

#[tokio::test]
async fn hitp_pause_then_resume() {
    let h = harness(ScriptedLlmClient::default());
    let workflow = wf(
        "wf-hitp",
        vec![
            op("a", serde_json::json!({"step_a": true})),
            Node::new("gate", NodeType::Hitp)
                .with_config(serde_json::json!({"prompt": "approve?"})),
            op("b", serde_json::json!({"step_b": "{{decision}}"})),
        ],
        vec![Edge::normal("a", "gate"), Edge::hitp("gate", "b")],
    );

    let outcome = h
        .driver
        .submit(submit_req(workflow.clone(), serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(outcome.status, ExecutionStatus::PausedForHitp);

    let arn = outcome.execution_arn.clone();
    let token = h.tokens.get(&arn).await.unwrap().expect("token stored");
    assert_eq!(token.owner_id, "owner-1");

    let record = h.executions.get(&arn).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::PausedForHitp);

    let resumed = h
        .driver
        .resume(
            &arn,
            &token.task_token,
            serde_json::json!({"decision": "approve"}),
            workflow,
        )
        .await
        .unwrap();

    assert_eq!(resumed.status, ExecutionStatus::Succeeded);
    let output = resumed.output.unwrap();
    assert_eq!(output["decision"], "approve");
    assert_eq!(output["step_b"], "approve");

    // The token is consumed — no double resume.
    assert!(h.tokens.get(&arn).await.unwrap().is_none());
}

// ===========================================================================
// 4. Distributed branch with one failure
// ===========================================================================

#[tokio::test]
async fn branch_fanout_with_partial_failure() {
    let h = harness(ScriptedLlmClient::default());
    let workflow = wf(
        "wf-branch",
        vec![
            Node::new("fan", NodeType::Branch),
            op("c1", serde_json::json!({"results": ["r1"]})),
            Node::new("c2", NodeType::Operator).with_config(serde_json::json!({
                "fail_with": "SecurityViolation: child 2 misbehaved",
                "allow_failure": true
            })),
            op("c3", serde_json::json!({"results": ["r3"]})),
        ],
        vec![
            Edge::dynamic("fan", "c1"),
            Edge::dynamic("fan", "c2"),
            Edge::dynamic("fan", "c3"),
        ],
    );

    let outcome = h
        .driver
        .submit(submit_req(workflow, serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Succeeded);

    let output = outcome.output.unwrap();
    let report = &output["_aggregate_report"];
    assert_eq!(report["status"], "COMPLETED");
    assert_eq!(report["total_chunks"], 3);
    assert_eq!(report["successful_chunks"], 2);
    assert_eq!(report["failed_chunks"], 1);

    let errors = output[keys::BRANCH_ERRORS].as_array().unwrap();
    assert_eq!(errors.len(), 1);
    assert!(errors[0]["error"]
        .as_str()
        .unwrap()
        .contains("child 2 misbehaved"));

    // Successful branches merged in branch-index order.
    let results = output["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0], "r1");
    assert_eq!(results[1], "r3");
}

// ===========================================================================
// 5. Self-heal recovery
// ===========================================================================

#[tokio::test]
async fn self_heal_recovers_after_two_bad_responses() {
    let llm = ScriptedLlmClient::new(vec![
        Ok("not json at all".into()),
        Ok("{still broken".into()),
        Ok(r#"{"answer": "parsed"}"#.into()),
    ]);
    let h = harness(llm);
    let workflow = wf(
        "wf-heal",
        vec![Node::new("ask", NodeType::Llm).with_config(serde_json::json!({
            "prompt": "Return JSON.",
            "parse_json": true
        }))],
        vec![],
    );

    let outcome = h
        .driver
        .submit(submit_req(workflow, serde_json::json!({})))
        .await
        .unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Succeeded);
    assert_eq!(outcome.output.unwrap()["answer"], "parsed");

    let record = h.executions.get(&outcome.execution_arn).await.unwrap();
    assert_eq!(record.healing_count, 2);

    // Advice is injected idempotently: at most one sandbox per prompt.
    let prompts = h.llm.seen_prompts();
    assert_eq!(prompts.len(), 3);
    assert_eq!(prompts[0].matches("<user_advice>").count(), 0);
    assert_eq!(prompts[1].matches("<user_advice>").count(), 1);
    assert_eq!(prompts[2].matches("<user_advice>").count(), 1);
}

#[tokio::test]
async fn self_heal_circuit_breaker_terminates() {
    let llm = ScriptedLlmClient::new(vec![
        Ok("bad1".into()),
        Ok("bad2".into()),
        Ok("bad3".into()),
        Ok("bad4".into()),
        Ok("bad5".into()),
    ]);
    let h = harness(llm);
    let workflow = wf(
        "wf-heal-fail",
        vec![Node::new("ask", NodeType::Llm).with_config(serde_json::json!({
            "prompt": "Return JSON.",
            "parse_json": true
        }))],
        vec![],
    );

    let outcome = h
        .driver
        .submit(submit_req(workflow, serde_json::json!({})))
        .await
        .unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Failed);
    // 1 original attempt + 3 healed retries, never more.
    assert_eq!(h.llm.seen_prompts().len(), 4);
    let record = h.executions.get(&outcome.execution_arn).await.unwrap();
    assert_eq!(record.healing_count, 3);
}

// ===========================================================================
// 6. Loop cap enforcement
// ===========================================================================

#[tokio::test]
async fn loop_cap_fails_with_counter_at_max() {
    let h = harness(ScriptedLlmClient::default());
    let workflow = wf(
        "wf-loop",
        vec![
            op("start", serde_json::json!({"started": true})),
            Node::new("head", NodeType::Loop).with_config(serde_json::json!({
                "max_iterations": 5,
                "body": "body",
                "exit": "done",
                "until": {"path": "finished", "equals": true}
            })),
            op("body", serde_json::json!({"worked": true})),
            op("done", serde_json::json!({"finished_up": true})),
        ],
        vec![
            Edge::normal("start", "head"),
            Edge::normal("head", "body"),
            Edge::normal("body", "head"),
            Edge::normal("head", "done"),
        ],
    );

    let outcome = h
        .driver
        .submit(submit_req(workflow, serde_json::json!({})))
        .await
        .unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Failed);
    let record = h.executions.get(&outcome.execution_arn).await.unwrap();
    assert_eq!(record.error.as_deref(), Some("LoopLimitExceeded"));

    let manifest_id = record.current_manifest_id.unwrap();
    let final_state = h
        .kernel
        .hydrate(&outcome.execution_arn, &manifest_id)
        .await
        .unwrap();
    assert_eq!(final_state.get_u64(keys::LOOP_COUNTER), Some(5));
}

// ===========================================================================
// 7. Routing ambiguity
// ===========================================================================

#[tokio::test]
async fn routing_ambiguity_rejected_at_save_or_runtime() {
    let workflow = wf(
        "wf-ambiguous",
        vec![
            op("a", serde_json::json!({"x": 1})),
            op("b", serde_json::json!({})),
            op("c", serde_json::json!({})),
        ],
        vec![Edge::normal("a", "b"), Edge::normal("a", "c")],
    );

    // Strict save-time validation rejects the shape outright.
    assert!(workflow.validate_strict().is_err());

    // Authored dynamically (lenient save), the runtime fails the
    // segment with the routing error instead.
    let h = harness(ScriptedLlmClient::default());
    let outcome = h
        .driver
        .submit(submit_req(workflow, serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Failed);
    let record = h.executions.get(&outcome.execution_arn).await.unwrap();
    assert_eq!(record.error.as_deref(), Some("RoutingAmbiguityError"));
}

// ===========================================================================
// 8. Optimistic rollback
// ===========================================================================

#[tokio::test]
async fn governance_rejection_rolls_back_and_feeds_back() {
    let llm = ScriptedLlmClient::new(vec![
        // First turn leaks PII -> critical violation -> rollback.
        Ok("Please enter your password and card 4111-1111-1111-1111".into()),
        // Second turn behaves.
        Ok("Summary prepared without sensitive data.".into()),
    ]);
    let h = harness(llm);
    let workflow = wf(
        "wf-agent",
        vec![Node::new("bot", NodeType::Agent).with_config(serde_json::json!({
            "prompt": "Act on the request.",
            "plan": "summarize then stop"
        }))],
        vec![],
    );

    let outcome = h
        .driver
        .submit(submit_req(workflow, serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Succeeded);

    // Rejected manifest's blocks reached the GC queue.
    assert!(h.gc.pending() > 0);
    let worker = GcWorker::new(h.blobs.clone(), h.gc.clone());
    let report = worker.drain_all().await;
    assert!(report.deleted + report.skipped_missing > 0);

    // The agent's second prompt carried the violation feedback.
    let prompts = h.llm.seen_prompts();
    assert_eq!(prompts.len(), 2);
    assert_eq!(prompts[1].matches("<user_advice>").count(), 1);
    assert!(prompts[1].contains("flagged by governance"));

    // Trust dropped by alpha * anomaly on the rejection, then recovered
    // slightly on the clean pass.
    let trust = h.governance.trust_score("bot").unwrap();
    assert!(trust < 0.8);
    assert!(trust > 0.0);

    // The surviving output is the clean second turn.
    let output = outcome.output.unwrap();
    assert_eq!(output["agent_output"], "Summary prepared without sensitive data.");
}

// ===========================================================================
// Idempotency
// ===========================================================================

#[tokio::test]
async fn duplicate_submits_share_one_execution() {
    let h = harness(ScriptedLlmClient::default());
    let workflow = wf(
        "wf-idem",
        vec![op("only", serde_json::json!({"ran": true}))],
        vec![],
    );

    let mut request = submit_req(workflow, serde_json::json!({"seed": 1}));
    request.idempotency_key = Some("fixed-key".into());

    let first = h.driver.submit(request.clone()).await.unwrap();
    assert_eq!(first.status, ExecutionStatus::Succeeded);
    assert!(!first.deduplicated);

    let second = h.driver.submit(request).await.unwrap();
    assert!(second.deduplicated);
    assert_eq!(second.execution_arn, first.execution_arn);
    assert_eq!(second.output.unwrap()["ran"], true);
}

// ===========================================================================
// External abort
// ===========================================================================

#[tokio::test]
async fn abort_flag_stops_before_next_segment() {
    let h = harness(ScriptedLlmClient::default());
    // Pause at a gate, abort externally, then resume: the driver must
    // observe the abort and refuse to continue.
    let workflow = wf(
        "wf-abort",
        vec![
            op("a", serde_json::json!({"step_a": true})),
            Node::new("gate", NodeType::Hitp).with_config(serde_json::json!({})),
            op("b", serde_json::json!({"step_b": true})),
        ],
        vec![Edge::normal("a", "gate"), Edge::hitp("gate", "b")],
    );

    let outcome = h
        .driver
        .submit(submit_req(workflow.clone(), serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(outcome.status, ExecutionStatus::PausedForHitp);
    let arn = outcome.execution_arn.clone();

    // External stop: PAUSED -> ABORTED via conditional transition.
    h.executions
        .transition_status(&arn, ExecutionStatus::PausedForHitp, ExecutionStatus::Aborted)
        .await
        .unwrap();

    let token = h.tokens.get(&arn).await.unwrap().unwrap();
    let resumed = h
        .driver
        .resume(&arn, &token.task_token, serde_json::json!({}), workflow)
        .await;

    // Either the resume transition conflicts (status is no longer
    // PAUSED) or the drive loop observes ABORTED; both refuse to run b.
    match resumed {
        Ok(outcome) => assert_eq!(outcome.status, ExecutionStatus::Aborted),
        Err(e) => assert!(e.to_string().contains("conflict")),
    }
    let record = h.executions.get(&arn).await.unwrap();
    assert!(record.output.is_none());
}
