//! Gateway tests: ownership scoping, save-time validation, and the
//! stop transition.

use capstan_core::{Edge, Error, ExecutionRecord, ExecutionStatus, Node, NodeType, WorkflowDefinition};
use capstan_gateway::{build_state, AppState, GatewaySettings, ResolvedAuth};
use capstan_store::ExecutionStore;
use std::sync::Arc;

fn test_state() -> Arc<AppState> {
    let dir = tempfile::tempdir().unwrap();
    let settings = GatewaySettings {
        data_dir: dir.path().to_path_buf(),
        ..Default::default()
    };
    // The tempdir lives for the process; leak it so the blob store's
    // root stays valid.
    std::mem::forget(dir);
    build_state(&settings, ResolvedAuth::disabled())
}

fn two_node_workflow(id: &str) -> WorkflowDefinition {
    WorkflowDefinition {
        workflow_id: id.into(),
        name: id.into(),
        nodes: vec![
            Node::new("a", NodeType::Operator),
            Node::new("b", NodeType::Operator),
        ],
        edges: vec![Edge::normal("a", "b")],
    }
}

#[tokio::test]
async fn save_rejects_dangling_edges() {
    let state = test_state();
    let mut workflow = two_node_workflow("wf-1");
    workflow.edges.push(Edge::normal("b", "ghost"));
    let err = state.save_workflow("owner-1", workflow).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn workflows_are_scoped_per_owner() {
    let state = test_state();
    state
        .save_workflow("owner-1", two_node_workflow("wf-1"))
        .unwrap();

    assert!(state.workflow("owner-1", "wf-1").is_ok());
    // Another tenant sees nothing — not a 403-shaped error.
    let err = state.workflow("owner-2", "wf-1").unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn cross_tenant_execution_reads_are_not_found() {
    let state = test_state();
    let record = ExecutionRecord::new("arn-1", "owner-1", "wf-1", serde_json::json!({}));
    state.executions.put(&record).await.unwrap();

    assert!(state.owned_execution("owner-1", "arn-1").await.is_ok());
    let err = state.owned_execution("owner-2", "arn-1").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn double_stop_conflicts() {
    let state = test_state();
    let record = ExecutionRecord::new("arn-1", "owner-1", "wf-1", serde_json::json!({}));
    state.executions.put(&record).await.unwrap();

    state
        .executions
        .transition_status("arn-1", ExecutionStatus::Running, ExecutionStatus::Aborted)
        .await
        .unwrap();
    let err = state
        .executions
        .transition_status("arn-1", ExecutionStatus::Running, ExecutionStatus::Aborted)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
}
