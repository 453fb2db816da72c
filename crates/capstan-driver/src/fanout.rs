//! Distributed-map fan-out.
//!
//! Each branch runs as a child execution under a concurrency cap. A
//! child executes the nodes reachable from its entry within the fan-out
//! segment and commits its delta as a child manifest through the
//! kernel; the aggregator hydrates those manifests afterwards. Children
//! are unordered relative to each other — only the branch index orders
//! the merge.

use capstan_core::{keys, Segment, StateBag, Value};
use capstan_kernel::{StateKernel, SyncContext, SyncDelta};
use capstan_runner::{BranchSpec, HandlerRegistry, RouteTarget, RoutingResolver, RunContext};
use capstan_core::WorkflowDefinition;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// Result of one branch: its committed child manifest, or the error
/// message recorded into `_branch_errors`.
#[derive(Clone, Debug)]
pub struct BranchResult {
    pub spec: BranchSpec,
    pub outcome: std::result::Result<String, String>,
}

pub struct FanoutParams<'a> {
    pub execution_id: &'a str,
    pub owner_id: &'a str,
    pub workflow_id: &'a str,
    pub segment: &'a Segment,
}

/// Launch all branches, bounded by `max_concurrency`, and wait for the
/// full set. A child panic or handler error becomes that branch's
/// error; it never takes down the map.
pub async fn run_branches(
    kernel: Arc<StateKernel>,
    registry: Arc<HandlerRegistry>,
    workflow: Arc<WorkflowDefinition>,
    params: FanoutParams<'_>,
    branches: Vec<BranchSpec>,
    base_state: StateBag,
    max_concurrency: usize,
    ctx: &RunContext,
) -> Vec<BranchResult> {
    let semaphore = Arc::new(Semaphore::new(max_concurrency.max(1)));
    let mut handles = Vec::with_capacity(branches.len());

    for spec in branches {
        let permit_source = semaphore.clone();
        let kernel = kernel.clone();
        let registry = registry.clone();
        let workflow = workflow.clone();
        let segment = params.segment.clone();
        let state = base_state.clone();
        let ctx = ctx.clone();
        let child_execution = format!("{}#b{}", params.execution_id, spec.branch_index);
        let owner = params.owner_id.to_string();
        let wf_id = params.workflow_id.to_string();

        handles.push(tokio::spawn(async move {
            let _permit = permit_source.acquire_owned().await.expect("semaphore open");
            let outcome = run_child(
                &kernel,
                &registry,
                &workflow,
                &segment,
                &spec,
                state,
                &child_execution,
                &owner,
                &wf_id,
                &ctx,
            )
            .await;
            BranchResult { spec, outcome }
        }));
    }

    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        match handle.await {
            Ok(result) => results.push(result),
            Err(join_err) => {
                warn!("branch task panicked: {join_err}");
                // The panicked branch is unrecoverable but identifiable
                // only by position; record a placeholder failure.
                results.push(BranchResult {
                    spec: BranchSpec {
                        branch_index: results.len(),
                        entry_node: String::new(),
                        allow_failure: false,
                    },
                    outcome: Err(format!("branch task panicked: {join_err}")),
                });
            }
        }
    }
    results.sort_by_key(|r| r.spec.branch_index);
    results
}

/// One child: execute its reachable node chain inside the fan-out
/// segment, then commit the delta as a child manifest.
#[allow(clippy::too_many_arguments)]
async fn run_child(
    kernel: &StateKernel,
    registry: &HandlerRegistry,
    workflow: &WorkflowDefinition,
    segment: &Segment,
    spec: &BranchSpec,
    base_state: StateBag,
    child_execution: &str,
    owner_id: &str,
    workflow_id: &str,
    ctx: &RunContext,
) -> std::result::Result<String, String> {
    let mut state = base_state;
    state.insert(keys::DISTRIBUTED_MODE, Value::bool(true));
    let mut delta = StateBag::new();
    let mut current = spec.entry_node.clone();
    let mut steps = 0usize;

    loop {
        if ctx.is_cancelled() {
            return Err("branch cancelled".to_string());
        }
        steps += 1;
        if steps > segment.nodes.len() + 4 {
            return Err(format!(
                "branch {} exceeded {} steps inside the fan-out segment",
                spec.branch_index,
                segment.nodes.len() + 4
            ));
        }

        let Some(node) = workflow.node(&current) else {
            return Err(format!("branch entry node '{current}' not found"));
        };

        match registry.execute(node, &state, ctx).await {
            Ok(node_delta) => {
                for (key, value) in node_delta {
                    state.insert(key.clone(), value.clone());
                    delta.insert(key, value);
                }
            }
            Err(e) => return Err(e.to_string()),
        }

        let resolver = RoutingResolver::for_nodes(&workflow.nodes, node.effective_ring());
        let target = resolver
            .resolve_next_target(&node.id, &mut state, &workflow.edges)
            .map_err(|e| e.to_string())?;
        delta.remove(keys::NEXT_NODE);

        match target {
            RouteTarget::End => break,
            RouteTarget::Node(next) if segment.nodes.contains(&next) => current = next,
            // Leaving the segment ends the child; the parent resumes
            // after aggregation.
            RouteTarget::Node(_) => break,
        }
    }

    // Child manifests hold only the delta; the aggregator hydrates and
    // merges them into the parent state in branch order.
    let sync_ctx = SyncContext {
        execution_id: child_execution.to_string(),
        owner_id: owner_id.to_string(),
        workflow_id: workflow_id.to_string(),
        segment_id: segment.segment_id,
        ..Default::default()
    };
    let outcome = kernel
        .sync(StateBag::new(), SyncDelta::Sync(delta), &sync_ctx)
        .await
        .map_err(|e| e.to_string())?;

    info!(
        child = child_execution,
        manifest = %outcome.manifest.manifest_id,
        "branch committed"
    );
    Ok(outcome.manifest.manifest_id)
}
