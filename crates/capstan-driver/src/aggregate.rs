//! Fan-in: merge child manifests back into the parent state.

use crate::fanout::BranchResult;
use capstan_core::{keys, Result, StateBag};
use capstan_kernel::{BranchDelta, ReducerKind, StateKernel, SyncContext, SyncDelta, SyncOutcome};
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

#[derive(Clone, Debug, Serialize)]
pub struct AggregateReport {
    /// `COMPLETED` or `FAILED`. Partial success is `COMPLETED` when
    /// every failed branch carried `allow_failure`.
    pub status: String,
    pub total_chunks: usize,
    pub successful_chunks: usize,
    pub failed_chunks: usize,
    pub failed_reasons: Vec<String>,
}

impl AggregateReport {
    pub fn is_failed(&self) -> bool {
        self.status == "FAILED"
    }
}

/// Hydrate child manifests in parallel, fold them through the kernel's
/// aggregate action, and report per-branch outcomes.
pub async fn aggregate_children(
    kernel: Arc<StateKernel>,
    parent_state: StateBag,
    results: &[BranchResult],
    reducers: BTreeMap<String, ReducerKind>,
    parent_ctx: &SyncContext,
) -> Result<(SyncOutcome, AggregateReport)> {
    let hydrations = results.iter().map(|result| {
        let kernel = kernel.clone();
        let parent_execution = parent_ctx.execution_id.clone();
        async move {
            match &result.outcome {
                Ok(manifest_id) => {
                    let child_execution =
                        format!("{parent_execution}#b{}", result.spec.branch_index);
                    match kernel.hydrate(&child_execution, manifest_id).await {
                        Ok(mut bag) => {
                            // Child bookkeeping stays out of the merge.
                            bag.remove(keys::STATE_HISTORY);
                            BranchDelta {
                                branch_index: result.spec.branch_index,
                                result: Ok(bag),
                            }
                        }
                        Err(e) => BranchDelta {
                            branch_index: result.spec.branch_index,
                            result: Err(format!("hydration failed: {e}")),
                        },
                    }
                }
                Err(message) => BranchDelta {
                    branch_index: result.spec.branch_index,
                    result: Err(message.clone()),
                },
            }
        }
    });
    let branch_deltas: Vec<BranchDelta> = join_all(hydrations).await;

    let total_chunks = results.len();
    let failed: Vec<&BranchResult> = results.iter().filter(|r| r.outcome.is_err()).collect();
    let failed_chunks = failed.len();
    let successful_chunks = total_chunks - failed_chunks;
    let failed_reasons: Vec<String> = failed
        .iter()
        .map(|r| {
            format!(
                "branch {}: {}",
                r.spec.branch_index,
                r.outcome.as_ref().err().map(String::as_str).unwrap_or("")
            )
        })
        .collect();

    // The merge proceeds on partial failure; only a full wipe-out or a
    // failed branch without allow_failure fails the aggregate.
    let all_failed = successful_chunks == 0 && total_chunks > 0;
    let hard_failure = failed.iter().any(|r| !r.spec.allow_failure);
    let status = if all_failed || hard_failure {
        "FAILED"
    } else {
        "COMPLETED"
    };

    let mut ctx = parent_ctx.clone();
    ctx.reducers = reducers;
    let outcome = kernel
        .sync(parent_state, SyncDelta::Aggregate(branch_deltas), &ctx)
        .await?;

    info!(
        execution = %parent_ctx.execution_id,
        total_chunks,
        successful_chunks,
        failed_chunks,
        status,
        "aggregate complete"
    );

    Ok((
        outcome,
        AggregateReport {
            status: status.to_string(),
            total_chunks,
            successful_chunks,
            failed_chunks,
            failed_reasons,
        },
    ))
}
