//! The execution state machine.
//!
//! ```text
//! Submit -> Idempotency.Check -> [dup? return cached] -> Partition ->
//!   loop:
//!     Run Segment(i)
//!       COMPLETE + next        -> i := next
//!       COMPLETE + terminal    -> Finalize.Success
//!       PAUSED_FOR_HITP        -> Store token, suspend
//!       BRANCH_FANOUT          -> DistributedMap -> Aggregate -> continue
//!       ASYNC_CHILD_STARTED    -> continue
//!       LOOP_CONTINUE          -> i := loop header
//!       FAILED_DETERMINISTIC   -> SelfHeal (<=3) or Finalize.Failure
//!       FAILED_SEMANTIC        -> Finalize.Failure
//! ```
//!
//! Durable progress is the committed manifest chain: a crash resumes at
//! the last committed manifest for the execution.

use crate::aggregate::{aggregate_children, AggregateReport};
use crate::fanout::{run_branches, FanoutParams};
use crate::idempotency::{
    check_idempotency, derive_idempotency_key, reserve_key, Finalizer, IdempotencyCheck,
    TerminalEvent,
};
use crate::notify::{ProgressNotifier, ProgressSnapshot};
use capstan_core::{
    keys, CoreConfig, Error, ExecutionRecord, ExecutionStatus, NodeType, PartitionMap, Result,
    Ring, StateBag, TaskTokenRecord, Value, WorkflowDefinition,
};
use capstan_governance::{GovernanceDecision, GovernanceRing};
use capstan_kernel::{ReducerKind, StateKernel, SyncContext, SyncDelta};
use capstan_partition::{plan_chunks, Chunk, Partitioner, DEFAULT_MAX_CHUNKS};
use capstan_runner::{
    ErrorClassifier, HandlerRegistry, RunContext, SegmentRunner, SegmentStatus, Transition,
};
use capstan_store::{content_hash, ExecutionStore, IdempotencyStore, TokenStore};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

pub struct DriverDeps {
    pub kernel: Arc<StateKernel>,
    pub executions: Arc<dyn ExecutionStore>,
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub tokens: Arc<dyn TokenStore>,
    pub governance: Arc<GovernanceRing>,
    pub registry: Arc<HandlerRegistry>,
    /// Optional push surface for status + ETA snapshots.
    pub notifier: Option<Arc<ProgressNotifier>>,
    pub config: CoreConfig,
}

#[derive(Clone, Debug)]
pub struct SubmitRequest {
    pub workflow: WorkflowDefinition,
    pub initial_state: serde_json::Value,
    pub idempotency_key: Option<String>,
    /// Extracted from the verified JWT subject — never from the query
    /// string.
    pub owner_id: String,
}

#[derive(Clone, Debug)]
pub struct SubmitOutcome {
    pub execution_arn: String,
    pub status: ExecutionStatus,
    /// True when an idempotency hit returned a prior execution.
    pub deduplicated: bool,
    pub output: Option<serde_json::Value>,
}

pub struct WorkflowDriver {
    deps: DriverDeps,
    finalizer: Finalizer,
    classifier: ErrorClassifier,
}

struct ExecutionCursor {
    arn: String,
    owner_id: String,
    workflow: Arc<WorkflowDefinition>,
    partition: Arc<PartitionMap>,
    runner: Arc<SegmentRunner>,
    state: StateBag,
    previous_manifest: Option<String>,
    segment_id: u32,
    heal_counts: HashMap<u32, u32>,
    governance_rejects: HashMap<u32, u32>,
    started: std::time::Instant,
    completed_segments: u64,
    /// Chunk plan for long partitions; empty when unchunked. Chunk
    /// boundaries become durable checkpoints in the step history.
    chunks: Vec<Chunk>,
}

impl ExecutionCursor {
    fn chunk_of(&self, segment_id: u32) -> Option<&Chunk> {
        self.chunks
            .iter()
            .find(|c| (c.start_segment..=c.end_segment).contains(&segment_id))
    }
}

impl WorkflowDriver {
    pub fn new(deps: DriverDeps) -> Self {
        let finalizer = Finalizer::new(
            deps.executions.clone(),
            deps.idempotency.clone(),
            deps.config.clone(),
        );
        Self {
            deps,
            finalizer,
            classifier: ErrorClassifier::new(),
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.deps.config
    }

    /// Submit a workflow for execution. Returns when the execution
    /// reaches a terminal state or suspends at a HITP gate.
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitOutcome> {
        request.workflow.validate()?;

        let idempotency_key = request.idempotency_key.clone().unwrap_or_else(|| {
            derive_idempotency_key(
                &request.owner_id,
                &request.workflow.workflow_id,
                &request.initial_state,
            )
        });

        match check_idempotency(self.deps.idempotency.as_ref(), &idempotency_key).await? {
            IdempotencyCheck::Cached {
                execution_arn,
                status,
                output,
            } => {
                info!(key = %idempotency_key, arn = %execution_arn, "submit deduplicated (cached)");
                return Ok(SubmitOutcome {
                    execution_arn,
                    status,
                    deduplicated: true,
                    output,
                });
            }
            IdempotencyCheck::InFlight { execution_arn } => {
                info!(key = %idempotency_key, arn = %execution_arn, "submit deduplicated (in flight)");
                return Ok(SubmitOutcome {
                    execution_arn,
                    status: ExecutionStatus::Running,
                    deduplicated: true,
                    output: None,
                });
            }
            IdempotencyCheck::Fresh => {}
        }

        let arn = format!(
            "arn:capstan:execution:{}:{}",
            request.owner_id,
            uuid::Uuid::new_v4()
        );

        match reserve_key(self.deps.idempotency.as_ref(), &idempotency_key, &arn).await {
            Ok(()) => {}
            Err(Error::Conflict(_)) => {
                // Lost the race; surface the winner.
                if let Some(existing) = self.deps.idempotency.get(&idempotency_key).await? {
                    return Ok(SubmitOutcome {
                        execution_arn: existing.execution_arn,
                        status: existing.status,
                        deduplicated: true,
                        output: existing.output,
                    });
                }
            }
            Err(e) => return Err(e),
        }

        let partitioner = Partitioner::new(self.deps.config.clone());
        let partition = Arc::new(partitioner.partition(&request.workflow)?);

        let chunks = if partition.estimated_executions > self.deps.config.chunk_threshold {
            let chunks = plan_chunks(
                &partition,
                self.deps.config.chunk_size,
                DEFAULT_MAX_CHUNKS,
            )?;
            info!(
                arn = %arn,
                estimated = partition.estimated_executions,
                chunks = chunks.len(),
                "long partition chunked"
            );
            chunks
        } else {
            Vec::new()
        };

        let mut record = ExecutionRecord::new(
            &arn,
            &request.owner_id,
            &request.workflow.workflow_id,
            request.initial_state.clone(),
        );
        record.idempotency_key = Some(idempotency_key);
        self.deps.executions.put(&record).await?;

        let workflow = Arc::new(request.workflow);
        let runner = Arc::new(SegmentRunner::new(
            workflow.clone(),
            partition.clone(),
            self.deps.registry.clone(),
            self.deps.config.global_loop_cap,
        ));

        // Birth of the state bag.
        let init_ctx = self.sync_ctx(&arn, &request.owner_id, &workflow.workflow_id, 0, None, false);
        let init = self
            .deps
            .kernel
            .sync(
                StateBag::new(),
                SyncDelta::Init(StateBag::from_json(request.initial_state)),
                &init_ctx,
            )
            .await?;
        record.current_manifest_id = Some(init.manifest.manifest_id.clone());
        self.deps.executions.update(&record).await?;

        let cursor = ExecutionCursor {
            arn: arn.clone(),
            owner_id: request.owner_id,
            workflow,
            partition,
            runner,
            state: init.state,
            previous_manifest: Some(init.manifest.manifest_id),
            segment_id: 0,
            heal_counts: HashMap::new(),
            governance_rejects: HashMap::new(),
            started: std::time::Instant::now(),
            completed_segments: 0,
            chunks,
        };

        self.drive(cursor).await
    }

    /// Resume a paused execution with the HITP decision. The stored
    /// task token must match; the token record is consumed so a second
    /// resume conflicts. Workflow definitions live outside the core, so
    /// the caller supplies the one this execution was started with.
    pub async fn resume(
        &self,
        execution_arn: &str,
        task_token: &str,
        decision: serde_json::Value,
        workflow: WorkflowDefinition,
    ) -> Result<SubmitOutcome> {
        let stored = self
            .deps
            .tokens
            .get(execution_arn)
            .await?
            .ok_or_else(|| Error::NotFound(format!("no pending token for {execution_arn}")))?;
        if stored.task_token != task_token {
            return Err(Error::auth_failed("task token mismatch"));
        }
        // Conditional delete: the second resume loses here.
        let stored = self.deps.tokens.take(execution_arn).await?;

        let record = self.deps.executions.get(execution_arn).await?;
        let manifest_id = record
            .current_manifest_id
            .clone()
            .ok_or_else(|| Error::Internal("paused execution has no manifest".into()))?;
        let state = self.deps.kernel.hydrate(execution_arn, &manifest_id).await?;

        let workflow = Arc::new(workflow);
        let partitioner = Partitioner::new(self.deps.config.clone());
        let partition = Arc::new(partitioner.partition(&workflow)?);
        let runner = Arc::new(SegmentRunner::new(
            workflow.clone(),
            partition.clone(),
            self.deps.registry.clone(),
            self.deps.config.global_loop_cap,
        ));

        // Merge the human decision before the next segment observes it.
        let ctx = self.sync_ctx(
            execution_arn,
            &record.owner_id,
            &record.workflow_id,
            stored.paused_segment_id,
            Some(manifest_id),
            false,
        );
        let merged = self
            .deps
            .kernel
            .sync(state, SyncDelta::Sync(StateBag::from_json(decision)), &ctx)
            .await?;

        self.deps
            .executions
            .transition_status(
                execution_arn,
                ExecutionStatus::PausedForHitp,
                ExecutionStatus::Running,
            )
            .await?;

        let cursor = ExecutionCursor {
            arn: execution_arn.to_string(),
            owner_id: record.owner_id.clone(),
            workflow,
            partition,
            runner,
            state: merged.state,
            previous_manifest: Some(merged.manifest.manifest_id),
            segment_id: stored.paused_segment_id,
            heal_counts: HashMap::new(),
            governance_rejects: HashMap::new(),
            started: std::time::Instant::now(),
            completed_segments: stored.paused_segment_id as u64,
            chunks: Vec::new(),
        };
        self.drive(cursor).await
    }

    async fn drive(&self, mut cursor: ExecutionCursor) -> Result<SubmitOutcome> {
        loop {
            // Observe external aborts between segments.
            let record = self.deps.executions.get(&cursor.arn).await?;
            if record.status == ExecutionStatus::Aborted {
                info!(arn = %cursor.arn, "abort observed; refusing to start next segment");
                return self
                    .finalize(&cursor, ExecutionStatus::Aborted, Some("Aborted"), None)
                    .await;
            }

            let Some(segment) = cursor.partition.segment(cursor.segment_id).cloned() else {
                return self
                    .finalize(&cursor, ExecutionStatus::Succeeded, None, None)
                    .await;
            };

            let ring = cursor
                .workflow
                .node(&segment.entry_node)
                .map(|n| n.effective_ring())
                .unwrap_or(Ring::Trusted);
            let healing_count = *cursor.heal_counts.get(&cursor.segment_id).unwrap_or(&0);
            let run_ctx = RunContext::new(ring).with_healing_count(healing_count);

            let outcome = cursor
                .runner
                .run_segment(cursor.segment_id, cursor.state.clone(), &run_ctx)
                .await?;

            match outcome.status {
                SegmentStatus::Aborted => {
                    return self
                        .finalize(&cursor, ExecutionStatus::Aborted, Some("Aborted"), None)
                        .await;
                }
                SegmentStatus::FailedSemantic => {
                    let failure = outcome.failure.as_ref();
                    return self
                        .finalize(
                            &cursor,
                            ExecutionStatus::Failed,
                            failure.map(|f| f.code.as_str()),
                            failure.map(|f| f.message.clone()),
                        )
                        .await;
                }
                SegmentStatus::FailedDeterministic => {
                    let attempts = cursor
                        .heal_counts
                        .entry(cursor.segment_id)
                        .or_insert(0);
                    *attempts += 1;
                    if *attempts > self.deps.config.max_heal_attempts {
                        warn!(
                            arn = %cursor.arn,
                            segment = cursor.segment_id,
                            "self-heal circuit breaker tripped"
                        );
                        let failure = outcome.failure.as_ref();
                        return self
                            .finalize(
                                &cursor,
                                ExecutionStatus::Failed,
                                failure.map(|f| f.code.as_str()),
                                failure.map(|f| f.message.clone()),
                            )
                            .await;
                    }
                    self.inject_healing(&mut cursor, &outcome).await?;
                    continue; // re-enter the same segment with advice
                }
                SegmentStatus::Succeeded => {}
            }

            // Commit the segment's delta.
            let next_hint = outcome
                .next_segment
                .map(|n| n as u64)
                .unwrap_or(cursor.segment_id as u64 + 1);
            let mut delta = outcome.delta.clone();
            delta.insert(keys::SEGMENT_TO_RUN, Value::uint(next_hint));

            let ctx = self.sync_ctx(
                &cursor.arn,
                &cursor.owner_id,
                &cursor.workflow.workflow_id,
                cursor.segment_id,
                cursor.previous_manifest.clone(),
                outcome.is_loop_body,
            );
            let synced = self
                .deps
                .kernel
                .sync(cursor.state.clone(), SyncDelta::Sync(delta), &ctx)
                .await?;
            cursor.state = synced.state;
            cursor.previous_manifest = Some(synced.manifest.manifest_id.clone());

            let mut record = self.deps.executions.get(&cursor.arn).await?;
            record.current_manifest_id = Some(synced.manifest.manifest_id.clone());
            record.push_step(cursor.segment_id, format!("segment {} committed", cursor.segment_id));
            self.deps.executions.update(&record).await?;

            cursor.completed_segments += 1;
            self.notify(&cursor, ExecutionStatus::Running);

            // Chunk checkpoint: the chunk's final committed state seeds
            // the next chunk, recorded durably before crossing over.
            if let Some(chunk) = cursor.chunk_of(cursor.segment_id) {
                if cursor.segment_id == chunk.end_segment && !chunk.is_last_chunk {
                    let mut record = self.deps.executions.get(&cursor.arn).await?;
                    record.push_step(
                        cursor.segment_id,
                        format!("chunk {} complete", chunk.chunk_index),
                    );
                    self.deps.executions.update(&record).await?;
                    info!(
                        arn = %cursor.arn,
                        chunk = chunk.chunk_index,
                        "chunk boundary checkpoint"
                    );
                }
            }

            // Governance post-pass for agent output committed this turn.
            if outcome.delta.contains_key("agent_output") {
                match self.govern(&mut cursor, &synced.manifest.manifest_id).await? {
                    GovernStep::Continue => {}
                    GovernStep::Retry => continue,
                    GovernStep::Fail(message) => {
                        return self
                            .finalize(
                                &cursor,
                                ExecutionStatus::Failed,
                                Some("GuardrailViolation"),
                                Some(message),
                            )
                            .await;
                    }
                    GovernStep::Pause => {
                        return self.pause_for_hitp(&cursor).await;
                    }
                }
            }

            match outcome.transition {
                Transition::Complete => match outcome.next_segment {
                    Some(next) => cursor.segment_id = next,
                    None => {
                        return self
                            .finalize(&cursor, ExecutionStatus::Succeeded, None, None)
                            .await;
                    }
                },
                Transition::LoopContinue => {
                    cursor.segment_id = outcome
                        .next_segment
                        .unwrap_or(cursor.segment_id);
                }
                Transition::AsyncChildStarted => match outcome.next_segment {
                    Some(next) => cursor.segment_id = next,
                    None => {
                        return self
                            .finalize(&cursor, ExecutionStatus::Succeeded, None, None)
                            .await;
                    }
                },
                Transition::PausedForHitp => {
                    // The next segment after the gate resumes the run.
                    let resume_at = outcome.next_segment.unwrap_or(cursor.segment_id + 1);
                    cursor.segment_id = resume_at;
                    return self.pause_for_hitp(&cursor).await;
                }
                Transition::BranchFanout => {
                    let report = self.fan_out(&mut cursor, &outcome).await?;
                    if report.is_failed() {
                        return self
                            .finalize(
                                &cursor,
                                ExecutionStatus::Failed,
                                Some("BranchAggregateFailed"),
                                Some(report.failed_reasons.join("; ")),
                            )
                            .await;
                    }
                    // Continue past the fan-out segment.
                    let children_segment = outcome.next_segment.unwrap_or(cursor.segment_id + 1);
                    match cursor.partition.segment(children_segment + 1) {
                        Some(s) => cursor.segment_id = s.segment_id,
                        None => {
                            return self
                                .finalize(&cursor, ExecutionStatus::Succeeded, None, None)
                                .await;
                        }
                    }
                }
            }
        }
    }

    async fn fan_out(
        &self,
        cursor: &mut ExecutionCursor,
        outcome: &capstan_runner::SegmentOutcome,
    ) -> Result<AggregateReport> {
        let children_segment_id = outcome.next_segment.unwrap_or(cursor.segment_id + 1);
        let children_segment = cursor
            .partition
            .segment(children_segment_id)
            .cloned()
            .ok_or_else(|| {
                Error::Validation(format!(
                    "branch fan-out has no child segment {children_segment_id}"
                ))
            })?;

        let max_concurrency = cursor
            .state
            .get_u64(keys::MAX_CONCURRENCY)
            .map(|n| n as usize)
            .unwrap_or(self.deps.config.max_concurrency);

        info!(
            arn = %cursor.arn,
            branches = outcome.branch_plan.len(),
            max_concurrency,
            "distributed map launching"
        );

        let results = run_branches(
            self.deps.kernel.clone(),
            self.deps.registry.clone(),
            cursor.workflow.clone(),
            FanoutParams {
                execution_id: &cursor.arn,
                owner_id: &cursor.owner_id,
                workflow_id: &cursor.workflow.workflow_id,
                segment: &children_segment,
            },
            outcome.branch_plan.clone(),
            cursor.state.clone(),
            max_concurrency,
            &RunContext::new(Ring::Trusted),
        )
        .await;

        let reducers = self.reducers_for(&cursor.workflow);
        let ctx = self.sync_ctx(
            &cursor.arn,
            &cursor.owner_id,
            &cursor.workflow.workflow_id,
            children_segment_id,
            cursor.previous_manifest.clone(),
            false,
        );
        let (synced, report) = aggregate_children(
            self.deps.kernel.clone(),
            cursor.state.clone(),
            &results,
            reducers,
            &ctx,
        )
        .await?;

        cursor.state = synced.state;
        cursor
            .state
            .insert_json("_aggregate_report", serde_json::to_value(&report)?);
        cursor.previous_manifest = Some(synced.manifest.manifest_id.clone());

        let mut record = self.deps.executions.get(&cursor.arn).await?;
        record.current_manifest_id = Some(synced.manifest.manifest_id);
        record.push_step(children_segment_id, "distributed map aggregated");
        self.deps.executions.update(&record).await?;

        Ok(report)
    }

    /// Aggregator node reducers, if an aggregator is declared.
    fn reducers_for(&self, workflow: &WorkflowDefinition) -> BTreeMap<String, ReducerKind> {
        workflow
            .nodes
            .iter()
            .find(|n| n.node_type == NodeType::Aggregator)
            .and_then(|n| n.config.get("reducers"))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    async fn govern(
        &self,
        cursor: &mut ExecutionCursor,
        manifest_id: &str,
    ) -> Result<GovernStep> {
        let output = cursor
            .state
            .get_str("agent_output")
            .unwrap_or_default()
            .to_string();
        let agent_id = cursor
            .state
            .get_path("_agent_meta.agent_id")
            .and_then(Value::as_str)
            .unwrap_or("agent")
            .to_string();
        let gas_used = cursor
            .state
            .get("_gas_used")
            .and_then(|v| match v {
                Value::Scalar(s) => s.as_f64(),
                _ => None,
            })
            .unwrap_or(0.0);

        let stated_plan = cursor
            .state
            .get_path("_agent_meta.plan")
            .and_then(Value::as_str)
            .map(|p| content_hash(p.as_bytes()));
        let executed = cursor
            .state
            .get_str("_executed_actions")
            .map(|a| content_hash(a.as_bytes()))
            .or_else(|| stated_plan.clone());

        let (decision, _report) = self.deps.governance.review(&capstan_governance::AgentReview {
            manifest_id,
            agent_id: &agent_id,
            output: &output,
            gas_used,
            stated_plan_hash: stated_plan.as_deref(),
            executed_plan_hash: executed.as_deref(),
        });

        match decision {
            GovernanceDecision::Accept => Ok(GovernStep::Continue),
            GovernanceDecision::Warn { feedback } => {
                warn!(arn = %cursor.arn, "governance warning: {feedback}");
                Ok(GovernStep::Continue)
            }
            GovernanceDecision::Escalate { feedback, .. } => {
                warn!(arn = %cursor.arn, "governance escalation: {feedback}");
                Ok(GovernStep::Pause)
            }
            GovernanceDecision::Reject { feedback, .. } => {
                let rejects = cursor
                    .governance_rejects
                    .entry(cursor.segment_id)
                    .or_insert(0);
                *rejects += 1;
                if *rejects > self.deps.config.max_heal_attempts {
                    return Ok(GovernStep::Fail(format!(
                        "agent output rejected {rejects} times: {feedback}"
                    )));
                }

                // Optimistic rollback: drop the rejected commit, restore
                // the predecessor, and carry the feedback into the
                // agent's next turn.
                let restored = self.deps.kernel.rollback(&cursor.arn, manifest_id).await?;
                cursor.state = match &restored {
                    Some(previous) => self.deps.kernel.hydrate(&cursor.arn, previous).await?,
                    None => StateBag::new(),
                };
                cursor.previous_manifest = restored.clone();

                cursor.state.insert_json(
                    keys::SELF_HEALING_METADATA,
                    serde_json::json!({"suggested_fix": feedback}),
                );

                let mut record = self.deps.executions.get(&cursor.arn).await?;
                record.current_manifest_id = restored;
                record.push_step(cursor.segment_id, "governance rollback");
                self.deps.executions.update(&record).await?;

                Ok(GovernStep::Retry)
            }
        }
    }

    async fn inject_healing(
        &self,
        cursor: &mut ExecutionCursor,
        outcome: &capstan_runner::SegmentOutcome,
    ) -> Result<()> {
        let failure = outcome.failure.as_ref();
        let code = failure.map(|f| f.code.as_str()).unwrap_or("Unknown");
        let message = failure.map(|f| f.message.as_str()).unwrap_or("");
        let advice = self
            .classifier
            .healing_advice(code, message)
            .unwrap_or("Review the error and correct the output shape before retrying.");

        let healing_count = *cursor.heal_counts.get(&cursor.segment_id).unwrap_or(&0);
        info!(
            arn = %cursor.arn,
            segment = cursor.segment_id,
            attempt = healing_count,
            "self-heal re-entry with advice"
        );

        let mut delta = StateBag::new();
        delta.insert_json(
            keys::SELF_HEALING_METADATA,
            serde_json::json!({
                "suggested_fix": advice,
                "healing_count": healing_count,
                "last_error": message,
            }),
        );

        let ctx = self.sync_ctx(
            &cursor.arn,
            &cursor.owner_id,
            &cursor.workflow.workflow_id,
            cursor.segment_id,
            cursor.previous_manifest.clone(),
            false,
        );
        let synced = self
            .deps
            .kernel
            .sync(cursor.state.clone(), SyncDelta::Sync(delta), &ctx)
            .await?;
        cursor.state = synced.state;
        cursor.previous_manifest = Some(synced.manifest.manifest_id.clone());

        let mut record = self.deps.executions.get(&cursor.arn).await?;
        record.healing_count += 1;
        record.current_manifest_id = Some(synced.manifest.manifest_id);
        record.push_step(cursor.segment_id, format!("self-heal attempt {healing_count}"));
        self.deps.executions.update(&record).await?;
        Ok(())
    }

    async fn pause_for_hitp(&self, cursor: &ExecutionCursor) -> Result<SubmitOutcome> {
        let token = TaskTokenRecord {
            conversation_id: cursor.arn.clone(),
            task_token: uuid::Uuid::new_v4().to_string(),
            owner_id: cursor.owner_id.clone(),
            parent_execution_id: None,
            chunk_id: None,
            workflow_id: cursor.workflow.workflow_id.clone(),
            paused_segment_id: cursor.segment_id,
            created_at: Utc::now(),
        };
        self.deps.tokens.put(&token).await?;

        self.deps
            .executions
            .transition_status(
                &cursor.arn,
                ExecutionStatus::Running,
                ExecutionStatus::PausedForHitp,
            )
            .await?;

        info!(
            arn = %cursor.arn,
            segment = cursor.segment_id,
            "suspended for human decision"
        );
        Ok(SubmitOutcome {
            execution_arn: cursor.arn.clone(),
            status: ExecutionStatus::PausedForHitp,
            deduplicated: false,
            output: None,
        })
    }

    async fn finalize(
        &self,
        cursor: &ExecutionCursor,
        status: ExecutionStatus,
        error: Option<&str>,
        message: Option<String>,
    ) -> Result<SubmitOutcome> {
        let output = if status == ExecutionStatus::Succeeded {
            Some(cursor.state.to_json())
        } else {
            None
        };

        let mut record = self.deps.executions.get(&cursor.arn).await?;
        record.status = status;
        record.stop_date = Some(Utc::now());
        record.output = output.clone();
        record.error = error.map(String::from);
        record.message = message;
        self.deps.executions.update(&record).await?;

        // At-least-once terminal event to the finalizer.
        let event = TerminalEvent {
            execution_arn: cursor.arn.clone(),
            status,
            stop_date: record.stop_date,
            input: serde_json::to_string(&record.input).ok(),
            output: output.as_ref().and_then(|o| serde_json::to_string(o).ok()),
            error: record.error.clone(),
        };
        self.finalizer.handle_terminal_event(&event).await?;
        self.notify(cursor, status);

        info!(arn = %cursor.arn, status = ?status, "execution finalized");
        Ok(SubmitOutcome {
            execution_arn: cursor.arn.clone(),
            status,
            deduplicated: false,
            output,
        })
    }

    fn notify(&self, cursor: &ExecutionCursor, status: ExecutionStatus) {
        let Some(notifier) = &self.deps.notifier else {
            return;
        };
        let snapshot = ProgressSnapshot::compute(
            &cursor.arn,
            status,
            cursor.completed_segments,
            cursor.partition.estimated_executions,
            cursor.started.elapsed(),
        );
        notifier.maybe_notify(&snapshot);
    }

    fn sync_ctx(
        &self,
        execution_id: &str,
        owner_id: &str,
        workflow_id: &str,
        segment_id: u32,
        previous_manifest_id: Option<String>,
        is_loop_body: bool,
    ) -> SyncContext {
        SyncContext {
            execution_id: execution_id.to_string(),
            owner_id: owner_id.to_string(),
            workflow_id: workflow_id.to_string(),
            segment_id,
            is_loop_body,
            previous_manifest_id,
            reducers: BTreeMap::new(),
        }
    }
}

enum GovernStep {
    Continue,
    Retry,
    Fail(String),
    Pause,
}
