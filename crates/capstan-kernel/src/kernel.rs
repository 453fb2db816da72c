//! The universal sync entry point and its two-phase commit.

use crate::hydrate::hydrate_manifest;
use crate::merge::{self, SyncDelta};
use crate::offload::{offload, BlockScope, OffloadedBlock};
use capstan_core::{
    block_key, keys, CoreConfig, Error, Manifest, Result, StateBag, Value,
};
use capstan_store::{
    content_hash, BlobStore, GcMessage, GcQueue, GcReason, ManifestStore, RetryPolicy,
};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncStatus {
    Started,
    Synced,
    Aggregated,
}

/// Identity and flags for one sync call.
#[derive(Clone, Debug, Default)]
pub struct SyncContext {
    pub execution_id: String,
    pub owner_id: String,
    pub workflow_id: String,
    pub segment_id: u32,
    /// The segment just executed was a loop body — bumps `loop_counter`.
    pub is_loop_body: bool,
    pub previous_manifest_id: Option<String>,
    /// Per-key reducer overrides from the aggregator node config.
    pub reducers: std::collections::BTreeMap<String, merge::ReducerKind>,
}

#[derive(Clone, Debug)]
pub struct SyncOutcome {
    pub status: SyncStatus,
    /// The committed inline snapshot (offloaded subtrees appear as
    /// pointers). Hydrate the manifest to resolve them.
    pub state: StateBag,
    pub manifest: Manifest,
}

/// Every state transition flows through here. No other code writes
/// blocks or manifests.
pub struct StateKernel {
    blobs: Arc<dyn BlobStore>,
    manifests: Arc<dyn ManifestStore>,
    gc: Arc<dyn GcQueue>,
    config: CoreConfig,
    retry: RetryPolicy,
}

impl StateKernel {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        manifests: Arc<dyn ManifestStore>,
        gc: Arc<dyn GcQueue>,
        config: CoreConfig,
    ) -> Self {
        Self {
            blobs,
            manifests,
            gc,
            config,
            retry: RetryPolicy::default(),
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Merge, offload, and commit one state transition. Returns the new
    /// snapshot and its committed manifest.
    pub async fn sync(
        &self,
        base: StateBag,
        delta: SyncDelta,
        ctx: &SyncContext,
    ) -> Result<SyncOutcome> {
        let status = match &delta {
            SyncDelta::Init(_) => SyncStatus::Started,
            SyncDelta::Sync(_) => SyncStatus::Synced,
            SyncDelta::Aggregate(_) => SyncStatus::Aggregated,
        };

        let mut state = match delta {
            SyncDelta::Init(d) => merge::init_state(&base, d, &self.config)?,
            SyncDelta::Sync(d) => {
                let mut merged = merge::shallow_merge(base, d);
                if ctx.is_loop_body {
                    let count = merged.get_u64(keys::LOOP_COUNTER).unwrap_or(0);
                    merged.insert(keys::LOOP_COUNTER, Value::uint(count + 1));
                }
                merged
            }
            SyncDelta::Aggregate(branches) => {
                merge::aggregate_merge(base, branches, &ctx.reducers)
            }
        };

        if status != SyncStatus::Started {
            self.append_history(&mut state, ctx);
        }

        let scope = BlockScope {
            bucket: &self.config.state_bucket,
            owner_id: &ctx.owner_id,
            workflow_id: &ctx.workflow_id,
            execution_id: &ctx.execution_id,
        };
        let plan = offload(state, self.config.inline_threshold_bytes, &scope);

        let root_bytes = serde_json::to_vec(&plan.state)?;
        let root_checksum = content_hash(&root_bytes);
        let root_key = block_key(
            &ctx.owner_id,
            &ctx.workflow_id,
            &ctx.execution_id,
            &root_checksum,
        );

        let mut manifest = Manifest::new(
            &ctx.execution_id,
            &ctx.owner_id,
            &ctx.workflow_id,
            ctx.segment_id,
            ctx.previous_manifest_id.clone(),
        );
        manifest.checksum = root_checksum.clone();
        manifest.blocks.push(root_checksum);
        for block in &plan.blocks {
            manifest.blocks.push(block.checksum.clone());
            if let Some(Value::Pointer(pointer)) = plan.state.get(&block.path) {
                manifest
                    .pointer_map
                    .insert(block.path.clone(), pointer.clone());
            }
        }

        self.commit(&mut manifest, root_key, root_bytes, &plan.blocks)
            .await?;

        info!(
            execution = %ctx.execution_id,
            manifest = %manifest.manifest_id,
            segment = ctx.segment_id,
            offloaded = plan.blocks.len(),
            "state committed"
        );

        Ok(SyncOutcome {
            status,
            state: plan.state,
            manifest,
        })
    }

    /// Load and fully resolve a committed snapshot.
    pub async fn hydrate(&self, execution_id: &str, manifest_id: &str) -> Result<StateBag> {
        let manifest = self.manifests.get(execution_id, manifest_id).await?;
        if !manifest.committed {
            return Err(Error::StateHydration(format!(
                "manifest {manifest_id} is not committed"
            )));
        }
        hydrate_manifest(self.blobs.as_ref(), &manifest, self.retry).await
    }

    pub async fn latest_committed(&self, execution_id: &str) -> Result<Option<Manifest>> {
        self.manifests.latest_committed(execution_id).await
    }

    pub async fn get_manifest(&self, execution_id: &str, manifest_id: &str) -> Result<Manifest> {
        self.manifests.get(execution_id, manifest_id).await
    }

    /// Optimistic rollback: drop a rejected manifest, return to its
    /// predecessor, and queue the now-orphaned blocks.
    pub async fn rollback(&self, execution_id: &str, manifest_id: &str) -> Result<Option<String>> {
        let rejected = self.manifests.get(execution_id, manifest_id).await?;

        let kept: HashSet<String> = match &rejected.previous_manifest_id {
            Some(previous) => self
                .manifests
                .get(execution_id, previous)
                .await?
                .blocks
                .into_iter()
                .collect(),
            None => HashSet::new(),
        };

        for checksum in &rejected.blocks {
            if kept.contains(checksum) {
                continue;
            }
            self.gc.enqueue(GcMessage {
                block_key: block_key(
                    &rejected.owner_id,
                    &rejected.workflow_id,
                    execution_id,
                    checksum,
                ),
                bucket: self.config.state_bucket.clone(),
                reason: GcReason::OptimisticRollback,
                transaction_id: manifest_id.to_string(),
            });
        }

        self.manifests.delete(execution_id, manifest_id).await?;

        warn!(
            execution = %execution_id,
            rejected = %manifest_id,
            restored = rejected.previous_manifest_id.as_deref().unwrap_or("none"),
            "optimistic rollback"
        );
        Ok(rejected.previous_manifest_id)
    }

    fn append_history(&self, state: &mut StateBag, ctx: &SyncContext) {
        let mut entry = StateBag::new();
        entry.insert(
            "id",
            Value::str(uuid::Uuid::new_v4().simple().to_string()[..8].to_string()),
        );
        entry.insert("timestamp", Value::str(Utc::now().to_rfc3339()));
        entry.insert("segment_id", Value::uint(ctx.segment_id as u64));

        let mut history = match state.remove(keys::STATE_HISTORY) {
            Some(Value::Seq(items)) => items,
            _ => Vec::new(),
        };
        history.push(Value::Map(entry));
        let limit = self.config.state_history_limit;
        if history.len() > limit {
            let excess = history.len() - limit;
            history.drain(..excess);
        }
        state.insert(keys::STATE_HISTORY, Value::Seq(history));
    }

    /// Two-phase commit: blocks, then the uncommitted manifest row, then
    /// the conditional flip. Any failure after the first block write
    /// queues the freshly written keys for collection.
    async fn commit(
        &self,
        manifest: &mut Manifest,
        root_key: String,
        root_bytes: Vec<u8>,
        offloaded: &[OffloadedBlock],
    ) -> Result<()> {
        let transaction_id = uuid::Uuid::new_v4().to_string();
        let mut newly_written: Vec<String> = Vec::new();

        let mut writes: Vec<(String, Vec<u8>)> = vec![(root_key, root_bytes)];
        for block in offloaded {
            writes.push((block.key.clone(), block.bytes.clone()));
        }

        for (key, bytes) in writes {
            let existed = self.blobs.head(&key).await.unwrap_or(false);
            if let Err(e) = self.blobs.put(&key, bytes).await {
                self.abandon(&newly_written, &transaction_id);
                return Err(e);
            }
            if !existed {
                newly_written.push(key);
            }
        }

        if let Err(e) = self.manifests.put(manifest).await {
            self.abandon(&newly_written, &transaction_id);
            return Err(e);
        }

        if let Err(e) = self
            .manifests
            .mark_committed(&manifest.execution_id, &manifest.manifest_id)
            .await
        {
            self.abandon(&newly_written, &transaction_id);
            return Err(e);
        }

        manifest.committed = true;
        Ok(())
    }

    fn abandon(&self, keys: &[String], transaction_id: &str) {
        for key in keys {
            self.gc.enqueue(GcMessage {
                block_key: key.clone(),
                bucket: self.config.state_bucket.clone(),
                reason: GcReason::AbandonedWrite,
                transaction_id: transaction_id.to_string(),
            });
        }
        if !keys.is_empty() {
            warn!(
                transaction = transaction_id,
                orphans = keys.len(),
                "commit failed after block writes; orphans queued"
            );
        }
    }
}
