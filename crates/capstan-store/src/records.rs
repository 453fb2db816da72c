//! Execution, idempotency, and task-token tables.
//!
//! All cross-writer coordination is expressed as conditional writes:
//! stop uses status-guarded transitions, idempotency uses put-if-absent,
//! and HITP resume uses take (conditional delete) so a token can resume
//! at most once.

use async_trait::async_trait;
use capstan_core::{
    Error, ExecutionRecord, ExecutionStatus, IdempotencyRecord, Result, TaskTokenRecord,
};
use dashmap::DashMap;

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn put(&self, record: &ExecutionRecord) -> Result<()>;

    async fn get(&self, execution_arn: &str) -> Result<ExecutionRecord>;

    /// Full read used by the finalizer when an event envelope was
    /// truncated — the describe path.
    async fn describe(&self, execution_arn: &str) -> Result<ExecutionRecord> {
        self.get(execution_arn).await
    }

    /// Unconditional overwrite (single writer per execution in the
    /// driver loop).
    async fn update(&self, record: &ExecutionRecord) -> Result<()>;

    /// Status-guarded transition: succeeds only when the current status
    /// equals `from`. Prevents double-stop and races with finalization.
    async fn transition_status(
        &self,
        execution_arn: &str,
        from: ExecutionStatus,
        to: ExecutionStatus,
    ) -> Result<()>;

    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<ExecutionRecord>>;

    async fn delete(&self, execution_arn: &str) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryExecutionStore {
    rows: DashMap<String, ExecutionRecord>,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn put(&self, record: &ExecutionRecord) -> Result<()> {
        self.rows
            .insert(record.execution_arn.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, execution_arn: &str) -> Result<ExecutionRecord> {
        self.rows
            .get(execution_arn)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::NotFound(format!("execution {execution_arn}")))
    }

    async fn update(&self, record: &ExecutionRecord) -> Result<()> {
        self.rows
            .insert(record.execution_arn.clone(), record.clone());
        Ok(())
    }

    async fn transition_status(
        &self,
        execution_arn: &str,
        from: ExecutionStatus,
        to: ExecutionStatus,
    ) -> Result<()> {
        let mut entry = self
            .rows
            .get_mut(execution_arn)
            .ok_or_else(|| Error::NotFound(format!("execution {execution_arn}")))?;
        if entry.status != from {
            return Err(Error::Conflict(format!(
                "execution {execution_arn} is {:?}, expected {:?}",
                entry.status, from
            )));
        }
        entry.status = to;
        if to.is_terminal() {
            entry.stop_date = Some(chrono::Utc::now());
        }
        Ok(())
    }

    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<ExecutionRecord>> {
        let mut rows: Vec<ExecutionRecord> = self
            .rows
            .iter()
            .filter(|e| e.value().owner_id == owner_id)
            .map(|e| e.value().clone())
            .collect();
        rows.sort_by(|a, b| b.start_date.cmp(&a.start_date));
        Ok(rows)
    }

    async fn delete(&self, execution_arn: &str) -> Result<()> {
        self.rows.remove(execution_arn);
        Ok(())
    }
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn get(&self, idempotency_key: &str) -> Result<Option<IdempotencyRecord>>;

    /// Conditional create: returns `false` without writing when the key
    /// already exists.
    async fn put_if_absent(&self, record: &IdempotencyRecord) -> Result<bool>;

    /// Finalizer path: overwrite with the terminal outcome.
    async fn update(&self, record: &IdempotencyRecord) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryIdempotencyStore {
    rows: DashMap<String, IdempotencyRecord>,
}

impl MemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn get(&self, idempotency_key: &str) -> Result<Option<IdempotencyRecord>> {
        Ok(self.rows.get(idempotency_key).map(|e| e.value().clone()))
    }

    async fn put_if_absent(&self, record: &IdempotencyRecord) -> Result<bool> {
        match self.rows.entry(record.idempotency_key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(false),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(true)
            }
        }
    }

    async fn update(&self, record: &IdempotencyRecord) -> Result<()> {
        self.rows
            .insert(record.idempotency_key.clone(), record.clone());
        Ok(())
    }
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Single writer per conversation: fails on duplicate.
    async fn put(&self, record: &TaskTokenRecord) -> Result<()>;

    async fn get(&self, conversation_id: &str) -> Result<Option<TaskTokenRecord>>;

    /// Conditional delete-and-return; the second caller gets `Conflict`.
    /// This is what makes HITP resume at-most-once.
    async fn take(&self, conversation_id: &str) -> Result<TaskTokenRecord>;

    async fn delete(&self, conversation_id: &str) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryTokenStore {
    rows: DashMap<String, TaskTokenRecord>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn put(&self, record: &TaskTokenRecord) -> Result<()> {
        match self.rows.entry(record.conversation_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::Conflict(format!(
                "task token already stored for conversation {}",
                record.conversation_id
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(())
            }
        }
    }

    async fn get(&self, conversation_id: &str) -> Result<Option<TaskTokenRecord>> {
        Ok(self.rows.get(conversation_id).map(|e| e.value().clone()))
    }

    async fn take(&self, conversation_id: &str) -> Result<TaskTokenRecord> {
        self.rows
            .remove(conversation_id)
            .map(|(_, record)| record)
            .ok_or_else(|| {
                Error::Conflict(format!(
                    "no pending task token for conversation {conversation_id}"
                ))
            })
    }

    async fn delete(&self, conversation_id: &str) -> Result<()> {
        self.rows.remove(conversation_id);
        Ok(())
    }
}
