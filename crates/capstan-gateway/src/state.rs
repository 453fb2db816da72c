//! Shared gateway state.

use crate::auth::ResolvedAuth;
use crate::ws::WsRegistry;
use capstan_core::{Error, ExecutionRecord, Result, WorkflowDefinition};
use capstan_driver::WorkflowDriver;
use capstan_store::{ExecutionStore, TokenStore};
use dashmap::DashMap;
use std::sync::Arc;

pub struct AppState {
    pub auth: ResolvedAuth,
    pub driver: Arc<WorkflowDriver>,
    pub executions: Arc<dyn ExecutionStore>,
    pub tokens: Arc<dyn TokenStore>,
    /// Minimal in-memory workflow registry keyed (owner, workflow_id).
    /// Full CRUD lives outside the execution core; the gateway only
    /// needs enough to resolve submits and resumes.
    pub workflows: DashMap<(String, String), WorkflowDefinition>,
    pub ws: Arc<WsRegistry>,
}

impl AppState {
    pub fn save_workflow(&self, owner_id: &str, workflow: WorkflowDefinition) -> Result<()> {
        // Graph-time validation: dangling edges reject the save.
        workflow.validate()?;
        self.workflows.insert(
            (owner_id.to_string(), workflow.workflow_id.clone()),
            workflow,
        );
        Ok(())
    }

    pub fn workflow(&self, owner_id: &str, workflow_id: &str) -> Result<WorkflowDefinition> {
        self.workflows
            .get(&(owner_id.to_string(), workflow_id.to_string()))
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::NotFound(format!("workflow {workflow_id}")))
    }

    /// Owner-scoped execution read: a foreign owner's execution is
    /// indistinguishable from a missing one.
    pub async fn owned_execution(
        &self,
        owner_id: &str,
        execution_arn: &str,
    ) -> Result<ExecutionRecord> {
        let record = self.executions.get(execution_arn).await?;
        if record.owner_id != owner_id {
            return Err(Error::NotFound(format!("execution {execution_arn}")));
        }
        Ok(record)
    }
}
