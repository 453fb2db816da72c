//! Execution, idempotency, and task-token records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Running,
    PausedForHitp,
    Succeeded,
    Failed,
    TimedOut,
    Aborted,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::TimedOut | Self::Aborted
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_arn: String,
    pub owner_id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub start_date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_date: Option<DateTime<Utc>>,
    /// Initial state as submitted.
    pub input: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// Bounded per-step history for debugging.
    #[serde(default)]
    pub step_history: Vec<StepEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_manifest_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Short stable error code when terminal-failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Sanitized message; stack traces never leave the core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub healing_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_ts: Option<i64>,
}

impl ExecutionRecord {
    pub fn new(
        execution_arn: impl Into<String>,
        owner_id: impl Into<String>,
        workflow_id: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self {
            execution_arn: execution_arn.into(),
            owner_id: owner_id.into(),
            workflow_id: workflow_id.into(),
            status: ExecutionStatus::Running,
            start_date: Utc::now(),
            stop_date: None,
            input,
            output: None,
            step_history: Vec::new(),
            current_manifest_id: None,
            idempotency_key: None,
            error: None,
            message: None,
            healing_count: 0,
            expiration_ts: None,
        }
    }
}

const STEP_HISTORY_LIMIT: usize = 50;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepEvent {
    pub at: DateTime<Utc>,
    pub segment_id: u32,
    pub label: String,
}

impl ExecutionRecord {
    /// Append a step event, keeping the history bounded.
    pub fn push_step(&mut self, segment_id: u32, label: impl Into<String>) {
        self.step_history.push(StepEvent {
            at: Utc::now(),
            segment_id,
            label: label.into(),
        });
        if self.step_history.len() > STEP_HISTORY_LIMIT {
            let excess = self.step_history.len() - STEP_HISTORY_LIMIT;
            self.step_history.drain(..excess);
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub idempotency_key: String,
    pub status: ExecutionStatus,
    pub execution_arn: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// Unix seconds after which the record may be reaped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
}

/// Persisted while an execution is paused at a human-in-the-loop gate.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskTokenRecord {
    pub conversation_id: String,
    pub task_token: String,
    pub owner_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<String>,
    pub workflow_id: String,
    pub paused_segment_id: u32,
    pub created_at: DateTime<Utc>,
}
