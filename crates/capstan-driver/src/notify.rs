//! Progress notification — a read-only consumer of execution state.
//!
//! Pushes status + ETA snapshots, throttled: a write is skipped when the
//! previous one was recent and no quarter-milestone was crossed since.

use capstan_core::ExecutionStatus;
use serde::Serialize;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Clone, Debug, Serialize)]
pub struct ProgressSnapshot {
    pub execution_arn: String,
    pub status: ExecutionStatus,
    pub completed_segments: u64,
    pub estimated_executions: u64,
    pub percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<f64>,
}

impl ProgressSnapshot {
    pub fn compute(
        execution_arn: impl Into<String>,
        status: ExecutionStatus,
        completed_segments: u64,
        estimated_executions: u64,
        elapsed: Duration,
    ) -> Self {
        let total = estimated_executions.max(1);
        let completed = completed_segments.min(total);
        let percent = completed as f64 / total as f64 * 100.0;
        let eta_seconds = if completed > 0 && completed < total {
            let per_segment = elapsed.as_secs_f64() / completed as f64;
            Some(per_segment * (total - completed) as f64)
        } else {
            None
        };
        Self {
            execution_arn: execution_arn.into(),
            status,
            completed_segments: completed,
            estimated_executions,
            percent,
            eta_seconds,
        }
    }

    fn milestone(&self) -> u8 {
        (self.percent / 25.0) as u8
    }
}

pub trait ProgressSink: Send + Sync {
    fn publish(&self, snapshot: &ProgressSnapshot);
}

/// Sink that drops everything — for executions nobody watches.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn publish(&self, _snapshot: &ProgressSnapshot) {}
}

pub struct ProgressNotifier {
    sink: Box<dyn ProgressSink>,
    min_interval: Duration,
    last: Mutex<Option<(Instant, u8)>>,
}

impl ProgressNotifier {
    pub fn new(sink: Box<dyn ProgressSink>, min_interval: Duration) -> Self {
        Self {
            sink,
            min_interval,
            last: Mutex::new(None),
        }
    }

    /// Publish unless throttled. Terminal statuses always publish.
    /// Returns whether the snapshot went out.
    pub fn maybe_notify(&self, snapshot: &ProgressSnapshot) -> bool {
        let mut last = self.last.lock().unwrap();
        let milestone = snapshot.milestone();

        if !snapshot.status.is_terminal() {
            if let Some((at, last_milestone)) = *last {
                if at.elapsed() < self.min_interval && milestone <= last_milestone {
                    debug!(
                        arn = %snapshot.execution_arn,
                        "progress write throttled"
                    );
                    return false;
                }
            }
        }

        *last = Some((Instant::now(), milestone));
        self.sink.publish(snapshot);
        true
    }
}
