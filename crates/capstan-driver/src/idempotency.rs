//! Submit-path idempotency and terminal-event finalization.

use capstan_core::{CoreConfig, Error, ExecutionStatus, IdempotencyRecord, Result};
use capstan_store::{content_hash, ExecutionStore, IdempotencyStore};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

/// Derive a key from the canonical submit input when the caller did not
/// supply one. Equal submissions collapse to equal keys.
pub fn derive_idempotency_key(
    owner_id: &str,
    workflow_id: &str,
    initial_state: &serde_json::Value,
) -> String {
    let canonical = serde_json::to_string(initial_state).unwrap_or_default();
    content_hash(format!("{owner_id}\u{1f}{workflow_id}\u{1f}{canonical}").as_bytes())
}

/// Event envelopes are size-capped; payloads at or above the cap are
/// assumed truncated and refetched through the describe path.
const ENVELOPE_PAYLOAD_CAP: usize = 32 * 1024;

/// A status-change event from the orchestration layer. Delivered at
/// least once.
#[derive(Clone, Debug)]
pub struct TerminalEvent {
    pub execution_arn: String,
    pub status: ExecutionStatus,
    pub stop_date: Option<DateTime<Utc>>,
    /// Raw JSON input as carried by the envelope (possibly truncated).
    pub input: Option<String>,
    /// Raw JSON output as carried by the envelope (possibly truncated).
    pub output: Option<String>,
    pub error: Option<String>,
}

pub struct Finalizer {
    executions: Arc<dyn ExecutionStore>,
    idempotency: Arc<dyn IdempotencyStore>,
    config: CoreConfig,
}

impl Finalizer {
    pub fn new(
        executions: Arc<dyn ExecutionStore>,
        idempotency: Arc<dyn IdempotencyStore>,
        config: CoreConfig,
    ) -> Self {
        Self {
            executions,
            idempotency,
            config,
        }
    }

    /// Record a terminal outcome on the idempotency table. Non-terminal
    /// events are ignored; redeliveries are harmless (the update is a
    /// plain overwrite with identical content).
    pub async fn handle_terminal_event(&self, event: &TerminalEvent) -> Result<()> {
        if !event.status.is_terminal() {
            info!(
                arn = %event.execution_arn,
                status = ?event.status,
                "finalizer skipping non-terminal status"
            );
            return Ok(());
        }

        // Truncation defense: refetch through describe when the envelope
        // lost the payload.
        let truncated = |payload: &Option<String>| {
            payload
                .as_ref()
                .map(|p| p.len() >= ENVELOPE_PAYLOAD_CAP)
                .unwrap_or(true)
        };
        let needs_refetch = truncated(&event.input)
            || (event.status == ExecutionStatus::Succeeded && truncated(&event.output));

        let record = if needs_refetch {
            match self.executions.describe(&event.execution_arn).await {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(arn = %event.execution_arn, "finalizer describe failed: {e}");
                    return Err(e);
                }
            }
        } else {
            self.executions.get(&event.execution_arn).await.ok()
        };

        let idempotency_key = record
            .as_ref()
            .and_then(|r| r.idempotency_key.clone())
            .or_else(|| {
                event
                    .input
                    .as_ref()
                    .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
                    .and_then(|v| {
                        v.get("idempotency_key")
                            .and_then(|k| k.as_str())
                            .map(String::from)
                    })
            });

        let Some(idempotency_key) = idempotency_key else {
            info!(arn = %event.execution_arn, "finalizer found no idempotency key");
            return Ok(());
        };

        let output = record
            .as_ref()
            .and_then(|r| r.output.clone())
            .or_else(|| {
                event
                    .output
                    .as_ref()
                    .and_then(|raw| serde_json::from_str(raw).ok())
            });

        let ttl = Utc::now().timestamp() + (self.config.execution_ttl_hours as i64) * 3600;
        let updated = IdempotencyRecord {
            idempotency_key: idempotency_key.clone(),
            status: event.status,
            execution_arn: event.execution_arn.clone(),
            stop_date: event.stop_date.or(Some(Utc::now())),
            output: if event.status == ExecutionStatus::Succeeded {
                output
            } else {
                None
            },
            ttl: Some(ttl),
        };
        self.idempotency.update(&updated).await?;

        info!(
            key = %idempotency_key,
            arn = %event.execution_arn,
            status = ?event.status,
            "finalizer recorded terminal state"
        );
        Ok(())
    }
}

/// Outcome of the pre-execution idempotency check.
#[derive(Clone, Debug)]
pub enum IdempotencyCheck {
    /// No record: the caller should begin a new execution.
    Fresh,
    /// A run with this key is still going.
    InFlight { execution_arn: String },
    /// Terminal result available.
    Cached {
        execution_arn: String,
        status: ExecutionStatus,
        output: Option<serde_json::Value>,
    },
}

pub async fn check_idempotency(
    store: &dyn IdempotencyStore,
    idempotency_key: &str,
) -> Result<IdempotencyCheck> {
    match store.get(idempotency_key).await? {
        None => Ok(IdempotencyCheck::Fresh),
        Some(record) if record.status.is_terminal() => Ok(IdempotencyCheck::Cached {
            execution_arn: record.execution_arn,
            status: record.status,
            output: record.output,
        }),
        Some(record) => Ok(IdempotencyCheck::InFlight {
            execution_arn: record.execution_arn,
        }),
    }
}

/// Reserve the key for a new execution. `Conflict` means another submit
/// won the race — re-read and return its execution.
pub async fn reserve_key(
    store: &dyn IdempotencyStore,
    idempotency_key: &str,
    execution_arn: &str,
) -> Result<()> {
    let record = IdempotencyRecord {
        idempotency_key: idempotency_key.to_string(),
        status: ExecutionStatus::Running,
        execution_arn: execution_arn.to_string(),
        stop_date: None,
        output: None,
        ttl: None,
    };
    if store.put_if_absent(&record).await? {
        Ok(())
    } else {
        Err(Error::Conflict(format!(
            "idempotency key {idempotency_key} already reserved"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capstan_store::MemoryIdempotencyStore;

    #[test]
    fn derived_keys_are_stable_and_distinct() {
        let a = derive_idempotency_key("o", "w", &serde_json::json!({"x": 1}));
        let b = derive_idempotency_key("o", "w", &serde_json::json!({"x": 1}));
        let c = derive_idempotency_key("o", "w", &serde_json::json!({"x": 2}));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn reserve_is_first_writer_wins() {
        let store = MemoryIdempotencyStore::new();
        reserve_key(&store, "k", "arn-1").await.unwrap();
        let err = reserve_key(&store, "k", "arn-2").await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        match check_idempotency(&store, "k").await.unwrap() {
            IdempotencyCheck::InFlight { execution_arn } => assert_eq!(execution_arn, "arn-1"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
