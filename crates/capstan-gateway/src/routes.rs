//! HTTP handlers: submit, status, history, stop, delete, list, and the
//! HITP callback.

use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use capstan_core::{Error, ExecutionStatus, Result, WorkflowDefinition};
use capstan_driver::SubmitRequest;
use capstan_store::{ExecutionStore, TokenStore};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

/// Error -> HTTP mapping. Authorization failures on reads surface as
/// 404 upstream of this (owned_execution), so 403 never appears.
fn error_response(e: Error) -> Response {
    let status = match &e {
        Error::Validation(_) | Error::Json(_) => StatusCode::BAD_REQUEST,
        Error::AuthFailed { .. } => StatusCode::UNAUTHORIZED,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Conflict(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = Json(serde_json::json!({
        "error": e.code(),
        "message": if status == StatusCode::INTERNAL_SERVER_ERROR {
            // Internal detail never leaves the core.
            "internal error".to_string()
        } else {
            e.to_string()
        },
    }));
    (status, body).into_response()
}

fn authed(state: &AppState, headers: &HeaderMap) -> Result<String> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    state.auth.verify_bearer(header)
}

#[derive(Deserialize)]
pub struct SaveWorkflowBody {
    #[serde(flatten)]
    pub workflow: WorkflowDefinition,
    /// Opt-in: reject statically ambiguous routing at save time.
    #[serde(default)]
    pub strict: bool,
}

pub async fn save_workflow(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<SaveWorkflowBody>,
) -> Response {
    let result = (|| {
        let owner = authed(&state, &headers)?;
        if body.strict {
            body.workflow.validate_strict()?;
        }
        state.save_workflow(&owner, body.workflow.clone())?;
        Ok::<_, Error>(Json(serde_json::json!({
            "workflow_id": body.workflow.workflow_id,
            "saved": true,
        }))
        .into_response())
    })();
    result.unwrap_or_else(error_response)
}

#[derive(Deserialize)]
pub struct SubmitBody {
    pub workflow_id: String,
    #[serde(default)]
    pub initial_state: serde_json::Value,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

pub async fn submit(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<SubmitBody>,
) -> Response {
    let owner = match authed(&state, &headers) {
        Ok(owner) => owner,
        Err(e) => return error_response(e),
    };
    let workflow = match state.workflow(&owner, &body.workflow_id) {
        Ok(workflow) => workflow,
        Err(e) => return error_response(e),
    };

    info!(owner = %owner, workflow = %body.workflow_id, "submit received");
    let request = SubmitRequest {
        workflow,
        initial_state: body.initial_state,
        idempotency_key: body.idempotency_key,
        owner_id: owner,
    };
    match state.driver.submit(request).await {
        Ok(outcome) => Json(serde_json::json!({
            "execution_arn": outcome.execution_arn,
            "status": outcome.status,
            "deduplicated": outcome.deduplicated,
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn get_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(execution_arn): Path<String>,
) -> Response {
    let result = async {
        let owner = authed(&state, &headers)?;
        let record = state.owned_execution(&owner, &execution_arn).await?;
        Ok::<_, Error>(Json(serde_json::json!({
            "execution_arn": record.execution_arn,
            "status": record.status,
            "startDate": record.start_date,
            "stopDate": record.stop_date,
            "output": record.output,
            "error": record.error,
            "message": record.message,
        }))
        .into_response())
    }
    .await;
    result.unwrap_or_else(error_response)
}

pub async fn get_history(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(execution_arn): Path<String>,
) -> Response {
    let result = async {
        let owner = authed(&state, &headers)?;
        let record = state.owned_execution(&owner, &execution_arn).await?;
        Ok::<_, Error>(Json(serde_json::json!({
            "execution_arn": record.execution_arn,
            "current_manifest_id": record.current_manifest_id,
            "healing_count": record.healing_count,
            "steps": record.step_history,
        }))
        .into_response())
    }
    .await;
    result.unwrap_or_else(error_response)
}

pub async fn stop_execution(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(execution_arn): Path<String>,
) -> Response {
    let result = async {
        let owner = authed(&state, &headers)?;
        state.owned_execution(&owner, &execution_arn).await?;
        // Conditional RUNNING -> ABORTED; a second stop (or a stop on a
        // terminal execution) conflicts. Paused executions are also
        // stoppable.
        let stopped = state
            .executions
            .transition_status(
                &execution_arn,
                ExecutionStatus::Running,
                ExecutionStatus::Aborted,
            )
            .await;
        if stopped.is_err() {
            state
                .executions
                .transition_status(
                    &execution_arn,
                    ExecutionStatus::PausedForHitp,
                    ExecutionStatus::Aborted,
                )
                .await?;
        }
        info!(arn = %execution_arn, "execution stopped");
        Ok::<_, Error>(Json(serde_json::json!({
            "execution_arn": execution_arn,
            "status": ExecutionStatus::Aborted,
        }))
        .into_response())
    }
    .await;
    result.unwrap_or_else(error_response)
}

pub async fn delete_execution(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(execution_arn): Path<String>,
) -> Response {
    let result = async {
        let owner = authed(&state, &headers)?;
        // Ownership first: deleting a foreign execution 404s.
        state.owned_execution(&owner, &execution_arn).await?;
        state.executions.delete(&execution_arn).await?;
        Ok::<_, Error>(StatusCode::NO_CONTENT.into_response())
    }
    .await;
    result.unwrap_or_else(error_response)
}

pub async fn list_executions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let result = async {
        let owner = authed(&state, &headers)?;
        let records = state.executions.list_by_owner(&owner).await?;
        let rows: Vec<serde_json::Value> = records
            .iter()
            .map(|r| {
                serde_json::json!({
                    "execution_arn": r.execution_arn,
                    "workflow_id": r.workflow_id,
                    "status": r.status,
                    "startDate": r.start_date,
                    "stopDate": r.stop_date,
                })
            })
            .collect();
        Ok::<_, Error>(Json(serde_json::json!({ "executions": rows })).into_response())
    }
    .await;
    result.unwrap_or_else(error_response)
}

#[derive(Deserialize)]
pub struct HitpCallbackBody {
    pub execution_arn: String,
    pub task_token: String,
    pub decision: serde_json::Value,
}

/// HITP resume: ownership is checked against the stored token record
/// before the decision is merged and the execution continues.
pub async fn hitp_callback(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<HitpCallbackBody>,
) -> Response {
    let result = async {
        let owner = authed(&state, &headers)?;
        let stored = state
            .tokens
            .get(&body.execution_arn)
            .await?
            .ok_or_else(|| Error::NotFound(format!("execution {}", body.execution_arn)))?;
        if stored.owner_id != owner {
            return Err(Error::NotFound(format!(
                "execution {}",
                body.execution_arn
            )));
        }

        let workflow = state.workflow(&owner, &stored.workflow_id)?;
        let outcome = state
            .driver
            .resume(&body.execution_arn, &body.task_token, body.decision, workflow)
            .await?;
        Ok::<_, Error>(Json(serde_json::json!({
            "execution_arn": outcome.execution_arn,
            "status": outcome.status,
        }))
        .into_response())
    }
    .await;
    result.unwrap_or_else(error_response)
}
