use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::Span;
use workpool::{CancelOutcome, TaskId};

use crate::server::data_models::{
    CancelResponse, SubmittedResponse, TaskReportBody, TaskRequest,
};
use crate::server::state::ServerState;
use crate::server::ServerError;

/// Run a task and answer with its result.
pub async fn execute_task(
    State(server_state): State<Arc<ServerState>>,
    Json(request): Json<TaskRequest>,
) -> Result<Json<TaskReportBody>, ServerError> {
    let start = Instant::now();
    let handle = server_state.client.submit(&request.kind, request.payload)?;
    Span::current().record("task_id", tracing::field::display(handle.id()));

    let body = TaskReportBody::try_from(handle.await)?;

    tracing::trace!(
        "Task `{}` took {} ms end to end",
        request.kind,
        start.elapsed().as_millis()
    );
    Ok(Json(body))
}

/// Queue a task and answer right away; the result is collected with
/// [`get_task_result`].
pub async fn submit_task(
    State(server_state): State<Arc<ServerState>>,
    Json(request): Json<TaskRequest>,
) -> Result<(StatusCode, Json<SubmittedResponse>), ServerError> {
    let id = server_state.submit(&request.kind, request.payload).await?;
    Span::current().record("task_id", tracing::field::display(id));

    Ok((StatusCode::ACCEPTED, Json(SubmittedResponse { id })))
}

/// Wait for a submitted task. A result can be collected once.
pub async fn get_task_result(
    State(server_state): State<Arc<ServerState>>,
    Path(task_id): Path<TaskId>,
) -> Result<Json<TaskReportBody>, ServerError> {
    Span::current().record("task_id", tracing::field::display(task_id));
    let report = server_state.collect(&task_id).await?;

    Ok(Json(TaskReportBody::try_from(report)?))
}

pub async fn cancel_task(
    State(server_state): State<Arc<ServerState>>,
    Path(task_id): Path<TaskId>,
) -> Result<Json<CancelResponse>, ServerError> {
    Span::current().record("task_id", tracing::field::display(task_id));
    let outcome = server_state.client.cancel(task_id).await?;
    if outcome == CancelOutcome::NotFound {
        return Err(ServerError::TaskNotFound(task_id));
    }
    // Its result is a cancellation nobody needs to collect
    server_state.forget(&task_id).await;

    Ok(Json(CancelResponse {
        id: task_id,
        outcome,
    }))
}
