//! Task endpoints: management backed by Jenkins jobs, pass-rate trend, and
//! on-demand reconciliation.

use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use super::{api_error, internal_error, AppState};
use crate::model::{TaskDraft, TrendRow};
use crate::tasks::{self, TaskEdit, TaskEditOutcome};

#[derive(Deserialize)]
pub(super) struct CreateTaskPayload {
    project_id: i64,
    #[serde(flatten)]
    draft: TaskDraft,
}

fn edit_status(outcome: TaskEditOutcome, created: bool) -> StatusCode {
    match outcome {
        TaskEditOutcome::AgentError => StatusCode::BAD_GATEWAY,
        TaskEditOutcome::JobMissing | TaskEditOutcome::Duplicate => StatusCode::CONFLICT,
        _ if created => StatusCode::CREATED,
        _ => StatusCode::OK,
    }
}

pub(super) async fn handler_task_create(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateTaskPayload>,
) -> impl IntoResponse {
    if let Some(msg) = tasks::check_nickname(&payload.draft.nickname) {
        return api_error(StatusCode::BAD_REQUEST, msg);
    }
    match state.store.get_project(payload.project_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return api_error(StatusCode::NOT_FOUND, "project not found"),
        Err(e) => return internal_error(e),
    }

    match tasks::create_task(
        state.store.as_ref(),
        state.ci.as_ref(),
        payload.project_id,
        &payload.draft,
    )
    .await
    {
        Ok(edit) => (edit_status(edit.outcome, true), Json(edit)).into_response(),
        Err(e) => internal_error(e),
    }
}

pub(super) async fn handler_task_get(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> impl IntoResponse {
    match state.store.get_task(id).await {
        Ok(Some(task)) => Json(task).into_response(),
        Ok(None) => api_error(StatusCode::NOT_FOUND, "task not found"),
        Err(e) => internal_error(e),
    }
}

pub(super) async fn handler_task_update(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
    Json(draft): Json<TaskDraft>,
) -> impl IntoResponse {
    if let Some(msg) = tasks::check_nickname(&draft.nickname) {
        return api_error(StatusCode::BAD_REQUEST, msg);
    }
    match tasks::update_task(state.store.as_ref(), state.ci.as_ref(), id, &draft).await {
        Ok(Some(edit)) => (edit_status(edit.outcome, false), Json(edit)).into_response(),
        Ok(None) => api_error(StatusCode::NOT_FOUND, "task not found"),
        Err(e) => internal_error(e),
    }
}

pub(super) async fn handler_task_delete(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> impl IntoResponse {
    match tasks::delete_task(state.store.as_ref(), state.ci.as_ref(), id).await {
        Ok(Some(outcome)) => (
            edit_status(outcome, false),
            Json(TaskEdit {
                outcome,
                task: None,
            }),
        )
            .into_response(),
        Ok(None) => api_error(StatusCode::NOT_FOUND, "task not found"),
        Err(e) => internal_error(e),
    }
}

/// The job's current `config.xml`, as Jenkins holds it.
pub(super) async fn handler_task_config(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> impl IntoResponse {
    let task = match state.store.get_task(id).await {
        Ok(Some(t)) => t,
        Ok(None) => return api_error(StatusCode::NOT_FOUND, "task not found"),
        Err(e) => return internal_error(e),
    };
    match state.ci.job_config(&task.name).await {
        Ok(xml) => (
            StatusCode::OK,
            [("content-type", "application/xml; charset=utf-8")],
            xml,
        )
            .into_response(),
        Err(e) if e.is_not_found() => api_error(StatusCode::NOT_FOUND, "job not found on Jenkins"),
        Err(e) => {
            warn!(job = %task.name, error = %e, "job config unavailable");
            api_error(StatusCode::BAD_GATEWAY, e.to_string())
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
pub(super) struct TrendPoint {
    record_id: i64,
    build_number: i64,
    version: String,
    pass_rate: f64,
}

#[derive(Debug, Serialize, PartialEq)]
pub(super) struct Trend {
    points: Vec<TrendPoint>,
    /// Initial chart zoom start, in percent.
    zoom_start: i64,
}

fn trend(rows: &[TrendRow]) -> Trend {
    let points: Vec<TrendPoint> = rows
        .iter()
        .filter_map(|row| {
            let rate = row.counts().pass_rate()?;
            Some(TrendPoint {
                record_id: row.record_id,
                build_number: row.build_number,
                version: row.version.clone(),
                pass_rate: rate,
            })
        })
        .collect();
    let n = points.len();
    let zoom_start = if n > 10 {
        (10.0 / n as f64 * 100.0).round() as i64
    } else {
        0
    };
    Trend { points, zoom_start }
}

pub(super) async fn handler_task_analysis(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> impl IntoResponse {
    match state.store.get_task(id).await {
        Ok(Some(_)) => {}
        Ok(None) => return api_error(StatusCode::NOT_FOUND, "task not found"),
        Err(e) => return internal_error(e),
    }
    match state.store.task_trend(id).await {
        Ok(rows) => Json(trend(&rows)).into_response(),
        Err(e) => internal_error(e),
    }
}

pub(super) async fn handler_task_reconcile(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> impl IntoResponse {
    match state.reconciler.reconcile_task(id).await {
        Ok(Some(summary)) => Json(summary).into_response(),
        Ok(None) => api_error(StatusCode::NOT_FOUND, "task not found"),
        Err(e) => {
            warn!(task = id, error = %e, "on-demand reconciliation failed");
            api_error(StatusCode::BAD_GATEWAY, e.to_string())
        }
    }
}
