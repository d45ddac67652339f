//! Record endpoints: trigger, metrics reports, listing and per-record views.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

use super::{api_error, internal_error, AppState};
use crate::model::{RecordState, TestCounts};
use crate::trigger::{self, TriggerRequest};

pub(super) async fn handler_trigger(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TriggerRequest>,
) -> impl IntoResponse {
    match state.store.get_task(req.task_id).await {
        Ok(Some(task)) if task.project_id == req.project_id => {}
        Ok(_) => return api_error(StatusCode::NOT_FOUND, "task not found in project"),
        Err(e) => return internal_error(e),
    }

    match trigger::trigger(state.store.as_ref(), state.ci.as_ref(), &req).await {
        Ok(outcome) => {
            state.metrics.trigger_outcome(outcome.as_str());
            Json(serde_json::json!({ "state": outcome })).into_response()
        }
        Err(e) => internal_error(e),
    }
}

#[derive(Deserialize)]
pub(super) struct ReportPayload {
    project_name: String,
    task_name: String,
    tests: i64,
    errors: i64,
    failures: i64,
    skip: i64,
}

/// Counters are stored as `INTEGER`, so anything past `i32::MAX` is refused here.
fn counter(name: &str, value: i64) -> Result<u32, String> {
    i32::try_from(value)
        .ok()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| format!("{} must be between 0 and {}", name, i32::MAX))
}

impl ReportPayload {
    fn counts(&self) -> Result<TestCounts, String> {
        Ok(TestCounts::new(
            counter("tests", self.tests)?,
            counter("errors", self.errors)?,
            counter("failures", self.failures)?,
            counter("skip", self.skip)?,
        ))
    }
}

/// Called by the job's post-build step with the counters of the run.
pub(super) async fn handler_report_result(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ReportPayload>, JsonRejection>,
) -> impl IntoResponse {
    let Json(payload) = match payload {
        Ok(p) => p,
        Err(e) => return api_error(StatusCode::BAD_REQUEST, e.body_text()),
    };
    let counts = match payload.counts() {
        Ok(c) => c,
        Err(msg) => return api_error(StatusCode::BAD_REQUEST, msg),
    };

    match state
        .inbox
        .push(&payload.project_name, &payload.task_name, counts)
        .await
    {
        Ok(()) => {
            info!(
                project = %payload.project_name,
                task = %payload.task_name,
                tests = counts.tests,
                "metrics reported"
            );
            Json(serde_json::json!({ "status": 0, "msg": "ok" })).into_response()
        }
        Err(e) => internal_error(e),
    }
}

#[derive(Deserialize)]
pub(super) struct RecordsQuery {
    project_id: i64,
    #[serde(default)]
    task_id: Option<i64>,
    #[serde(default)]
    page: Option<i64>,
}

pub(super) async fn handler_records_list(
    State(state): State<Arc<AppState>>,
    Query(q): Query<RecordsQuery>,
) -> impl IntoResponse {
    // -1 selects every task of the project.
    let task_id = q.task_id.filter(|&id| id != -1);
    match state
        .store
        .records_page(
            q.project_id,
            task_id,
            q.page.unwrap_or(1),
            state.records_per_page,
        )
        .await
    {
        Ok(page) => Json(page).into_response(),
        Err(e) => internal_error(e),
    }
}

pub(super) async fn handler_record_get(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> impl IntoResponse {
    let record = match state.store.get_record(id).await {
        Ok(Some(r)) => r,
        Ok(None) => return api_error(StatusCode::NOT_FOUND, "record not found"),
        Err(e) => return internal_error(e),
    };
    match state.store.result_for_record(id).await {
        Ok(result) => Json(serde_json::json!({ "record": record, "result": result })).into_response(),
        Err(e) => internal_error(e),
    }
}

pub(super) async fn handler_record_analysis(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> impl IntoResponse {
    let record = match state.store.get_record(id).await {
        Ok(Some(r)) => r,
        Ok(None) => return api_error(StatusCode::NOT_FOUND, "record not found"),
        Err(e) => return internal_error(e),
    };
    if !record.state.is_terminal() {
        return Json(serde_json::json!({
            "finished": false,
            "msg": "the test has not finished yet",
        }))
        .into_response();
    }

    let result = match state.store.result_for_record(id).await {
        Ok(r) => r,
        Err(e) => return internal_error(e),
    };
    let counts = result.map(|r| r.counts()).unwrap_or_default();
    if counts.tests == 0 {
        return Json(serde_json::json!({
            "finished": true,
            "msg": "test metrics were not reported for this run",
        }))
        .into_response();
    }

    Json(serde_json::json!({
        "finished": true,
        "succeeded": record.state == RecordState::Succeeded,
        "tests": counts.tests,
        "pass": counts.passed(),
        "errors": counts.errors,
        "failures": counts.failures,
        "skip": counts.skip,
        "pass_rate": counts.pass_rate(),
    }))
    .into_response()
}

/// Console output. Terminal records answer from the stored result, the rest
/// are read live from Jenkins.
pub(super) async fn handler_record_console(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> impl IntoResponse {
    let record = match state.store.get_record(id).await {
        Ok(Some(r)) => r,
        Ok(None) => return api_error(StatusCode::NOT_FOUND, "record not found"),
        Err(e) => return internal_error(e),
    };

    if record.state.is_terminal() {
        return match state.store.result_for_record(id).await {
            Ok(result) => Json(serde_json::json!({
                "console": result.map(|r| r.console).unwrap_or_default(),
                "finished": true,
            }))
            .into_response(),
            Err(e) => internal_error(e),
        };
    }
    if record.state == RecordState::Deferred {
        return Json(serde_json::json!({ "console": "", "finished": false })).into_response();
    }

    let task = match state.store.get_task(record.task_id).await {
        Ok(Some(t)) => t,
        Ok(None) => return api_error(StatusCode::NOT_FOUND, "task not found"),
        Err(e) => return internal_error(e),
    };
    let console = match state.ci.console_output(&task.name, record.build_number).await {
        Ok(text) => text,
        Err(e) if e.is_not_found() => String::new(),
        Err(e) => {
            warn!(task = %task.name, build = record.build_number, error = %e, "console unavailable");
            return api_error(StatusCode::BAD_GATEWAY, e.to_string());
        }
    };
    let finished = match state.ci.build_result(&task.name, record.build_number).await {
        Ok(result) => result.is_some(),
        Err(e) if e.is_not_found() => false,
        Err(e) => return api_error(StatusCode::BAD_GATEWAY, e.to_string()),
    };
    Json(serde_json::json!({ "console": console, "finished": finished })).into_response()
}
