//! Servers, projects and email templates.

use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;

use super::{api_error, internal_error, AppState};
use crate::model::NewServer;
use crate::notify::attachments::is_plain_host;

pub(super) async fn handler_server_create(
    State(state): State<Arc<AppState>>,
    Json(server): Json<NewServer>,
) -> impl IntoResponse {
    if !is_plain_host(&server.host) {
        return api_error(
            StatusCode::BAD_REQUEST,
            "host must be a single non-empty name without path separators",
        );
    }
    match state.store.insert_server(&server).await {
        Ok(row) => (StatusCode::CREATED, Json(row)).into_response(),
        Err(e) => internal_error(e),
    }
}

pub(super) async fn handler_server_get(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> impl IntoResponse {
    match state.store.get_server(id).await {
        Ok(Some(row)) => Json(row).into_response(),
        Ok(None) => api_error(StatusCode::NOT_FOUND, "server not found"),
        Err(e) => internal_error(e),
    }
}

#[derive(Deserialize)]
pub(super) struct CreateProjectPayload {
    server_id: i64,
    name: String,
    #[serde(default)]
    info: String,
}

pub(super) async fn handler_projects_list(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.list_projects().await {
        Ok(projects) => Json(serde_json::json!({ "projects": projects })).into_response(),
        Err(e) => internal_error(e),
    }
}

pub(super) async fn handler_project_create(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateProjectPayload>,
) -> impl IntoResponse {
    // The name is part of every job name and inbox key.
    if crate::tasks::check_nickname(&payload.name).is_some() {
        return api_error(
            StatusCode::BAD_REQUEST,
            "project name must be non-empty without whitespace or URL metacharacters",
        );
    }
    match state.store.get_server(payload.server_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return api_error(StatusCode::NOT_FOUND, "server not found"),
        Err(e) => return internal_error(e),
    }
    match state
        .store
        .insert_project(payload.server_id, &payload.name, &payload.info)
        .await
    {
        Ok(row) => (StatusCode::CREATED, Json(row)).into_response(),
        Err(e) => internal_error(e),
    }
}

pub(super) async fn handler_project_tasks(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> impl IntoResponse {
    match state.store.get_project(id).await {
        Ok(Some(_)) => {}
        Ok(None) => return api_error(StatusCode::NOT_FOUND, "project not found"),
        Err(e) => return internal_error(e),
    }
    match state.store.list_tasks(id).await {
        Ok(tasks) => Json(serde_json::json!({ "tasks": tasks })).into_response(),
        Err(e) => internal_error(e),
    }
}

#[derive(Deserialize)]
pub(super) struct EmailTemplatePayload {
    body_html: String,
}

/// Store a new default mail body. The newest template wins.
pub(super) async fn handler_email_template_create(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<EmailTemplatePayload>,
) -> impl IntoResponse {
    match state.store.insert_email_template(&payload.body_html).await {
        Ok(id) => (StatusCode::CREATED, Json(serde_json::json!({ "id": id }))).into_response(),
        Err(e) => internal_error(e),
    }
}
