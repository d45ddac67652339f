//! # Dashboard — HTTP API and Server Bootstrap
//!
//! Runs an Axum HTTP server exposing the trigger, metrics-inbox, record, task
//! and catalog endpoints, and drives the reconciliation loop in the
//! background.
//!
//! Handlers talk to the collaborators through trait objects held in
//! [`AppState`], so the router can be exercised against in-memory fakes.

mod routes_catalog;
mod routes_health;
mod routes_records;
mod routes_tasks;

use anyhow::Result;
use axum::extract::Request;
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use std::time::Duration;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn, Instrument};

use crate::config::Settings;
use crate::db;
use crate::inbox::{MemoryInbox, MetricsInbox, RedisInbox};
use crate::jenkins::{BuildClient, JenkinsClient};
use crate::notify::{LogMailer, MailTransport, Notifier, SmtpMailer, WorkspaceFetcher};
use crate::prom_metrics::Metrics;
use crate::reconcile::Reconciler;
use crate::store::Store;

pub struct AppState {
    pub store: Arc<dyn Store>,
    pub ci: Arc<dyn BuildClient>,
    pub inbox: Arc<dyn MetricsInbox>,
    pub reconciler: Arc<Reconciler>,
    pub metrics: Arc<Metrics>,
    pub records_per_page: i64,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Store>,
        ci: Arc<dyn BuildClient>,
        inbox: Arc<dyn MetricsInbox>,
        reconciler: Arc<Reconciler>,
        metrics: Arc<Metrics>,
        records_per_page: i64,
    ) -> Arc<Self> {
        Arc::new(AppState {
            store,
            ci,
            inbox,
            reconciler,
            metrics,
            records_per_page: records_per_page.max(1),
        })
    }

    /// Wire the production collaborators around an already connected database.
    ///
    /// Without a `redis_url` the inbox lives in-process, and without SMTP
    /// settings mails are only logged.
    pub async fn assemble(settings: &Settings, database: db::Database) -> Result<Arc<Self>> {
        let store: Arc<dyn Store> = Arc::new(database);

        let inbox: Arc<dyn MetricsInbox> = match settings.redis_url.as_deref() {
            Some(url) => Arc::new(RedisInbox::connect(url).await?),
            None => {
                warn!("no redis_url configured, metrics inbox is process-local");
                Arc::new(MemoryInbox::new())
            }
        };

        let ci: Arc<dyn BuildClient> = Arc::new(JenkinsClient::new(&settings.jenkins)?);

        let mailer: Arc<dyn MailTransport> = if settings.mail.is_configured() {
            Arc::new(SmtpMailer::new(&settings.mail)?)
        } else {
            warn!("SMTP not configured, result mails will only be logged");
            Arc::new(LogMailer)
        };
        let fetcher = Arc::new(WorkspaceFetcher::new(settings.attachments.root.clone()));

        let metrics = Arc::new(Metrics::new());
        let notifier = Arc::new(
            Notifier::new(Arc::clone(&store), mailer, fetcher).with_metrics(Arc::clone(&metrics)),
        );
        let reconciler = Arc::new(
            Reconciler::new(Arc::clone(&store), Arc::clone(&ci), Arc::clone(&inbox))
                .with_notifier(notifier)
                .with_metrics(Arc::clone(&metrics))
                .with_stuck_after(settings.engine.stuck_after()),
        );

        Ok(AppState::new(
            store,
            ci,
            inbox,
            reconciler,
            metrics,
            settings.records_per_page,
        ))
    }
}

/// JSON error body with the given status.
pub(super) fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

pub(super) fn internal_error(e: anyhow::Error) -> Response {
    warn!(error = %e, "request failed");
    api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

/// Generates (or propagates) a request ID and wraps the request in a tracing
/// span using `.instrument()` so it follows the handler across awaits.
async fn request_id_middleware(req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        method = %req.method(),
        path = %req.uri().path(),
    );
    let mut response = next.run(req).instrument(span).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/records", get(routes_records::handler_records_list))
        .route(
            "/api/records/trigger",
            post(routes_records::handler_trigger),
        )
        .route(
            "/api/records/report_result",
            post(routes_records::handler_report_result),
        )
        .route("/api/records/{id}", get(routes_records::handler_record_get))
        .route(
            "/api/records/{id}/analysis",
            get(routes_records::handler_record_analysis),
        )
        .route(
            "/api/records/{id}/console",
            get(routes_records::handler_record_console),
        )
        .route("/api/tasks", post(routes_tasks::handler_task_create))
        .route(
            "/api/tasks/{id}",
            get(routes_tasks::handler_task_get)
                .put(routes_tasks::handler_task_update)
                .delete(routes_tasks::handler_task_delete),
        )
        .route(
            "/api/tasks/{id}/config",
            get(routes_tasks::handler_task_config),
        )
        .route(
            "/api/tasks/{id}/analysis",
            get(routes_tasks::handler_task_analysis),
        )
        .route(
            "/api/tasks/{id}/reconcile",
            post(routes_tasks::handler_task_reconcile),
        )
        .route("/api/servers", post(routes_catalog::handler_server_create))
        .route("/api/servers/{id}", get(routes_catalog::handler_server_get))
        .route(
            "/api/projects",
            get(routes_catalog::handler_projects_list).post(routes_catalog::handler_project_create),
        )
        .route(
            "/api/projects/{id}/tasks",
            get(routes_catalog::handler_project_tasks),
        )
        .route(
            "/api/email_templates",
            post(routes_catalog::handler_email_template_create),
        )
        .route("/healthz", get(routes_health::handler_healthz))
        .route("/readyz", get(routes_health::handler_readyz))
        .route("/metrics", get(routes_health::handler_metrics))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(CatchPanicLayer::new())
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(1024 * 1024))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(30),
        ))
        .with_state(state)
}

/// Serve the API and run the reconciliation loop until SIGINT/SIGTERM.
pub async fn run(settings: Settings, port: u16) -> Result<()> {
    let database = db::Database::connect(settings.require_database_url()?).await?;
    database.migrate().await?;
    let state = AppState::assemble(&settings, database).await?;
    let app = build_router(Arc::clone(&state));

    let interval = settings.engine.poll_interval();
    info!(secs = interval.as_secs(), "reconciliation loop starting");
    let engine = tokio::spawn(Arc::clone(&state.reconciler).run_loop(interval));

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!(port, "polaris API listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    engine.abort();
    state.reconciler.flush_notifications().await;
    info!("polaris shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("received SIGINT, shutting down"),
                    _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
                info!("received SIGINT, shutting down");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("received SIGINT, shutting down");
    }
}
