//! Shared test helpers for integration tests.
//!
//! In-memory collaborators (store, inbox, a scripted Jenkins and a recording
//! mailer) wired the same way `AppState::assemble` wires the real ones, plus
//! the PostgreSQL helpers gated on `TEST_DATABASE_URL`.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;

use polaris::dashboard::{build_router, AppState};
use polaris::inbox::{MemoryInbox, MetricsInbox};
use polaris::jenkins::{BuildClient, CiError, CiResult, JobBuilds};
use polaris::model::{
    NewRecord, NewResult, NewServer, ProjectRow, RecordPage, RecordRow, RecordState, ResultRow,
    ServerRow, TaskDraft, TaskRow, TrendRow,
};
use polaris::notify::{MailTransport, Notifier, OutgoingMail, WorkspaceFetcher};
use polaris::prom_metrics::Metrics;
use polaris::reconcile::Reconciler;
use polaris::store::{Admission, MemoryStore, Store};

// ── Scripted Jenkins ────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct FakeBuild {
    pub result: Option<String>,
    pub console: String,
}

#[derive(Debug, Clone)]
pub struct FakeJob {
    pub next_build_number: i64,
    pub builds: BTreeMap<i64, FakeBuild>,
    pub config_xml: String,
}

#[derive(Default)]
struct FakeJenkins {
    jobs: HashMap<String, FakeJob>,
    nodes: HashMap<String, bool>,
    unreachable: bool,
    refuse_starts: bool,
    listing_delay: Option<std::time::Duration>,
    calls: Vec<String>,
}

/// In-memory Jenkins that records every call it receives.
#[derive(Default)]
pub struct FakeBuildClient {
    inner: Mutex<FakeJenkins>,
}

impl FakeBuildClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_job(&self, job: &str, next_build_number: i64) {
        self.inner.lock().unwrap().jobs.insert(
            job.to_string(),
            FakeJob {
                next_build_number,
                builds: BTreeMap::new(),
                config_xml: String::new(),
            },
        );
    }

    pub fn set_node(&self, node: &str, online: bool) {
        self.inner
            .lock()
            .unwrap()
            .nodes
            .insert(node.to_string(), online);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.lock().unwrap().unreachable = unreachable;
    }

    /// Make `start_build` fail with a 500 while everything else keeps working.
    pub fn set_refuse_starts(&self, refuse: bool) {
        self.inner.lock().unwrap().refuse_starts = refuse;
    }

    /// Make every `job_builds` call sleep first, to hold a tick open.
    pub fn set_listing_delay(&self, delay: std::time::Duration) {
        self.inner.lock().unwrap().listing_delay = Some(delay);
    }

    /// Record a build that was started outside the platform.
    pub fn add_build(&self, job: &str, number: i64) {
        let mut j = self.inner.lock().unwrap();
        let job = j.jobs.get_mut(job).unwrap();
        job.builds.insert(number, FakeBuild::default());
        job.next_build_number = job.next_build_number.max(number + 1);
    }

    pub fn finish(&self, job: &str, number: i64, result: &str, console: &str) {
        let mut j = self.inner.lock().unwrap();
        let build = j
            .jobs
            .get_mut(job)
            .unwrap()
            .builds
            .entry(number)
            .or_default();
        build.result = Some(result.to_string());
        build.console = console.to_string();
    }

    pub fn job(&self, job: &str) -> Option<FakeJob> {
        self.inner.lock().unwrap().jobs.get(job).cloned()
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn enter(&self, call: String) -> CiResult<std::sync::MutexGuard<'_, FakeJenkins>> {
        let mut j = self.inner.lock().unwrap();
        j.calls.push(call);
        if j.unreachable {
            return Err(CiError::Unreachable("connection refused".into()));
        }
        Ok(j)
    }
}

fn missing(what: &str) -> CiError {
    CiError::NotFound(what.to_string())
}

#[async_trait]
impl BuildClient for FakeBuildClient {
    async fn next_build_number(&self, job: &str) -> CiResult<i64> {
        let j = self.enter(format!("next_build_number:{}", job))?;
        j.jobs
            .get(job)
            .map(|x| x.next_build_number)
            .ok_or_else(|| missing(job))
    }

    async fn job_builds(&self, job: &str) -> CiResult<JobBuilds> {
        let delay = self.inner.lock().unwrap().listing_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let j = self.enter(format!("job_builds:{}", job))?;
        let x = j.jobs.get(job).ok_or_else(|| missing(job))?;
        Ok(JobBuilds {
            next_build_number: x.next_build_number,
            builds: x.builds.keys().copied().collect(),
        })
    }

    async fn start_build(&self, job: &str) -> CiResult<()> {
        let mut j = self.enter(format!("start_build:{}", job))?;
        if j.refuse_starts {
            return Err(CiError::Status {
                status: 500,
                url: format!("/job/{}/build", job),
            });
        }
        let x = j.jobs.get_mut(job).ok_or_else(|| missing(job))?;
        let n = x.next_build_number;
        x.builds.insert(n, FakeBuild::default());
        x.next_build_number += 1;
        Ok(())
    }

    async fn build_result(&self, job: &str, build_number: i64) -> CiResult<Option<String>> {
        let j = self.enter(format!("build_result:{}:{}", job, build_number))?;
        let x = j.jobs.get(job).ok_or_else(|| missing(job))?;
        let b = x.builds.get(&build_number).ok_or_else(|| missing(job))?;
        Ok(b.result.clone())
    }

    async fn console_output(&self, job: &str, build_number: i64) -> CiResult<String> {
        let j = self.enter(format!("console_output:{}:{}", job, build_number))?;
        let x = j.jobs.get(job).ok_or_else(|| missing(job))?;
        let b = x.builds.get(&build_number).ok_or_else(|| missing(job))?;
        Ok(b.console.clone())
    }

    async fn node_online(&self, node: &str) -> CiResult<bool> {
        let j = self.enter(format!("node_online:{}", node))?;
        j.nodes.get(node).copied().ok_or_else(|| missing(node))
    }

    async fn create_job(&self, job: &str, config_xml: &str) -> CiResult<()> {
        let mut j = self.enter(format!("create_job:{}", job))?;
        j.jobs.insert(
            job.to_string(),
            FakeJob {
                next_build_number: 1,
                builds: BTreeMap::new(),
                config_xml: config_xml.to_string(),
            },
        );
        Ok(())
    }

    async fn job_config(&self, job: &str) -> CiResult<String> {
        let j = self.enter(format!("job_config:{}", job))?;
        j.jobs
            .get(job)
            .map(|x| x.config_xml.clone())
            .ok_or_else(|| missing(job))
    }

    async fn reconfigure_job(&self, job: &str, config_xml: &str) -> CiResult<()> {
        let mut j = self.enter(format!("reconfigure_job:{}", job))?;
        let x = j.jobs.get_mut(job).ok_or_else(|| missing(job))?;
        x.config_xml = config_xml.to_string();
        Ok(())
    }

    async fn delete_job(&self, job: &str) -> CiResult<()> {
        let mut j = self.enter(format!("delete_job:{}", job))?;
        j.jobs.remove(job).map(|_| ()).ok_or_else(|| missing(job))
    }
}

// ── Store whose completions always lose ─────────────────────────

/// [`MemoryStore`] in which every compare-and-set completion fails, as if
/// another writer had already finished the record.
pub struct RacedStore {
    pub inner: Arc<MemoryStore>,
}

#[async_trait]
impl Store for RacedStore {
    async fn health_check(&self) -> Result<()> {
        self.inner.health_check().await
    }
    async fn insert_server(&self, server: &NewServer) -> Result<ServerRow> {
        self.inner.insert_server(server).await
    }
    async fn get_server(&self, id: i64) -> Result<Option<ServerRow>> {
        self.inner.get_server(id).await
    }
    async fn insert_project(&self, server_id: i64, name: &str, info: &str) -> Result<ProjectRow> {
        self.inner.insert_project(server_id, name, info).await
    }
    async fn get_project(&self, id: i64) -> Result<Option<ProjectRow>> {
        self.inner.get_project(id).await
    }
    async fn list_projects(&self) -> Result<Vec<ProjectRow>> {
        self.inner.list_projects().await
    }
    async fn list_tasks(&self, project_id: i64) -> Result<Vec<TaskRow>> {
        self.inner.list_tasks(project_id).await
    }
    async fn get_task(&self, id: i64) -> Result<Option<TaskRow>> {
        self.inner.get_task(id).await
    }
    async fn find_task(&self, name: &str) -> Result<Option<TaskRow>> {
        self.inner.find_task(name).await
    }
    async fn insert_task(&self, project_id: i64, name: &str, draft: &TaskDraft) -> Result<TaskRow> {
        self.inner.insert_task(project_id, name, draft).await
    }
    async fn update_task(&self, id: i64, draft: &TaskDraft) -> Result<Option<TaskRow>> {
        self.inner.update_task(id, draft).await
    }
    async fn delete_task(&self, id: i64) -> Result<bool> {
        self.inner.delete_task(id).await
    }
    async fn latest_email_template(&self) -> Result<Option<String>> {
        self.inner.latest_email_template().await
    }
    async fn insert_email_template(&self, body_html: &str) -> Result<i64> {
        self.inner.insert_email_template(body_html).await
    }
    async fn admit_record(&self, record: &NewRecord) -> Result<Admission> {
        self.inner.admit_record(record).await
    }
    async fn backfill_record(
        &self,
        project_id: i64,
        task_id: i64,
        build_number: i64,
    ) -> Result<RecordRow> {
        self.inner
            .backfill_record(project_id, task_id, build_number)
            .await
    }
    async fn find_record(&self, task_id: i64, build_number: i64) -> Result<Option<RecordRow>> {
        self.inner.find_record(task_id, build_number).await
    }
    async fn get_record(&self, id: i64) -> Result<Option<RecordRow>> {
        self.inner.get_record(id).await
    }
    async fn records_in_state(&self, task_id: i64, state: RecordState) -> Result<Vec<RecordRow>> {
        self.inner.records_in_state(task_id, state).await
    }
    async fn promote_deferred(&self, id: i64, build_number: i64) -> Result<bool> {
        self.inner.promote_deferred(id, build_number).await
    }
    async fn complete_record(&self, _id: i64, _result: &NewResult) -> Result<bool> {
        Ok(false)
    }
    async fn abandon_record(&self, _id: i64, _result: &NewResult) -> Result<bool> {
        Ok(false)
    }
    async fn result_for_record(&self, record_id: i64) -> Result<Option<ResultRow>> {
        self.inner.result_for_record(record_id).await
    }
    async fn records_page(
        &self,
        project_id: i64,
        task_id: Option<i64>,
        page: i64,
        per_page: i64,
    ) -> Result<RecordPage> {
        self.inner
            .records_page(project_id, task_id, page, per_page)
            .await
    }
    async fn task_trend(&self, task_id: i64) -> Result<Vec<TrendRow>> {
        self.inner.task_trend(task_id).await
    }
    async fn count_inflight(&self) -> Result<i64> {
        self.inner.count_inflight().await
    }
}

// ── Recording mailer ────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<OutgoingMail>>,
}

impl RecordingMailer {
    pub fn sent(&self) -> Vec<OutgoingMail> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailTransport for RecordingMailer {
    async fn send(&self, mail: OutgoingMail) -> Result<()> {
        self.sent.lock().unwrap().push(mail);
        Ok(())
    }
}

// ── Seeded world ────────────────────────────────────────────────

pub const AGENT: &str = "agent-1";
pub const PROJECT: &str = "shop";
pub const NICKNAME: &str = "smoke";
pub const JOB: &str = "shop_smoke";

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub ci: Arc<FakeBuildClient>,
    pub inbox: Arc<MemoryInbox>,
    pub mailer: Arc<RecordingMailer>,
    pub metrics: Arc<Metrics>,
    pub reconciler: Arc<Reconciler>,
    pub server: ServerRow,
    pub project: ProjectRow,
    pub task: TaskRow,
}

pub fn draft(nickname: &str) -> TaskDraft {
    TaskDraft {
        nickname: nickname.to_string(),
        info: "checkout smoke tests".into(),
        command: "pytest -q tests/smoke".into(),
        result_statistics: "python report.py".into(),
        email_receivers: Some("qa@example.com，lead@example.com".into()),
        email_notification_enable: true,
        ..Default::default()
    }
}

impl Harness {
    /// One server (online), one project, one task whose job exists with
    /// `nextBuildNumber = 42`.
    pub async fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let ci = Arc::new(FakeBuildClient::new());
        let inbox = Arc::new(MemoryInbox::new());
        let mailer = Arc::new(RecordingMailer::default());
        let metrics = Arc::new(Metrics::new());

        let server = store
            .insert_server(&NewServer {
                host: AGENT.into(),
                username: "tester".into(),
                password: "secret".into(),
                workspace: "/home/tester".into(),
                info: String::new(),
            })
            .await
            .unwrap();
        let project = store
            .insert_project(server.id, PROJECT, "web shop")
            .await
            .unwrap();
        let task = store
            .insert_task(project.id, JOB, &draft(NICKNAME))
            .await
            .unwrap();
        ci.add_job(JOB, 42);
        ci.set_node(AGENT, true);

        let dyn_store: Arc<dyn Store> = store.clone();
        let notifier = Arc::new(
            Notifier::new(
                Arc::clone(&dyn_store),
                mailer.clone(),
                Arc::new(WorkspaceFetcher::new("/nonexistent-polaris-workspaces")),
            )
            .with_metrics(Arc::clone(&metrics)),
        );
        let reconciler = Arc::new(
            Reconciler::new(dyn_store, ci.clone(), inbox.clone())
                .with_notifier(notifier)
                .with_metrics(Arc::clone(&metrics)),
        );

        Harness {
            store,
            ci,
            inbox,
            mailer,
            metrics,
            reconciler,
            server,
            project,
            task,
        }
    }

    pub fn state(&self) -> Arc<AppState> {
        let store: Arc<dyn Store> = self.store.clone();
        let ci: Arc<dyn BuildClient> = self.ci.clone();
        let inbox: Arc<dyn MetricsInbox> = self.inbox.clone();
        AppState::new(
            store,
            ci,
            inbox,
            Arc::clone(&self.reconciler),
            Arc::clone(&self.metrics),
            20,
        )
    }

    pub fn router(&self) -> axum::Router {
        build_router(self.state())
    }
}

// ── PostgreSQL ──────────────────────────────────────────────────

/// Returns the test database URL from the `TEST_DATABASE_URL` environment variable.
/// Panics if the variable is not set.
pub fn test_db_url() -> String {
    std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must be set for integration tests")
}

/// Returns true if the test database URL is configured.
pub fn has_test_db() -> bool {
    std::env::var("TEST_DATABASE_URL").is_ok()
}

/// Connect, apply the schema, and empty every table.
pub async fn setup_test_db() -> polaris::db::Database {
    let db = polaris::db::Database::connect(&test_db_url())
        .await
        .expect("Failed to connect to test database");
    db.migrate().await.expect("Failed to apply schema");
    sqlx::raw_sql(
        "TRUNCATE TABLE results, records, tasks, projects, servers, email_templates
         RESTART IDENTITY CASCADE",
    )
    .execute(db.pool())
    .await
    .expect("Failed to truncate tables");
    db
}
