//! # Database — PostgreSQL Record Store
//!
//! [`Store`] implementation over `sqlx::PgPool`. The schema lives in
//! `migrations/001_polaris_schema.sql` and is applied by [`Database::migrate`].
//!
//! ## Module Structure
//!
//! - [`catalog`]: servers, projects, tasks, email templates
//! - [`records`]: build records, results, admission and completion
//!
//! ## Transactions
//!
//! Admission locks the task row (`SELECT … FOR UPDATE`) before checking for
//! an in-flight record, so two concurrent triggers for one task serialize on
//! that lock. Completion is an `UPDATE … WHERE state = 0` whose affected-row
//! count decides whether the result row is inserted in the same transaction.

mod catalog;
mod records;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};

use crate::model::{
    NewRecord, NewResult, NewServer, ProjectRow, RecordPage, RecordRow, RecordState, ResultRow,
    ServerRow, TaskDraft, TaskRow, TrendRow,
};
use crate::store::{Admission, Store};

const SCHEMA: &str = include_str!("../../migrations/001_polaris_schema.sql");

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to PostgreSQL using the provided database URL.
    ///
    /// The URL is parsed by hand so percent-encoded credentials survive intact.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let url = url::Url::parse(database_url)?;
        let username = urlencoding::decode(url.username())?.into_owned();
        let password = url
            .password()
            .map(|p| urlencoding::decode(p).map(|s| s.into_owned()))
            .transpose()?;
        let mut opts = PgConnectOptions::new()
            .host(url.host_str().unwrap_or("localhost"))
            .port(url.port().unwrap_or(5432))
            .database(url.path().trim_start_matches('/'))
            .username(&username);
        if let Some(ref pw) = password {
            opts = opts.password(pw);
        }
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect_with(opts)
            .await?;
        Ok(Database { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the schema. Every statement is `IF NOT EXISTS`, so reruns are no-ops.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Execute `SELECT 1`. Backs the `/readyz` probe.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Store for Database {
    async fn health_check(&self) -> Result<()> {
        self.ping().await
    }

    async fn insert_server(&self, server: &NewServer) -> Result<ServerRow> {
        self.create_server(server).await
    }

    async fn get_server(&self, id: i64) -> Result<Option<ServerRow>> {
        self.server_by_id(id).await
    }

    async fn insert_project(&self, server_id: i64, name: &str, info: &str) -> Result<ProjectRow> {
        self.create_project(server_id, name, info).await
    }

    async fn get_project(&self, id: i64) -> Result<Option<ProjectRow>> {
        self.project_by_id(id).await
    }

    async fn list_projects(&self) -> Result<Vec<ProjectRow>> {
        self.all_projects().await
    }

    async fn list_tasks(&self, project_id: i64) -> Result<Vec<TaskRow>> {
        self.tasks_of_project(project_id).await
    }

    async fn get_task(&self, id: i64) -> Result<Option<TaskRow>> {
        self.task_by_id(id).await
    }

    async fn find_task(&self, name: &str) -> Result<Option<TaskRow>> {
        self.task_by_name(name).await
    }

    async fn insert_task(&self, project_id: i64, name: &str, draft: &TaskDraft) -> Result<TaskRow> {
        self.create_task(project_id, name, draft).await
    }

    async fn update_task(&self, id: i64, draft: &TaskDraft) -> Result<Option<TaskRow>> {
        self.overwrite_task(id, draft).await
    }

    async fn delete_task(&self, id: i64) -> Result<bool> {
        self.remove_task(id).await
    }

    async fn latest_email_template(&self) -> Result<Option<String>> {
        self.newest_email_template().await
    }

    async fn insert_email_template(&self, body_html: &str) -> Result<i64> {
        self.create_email_template(body_html).await
    }

    async fn admit_record(&self, record: &NewRecord) -> Result<Admission> {
        self.admit(record).await
    }

    async fn backfill_record(
        &self,
        project_id: i64,
        task_id: i64,
        build_number: i64,
    ) -> Result<RecordRow> {
        self.backfill(project_id, task_id, build_number).await
    }

    async fn find_record(&self, task_id: i64, build_number: i64) -> Result<Option<RecordRow>> {
        self.record_by_build(task_id, build_number).await
    }

    async fn get_record(&self, id: i64) -> Result<Option<RecordRow>> {
        self.record_by_id(id).await
    }

    async fn records_in_state(&self, task_id: i64, state: RecordState) -> Result<Vec<RecordRow>> {
        self.records_with_state(task_id, state).await
    }

    async fn promote_deferred(&self, id: i64, build_number: i64) -> Result<bool> {
        self.requeue_deferred(id, build_number).await
    }

    async fn complete_record(&self, id: i64, result: &NewResult) -> Result<bool> {
        self.finish(id, result, false).await
    }

    async fn abandon_record(&self, id: i64, result: &NewResult) -> Result<bool> {
        self.finish(id, result, true).await
    }

    async fn result_for_record(&self, record_id: i64) -> Result<Option<ResultRow>> {
        self.result_by_record(record_id).await
    }

    async fn records_page(
        &self,
        project_id: i64,
        task_id: Option<i64>,
        page: i64,
        per_page: i64,
    ) -> Result<RecordPage> {
        self.page_of_records(project_id, task_id, page, per_page)
            .await
    }

    async fn task_trend(&self, task_id: i64) -> Result<Vec<TrendRow>> {
        self.trend_of_task(task_id).await
    }

    async fn count_inflight(&self) -> Result<i64> {
        self.inflight_count().await
    }
}
