//! Servers, projects, tasks and email templates.
//!
//! Tasks are owned by a project and named `{project}_{nickname}` at creation;
//! updates rewrite every editable column but never the name. Deleting a task
//! cascades to its records and results through the foreign keys.

use super::Database;
use crate::model::{NewServer, ProjectRow, ServerRow, TaskDraft, TaskRow};
use anyhow::Result;

const TASK_COLUMNS: &str = "id, project_id, nickname, name, info, command, result_statistics,
     crontab, scheduler_enable, email_receivers, email_notification_enable,
     email_body, email_attachments";

impl Database {
    pub(super) async fn create_server(&self, server: &NewServer) -> Result<ServerRow> {
        let row = sqlx::query_as::<_, ServerRow>(
            "INSERT INTO servers (host, username, password, workspace, info)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING id, host, username, password, workspace, info",
        )
        .bind(&server.host)
        .bind(&server.username)
        .bind(&server.password)
        .bind(&server.workspace)
        .bind(&server.info)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub(super) async fn server_by_id(&self, id: i64) -> Result<Option<ServerRow>> {
        let row = sqlx::query_as::<_, ServerRow>(
            "SELECT id, host, username, password, workspace, info FROM servers WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub(super) async fn create_project(
        &self,
        server_id: i64,
        name: &str,
        info: &str,
    ) -> Result<ProjectRow> {
        let row = sqlx::query_as::<_, ProjectRow>(
            "INSERT INTO projects (server_id, name, info) VALUES ($1, $2, $3)
             RETURNING id, server_id, name, info",
        )
        .bind(server_id)
        .bind(name)
        .bind(info)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub(super) async fn project_by_id(&self, id: i64) -> Result<Option<ProjectRow>> {
        let row = sqlx::query_as::<_, ProjectRow>(
            "SELECT id, server_id, name, info FROM projects WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub(super) async fn all_projects(&self) -> Result<Vec<ProjectRow>> {
        let rows = sqlx::query_as::<_, ProjectRow>(
            "SELECT id, server_id, name, info FROM projects ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub(super) async fn tasks_of_project(&self, project_id: i64) -> Result<Vec<TaskRow>> {
        let sql = format!(
            "SELECT {} FROM tasks WHERE project_id = $1 ORDER BY id",
            TASK_COLUMNS
        );
        let rows = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(project_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub(super) async fn task_by_id(&self, id: i64) -> Result<Option<TaskRow>> {
        let sql = format!("SELECT {} FROM tasks WHERE id = $1", TASK_COLUMNS);
        let row = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub(super) async fn task_by_name(&self, name: &str) -> Result<Option<TaskRow>> {
        let sql = format!("SELECT {} FROM tasks WHERE name = $1", TASK_COLUMNS);
        let row = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub(super) async fn create_task(
        &self,
        project_id: i64,
        name: &str,
        draft: &TaskDraft,
    ) -> Result<TaskRow> {
        let sql = format!(
            "INSERT INTO tasks (project_id, name, nickname, info, command, result_statistics,
                                crontab, scheduler_enable, email_receivers,
                                email_notification_enable, email_body, email_attachments)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
             RETURNING {}",
            TASK_COLUMNS
        );
        let row = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(project_id)
            .bind(name)
            .bind(&draft.nickname)
            .bind(&draft.info)
            .bind(&draft.command)
            .bind(&draft.result_statistics)
            .bind(&draft.crontab)
            .bind(draft.scheduler_enable)
            .bind(&draft.email_receivers)
            .bind(draft.email_notification_enable)
            .bind(&draft.email_body)
            .bind(&draft.email_attachments)
            .fetch_one(&self.pool)
            .await?;
        Ok(row)
    }

    pub(super) async fn overwrite_task(&self, id: i64, draft: &TaskDraft) -> Result<Option<TaskRow>> {
        let sql = format!(
            "UPDATE tasks SET nickname = $2, info = $3, command = $4, result_statistics = $5,
                    crontab = $6, scheduler_enable = $7, email_receivers = $8,
                    email_notification_enable = $9, email_body = $10, email_attachments = $11
             WHERE id = $1
             RETURNING {}",
            TASK_COLUMNS
        );
        let row = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(id)
            .bind(&draft.nickname)
            .bind(&draft.info)
            .bind(&draft.command)
            .bind(&draft.result_statistics)
            .bind(&draft.crontab)
            .bind(draft.scheduler_enable)
            .bind(&draft.email_receivers)
            .bind(draft.email_notification_enable)
            .bind(&draft.email_body)
            .bind(&draft.email_attachments)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub(super) async fn remove_task(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub(super) async fn newest_email_template(&self) -> Result<Option<String>> {
        let body: Option<String> = sqlx::query_scalar(
            "SELECT body_html FROM email_templates ORDER BY created_at DESC, id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(body)
    }

    pub(super) async fn create_email_template(&self, body_html: &str) -> Result<i64> {
        let id: i64 =
            sqlx::query_scalar("INSERT INTO email_templates (body_html) VALUES ($1) RETURNING id")
                .bind(body_html)
                .fetch_one(&self.pool)
                .await?;
        Ok(id)
    }
}
