//! In-process [`Store`] backed by one mutex-guarded set of tables.
//!
//! Every operation takes the lock once, so the check-then-insert in
//! [`Store::admit_record`] and the compare-and-set in
//! [`Store::complete_record`] are atomic with respect to each other.

use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;

use super::{page_offset, Admission, Store};
use crate::lock_or_recover;
use crate::model::{
    counter_to_i32, NewRecord, NewResult, NewServer, ProjectRow, RecordPage, RecordRow,
    RecordState, ResultRow, ServerRow, TaskDraft, TaskRow, TrendRow,
};

#[derive(Default)]
struct Tables {
    next_id: i64,
    servers: Vec<ServerRow>,
    projects: Vec<ProjectRow>,
    tasks: Vec<TaskRow>,
    records: Vec<RecordRow>,
    results: Vec<ResultRow>,
    templates: Vec<(i64, String)>,
}

impl Tables {
    fn id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn record_mut(&mut self, id: i64) -> Option<&mut RecordRow> {
        self.records.iter_mut().find(|r| r.id == id)
    }

    fn has_inflight(&self, task_id: i64) -> bool {
        self.records
            .iter()
            .any(|r| r.task_id == task_id && r.state.is_in_flight())
    }

    /// Compare-and-set `queued -> terminal` plus the result row.
    fn finish(&mut self, id: i64, result: &NewResult, release_build: bool) -> bool {
        match self.record_mut(id) {
            Some(r) if r.state == RecordState::Queued => {
                r.state = result.verdict.terminal_state();
                if release_build {
                    r.build_number = -id;
                }
            }
            _ => return false,
        }
        let row = ResultRow {
            id: self.id(),
            record_id: id,
            console: result.console.clone(),
            status: result.verdict.exit_status(),
            tests: counter_to_i32(result.counts.tests),
            errors: counter_to_i32(result.counts.errors),
            failures: counter_to_i32(result.counts.failures),
            skip: counter_to_i32(result.counts.skip),
            created_at: Utc::now(),
        };
        self.results.push(row);
        true
    }

    fn build_taken(&self, task_id: i64, build_number: i64) -> bool {
        self.records
            .iter()
            .any(|r| r.task_id == task_id && r.build_number == build_number)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every record, in insertion order.
    pub fn all_records(&self) -> Vec<RecordRow> {
        lock_or_recover(&self.tables).records.clone()
    }

    /// Number of results stored for a record. More than one is a bug.
    pub fn result_count(&self, record_id: i64) -> usize {
        lock_or_recover(&self.tables)
            .results
            .iter()
            .filter(|r| r.record_id == record_id)
            .count()
    }
}

fn task_from_draft(id: i64, project_id: i64, name: &str, draft: &TaskDraft) -> TaskRow {
    TaskRow {
        id,
        project_id,
        nickname: draft.nickname.clone(),
        name: name.to_string(),
        info: draft.info.clone(),
        command: draft.command.clone(),
        result_statistics: draft.result_statistics.clone(),
        crontab: draft.crontab.clone(),
        scheduler_enable: draft.scheduler_enable,
        email_receivers: draft.email_receivers.clone(),
        email_notification_enable: draft.email_notification_enable,
        email_body: draft.email_body.clone(),
        email_attachments: draft.email_attachments.clone(),
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    async fn insert_server(&self, server: &NewServer) -> Result<ServerRow> {
        let mut t = lock_or_recover(&self.tables);
        if t.servers.iter().any(|s| s.host == server.host) {
            bail!("server {} already registered", server.host);
        }
        let row = ServerRow {
            id: t.id(),
            host: server.host.clone(),
            username: server.username.clone(),
            password: server.password.clone(),
            workspace: server.workspace.clone(),
            info: server.info.clone(),
        };
        t.servers.push(row.clone());
        Ok(row)
    }

    async fn get_server(&self, id: i64) -> Result<Option<ServerRow>> {
        let t = lock_or_recover(&self.tables);
        Ok(t.servers.iter().find(|s| s.id == id).cloned())
    }

    async fn insert_project(&self, server_id: i64, name: &str, info: &str) -> Result<ProjectRow> {
        let mut t = lock_or_recover(&self.tables);
        if !t.servers.iter().any(|s| s.id == server_id) {
            bail!("server {} does not exist", server_id);
        }
        if t.projects.iter().any(|p| p.name == name) {
            bail!("project {} already exists", name);
        }
        let row = ProjectRow {
            id: t.id(),
            server_id,
            name: name.to_string(),
            info: info.to_string(),
        };
        t.projects.push(row.clone());
        Ok(row)
    }

    async fn get_project(&self, id: i64) -> Result<Option<ProjectRow>> {
        let t = lock_or_recover(&self.tables);
        Ok(t.projects.iter().find(|p| p.id == id).cloned())
    }

    async fn list_projects(&self) -> Result<Vec<ProjectRow>> {
        Ok(lock_or_recover(&self.tables).projects.clone())
    }

    async fn list_tasks(&self, project_id: i64) -> Result<Vec<TaskRow>> {
        let t = lock_or_recover(&self.tables);
        Ok(t.tasks
            .iter()
            .filter(|task| task.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn get_task(&self, id: i64) -> Result<Option<TaskRow>> {
        let t = lock_or_recover(&self.tables);
        Ok(t.tasks.iter().find(|task| task.id == id).cloned())
    }

    async fn find_task(&self, name: &str) -> Result<Option<TaskRow>> {
        let t = lock_or_recover(&self.tables);
        Ok(t.tasks.iter().find(|task| task.name == name).cloned())
    }

    async fn insert_task(&self, project_id: i64, name: &str, draft: &TaskDraft) -> Result<TaskRow> {
        let mut t = lock_or_recover(&self.tables);
        if t.tasks.iter().any(|task| task.name == name) {
            bail!("task {} already exists", name);
        }
        let id = t.id();
        let row = task_from_draft(id, project_id, name, draft);
        t.tasks.push(row.clone());
        Ok(row)
    }

    async fn update_task(&self, id: i64, draft: &TaskDraft) -> Result<Option<TaskRow>> {
        let mut t = lock_or_recover(&self.tables);
        let Some(task) = t.tasks.iter_mut().find(|task| task.id == id) else {
            return Ok(None);
        };
        *task = task_from_draft(id, task.project_id, &task.name, draft);
        Ok(Some(task.clone()))
    }

    async fn delete_task(&self, id: i64) -> Result<bool> {
        let mut t = lock_or_recover(&self.tables);
        let before = t.tasks.len();
        t.tasks.retain(|task| task.id != id);
        if t.tasks.len() == before {
            return Ok(false);
        }
        let doomed: Vec<i64> = t
            .records
            .iter()
            .filter(|r| r.task_id == id)
            .map(|r| r.id)
            .collect();
        t.records.retain(|r| r.task_id != id);
        t.results.retain(|r| !doomed.contains(&r.record_id));
        Ok(true)
    }

    async fn latest_email_template(&self) -> Result<Option<String>> {
        let t = lock_or_recover(&self.tables);
        Ok(t.templates.last().map(|(_, body)| body.clone()))
    }

    async fn insert_email_template(&self, body_html: &str) -> Result<i64> {
        let mut t = lock_or_recover(&self.tables);
        let id = t.id();
        t.templates.push((id, body_html.to_string()));
        Ok(id)
    }

    async fn admit_record(&self, record: &NewRecord) -> Result<Admission> {
        let mut t = lock_or_recover(&self.tables);
        if t.has_inflight(record.task_id) {
            return Ok(Admission::Busy);
        }
        if t.build_taken(record.task_id, record.build_number) {
            return Ok(Admission::BuildTaken);
        }
        let row = RecordRow {
            id: t.id(),
            user_id: record.user_id,
            project_id: record.project_id,
            task_id: record.task_id,
            build_number: record.build_number,
            version: record.version.clone(),
            state: record.state,
            created_at: Utc::now(),
            queued_at: (record.state == RecordState::Queued).then(Utc::now),
        };
        t.records.push(row.clone());
        Ok(Admission::Admitted(row))
    }

    async fn backfill_record(
        &self,
        project_id: i64,
        task_id: i64,
        build_number: i64,
    ) -> Result<RecordRow> {
        let mut t = lock_or_recover(&self.tables);
        if let Some(existing) = t
            .records
            .iter()
            .find(|r| r.task_id == task_id && r.build_number == build_number)
        {
            return Ok(existing.clone());
        }
        let row = RecordRow {
            id: t.id(),
            user_id: None,
            project_id,
            task_id,
            build_number,
            version: crate::model::BACKFILL_VERSION.to_string(),
            state: RecordState::Queued,
            created_at: Utc::now(),
            queued_at: Some(Utc::now()),
        };
        t.records.push(row.clone());
        Ok(row)
    }

    async fn find_record(&self, task_id: i64, build_number: i64) -> Result<Option<RecordRow>> {
        let t = lock_or_recover(&self.tables);
        Ok(t.records
            .iter()
            .find(|r| r.task_id == task_id && r.build_number == build_number)
            .cloned())
    }

    async fn get_record(&self, id: i64) -> Result<Option<RecordRow>> {
        let t = lock_or_recover(&self.tables);
        Ok(t.records.iter().find(|r| r.id == id).cloned())
    }

    async fn records_in_state(&self, task_id: i64, state: RecordState) -> Result<Vec<RecordRow>> {
        let t = lock_or_recover(&self.tables);
        Ok(t.records
            .iter()
            .filter(|r| r.task_id == task_id && r.state == state)
            .cloned()
            .collect())
    }

    async fn promote_deferred(&self, id: i64, build_number: i64) -> Result<bool> {
        let mut t = lock_or_recover(&self.tables);
        let Some(task_id) = t.records.iter().find(|r| r.id == id).map(|r| r.task_id) else {
            return Ok(false);
        };
        if t
            .records
            .iter()
            .any(|r| r.id != id && r.task_id == task_id && r.build_number == build_number)
        {
            bail!("task {} already has a record for build {}", task_id, build_number);
        }
        match t.record_mut(id) {
            Some(r) if r.state == RecordState::Deferred => {
                r.state = RecordState::Queued;
                r.build_number = build_number;
                r.queued_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete_record(&self, id: i64, result: &NewResult) -> Result<bool> {
        Ok(lock_or_recover(&self.tables).finish(id, result, false))
    }

    async fn abandon_record(&self, id: i64, result: &NewResult) -> Result<bool> {
        Ok(lock_or_recover(&self.tables).finish(id, result, true))
    }

    async fn result_for_record(&self, record_id: i64) -> Result<Option<ResultRow>> {
        let t = lock_or_recover(&self.tables);
        Ok(t.results.iter().find(|r| r.record_id == record_id).cloned())
    }

    async fn records_page(
        &self,
        project_id: i64,
        task_id: Option<i64>,
        page: i64,
        per_page: i64,
    ) -> Result<RecordPage> {
        let (page, offset) = page_offset(page, per_page);
        let t = lock_or_recover(&self.tables);
        let mut matching: Vec<&RecordRow> = t
            .records
            .iter()
            .filter(|r| r.project_id == project_id && task_id.is_none_or(|id| r.task_id == id))
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        let total = matching.len() as i64;
        let records = matching
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .take(usize::try_from(per_page).unwrap_or(0))
            .cloned()
            .collect();
        Ok(RecordPage {
            records,
            page,
            per_page,
            total,
        })
    }

    async fn task_trend(&self, task_id: i64) -> Result<Vec<TrendRow>> {
        let t = lock_or_recover(&self.tables);
        let mut rows: Vec<TrendRow> = t
            .records
            .iter()
            .filter(|r| r.task_id == task_id)
            .filter_map(|r| {
                let res = t.results.iter().find(|res| res.record_id == r.id)?;
                (res.tests > 0).then(|| TrendRow {
                    record_id: r.id,
                    build_number: r.build_number,
                    version: r.version.clone(),
                    tests: res.tests,
                    errors: res.errors,
                    failures: res.failures,
                    skip: res.skip,
                    created_at: r.created_at,
                })
            })
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.record_id.cmp(&b.record_id)));
        Ok(rows)
    }

    async fn count_inflight(&self) -> Result<i64> {
        let t = lock_or_recover(&self.tables);
        Ok(t.records.iter().filter(|r| r.state.is_in_flight()).count() as i64)
    }
}
