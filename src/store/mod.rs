//! # Store — Record Store Abstraction
//!
//! The persistence seam for servers, projects, tasks, build records, results
//! and email templates. [`crate::db::Database`] implements it on PostgreSQL;
//! [`memory::MemoryStore`] keeps everything in one mutex for tests and
//! single-node experiments.
//!
//! Two operations carry the concurrency guarantees the engine relies on:
//!
//! - [`Store::admit_record`] checks the one-in-flight-per-task rule and
//!   inserts the record in a single transaction.
//! - [`Store::complete_record`] writes the result and moves the record to its
//!   terminal state only if it is still `queued`. Losing the race returns
//!   `false` and writes nothing.
//!
//! Build numbers are unique per task. Only Jenkins numbers (always positive)
//! are stored, except for abandoned records, which carry `-id`.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::model::{
    NewRecord, NewResult, NewServer, ProjectRow, RecordPage, RecordRow, RecordState, ResultRow,
    ServerRow, TaskDraft, TaskRow, TrendRow,
};

pub use memory::MemoryStore;

/// Outcome of the transactional check-then-insert at trigger time.
#[derive(Debug, Clone)]
pub enum Admission {
    Admitted(RecordRow),
    /// The task already has a `queued` or `deferred` record.
    Busy,
    /// A finished record of the task already holds this build number.
    BuildTaken,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn health_check(&self) -> Result<()>;

    // ── Catalog ─────────────────────────────────────────────────

    async fn insert_server(&self, server: &NewServer) -> Result<ServerRow>;
    async fn get_server(&self, id: i64) -> Result<Option<ServerRow>>;

    async fn insert_project(&self, server_id: i64, name: &str, info: &str) -> Result<ProjectRow>;
    async fn get_project(&self, id: i64) -> Result<Option<ProjectRow>>;
    async fn list_projects(&self) -> Result<Vec<ProjectRow>>;

    async fn list_tasks(&self, project_id: i64) -> Result<Vec<TaskRow>>;
    async fn get_task(&self, id: i64) -> Result<Option<TaskRow>>;
    /// Task owning the given Jenkins job name, in any project.
    async fn find_task(&self, name: &str) -> Result<Option<TaskRow>>;
    /// Insert a task under the given job name.
    async fn insert_task(&self, project_id: i64, name: &str, draft: &TaskDraft) -> Result<TaskRow>;
    /// Overwrite the editable fields. The job name is never changed.
    async fn update_task(&self, id: i64, draft: &TaskDraft) -> Result<Option<TaskRow>>;
    /// Delete a task together with its records and results.
    async fn delete_task(&self, id: i64) -> Result<bool>;

    /// Body of the newest email template, if any.
    async fn latest_email_template(&self) -> Result<Option<String>>;
    async fn insert_email_template(&self, body_html: &str) -> Result<i64>;

    // ── Records ─────────────────────────────────────────────────

    async fn admit_record(&self, record: &NewRecord) -> Result<Admission>;

    /// Insert a `queued` record for a build discovered on the CI server.
    /// Returns the existing record if one already tracks that build.
    async fn backfill_record(
        &self,
        project_id: i64,
        task_id: i64,
        build_number: i64,
    ) -> Result<RecordRow>;

    async fn find_record(&self, task_id: i64, build_number: i64) -> Result<Option<RecordRow>>;
    async fn get_record(&self, id: i64) -> Result<Option<RecordRow>>;

    /// Records of a task in `state`, oldest first.
    async fn records_in_state(&self, task_id: i64, state: RecordState) -> Result<Vec<RecordRow>>;

    /// Move a `deferred` record to `queued` under `build_number`.
    /// Returns `false` if the record was not deferred.
    async fn promote_deferred(&self, id: i64, build_number: i64) -> Result<bool>;

    /// Compare-and-set `queued -> terminal` plus result insert, atomically.
    async fn complete_record(&self, id: i64, result: &NewResult) -> Result<bool>;

    /// Like [`Store::complete_record`] for a build that never ran: the record
    /// fails and its build number is re-keyed to `-id`, so the number Jenkins
    /// will hand out again stays free for the next admission.
    async fn abandon_record(&self, id: i64, result: &NewResult) -> Result<bool>;

    async fn result_for_record(&self, record_id: i64) -> Result<Option<ResultRow>>;

    /// Records of a project (optionally one task), newest first. `page` is 1-based.
    async fn records_page(
        &self,
        project_id: i64,
        task_id: Option<i64>,
        page: i64,
        per_page: i64,
    ) -> Result<RecordPage>;

    /// Completed records of a task with non-zero test counts, oldest first.
    async fn task_trend(&self, task_id: i64) -> Result<Vec<TrendRow>>;

    /// Records currently `queued` or `deferred` across all tasks.
    async fn count_inflight(&self) -> Result<i64>;
}

/// Clamp a user-supplied page number and compute the row offset.
pub(crate) fn page_offset(page: i64, per_page: i64) -> (i64, i64) {
    let page = page.max(1);
    (page, (page - 1) * per_page.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_offset_clamps_to_first_page() {
        assert_eq!(page_offset(0, 20), (1, 0));
        assert_eq!(page_offset(-3, 20), (1, 0));
        assert_eq!(page_offset(3, 20), (3, 40));
    }
}
