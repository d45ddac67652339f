//! Build records and their results.
//!
//! State values are the `SMALLINT` discriminants of [`RecordState`]:
//! `-2` deferred, `0` queued, `1` succeeded, `-1` failed. Every transition
//! is written as a conditional `UPDATE` on the expected source state, so a
//! concurrent writer that got there first simply makes ours a no-op.

use super::Database;
use crate::model::{
    counter_to_i32, NewRecord, NewResult, RecordPage, RecordRow, RecordState, ResultRow, TrendRow,
    BACKFILL_VERSION,
};
use crate::store::{page_offset, Admission};
use anyhow::{bail, Result};

const RECORD_COLUMNS: &str =
    "id, user_id, project_id, task_id, build_number, version, state, created_at, queued_at";

impl Database {
    pub(super) async fn admit(&self, record: &NewRecord) -> Result<Admission> {
        let mut tx = self.pool.begin().await?;

        let locked: Option<i64> = sqlx::query_scalar("SELECT id FROM tasks WHERE id = $1 FOR UPDATE")
            .bind(record.task_id)
            .fetch_optional(&mut *tx)
            .await?;
        if locked.is_none() {
            bail!("task {} does not exist", record.task_id);
        }

        let busy: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM records WHERE task_id = $1 AND state IN (-2, 0))",
        )
        .bind(record.task_id)
        .fetch_one(&mut *tx)
        .await?;
        if busy {
            tx.rollback().await?;
            return Ok(Admission::Busy);
        }

        let taken: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM records WHERE task_id = $1 AND build_number = $2)",
        )
        .bind(record.task_id)
        .bind(record.build_number)
        .fetch_one(&mut *tx)
        .await?;
        if taken {
            tx.rollback().await?;
            return Ok(Admission::BuildTaken);
        }

        let sql = format!(
            "INSERT INTO records (user_id, project_id, task_id, build_number, version, state, queued_at)
             VALUES ($1, $2, $3, $4, $5, $6, CASE WHEN $6 = 0 THEN NOW() END)
             RETURNING {}",
            RECORD_COLUMNS
        );
        let row = sqlx::query_as::<_, RecordRow>(&sql)
            .bind(record.user_id)
            .bind(record.project_id)
            .bind(record.task_id)
            .bind(record.build_number)
            .bind(&record.version)
            .bind(record.state)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(Admission::Admitted(row))
    }

    pub(super) async fn backfill(
        &self,
        project_id: i64,
        task_id: i64,
        build_number: i64,
    ) -> Result<RecordRow> {
        let sql = format!(
            "INSERT INTO records (user_id, project_id, task_id, build_number, version, state, queued_at)
             VALUES (NULL, $1, $2, $3, $4, 0, NOW())
             ON CONFLICT (task_id, build_number) DO NOTHING
             RETURNING {}",
            RECORD_COLUMNS
        );
        let inserted = sqlx::query_as::<_, RecordRow>(&sql)
            .bind(project_id)
            .bind(task_id)
            .bind(build_number)
            .bind(BACKFILL_VERSION)
            .fetch_optional(&self.pool)
            .await?;
        if let Some(row) = inserted {
            return Ok(row);
        }
        match self.record_by_build(task_id, build_number).await? {
            Some(row) => Ok(row),
            None => bail!(
                "record for task {} build {} vanished during backfill",
                task_id,
                build_number
            ),
        }
    }

    pub(super) async fn record_by_build(
        &self,
        task_id: i64,
        build_number: i64,
    ) -> Result<Option<RecordRow>> {
        let sql = format!(
            "SELECT {} FROM records WHERE task_id = $1 AND build_number = $2",
            RECORD_COLUMNS
        );
        let row = sqlx::query_as::<_, RecordRow>(&sql)
            .bind(task_id)
            .bind(build_number)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub(super) async fn record_by_id(&self, id: i64) -> Result<Option<RecordRow>> {
        let sql = format!("SELECT {} FROM records WHERE id = $1", RECORD_COLUMNS);
        let row = sqlx::query_as::<_, RecordRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub(super) async fn records_with_state(
        &self,
        task_id: i64,
        state: RecordState,
    ) -> Result<Vec<RecordRow>> {
        let sql = format!(
            "SELECT {} FROM records WHERE task_id = $1 AND state = $2 ORDER BY created_at, id",
            RECORD_COLUMNS
        );
        let rows = sqlx::query_as::<_, RecordRow>(&sql)
            .bind(task_id)
            .bind(state)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub(super) async fn requeue_deferred(&self, id: i64, build_number: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE records SET state = 0, build_number = $2, queued_at = NOW()
             WHERE id = $1 AND state = -2",
        )
        .bind(id)
        .bind(build_number)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// `release_build` re-keys the build number to `-id` in the same update.
    pub(super) async fn finish(
        &self,
        id: i64,
        result: &NewResult,
        release_build: bool,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let moved = sqlx::query(
            "UPDATE records
             SET state = $2, build_number = CASE WHEN $3 THEN -id ELSE build_number END
             WHERE id = $1 AND state = 0",
        )
        .bind(id)
        .bind(result.verdict.terminal_state())
        .bind(release_build)
        .execute(&mut *tx)
        .await?;
        if moved.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO results (record_id, console, status, tests, errors, failures, skip)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(id)
        .bind(&result.console)
        .bind(result.verdict.exit_status())
        .bind(counter_to_i32(result.counts.tests))
        .bind(counter_to_i32(result.counts.errors))
        .bind(counter_to_i32(result.counts.failures))
        .bind(counter_to_i32(result.counts.skip))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    pub(super) async fn result_by_record(&self, record_id: i64) -> Result<Option<ResultRow>> {
        let row = sqlx::query_as::<_, ResultRow>(
            "SELECT id, record_id, console, status, tests, errors, failures, skip, created_at
             FROM results WHERE record_id = $1",
        )
        .bind(record_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub(super) async fn page_of_records(
        &self,
        project_id: i64,
        task_id: Option<i64>,
        page: i64,
        per_page: i64,
    ) -> Result<RecordPage> {
        let (page, offset) = page_offset(page, per_page);

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM records
             WHERE project_id = $1 AND ($2::BIGINT IS NULL OR task_id = $2)",
        )
        .bind(project_id)
        .bind(task_id)
        .fetch_one(&self.pool)
        .await?;

        let sql = format!(
            "SELECT {} FROM records
             WHERE project_id = $1 AND ($2::BIGINT IS NULL OR task_id = $2)
             ORDER BY created_at DESC, id DESC
             LIMIT $3 OFFSET $4",
            RECORD_COLUMNS
        );
        let records = sqlx::query_as::<_, RecordRow>(&sql)
            .bind(project_id)
            .bind(task_id)
            .bind(per_page)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        Ok(RecordPage {
            records,
            page,
            per_page,
            total,
        })
    }

    pub(super) async fn trend_of_task(&self, task_id: i64) -> Result<Vec<TrendRow>> {
        let rows = sqlx::query_as::<_, TrendRow>(
            "SELECT r.id AS record_id, r.build_number, r.version,
                    s.tests, s.errors, s.failures, s.skip, r.created_at
             FROM records r
             JOIN results s ON s.record_id = r.id
             WHERE r.task_id = $1 AND s.tests > 0
             ORDER BY r.created_at, r.id",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub(super) async fn inflight_count(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM records WHERE state IN (-2, 0)")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }
}
