//! # Model — Platform Entities and the Record State Machine
//!
//! Row types shared by every [`Store`](crate::store::Store) implementation,
//! plus the typed test counters that flow from the metrics inbox into a
//! build [`ResultRow`].
//!
//! ## Record lifecycle
//!
//! ```text
//! deferred (-2) ──agent online──> queued (0) ──CI result──> succeeded (1)
//!                                            └────────────> failed (-1)
//! ```
//!
//! Terminal records are never revisited. At most one record per task may be
//! `deferred` or `queued` at a time (admission control at trigger time).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Version label given to records backfilled from builds started outside the platform.
pub const BACKFILL_VERSION: &str = "9999";

/// Persisted state of a build record. Stored as a `SMALLINT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[repr(i16)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    Deferred = -2,
    Failed = -1,
    Queued = 0,
    Succeeded = 1,
}

impl RecordState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RecordState::Succeeded | RecordState::Failed)
    }

    /// `deferred` and `queued` records count against the one-in-flight rule.
    pub fn is_in_flight(self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecordState::Deferred => "deferred",
            RecordState::Failed => "failed",
            RecordState::Queued => "queued",
            RecordState::Succeeded => "succeeded",
        }
    }

    /// Whether `self -> next` is an allowed edge of the state machine.
    pub fn can_transition_to(self, next: RecordState) -> bool {
        matches!(
            (self, next),
            (RecordState::Deferred, RecordState::Queued)
                | (RecordState::Queued, RecordState::Succeeded)
                | (RecordState::Queued, RecordState::Failed)
        )
    }
}

impl std::fmt::Display for RecordState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a finished CI build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Success,
    Failure,
}

impl Verdict {
    /// Jenkins reports `SUCCESS`, `FAILURE`, `UNSTABLE`, `ABORTED`, `NOT_BUILT`;
    /// only `SUCCESS` counts as a pass.
    pub fn from_ci_result(result: &str) -> Self {
        if result == "SUCCESS" {
            Verdict::Success
        } else {
            Verdict::Failure
        }
    }

    pub fn exit_status(self) -> i16 {
        match self {
            Verdict::Success => 0,
            Verdict::Failure => -1,
        }
    }

    pub fn terminal_state(self) -> RecordState {
        match self {
            Verdict::Success => RecordState::Succeeded,
            Verdict::Failure => RecordState::Failed,
        }
    }
}

/// Test-outcome counters reported by a running job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCounts {
    pub tests: u32,
    pub errors: u32,
    pub failures: u32,
    pub skip: u32,
}

impl TestCounts {
    pub fn new(tests: u32, errors: u32, failures: u32, skip: u32) -> Self {
        TestCounts {
            tests,
            errors,
            failures,
            skip,
        }
    }

    /// Tests that neither errored, failed nor were skipped.
    pub fn passed(&self) -> u32 {
        self.tests
            .saturating_sub(self.errors)
            .saturating_sub(self.failures)
            .saturating_sub(self.skip)
    }

    pub fn is_empty(&self) -> bool {
        *self == TestCounts::default()
    }

    /// Accumulate another report into this one.
    pub fn merge(&mut self, other: &TestCounts) {
        self.tests = self.tests.saturating_add(other.tests);
        self.errors = self.errors.saturating_add(other.errors);
        self.failures = self.failures.saturating_add(other.failures);
        self.skip = self.skip.saturating_add(other.skip);
    }

    /// Pass rate in percent, rounded to two decimals. `None` when no tests ran.
    pub fn pass_rate(&self) -> Option<f64> {
        if self.tests == 0 {
            return None;
        }
        let rate = self.passed() as f64 / self.tests as f64 * 100.0;
        Some((rate * 100.0).round() / 100.0)
    }
}

// ── Catalog rows ────────────────────────────────────────────────

/// An execution agent. `host` doubles as the Jenkins node name.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ServerRow {
    pub id: i64,
    pub host: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub workspace: String,
    pub info: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ProjectRow {
    pub id: i64,
    pub server_id: i64,
    pub name: String,
    pub info: String,
}

/// A test task. `name` is the Jenkins job name, `{project}_{nickname}`.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TaskRow {
    pub id: i64,
    pub project_id: i64,
    pub nickname: String,
    pub name: String,
    pub info: String,
    pub command: String,
    pub result_statistics: String,
    pub crontab: Option<String>,
    pub scheduler_enable: bool,
    pub email_receivers: Option<String>,
    pub email_notification_enable: bool,
    pub email_body: Option<String>,
    pub email_attachments: Option<String>,
}

impl TaskRow {
    /// Notification recipients, split on ASCII and full-width commas.
    pub fn recipients(&self) -> Vec<String> {
        self.email_receivers
            .as_deref()
            .map(split_recipients)
            .unwrap_or_default()
    }

    /// Remote attachment paths, `;`-separated.
    pub fn attachment_paths(&self) -> Vec<String> {
        self.email_attachments
            .as_deref()
            .unwrap_or("")
            .split(';')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn wants_notification(&self) -> bool {
        self.email_notification_enable && !self.recipients().is_empty()
    }
}

/// Fields of a server registration.
#[derive(Debug, Clone, Deserialize)]
pub struct NewServer {
    pub host: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub workspace: String,
    #[serde(default)]
    pub info: String,
}

/// User-editable task fields, as submitted on create and update.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskDraft {
    pub nickname: String,
    #[serde(default)]
    pub info: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub result_statistics: String,
    #[serde(default)]
    pub crontab: Option<String>,
    #[serde(default)]
    pub scheduler_enable: bool,
    #[serde(default)]
    pub email_receivers: Option<String>,
    #[serde(default)]
    pub email_notification_enable: bool,
    #[serde(default)]
    pub email_body: Option<String>,
    #[serde(default)]
    pub email_attachments: Option<String>,
}

pub fn split_recipients(raw: &str) -> Vec<String> {
    raw.split([',', '，'])
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string)
        .collect()
}

/// Fully-qualified Jenkins job name for a task.
pub fn job_name(project_name: &str, nickname: &str) -> String {
    format!("{}_{}", project_name, nickname)
}

// ── Build records ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct RecordRow {
    pub id: i64,
    pub user_id: Option<i64>,
    pub project_id: i64,
    pub task_id: i64,
    pub build_number: i64,
    pub version: String,
    pub state: RecordState,
    pub created_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
}

impl RecordRow {
    /// When the record last entered `queued`, falling back to creation time.
    pub fn queued_since(&self) -> DateTime<Utc> {
        self.queued_at.unwrap_or(self.created_at)
    }
}

/// A record about to be inserted by the trigger path.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub user_id: Option<i64>,
    pub project_id: i64,
    pub task_id: i64,
    pub build_number: i64,
    pub version: String,
    pub state: RecordState,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ResultRow {
    pub id: i64,
    pub record_id: i64,
    pub console: String,
    pub status: i16,
    pub tests: i32,
    pub errors: i32,
    pub failures: i32,
    pub skip: i32,
    pub created_at: DateTime<Utc>,
}

impl ResultRow {
    pub fn counts(&self) -> TestCounts {
        let n = |v: i32| u32::try_from(v).unwrap_or(0);
        TestCounts::new(n(self.tests), n(self.errors), n(self.failures), n(self.skip))
    }
}

/// The terminal result written together with the record transition.
#[derive(Debug, Clone)]
pub struct NewResult {
    pub console: String,
    pub verdict: Verdict,
    pub counts: TestCounts,
}

/// Clamp a counter into a Postgres `INTEGER`.
pub(crate) fn counter_to_i32(v: u32) -> i32 {
    i32::try_from(v).unwrap_or(i32::MAX)
}

/// A completed record with reported metrics, for pass-rate trends.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TrendRow {
    pub record_id: i64,
    pub build_number: i64,
    pub version: String,
    pub tests: i32,
    pub errors: i32,
    pub failures: i32,
    pub skip: i32,
    pub created_at: DateTime<Utc>,
}

impl TrendRow {
    pub fn counts(&self) -> TestCounts {
        let n = |v: i32| u32::try_from(v).unwrap_or(0);
        TestCounts::new(n(self.tests), n(self.errors), n(self.failures), n(self.skip))
    }
}

/// One page of records, newest first.
#[derive(Debug, Clone, Serialize)]
pub struct RecordPage {
    pub records: Vec<RecordRow>,
    pub page: i64,
    pub per_page: i64,
    pub total: i64,
}
