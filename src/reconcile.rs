//! # Reconcile — Build-State Reconciliation Engine
//!
//! Jenkins has no push channel here, so completion is discovered by polling.
//! Each tick walks every task of every project and, under that task's lock:
//!
//! 1. Lists the job's builds, oldest first.
//! 2. Backfills a `queued` record for any build the store has never seen.
//! 3. Promotes `deferred` records whose build already exists on Jenkins.
//! 4. For each `queued` record whose build has a result: fetches the console,
//!    drains the metrics inbox, and commits result plus terminal state in one
//!    compare-and-set. Then hands the record to the notifier.
//! 5. Starts the build for `deferred` records once their agent is online.
//! 6. Fails `queued` records that never showed up on Jenkins within
//!    `stuck_after`, releasing their build number for the next trigger.
//!
//! Any error aborts the current task only; the next tick retries it.
//!
//! ## Inbox keying
//!
//! Metrics are keyed by task, not by build. Oldest-first processing makes the
//! earliest pending record consume stale reports, and drained counters go
//! back to the inbox when the completion loses its compare-and-set.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::inbox::MetricsInbox;
use crate::jenkins::BuildClient;
use crate::lock_or_recover;
use crate::model::{NewResult, ProjectRow, RecordRow, RecordState, ServerRow, TaskRow, Verdict};
use crate::notify::{Notification, Notifier};
use crate::prom_metrics::Metrics;
use crate::store::Store;

/// What one task's reconciliation changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskSummary {
    /// Builds found on Jenkins with no record.
    pub backfilled: u32,
    /// Deferred records whose build appeared on Jenkins.
    pub promoted: u32,
    /// Deferred records whose build this pass started.
    pub started: u32,
    pub completed: u32,
    /// Queued records failed by the stuck sweep.
    pub stuck: u32,
}

impl TaskSummary {
    fn add(&mut self, other: &TaskSummary) {
        self.backfilled += other.backfilled;
        self.promoted += other.promoted;
        self.started += other.started;
        self.completed += other.completed;
        self.stuck += other.stuck;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    /// Another tick was still running, so this one did nothing.
    pub skipped: bool,
    pub tasks: u32,
    pub failed_tasks: u32,
    pub changes: TaskSummary,
}

struct TickGuard<'a>(&'a AtomicBool);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

const STUCK_NOTE: &str = "Build was never observed on the CI server; marked failed by the stuck-record sweep.";

pub struct Reconciler {
    store: Arc<dyn Store>,
    ci: Arc<dyn BuildClient>,
    inbox: Arc<dyn MetricsInbox>,
    notifier: Option<Arc<Notifier>>,
    metrics: Option<Arc<Metrics>>,
    stuck_after: chrono::Duration,
    ticking: AtomicBool,
    task_locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
    outbox: Mutex<Vec<JoinHandle<()>>>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn Store>,
        ci: Arc<dyn BuildClient>,
        inbox: Arc<dyn MetricsInbox>,
    ) -> Self {
        Reconciler {
            store,
            ci,
            inbox,
            notifier: None,
            metrics: None,
            stuck_after: chrono::Duration::seconds(86_400),
            ticking: AtomicBool::new(false),
            task_locks: Mutex::new(HashMap::new()),
            outbox: Mutex::new(Vec::new()),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_stuck_after(mut self, stuck_after: chrono::Duration) -> Self {
        self.stuck_after = stuck_after;
        self
    }

    fn task_lock(&self, task_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(lock_or_recover(&self.task_locks).entry(task_id).or_default())
    }

    fn transitioned(&self, state: RecordState) {
        if let Some(m) = &self.metrics {
            m.record_transition(state);
        }
    }

    /// Wait for every notification spawned so far.
    pub async fn flush_notifications(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *lock_or_recover(&self.outbox));
        for h in handles {
            if let Err(e) = h.await {
                warn!(error = %e, "notification task panicked");
            }
        }
    }

    /// One pass over every task. Overlapping calls return immediately.
    pub async fn tick(&self) -> TickSummary {
        if self.ticking.swap(true, Ordering::AcqRel) {
            debug!("previous reconciliation tick still running, skipping");
            return TickSummary {
                skipped: true,
                ..Default::default()
            };
        }
        let _guard = TickGuard(&self.ticking);
        let mut summary = TickSummary::default();

        let projects = match self.store.list_projects().await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to list projects");
                return summary;
            }
        };

        for project in &projects {
            let server = match self.store.get_server(project.server_id).await {
                Ok(Some(s)) => s,
                Ok(None) => {
                    warn!(project = %project.name, server = project.server_id, "project has no server");
                    continue;
                }
                Err(e) => {
                    warn!(project = %project.name, error = %e, "failed to load server");
                    continue;
                }
            };
            let tasks = match self.store.list_tasks(project.id).await {
                Ok(t) => t,
                Err(e) => {
                    warn!(project = %project.name, error = %e, "failed to list tasks");
                    continue;
                }
            };
            for task in &tasks {
                summary.tasks += 1;
                match self.reconcile_locked(project, &server, task).await {
                    Ok(s) => summary.changes.add(&s),
                    Err(e) => {
                        summary.failed_tasks += 1;
                        warn!(task = %task.name, error = %e, "task reconciliation aborted");
                    }
                }
            }
        }

        if let Some(m) = &self.metrics {
            m.reconcile_ticks.inc();
            match self.store.count_inflight().await {
                Ok(n) => {
                    m.inflight_records.set(n);
                }
                Err(e) => warn!(error = %e, "failed to count in-flight records"),
            }
        }
        info!(
            tasks = summary.tasks,
            failed = summary.failed_tasks,
            completed = summary.changes.completed,
            backfilled = summary.changes.backfilled,
            "reconciliation tick finished"
        );
        summary
    }

    /// Reconcile a single task on demand. `None` if the task does not exist.
    pub async fn reconcile_task(&self, task_id: i64) -> Result<Option<TaskSummary>> {
        let Some(task) = self.store.get_task(task_id).await? else {
            return Ok(None);
        };
        let Some(project) = self.store.get_project(task.project_id).await? else {
            anyhow::bail!("project {} not found", task.project_id);
        };
        let Some(server) = self.store.get_server(project.server_id).await? else {
            anyhow::bail!("server {} not found", project.server_id);
        };
        self.reconcile_locked(&project, &server, &task)
            .await
            .map(Some)
    }

    async fn reconcile_locked(
        &self,
        project: &ProjectRow,
        server: &ServerRow,
        task: &TaskRow,
    ) -> Result<TaskSummary> {
        let lock = self.task_lock(task.id);
        let _held = lock.lock().await;
        self.reconcile(project, server, task).await
    }

    async fn reconcile(
        &self,
        project: &ProjectRow,
        server: &ServerRow,
        task: &TaskRow,
    ) -> Result<TaskSummary> {
        let mut summary = TaskSummary::default();
        let builds = self.ci.job_builds(&task.name).await?;

        for &number in &builds.builds {
            let mut record = match self.store.find_record(task.id, number).await? {
                Some(r) => r,
                None => {
                    let r = self
                        .store
                        .backfill_record(project.id, task.id, number)
                        .await?;
                    info!(task = %task.name, build = number, record = r.id, "backfilled record");
                    summary.backfilled += 1;
                    self.transitioned(RecordState::Queued);
                    r
                }
            };

            if record.state == RecordState::Deferred
                && self.store.promote_deferred(record.id, number).await?
            {
                info!(task = %task.name, build = number, record = record.id, "deferred record now queued");
                summary.promoted += 1;
                self.transitioned(RecordState::Queued);
                record.state = RecordState::Queued;
            }

            if record.state == RecordState::Queued
                && self.try_complete(project, server, task, &record).await?
            {
                summary.completed += 1;
            }
        }

        summary.started = self.activate_deferred(server, task, &builds.builds).await?;
        summary.stuck = self.sweep_stuck(task, &builds.builds).await?;
        Ok(summary)
    }

    /// Returns whether this call committed the terminal transition.
    async fn try_complete(
        &self,
        project: &ProjectRow,
        server: &ServerRow,
        task: &TaskRow,
        record: &RecordRow,
    ) -> Result<bool> {
        let Some(ci_result) = self.ci.build_result(&task.name, record.build_number).await? else {
            return Ok(false);
        };
        let console = self
            .ci
            .console_output(&task.name, record.build_number)
            .await?;
        let verdict = Verdict::from_ci_result(&ci_result);

        let drained = self.inbox.drain(&project.name, &task.nickname).await?;
        let result = NewResult {
            console,
            verdict,
            counts: drained.unwrap_or_default(),
        };

        let committed = match self.store.complete_record(record.id, &result).await {
            Ok(c) => c,
            Err(e) => {
                self.give_back(project, task, drained).await;
                return Err(e);
            }
        };
        if !committed {
            debug!(task = %task.name, record = record.id, "record already terminal");
            self.give_back(project, task, drained).await;
            return Ok(false);
        }

        let state = verdict.terminal_state();
        self.transitioned(state);
        info!(
            task = %task.name,
            build = record.build_number,
            record = record.id,
            state = %state,
            tests = result.counts.tests,
            "build completed"
        );

        self.notify(server, task, record.id, verdict).await;
        Ok(true)
    }

    async fn give_back(
        &self,
        project: &ProjectRow,
        task: &TaskRow,
        drained: Option<crate::model::TestCounts>,
    ) {
        if let Some(counts) = drained {
            if let Err(e) = self.inbox.restore(&project.name, &task.nickname, counts).await {
                warn!(task = %task.name, error = %e, "failed to restore drained metrics");
            }
        }
    }

    async fn notify(&self, server: &ServerRow, task: &TaskRow, record_id: i64, verdict: Verdict) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        if !task.wants_notification() {
            return;
        }
        let result = match self.store.result_for_record(record_id).await {
            Ok(Some(r)) => r,
            Ok(None) => return,
            Err(e) => {
                warn!(task = %task.name, record = record_id, error = %e, "cannot load result for notification");
                return;
            }
        };
        let handle = notifier.spawn(Notification {
            task: task.clone(),
            server: server.clone(),
            verdict,
            result,
        });
        let mut outbox = lock_or_recover(&self.outbox);
        outbox.retain(|h| !h.is_finished());
        outbox.push(handle);
    }

    /// Start builds for deferred records whose agent came back.
    async fn activate_deferred(
        &self,
        server: &ServerRow,
        task: &TaskRow,
        known_builds: &[i64],
    ) -> Result<u32> {
        let deferred: Vec<RecordRow> = self
            .store
            .records_in_state(task.id, RecordState::Deferred)
            .await?
            .into_iter()
            .filter(|r| !known_builds.contains(&r.build_number))
            .collect();
        if deferred.is_empty() {
            return Ok(0);
        }
        if !self.ci.node_online(&server.host).await? {
            debug!(task = %task.name, node = %server.host, "agent still offline");
            return Ok(0);
        }

        let mut started = 0;
        for record in deferred {
            let number = self.ci.next_build_number(&task.name).await?;
            if let Some(holder) = self.store.find_record(task.id, number).await? {
                if holder.id != record.id {
                    warn!(task = %task.name, record = record.id, build = number, holder = holder.id, "next build number already recorded, record stays deferred");
                    continue;
                }
            }
            match self.ci.start_build(&task.name).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    warn!(task = %task.name, record = record.id, "job missing, record stays deferred");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
            if self.store.promote_deferred(record.id, number).await? {
                info!(task = %task.name, record = record.id, build = number, "deferred build started");
                self.transitioned(RecordState::Queued);
                started += 1;
            }
        }
        Ok(started)
    }

    /// Fail queued records that never appeared on Jenkins.
    async fn sweep_stuck(&self, task: &TaskRow, known_builds: &[i64]) -> Result<u32> {
        let cutoff = Utc::now() - self.stuck_after;
        let queued = self
            .store
            .records_in_state(task.id, RecordState::Queued)
            .await?;
        let mut failed = 0;
        for record in queued {
            if known_builds.contains(&record.build_number) || record.queued_since() > cutoff {
                continue;
            }
            let result = NewResult {
                console: STUCK_NOTE.to_string(),
                verdict: Verdict::Failure,
                counts: Default::default(),
            };
            if self.store.abandon_record(record.id, &result).await? {
                warn!(task = %task.name, record = record.id, build = record.build_number, "stuck record failed, build number released");
                self.transitioned(RecordState::Failed);
                failed += 1;
            }
        }
        Ok(failed)
    }

    /// Tick every `interval` until the process exits. The first tick runs at once.
    pub async fn run_loop(self: Arc<Self>, interval: Duration) {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            timer.tick().await;
            self.tick().await;
        }
    }
}
