//! # Tasks — Task Management Backed by Jenkins Jobs
//!
//! Every task owns one Jenkins freestyle job named `{project}_{nickname}`.
//! Creating or editing a task regenerates the job's `config.xml`:
//!
//! - `description` from the task info
//! - `assignedNode` pinned to the project's agent host
//! - a shell builder running the task command
//! - a PostBuildScript step running the result-statistics command on both
//!   `SUCCESS` and `FAILURE`, which is how the job reports its counters
//! - a `TimerTrigger` when scheduling is enabled and the cron spec is valid
//!
//! A missing or invalid schedule does not block the rest of the edit: the job
//! is written without a trigger, `scheduler_enable` is stored as `false`, and
//! the outcome says why.

use anyhow::{bail, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::jenkins::BuildClient;
use crate::model::{job_name, TaskDraft, TaskRow};
use crate::schedule;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEditOutcome {
    /// The change was committed in Jenkins and the store.
    Saved,
    /// Scheduling was enabled without a cron spec; saved with scheduling off.
    ScheduleMissing,
    /// The cron spec did not parse; saved with scheduling off.
    ScheduleInvalid,
    /// The Jenkins job no longer exists.
    JobMissing,
    /// Jenkins could not be reached or refused the change. Nothing was stored.
    AgentError,
    /// A task with the same job name already exists. Jenkins was not touched.
    Duplicate,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskEdit {
    pub outcome: TaskEditOutcome,
    pub task: Option<TaskRow>,
}

enum ScheduleCheck {
    Off,
    On(String),
    Missing,
    Invalid,
}

fn check_schedule(draft: &TaskDraft) -> ScheduleCheck {
    if !draft.scheduler_enable {
        return ScheduleCheck::Off;
    }
    let spec = draft.crontab.as_deref().map(str::trim).unwrap_or("");
    if spec.is_empty() {
        return ScheduleCheck::Missing;
    }
    match schedule::validate(spec) {
        Ok(()) => ScheduleCheck::On(spec.to_string()),
        Err(e) => {
            warn!(spec = %spec, error = %e, "rejecting cron spec");
            ScheduleCheck::Invalid
        }
    }
}

/// Reject nicknames that would produce an awkward Jenkins job name.
pub fn check_nickname(nickname: &str) -> Option<&'static str> {
    if nickname.trim().is_empty() {
        return Some("nickname must not be empty");
    }
    if nickname
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '/' | '\\' | '?' | '#' | '%' | '&'))
    {
        return Some("nickname must not contain whitespace or URL metacharacters");
    }
    None
}

fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            '\r' => {}
            c => out.push(c),
        }
    }
    out
}

/// Freestyle-project `config.xml` for a task.
pub fn job_config_xml(draft: &TaskDraft, node: &str, schedule: Option<&str>) -> String {
    let triggers = match schedule {
        Some(spec) => format!(
            "<triggers><hudson.triggers.TimerTrigger><spec>{}</spec></hudson.triggers.TimerTrigger></triggers>",
            xml_escape(spec)
        ),
        None => "<triggers/>".to_string(),
    };
    format!(
        "<?xml version='1.1' encoding='UTF-8'?>\
<project>\
<actions/>\
<description>{description}</description>\
<keepDependencies>false</keepDependencies>\
<properties/>\
<scm class=\"hudson.scm.NullSCM\"/>\
<assignedNode>{node}</assignedNode>\
<canRoam>false</canRoam>\
<disabled>false</disabled>\
<blockBuildWhenDownstreamBuilding>false</blockBuildWhenDownstreamBuilding>\
<blockBuildWhenUpstreamBuilding>false</blockBuildWhenUpstreamBuilding>\
{triggers}\
<concurrentBuild>false</concurrentBuild>\
<builders><hudson.tasks.Shell><command>{command}</command></hudson.tasks.Shell></builders>\
<publishers>\
<org.jenkinsci.plugins.postbuildscript.PostBuildScript plugin=\"postbuildscript@2.7.0\">\
<config>\
<scriptFiles/>\
<groovyScripts/>\
<buildSteps>\
<org.jenkinsci.plugins.postbuildscript.model.PostBuildStep>\
<results><string>FAILURE</string><string>SUCCESS</string></results>\
<role>BOTH</role>\
<buildSteps><hudson.tasks.Shell><command>{statistics}</command></hudson.tasks.Shell></buildSteps>\
</org.jenkinsci.plugins.postbuildscript.model.PostBuildStep>\
</buildSteps>\
<markBuildUnstable>false</markBuildUnstable>\
</config>\
</org.jenkinsci.plugins.postbuildscript.PostBuildScript>\
</publishers>\
<buildWrappers/>\
</project>",
        description = xml_escape(&draft.info),
        node = xml_escape(node),
        command = xml_escape(&draft.command),
        statistics = xml_escape(&draft.result_statistics),
    )
}

/// Apply the schedule check to the draft that gets stored.
fn effective(draft: &TaskDraft) -> (TaskDraft, Option<String>, TaskEditOutcome) {
    let mut stored = draft.clone();
    match check_schedule(draft) {
        ScheduleCheck::Off => (stored, None, TaskEditOutcome::Saved),
        ScheduleCheck::On(spec) => (stored, Some(spec), TaskEditOutcome::Saved),
        ScheduleCheck::Missing => {
            stored.scheduler_enable = false;
            (stored, None, TaskEditOutcome::ScheduleMissing)
        }
        ScheduleCheck::Invalid => {
            stored.scheduler_enable = false;
            (stored, None, TaskEditOutcome::ScheduleInvalid)
        }
    }
}

async fn agent_host(store: &dyn Store, project_id: i64) -> Result<(String, String)> {
    let Some(project) = store.get_project(project_id).await? else {
        bail!("project {} not found", project_id);
    };
    let Some(server) = store.get_server(project.server_id).await? else {
        bail!("server {} not found", project.server_id);
    };
    Ok((project.name, server.host))
}

pub async fn create_task(
    store: &dyn Store,
    ci: &dyn BuildClient,
    project_id: i64,
    draft: &TaskDraft,
) -> Result<TaskEdit> {
    let (project_name, host) = agent_host(store, project_id).await?;
    let name = job_name(&project_name, &draft.nickname);
    if let Some(existing) = store.find_task(&name).await? {
        info!(job = %name, id = existing.id, "task already exists");
        return Ok(TaskEdit {
            outcome: TaskEditOutcome::Duplicate,
            task: None,
        });
    }
    let (stored, spec, outcome) = effective(draft);

    match ci.delete_job(&name).await {
        Ok(()) => warn!(job = %name, "stale Jenkins job replaced"),
        Err(e) if e.is_not_found() => {}
        Err(e) => {
            warn!(job = %name, error = %e, "could not clear stale job");
            return Ok(TaskEdit {
                outcome: TaskEditOutcome::AgentError,
                task: None,
            });
        }
    }

    let xml = job_config_xml(&stored, &host, spec.as_deref());
    if let Err(e) = ci.create_job(&name, &xml).await {
        warn!(job = %name, error = %e, "job creation failed");
        return Ok(TaskEdit {
            outcome: TaskEditOutcome::AgentError,
            task: None,
        });
    }

    let task = store.insert_task(project_id, &name, &stored).await?;
    info!(task = %task.name, id = task.id, outcome = ?outcome, "task created");
    Ok(TaskEdit {
        outcome,
        task: Some(task),
    })
}

/// Returns `None` if the task does not exist.
pub async fn update_task(
    store: &dyn Store,
    ci: &dyn BuildClient,
    task_id: i64,
    draft: &TaskDraft,
) -> Result<Option<TaskEdit>> {
    let Some(current) = store.get_task(task_id).await? else {
        return Ok(None);
    };
    let (_, host) = agent_host(store, current.project_id).await?;
    let (stored, spec, outcome) = effective(draft);

    let xml = job_config_xml(&stored, &host, spec.as_deref());
    if let Err(e) = ci.reconfigure_job(&current.name, &xml).await {
        let outcome = if e.is_not_found() {
            TaskEditOutcome::JobMissing
        } else {
            TaskEditOutcome::AgentError
        };
        warn!(job = %current.name, error = %e, "job reconfiguration failed");
        return Ok(Some(TaskEdit {
            outcome,
            task: Some(current),
        }));
    }

    let task = store.update_task(task_id, &stored).await?;
    info!(task = %current.name, id = task_id, outcome = ?outcome, "task updated");
    Ok(Some(TaskEdit { outcome, task }))
}

/// Returns `None` if the task does not exist.
pub async fn delete_task(
    store: &dyn Store,
    ci: &dyn BuildClient,
    task_id: i64,
) -> Result<Option<TaskEditOutcome>> {
    let Some(task) = store.get_task(task_id).await? else {
        return Ok(None);
    };
    match ci.delete_job(&task.name).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => {
            warn!(job = %task.name, error = %e, "job deletion failed");
            return Ok(Some(TaskEditOutcome::AgentError));
        }
    }
    store.delete_task(task_id).await?;
    info!(task = %task.name, id = task_id, "task deleted");
    Ok(Some(TaskEditOutcome::Saved))
}
