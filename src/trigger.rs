//! # Trigger — "Run Test Now"
//!
//! Allocates a build record for a task and starts the Jenkins build when the
//! project's agent is online. When the agent is offline the record is parked
//! as `deferred` and the reconciliation engine starts the build later.
//!
//! Every call ends in exactly one [`TriggerOutcome`] and persists at most one
//! record. CI failures before admission leave no trace in the store.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::jenkins::BuildClient;
use crate::model::{NewRecord, RecordState};
use crate::store::{Admission, Store};

#[derive(Debug, Clone, Deserialize)]
pub struct TriggerRequest {
    pub project_id: i64,
    pub task_id: i64,
    pub version: String,
    #[serde(default)]
    pub user_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerOutcome {
    /// Record queued and the build started.
    Success,
    /// The task already has a queued or deferred record.
    Busy,
    /// Agent offline; the record waits as deferred.
    Deferred,
    /// Jenkins could not be asked for the build number or node status.
    AgentError,
    /// Record queued but Jenkins refused to start the build.
    StartFailed,
    /// Jenkins' next build number already belongs to a finished record of
    /// this task, so the job history and the store disagree.
    Conflict,
}

impl TriggerOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerOutcome::Success => "success",
            TriggerOutcome::Busy => "busy",
            TriggerOutcome::Deferred => "deferred",
            TriggerOutcome::AgentError => "agent_error",
            TriggerOutcome::StartFailed => "start_failed",
            TriggerOutcome::Conflict => "conflict",
        }
    }
}

impl std::fmt::Display for TriggerOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub async fn trigger(
    store: &dyn Store,
    ci: &dyn BuildClient,
    req: &TriggerRequest,
) -> Result<TriggerOutcome> {
    let Some(task) = store.get_task(req.task_id).await? else {
        bail!("task {} not found", req.task_id);
    };
    if task.project_id != req.project_id {
        bail!(
            "task {} does not belong to project {}",
            req.task_id,
            req.project_id
        );
    }
    let Some(project) = store.get_project(task.project_id).await? else {
        bail!("project {} not found", task.project_id);
    };
    let Some(server) = store.get_server(project.server_id).await? else {
        bail!("server {} not found", project.server_id);
    };

    let build_number = match ci.next_build_number(&task.name).await {
        Ok(n) => n,
        Err(e) => {
            warn!(job = %task.name, error = %e, "next build number unavailable");
            return Ok(TriggerOutcome::AgentError);
        }
    };

    let online = match ci.node_online(&server.host).await {
        Ok(online) => online,
        Err(e) => {
            warn!(node = %server.host, error = %e, "agent status unavailable");
            return Ok(TriggerOutcome::AgentError);
        }
    };

    let state = if online {
        RecordState::Queued
    } else {
        RecordState::Deferred
    };
    let record = NewRecord {
        user_id: req.user_id,
        project_id: project.id,
        task_id: task.id,
        build_number,
        version: req.version.clone(),
        state,
    };
    let record = match store.admit_record(&record).await? {
        Admission::Admitted(r) => r,
        Admission::Busy => {
            info!(task = %task.name, "trigger rejected: task busy");
            return Ok(TriggerOutcome::Busy);
        }
        Admission::BuildTaken => {
            warn!(task = %task.name, build = build_number, "trigger rejected: build number already recorded");
            return Ok(TriggerOutcome::Conflict);
        }
    };

    if !online {
        info!(task = %task.name, record = record.id, node = %server.host, "agent offline, record deferred");
        return Ok(TriggerOutcome::Deferred);
    }

    if let Err(e) = ci.start_build(&task.name).await {
        warn!(task = %task.name, record = record.id, error = %e, "build start failed");
        return Ok(TriggerOutcome::StartFailed);
    }
    info!(task = %task.name, record = record.id, build = build_number, "build started");
    Ok(TriggerOutcome::Success)
}
