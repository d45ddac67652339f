//! # Polaris — Test Execution Orchestrator
//!
//! Drives test jobs on a Jenkins server on behalf of projects and tasks,
//! tracks every build as a record, and turns finished builds into results
//! with test counters and a notification mail.
//!
//! ## Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`model`] | Rows, record states, verdicts, test counters |
//! | [`store`] | Persistence trait plus the in-memory implementation |
//! | [`db`] | PostgreSQL implementation of [`store::Store`] |
//! | [`jenkins`] | Build client over the Jenkins REST API |
//! | [`inbox`] | Metrics inbox that test jobs report counters into |
//! | [`trigger`] | "Run test now": admit a record and start the build |
//! | [`reconcile`] | Periodic build-state reconciliation |
//! | [`notify`] | Result mails with chart and attachments |
//! | [`tasks`] | Task management backed by Jenkins jobs |
//! | [`schedule`] | Jenkins cron validation |
//! | [`config`] | Layered settings |
//! | [`prom_metrics`] | Prometheus exposition |
//! | [`dashboard`] | axum HTTP API and server bootstrap |

pub mod config;
pub mod dashboard;
pub mod db;
pub mod inbox;
pub mod jenkins;
pub mod model;
pub mod notify;
pub mod prom_metrics;
pub mod reconcile;
pub mod schedule;
pub mod store;
pub mod tasks;
pub mod trigger;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering from poisoning.
pub fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
