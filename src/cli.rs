//! One-shot subcommands. `serve` lives in [`polaris::dashboard::run`].

use anyhow::Result;
use tracing::info;

use polaris::config::Settings;
use polaris::dashboard::AppState;
use polaris::db::Database;
use polaris::trigger::{self, TriggerRequest};

pub async fn run_migrate(settings: &Settings) -> Result<()> {
    let database = Database::connect(settings.require_database_url()?).await?;
    database.migrate().await?;
    info!("schema applied");
    Ok(())
}

/// One reconciliation pass. Waits for result mails before exiting.
pub async fn run_tick(settings: &Settings) -> Result<()> {
    let database = Database::connect(settings.require_database_url()?).await?;
    let state = AppState::assemble(settings, database).await?;
    let summary = state.reconciler.tick().await;
    state.reconciler.flush_notifications().await;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

pub async fn run_trigger(settings: &Settings, req: TriggerRequest) -> Result<()> {
    let database = Database::connect(settings.require_database_url()?).await?;
    let state = AppState::assemble(settings, database).await?;
    let outcome = trigger::trigger(state.store.as_ref(), state.ci.as_ref(), &req).await?;
    println!("{}", serde_json::json!({ "state": outcome }));
    Ok(())
}
