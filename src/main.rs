//! # Main — CLI Entry Point
//!
//! Routes subcommands to the API server, the reconciliation engine and the
//! trigger path. Settings come from an optional TOML file, overridden by
//! flags and environment variables (`.env` is loaded first).
//!
//! ## Subcommands
//!
//! - `serve`: HTTP API plus the background reconciliation loop.
//! - `tick`: one reconciliation pass, then exit.
//! - `trigger`: run a task once and print the outcome.
//! - `migrate`: apply the database schema.

mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use polaris::config::{Overrides, Settings};

#[derive(Parser)]
#[command(name = "polaris", about = "Orchestrate test jobs on Jenkins and track their results")]
struct Cli {
    /// TOML settings file
    #[arg(long, env = "POLARIS_CONFIG")]
    config: Option<PathBuf>,

    /// PostgreSQL connection URL (or set DATABASE_URL env var)
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Redis URL for the metrics inbox (in-process inbox when unset)
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Jenkins base URL
    #[arg(long, env = "JENKINS_URL")]
    jenkins_url: Option<String>,

    #[arg(long, env = "JENKINS_USER")]
    jenkins_user: Option<String>,

    #[arg(long, env = "JENKINS_TOKEN", hide_env_values = true)]
    jenkins_token: Option<String>,

    /// SMTP relay host for result mails
    #[arg(long, env = "SMTP_HOST")]
    smtp_host: Option<String>,

    #[arg(long, env = "SMTP_SENDER")]
    smtp_sender: Option<String>,

    #[arg(long, env = "SMTP_PASSWORD", hide_env_values = true)]
    smtp_password: Option<String>,

    /// Seconds between reconciliation ticks
    #[arg(long, env = "POLL_INTERVAL_SECS")]
    poll_interval_secs: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API and run the reconciliation loop
    Serve {
        #[arg(long, default_value_t = 7001)]
        port: u16,
    },
    /// Run one reconciliation tick and exit
    Tick,
    /// Trigger one test run of a task
    Trigger {
        #[arg(long)]
        project_id: i64,
        #[arg(long)]
        task_id: i64,
        /// Version label recorded with the run
        #[arg(long)]
        version: String,
        #[arg(long)]
        user_id: Option<i64>,
    },
    /// Apply the database schema
    Migrate,
}

impl Cli {
    fn settings(&self) -> Result<Settings> {
        let mut settings = Settings::load(self.config.as_deref())?;
        settings.apply(Overrides {
            database_url: self.database_url.clone(),
            redis_url: self.redis_url.clone(),
            jenkins_url: self.jenkins_url.clone(),
            jenkins_user: self.jenkins_user.clone(),
            jenkins_token: self.jenkins_token.clone(),
            smtp_host: self.smtp_host.clone(),
            smtp_sender: self.smtp_sender.clone(),
            smtp_password: self.smtp_password.clone(),
            poll_interval_secs: self.poll_interval_secs,
        });
        Ok(settings)
    }
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    // LOG_FORMAT=json for log shippers, human-readable otherwise
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }

    let cli = Cli::parse();
    let settings = cli.settings()?;
    let rt = tokio::runtime::Runtime::new()?;

    match &cli.command {
        Commands::Serve { port } => rt.block_on(polaris::dashboard::run(settings, *port)),
        Commands::Tick => rt.block_on(cli::run_tick(&settings)),
        Commands::Trigger {
            project_id,
            task_id,
            version,
            user_id,
        } => rt.block_on(cli::run_trigger(
            &settings,
            polaris::trigger::TriggerRequest {
                project_id: *project_id,
                task_id: *task_id,
                version: version.clone(),
                user_id: *user_id,
            },
        )),
        Commands::Migrate => rt.block_on(cli::run_migrate(&settings)),
    }
}
