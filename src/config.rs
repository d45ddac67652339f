//! # Config — Service Settings
//!
//! Settings come from an optional TOML file, then CLI flags and environment
//! variables override individual values (see `main.rs`). Every section has
//! working defaults so a bare `DATABASE_URL` is enough to start.
//!
//! ```toml
//! database_url = "postgres://polaris@localhost/polaris"
//! redis_url = "redis://127.0.0.1/"
//! records_per_page = 20
//!
//! [jenkins]
//! url = "http://jenkins.internal:8080"
//! username = "polaris"
//! api_token = "..."
//!
//! [mail]
//! host = "smtp.example.com"
//! sender = "ci@example.com"
//! password = "..."
//!
//! [engine]
//! poll_interval_secs = 300
//! stuck_after_secs = 86400
//!
//! [attachments]
//! root = "/mnt/agents"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database_url: Option<String>,
    /// Metrics inbox backend. Without it an in-process inbox is used.
    pub redis_url: Option<String>,
    pub records_per_page: i64,
    pub jenkins: JenkinsSettings,
    pub mail: MailSettings,
    pub engine: EngineSettings,
    pub attachments: AttachmentSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            database_url: None,
            redis_url: None,
            records_per_page: 20,
            jenkins: JenkinsSettings::default(),
            mail: MailSettings::default(),
            engine: EngineSettings::default(),
            attachments: AttachmentSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JenkinsSettings {
    pub url: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub api_token: String,
    pub timeout_secs: u64,
}

impl Default for JenkinsSettings {
    fn default() -> Self {
        JenkinsSettings {
            url: "http://127.0.0.1:8080".to_string(),
            username: String::new(),
            api_token: String::new(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MailSettings {
    /// SMTP relay host. Empty disables delivery.
    pub host: String,
    pub port: u16,
    pub sender: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub display_name: String,
}

impl Default for MailSettings {
    fn default() -> Self {
        MailSettings {
            host: String::new(),
            port: 465,
            sender: String::new(),
            password: String::new(),
            display_name: "Polaris CI".to_string(),
        }
    }
}

impl MailSettings {
    pub fn is_configured(&self) -> bool {
        !self.host.is_empty() && !self.sender.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub poll_interval_secs: u64,
    /// Queued records never seen on the CI server are failed after this long.
    pub stuck_after_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            poll_interval_secs: 300,
            stuck_after_secs: 86_400,
        }
    }
}

impl EngineSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn stuck_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.stuck_after_secs).unwrap_or(i64::MAX / 1000))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachmentSettings {
    /// Where agent workspaces are mounted, one directory per server host.
    pub root: PathBuf,
}

impl Default for AttachmentSettings {
    fn default() -> Self {
        AttachmentSettings {
            root: PathBuf::from("/mnt/agents"),
        }
    }
}

impl Settings {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(content)?;
        Ok(settings)
    }

    /// Load from `path` if given, otherwise start from defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)
                    .with_context(|| format!("reading config file {}", p.display()))?;
                Self::from_toml_str(&content)
                    .with_context(|| format!("parsing config file {}", p.display()))
            }
            None => Ok(Settings::default()),
        }
    }

    /// Apply CLI/env overrides on top of file values.
    pub fn apply(&mut self, o: Overrides) {
        if o.database_url.is_some() {
            self.database_url = o.database_url;
        }
        if o.redis_url.is_some() {
            self.redis_url = o.redis_url;
        }
        if let Some(v) = o.jenkins_url {
            self.jenkins.url = v;
        }
        if let Some(v) = o.jenkins_user {
            self.jenkins.username = v;
        }
        if let Some(v) = o.jenkins_token {
            self.jenkins.api_token = v;
        }
        if let Some(v) = o.smtp_host {
            self.mail.host = v;
        }
        if let Some(v) = o.smtp_sender {
            self.mail.sender = v;
        }
        if let Some(v) = o.smtp_password {
            self.mail.password = v;
        }
        if let Some(v) = o.poll_interval_secs {
            self.engine.poll_interval_secs = v;
        }
    }

    pub fn require_database_url(&self) -> Result<&str> {
        self.database_url.as_deref().ok_or_else(|| {
            anyhow::anyhow!("DATABASE_URL is required (set via --database-url, env or config file)")
        })
    }
}

/// Values supplied on the command line or through the environment.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub jenkins_url: Option<String>,
    pub jenkins_user: Option<String>,
    pub jenkins_token: Option<String>,
    pub smtp_host: Option<String>,
    pub smtp_sender: Option<String>,
    pub smtp_password: Option<String>,
    pub poll_interval_secs: Option<u64>,
}
