//! # Jenkins — Build Client for the Remote CI Server
//!
//! Wraps the subset of the Jenkins REST API the platform consumes: job
//! configuration, build triggering, build status, console output and node
//! (agent) availability. All execution happens on Jenkins; this module only
//! talks to it.
//!
//! ## Endpoints
//!
//! | Operation | Request |
//! |-----------|---------|
//! | next build number, build list | `GET /job/{name}/api/json?tree=nextBuildNumber,builds[number]` |
//! | start build | `POST /job/{name}/build` |
//! | build result | `GET /job/{name}/{n}/api/json?tree=result,building` |
//! | console output | `GET /job/{name}/{n}/consoleText` |
//! | node status | `GET /computer/{node}/api/json?tree=offline` |
//! | job config | `GET`/`POST /job/{name}/config.xml` |
//! | create / delete job | `POST /createItem?name={name}`, `POST /job/{name}/doDelete` |
//!
//! ## Errors
//!
//! Every call resolves to a [`CiError`]. Callers distinguish
//! [`CiError::NotFound`] (job or node deleted out-of-band) from connectivity
//! problems, which are retried on the next tick or call.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

use crate::config::JenkinsSettings;

#[derive(Debug, Error)]
pub enum CiError {
    /// The job, build or node does not exist on the CI server.
    #[error("not found on CI server: {0}")]
    NotFound(String),

    /// The CI server could not be reached.
    #[error("CI server unreachable: {0}")]
    Unreachable(String),

    /// The CI server answered with an unexpected status.
    #[error("CI server returned {status} for {url}")]
    Status { status: u16, url: String },

    /// The response body could not be understood.
    #[error("malformed CI response: {0}")]
    Protocol(String),
}

impl CiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CiError::NotFound(_))
    }
}

pub type CiResult<T> = Result<T, CiError>;

/// Snapshot of a job's build history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobBuilds {
    pub next_build_number: i64,
    /// Known build numbers, oldest first.
    pub builds: Vec<i64>,
}

/// Operations the platform needs from the CI server.
#[async_trait]
pub trait BuildClient: Send + Sync {
    /// Number Jenkins will assign to the next build of `job`.
    async fn next_build_number(&self, job: &str) -> CiResult<i64>;

    /// Known builds of `job`, oldest first.
    async fn job_builds(&self, job: &str) -> CiResult<JobBuilds>;

    /// Queue a new build of `job`.
    async fn start_build(&self, job: &str) -> CiResult<()>;

    /// Terminal result string (`SUCCESS`, `FAILURE`, ...) or `None` while running.
    async fn build_result(&self, job: &str, build_number: i64) -> CiResult<Option<String>>;

    async fn console_output(&self, job: &str, build_number: i64) -> CiResult<String>;

    /// Whether the agent node named `node` is online.
    async fn node_online(&self, node: &str) -> CiResult<bool>;

    async fn create_job(&self, job: &str, config_xml: &str) -> CiResult<()>;

    async fn job_config(&self, job: &str) -> CiResult<String>;

    async fn reconfigure_job(&self, job: &str, config_xml: &str) -> CiResult<()>;

    async fn delete_job(&self, job: &str) -> CiResult<()>;
}

// ── HTTP implementation ─────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobInfo {
    next_build_number: i64,
    #[serde(default)]
    builds: Vec<BuildRef>,
}

#[derive(Deserialize)]
struct BuildRef {
    number: i64,
}

#[derive(Deserialize)]
struct BuildInfo {
    result: Option<String>,
    #[serde(default)]
    building: bool,
}

#[derive(Deserialize)]
struct NodeInfo {
    offline: bool,
}

/// Jenkins REST client authenticated with a user name and API token.
#[derive(Clone)]
pub struct JenkinsClient {
    base_url: String,
    username: String,
    api_token: String,
    http: reqwest::Client,
}

impl JenkinsClient {
    pub fn new(settings: &JenkinsSettings) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;
        Ok(JenkinsClient {
            base_url: settings.url.trim_end_matches('/').to_string(),
            username: settings.username.clone(),
            api_token: settings.api_token.clone(),
            http,
        })
    }

    fn job_url(&self, job: &str) -> String {
        format!("{}/job/{}", self.base_url, urlencoding::encode(job))
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.username.is_empty() {
            req
        } else {
            req.basic_auth(&self.username, Some(&self.api_token))
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder, what: &str) -> CiResult<reqwest::Response> {
        let resp = self
            .authed(req)
            .send()
            .await
            .map_err(|e| CiError::Unreachable(e.to_string()))?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(CiError::NotFound(what.to_string()));
        }
        if !status.is_success() {
            return Err(CiError::Status {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        Ok(resp)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str, what: &str) -> CiResult<T> {
        let resp = self.send(self.http.get(url), what).await?;
        resp.json::<T>()
            .await
            .map_err(|e| CiError::Protocol(e.to_string()))
    }

    async fn get_text(&self, url: &str, what: &str) -> CiResult<String> {
        let resp = self.send(self.http.get(url), what).await?;
        resp.text()
            .await
            .map_err(|e| CiError::Unreachable(e.to_string()))
    }

    async fn post_xml(&self, url: &str, xml: &str, what: &str) -> CiResult<()> {
        let req = self
            .http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/xml")
            .body(xml.to_string());
        self.send(req, what).await?;
        Ok(())
    }

    async fn job_info(&self, job: &str) -> CiResult<JobInfo> {
        let url = format!(
            "{}/api/json?tree=nextBuildNumber,builds[number]",
            self.job_url(job)
        );
        self.get_json(&url, &format!("job {}", job)).await
    }
}

#[async_trait]
impl BuildClient for JenkinsClient {
    async fn next_build_number(&self, job: &str) -> CiResult<i64> {
        Ok(self.job_info(job).await?.next_build_number)
    }

    async fn job_builds(&self, job: &str) -> CiResult<JobBuilds> {
        let info = self.job_info(job).await?;
        // Jenkins lists builds newest first.
        let mut builds: Vec<i64> = info.builds.iter().map(|b| b.number).collect();
        builds.sort_unstable();
        builds.dedup();
        Ok(JobBuilds {
            next_build_number: info.next_build_number,
            builds,
        })
    }

    async fn start_build(&self, job: &str) -> CiResult<()> {
        let url = format!("{}/build", self.job_url(job));
        self.send(self.http.post(&url), &format!("job {}", job))
            .await?;
        Ok(())
    }

    async fn build_result(&self, job: &str, build_number: i64) -> CiResult<Option<String>> {
        let url = format!(
            "{}/{}/api/json?tree=result,building",
            self.job_url(job),
            build_number
        );
        let info: BuildInfo = self
            .get_json(&url, &format!("build {}#{}", job, build_number))
            .await?;
        if info.building {
            return Ok(None);
        }
        Ok(info.result)
    }

    async fn console_output(&self, job: &str, build_number: i64) -> CiResult<String> {
        let url = format!("{}/{}/consoleText", self.job_url(job), build_number);
        self.get_text(&url, &format!("build {}#{}", job, build_number))
            .await
    }

    async fn node_online(&self, node: &str) -> CiResult<bool> {
        let url = format!(
            "{}/computer/{}/api/json?tree=offline",
            self.base_url,
            urlencoding::encode(node)
        );
        let info: NodeInfo = self.get_json(&url, &format!("node {}", node)).await?;
        Ok(!info.offline)
    }

    async fn create_job(&self, job: &str, config_xml: &str) -> CiResult<()> {
        let url = format!(
            "{}/createItem?name={}",
            self.base_url,
            urlencoding::encode(job)
        );
        self.post_xml(&url, config_xml, &format!("job {}", job))
            .await
    }

    async fn job_config(&self, job: &str) -> CiResult<String> {
        let url = format!("{}/config.xml", self.job_url(job));
        self.get_text(&url, &format!("job {}", job)).await
    }

    async fn reconfigure_job(&self, job: &str, config_xml: &str) -> CiResult<()> {
        let url = format!("{}/config.xml", self.job_url(job));
        self.post_xml(&url, config_xml, &format!("job {}", job))
            .await
    }

    async fn delete_job(&self, job: &str) -> CiResult<()> {
        let url = format!("{}/doDelete", self.job_url(job));
        self.send(self.http.post(&url), &format!("job {}", job))
            .await?;
        Ok(())
    }
}
