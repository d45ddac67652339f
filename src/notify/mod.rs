//! # Notify — Result Mails
//!
//! Best-effort mail sent after a record reaches its terminal state. The
//! reconciliation engine hands a [`Notification`] to [`Notifier::spawn`] and
//! moves on; nothing here can undo or delay the committed transition.
//!
//! ## Body template
//!
//! The task's own `email_body` wins, then the newest stored email template,
//! then [`DEFAULT_TEMPLATE`]. Placeholders:
//!
//! | Placeholder | Replaced with |
//! |-------------|---------------|
//! | `${tests}` | total tests |
//! | `${pass}` | tests minus errors, failures and skip |
//! | `${failures}`, `${errors}`, `${skip}` | the counters |
//! | `${analysis_pic}` | inline result chart |
//!
//! Counters are only rendered when the result has a non-zero `tests` count.
//! Otherwise they render as `-` and the chart placeholder is dropped.
//!
//! ## Attachments
//!
//! Each `;`-separated path on the task is fetched from the agent through an
//! [`AttachmentFetcher`]; a failed fetch skips that file. The console output
//! is always attached as `console.log` with CRLF line endings.

pub mod attachments;
pub mod chart;
pub mod mail;

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use crate::model::{ResultRow, ServerRow, TaskRow, TestCounts, Verdict};
use crate::prom_metrics::Metrics;
use crate::store::Store;

pub use attachments::{AttachmentFetcher, FetchedFile, WorkspaceFetcher};
pub use mail::{LogMailer, MailAttachment, MailTransport, OutgoingMail, SmtpMailer, CHART_CID};

pub const DEFAULT_TEMPLATE: &str = "<html><body>\
<p>Total: ${tests} &nbsp; Passed: ${pass} &nbsp; Failures: ${failures} &nbsp; \
Errors: ${errors} &nbsp; Skipped: ${skip}</p>\
<p>${analysis_pic}</p>\
<p>The console log is attached.</p>\
</body></html>";

/// Everything needed to notify about one completed record.
#[derive(Debug, Clone)]
pub struct Notification {
    pub task: TaskRow,
    pub server: ServerRow,
    pub verdict: Verdict,
    pub result: ResultRow,
}

pub fn subject(task_name: &str, verdict: Verdict) -> String {
    let word = match verdict {
        Verdict::Success => "succeeded",
        Verdict::Failure => "failed",
    };
    format!("{} test result: {}", task_name, word)
}

/// Substitute placeholders. `counts` is `None` when no metrics were reported.
pub fn render_body(template: &str, counts: Option<&TestCounts>) -> String {
    let (tests, pass, failures, errors, skip, pic) = match counts {
        Some(c) => (
            c.tests.to_string(),
            c.passed().to_string(),
            c.failures.to_string(),
            c.errors.to_string(),
            c.skip.to_string(),
            format!("<img src=\"cid:{}\" alt=\"test results\">", CHART_CID),
        ),
        None => {
            let dash = "-".to_string();
            (
                dash.clone(),
                dash.clone(),
                dash.clone(),
                dash.clone(),
                dash,
                String::new(),
            )
        }
    };
    template
        .replace("${analysis_pic}", &pic)
        .replace("${tests}", &tests)
        .replace("${pass}", &pass)
        .replace("${failures}", &failures)
        .replace("${errors}", &errors)
        .replace("${skip}", &skip)
}

/// Normalize line endings to CRLF for the mailed console log.
pub fn crlf(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\n', "\r\n")
}

pub struct Notifier {
    store: Arc<dyn Store>,
    mailer: Arc<dyn MailTransport>,
    fetcher: Arc<dyn AttachmentFetcher>,
    metrics: Option<Arc<Metrics>>,
}

impl Notifier {
    pub fn new(
        store: Arc<dyn Store>,
        mailer: Arc<dyn MailTransport>,
        fetcher: Arc<dyn AttachmentFetcher>,
    ) -> Self {
        Notifier {
            store,
            mailer,
            fetcher,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Send in the background. Failures are logged and counted, never returned.
    pub fn spawn(self: &Arc<Self>, notification: Notification) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let task = notification.task.name.clone();
            let record = notification.result.record_id;
            let sent = match this.send(&notification).await {
                Ok(()) => {
                    info!(task = %task, record, "notification sent");
                    true
                }
                Err(e) => {
                    warn!(task = %task, record, error = %e, "notification failed");
                    false
                }
            };
            if let Some(m) = &this.metrics {
                m.notification(sent);
            }
        })
    }

    pub async fn send(&self, notification: &Notification) -> Result<()> {
        let mail = self.compose(notification).await?;
        self.mailer.send(mail).await
    }

    pub async fn compose(&self, n: &Notification) -> Result<OutgoingMail> {
        let template = match n.task.email_body.as_deref().filter(|b| !b.trim().is_empty()) {
            Some(body) => body.to_string(),
            None => self
                .store
                .latest_email_template()
                .await?
                .unwrap_or_else(|| DEFAULT_TEMPLATE.to_string()),
        };

        let counts = n.result.counts();
        let counts = (counts.tests != 0).then_some(counts);
        let html_body = render_body(&template, counts.as_ref());
        let chart_png = match counts {
            Some(c) => match chart::render_png(&c) {
                Ok(png) => Some(png),
                Err(e) => {
                    warn!(task = %n.task.name, error = %e, "chart rendering failed");
                    None
                }
            },
            None => None,
        };

        let mut attachments = Vec::new();
        for path in n.task.attachment_paths() {
            match self.fetcher.fetch(&n.server, &path).await {
                Ok(file) => attachments.push(MailAttachment {
                    filename: file.filename,
                    content_type: "application/octet-stream".to_string(),
                    data: file.data,
                }),
                Err(e) => {
                    warn!(task = %n.task.name, path = %path, error = %e, "attachment skipped")
                }
            }
        }
        attachments.push(MailAttachment {
            filename: "console.log".to_string(),
            content_type: "text/plain; charset=utf-8".to_string(),
            data: crlf(&n.result.console).into_bytes(),
        });

        Ok(OutgoingMail {
            to: n.task.recipients(),
            subject: subject(&n.task.name, n.verdict),
            html_body,
            chart_png,
            attachments,
        })
    }
}
