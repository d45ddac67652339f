//! Mail delivery.
//!
//! [`SmtpMailer`] relays over implicit TLS with the sender's credentials.
//! [`LogMailer`] stands in when no SMTP host is configured and only logs.

use anyhow::Result;
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::info;

use crate::config::MailSettings;

/// Content-ID of the inline result chart; templates reference it as `cid:analysis`.
pub const CHART_CID: &str = "analysis";

#[derive(Debug, Clone)]
pub struct MailAttachment {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct OutgoingMail {
    pub to: Vec<String>,
    pub subject: String,
    pub html_body: String,
    /// PNG chart embedded inline under [`CHART_CID`].
    pub chart_png: Option<Vec<u8>>,
    pub attachments: Vec<MailAttachment>,
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, mail: OutgoingMail) -> Result<()>;
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(settings: &MailSettings) -> Result<Self> {
        let credentials = Credentials::new(settings.sender.clone(), settings.password.clone());
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&settings.host)?
            .port(settings.port)
            .credentials(credentials)
            .build();
        let from = Mailbox::new(
            Some(settings.display_name.clone()),
            settings.sender.parse()?,
        );
        Ok(SmtpMailer { transport, from })
    }

    fn build_message(&self, mail: OutgoingMail) -> Result<Message> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(mail.subject);
        for to in &mail.to {
            builder = builder.to(to.parse::<Mailbox>()?);
        }

        let html = SinglePart::html(mail.html_body);
        let body = match mail.chart_png {
            Some(png) => MultiPart::related().singlepart(html).singlepart(
                Attachment::new_inline(CHART_CID.to_string())
                    .body(png, ContentType::parse("image/png")?),
            ),
            None => MultiPart::related().singlepart(html),
        };

        let mut mixed = MultiPart::mixed().multipart(body);
        for a in mail.attachments {
            let content_type = ContentType::parse(&a.content_type)?;
            mixed = mixed.singlepart(Attachment::new(a.filename).body(a.data, content_type));
        }
        Ok(builder.multipart(mixed)?)
    }
}

#[async_trait]
impl MailTransport for SmtpMailer {
    async fn send(&self, mail: OutgoingMail) -> Result<()> {
        let message = self.build_message(mail)?;
        self.transport.send(message).await?;
        Ok(())
    }
}

/// Transport used when mail is not configured.
pub struct LogMailer;

#[async_trait]
impl MailTransport for LogMailer {
    async fn send(&self, mail: OutgoingMail) -> Result<()> {
        info!(
            to = %mail.to.join(", "),
            subject = %mail.subject,
            attachments = mail.attachments.len(),
            "mail not configured, notification dropped"
        );
        Ok(())
    }
}
