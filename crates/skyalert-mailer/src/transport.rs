//! Mail transport seam.
//!
//! The dispatcher and approval gate talk to [`MailTransport`]; production
//! wires in [`SmtpMailer`] (async lettre), tests substitute an in-memory
//! transport. Transport-level retry lives in [`send_with_retry`]: a fixed
//! number of attempts with a short fixed backoff, purely for transient
//! connection failures. It is distinct from queue-level state — a task's
//! status only changes after all transport attempts are exhausted.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use skyalert_core::config::Settings;
use skyalert_core::error::{Result, SkyAlertError};
use skyalert_store::health::HealthLog;

use crate::template::prepare_html;

const SMTP_TIMEOUT: Duration = Duration::from_secs(30);
pub const SMTP_MAX_RETRY: u32 = 3;
pub const SMTP_RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// One outbound send. `body` is plain text; implementations are expected
/// to deliver it as HTML (see [`prepare_html`]).
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(
        &self,
        to: &str,
        subject: &str,
        body: &str,
        attachments: &[String],
    ) -> Result<()>;
}

/// Retry a single send at the transport layer. Bounded attempts, fixed
/// backoff; the last error is surfaced once the budget is spent.
pub async fn send_with_retry(
    transport: &dyn MailTransport,
    to: &str,
    subject: &str,
    body: &str,
    attachments: &[String],
) -> Result<()> {
    let mut last_err = None;
    for attempt in 1..=SMTP_MAX_RETRY {
        match transport.send(to, subject, body, attachments).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::warn!("✗ Send to {to} failed (attempt {attempt}/{SMTP_MAX_RETRY}): {e}");
                last_err = Some(e);
                if attempt < SMTP_MAX_RETRY {
                    tokio::time::sleep(SMTP_RETRY_BACKOFF).await;
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| SkyAlertError::Mail(format!("send to {to} failed"))))
}

/// Stand-in used when the SMTP settings are incomplete. Every send fails
/// with a configuration error, so evaluation and staging still run and the
/// outcome stays visible in task status instead of aborting the cycle.
pub struct UnconfiguredTransport;

#[async_trait]
impl MailTransport for UnconfiguredTransport {
    async fn send(&self, to: &str, _s: &str, _b: &str, _a: &[String]) -> Result<()> {
        Err(SkyAlertError::Mail(format!(
            "mail server configuration incomplete, cannot send to {to}"
        )))
    }
}

/// SMTP delivery via lettre. Port picks the connection mode: 465 implicit
/// TLS, 587 STARTTLS, anything else plain (25-style relays).
pub struct SmtpMailer {
    sender: String,
    display_name: String,
    server: String,
    port: u16,
    username: String,
    password: String,
    attachments_dir: PathBuf,
    health: Option<HealthLog>,
}

impl SmtpMailer {
    pub fn from_settings(settings: &Settings, attachments_dir: impl Into<PathBuf>) -> Result<Self> {
        if settings.email_sender.is_empty() || settings.smtp_server.is_empty() {
            return Err(SkyAlertError::Mail(
                "mail server configuration incomplete".into(),
            ));
        }
        Ok(Self {
            sender: settings.email_sender.clone(),
            display_name: settings.email_name.clone(),
            server: settings.smtp_server.clone(),
            port: settings.smtp_port(),
            username: settings.smtp_username.clone(),
            password: settings.smtp_password.clone(),
            attachments_dir: attachments_dir.into(),
            health: None,
        })
    }

    /// Report send outcomes into the health log.
    pub fn with_health(mut self, health: HealthLog) -> Self {
        self.health = Some(health);
        self
    }

    fn build_message(
        &self,
        to: &str,
        subject: &str,
        body: &str,
        attachments: &[String],
    ) -> Result<Message> {
        let from: Mailbox = if self.display_name.is_empty() {
            self.sender.parse()
        } else {
            format!("{} <{}>", self.display_name, self.sender).parse()
        }
        .map_err(|e| SkyAlertError::Mail(format!("Invalid sender address: {e}")))?;
        let to: Mailbox = to
            .parse()
            .map_err(|e| SkyAlertError::Mail(format!("Invalid recipient address: {e}")))?;

        let builder = Message::builder().from(from).to(to).subject(subject);
        let html_part = SinglePart::html(prepare_html(body));

        if attachments.is_empty() {
            return builder
                .singlepart(html_part)
                .map_err(|e| SkyAlertError::Mail(format!("Build email: {e}")));
        }

        let mut multipart = MultiPart::mixed().singlepart(html_part);
        for name in attachments {
            let path = self.attachments_dir.join(name);
            match std::fs::read(&path) {
                Ok(bytes) => {
                    let content_type = ContentType::parse(guess_content_type(name))
                        .unwrap_or(ContentType::TEXT_PLAIN);
                    multipart =
                        multipart.singlepart(Attachment::new(name.clone()).body(bytes, content_type));
                }
                Err(e) => {
                    // A missing attachment degrades the email, it does not
                    // block the alert.
                    tracing::warn!("⚠️ Attachment {} unreadable, skipped: {e}", path.display());
                }
            }
        }
        builder
            .multipart(multipart)
            .map_err(|e| SkyAlertError::Mail(format!("Build email: {e}")))
    }

    fn build_transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>> {
        let mut builder = match self.port {
            465 => AsyncSmtpTransport::<Tokio1Executor>::relay(&self.server),
            587 => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.server),
            _ => Ok(AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(
                &self.server,
            )),
        }
        .map_err(|e| SkyAlertError::Mail(format!("SMTP relay: {e}")))?
        .port(self.port)
        .timeout(Some(SMTP_TIMEOUT));

        if !self.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                self.username.clone(),
                self.password.clone(),
            ));
        }
        Ok(builder.build())
    }
}

#[async_trait]
impl MailTransport for SmtpMailer {
    async fn send(
        &self,
        to: &str,
        subject: &str,
        body: &str,
        attachments: &[String],
    ) -> Result<()> {
        let message = self.build_message(to, subject, body, attachments)?;
        let mailer = self.build_transport()?;
        match mailer.send(message).await {
            Ok(_) => {
                tracing::info!("📤 Email sent to {to}");
                if let Some(health) = &self.health {
                    health.record("SMTP", true, &format!("sent to {to}")).ok();
                }
                Ok(())
            }
            Err(e) => {
                if let Some(health) = &self.health {
                    health
                        .record("SMTP", false, &format!("send to {to} failed: {e}"))
                        .ok();
                }
                Err(SkyAlertError::Mail(format!("SMTP send: {e}")))
            }
        }
    }
}

fn guess_content_type(name: &str) -> &'static str {
    match name.rsplit('.').next().map(str::to_ascii_lowercase).as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("pdf") => "application/pdf",
        Some("txt") => "text/plain",
        Some("html") => "text/html",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FlakyTransport {
        failures_left: Mutex<u32>,
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MailTransport for FlakyTransport {
        async fn send(&self, to: &str, _subject: &str, _body: &str, _a: &[String]) -> Result<()> {
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(SkyAlertError::Mail("connect timeout".into()));
            }
            self.sent.lock().unwrap().push(to.to_string());
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_recovers_from_transient_failures() {
        let transport = FlakyTransport {
            failures_left: Mutex::new(2),
            ..Default::default()
        };
        send_with_retry(&transport, "a@x.com", "s", "b", &[])
            .await
            .unwrap();
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_after_budget() {
        let transport = FlakyTransport {
            failures_left: Mutex::new(10),
            ..Default::default()
        };
        let err = send_with_retry(&transport, "a@x.com", "s", "b", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, SkyAlertError::Mail(_)));
        assert_eq!(*transport.failures_left.lock().unwrap(), 10 - SMTP_MAX_RETRY);
    }

    #[test]
    fn smtp_mailer_rejects_incomplete_config() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert!(SmtpMailer::from_settings(&settings, "/tmp").is_err());
    }

    #[test]
    fn smtp_mailer_builds_from_full_config() {
        let settings: Settings = serde_json::from_str(
            r#"{"emailSender": "alerts@x.com", "emailName": "预警系统",
                "smtpServer": "smtp.x.com", "smtpPort": 465,
                "smtpUsername": "u", "smtpPassword": "p"}"#,
        )
        .unwrap();
        let mailer = SmtpMailer::from_settings(&settings, "/tmp").unwrap();
        assert_eq!(mailer.port, 465);
        let msg = mailer.build_message("to@x.com", "主题", "正文\n第二行", &[]);
        assert!(msg.is_ok());
    }

    #[test]
    fn content_type_guesses() {
        assert_eq!(guess_content_type("map.PNG"), "image/png");
        assert_eq!(guess_content_type("doc.pdf"), "application/pdf");
        assert_eq!(guess_content_type("weird.bin"), "application/octet-stream");
    }
}
