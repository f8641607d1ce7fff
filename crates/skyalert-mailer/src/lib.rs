//! # SkyAlert Mailer
//!
//! Turns matched candidates into complete emails (template selection,
//! `{{field}}` substitution, HTML conversion) and delivers them over SMTP
//! behind the [`MailTransport`] seam, with bounded transport-level retry.

pub mod template;
pub mod transport;

pub use template::{build_payload, default_body, default_subject, prepare_html, render, select_template};
pub use transport::{
    MailTransport, SMTP_MAX_RETRY, SMTP_RETRY_BACKOFF, SmtpMailer, UnconfiguredTransport,
    send_with_retry,
};
