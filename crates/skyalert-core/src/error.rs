//! Workspace-wide error type.

use thiserror::Error;

/// Convenience alias used across all SkyAlert crates.
pub type Result<T> = std::result::Result<T, SkyAlertError>;

#[derive(Error, Debug)]
pub enum SkyAlertError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Weather provider error: {0}")]
    Weather(String),

    #[error("Mail transport error: {0}")]
    Mail(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// Approving or rejecting a notification that is missing or already
    /// resolved. Callers must never treat this as a retryable condition.
    #[error("Notification not found or already resolved: {0}")]
    NotificationResolved(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
