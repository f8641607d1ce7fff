//! # SkyAlert Core
//!
//! Shared foundation for the SkyAlert workspace: the error type, the
//! configuration/snapshot loaders and the canonical data model used by the
//! scheduler, evaluator, queue and dispatcher crates.

pub mod config;
pub mod error;
pub mod types;

pub use config::{Paths, Settings, Snapshot};
pub use error::{Result, SkyAlertError};
pub use types::{
    AlertKind, AlertRule, Candidate, Customer, DeliveryLogEntry, DeliveryStatus, ForecastPoint,
    MailPayload, MailTask, Notification, NotificationStatus, RegionForecast, TargetRole,
    TaskStatus, Template,
};
