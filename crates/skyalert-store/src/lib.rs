//! # SkyAlert Store
//!
//! Durable state for the alert pipeline:
//! - the sqlite mail-task queue and pending-notification table (single
//!   source of truth, atomic claim)
//! - the append-only JSON delivery log with backup-then-trim retention
//! - the legacy pending-email staging file (secondary queue source)
//! - the external-dependency health log

pub mod db;
pub mod delivery_log;
pub mod health;
pub mod staging;

pub use db::MailStore;
pub use delivery_log::DeliveryLog;
pub use health::HealthLog;
pub use staging::PendingStage;
