//! # SkyAlert Engine
//!
//! The alert pipeline: a drift-free polling scheduler triggers evaluation
//! cycles that match forecasts against subscriber rules, deduplicate
//! against the delivery log, and hand candidates to either the durable
//! mail queue (auto approval) or the pending-review set (manual approval).
//! The dispatcher drains the queue exactly-effectively-once.
//!
//! ## Control flow
//! ```text
//! Scheduler (wake at first-alert + n×interval)
//!   └── cycle
//!        ├── fetch forecasts (WeatherCache → provider)
//!        ├── RuleEvaluator → candidates
//!        ├── DedupFilter (7-day fingerprint, date-free)
//!        ├── ApprovalGate
//!        │     ├── auto   → MailTaskQueue → Dispatcher → SMTP
//!        │     └── manual → Notifications → approve/reject
//!        └── DeliveryLog (sent / recorded-duplicate)
//! ```

pub mod approval;
pub mod cycle;
pub mod dedup;
pub mod dispatcher;
pub mod scheduler;
pub mod service;

pub use cycle::{CycleReport, evaluate_candidates, process_candidates};
pub use dedup::{is_duplicate_within_three_days, is_duplicate_within_week};
pub use dispatcher::{DispatchReport, process_queue};
pub use scheduler::{Scheduler, next_wake};
pub use service::AlertService;
