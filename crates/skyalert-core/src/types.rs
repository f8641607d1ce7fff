//! Canonical data model.
//!
//! Every record that crosses a boundary (queue payloads, delivery-log
//! entries, notifications) has exactly one struct here; raw collaborator
//! JSON is converted into these at load time and nowhere else.

use chrono::{Local, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::config::de_opt_u32;

/// Timestamp format shared by the delivery log and task rows.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

// ─── Subscribers ──────────────────────────────────────────

/// One alert recipient, as managed by the external personnel tooling.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Customer {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub phone: String,
    /// Recipient category: 客户 (customer) or 工程师 (engineer).
    #[serde(default)]
    pub category: String,
    /// Weather types this recipient subscribes to.
    #[serde(rename = "weatherTypes", default)]
    pub weather_types: Vec<String>,
}

impl Customer {
    pub fn is_engineer(&self) -> bool {
        self.category == "工程师"
    }
}

// ─── Alert rules ──────────────────────────────────────────

/// How a rule's condition string is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    /// Numeric comparison against a forecast metric.
    #[default]
    Parameter,
    /// Keyword containment against the day/night weather text.
    Keyword,
    /// Same matching as keyword; kept distinct because the rule tooling
    /// distinguishes them.
    Text,
}

/// One alert rule. Immutable during a cycle; mutated only by the external
/// rule-management collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertRule {
    #[serde(default)]
    pub id: i64,
    #[serde(rename = "type", default)]
    pub weather_type: String,
    #[serde(default)]
    pub condition: String,
    #[serde(rename = "alertType", default)]
    pub kind: AlertKind,
    /// Per-rule advance days; `None` falls back to the global setting.
    #[serde(rename = "advanceTime", default, deserialize_with = "de_opt_u32")]
    pub advance_days: Option<u32>,
    #[serde(default)]
    pub status: String,
}

impl AlertRule {
    pub fn is_active(&self) -> bool {
        matches!(self.status.as_str(), "活跃" | "active")
    }
}

// ─── Templates ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetRole {
    #[default]
    All,
    Customer,
    Engineer,
}

/// Mail template managed by the external template tooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    #[serde(default)]
    pub id: i64,
    #[serde(rename = "type", default)]
    pub weather_type: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "targetRole", default)]
    pub target_role: TargetRole,
    /// Attachment file names; older exports store these as a JSON-encoded
    /// string, sometimes the literal "null".
    #[serde(default, deserialize_with = "de_attachments")]
    pub attachments: Vec<String>,
    #[serde(rename = "isActive", default = "bool_true")]
    pub is_active: bool,
}

impl Default for Template {
    fn default() -> Self {
        Self {
            id: 0,
            weather_type: String::new(),
            subject: String::new(),
            content: String::new(),
            target_role: TargetRole::All,
            attachments: Vec::new(),
            is_active: true,
        }
    }
}

fn bool_true() -> bool {
    true
}

fn de_attachments<'de, D>(d: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(d)?;
    Ok(match value {
        Some(serde_json::Value::Array(items)) => items
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Some(serde_json::Value::String(s)) => {
            if s.trim().is_empty() || s.eq_ignore_ascii_case("null") {
                Vec::new()
            } else {
                serde_json::from_str::<Vec<String>>(&s).unwrap_or_default()
            }
        }
        _ => Vec::new(),
    })
}

// ─── Forecasts ────────────────────────────────────────────

/// A single day of forecast data for one region, already coerced to typed
/// values. Metrics the provider omitted (or sent unparseable) are `None`
/// and simply never match a condition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub date: NaiveDate,
    #[serde(default)]
    pub temp_max: Option<f64>,
    #[serde(default)]
    pub temp_min: Option<f64>,
    #[serde(default)]
    pub wind_speed: Option<f64>,
    #[serde(default)]
    pub precip: Option<f64>,
    #[serde(default)]
    pub visibility: Option<f64>,
    #[serde(default)]
    pub text_day: String,
    #[serde(default)]
    pub text_night: String,
    #[serde(default)]
    pub wind_dir: String,
}

/// The forecast series for one region, ordered by date.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionForecast {
    pub region: String,
    pub update_time: String,
    pub forecasts: Vec<ForecastPoint>,
}

// ─── Candidates & payloads ────────────────────────────────

/// A matched, not-yet-deduplicated notification produced by one cycle.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub customer: Customer,
    pub region: String,
    pub weather_type: String,
    pub condition: String,
    pub forecast_date: NaiveDate,
}

/// A fully rendered outbound email, serialized into queue tasks, staging
/// records and notification rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MailPayload {
    pub to_email: String,
    #[serde(default)]
    pub to_name: String,
    pub subject: String,
    pub content: String,
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub weather_type: String,
    #[serde(default)]
    pub alert_date: String,
    #[serde(default)]
    pub condition: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default)]
    pub is_test: bool,
}

// ─── Mail tasks ───────────────────────────────────────────

/// Queue task lifecycle: pending → processing → {sent, failed}.
/// No edge returns to pending automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Processing,
    Sent,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Sent => "sent",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "processing" => TaskStatus::Processing,
            "sent" => TaskStatus::Sent,
            "failed" => TaskStatus::Failed,
            _ => TaskStatus::Pending,
        }
    }
}

/// A durable mail task claimed and driven by the dispatcher.
#[derive(Debug, Clone)]
pub struct MailTask {
    pub id: i64,
    pub task_id: String,
    pub status: TaskStatus,
    pub payload: String,
    pub is_test: bool,
    pub attempts: u32,
    pub error: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Unique task id: timestamp down to microseconds plus a random suffix, so
/// several tasks for the same address in the same instant stay distinct.
pub fn new_task_id(to_email: &str) -> String {
    let ts = Local::now().format("%Y%m%d%H%M%S%6f");
    format!("task_{ts}_{to_email}_{}", rand::random::<u16>() % 9000 + 1000)
}

/// Unique notification id for the manual-approval path.
pub fn new_notification_id(to_email: &str) -> String {
    let ts = Local::now().format("%Y%m%d%H%M%S%6f");
    format!("alert_{ts}_{}_{to_email}", rand::random::<u16>() % 9000 + 1000)
}

// ─── Notifications (manual approval) ──────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Pending,
    Approved,
    Rejected,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "pending",
            NotificationStatus::Approved => "approved",
            NotificationStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "approved" => NotificationStatus::Approved,
            "rejected" => NotificationStatus::Rejected,
            _ => NotificationStatus::Pending,
        }
    }
}

/// A candidate staged for human review. Terminal once approved/rejected.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub id: i64,
    pub notification_id: String,
    pub recipient: String,
    pub title: String,
    pub content: String,
    /// Serialized [`MailPayload`].
    pub payload: String,
    pub status: NotificationStatus,
    pub is_test: bool,
    pub created_at: NaiveDateTime,
}

// ─── Delivery log ─────────────────────────────────────────

/// Outcome recorded in the append-only delivery log.
///
/// The dedup filter counts `Sent` and `RecordedDuplicate`; anything else is
/// carried through verbatim but never blocks a send. Parsing is
/// prefix-tolerant because historical logs suffixed extra detail onto the
/// status text (including the Chinese-language statuses of old versions).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStatus {
    Sent,
    RecordedDuplicate,
    Other(String),
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &str {
        match self {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::RecordedDuplicate => "recorded-duplicate",
            DeliveryStatus::Other(s) => s,
        }
    }

    pub fn parse(s: &str) -> Self {
        if s.starts_with("sent") || s.starts_with("已发送") {
            DeliveryStatus::Sent
        } else if s.starts_with("recorded-duplicate") || s.starts_with("已记录（重复预警") {
            DeliveryStatus::RecordedDuplicate
        } else {
            DeliveryStatus::Other(s.to_string())
        }
    }

    pub fn counts_for_dedup(&self) -> bool {
        !matches!(self, DeliveryStatus::Other(_))
    }
}

impl Serialize for DeliveryStatus {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DeliveryStatus {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        Ok(DeliveryStatus::parse(&raw))
    }
}

/// One record in the append-only delivery log — the lookback corpus for
/// deduplication. The forecast date is stored for audit but deliberately
/// excluded from the dedup fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryLogEntry {
    #[serde(default)]
    pub id: i64,
    #[serde(with = "log_timestamp")]
    pub timestamp: NaiveDateTime,
    pub recipient: String,
    #[serde(default)]
    pub to_name: String,
    #[serde(default)]
    pub weather_type: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub alert_date: String,
    #[serde(default)]
    pub condition: String,
    #[serde(default)]
    pub category: String,
    pub status: DeliveryStatus,
    #[serde(default)]
    pub is_test: bool,
}

impl DeliveryLogEntry {
    pub fn from_payload(
        id: i64,
        payload: &MailPayload,
        status: DeliveryStatus,
        is_test: bool,
        timestamp: NaiveDateTime,
    ) -> Self {
        Self {
            id,
            timestamp,
            recipient: payload.to_email.clone(),
            to_name: payload.to_name.clone(),
            weather_type: payload.weather_type.clone(),
            region: payload.region.clone(),
            subject: payload.subject.clone(),
            content: payload.content.clone(),
            alert_date: payload.alert_date.clone(),
            condition: payload.condition.clone(),
            category: payload.category.clone(),
            status,
            is_test,
        }
    }
}

mod log_timestamp {
    use super::*;

    pub fn serialize<S: Serializer>(t: &NaiveDateTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&t.format(TIMESTAMP_FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveDateTime::parse_from_str(&raw, TIMESTAMP_FORMAT)
            .or_else(|_| {
                chrono::DateTime::parse_from_rfc3339(&raw).map(|dt| dt.naive_local())
            })
            .map_err(serde::de::Error::custom)
    }
}
