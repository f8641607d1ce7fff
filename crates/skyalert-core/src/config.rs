//! Configuration and collaborator-file snapshots.
//!
//! Settings, personnel, alert rules and templates are owned by external
//! management tooling and read here as JSON snapshots, once per evaluation
//! cycle. Legacy field spellings from older deployments are accepted.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};

use crate::error::{Result, SkyAlertError};
use crate::types::{AlertRule, Customer, Template};

/// File layout under the data directory.
#[derive(Debug, Clone)]
pub struct Paths {
    base: PathBuf,
}

impl Paths {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Default data directory (~/.skyalert).
    pub fn default_base() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".skyalert")
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn settings_file(&self) -> PathBuf {
        self.base.join("settings.json")
    }

    pub fn personnel_file(&self) -> PathBuf {
        self.base.join("customers_data.json")
    }

    pub fn rules_file(&self) -> PathBuf {
        self.base.join("alert_rules.json")
    }

    pub fn templates_file(&self) -> PathBuf {
        self.base.join("templates_data.json")
    }

    pub fn delivery_log_file(&self) -> PathBuf {
        self.base.join("delivery_log.json")
    }

    /// Legacy pending-email staging list.
    pub fn staging_file(&self) -> PathBuf {
        self.base.join("pending_emails.json")
    }

    pub fn health_file(&self) -> PathBuf {
        self.base.join("health_status.json")
    }

    pub fn queue_db(&self) -> PathBuf {
        self.base.join("skyalert.db")
    }

    pub fn cache_db(&self) -> PathBuf {
        self.base.join("weather_cache.db")
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.base.join("logs").join("json_backups")
    }

    pub fn attachments_dir(&self) -> PathBuf {
        self.base.join("attachments")
    }

    /// Create the directories this layout needs.
    pub fn ensure(&self) -> Result<()> {
        std::fs::create_dir_all(&self.base)?;
        std::fs::create_dir_all(self.backup_dir())?;
        Ok(())
    }
}

/// Global settings snapshot.
///
/// Numeric fields are kept optional and resolved through accessors so that
/// legacy files (string-typed numbers, missing keys, the old `firstalert`
/// integer hour) degrade to the documented defaults instead of failing the
/// whole cycle.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(rename = "firstAlertTime", alias = "firstalertTime", default)]
    first_alert_time: Option<String>,
    #[serde(rename = "firstalert", default, deserialize_with = "de_opt_u32")]
    first_alert_hour: Option<u32>,
    #[serde(rename = "warningInterval", default, deserialize_with = "de_opt_u32")]
    warning_interval: Option<u32>,
    #[serde(rename = "alertAdvanceTime", default, deserialize_with = "de_opt_u32")]
    alert_advance_time: Option<u32>,
    #[serde(rename = "intervalPrediction", default)]
    interval_prediction: Option<bool>,
    #[serde(rename = "autoApproval", default)]
    pub auto_approval: bool,
    #[serde(rename = "autoRetry", default)]
    auto_retry: Option<bool>,
    #[serde(rename = "retryCount", default, deserialize_with = "de_opt_u32")]
    retry_count: Option<u32>,
    #[serde(rename = "adminNotifications", default)]
    pub admin_notifications: bool,
    #[serde(rename = "weatherApiKey", default)]
    pub weather_api_key: String,
    #[serde(rename = "emailSender", default)]
    pub email_sender: String,
    #[serde(rename = "emailName", default)]
    pub email_name: String,
    #[serde(rename = "smtpServer", default)]
    pub smtp_server: String,
    #[serde(rename = "smtpPort", default, deserialize_with = "de_opt_u32")]
    smtp_port: Option<u32>,
    #[serde(rename = "smtpUsername", default)]
    pub smtp_username: String,
    #[serde(rename = "smtpPassword", default)]
    pub smtp_password: String,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        load_json_file(path)
    }

    /// Time of day for the first alert of the day, as (hour, minute).
    ///
    /// Order of precedence: `firstAlertTime` ("HH:MM"), legacy `firstalert`
    /// integer hour, then 06:00.
    pub fn first_alert(&self) -> (u32, u32) {
        if let Some(t) = &self.first_alert_time
            && let Some((h, m)) = t.split_once(':')
            && let (Ok(h), Ok(m)) = (h.trim().parse::<u32>(), m.trim().parse::<u32>())
            && h < 24
            && m < 60
        {
            return (h, m);
        }
        if let Some(h) = self.first_alert_hour
            && h < 24
        {
            return (h, 0);
        }
        (6, 0)
    }

    /// Hours between evaluation cycles (default 12, never zero).
    pub fn interval_hours(&self) -> u32 {
        self.warning_interval.filter(|v| *v > 0).unwrap_or(12)
    }

    /// Global advance-days setting (default 1).
    pub fn advance_days(&self) -> u32 {
        self.alert_advance_time.unwrap_or(1)
    }

    /// Whether interval prediction sweeps the whole 0..=advance range.
    /// Older files carried this intent on the `autoRetry` flag.
    pub fn interval_prediction(&self) -> bool {
        self.interval_prediction.or(self.auto_retry).unwrap_or(false)
    }

    /// Transient-failure retry budget for external calls (default 3).
    pub fn retry_count(&self) -> u32 {
        self.retry_count.filter(|v| *v > 0).unwrap_or(3)
    }

    pub fn auto_retry(&self) -> bool {
        self.auto_retry.unwrap_or(true)
    }

    pub fn smtp_port(&self) -> u16 {
        self.smtp_port
            .and_then(|p| u16::try_from(p).ok())
            .filter(|p| *p > 0)
            .unwrap_or(587)
    }
}

/// Read-only snapshot of the collaborator-managed data files.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub customers: Vec<Customer>,
    pub rules: Vec<AlertRule>,
    pub templates: Vec<Template>,
}

impl Snapshot {
    pub fn load(paths: &Paths) -> Result<Self> {
        Ok(Self {
            customers: load_json_file(&paths.personnel_file())?,
            rules: load_json_file(&paths.rules_file())?,
            templates: load_json_file(&paths.templates_file())?,
        })
    }

    /// Distinct regions across all subscribers, sorted for determinism.
    pub fn regions(&self) -> Vec<String> {
        self.customers
            .iter()
            .filter(|c| !c.region.is_empty())
            .map(|c| c.region.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Load and deserialize a JSON collaborator file.
pub fn load_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| SkyAlertError::Config(format!("Failed to read {}: {e}", path.display())))?;
    serde_json::from_str(&content)
        .map_err(|e| SkyAlertError::Config(format!("Failed to parse {}: {e}", path.display())))
}

/// Accept numbers or numeric strings; anything else becomes `None`.
pub(crate) fn de_opt_u32<'de, D>(d: D) -> std::result::Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(d)?;
    Ok(value.and_then(|v| match v {
        serde_json::Value::Number(n) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u32)),
        serde_json::Value::String(s) => s.trim().parse::<u32>().ok(),
        _ => None,
    }))
}
