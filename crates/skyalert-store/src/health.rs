//! External-dependency health log.
//!
//! Tracks the last outcome and a bounded history per service (WeatherAPI,
//! SMTP) in a JSON map, for operators and the admin frontend.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::Local;
use serde::{Deserialize, Serialize};
use skyalert_core::error::Result;
use skyalert_core::types::TIMESTAMP_FORMAT;

const MAX_HISTORY: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSample {
    pub timestamp: String,
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthEntry {
    #[serde(default)]
    pub last_check: String,
    #[serde(default)]
    pub last_success: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_message: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub history: Vec<HealthSample>,
}

pub struct HealthLog {
    path: PathBuf,
}

impl HealthLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn load(&self) -> BTreeMap<String, HealthEntry> {
        if !self.path.exists() {
            return BTreeMap::new();
        }
        std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|json| serde_json::from_str(&json).ok())
            .unwrap_or_default()
    }

    /// Record one check outcome for a service.
    pub fn record(&self, service: &str, success: bool, message: &str) -> Result<()> {
        let mut data = self.load();
        let entry = data.entry(service.to_string()).or_default();
        let now = Local::now().format(TIMESTAMP_FORMAT).to_string();

        entry.last_check = now.clone();
        if success {
            entry.last_success = Some(now.clone());
        } else {
            entry.last_error = Some(now.clone());
        }
        entry.last_message = message.to_string();
        entry.status = if success { "ok" } else { "error" }.to_string();
        entry.history.push(HealthSample {
            timestamp: now,
            success,
            message: message.to_string(),
        });
        if entry.history.len() > MAX_HISTORY {
            let excess = entry.history.len() - MAX_HISTORY;
            entry.history.drain(..excess);
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(&data)?)?;
        Ok(())
    }
}
