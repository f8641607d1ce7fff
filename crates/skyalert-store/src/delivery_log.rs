//! Append-only delivery log.
//!
//! JSON array file holding one entry per send outcome (sent or
//! recorded-duplicate). This file is the lookback corpus for the dedup
//! filter. It grows monotonically; once it passes the retention cap the
//! current file is backed up and only the most recent entries are kept —
//! backup always happens before the trim.

use std::path::{Path, PathBuf};

use chrono::Local;
use skyalert_core::error::Result;
use skyalert_core::types::{DeliveryLogEntry, DeliveryStatus, MailPayload};

pub const DEFAULT_MAX_ENTRIES: usize = 2000;

pub struct DeliveryLog {
    path: PathBuf,
    backup_dir: PathBuf,
    max_entries: usize,
}

impl DeliveryLog {
    pub fn new(path: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            backup_dir: backup_dir.into(),
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load all entries. Missing or unreadable files read as empty — a
    /// corrupt log must never block sending.
    pub fn load(&self) -> Vec<DeliveryLogEntry> {
        if !self.path.exists() {
            return Vec::new();
        }
        match std::fs::read_to_string(&self.path) {
            Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
                tracing::warn!("⚠️ Failed to parse delivery log: {e}");
                Vec::new()
            }),
            Err(e) => {
                tracing::warn!("⚠️ Failed to read delivery log: {e}");
                Vec::new()
            }
        }
    }

    /// Append one outcome for a payload, assigning the next id. Applies
    /// the backup-then-trim retention policy when the cap is exceeded.
    pub fn record(
        &self,
        payload: &MailPayload,
        status: DeliveryStatus,
        is_test: bool,
    ) -> Result<DeliveryLogEntry> {
        let mut entries = self.load();
        let id = entries.iter().map(|e| e.id).max().unwrap_or(0) + 1;
        let entry = DeliveryLogEntry::from_payload(
            id,
            payload,
            status,
            is_test,
            Local::now().naive_local(),
        );
        entries.push(entry.clone());

        if entries.len() > self.max_entries {
            self.backup()?;
            let excess = entries.len() - self.max_entries;
            entries.drain(..excess);
        }

        self.save(&entries)?;
        Ok(entry)
    }

    fn save(&self, entries: &[DeliveryLogEntry]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(entries)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }

    /// Copy the current file into the backup directory with a timestamped
    /// name. No-op when the file does not exist yet.
    fn backup(&self) -> Result<Option<PathBuf>> {
        if !self.path.exists() {
            return Ok(None);
        }
        std::fs::create_dir_all(&self.backup_dir)?;
        let name = format!(
            "delivery_log_{}.json",
            Local::now().format("%Y%m%d%H%M%S%3f")
        );
        let target = self.backup_dir.join(name);
        std::fs::copy(&self.path, &target)?;
        tracing::info!("💾 Delivery log backed up to {}", target.display());
        Ok(Some(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> (DeliveryLog, PathBuf) {
        let dir = std::env::temp_dir().join("skyalert-log-test").join(name);
        std::fs::remove_dir_all(&dir).ok();
        std::fs::create_dir_all(&dir).unwrap();
        let log = DeliveryLog::new(dir.join("delivery_log.json"), dir.join("backups"));
        (log, dir)
    }

    fn payload(email: &str) -> MailPayload {
        MailPayload {
            to_email: email.into(),
            subject: "s".into(),
            content: "c".into(),
            region: "北京".into(),
            weather_type: "高温".into(),
            ..Default::default()
        }
    }

    #[test]
    fn record_assigns_increasing_ids() {
        let (log, _dir) = scratch("ids");
        let a = log.record(&payload("a@x.com"), DeliveryStatus::Sent, false).unwrap();
        let b = log
            .record(&payload("b@x.com"), DeliveryStatus::RecordedDuplicate, false)
            .unwrap();
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);

        let entries = log.load();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].status, DeliveryStatus::RecordedDuplicate);
    }

    #[test]
    fn trim_backs_up_then_keeps_most_recent() {
        let (log, dir) = scratch("trim");
        let log = log.with_max_entries(3);
        for i in 0..5 {
            log.record(&payload(&format!("u{i}@x.com")), DeliveryStatus::Sent, false)
                .unwrap();
        }
        let entries = log.load();
        assert_eq!(entries.len(), 3);
        // Oldest-first truncation: the survivors are the most recent.
        assert_eq!(entries[0].recipient, "u2@x.com");
        assert_eq!(entries[2].recipient, "u4@x.com");

        let backups: Vec<_> = std::fs::read_dir(dir.join("backups")).unwrap().collect();
        assert!(!backups.is_empty());
    }

    #[test]
    fn corrupt_file_reads_as_empty() {
        let (log, dir) = scratch("corrupt");
        std::fs::write(dir.join("delivery_log.json"), "{not json").unwrap();
        assert!(log.load().is_empty());
    }
}
