//! Legacy pending-email staging file.
//!
//! Older deployments drove sending from a flat JSON list of rendered
//! payloads. The durable queue has replaced it, but the file is still
//! written for compatibility and consulted as a lower-priority source when
//! the queue is empty. After a queue-driven dispatch it is cleared (with a
//! backup) so the same batch cannot be processed twice.

use std::path::{Path, PathBuf};

use chrono::Local;
use skyalert_core::error::Result;
use skyalert_core::types::MailPayload;

pub const DEFAULT_MAX_ENTRIES: usize = 1000;

pub struct PendingStage {
    path: PathBuf,
    backup_dir: PathBuf,
    max_entries: usize,
}

impl PendingStage {
    pub fn new(path: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            backup_dir: backup_dir.into(),
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Vec<MailPayload> {
        if !self.path.exists() {
            return Vec::new();
        }
        match std::fs::read_to_string(&self.path) {
            Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
                tracing::warn!("⚠️ Failed to parse staging file: {e}");
                Vec::new()
            }),
            Err(e) => {
                tracing::warn!("⚠️ Failed to read staging file: {e}");
                Vec::new()
            }
        }
    }

    /// Replace the staged batch. The previous file is backed up first when
    /// it held data; the new batch is capped to the most recent entries.
    pub fn save(&self, batch: &[MailPayload]) -> Result<()> {
        self.backup_if_has_data()?;
        let start = batch.len().saturating_sub(self.max_entries);
        self.write(&batch[start..])
    }

    /// Truncate to an empty list, backing up any existing data.
    pub fn clear(&self) -> Result<()> {
        self.backup_if_has_data()?;
        self.write(&[])
    }

    /// Remove staged records matching the payload on recipient, subject,
    /// region and weather type. Returns how many were removed.
    pub fn remove_matching(&self, payload: &MailPayload) -> Result<usize> {
        let entries = self.load();
        let before = entries.len();
        let kept: Vec<MailPayload> = entries
            .into_iter()
            .filter(|e| {
                !(e.to_email == payload.to_email
                    && e.subject == payload.subject
                    && e.region == payload.region
                    && e.weather_type == payload.weather_type)
            })
            .collect();
        let removed = before - kept.len();
        if removed > 0 {
            self.write(&kept)?;
        }
        Ok(removed)
    }

    fn write(&self, batch: &[MailPayload]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(batch)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }

    fn backup_if_has_data(&self) -> Result<()> {
        if self.load().is_empty() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.backup_dir)?;
        let name = format!(
            "pending_emails_{}.json",
            Local::now().format("%Y%m%d%H%M%S%3f")
        );
        std::fs::copy(&self.path, self.backup_dir.join(name))?;
        Ok(())
    }
}
