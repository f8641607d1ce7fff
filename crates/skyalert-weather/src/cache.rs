//! TTL key/value cache in front of the weather provider.
//!
//! SQLite-backed so cached lookups survive restarts. Expiry is lazy: `get`
//! treats stale rows as absent but leaves reclamation to `clear_expired`.

use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::Connection;
use skyalert_core::error::{Result, SkyAlertError};

/// Default cache lifetime: 2 hours.
pub const DEFAULT_TTL_SECS: i64 = 7200;

pub struct WeatherCache {
    conn: Mutex<Connection>,
    ttl_secs: i64,
}

impl WeatherCache {
    /// Open (or create) the cache database. TTL is fixed for the lifetime
    /// of the cache.
    pub fn open(path: &Path, ttl_secs: i64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| SkyAlertError::Store(format!("Cache open: {e}")))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS weather_cache (
                cache_key TEXT PRIMARY KEY,
                data TEXT,
                timestamp INTEGER
            );",
        )
        .map_err(|e| SkyAlertError::Store(format!("Cache migration: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
            ttl_secs,
        })
    }

    /// Key for a region → city-id lookup.
    pub fn city_key(region: &str) -> String {
        format!("city_{region}")
    }

    /// Key for a city's daily forecast series.
    pub fn forecast_key(city_id: &str) -> String {
        format!("weather_{city_id}")
    }

    /// Fetch a cached value. Absent and expired entries both yield `None`;
    /// expired rows are not deleted here.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| SkyAlertError::Store(e.to_string()))?;
        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT data, timestamp FROM weather_cache WHERE cache_key = ?1",
                [key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .ok();
        let Some((data, stored)) = row else {
            return Ok(None);
        };
        if Utc::now().timestamp() - stored > self.ttl_secs {
            return Ok(None);
        }
        Ok(Some(data))
    }

    /// Store (or replace) a value under `key`.
    pub fn set(&self, key: &str, data: &str) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| SkyAlertError::Store(e.to_string()))?;
        conn.execute(
            "INSERT OR REPLACE INTO weather_cache (cache_key, data, timestamp) VALUES (?1, ?2, ?3)",
            rusqlite::params![key, data, Utc::now().timestamp()],
        )
        .map_err(|e| SkyAlertError::Store(format!("Cache set: {e}")))?;
        Ok(())
    }

    /// Remove one key, or everything when `key` is `None`.
    pub fn clear(&self, key: Option<&str>) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| SkyAlertError::Store(e.to_string()))?;
        match key {
            Some(k) => conn.execute("DELETE FROM weather_cache WHERE cache_key = ?1", [k]),
            None => conn.execute("DELETE FROM weather_cache", []),
        }
        .map_err(|e| SkyAlertError::Store(format!("Cache clear: {e}")))?;
        Ok(())
    }

    /// Delete every row past its TTL.
    pub fn clear_expired(&self) -> Result<usize> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| SkyAlertError::Store(e.to_string()))?;
        let cutoff = Utc::now().timestamp() - self.ttl_secs;
        let removed = conn
            .execute("DELETE FROM weather_cache WHERE timestamp < ?1", [cutoff])
            .map_err(|e| SkyAlertError::Store(format!("Cache clear_expired: {e}")))?;
        Ok(removed)
    }
}
