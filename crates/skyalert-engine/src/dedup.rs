//! Time-windowed duplicate detection over the delivery log.
//!
//! Two independent policies exist on purpose (the legacy system applied
//! both without documenting when): the 7-day fingerprint check guards
//! every send path, and the narrower 3-day check reproduces the old
//! region+type helper for callers that still want it.
//!
//! The forecast date is deliberately not part of either fingerprint —
//! a rolling forecast date (or interval-mode date selection) must not
//! defeat dedup.

use chrono::{Duration, NaiveDateTime};
use skyalert_core::types::{DeliveryLogEntry, DeliveryStatus, MailPayload};

pub const PRIMARY_WINDOW_DAYS: i64 = 7;
pub const LEGACY_WINDOW_DAYS: i64 = 3;

/// Primary dedup policy: has an equivalent notification gone out to this
/// recipient within the last 7 days?
///
/// Recipient, region and weather type must match exactly. Condition and
/// category participate only when both sides carry a value — records from
/// older versions with missing fields must never unblock a resend by
/// accident, nor block one by matching everything.
pub fn is_duplicate_within_week(
    log: &[DeliveryLogEntry],
    payload: &MailPayload,
    now: NaiveDateTime,
) -> bool {
    let cutoff = now - Duration::days(PRIMARY_WINDOW_DAYS);
    let condition = payload.condition.trim();
    let category = payload.category.trim();

    log.iter().any(|entry| {
        if entry.timestamp < cutoff {
            return false;
        }
        if entry.recipient != payload.to_email
            || entry.region != payload.region
            || entry.weather_type != payload.weather_type
        {
            return false;
        }
        let entry_condition = entry.condition.trim();
        if !entry_condition.is_empty() && !condition.is_empty() && entry_condition != condition {
            return false;
        }
        let entry_category = entry.category.trim();
        if !entry_category.is_empty() && !category.is_empty() && entry_category != category {
            return false;
        }
        entry.status.counts_for_dedup()
    })
}

/// Legacy 3-day policy: any *sent* notification for this region and
/// weather type inside the window counts, regardless of recipient.
pub fn is_duplicate_within_three_days(
    log: &[DeliveryLogEntry],
    region: &str,
    weather_type: &str,
    now: NaiveDateTime,
) -> bool {
    let cutoff = now - Duration::days(LEGACY_WINDOW_DAYS);
    log.iter().any(|entry| {
        entry.timestamp >= cutoff
            && entry.region == region
            && entry.weather_type == weather_type
            && entry.status == DeliveryStatus::Sent
    })
}
