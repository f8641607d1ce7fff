//! Rule evaluation over a region's forecast series.
//!
//! Two modes:
//! - point: evaluate only the exact `today + advance_days` date
//! - interval: sweep every day from today through the advance window and
//!   report the match closest to today

use chrono::{Days, NaiveDate};
use skyalert_core::types::ForecastPoint;

use crate::condition::Condition;

/// A successful rule match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleMatch {
    /// Days from today to the matched forecast (0 = today).
    pub day_offset: u32,
    /// The matched forecast date.
    pub date: NaiveDate,
}

/// Point mode: evaluate the condition against the forecast entry for
/// exactly `today + advance_days`. A series shorter than the required
/// horizon, or with no entry for the target date, never matches.
pub fn match_on_target(
    forecasts: &[ForecastPoint],
    condition: &Condition,
    today: NaiveDate,
    advance_days: u32,
) -> Option<RuleMatch> {
    let required = advance_days as usize + 1;
    if forecasts.len() < required {
        tracing::debug!(
            "insufficient forecast data: {} day(s) available, {required} required",
            forecasts.len()
        );
        return None;
    }
    let target = today.checked_add_days(Days::new(advance_days as u64))?;
    let point = forecasts.iter().find(|p| p.date == target)?;
    condition.matches(point).then_some(RuleMatch {
        day_offset: advance_days,
        date: target,
    })
}

/// Interval mode: sweep `day` from 0 through `advance_days` inclusive and
/// return the earliest matching day. Iterating in ascending order makes
/// nearest-first selection (and its tie-break) inherent.
pub fn match_in_interval(
    forecasts: &[ForecastPoint],
    condition: &Condition,
    today: NaiveDate,
    advance_days: u32,
) -> Option<RuleMatch> {
    (0..=advance_days).find_map(|day| match_on_target(forecasts, condition, today, day))
}

/// Dispatch on the configured evaluation mode.
pub fn evaluate(
    forecasts: &[ForecastPoint],
    condition: &Condition,
    today: NaiveDate,
    advance_days: u32,
    interval_prediction: bool,
) -> Option<RuleMatch> {
    if interval_prediction {
        match_in_interval(forecasts, condition, today, advance_days)
    } else {
        match_on_target(forecasts, condition, today, advance_days)
    }
}
