//! Condition AST.
//!
//! Rule conditions arrive as free text in one of two shapes:
//!
//! - comparator form: `最高温度 >= 30` (metric phrase, operator, threshold)
//! - keyword form: `包含雨或雪` / `contains rain or snow`
//!
//! They are parsed once per rule into a tagged variant and evaluated
//! against typed [`ForecastPoint`]s, so the hot path never re-inspects the
//! raw string.

use skyalert_core::types::{AlertKind, ForecastPoint};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConditionError {
    #[error("no comparator in condition: {0}")]
    MissingComparator(String),
    #[error("unparseable threshold in condition: {0}")]
    BadThreshold(String),
    #[error("unknown metric phrase in condition: {0}")]
    UnknownMetric(String),
    #[error("no keywords in condition: {0}")]
    NoKeywords(String),
}

/// Forecast field a comparator condition targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    TempMax,
    TempMin,
    Precip,
    WindSpeed,
    Visibility,
}

impl Metric {
    /// Map a condition's metric phrase to a forecast field. Phrases are
    /// matched by containment because rule text often carries units or
    /// qualifiers around the phrase. `24h降雨量` and `降雨量` are legacy
    /// aliases for precipitation; a bare `温度` targets the daily high.
    pub fn from_phrase(condition: &str) -> Option<Self> {
        if condition.contains("最高温度") {
            Some(Metric::TempMax)
        } else if condition.contains("最低温度") {
            Some(Metric::TempMin)
        } else if condition.contains("24h降雨量")
            || condition.contains("降水量")
            || condition.contains("降雨量")
        {
            Some(Metric::Precip)
        } else if condition.contains("风速") {
            Some(Metric::WindSpeed)
        } else if condition.contains("能见度") {
            Some(Metric::Visibility)
        } else if condition.contains("温度") {
            Some(Metric::TempMax)
        } else {
            None
        }
    }

    pub fn value_of(&self, point: &ForecastPoint) -> Option<f64> {
        match self {
            Metric::TempMax => point.temp_max,
            Metric::TempMin => point.temp_min,
            Metric::Precip => point.precip,
            Metric::WindSpeed => point.wind_speed,
            Metric::Visibility => point.visibility,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Gt,
    Lt,
    Ge,
    Le,
}

impl Comparator {
    fn parse(token: &str) -> Option<Self> {
        match token {
            ">" => Some(Comparator::Gt),
            "<" => Some(Comparator::Lt),
            ">=" => Some(Comparator::Ge),
            "<=" => Some(Comparator::Le),
            _ => None,
        }
    }

    pub fn compare(&self, value: f64, threshold: f64) -> bool {
        match self {
            Comparator::Gt => value > threshold,
            Comparator::Lt => value < threshold,
            Comparator::Ge => value >= threshold,
            Comparator::Le => value <= threshold,
        }
    }
}

/// A parsed rule condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Comparison {
        metric: Metric,
        op: Comparator,
        threshold: f64,
    },
    Keyword {
        terms: Vec<String>,
    },
}

impl Condition {
    pub fn parse(raw: &str, kind: AlertKind) -> Result<Self, ConditionError> {
        match kind {
            AlertKind::Parameter => Self::parse_comparison(raw),
            AlertKind::Keyword | AlertKind::Text => Self::parse_keyword(raw),
        }
    }

    fn parse_comparison(raw: &str) -> Result<Self, ConditionError> {
        let metric = Metric::from_phrase(raw)
            .ok_or_else(|| ConditionError::UnknownMetric(raw.to_string()))?;
        let mut tokens = raw.split_whitespace();
        let op = tokens
            .by_ref()
            .find_map(Comparator::parse)
            .ok_or_else(|| ConditionError::MissingComparator(raw.to_string()))?;
        let threshold = tokens
            .next()
            .and_then(|t| t.parse::<f64>().ok())
            .ok_or_else(|| ConditionError::BadThreshold(raw.to_string()))?;
        Ok(Condition::Comparison {
            metric,
            op,
            threshold,
        })
    }

    fn parse_keyword(raw: &str) -> Result<Self, ConditionError> {
        let body = raw
            .split_once("包含")
            .or_else(|| raw.split_once("contains"))
            .map(|(_, rest)| rest)
            .unwrap_or(raw);
        let terms: Vec<String> = body
            .replace(" or ", "或")
            .split('或')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        if terms.is_empty() {
            return Err(ConditionError::NoKeywords(raw.to_string()));
        }
        Ok(Condition::Keyword { terms })
    }

    /// Evaluate against a single forecast day. A missing metric value never
    /// matches; keyword terms match by substring against the day or night
    /// text, case-sensitive as stored.
    pub fn matches(&self, point: &ForecastPoint) -> bool {
        match self {
            Condition::Comparison {
                metric,
                op,
                threshold,
            } => metric
                .value_of(point)
                .is_some_and(|value| op.compare(value, *threshold)),
            Condition::Keyword { terms } => terms
                .iter()
                .any(|term| point.text_day.contains(term) || point.text_night.contains(term)),
        }
    }
}
