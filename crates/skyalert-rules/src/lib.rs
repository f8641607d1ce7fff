//! # SkyAlert Rules
//!
//! Turns free-text alert rule conditions into a small tagged AST and
//! evaluates them against typed forecast series, in point mode (exact
//! advance-day target) or interval mode (sweep the whole window,
//! nearest match wins).

pub mod condition;
pub mod evaluator;

pub use condition::{Comparator, Condition, ConditionError, Metric};
pub use evaluator::{RuleMatch, evaluate, match_in_interval, match_on_target};
