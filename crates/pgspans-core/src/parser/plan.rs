//! auto_explain message and plan payload handling.
//!
//! An auto_explain csvlog message looks like:
//!
//! ```text
//! duration: 12.500 ms  plan:
//! {"Query Text": "SELECT 1", "Plan": {"Node Type": "Result", "Actual Total Time": 0.002, ...}}
//! ```

use serde_json::{Map, Value};

use super::SkipReason;

/// Separates the duration prefix from the plan payload.
pub const PLAN_MARKER: &str = "plan:";

const QUERY_TEXT_KEY: &str = "Query Text";

/// Plan payload with the query text pulled out.
#[derive(Debug, Clone, PartialEq)]
pub struct ExplainPayload {
    pub query: String,
    /// Remaining plan attributes, serialized.
    pub plan: String,
    /// `Plan."Actual Total Time"` if reported.
    pub actual_total_time: Option<f64>,
}

/// Splits a message into `(duration prefix, plan payload)` at the first marker.
pub fn split_message(message: &str) -> Option<(&str, &str)> {
    message.split_once(PLAN_MARKER)
}

/// Parses `duration: 12.500 ms` into milliseconds.
pub fn parse_duration_prefix(prefix: &str) -> Result<f64, SkipReason> {
    let rest = prefix.trim();
    let rest = rest.strip_prefix("duration:").unwrap_or(rest).trim_start();
    let number = rest
        .split_whitespace()
        .next()
        .ok_or_else(|| SkipReason::InvalidDuration(prefix.trim().to_string()))?;
    let millis: f64 = number
        .parse()
        .map_err(|_| SkipReason::InvalidDuration(prefix.trim().to_string()))?;
    check_duration(millis)
}

/// Parses the JSON payload of an auto_explain message.
pub fn parse_explain_payload(payload: &str) -> Result<ExplainPayload, SkipReason> {
    let mut object: Map<String, Value> = serde_json::from_str(payload.trim())
        .map_err(|e| SkipReason::InvalidPlan(e.to_string()))?;

    let query = match object.remove(QUERY_TEXT_KEY) {
        Some(Value::String(q)) => q,
        _ => String::new(),
    };
    let plan = Value::Object(object);
    let actual_total_time = actual_total_time(&plan);

    Ok(ExplainPayload {
        query,
        plan: plan.to_string(),
        actual_total_time,
    })
}

/// `Plan."Actual Total Time"` of an EXPLAIN ANALYZE document.
pub fn actual_total_time(plan: &Value) -> Option<f64> {
    plan.get("Plan")?
        .get("Actual Total Time")?
        .as_f64()
        .filter(|t| t.is_finite() && *t >= 0.0)
}

/// Top-level `"Execution Time"` of an EXPLAIN ANALYZE document.
pub fn execution_time(plan: &Value) -> Option<f64> {
    plan.get("Execution Time")?
        .as_f64()
        .filter(|t| t.is_finite() && *t >= 0.0)
}

pub(super) fn check_duration(millis: f64) -> Result<f64, SkipReason> {
    if millis.is_finite() && millis >= 0.0 {
        Ok(millis)
    } else {
        Err(SkipReason::InvalidDuration(millis.to_string()))
    }
}
