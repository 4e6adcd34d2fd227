//! Trace context inference from query text.
//!
//! Applications propagate context into SQL as a `traceparent=` comment
//! (`/*traceparent='00-<trace-id>-<parent-id>-01'*/`). PostgreSQL has no span
//! concept, so span ids are always generated here.

use uuid::Uuid;

use crate::model::SpanContext;

const TRACEPARENT_TAG: &str = "traceparent=";

/// Builds the span context for a query: propagated trace id if present, else random.
pub fn infer_context(query: &str) -> SpanContext {
    SpanContext {
        trace_id: extract_trace_id(query).unwrap_or_else(random_trace_id),
        span_id: random_span_id(),
    }
}

/// Returns the trace id field of an embedded `traceparent=` value.
///
/// Only a valid W3C trace id (32 hex digits, not all zero) is accepted.
pub fn extract_trace_id(query: &str) -> Option<String> {
    let (_, value) = query.split_once(TRACEPARENT_TAG)?;
    let candidate = value.split('-').nth(1)?;
    let valid = candidate.len() == 32
        && candidate.chars().all(|c| c.is_ascii_hexdigit())
        && candidate.chars().any(|c| c != '0');
    valid.then(|| candidate.to_ascii_lowercase())
}

fn random_trace_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn random_span_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}
