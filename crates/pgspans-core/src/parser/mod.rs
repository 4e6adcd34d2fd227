//! Record parser: raw log/plan rows into normalized spans.
//!
//! Pure transformation, no I/O. A record that cannot be turned into a span is
//! skipped with a [`SkipReason`]; one bad record never drops the rest of a fetch.

pub mod context;
pub mod plan;
pub mod timestamp;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

use crate::collector::queries::COLLECTOR_QUERY_TAG;
use crate::model::{
    COLLECTOR_IDENTITY, DB_SYSTEM, LogRow, PlanRow, SPAN_KIND_CLIENT, SpanAttributes, SpanRecord,
    SpanResource,
};

use context::infer_context;
use plan::{
    PLAN_MARKER, actual_total_time, check_duration, execution_time, parse_duration_prefix,
    parse_explain_payload, split_message,
};
use timestamp::{add_millis, format_span_time, parse_timestamp};

/// Query text prefixes never turned into spans. Every statement the collector
/// issues starts with [`COLLECTOR_QUERY_TAG`], so its own polling is not re-ingested.
pub const EXCLUDED_QUERY_PREFIXES: &[&str] = &[COLLECTOR_QUERY_TAG];

/// Protocol-phase command tags that carry query ids for extended-protocol statements.
const QUERY_ID_SOURCE_TAGS: &[&str] = &["BIND", "PARSE"];

/// Why a record produced no span.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SkipReason {
    #[error("message carries no plan")]
    NoPlan,
    #[error("empty query text")]
    EmptyQuery,
    #[error("collector's own query")]
    Instrumentation,
    #[error("malformed plan: {0}")]
    InvalidPlan(String),
    #[error("malformed duration: {0}")]
    InvalidDuration(String),
    #[error("malformed timestamp: {0}")]
    InvalidTimestamp(String),
}

/// Target-level values copied into every span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseContext {
    pub host: String,
    pub service_name: String,
}

/// Maps a virtual transaction id to the first nonzero query id seen on its
/// BIND/PARSE records.
#[derive(Debug, Default)]
pub struct QueryIdIndex<'a> {
    by_transaction: HashMap<&'a str, &'a str>,
}

impl<'a> QueryIdIndex<'a> {
    pub fn build(rows: &'a [LogRow]) -> Self {
        let mut by_transaction = HashMap::new();
        for row in rows {
            if QUERY_ID_SOURCE_TAGS.contains(&row.command_tag.as_str())
                && !row.virtual_transaction_id.is_empty()
                && has_query_id(&row.query_id)
            {
                by_transaction
                    .entry(row.virtual_transaction_id.as_str())
                    .or_insert(row.query_id.as_str());
            }
        }
        Self { by_transaction }
    }

    /// Row's own id, else the id inferred from its transaction, else empty.
    pub fn resolve(&self, row: &LogRow) -> String {
        if has_query_id(&row.query_id) {
            return row.query_id.trim().to_string();
        }
        self.by_transaction
            .get(row.virtual_transaction_id.as_str())
            .map(|id| id.trim().to_string())
            .unwrap_or_default()
    }
}

fn has_query_id(id: &str) -> bool {
    let id = id.trim();
    !id.is_empty() && id != "0"
}

/// True for query text the collector must not emit.
pub fn is_excluded_query(query: &str) -> bool {
    let query = query.trim_start();
    EXCLUDED_QUERY_PREFIXES
        .iter()
        .any(|prefix| query.starts_with(prefix))
}

fn check_query(query: &str) -> Result<(), SkipReason> {
    if query.trim().is_empty() {
        return Err(SkipReason::EmptyQuery);
    }
    if is_excluded_query(query) {
        return Err(SkipReason::Instrumentation);
    }
    Ok(())
}

fn end_time(start: DateTime<Utc>, duration: f64) -> Result<DateTime<Utc>, SkipReason> {
    add_millis(start, duration).ok_or_else(|| SkipReason::InvalidDuration(duration.to_string()))
}

/// Parses one auto_explain log record.
pub fn parse_log_row(
    row: &LogRow,
    query_ids: &QueryIdIndex<'_>,
    ctx: &ParseContext,
) -> Result<SpanRecord, SkipReason> {
    let (prefix, payload) = split_message(&row.message).ok_or(SkipReason::NoPlan)?;
    let explain = parse_explain_payload(payload)?;
    check_query(&explain.query)?;

    let start = parse_timestamp(&row.log_time)
        .ok_or_else(|| SkipReason::InvalidTimestamp(row.log_time.clone()))?;
    let logged = parse_duration_prefix(prefix)?;
    let duration = explain.actual_total_time.unwrap_or(logged);

    let end = end_time(start, duration)?;

    Ok(SpanRecord {
        kind: SPAN_KIND_CLIENT,
        context: infer_context(&explain.query),
        start_time: format_span_time(start),
        end_time: format_span_time(end),
        duration,
        attributes: SpanAttributes {
            statement: explain.query,
            plan: explain.plan,
            db_name: row.database_name.clone(),
            query_id: query_ids.resolve(row),
            db_system: DB_SYSTEM,
            host_name: ctx.host.clone(),
            peer_name: ctx.host.clone(),
        },
        resource: SpanResource {
            sdk_language: COLLECTOR_IDENTITY,
            service_name: ctx.service_name.clone(),
        },
    })
}

/// Parses one stored-plan row.
///
/// Duration preference: `Plan."Actual Total Time"`, then `"Execution Time"`,
/// then the statement's mean execution time.
pub fn parse_plan_row(row: &PlanRow, ctx: &ParseContext) -> Result<SpanRecord, SkipReason> {
    let plan: serde_json::Value =
        serde_json::from_str(&row.plan).map_err(|e| SkipReason::InvalidPlan(e.to_string()))?;
    check_query(&row.query)?;

    let start = parse_timestamp(&row.last_call)
        .ok_or_else(|| SkipReason::InvalidTimestamp(row.last_call.clone()))?;
    let duration = match actual_total_time(&plan).or_else(|| execution_time(&plan)) {
        Some(d) => d,
        None => check_duration(row.duration)?,
    };

    let end = end_time(start, duration)?;

    Ok(SpanRecord {
        kind: SPAN_KIND_CLIENT,
        context: infer_context(&row.query),
        start_time: format_span_time(start),
        end_time: format_span_time(end),
        duration,
        attributes: SpanAttributes {
            statement: row.query.clone(),
            plan: row.plan.clone(),
            db_name: row.database_name.clone(),
            query_id: row.query_id.trim().to_string(),
            db_system: DB_SYSTEM,
            host_name: ctx.host.clone(),
            peer_name: ctx.host.clone(),
        },
        resource: SpanResource {
            sdk_language: COLLECTOR_IDENTITY,
            service_name: ctx.service_name.clone(),
        },
    })
}

/// Parses a fetch of log rows. BIND/PARSE rows only feed query-id inference.
pub fn parse_log_rows(rows: &[LogRow], ctx: &ParseContext) -> Vec<SpanRecord> {
    let query_ids = QueryIdIndex::build(rows);
    rows.iter()
        .filter(|row| row.message.contains(PLAN_MARKER))
        .filter_map(|row| match parse_log_row(row, &query_ids, ctx) {
            Ok(span) => Some(span),
            Err(reason) => {
                debug!(log_time = %row.log_time, %reason, "log record skipped");
                None
            }
        })
        .collect()
}

/// Parses a fetch of stored-plan rows.
pub fn parse_plan_rows(rows: &[PlanRow], ctx: &ParseContext) -> Vec<SpanRecord> {
    rows.iter()
        .filter_map(|row| match parse_plan_row(row, ctx) {
            Ok(span) => Some(span),
            Err(reason) => {
                debug!(last_call = %row.last_call, query_id = %row.query_id, %reason,
                    "plan record skipped");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ParseContext {
        ParseContext {
            host: "db.internal".to_string(),
            service_name: "checkout".to_string(),
        }
    }

    fn log_row(message: &str) -> LogRow {
        LogRow {
            log_time: "2024-01-01 00:00:00".to_string(),
            database_name: "shop".to_string(),
            command_tag: "SELECT".to_string(),
            virtual_transaction_id: "3/42".to_string(),
            message: message.to_string(),
            query_id: String::new(),
            ..Default::default()
        }
    }

    fn parse_one(row: &LogRow) -> Result<SpanRecord, SkipReason> {
        let rows = std::slice::from_ref(row);
        parse_log_row(row, &QueryIdIndex::build(rows), &ctx())
    }

    #[test]
    fn example_record_prefers_plan_actual_time() {
        let row = log_row(
            "duration: 12.500 ms  plan: {\"Query Text\": \"SELECT 1\", \"Plan\": {\"Actual Total Time\": 10.2}}",
        );
        let span = parse_one(&row).unwrap();
        assert_eq!(span.duration, 10.2);
        assert_eq!(span.attributes.statement, "SELECT 1");
        assert_eq!(span.start_time, "2024-01-01T00:00:00.000Z");
        assert_eq!(span.end_time, "2024-01-01T00:00:00.010Z");
        assert_eq!(span.context.trace_id.len(), 32);
        assert_eq!(span.context.span_id.len(), 16);
        assert_eq!(span.kind, SPAN_KIND_CLIENT);
        assert_eq!(span.attributes.db_name, "shop");
        assert_eq!(span.attributes.host_name, "db.internal");
        assert_eq!(span.attributes.peer_name, "db.internal");
        assert_eq!(span.resource.service_name, "checkout");
        let plan: serde_json::Value = serde_json::from_str(&span.attributes.plan).unwrap();
        assert_eq!(plan["Plan"]["Actual Total Time"], 10.2);
        assert!(plan.get("Query Text").is_none());
    }

    #[test]
    fn falls_back_to_logged_duration() {
        let row = log_row(
            "duration: 12.500 ms  plan:\n{\"Query Text\": \"SELECT 1\", \"Plan\": {\"Node Type\": \"Result\"}}",
        );
        let span = parse_one(&row).unwrap();
        assert_eq!(span.duration, 12.5);
        assert_eq!(span.end_time, "2024-01-01T00:00:00.012Z");
    }

    #[test]
    fn propagated_traceparent_is_used() {
        let row = log_row(
            "duration: 1.000 ms  plan: {\"Query Text\": \"SELECT 1 /*traceparent='00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01'*/\", \"Plan\": {}}",
        );
        let span = parse_one(&row).unwrap();
        assert_eq!(span.context.trace_id, "4bf92f3577b34da6a3ce929d0e0e4736");
    }

    #[test]
    fn skips_collector_queries() {
        let row = log_row(&format!(
            "duration: 1.000 ms  plan: {{\"Query Text\": \"  {COLLECTOR_QUERY_TAG} SELECT log_time FROM logs.postgres_logs\", \"Plan\": {{}}}}"
        ));
        assert_eq!(parse_one(&row), Err(SkipReason::Instrumentation));
    }

    #[test]
    fn skips_empty_query() {
        let row = log_row("duration: 1.000 ms  plan: {\"Query Text\": \"   \", \"Plan\": {}}");
        assert_eq!(parse_one(&row), Err(SkipReason::EmptyQuery));
        let row = log_row("duration: 1.000 ms  plan: {\"Plan\": {}}");
        assert_eq!(parse_one(&row), Err(SkipReason::EmptyQuery));
    }

    #[test]
    fn skips_records_without_plan() {
        let row = log_row("duration: 1.000 ms  statement: SELECT 1");
        assert_eq!(parse_one(&row), Err(SkipReason::NoPlan));
    }

    #[test]
    fn skips_bad_timestamp_and_duration() {
        let mut row = log_row("duration: 1.000 ms  plan: {\"Query Text\": \"SELECT 1\", \"Plan\": {}}");
        row.log_time = "not a time".to_string();
        assert!(matches!(parse_one(&row), Err(SkipReason::InvalidTimestamp(_))));

        let row = log_row("duration: fast  plan: {\"Query Text\": \"SELECT 1\", \"Plan\": {}}");
        assert!(matches!(parse_one(&row), Err(SkipReason::InvalidDuration(_))));
    }

    #[test]
    fn skips_durations_past_the_calendar() {
        let row = log_row("duration: 1e16 ms  plan: {\"Query Text\": \"SELECT 1\", \"Plan\": {}}");
        assert!(matches!(parse_one(&row), Err(SkipReason::InvalidDuration(_))));

        let row = log_row(
            "duration: 1.000 ms  plan: {\"Query Text\": \"SELECT 1\", \"Plan\": {\"Actual Total Time\": 1e300}}",
        );
        assert!(matches!(parse_one(&row), Err(SkipReason::InvalidDuration(_))));

        let good = log_row("duration: 1.000 ms  plan: {\"Query Text\": \"SELECT 2\", \"Plan\": {}}");
        let spans = parse_log_rows(&[row, good], &ctx());
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].attributes.statement, "SELECT 2");
    }

    #[test]
    fn query_id_from_record_wins() {
        let mut row = log_row("duration: 1 ms  plan: {\"Query Text\": \"SELECT 1\", \"Plan\": {}}");
        row.query_id = "777".to_string();
        assert_eq!(parse_one(&row).unwrap().attributes.query_id, "777");
    }

    #[test]
    fn query_id_inferred_from_bind_in_same_transaction() {
        let mut plan_row =
            log_row("duration: 1 ms  plan: {\"Query Text\": \"SELECT $1\", \"Plan\": {}}");
        plan_row.query_id = "0".to_string();
        let rows = vec![
            LogRow {
                command_tag: "PARSE".to_string(),
                virtual_transaction_id: "9/1".to_string(),
                query_id: "111".to_string(),
                ..Default::default()
            },
            LogRow {
                command_tag: "BIND".to_string(),
                virtual_transaction_id: "3/42".to_string(),
                query_id: "0".to_string(),
                ..Default::default()
            },
            LogRow {
                command_tag: "BIND".to_string(),
                virtual_transaction_id: "3/42".to_string(),
                query_id: "-5012".to_string(),
                ..Default::default()
            },
            LogRow {
                command_tag: "PARSE".to_string(),
                virtual_transaction_id: "3/42".to_string(),
                query_id: "999".to_string(),
                ..Default::default()
            },
            plan_row.clone(),
        ];
        let index = QueryIdIndex::build(&rows);
        let span = parse_log_row(&plan_row, &index, &ctx()).unwrap();
        assert_eq!(span.attributes.query_id, "-5012");
    }

    #[test]
    fn query_id_empty_when_nothing_matches() {
        let row = log_row("duration: 1 ms  plan: {\"Query Text\": \"SELECT 1\", \"Plan\": {}}");
        assert_eq!(parse_one(&row).unwrap().attributes.query_id, "");
    }

    #[test]
    fn batch_skips_bad_records_and_aux_rows() {
        let rows = vec![
            LogRow {
                command_tag: "BIND".to_string(),
                virtual_transaction_id: "3/42".to_string(),
                query_id: "5".to_string(),
                message: "duration: 0.010 ms  bind <unnamed>: SELECT 1".to_string(),
                ..Default::default()
            },
            log_row("duration: 1 ms  plan: {not json"),
            log_row("duration: 2 ms  plan: {\"Query Text\": \"SELECT 2\", \"Plan\": {}}"),
        ];
        let spans = parse_log_rows(&rows, &ctx());
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].attributes.statement, "SELECT 2");
        assert_eq!(spans[0].attributes.query_id, "5");
    }

    fn plan_row(plan: &str) -> PlanRow {
        PlanRow {
            query: "SELECT * FROM orders WHERE id = $1".to_string(),
            plan: plan.to_string(),
            last_call: "2024-01-01 00:00:01.500".to_string(),
            duration: 3.25,
            query_id: "-812".to_string(),
            database_name: "shop".to_string(),
        }
    }

    #[test]
    fn plan_row_prefers_actual_total_time() {
        let row = plan_row(r#"{"Plan": {"Node Type": "Index Scan", "Actual Total Time": 1.75}}"#);
        let span = parse_plan_row(&row, &ctx()).unwrap();
        assert_eq!(span.duration, 1.75);
        assert_eq!(span.start_time, "2024-01-01T00:00:01.500Z");
        assert_eq!(span.attributes.plan, row.plan);
        assert_eq!(span.attributes.query_id, "-812");
    }

    #[test]
    fn plan_row_uses_execution_time_then_mean() {
        let span = parse_plan_row(&plan_row(r#"{"Plan": {}, "Execution Time": 2.0}"#), &ctx()).unwrap();
        assert_eq!(span.duration, 2.0);
        let span = parse_plan_row(&plan_row(r#"{"Plan": {"Node Type": "Seq Scan"}}"#), &ctx()).unwrap();
        assert_eq!(span.duration, 3.25);
    }

    #[test]
    fn plan_row_skips_collector_queries_and_bad_plans() {
        let mut row = plan_row(r#"{"Plan": {}}"#);
        row.query = format!("{COLLECTOR_QUERY_TAG} SELECT 1");
        assert_eq!(parse_plan_row(&row, &ctx()), Err(SkipReason::Instrumentation));

        let row = plan_row("Seq Scan on orders");
        assert!(matches!(parse_plan_row(&row, &ctx()), Err(SkipReason::InvalidPlan(_))));
    }

    #[test]
    fn plan_row_skips_durations_past_the_calendar() {
        let row = plan_row(r#"{"Plan": {"Actual Total Time": 1e300}}"#);
        assert!(matches!(parse_plan_row(&row, &ctx()), Err(SkipReason::InvalidDuration(_))));

        let mut row = plan_row(r#"{"Plan": {}}"#);
        row.duration = 1e16;
        assert!(matches!(parse_plan_row(&row, &ctx()), Err(SkipReason::InvalidDuration(_))));

        let rows = vec![row, plan_row(r#"{"Plan": {}}"#)];
        assert_eq!(parse_plan_rows(&rows, &ctx()).len(), 1);
    }

    #[test]
    fn plan_rows_batch_keeps_order() {
        let mut second = plan_row(r#"{"Plan": {}}"#);
        second.query = "SELECT 2".to_string();
        let rows = vec![plan_row(r#"{"Plan": {}}"#), plan_row("broken"), second];
        let spans = parse_plan_rows(&rows, &ctx());
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[1].attributes.statement, "SELECT 2");
    }
}
