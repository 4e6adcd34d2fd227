//! Data model shared by the collector pipeline.
//!
//! Raw rows come out of a backend handler, spans come out of the parser and
//! are serialized to JSON for the exporter.

use serde::Serialize;

use crate::error::ConfigError;

/// Span kind reported for every emitted span.
pub const SPAN_KIND_CLIENT: &str = "SpanKind.CLIENT";
/// Value of `db.system`.
pub const DB_SYSTEM: &str = "postgresql";
/// Value of `telemetry.sdk.language`, identifies this collector to the intake.
pub const COLLECTOR_IDENTITY: &str = "slow-query-log-collector";

/// One monitored database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Label used in logs: `host/dbname`.
    pub name: String,
    /// Host from the connection string, reported as local and peer endpoint.
    pub host: String,
    pub connection_string: String,
    /// Restricts fetched rows to one database name.
    pub database_filter: Option<String>,
}

impl Target {
    /// Builds a target from a libpq-style or URL connection string.
    pub fn from_connection_string(
        connection_string: &str,
        database_filter: Option<String>,
    ) -> Result<Self, ConfigError> {
        let config: postgres::Config = connection_string
            .parse()
            .map_err(|e: postgres::Error| ConfigError::InvalidConnectionString(e.to_string()))?;

        let host = config
            .get_hosts()
            .iter()
            .find_map(|h| match h {
                postgres::config::Host::Tcp(name) => Some(name.clone()),
                #[allow(unreachable_patterns)]
                _ => None,
            })
            .unwrap_or_else(|| "localhost".to_string());
        let dbname = config.get_dbname().unwrap_or("postgres");

        Ok(Self {
            name: format!("{host}/{dbname}"),
            host,
            connection_string: connection_string.to_string(),
            database_filter: database_filter.filter(|d| !d.is_empty()),
        })
    }
}

/// A csvlog line as materialized by a log foreign table.
///
/// `log_time` is UTC text produced by the fetch query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogRow {
    pub log_time: String,
    pub database_name: String,
    pub command_tag: String,
    pub virtual_transaction_id: String,
    pub message: String,
    pub detail: Option<String>,
    pub internal_query: Option<String>,
    /// Empty or `"0"` when the server did not compute one.
    pub query_id: String,
}

/// A stored plan joined with its statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanRow {
    pub query: String,
    /// Plan as JSON text.
    pub plan: String,
    /// UTC text of the last execution.
    pub last_call: String,
    /// Mean execution time in milliseconds.
    pub duration: f64,
    pub query_id: String,
    pub database_name: String,
}

/// Rows produced by one fetch, in ascending timestamp order.
#[derive(Debug, Clone, PartialEq)]
pub enum RawRecords {
    Logs(Vec<LogRow>),
    Plans(Vec<PlanRow>),
}

impl RawRecords {
    pub fn len(&self) -> usize {
        match self {
            RawRecords::Logs(rows) => rows.len(),
            RawRecords::Plans(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Timestamp text of every row, for cursor advancement.
    pub fn timestamps(&self) -> Vec<&str> {
        match self {
            RawRecords::Logs(rows) => rows.iter().map(|r| r.log_time.as_str()).collect(),
            RawRecords::Plans(rows) => rows.iter().map(|r| r.last_call.as_str()).collect(),
        }
    }
}

/// Normalized unit of output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpanRecord {
    pub kind: &'static str,
    pub context: SpanContext,
    pub start_time: String,
    pub end_time: String,
    /// Milliseconds.
    pub duration: f64,
    pub attributes: SpanAttributes,
    pub resource: SpanResource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpanContext {
    pub trace_id: String,
    pub span_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpanAttributes {
    #[serde(rename = "db.statement.metis")]
    pub statement: String,
    #[serde(rename = "db.statement.metis.plan")]
    pub plan: String,
    #[serde(rename = "db.name")]
    pub db_name: String,
    #[serde(rename = "db.query.id")]
    pub query_id: String,
    #[serde(rename = "db.system")]
    pub db_system: &'static str,
    #[serde(rename = "net.host.name")]
    pub host_name: String,
    #[serde(rename = "net.peer.name")]
    pub peer_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpanResource {
    #[serde(rename = "telemetry.sdk.language")]
    pub sdk_language: &'static str,
    #[serde(rename = "service.name")]
    pub service_name: String,
}

impl SpanRecord {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
