//! Error kinds of the collector pipeline.
//!
//! Only configuration and capability problems become durable per-target
//! status; the rest are recovered inside a single cycle.

use thiserror::Error;

use crate::collector::backend::BackendKind;

/// Missing or malformed settings. Logged; the pipeline runs degraded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} not set")]
    Missing(&'static str),
    #[error("invalid connection string: {0}")]
    InvalidConnectionString(String),
    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

/// Database session failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DbError {
    #[error("PostgreSQL: {0}")]
    Connection(String),
    #[error("PostgreSQL query error: {0}")]
    Query(String),
}

impl DbError {
    pub(crate) fn connection(e: &postgres::Error) -> Self {
        DbError::Connection(crate::collector::format_postgres_error(e))
    }

    pub(crate) fn query(e: &postgres::Error) -> Self {
        DbError::Query(crate::collector::format_postgres_error(e))
    }
}

/// Why a target was excluded from scheduling.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Unavailable {
    #[error("connection failed: {0}")]
    Connect(DbError),
    #[error("capability detection failed: {0}")]
    Detection(DbError),
    #[error("no supported log source (pg_store_plans, log_fdw, file_fdw) available")]
    NoBackend,
    #[error("{0} prerequisites not met")]
    Prerequisites(BackendKind),
}

/// Failed delivery of one batch.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("API key not configured")]
    MissingApiKey,
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("bad status code: {status} (trace id: {trace_id:?}, request id: {request_id:?}, response: {body})")]
    Status {
        status: u16,
        body: String,
        trace_id: Option<String>,
        request_id: Option<String>,
    },
}
