//! Database side of the pipeline.
//!
//! ```text
//!            ┌──────────────┐
//!            │   Detector   │ pg_available_extensions
//!            └──────┬───────┘
//!                   │ BackendKind
//!     ┌─────────────▼──────────────┐
//!     │       BackendHandler       │ check / bootstrap / fetch
//!     │ StorePlans │ LogFile (x2)  │
//!     └─────────────┬──────────────┘
//!                   │
//!            ┌──────▼──────┐
//!            │   Session   │ (trait)
//!            └──────┬──────┘
//!          ┌────────┴────────┐
//!   ┌──────▼──────┐   ┌──────▼──────┐
//!   │  PgSession  │   │ MockSession │
//!   └─────────────┘   └─────────────┘
//! ```

pub mod backend;
pub mod detector;
pub mod mock;
pub mod queries;

use postgres::types::ToSql;
use postgres::{Client, NoTls, Row};

use crate::error::DbError;
use crate::model::{LogRow, PlanRow};

pub use backend::{BackendHandler, BackendKind, BootstrapOptions, FetchFilters, handler_for};
pub use detector::detect;
pub use mock::{MockConnector, MockSession};

/// SQL text plus positional text parameters (`$1`, `$2`, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundQuery {
    pub sql: String,
    pub params: Vec<String>,
}

impl BoundQuery {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn bind(mut self, param: impl Into<String>) -> Self {
        self.params.push(param.into());
        self
    }
}

/// One open database session.
///
/// Every call is blocking; callers on an async runtime go through `spawn_blocking`.
pub trait Session: Send {
    /// First column of the first row as text, `None` for no rows or NULL.
    fn query_scalar(&mut self, sql: &str) -> Result<Option<String>, DbError>;

    /// First column of every row as text. NULLs are skipped.
    fn query_column(&mut self, sql: &str) -> Result<Vec<String>, DbError>;

    /// Runs one statement (or a plpgsql body) for its side effects.
    fn execute(&mut self, sql: &str) -> Result<(), DbError>;

    fn log_rows(&mut self, query: &BoundQuery) -> Result<Vec<LogRow>, DbError>;

    fn plan_rows(&mut self, query: &BoundQuery) -> Result<Vec<PlanRow>, DbError>;
}

/// Opens sessions for a connection string.
pub trait Connector: Send + Sync {
    fn connect(&self, connection_string: &str) -> Result<Box<dyn Session>, DbError>;
}

/// `postgres::Client` without TLS.
#[derive(Debug, Default, Clone, Copy)]
pub struct PgConnector;

impl Connector for PgConnector {
    fn connect(&self, connection_string: &str) -> Result<Box<dyn Session>, DbError> {
        let client = Client::connect(connection_string, NoTls).map_err(|e| DbError::connection(&e))?;
        Ok(Box::new(PgSession { client }))
    }
}

pub struct PgSession {
    client: Client,
}

impl PgSession {
    fn rows(&mut self, query: &BoundQuery) -> Result<Vec<Row>, DbError> {
        let params: Vec<&(dyn ToSql + Sync)> = query
            .params
            .iter()
            .map(|p| p as &(dyn ToSql + Sync))
            .collect();
        self.client
            .query(query.sql.as_str(), &params)
            .map_err(|e| DbError::query(&e))
    }
}

impl Session for PgSession {
    fn query_scalar(&mut self, sql: &str) -> Result<Option<String>, DbError> {
        let row = self
            .client
            .query_opt(sql, &[])
            .map_err(|e| DbError::query(&e))?;
        Ok(row.and_then(|r| r.try_get::<_, Option<String>>(0).ok().flatten()))
    }

    fn query_column(&mut self, sql: &str) -> Result<Vec<String>, DbError> {
        let rows = self.client.query(sql, &[]).map_err(|e| DbError::query(&e))?;
        Ok(rows
            .iter()
            .filter_map(|r| r.try_get::<_, Option<String>>(0).ok().flatten())
            .collect())
    }

    fn execute(&mut self, sql: &str) -> Result<(), DbError> {
        self.client.batch_execute(sql).map_err(|e| DbError::query(&e))
    }

    fn log_rows(&mut self, query: &BoundQuery) -> Result<Vec<LogRow>, DbError> {
        Ok(self
            .rows(query)?
            .iter()
            .map(|row| LogRow {
                log_time: text(row, "log_time"),
                database_name: text(row, "database_name"),
                command_tag: text(row, "command_tag"),
                virtual_transaction_id: text(row, "virtual_transaction_id"),
                message: text(row, "message"),
                detail: row.try_get::<_, Option<String>>("detail").ok().flatten(),
                internal_query: row.try_get::<_, Option<String>>("internal_query").ok().flatten(),
                query_id: text(row, "query_id"),
            })
            .collect())
    }

    fn plan_rows(&mut self, query: &BoundQuery) -> Result<Vec<PlanRow>, DbError> {
        Ok(self
            .rows(query)?
            .iter()
            .map(|row| PlanRow {
                query: text(row, "query"),
                plan: text(row, "plan"),
                last_call: text(row, "last_call"),
                // NaN is rejected by the parser when no plan timing exists either.
                duration: row
                    .try_get::<_, Option<f64>>("duration")
                    .ok()
                    .flatten()
                    .unwrap_or(f64::NAN),
                query_id: text(row, "query_id"),
                database_name: text(row, "database_name"),
            })
            .collect())
    }
}

fn text(row: &Row, column: &str) -> String {
    row.try_get::<_, Option<String>>(column)
        .ok()
        .flatten()
        .unwrap_or_default()
}

/// Points a connection string at another database.
///
/// Key/value strings get their `dbname=` replaced or appended. URLs get their
/// path replaced, keeping any query parameters.
pub fn replace_dbname(connection_string: &str, new_db: &str) -> String {
    if let Some(scheme_end) = url_scheme_end(connection_string) {
        let (base, query) = match connection_string.split_once('?') {
            Some((b, q)) => (b, Some(q)),
            None => (connection_string, None),
        };
        let authority_end = base[scheme_end..]
            .find('/')
            .map_or(base.len(), |i| scheme_end + i);
        let mut out = format!("{}/{}", &base[..authority_end], new_db);
        if let Some(q) = query {
            out.push('?');
            out.push_str(q);
        }
        return out;
    }

    let mut found = false;
    let parts: Vec<String> = connection_string
        .split_whitespace()
        .map(|token| {
            if token.starts_with("dbname=") {
                found = true;
                format!("dbname={}", new_db)
            } else {
                token.to_string()
            }
        })
        .collect();

    if found {
        parts.join(" ")
    } else {
        format!("{} dbname={}", connection_string, new_db)
    }
}

fn url_scheme_end(s: &str) -> Option<usize> {
    ["postgresql://", "postgres://"]
        .iter()
        .find(|scheme| s.starts_with(*scheme))
        .map(|scheme| scheme.len())
}

/// Formats PostgreSQL error message for display.
pub(crate) fn format_postgres_error(e: &postgres::Error) -> String {
    if let Some(db_error) = e.as_db_error() {
        format!("{}: {}", db_error.severity(), db_error.message())
    } else {
        let msg = e.to_string();
        if msg.contains("Connection refused") {
            "connection refused".to_string()
        } else if msg.contains("password authentication failed") {
            "password authentication failed".to_string()
        } else if msg.contains("does not exist") {
            msg.rsplit("FATAL:").next().unwrap_or(&msg).trim().to_string()
        } else {
            msg
        }
    }
}
