//! Scripted in-memory sessions for exercising handlers and the scheduler
//! without a PostgreSQL server.
//!
//! A `MockSession` is a cheap handle onto shared state, so a test can keep a
//! clone, hand another to a connector, and keep adding rows between cycles.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::DbError;
use crate::model::{LogRow, PlanRow};
use crate::parser::timestamp::parse_timestamp;

use super::queries;
use super::{BoundQuery, Connector, Session};

#[derive(Debug, Default)]
struct MockState {
    settings: HashMap<String, String>,
    extensions: Vec<String>,
    databases: Vec<String>,
    store_plans_fork_column: bool,
    log_rows: Vec<LogRow>,
    plan_rows: Vec<PlanRow>,
    fail_on: Vec<String>,
    executed: Vec<String>,
    fetches: Vec<BoundQuery>,
}

#[derive(Debug, Clone, Default)]
pub struct MockSession {
    state: Arc<Mutex<MockState>>,
}

impl MockSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// PostgreSQL 16 with csv logging on: passes every log-backend prerequisite.
    pub fn log_ready(extension: &str) -> Self {
        Self::new()
            .with_setting("server_version_num", "160002")
            .with_setting("logging_collector", "on")
            .with_setting("log_destination", "stderr,csvlog")
            .with_extension(extension)
    }

    /// PostgreSQL 16 with pg_store_plans preloaded.
    pub fn store_plans_ready() -> Self {
        Self::new()
            .with_setting("server_version_num", "160002")
            .with_setting("shared_preload_libraries", "pg_stat_statements,pg_store_plans")
            .with_extension("pg_store_plans")
    }

    pub fn with_setting(self, name: &str, value: &str) -> Self {
        self.lock().settings.insert(name.to_string(), value.to_string());
        self
    }

    /// Extensions are reported in the order they were added.
    pub fn with_extension(self, name: &str) -> Self {
        {
            let mut state = self.lock();
            if !state.extensions.iter().any(|e| e == name) {
                state.extensions.push(name.to_string());
            }
        }
        self
    }

    pub fn with_database(self, name: &str) -> Self {
        self.lock().databases.push(name.to_string());
        self
    }

    /// Exposes `queryid_stat_statements` on pg_store_plans.
    pub fn with_store_plans_fork_column(self) -> Self {
        self.lock().store_plans_fork_column = true;
        self
    }

    pub fn push_log_rows(&self, rows: impl IntoIterator<Item = LogRow>) {
        self.lock().log_rows.extend(rows);
    }

    pub fn push_plan_rows(&self, rows: impl IntoIterator<Item = PlanRow>) {
        self.lock().plan_rows.extend(rows);
    }

    /// Every statement containing `pattern` fails until [`clear_failures`](Self::clear_failures).
    pub fn fail_on(&self, pattern: &str) {
        self.lock().fail_on.push(pattern.to_string());
    }

    pub fn clear_failures(&self) {
        self.lock().fail_on.clear();
    }

    /// Statements passed to `execute`, in order.
    pub fn executed(&self) -> Vec<String> {
        self.lock().executed.clone()
    }

    /// Row queries issued so far.
    pub fn fetches(&self) -> Vec<BoundQuery> {
        self.lock().fetches.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_failure(state: &MockState, sql: &str) -> Result<(), DbError> {
        match state.fail_on.iter().find(|p| sql.contains(p.as_str())) {
            Some(p) => Err(DbError::Query(format!("ERROR: scripted failure on {p}"))),
            None => Ok(()),
        }
    }
}

/// Rows newer than the query's `$1` watermark; all rows if it is missing.
fn newer_than<'a, T>(rows: &'a [T], query: &BoundQuery, ts: impl Fn(&T) -> &str) -> Vec<&'a T> {
    let watermark = query.params.first().and_then(|p| parse_timestamp(p));
    rows.iter()
        .filter(|row| match (watermark, parse_timestamp(ts(*row))) {
            (Some(w), Some(t)) => t > w,
            _ => true,
        })
        .collect()
}

impl Session for MockSession {
    fn query_scalar(&mut self, sql: &str) -> Result<Option<String>, DbError> {
        let state = self.lock();
        Self::check_failure(&state, sql)?;
        if sql == queries::STORE_PLANS_FORK {
            return Ok(state.store_plans_fork_column.then(|| "1".to_string()));
        }
        let setting = sql
            .strip_prefix(queries::COLLECTOR_QUERY_TAG)
            .map(str::trim)
            .and_then(|s| s.strip_prefix("SHOW "));
        match setting {
            Some(name) => Ok(state.settings.get(name.trim()).cloned()),
            None => Err(DbError::Query(format!("unexpected scalar query: {sql}"))),
        }
    }

    fn query_column(&mut self, sql: &str) -> Result<Vec<String>, DbError> {
        let state = self.lock();
        Self::check_failure(&state, sql)?;
        if sql == queries::AVAILABLE_EXTENSIONS {
            Ok(state.extensions.clone())
        } else if sql == queries::DATABASE_NAMES {
            Ok(state.databases.clone())
        } else {
            Err(DbError::Query(format!("unexpected column query: {sql}")))
        }
    }

    fn execute(&mut self, sql: &str) -> Result<(), DbError> {
        let mut state = self.lock();
        state.executed.push(sql.to_string());
        Self::check_failure(&state, sql)
    }

    fn log_rows(&mut self, query: &BoundQuery) -> Result<Vec<LogRow>, DbError> {
        let mut state = self.lock();
        state.fetches.push(query.clone());
        Self::check_failure(&state, &query.sql)?;
        Ok(newer_than(&state.log_rows, query, |r| r.log_time.as_str())
            .into_iter()
            .cloned()
            .collect())
    }

    fn plan_rows(&mut self, query: &BoundQuery) -> Result<Vec<PlanRow>, DbError> {
        let mut state = self.lock();
        state.fetches.push(query.clone());
        Self::check_failure(&state, &query.sql)?;
        Ok(newer_than(&state.plan_rows, query, |r| r.last_call.as_str())
            .into_iter()
            .cloned()
            .collect())
    }
}

/// Hands out clones of registered sessions by connection string.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    sessions: HashMap<String, MockSession>,
    connects: Arc<Mutex<Vec<String>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(mut self, connection_string: &str, session: MockSession) -> Self {
        self.sessions.insert(connection_string.to_string(), session);
        self
    }

    /// Connection strings requested so far, including refused ones.
    pub fn connects(&self) -> Vec<String> {
        self.connects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Connector for MockConnector {
    fn connect(&self, connection_string: &str) -> Result<Box<dyn Session>, DbError> {
        self.connects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(connection_string.to_string());
        match self.sessions.get(connection_string) {
            Some(session) => Ok(Box::new(session.clone())),
            None => Err(DbError::Connection("connection refused".to_string())),
        }
    }
}
