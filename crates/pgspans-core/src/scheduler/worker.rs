//! Per-target state machine, driven one blocking step at a time.
//!
//! ```text
//! Uninitialized → Detecting → Bootstrapping → Idle ⇄ Fetching → Stopped
//!                     │              │
//!                     └──────────────┴──→ Unavailable(reason)
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::collector::queries::DATABASE_NAMES;
use crate::collector::{
    BackendHandler, BackendKind, BootstrapOptions, Connector, FetchFilters, Session, detect,
    handler_for, replace_dbname,
};
use crate::config::CollectorConfig;
use crate::error::{DbError, Unavailable};
use crate::model::{RawRecords, SpanRecord, Target};
use crate::parser::{ParseContext, parse_log_rows, parse_plan_rows};
use crate::state::{Cursor, DedupWindow};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetState {
    Uninitialized,
    Detecting,
    Bootstrapping,
    Idle,
    Fetching,
    Stopped,
    Unavailable(Unavailable),
}

/// Snapshot of one target, readable while its cycles run.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetStatus {
    pub target: String,
    pub state: TargetState,
    pub backend: Option<BackendKind>,
    pub watermark: DateTime<Utc>,
    pub cycles: u64,
    pub failed_cycles: u64,
    pub spans_collected: u64,
    pub batches_exported: u64,
    pub batches_failed: u64,
    pub last_error: Option<String>,
}

pub(crate) type SharedStatus = Arc<Mutex<TargetStatus>>;

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Error)]
pub enum CycleError {
    /// Terminal: the target is excluded from scheduling.
    #[error("target unavailable: {0}")]
    Unavailable(Unavailable),
    /// Initialization did not finish; retried on the next tick.
    #[error("target not ready: {0}")]
    NotReady(Unavailable),
    /// Cycle skipped, cursor unchanged.
    #[error("fetch failed: {0}")]
    Fetch(DbError),
}

/// Output of one successful cycle.
#[derive(Debug, Default)]
pub struct Collected {
    pub rows: usize,
    pub spans: Vec<SpanRecord>,
    /// `spans` serialized, same order.
    pub payloads: Vec<String>,
}

pub struct TargetWorker {
    target: Target,
    connector: Arc<dyn Connector>,
    session: Option<Box<dyn Session>>,
    handler: Option<Box<dyn BackendHandler>>,
    cursor: Cursor,
    dedup: DedupWindow,
    filters: FetchFilters,
    parse_ctx: ParseContext,
    precedence: Vec<BackendKind>,
    bootstrap: BootstrapOptions,
    bootstrap_all_databases: bool,
    status: SharedStatus,
}

impl TargetWorker {
    pub fn new(target: Target, config: &CollectorConfig, connector: Arc<dyn Connector>) -> Self {
        let cursor = Cursor::starting_at(Utc::now());
        let status = Arc::new(Mutex::new(TargetStatus {
            target: target.name.clone(),
            state: TargetState::Uninitialized,
            backend: None,
            watermark: cursor.watermark(),
            cycles: 0,
            failed_cycles: 0,
            spans_collected: 0,
            batches_exported: 0,
            batches_failed: 0,
            last_error: None,
        }));
        Self {
            filters: config.fetch_filters(&target),
            parse_ctx: ParseContext {
                host: target.host.clone(),
                service_name: config.service_name.clone(),
            },
            target,
            connector,
            session: None,
            handler: None,
            cursor,
            dedup: DedupWindow::new(config.dedup_ttl),
            precedence: config.backend_precedence.clone(),
            bootstrap: config.bootstrap_options(),
            bootstrap_all_databases: config.bootstrap_all_databases,
            status,
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    pub fn state(&self) -> TargetState {
        lock(&self.status).state.clone()
    }

    pub(crate) fn status_handle(&self) -> SharedStatus {
        Arc::clone(&self.status)
    }

    fn set_state(&self, state: TargetState) {
        lock(&self.status).state = state;
    }

    fn record_error(&self, error: &impl ToString) {
        lock(&self.status).last_error = Some(error.to_string());
    }

    /// Detects the backend, checks prerequisites and prepares the server.
    ///
    /// No-op once past initialization.
    pub fn initialize(&mut self) -> Result<(), CycleError> {
        match self.state() {
            TargetState::Uninitialized => {}
            TargetState::Unavailable(reason) => return Err(CycleError::Unavailable(reason)),
            _ => return Ok(()),
        }

        self.set_state(TargetState::Detecting);
        let mut session = match self.take_session() {
            Ok(s) => s,
            Err(e) => {
                self.set_state(TargetState::Uninitialized);
                return Err(self.not_ready(Unavailable::Connect(e)));
            }
        };

        let kind = match detect(session.as_mut(), &self.precedence) {
            Ok(Some(kind)) => kind,
            Ok(None) => return Err(self.unavailable(Unavailable::NoBackend)),
            Err(e) => {
                self.set_state(TargetState::Uninitialized);
                return Err(self.not_ready(Unavailable::Detection(e)));
            }
        };

        let mut handler = handler_for(kind, self.bootstrap);
        if !handler.check_availability(session.as_mut()) {
            return Err(self.unavailable(Unavailable::Prerequisites(kind)));
        }

        self.set_state(TargetState::Bootstrapping);
        handler.bootstrap(session.as_mut());
        if self.bootstrap_all_databases {
            self.bootstrap_other_databases(session.as_mut(), handler.as_mut());
        }

        info!(target = %self.target.name, backend = %kind, "target ready");
        lock(&self.status).backend = Some(kind);
        self.session = Some(session);
        self.handler = Some(handler);
        self.set_state(TargetState::Idle);
        Ok(())
    }

    /// Creates extensions in every connectable database, not only the target's.
    fn bootstrap_other_databases(
        &self,
        session: &mut dyn Session,
        handler: &mut dyn BackendHandler,
    ) {
        let databases = match session.query_column(DATABASE_NAMES) {
            Ok(dbs) => dbs,
            Err(e) => {
                warn!(target = %self.target.name, error = %e, "failed to list databases");
                return;
            }
        };
        for db in databases {
            let conn = replace_dbname(&self.target.connection_string, &db);
            match self.connector.connect(&conn) {
                Ok(mut other) => {
                    handler.bootstrap(other.as_mut());
                    debug!(target = %self.target.name, database = %db, "database bootstrapped");
                }
                Err(e) => {
                    warn!(target = %self.target.name, database = %db, error = %e,
                        "failed to connect for bootstrap");
                }
            }
        }
    }

    /// One fetch → parse → dedup → serialize step. Initializes first if needed.
    ///
    /// The cursor moves to the newest row timestamp whenever rows came back;
    /// on a fetch error it stays put so the next cycle retries the same range.
    pub fn cycle(&mut self) -> Result<Collected, CycleError> {
        self.initialize()?;

        let started = Instant::now();
        self.set_state(TargetState::Fetching);
        let result = self.fetch();
        self.set_state(TargetState::Idle);

        let records = match result {
            Ok(r) => r,
            Err(e) => {
                warn!(target = %self.target.name, error = %e, "fetch failed, cycle skipped");
                self.record_error(&e);
                let mut status = lock(&self.status);
                status.cycles += 1;
                status.failed_cycles += 1;
                return Err(CycleError::Fetch(e));
            }
        };

        let rows = records.len();
        let mut spans = match &records {
            RawRecords::Logs(rows) => parse_log_rows(rows, &self.parse_ctx),
            RawRecords::Plans(rows) => parse_plan_rows(rows, &self.parse_ctx),
        };
        if self.handler.as_ref().is_some_and(|h| h.deduplicates()) {
            spans = self.dedup.retain_unseen(spans);
        }
        self.cursor.advance_to_max(records.timestamps());

        let payloads = spans
            .iter()
            .filter_map(|span| match span.to_json() {
                Ok(json) => Some(json),
                Err(e) => {
                    debug!(target = %self.target.name, error = %e, "span not serializable");
                    None
                }
            })
            .collect();

        {
            let mut status = lock(&self.status);
            status.cycles += 1;
            status.spans_collected += spans.len() as u64;
            status.watermark = self.cursor.watermark();
        }
        debug!(
            target = %self.target.name,
            rows,
            spans = spans.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "cycle completed"
        );

        Ok(Collected {
            rows,
            spans,
            payloads,
        })
    }

    /// A failed fetch drops the session; the next cycle reconnects.
    fn fetch(&mut self) -> Result<RawRecords, DbError> {
        let mut session = self.take_session()?;
        let handler = self
            .handler
            .as_mut()
            .ok_or_else(|| DbError::Query("no backend selected".to_string()))?;
        let records = handler.fetch(session.as_mut(), &self.cursor, &self.filters)?;
        self.session = Some(session);
        Ok(records)
    }

    pub fn stop(&mut self) {
        self.session = None;
        let mut status = lock(&self.status);
        if !matches!(status.state, TargetState::Unavailable(_)) {
            status.state = TargetState::Stopped;
        }
    }

    fn take_session(&mut self) -> Result<Box<dyn Session>, DbError> {
        match self.session.take() {
            Some(s) => Ok(s),
            None => self.connector.connect(&self.target.connection_string),
        }
    }

    fn unavailable(&mut self, reason: Unavailable) -> CycleError {
        warn!(target = %self.target.name, reason = %reason, "target unavailable, excluded from scheduling");
        self.session = None;
        self.record_error(&reason);
        self.set_state(TargetState::Unavailable(reason.clone()));
        CycleError::Unavailable(reason)
    }

    fn not_ready(&self, reason: Unavailable) -> CycleError {
        warn!(target = %self.target.name, reason = %reason, "target initialization failed, will retry");
        self.record_error(&reason);
        CycleError::NotReady(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{MockConnector, MockSession};
    use crate::model::{LogRow, PlanRow};
    use chrono::TimeDelta;

    const CONN: &str = "host=db.internal dbname=shop";

    fn config() -> CollectorConfig {
        CollectorConfig::default()
            .with_database_url(CONN)
            .with_api_key("k")
            .with_service_name("checkout")
    }

    fn worker_with(session: &MockSession, config: &CollectorConfig) -> TargetWorker {
        let connector = MockConnector::new().with_session(CONN, session.clone());
        let target = config.targets().remove(0);
        TargetWorker::new(target, config, Arc::new(connector))
    }

    fn ts(offset_secs: i64) -> String {
        (Utc::now() + TimeDelta::seconds(offset_secs))
            .format("%Y-%m-%d %H:%M:%S%.6f")
            .to_string()
    }

    fn plan_log(log_time: &str, query: &str) -> LogRow {
        LogRow {
            log_time: log_time.to_string(),
            database_name: "shop".into(),
            command_tag: "SELECT".into(),
            virtual_transaction_id: "3/1".into(),
            message: format!(
                "duration: 12.500 ms  plan: {{\"Query Text\": \"{query}\", \"Plan\": {{\"Actual Total Time\": 10.2}}}}"
            ),
            query_id: "42".into(),
            ..Default::default()
        }
    }

    #[test]
    fn log_backend_cycle_emits_spans_and_advances_cursor() {
        let session = MockSession::log_ready("log_fdw");
        let newest = ts(-1);
        session.push_log_rows([plan_log(&ts(-2), "SELECT 1"), plan_log(&newest, "SELECT 2")]);
        let mut w = worker_with(&session, &config());

        let out = w.cycle().unwrap();
        assert_eq!(out.rows, 2);
        assert_eq!(out.spans.len(), 2);
        assert_eq!(out.payloads.len(), 2);
        assert_eq!(out.spans[0].duration, 10.2);
        assert_eq!(out.spans[0].attributes.host_name, "db.internal");
        assert_eq!(out.spans[0].resource.service_name, "checkout");
        assert_eq!(w.state(), TargetState::Idle);
        assert_eq!(
            w.cursor().watermark(),
            crate::parser::timestamp::parse_timestamp(&newest).unwrap()
        );

        // Nothing new: no spans, cursor unchanged.
        let before = *w.cursor();
        let out = w.cycle().unwrap();
        assert!(out.spans.is_empty());
        assert_eq!(*w.cursor(), before);
    }

    #[test]
    fn bootstrap_runs_once() {
        let session = MockSession::log_ready("file_fdw");
        let mut w = worker_with(&session, &config());
        w.cycle().unwrap();
        let after_first = session.executed().len();
        w.cycle().unwrap();
        // Only the per-fetch materialisation call is added.
        assert_eq!(session.executed().len(), after_first + 1);
    }

    #[test]
    fn fetch_failure_keeps_cursor_and_retries_range() {
        let session = MockSession::log_ready("log_fdw");
        session.push_log_rows([plan_log(&ts(-1), "SELECT 1")]);
        let mut w = worker_with(&session, &config());
        w.initialize().unwrap();
        let before = *w.cursor();

        session.fail_on("logs.postgres_logs");
        assert!(matches!(w.cycle(), Err(CycleError::Fetch(_))));
        assert_eq!(*w.cursor(), before);
        assert_eq!(w.state(), TargetState::Idle);

        session.clear_failures();
        let out = w.cycle().unwrap();
        assert_eq!(out.spans.len(), 1);

        let status = lock(&w.status_handle()).clone();
        assert_eq!(status.cycles, 2);
        assert_eq!(status.failed_cycles, 1);
    }

    #[test]
    fn no_backend_is_terminal() {
        let session = MockSession::new().with_setting("server_version_num", "160000");
        let mut w = worker_with(&session, &config());
        assert!(matches!(
            w.cycle(),
            Err(CycleError::Unavailable(Unavailable::NoBackend))
        ));
        assert_eq!(w.state(), TargetState::Unavailable(Unavailable::NoBackend));
        // Stays excluded.
        assert!(matches!(w.cycle(), Err(CycleError::Unavailable(_))));
        w.stop();
        assert_eq!(w.state(), TargetState::Unavailable(Unavailable::NoBackend));
    }

    #[test]
    fn unmet_prerequisites_are_terminal() {
        let session = MockSession::log_ready("log_fdw").with_setting("logging_collector", "off");
        let mut w = worker_with(&session, &config());
        assert!(matches!(
            w.cycle(),
            Err(CycleError::Unavailable(Unavailable::Prerequisites(BackendKind::LogFdw)))
        ));
        assert!(session.executed().is_empty());
    }

    #[test]
    fn connection_failure_is_retried() {
        let cfg = config();
        let target = cfg.targets().remove(0);
        let mut w = TargetWorker::new(target, &cfg, Arc::new(MockConnector::new()));
        assert!(matches!(
            w.cycle(),
            Err(CycleError::NotReady(Unavailable::Connect(_)))
        ));
        assert_eq!(w.state(), TargetState::Uninitialized);
    }

    #[test]
    fn collector_queries_are_not_emitted() {
        let session = MockSession::log_ready("log_fdw");
        session.push_log_rows([
            plan_log(&ts(-2), "/* pgspans */ SELECT 1"),
            plan_log(&ts(-1), "SELECT * FROM orders"),
        ]);
        let mut w = worker_with(&session, &config());
        let out = w.cycle().unwrap();
        assert_eq!(out.rows, 2);
        assert_eq!(out.spans.len(), 1);
        assert_eq!(out.spans[0].attributes.statement, "SELECT * FROM orders");
    }

    fn plan_row(last_call: &str, query_id: &str) -> PlanRow {
        PlanRow {
            query: "SELECT * FROM orders WHERE id = $1".into(),
            plan: r#"{"Plan": {"Actual Total Time": 1.5}}"#.into(),
            last_call: last_call.into(),
            duration: 2.0,
            query_id: query_id.into(),
            database_name: "shop".into(),
        }
    }

    #[test]
    fn store_plans_deduplicates_across_cycles() {
        let session = MockSession::store_plans_ready();
        session.push_plan_rows([plan_row(&ts(-3), "7"), plan_row(&ts(-2), "7")]);
        let mut w = worker_with(&session, &config());

        let out = w.cycle().unwrap();
        assert_eq!(out.rows, 2);
        assert_eq!(out.spans.len(), 1);

        session.push_plan_rows([plan_row(&ts(-1), "7"), plan_row(&ts(-1), "8")]);
        let out = w.cycle().unwrap();
        assert_eq!(out.spans.len(), 1);
        assert_eq!(out.spans[0].attributes.query_id, "8");
    }

    #[test]
    fn bootstrap_reaches_every_database() {
        let session = MockSession::store_plans_ready()
            .with_database("billing")
            .with_database("shop");
        let billing = MockSession::new();
        let connector = MockConnector::new()
            .with_session(CONN, session.clone())
            .with_session("host=db.internal dbname=billing", billing.clone());
        let cfg = config().with_bootstrap_all_databases(true);
        let mut w = TargetWorker::new(cfg.targets().remove(0), &cfg, Arc::new(connector.clone()));

        w.initialize().unwrap();
        assert!(!billing.executed().is_empty());
        assert!(
            connector
                .connects()
                .contains(&"host=db.internal dbname=billing".to_string())
        );
    }

    #[test]
    fn database_filter_is_bound() {
        let session = MockSession::log_ready("log_fdw");
        let cfg = config().with_database_filter("shop").with_by_trace(true);
        let mut w = worker_with(&session, &cfg);
        w.cycle().unwrap();
        let fetch = &session.fetches()[0];
        assert_eq!(fetch.params.len(), 2);
        assert_eq!(fetch.params[1], "shop");
        assert!(fetch.sql.contains("traceparent"));
    }
}
