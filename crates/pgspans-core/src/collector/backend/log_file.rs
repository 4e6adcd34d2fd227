//! auto_explain csvlog read through a foreign-data wrapper.
//!
//! `log_fdw` (managed services) and `file_fdw` differ only in how the log
//! relation is materialised; both expose it as `logs.postgres_logs`.

use tracing::debug;

use crate::collector::queries::{self, build_log_fetch_query};
use crate::collector::{BoundQuery, Session};
use crate::error::DbError;
use crate::model::RawRecords;
use crate::state::Cursor;

use super::{
    BackendHandler, BackendKind, BootstrapOptions, FetchFilters, RequiredSetting, run_each,
    server_version_supported, settings_satisfied,
};

const REQUIRED_SETTINGS: &[RequiredSetting] = &[
    RequiredSetting {
        name: "logging_collector",
        expected: "on",
    },
    RequiredSetting {
        name: "log_destination",
        expected: "csvlog",
    },
];

#[derive(Debug)]
pub struct LogFileHandler {
    kind: BackendKind,
    options: BootstrapOptions,
}

impl LogFileHandler {
    /// `kind` is [`BackendKind::LogFdw`] or [`BackendKind::FileFdw`].
    pub fn new(kind: BackendKind, options: BootstrapOptions) -> Self {
        Self { kind, options }
    }

    fn load_function(&self) -> &'static str {
        match self.kind {
            BackendKind::FileFdw => queries::FILE_FDW_LOAD_FUNCTION,
            _ => queries::LOG_FDW_LOAD_FUNCTION,
        }
    }

    fn create_function(&self) -> String {
        match self.kind {
            BackendKind::FileFdw => queries::file_fdw_create_function(),
            _ => queries::LOG_FDW_CREATE_FUNCTION.to_string(),
        }
    }

    fn bootstrap_statements(&self) -> Vec<String> {
        let mut stmts = vec![queries::create_extension(self.kind.extension())];
        stmts.extend(queries::log_bootstrap(self.options.sample_rate));
        stmts.push(self.create_function());
        stmts
    }
}

impl BackendHandler for LogFileHandler {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn check_availability(&mut self, session: &mut dyn Session) -> bool {
        let version_ok = server_version_supported(session);
        let settings_ok = settings_satisfied(session, REQUIRED_SETTINGS);
        version_ok && settings_ok
    }

    fn bootstrap(&mut self, session: &mut dyn Session) {
        let failed = run_each(session, &self.bootstrap_statements());
        debug!(backend = %self.kind, failed, "log bootstrap finished");
    }

    fn fetch(
        &mut self,
        session: &mut dyn Session,
        cursor: &Cursor,
        filters: &FetchFilters,
    ) -> Result<RawRecords, DbError> {
        session.execute(&queries::call_function(self.load_function()))?;

        let sql = build_log_fetch_query(filters.by_trace, filters.database.is_some());
        let mut query = BoundQuery::new(sql).bind(cursor.as_sql_param());
        if let Some(db) = &filters.database {
            query = query.bind(db.clone());
        }
        session.log_rows(&query).map(RawRecords::Logs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::MockSession;
    use crate::model::LogRow;
    use chrono::{TimeZone, Utc};

    fn handler(kind: BackendKind) -> LogFileHandler {
        LogFileHandler::new(kind, BootstrapOptions { sample_rate: 0.5 })
    }

    fn cursor() -> Cursor {
        Cursor::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
    }

    #[test]
    fn available_when_csv_logging_on() {
        let mut s = MockSession::log_ready("log_fdw");
        assert!(handler(BackendKind::LogFdw).check_availability(&mut s));
    }

    #[test]
    fn unavailable_without_logging_collector() {
        let mut s = MockSession::log_ready("file_fdw").with_setting("logging_collector", "off");
        assert!(!handler(BackendKind::FileFdw).check_availability(&mut s));
        let mut s = MockSession::log_ready("file_fdw").with_setting("log_destination", "stderr");
        assert!(!handler(BackendKind::FileFdw).check_availability(&mut s));
    }

    #[test]
    fn bootstrap_creates_extension_and_function() {
        let mut s = MockSession::log_ready("file_fdw");
        s.fail_on("ALTER SYSTEM");
        let mut h = handler(BackendKind::FileFdw);
        h.bootstrap(&mut s);
        let executed = s.executed();
        assert_eq!(executed[0], queries::create_extension("file_fdw"));
        assert!(executed.iter().any(|q| q.contains("auto_explain.sample_rate = 0.5")));
        assert!(
            executed
                .last()
                .is_some_and(|q| q.contains("pgspans_load_file_fdw"))
        );
    }

    #[test]
    fn fetch_materialises_then_selects() {
        let mut s = MockSession::log_ready("log_fdw");
        s.push_log_rows([LogRow {
            log_time: "2024-01-01 00:00:01".into(),
            command_tag: "SELECT".into(),
            ..Default::default()
        }]);
        let mut h = handler(BackendKind::LogFdw);
        let filters = FetchFilters {
            by_trace: true,
            database: None,
        };
        let records = h.fetch(&mut s, &cursor(), &filters).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(
            s.executed(),
            vec![queries::call_function(queries::LOG_FDW_LOAD_FUNCTION)]
        );
        assert!(s.fetches()[0].sql.contains("traceparent"));
        assert!(!h.deduplicates());
    }

    #[test]
    fn materialisation_failure_aborts_fetch() {
        let mut s = MockSession::log_ready("file_fdw");
        s.fail_on("pgspans_load_file_fdw");
        let mut h = handler(BackendKind::FileFdw);
        assert!(h.fetch(&mut s, &cursor(), &FetchFilters::default()).is_err());
        assert!(s.fetches().is_empty());
    }
}
