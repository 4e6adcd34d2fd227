//! pg_store_plans: stored plans joined with pg_stat_statements.

use tracing::debug;

use crate::collector::queries::{self, StorePlansFork, build_store_plans_fetch_query};
use crate::collector::{BoundQuery, Session};
use crate::error::DbError;
use crate::model::RawRecords;
use crate::state::Cursor;

use super::{
    BackendHandler, BackendKind, FetchFilters, RequiredSetting, run_each, server_version_supported,
    settings_satisfied,
};

const REQUIRED_SETTINGS: &[RequiredSetting] = &[RequiredSetting {
    name: "shared_preload_libraries",
    expected: "pg_store_plans",
}];

#[derive(Debug, Default)]
pub struct StorePlansHandler {
    /// Detected on first fetch, kept for the session's lifetime.
    fork: Option<StorePlansFork>,
}

impl StorePlansHandler {
    pub fn new() -> Self {
        Self::default()
    }

    fn fork(&mut self, session: &mut dyn Session) -> StorePlansFork {
        if let Some(fork) = self.fork {
            return fork;
        }
        let fork = detect_fork(session);
        debug!(fork = ?fork, "pg_store_plans variant detected");
        self.fork = Some(fork);
        fork
    }
}

impl BackendHandler for StorePlansHandler {
    fn kind(&self) -> BackendKind {
        BackendKind::PgStorePlans
    }

    fn check_availability(&mut self, session: &mut dyn Session) -> bool {
        // Both run so every unmet requirement is logged.
        let version_ok = server_version_supported(session);
        let settings_ok = settings_satisfied(session, REQUIRED_SETTINGS);
        version_ok && settings_ok
    }

    fn bootstrap(&mut self, session: &mut dyn Session) {
        let failed = run_each(session, &queries::store_plans_bootstrap());
        debug!(failed, "pg_store_plans bootstrap finished");
    }

    fn fetch(
        &mut self,
        session: &mut dyn Session,
        cursor: &Cursor,
        filters: &FetchFilters,
    ) -> Result<RawRecords, DbError> {
        let fork = self.fork(session);
        let sql =
            build_store_plans_fetch_query(fork, filters.by_trace, filters.database.is_some());
        let mut query = BoundQuery::new(sql).bind(cursor.as_sql_param());
        if let Some(db) = &filters.database {
            query = query.bind(db.clone());
        }
        session.plan_rows(&query).map(RawRecords::Plans)
    }

    fn deduplicates(&self) -> bool {
        true
    }
}

/// Checks for the vadv-specific column.
fn detect_fork(session: &mut dyn Session) -> StorePlansFork {
    match session.query_scalar(queries::STORE_PLANS_FORK) {
        Ok(Some(_)) => StorePlansFork::Vadv,
        _ => StorePlansFork::OsscDb,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::MockSession;
    use crate::model::PlanRow;
    use chrono::{TimeZone, Utc};

    fn cursor() -> Cursor {
        Cursor::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
    }

    fn row(last_call: &str) -> PlanRow {
        PlanRow {
            query: "SELECT 1".into(),
            plan: r#"{"Plan": {}}"#.into(),
            last_call: last_call.into(),
            duration: 1.0,
            query_id: "1".into(),
            database_name: "shop".into(),
        }
    }

    #[test]
    fn available_with_preload() {
        let mut s = MockSession::store_plans_ready();
        assert!(StorePlansHandler::new().check_availability(&mut s));
    }

    #[test]
    fn unavailable_without_preload_or_on_old_server() {
        let mut s = MockSession::store_plans_ready().with_setting("shared_preload_libraries", "");
        assert!(!StorePlansHandler::new().check_availability(&mut s));
        let mut s = MockSession::store_plans_ready().with_setting("server_version_num", "130000");
        assert!(!StorePlansHandler::new().check_availability(&mut s));
    }

    #[test]
    fn bootstrap_survives_failures() {
        let mut s = MockSession::store_plans_ready();
        s.fail_on("pg_stat_statements");
        StorePlansHandler::new().bootstrap(&mut s);
        let executed = s.executed();
        assert_eq!(executed, queries::store_plans_bootstrap());
    }

    #[test]
    fn fetch_binds_cursor_and_filter() {
        let mut s = MockSession::store_plans_ready();
        s.push_plan_rows([row("2023-12-31 23:59:59"), row("2024-01-01 00:00:05")]);
        let mut h = StorePlansHandler::new();
        let filters = FetchFilters {
            by_trace: false,
            database: Some("shop".into()),
        };
        let records = h.fetch(&mut s, &cursor(), &filters).unwrap();
        assert_eq!(records.len(), 1);

        let fetches = s.fetches();
        assert_eq!(fetches[0].params, vec!["2024-01-01 00:00:00.000000+00", "shop"]);
        assert!(fetches[0].sql.contains("s.queryid = p.queryid AND"));
    }

    #[test]
    fn fetch_uses_fork_column_when_present() {
        let mut s = MockSession::store_plans_ready().with_store_plans_fork_column();
        let mut h = StorePlansHandler::new();
        h.fetch(&mut s, &cursor(), &FetchFilters::default()).unwrap();
        assert!(s.fetches()[0].sql.contains("p.queryid_stat_statements"));
        assert_eq!(s.fetches()[0].params.len(), 1);
    }

    #[test]
    fn fetch_error_propagates() {
        let mut s = MockSession::store_plans_ready();
        s.fail_on("pg_store_plans p");
        let mut h = StorePlansHandler::new();
        assert!(h.fetch(&mut s, &cursor(), &FetchFilters::default()).is_err());
        assert!(h.deduplicates());
    }
}
