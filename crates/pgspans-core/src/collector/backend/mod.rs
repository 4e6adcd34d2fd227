//! Server-side log sources.
//!
//! Exactly one handler is chosen per target by the detector. A handler checks
//! prerequisites, prepares the server once, then fetches rows on every cycle.

mod log_file;
mod store_plans;

use std::fmt;
use std::str::FromStr;

use tracing::{debug, warn};

use crate::error::{ConfigError, DbError};
use crate::model::RawRecords;
use crate::state::Cursor;

use super::Session;
use super::queries::{self, MIN_SERVER_VERSION_NUM};

pub use log_file::LogFileHandler;
pub use store_plans::StorePlansHandler;

/// Competing log sources, named after the extension each relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    PgStorePlans,
    LogFdw,
    FileFdw,
}

impl BackendKind {
    pub const DEFAULT_PRECEDENCE: [BackendKind; 3] =
        [BackendKind::PgStorePlans, BackendKind::LogFdw, BackendKind::FileFdw];

    pub fn extension(self) -> &'static str {
        match self {
            BackendKind::PgStorePlans => "pg_store_plans",
            BackendKind::LogFdw => "log_fdw",
            BackendKind::FileFdw => "file_fdw",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pg_store_plans" | "store_plans" => Ok(BackendKind::PgStorePlans),
            "log_fdw" => Ok(BackendKind::LogFdw),
            "file_fdw" => Ok(BackendKind::FileFdw),
            _ => Err(ConfigError::InvalidValue {
                name: "PGSPANS_BACKEND_PRECEDENCE",
                value: s.to_string(),
            }),
        }
    }
}

/// Narrowing pushed into the fetch SQL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchFilters {
    /// Only statements carrying a `traceparent=` comment.
    pub by_trace: bool,
    /// Only rows of this database.
    pub database: Option<String>,
}

/// Settings applied during bootstrap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BootstrapOptions {
    /// auto_explain.sample_rate, 0.0..=1.0.
    pub sample_rate: f64,
}

impl Default for BootstrapOptions {
    fn default() -> Self {
        Self { sample_rate: 1.0 }
    }
}

pub trait BackendHandler: Send {
    fn kind(&self) -> BackendKind;

    /// Server version and required settings. Logs each unmet requirement;
    /// a query failure counts as unmet.
    fn check_availability(&mut self, session: &mut dyn Session) -> bool;

    /// Idempotent server preparation. Statements run one by one; a failing
    /// statement is logged and skipped.
    fn bootstrap(&mut self, session: &mut dyn Session);

    /// Rows strictly newer than the cursor, oldest first.
    fn fetch(
        &mut self,
        session: &mut dyn Session,
        cursor: &Cursor,
        filters: &FetchFilters,
    ) -> Result<RawRecords, DbError>;

    /// Whether repeated rows for the same query id must be suppressed.
    fn deduplicates(&self) -> bool {
        false
    }
}

pub fn handler_for(kind: BackendKind, options: BootstrapOptions) -> Box<dyn BackendHandler> {
    match kind {
        BackendKind::PgStorePlans => Box::new(StorePlansHandler::new()),
        BackendKind::LogFdw | BackendKind::FileFdw => Box::new(LogFileHandler::new(kind, options)),
    }
}

/// A server setting that must equal, or contain, `expected`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RequiredSetting {
    pub name: &'static str,
    pub expected: &'static str,
}

pub(crate) fn server_version_supported(session: &mut dyn Session) -> bool {
    match session.query_scalar(queries::SERVER_VERSION) {
        Ok(Some(v)) => match v.trim().parse::<i32>() {
            Ok(num) if num >= MIN_SERVER_VERSION_NUM => true,
            Ok(num) => {
                warn!(server_version_num = num, "PostgreSQL 14 or later required");
                false
            }
            Err(_) => {
                warn!(server_version_num = %v, "unparseable server version");
                false
            }
        },
        Ok(None) => {
            warn!("server_version_num not reported");
            false
        }
        Err(e) => {
            warn!(error = %e, "failed to read server version");
            false
        }
    }
}

/// Checks every setting; does not stop at the first miss so all are reported.
pub(crate) fn settings_satisfied(session: &mut dyn Session, required: &[RequiredSetting]) -> bool {
    let mut ok = true;
    for req in required {
        let actual = session.query_scalar(&queries::show_setting(req.name));
        let met = matches!(&actual, Ok(Some(v)) if v == req.expected || v.contains(req.expected));
        if !met {
            let actual = match actual {
                Ok(v) => v.unwrap_or_default(),
                Err(e) => e.to_string(),
            };
            warn!(parameter = req.name, expected = req.expected, actual = %actual,
                "database parameter not set as required");
            ok = false;
        }
    }
    ok
}

/// Runs statements independently. Returns the number that failed.
pub(crate) fn run_each(session: &mut dyn Session, statements: &[String]) -> usize {
    let mut failed = 0;
    for sql in statements {
        if let Err(e) = session.execute(sql) {
            debug!(error = %e, statement = %sql, "bootstrap statement failed");
            failed += 1;
        }
    }
    failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::MockSession;

    #[test]
    fn kind_round_trips_through_names() {
        for kind in BackendKind::DEFAULT_PRECEDENCE {
            assert_eq!(kind.to_string().parse::<BackendKind>().unwrap(), kind);
        }
        assert_eq!(" LOG_FDW ".parse::<BackendKind>().unwrap(), BackendKind::LogFdw);
        assert!("pgaudit".parse::<BackendKind>().is_err());
    }

    #[test]
    fn version_gate() {
        let mut s = MockSession::new().with_setting("server_version_num", "140000");
        assert!(server_version_supported(&mut s));
        let mut s = MockSession::new().with_setting("server_version_num", "130011");
        assert!(!server_version_supported(&mut s));
        let mut s = MockSession::new();
        assert!(!server_version_supported(&mut s));
    }

    #[test]
    fn settings_accept_exact_or_contained() {
        let required = [
            RequiredSetting {
                name: "logging_collector",
                expected: "on",
            },
            RequiredSetting {
                name: "log_destination",
                expected: "csvlog",
            },
        ];
        let mut s = MockSession::new()
            .with_setting("logging_collector", "on")
            .with_setting("log_destination", "stderr,csvlog");
        assert!(settings_satisfied(&mut s, &required));

        let mut s = MockSession::new()
            .with_setting("logging_collector", "off")
            .with_setting("log_destination", "stderr");
        assert!(!settings_satisfied(&mut s, &required));
    }

    #[test]
    fn settings_query_failure_is_unmet() {
        let mut s = MockSession::new().with_setting("logging_collector", "on");
        s.fail_on("SHOW");
        let required = [RequiredSetting {
            name: "logging_collector",
            expected: "on",
        }];
        assert!(!settings_satisfied(&mut s, &required));
    }

    #[test]
    fn run_each_continues_past_failures() {
        let mut s = MockSession::new();
        s.fail_on("second");
        let stmts = vec!["first".to_string(), "second".to_string(), "third".to_string()];
        assert_eq!(run_each(&mut s, &stmts), 1);
        assert_eq!(s.executed(), stmts);
    }
}
