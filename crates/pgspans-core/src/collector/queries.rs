//! SQL issued by the collector.
//!
//! Every statement starts with [`COLLECTOR_QUERY_TAG`] so the parser can tell the
//! collector's own traffic apart when it shows up in the logs it reads.

/// Leading comment on every statement the collector sends.
pub const COLLECTOR_QUERY_TAG: &str = "/* pgspans */";

/// Lowest supported `server_version_num`.
pub(crate) const MIN_SERVER_VERSION_NUM: i32 = 140000;

/// Relation the log materialisation functions maintain.
pub(crate) const LOG_RELATION: &str = "logs.postgres_logs";

macro_rules! tagged {
    ($sql:literal) => {
        concat!("/* pgspans */ ", $sql)
    };
}

pub(crate) const SERVER_VERSION: &str = tagged!("SHOW server_version_num");

pub(crate) const AVAILABLE_EXTENSIONS: &str = tagged!(
    "SELECT name::text FROM pg_available_extensions \
     WHERE name IN ('pg_store_plans', 'log_fdw', 'file_fdw') ORDER BY name"
);

pub(crate) const DATABASE_NAMES: &str = tagged!(
    "SELECT datname::text FROM pg_database \
     WHERE NOT datistemplate AND datallowconn ORDER BY datname"
);

pub(crate) const STORE_PLANS_FORK: &str = tagged!(
    "SELECT 1::text FROM information_schema.columns \
     WHERE table_name = 'pg_store_plans' AND column_name = 'queryid_stat_statements'"
);

pub(crate) const RELOAD_CONF: &str = tagged!("SELECT pg_reload_conf()");

/// `SHOW <setting>`. Names come from the handlers' fixed prerequisite lists.
pub(crate) fn show_setting(name: &str) -> String {
    format!("{COLLECTOR_QUERY_TAG} SHOW {name}")
}

pub(crate) fn create_extension(name: &str) -> String {
    format!("{COLLECTOR_QUERY_TAG} CREATE EXTENSION IF NOT EXISTS {name}")
}

fn alter_system(setting: &str, value: &str) -> String {
    format!("{COLLECTOR_QUERY_TAG} ALTER SYSTEM SET {setting} = {value}")
}

/// Plan-store setup: both extensions, JSON plans with timing, reload.
pub(crate) fn store_plans_bootstrap() -> Vec<String> {
    vec![
        create_extension("pg_stat_statements"),
        create_extension("pg_store_plans"),
        alter_system("pg_store_plans.plan_format", "'json'"),
        alter_system("pg_store_plans.log_analyze", "on"),
        alter_system("pg_store_plans.log_timing", "on"),
        RELOAD_CONF.to_string(),
    ]
}

/// auto_explain and csv logging setup shared by both log wrappers.
pub(crate) fn log_bootstrap(sample_rate: f64) -> Vec<String> {
    vec![
        alter_system("session_preload_libraries", "'auto_explain'"),
        alter_system("auto_explain.log_min_duration", "0"),
        alter_system("auto_explain.log_analyze", "on"),
        alter_system("auto_explain.log_buffers", "on"),
        alter_system("auto_explain.log_timing", "on"),
        alter_system("auto_explain.log_verbose", "on"),
        alter_system("auto_explain.log_nested_statements", "on"),
        alter_system("auto_explain.log_format", "'json'"),
        alter_system("auto_explain.sample_rate", &sample_rate.to_string()),
        alter_system("log_statement", "'mod'"),
        alter_system("log_destination", "'stderr,csvlog'"),
        alter_system("log_rotation_age", "60"),
        alter_system("log_min_duration_statement", "0"),
        RELOAD_CONF.to_string(),
    ]
}

/// Column list of a PostgreSQL 14+ csvlog file.
const CSVLOG_COLUMNS: &str = "\
    log_time timestamp(3) with time zone, user_name text, database_name text, \
    process_id integer, connection_from text, session_id text, session_line_num bigint, \
    command_tag text, session_start_time timestamp with time zone, \
    virtual_transaction_id text, transaction_id bigint, error_severity text, \
    sql_state_code text, message text, detail text, hint text, internal_query text, \
    internal_query_pos integer, context text, query text, query_pos integer, \
    location text, application_name text, backend_type text, leader_pid integer, \
    query_id bigint";

pub(crate) const LOG_FDW_LOAD_FUNCTION: &str = "public.pgspans_load_log_fdw()";
pub(crate) const FILE_FDW_LOAD_FUNCTION: &str = "public.pgspans_load_file_fdw()";

/// Rebuilds `logs.postgres_logs` from the two newest csv files via log_fdw.
pub(crate) const LOG_FDW_CREATE_FUNCTION: &str = tagged!(
    r#"
    CREATE OR REPLACE FUNCTION public.pgspans_load_log_fdw()
    RETURNS text AS $$
    DECLARE
        v_file text;
        v_part text;
        v_first boolean := true;
    BEGIN
        CREATE SCHEMA IF NOT EXISTS logs;
        IF NOT EXISTS (SELECT 1 FROM pg_foreign_server WHERE srvname = 'pgspans_log_server') THEN
            CREATE SERVER pgspans_log_server FOREIGN DATA WRAPPER log_fdw;
        END IF;
        PERFORM set_config('client_min_messages', 'warning', true);
        PERFORM set_config('search_path', 'logs', true);
        DROP TABLE IF EXISTS logs.postgres_logs CASCADE;
        FOR v_file IN
            SELECT file_name FROM public.list_postgres_log_files()
            WHERE file_name LIKE '%.csv' ORDER BY 1 DESC LIMIT 2
        LOOP
            v_part := 'postgres_logs_' || md5(v_file);
            EXECUTE format('DROP FOREIGN TABLE IF EXISTS logs.%I', v_part);
            PERFORM public.create_foreign_table_for_log_file(v_part, 'pgspans_log_server', v_file);
            IF v_first THEN
                EXECUTE format('CREATE TABLE logs.postgres_logs (LIKE logs.%I)', v_part);
                v_first := false;
            END IF;
            EXECUTE format('ALTER TABLE logs.%I INHERIT logs.postgres_logs', v_part);
        END LOOP;
        RETURN 'logs.postgres_logs';
    END;
    $$ LANGUAGE plpgsql
    "#
);

/// Points `logs.postgres_logs` at the server's current csvlog file via file_fdw.
pub(crate) fn file_fdw_create_function() -> String {
    format!(
        r#"{COLLECTOR_QUERY_TAG}
    CREATE OR REPLACE FUNCTION public.pgspans_load_file_fdw()
    RETURNS text AS $$
    DECLARE
        v_file text := pg_current_logfile('csvlog');
    BEGIN
        IF v_file IS NULL THEN
            RAISE EXCEPTION 'csvlog is not an active log destination';
        END IF;
        CREATE SCHEMA IF NOT EXISTS logs;
        IF NOT EXISTS (SELECT 1 FROM pg_foreign_server WHERE srvname = 'pgspans_file_server') THEN
            CREATE SERVER pgspans_file_server FOREIGN DATA WRAPPER file_fdw;
        END IF;
        PERFORM set_config('client_min_messages', 'warning', true);
        DROP FOREIGN TABLE IF EXISTS logs.postgres_logs;
        EXECUTE format(
            'CREATE FOREIGN TABLE logs.postgres_logs ({CSVLOG_COLUMNS}) '
            'SERVER pgspans_file_server OPTIONS (filename %L, format %L)',
            v_file, 'csv');
        RETURN v_file;
    END;
    $$ LANGUAGE plpgsql
    "#
    )
}

pub(crate) fn call_function(function: &str) -> String {
    format!("{COLLECTOR_QUERY_TAG} SELECT {function}")
}

/// Log rows newer than `$1`: auto_explain plan records plus BIND/PARSE records
/// used for query-id inference. `$2` is the database filter when present.
pub(crate) fn build_log_fetch_query(by_trace: bool, by_database: bool) -> String {
    let trace_filter = if by_trace {
        "AND message LIKE '%traceparent=%'"
    } else {
        ""
    };
    let database_filter = if by_database {
        "AND database_name = $2"
    } else {
        ""
    };

    format!(
        r#"{COLLECTOR_QUERY_TAG}
            SELECT
                to_char(log_time AT TIME ZONE 'UTC', 'YYYY-MM-DD HH24:MI:SS.US') as log_time,
                COALESCE(database_name, '') as database_name,
                COALESCE(command_tag, '') as command_tag,
                COALESCE(virtual_transaction_id, '') as virtual_transaction_id,
                COALESCE(message, '') as message,
                detail,
                internal_query,
                COALESCE(query_id, 0)::text as query_id
            FROM {LOG_RELATION}
            WHERE log_time > $1::text::timestamptz
              AND (
                    (command_tag IN ('SELECT', 'UPDATE', 'INSERT', 'DELETE')
                     AND message LIKE '%plan:%' {trace_filter})
                    OR command_tag IN ('BIND', 'PARSE')
              )
              {database_filter}
            ORDER BY log_time
        "#
    )
}

/// pg_store_plans variant. The vadv fork links plans to statements through
/// `queryid_stat_statements`; upstream through `queryid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StorePlansFork {
    OsscDb,
    Vadv,
}

/// Stored plans last executed after `$1`, with the statement's mean time.
pub(crate) fn build_store_plans_fetch_query(
    fork: StorePlansFork,
    by_trace: bool,
    by_database: bool,
) -> String {
    let join_column = match fork {
        StorePlansFork::Vadv => "p.queryid_stat_statements",
        StorePlansFork::OsscDb => "p.queryid",
    };
    let trace_filter = if by_trace {
        "AND s.query LIKE '%traceparent=%'"
    } else {
        ""
    };
    let database_filter = if by_database {
        "AND d.datname::text = $2"
    } else {
        ""
    };

    format!(
        r#"{COLLECTOR_QUERY_TAG}
            SELECT
                COALESCE(s.query, '') as query,
                COALESCE(p.plan, '') as plan,
                to_char(p.last_call AT TIME ZONE 'UTC', 'YYYY-MM-DD HH24:MI:SS.US') as last_call,
                s.mean_exec_time::double precision as duration,
                s.queryid::text as query_id,
                d.datname::text as database_name
            FROM pg_store_plans p
            JOIN pg_stat_statements s
                ON s.queryid = {join_column} AND s.dbid = p.dbid AND s.userid = p.userid
            JOIN pg_database d ON d.oid = p.dbid
            WHERE p.last_call > $1::text::timestamptz
              {trace_filter}
              {database_filter}
            ORDER BY p.last_call
        "#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_statement_is_tagged() {
        let mut all: Vec<String> = vec![
            SERVER_VERSION.to_string(),
            AVAILABLE_EXTENSIONS.to_string(),
            DATABASE_NAMES.to_string(),
            STORE_PLANS_FORK.to_string(),
            LOG_FDW_CREATE_FUNCTION.to_string(),
            file_fdw_create_function(),
            show_setting("logging_collector"),
            call_function(LOG_FDW_LOAD_FUNCTION),
            build_log_fetch_query(true, true),
            build_store_plans_fetch_query(StorePlansFork::Vadv, true, true),
        ];
        all.extend(store_plans_bootstrap());
        all.extend(log_bootstrap(1.0));
        for sql in all {
            assert!(sql.trim_start().starts_with(COLLECTOR_QUERY_TAG), "{sql}");
        }
    }

    #[test]
    fn log_fetch_query_filters() {
        let q = build_log_fetch_query(false, false);
        assert!(q.contains("log_time > $1::text::timestamptz"));
        assert!(q.contains("OR command_tag IN ('BIND', 'PARSE')"));
        assert!(q.contains("ORDER BY log_time"));
        assert!(!q.contains("traceparent"));
        assert!(!q.contains("$2"));

        let q = build_log_fetch_query(true, true);
        assert!(q.contains("AND message LIKE '%traceparent=%'"));
        assert!(q.contains("AND database_name = $2"));
    }

    #[test]
    fn store_plans_query_joins_on_fork_column() {
        let q = build_store_plans_fetch_query(StorePlansFork::Vadv, false, false);
        assert!(q.contains("s.queryid = p.queryid_stat_statements"));
        let q = build_store_plans_fetch_query(StorePlansFork::OsscDb, false, true);
        assert!(q.contains("s.queryid = p.queryid AND"));
        assert!(q.contains("AND d.datname::text = $2"));
        assert!(q.contains("ORDER BY p.last_call"));
    }

    #[test]
    fn log_bootstrap_sets_sample_rate() {
        let stmts = log_bootstrap(0.25);
        assert!(
            stmts
                .iter()
                .any(|s| s.ends_with("auto_explain.sample_rate = 0.25"))
        );
        assert_eq!(stmts.last().map(String::as_str), Some(RELOAD_CONF));
    }

    #[test]
    fn file_fdw_function_embeds_csvlog_columns() {
        let f = file_fdw_create_function();
        assert!(f.contains("pg_current_logfile('csvlog')"));
        assert!(f.contains("query_id bigint"));
    }
}
