//! pgspansd - slow query collector daemon.
//!
//! Polls PostgreSQL servers for auto_explain output or stored plans, turns
//! each captured execution into a span and ships the spans to the ingestion
//! endpoint. Every option can come from the command line or the environment.

use std::process::ExitCode;

use clap::Parser;
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

use pgspans_core::config::{
    ENV_API_KEY, ENV_AUTO_RUN, ENV_BACKEND_PRECEDENCE, ENV_BATCH_BYTES, ENV_BOOTSTRAP_ALL_DATABASES,
    ENV_BY_TRACE, ENV_DATABASE_URL, ENV_DB_NAME, ENV_DEBUG, ENV_DEDUP_TTL, ENV_EXPORT_RESULTS,
    ENV_EXPORT_TIMEOUT, ENV_EXPORTER_URL, ENV_FETCH_INTERVAL, ENV_SAMPLE_RATE, ENV_SERVICE_NAME,
};
use pgspans_core::{CollectorConfig, Scheduler};

/// Slow query collector daemon.
#[derive(Parser, Debug)]
#[command(name = "pgspansd", about = "PostgreSQL slow query to span collector", version = pgspans_core::VERSION)]
struct Args {
    /// Comma-separated PostgreSQL connection strings, one per target. Commas
    /// inside multi-host URLs or quoted option values do not split.
    #[arg(long, env = ENV_DATABASE_URL, hide_env_values = true)]
    database_url: Option<String>,

    /// Ingestion API key.
    #[arg(long, env = ENV_API_KEY, hide_env_values = true)]
    api_key: Option<String>,

    /// Milliseconds between polls of each target.
    #[arg(long, env = ENV_FETCH_INTERVAL)]
    fetch_interval: Option<String>,

    /// Ingestion endpoint.
    #[arg(long, env = ENV_EXPORTER_URL)]
    exporter_url: Option<String>,

    /// `service.name` reported on every span.
    #[arg(long, env = ENV_SERVICE_NAME)]
    service_name: Option<String>,

    /// Only collect statements of this database.
    #[arg(long, env = ENV_DB_NAME)]
    db_name: Option<String>,

    /// Only collect statements carrying a traceparent comment.
    #[arg(long, env = ENV_BY_TRACE)]
    by_trace: Option<String>,

    /// Debug logging, same as -v.
    #[arg(long, env = ENV_DEBUG)]
    debug: Option<String>,

    /// Poll continuously (true) or run a single cycle and exit (false).
    #[arg(long, env = ENV_AUTO_RUN)]
    auto_run: Option<String>,

    /// auto_explain.sample_rate applied during bootstrap.
    #[arg(long, env = ENV_SAMPLE_RATE)]
    log_sample_rate: Option<String>,

    /// Ship spans to the endpoint (false only logs them).
    #[arg(long, env = ENV_EXPORT_RESULTS)]
    export_results: Option<String>,

    /// Upper bound of one export request body, in bytes.
    #[arg(long, env = ENV_BATCH_BYTES)]
    batch_bytes: Option<String>,

    /// Seconds a pg_store_plans query id stays suppressed after being emitted.
    #[arg(long, env = ENV_DEDUP_TTL)]
    dedup_ttl: Option<String>,

    /// Export request timeout in seconds.
    #[arg(long, env = ENV_EXPORT_TIMEOUT)]
    export_timeout: Option<String>,

    /// Comma-separated log source order, e.g. "pg_store_plans,log_fdw,file_fdw".
    #[arg(long, env = ENV_BACKEND_PRECEDENCE)]
    backend_precedence: Option<String>,

    /// Create extensions in every database of each server during bootstrap.
    #[arg(long, env = ENV_BOOTSTRAP_ALL_DATABASES)]
    bootstrap_all_databases: Option<String>,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    fn lookup(&self, key: &str) -> Option<String> {
        let value = match key {
            ENV_DATABASE_URL => &self.database_url,
            ENV_API_KEY => &self.api_key,
            ENV_FETCH_INTERVAL => &self.fetch_interval,
            ENV_EXPORTER_URL => &self.exporter_url,
            ENV_SERVICE_NAME => &self.service_name,
            ENV_DB_NAME => &self.db_name,
            ENV_BY_TRACE => &self.by_trace,
            ENV_DEBUG => &self.debug,
            ENV_AUTO_RUN => &self.auto_run,
            ENV_SAMPLE_RATE => &self.log_sample_rate,
            ENV_EXPORT_RESULTS => &self.export_results,
            ENV_BATCH_BYTES => &self.batch_bytes,
            ENV_DEDUP_TTL => &self.dedup_ttl,
            ENV_EXPORT_TIMEOUT => &self.export_timeout,
            ENV_BACKEND_PRECEDENCE => &self.backend_precedence,
            ENV_BOOTSTRAP_ALL_DATABASES => &self.bootstrap_all_databases,
            _ => return None,
        };
        value.clone()
    }

    fn config(&self) -> CollectorConfig {
        CollectorConfig::from_lookup(|key| self.lookup(key))
    }
}

/// Initializes the tracing subscriber with the appropriate log level.
/// Default level is INFO. `debug` raises it like -v; -q wins over both.
fn init_logging(verbose: u8, quiet: bool, debug: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose.max(u8::from(debug)) {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for crate_name in ["pgspansd", "pgspans_core"] {
        if let Ok(directive) = format!("{crate_name}={level}").parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let args = Args::parse();
    let config = args.config();

    init_logging(args.verbose, args.quiet, config.debug);

    info!("pgspansd {} starting", pgspans_core::VERSION);
    for problem in config.validate() {
        warn!(%problem, "configuration problem");
    }

    let targets = config.targets();
    if targets.is_empty() {
        error!("no valid database targets configured, collector stays idle");
    }
    for target in &targets {
        info!(target = %target.name, "target configured");
    }
    info!(
        interval_ms = config.fetch_interval.as_millis() as u64,
        exporter = %config.exporter_url,
        export = config.export_results,
        auto_run = config.auto_run,
        "configuration loaded"
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start async runtime");
            return ExitCode::FAILURE;
        }
    };

    let scheduler = match Scheduler::from_config(config) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to build exporter");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(run(scheduler));
    ExitCode::SUCCESS
}

async fn run(scheduler: Scheduler) {
    if !scheduler.config().auto_run {
        let spans = scheduler.run_once().await;
        info!(spans = spans.len(), "single run complete");
        return;
    }

    let mut handle = scheduler.start();
    let stop = handle.stop_signal();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        stop.stop();
    }) {
        warn!("Failed to set Ctrl-C handler: {}", e);
    }

    handle.join().await;
    if !handle.stop_requested() {
        warn!("no target is being polled, idle until shutdown");
        handle.stopped().await;
    }
    info!("Shutdown complete");
}
