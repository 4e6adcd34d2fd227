//! Collector settings sourced from the environment.
//!
//! Malformed values never abort startup: they fall back to the default and are
//! reported by [`CollectorConfig::validate`], so the caller can log and go on.

use std::env;
use std::time::Duration;

use crate::collector::{BackendKind, BootstrapOptions, FetchFilters};
use crate::error::ConfigError;
use crate::export::{DEFAULT_BATCH_BYTES, DEFAULT_EXPORT_TIMEOUT, DEFAULT_EXPORTER_URL};
use crate::model::Target;
use crate::state::DEFAULT_DEDUP_TTL;

pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_API_KEY: &str = "METIS_API_KEY";
pub const ENV_FETCH_INTERVAL: &str = "LOG_FETCH_INTERVAL";
pub const ENV_EXPORTER_URL: &str = "METIS_EXPORTER_URL";
pub const ENV_SERVICE_NAME: &str = "METIS_SERVICE_NAME";
pub const ENV_DB_NAME: &str = "METIS_DB_NAME";
pub const ENV_BY_TRACE: &str = "METIS_BY_TRACE";
pub const ENV_DEBUG: &str = "METIS_DEBUG";
pub const ENV_AUTO_RUN: &str = "METIS_AUTO_RUN";
pub const ENV_SAMPLE_RATE: &str = "METIS_LOG_SAMPLE_RATE";
pub const ENV_EXPORT_RESULTS: &str = "METIS_EXPORT_RESULTS";
pub const ENV_BATCH_BYTES: &str = "PGSPANS_BATCH_BYTES";
pub const ENV_DEDUP_TTL: &str = "PGSPANS_DEDUP_TTL";
pub const ENV_EXPORT_TIMEOUT: &str = "PGSPANS_EXPORT_TIMEOUT";
pub const ENV_BACKEND_PRECEDENCE: &str = "PGSPANS_BACKEND_PRECEDENCE";
pub const ENV_BOOTSTRAP_ALL_DATABASES: &str = "PGSPANS_BOOTSTRAP_ALL_DATABASES";

/// Default poll interval.
pub const DEFAULT_FETCH_INTERVAL: Duration = Duration::from_millis(60_000);

#[derive(Debug, Clone, PartialEq)]
pub struct CollectorConfig {
    /// One or more connection strings, comma-separated.
    pub database_url: Option<String>,
    pub api_key: Option<String>,
    pub fetch_interval: Duration,
    pub exporter_url: String,
    pub service_name: String,
    pub database_filter: Option<String>,
    pub by_trace: bool,
    pub debug: bool,
    /// Poll periodically; otherwise run one cycle per target and stop.
    pub auto_run: bool,
    pub export_results: bool,
    pub sample_rate: f64,
    pub batch_bytes: usize,
    pub dedup_ttl: Duration,
    pub export_timeout: Duration,
    pub backend_precedence: Vec<BackendKind>,
    pub bootstrap_all_databases: bool,
    /// Values that failed to parse and were replaced by defaults.
    problems: Vec<ConfigError>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            api_key: None,
            fetch_interval: DEFAULT_FETCH_INTERVAL,
            exporter_url: DEFAULT_EXPORTER_URL.to_string(),
            service_name: String::new(),
            database_filter: None,
            by_trace: false,
            debug: false,
            auto_run: true,
            export_results: true,
            sample_rate: 1.0,
            batch_bytes: DEFAULT_BATCH_BYTES,
            dedup_ttl: DEFAULT_DEDUP_TTL,
            export_timeout: DEFAULT_EXPORT_TIMEOUT,
            backend_precedence: BackendKind::DEFAULT_PRECEDENCE.to_vec(),
            bootstrap_all_databases: false,
            problems: Vec::new(),
        }
    }
}

impl CollectorConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from any key lookup (environment, CLI, test map).
    /// Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut cfg = Self::default();

        cfg.database_url = get(ENV_DATABASE_URL);
        cfg.api_key = get(ENV_API_KEY);
        cfg.database_filter = get(ENV_DB_NAME);
        if let Some(v) = get(ENV_EXPORTER_URL) {
            cfg.exporter_url = v;
        }
        if let Some(v) = get(ENV_SERVICE_NAME) {
            cfg.service_name = v;
        }

        if let Some(v) = get(ENV_FETCH_INTERVAL) {
            match v.parse::<u64>() {
                Ok(ms) if ms > 0 => cfg.fetch_interval = Duration::from_millis(ms),
                _ => cfg.invalid(ENV_FETCH_INTERVAL, v),
            }
        }
        if let Some(v) = get(ENV_SAMPLE_RATE) {
            match v.parse::<f64>() {
                Ok(rate) if (0.0..=1.0).contains(&rate) => cfg.sample_rate = rate,
                _ => cfg.invalid(ENV_SAMPLE_RATE, v),
            }
        }
        if let Some(v) = get(ENV_BATCH_BYTES) {
            match v.parse::<usize>() {
                Ok(bytes) if bytes > 0 => cfg.batch_bytes = bytes,
                _ => cfg.invalid(ENV_BATCH_BYTES, v),
            }
        }
        if let Some(v) = get(ENV_DEDUP_TTL) {
            match v.parse::<u64>() {
                Ok(secs) => cfg.dedup_ttl = Duration::from_secs(secs),
                Err(_) => cfg.invalid(ENV_DEDUP_TTL, v),
            }
        }
        if let Some(v) = get(ENV_EXPORT_TIMEOUT) {
            match v.parse::<u64>() {
                Ok(secs) if secs > 0 => cfg.export_timeout = Duration::from_secs(secs),
                _ => cfg.invalid(ENV_EXPORT_TIMEOUT, v),
            }
        }
        if let Some(v) = get(ENV_BACKEND_PRECEDENCE) {
            match parse_precedence(&v) {
                Ok(p) => cfg.backend_precedence = p,
                Err(e) => cfg.problems.push(e),
            }
        }

        cfg.by_trace = cfg.flag(get(ENV_BY_TRACE), ENV_BY_TRACE, false);
        cfg.debug = cfg.flag(get(ENV_DEBUG), ENV_DEBUG, false);
        cfg.auto_run = cfg.flag(get(ENV_AUTO_RUN), ENV_AUTO_RUN, true);
        cfg.export_results = cfg.flag(get(ENV_EXPORT_RESULTS), ENV_EXPORT_RESULTS, true);
        cfg.bootstrap_all_databases = cfg.flag(
            get(ENV_BOOTSTRAP_ALL_DATABASES),
            ENV_BOOTSTRAP_ALL_DATABASES,
            false,
        );

        cfg
    }

    fn invalid(&mut self, name: &'static str, value: String) {
        self.problems.push(ConfigError::InvalidValue { name, value });
    }

    fn flag(&mut self, value: Option<String>, name: &'static str, default: bool) -> bool {
        let Some(v) = value else {
            return default;
        };
        match parse_bool(&v) {
            Some(b) => b,
            None => {
                self.invalid(name, v);
                default
            }
        }
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_fetch_interval(mut self, interval: Duration) -> Self {
        self.fetch_interval = interval;
        self
    }

    pub fn with_exporter_url(mut self, url: impl Into<String>) -> Self {
        self.exporter_url = url.into();
        self
    }

    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    pub fn with_database_filter(mut self, db: impl Into<String>) -> Self {
        self.database_filter = Some(db.into());
        self
    }

    pub fn with_by_trace(mut self, by_trace: bool) -> Self {
        self.by_trace = by_trace;
        self
    }

    pub fn with_auto_run(mut self, auto_run: bool) -> Self {
        self.auto_run = auto_run;
        self
    }

    pub fn with_export_results(mut self, export: bool) -> Self {
        self.export_results = export;
        self
    }

    pub fn with_batch_bytes(mut self, bytes: usize) -> Self {
        self.batch_bytes = bytes;
        self
    }

    pub fn with_dedup_ttl(mut self, ttl: Duration) -> Self {
        self.dedup_ttl = ttl;
        self
    }

    pub fn with_backend_precedence(mut self, precedence: Vec<BackendKind>) -> Self {
        self.backend_precedence = precedence;
        self
    }

    pub fn with_bootstrap_all_databases(mut self, all: bool) -> Self {
        self.bootstrap_all_databases = all;
        self
    }

    /// Everything wrong with the settings. None of it is fatal: a missing API
    /// key disables export, an unusable target is skipped.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = self.problems.clone();
        match &self.database_url {
            None => errors.push(ConfigError::Missing(ENV_DATABASE_URL)),
            Some(url) => errors.extend(
                split_urls(url)
                    .filter_map(|u| Target::from_connection_string(u, None).err()),
            ),
        }
        if self.export_results && self.api_key.is_none() {
            errors.push(ConfigError::Missing(ENV_API_KEY));
        }
        if self.backend_precedence.is_empty() {
            errors.push(ConfigError::InvalidValue {
                name: ENV_BACKEND_PRECEDENCE,
                value: String::new(),
            });
        }
        errors
    }

    /// Parseable targets; unparseable connection strings are left out.
    pub fn targets(&self) -> Vec<Target> {
        self.database_url
            .as_deref()
            .map(|url| {
                split_urls(url)
                    .filter_map(|u| {
                        Target::from_connection_string(u, self.database_filter.clone()).ok()
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn fetch_filters(&self, target: &Target) -> FetchFilters {
        FetchFilters {
            by_trace: self.by_trace,
            database: target.database_filter.clone(),
        }
    }

    pub fn bootstrap_options(&self) -> BootstrapOptions {
        BootstrapOptions {
            sample_rate: self.sample_rate,
        }
    }
}

/// Splits a target list on the commas that start a new connection string.
///
/// A comma separates targets only outside single quotes and only when a URL or
/// a `keyword=value` string follows, so multi-host URLs and quoted option
/// values stay whole. Inside a URL query string only a following URL splits.
fn split_urls(urls: &str) -> impl Iterator<Item = &str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    let mut escaped = false;
    for (i, c) in urls.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if quoted => escaped = true,
            '\'' if !is_url(&urls[start..i]) => quoted = !quoted,
            ',' if !quoted => {
                let current = &urls[start..i];
                let keyword_ok = !(is_url(current) && current.contains('?'));
                if starts_target(&urls[i + 1..], keyword_ok) {
                    pieces.push(current);
                    start = i + 1;
                }
            }
            _ => {}
        }
    }
    pieces.push(&urls[start..]);
    pieces.into_iter().map(str::trim).filter(|u| !u.is_empty())
}

fn is_url(s: &str) -> bool {
    let s = s.trim_start();
    s.starts_with("postgres://") || s.starts_with("postgresql://")
}

fn starts_target(rest: &str, keyword_ok: bool) -> bool {
    let rest = rest.trim_start();
    if rest.is_empty() || rest.starts_with(',') || is_url(rest) {
        return true;
    }
    if !keyword_ok {
        return false;
    }
    let key_len = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(rest.len());
    key_len > 0 && rest[key_len..].trim_start().starts_with('=')
}

/// `"log_fdw,file_fdw"` into kinds, in order, without duplicates.
pub fn parse_precedence(value: &str) -> Result<Vec<BackendKind>, ConfigError> {
    let mut kinds = Vec::new();
    for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let kind: BackendKind = part.parse()?;
        if !kinds.contains(&kind) {
            kinds.push(kind);
        }
    }
    if kinds.is_empty() {
        return Err(ConfigError::InvalidValue {
            name: ENV_BACKEND_PRECEDENCE,
            value: value.to_string(),
        });
    }
    Ok(kinds)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
