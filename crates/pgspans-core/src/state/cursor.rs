//! Per-target watermark bounding each poll to newly produced rows.

use chrono::{DateTime, TimeDelta, Utc};

use crate::parser::timestamp::parse_timestamp;

/// How far back the first poll of a target reaches, in seconds.
pub const INITIAL_LOOKBACK_SECS: i64 = 60;

/// Last processed timestamp of a target. Never moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    watermark: DateTime<Utc>,
}

impl Cursor {
    pub fn new(watermark: DateTime<Utc>) -> Self {
        Self { watermark }
    }

    /// Cursor for a target polled for the first time.
    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self::new(now - TimeDelta::seconds(INITIAL_LOOKBACK_SECS))
    }

    pub fn watermark(&self) -> DateTime<Utc> {
        self.watermark
    }

    /// Moves the watermark forward to `ts`. Returns false if `ts` is not newer.
    pub fn advance(&mut self, ts: DateTime<Utc>) -> bool {
        if ts > self.watermark {
            self.watermark = ts;
            true
        } else {
            false
        }
    }

    /// Advances to the newest of the observed row timestamps.
    ///
    /// Unparseable timestamps are ignored; no parseable timestamp means no move.
    pub fn advance_to_max<'a>(&mut self, observed: impl IntoIterator<Item = &'a str>) -> bool {
        observed
            .into_iter()
            .filter_map(parse_timestamp)
            .max()
            .is_some_and(|max| self.advance(max))
    }

    /// Watermark as a bind parameter: `YYYY-MM-DD HH:MM:SS.ffffff+00`.
    pub fn as_sql_param(&self) -> String {
        self.watermark.format("%Y-%m-%d %H:%M:%S%.6f+00").to_string()
    }
}
