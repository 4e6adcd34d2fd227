//! Time-bounded set of recently emitted query ids.
//!
//! Plan-store backends read mutable aggregate state, so a statement that was
//! already reported can resurface with a newer `last_call`. An id stays
//! suppressed for the TTL after it was first emitted.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::model::SpanRecord;

/// Default time-to-live of an entry.
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
pub struct DedupWindow {
    ttl: Duration,
    entries: HashMap<String, Instant>,
}

impl Default for DedupWindow {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_TTL)
    }
}

impl DedupWindow {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// True if `query_id` was recorded less than one TTL ago.
    pub fn seen(&self, query_id: &str) -> bool {
        self.seen_at(query_id, Instant::now())
    }

    pub fn record(&mut self, query_id: &str) {
        self.record_at(query_id, Instant::now());
    }

    /// Drops spans whose query id is inside the window (including repeats within
    /// `spans`) and records the ids of the ones kept. Spans without a query id pass.
    pub fn retain_unseen(&mut self, spans: Vec<SpanRecord>) -> Vec<SpanRecord> {
        self.retain_unseen_at(spans, Instant::now())
    }

    /// Number of live and not yet purged entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn seen_at(&self, query_id: &str, now: Instant) -> bool {
        self.entries
            .get(query_id)
            .is_some_and(|inserted| now.saturating_duration_since(*inserted) < self.ttl)
    }

    fn record_at(&mut self, query_id: &str, now: Instant) {
        self.purge_expired(now);
        self.entries.insert(query_id.to_string(), now);
    }

    fn retain_unseen_at(&mut self, spans: Vec<SpanRecord>, now: Instant) -> Vec<SpanRecord> {
        self.purge_expired(now);
        spans
            .into_iter()
            .filter(|span| {
                let id = span.attributes.query_id.as_str();
                if id.is_empty() {
                    return true;
                }
                if self.seen_at(id, now) {
                    return false;
                }
                self.entries.insert(id.to_string(), now);
                true
            })
            .collect()
    }

    fn purge_expired(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.entries
            .retain(|_, inserted| now.saturating_duration_since(*inserted) < ttl);
    }
}
