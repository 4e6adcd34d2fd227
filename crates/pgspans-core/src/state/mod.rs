//! Per-target pipeline state: read cursor and dedup window.

pub mod cursor;
pub mod dedup;

pub use cursor::Cursor;
pub use dedup::{DEFAULT_DEDUP_TTL, DedupWindow};
