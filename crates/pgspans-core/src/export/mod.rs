//! Span serialization, batching and delivery.

pub mod chunk;
pub mod exporter;

pub use chunk::{Chunks, DEFAULT_BATCH_BYTES, chunk};
pub use exporter::{DEFAULT_EXPORT_TIMEOUT, DEFAULT_EXPORTER_URL, Exporter};
