//! Capability detection: which log source a server offers.

use std::collections::HashSet;

use tracing::debug;

use crate::error::DbError;

use super::Session;
use super::backend::BackendKind;
use super::queries;

/// Returns the first kind in `precedence` whose extension the server can load.
///
/// Read-only. The answer depends on the precedence list, never on the order
/// the server returns extension rows in.
pub fn detect(
    session: &mut dyn Session,
    precedence: &[BackendKind],
) -> Result<Option<BackendKind>, DbError> {
    let available: HashSet<String> = session
        .query_column(queries::AVAILABLE_EXTENSIONS)?
        .into_iter()
        .collect();
    debug!(extensions = ?available, "available log source extensions");

    Ok(precedence
        .iter()
        .copied()
        .find(|kind| available.contains(kind.extension())))
}
