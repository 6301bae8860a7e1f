//! Error types for store operations.

use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database operation failed, including a lock not taken within the busy timeout.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A row the caller referenced does not exist.
    #[error("{entity} not found: id {id}\n  Suggestion: The row may have been deleted or the ID is incorrect")]
    NotFound {
        /// Table-level entity name (request, download, ...).
        entity: &'static str,
        /// The missing id.
        id: i64,
    },
}

impl StoreError {
    /// Creates a `NotFound` error for the given entity.
    #[must_use]
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        Self::NotFound { entity, id }
    }
}

/// Returns `Ok(())` if at least one row was affected; otherwise [`StoreError::NotFound`].
pub(crate) fn check_affected(entity: &'static str, id: i64, rows_affected: u64) -> Result<(), StoreError> {
    if rows_affected == 0 {
        Err(StoreError::not_found(entity, id))
    } else {
        Ok(())
    }
}
