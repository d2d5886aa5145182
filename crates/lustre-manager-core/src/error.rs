//! Common error types for the Lustre manager.

use crate::class::EntityRef;
use thiserror::Error;

/// A result type using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors shared across crates.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The referenced entity does not exist or has been deleted.
    #[error("entity not found: {0}")]
    EntityNotFound(EntityRef),

    /// An invalid identifier was provided.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] crate::ids::IdError),

    /// An internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
}
