//! Error types for the storage subsystem.

use thiserror::Error;

/// Result type alias for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Error variants for storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A key, signature, bucket or queue record is absent.
    #[error("not found: {what}")]
    NotFound {
        /// Description of the missing record.
        what: String,
    },

    /// The write would exceed the effective size of the volume.
    #[error("capacity exhausted: requested {requested} bytes, {available} available")]
    CapacityExhausted {
        /// Bytes the write needs.
        requested: u64,
        /// Bytes still available on the volume.
        available: u64,
    },

    /// Unit of work misuse, missing table or corrupted record.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Embedded database failure.
    #[error("database error: {0}")]
    Db(#[from] redb::Error),

    /// Record encoding failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Builds a [`StoreError::NotFound`] for the given description.
    pub fn not_found(what: impl Into<String>) -> Self {
        StoreError::NotFound { what: what.into() }
    }

    /// Returns true for [`StoreError::NotFound`], including I/O not-found errors.
    pub fn is_not_found(&self) -> bool {
        match self {
            StoreError::NotFound { .. } => true,
            StoreError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

macro_rules! db_error_from {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for StoreError {
                fn from(e: $ty) -> Self {
                    StoreError::Db(redb::Error::from(e))
                }
            }
        )*
    };
}

db_error_from!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError
);
