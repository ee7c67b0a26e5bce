//! Error types for sorted-subkey index operations.
//!
//! This module defines error types for the index and the store contract it
//! sits on, separate from any host application's error types.

use std::fmt;

/// Result type for subkey index operations.
pub type SubkeyIndexResult<T> = std::result::Result<T, SubkeyIndexError>;

/// Errors that can occur during subkey index operations.
///
/// Store condition codes are first-class variants because the engine branches
/// on them: a `KeyExists` during first-insert initialization means another
/// writer raced and the insert must re-route, an `ElementExists` during lock
/// acquisition means the lock is held, and so on.
#[derive(Debug)]
pub enum SubkeyIndexError {
    /// The addressed record does not exist.
    KeyNotFound {
        /// Description of the record key.
        key: String,
    },

    /// A create-only write found the record already present.
    KeyExists {
        /// Description of the record key.
        key: String,
    },

    /// A create-only map-entry write found the entry already present.
    ///
    /// This is the "lock already held" signal of the lock protocol.
    ElementExists {
        /// Description of the record key.
        key: String,
    },

    /// A generation-checked write observed a different generation.
    GenerationMismatch {
        /// Description of the record key.
        key: String,
    },

    /// A lock could not be acquired within the caller's deadline.
    LockTimeout {
        /// Description of the record key.
        key: String,
        /// How long the caller waited before giving up.
        waited_ms: u64,
    },

    /// The caller passed an unusable argument (wrong parent key type,
    /// non-positive page size).
    InvalidArgument {
        /// Description of the argument error.
        message: String,
    },

    /// A store operation failed for a reason the index does not interpret.
    Store {
        /// Description of the operation that failed.
        operation: String,
        /// The record key involved.
        key: String,
        /// The underlying error message.
        message: String,
    },

    /// Invariant violation inside the index itself.
    Internal {
        /// Error message.
        message: String,
    },
}

impl fmt::Display for SubkeyIndexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubkeyIndexError::KeyNotFound { key } => {
                write!(f, "record not found: {}", key)
            }
            SubkeyIndexError::KeyExists { key } => {
                write!(f, "record already exists: {}", key)
            }
            SubkeyIndexError::ElementExists { key } => {
                write!(f, "map entry already exists on record: {}", key)
            }
            SubkeyIndexError::GenerationMismatch { key } => {
                write!(f, "generation check failed on record: {}", key)
            }
            SubkeyIndexError::LockTimeout { key, waited_ms } => {
                write!(f, "lock on '{}' not acquired within {}ms", key, waited_ms)
            }
            SubkeyIndexError::InvalidArgument { message } => {
                write!(f, "invalid argument: {}", message)
            }
            SubkeyIndexError::Store {
                operation,
                key,
                message,
            } => {
                write!(f, "store {} failed for '{}': {}", operation, key, message)
            }
            SubkeyIndexError::Internal { message } => {
                write!(f, "internal error: {}", message)
            }
        }
    }
}

impl std::error::Error for SubkeyIndexError {}

impl SubkeyIndexError {
    /// Create a store operation error.
    pub fn store(
        operation: impl Into<String>,
        key: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        SubkeyIndexError::Store {
            operation: operation.into(),
            key: key.into(),
            message: message.into(),
        }
    }

    /// Create an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        SubkeyIndexError::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        SubkeyIndexError::Internal {
            message: message.into(),
        }
    }

    /// True if this is the record-absent condition.
    pub fn is_key_not_found(&self) -> bool {
        matches!(self, SubkeyIndexError::KeyNotFound { .. })
    }

    /// True if this is the record-already-exists condition.
    pub fn is_key_exists(&self) -> bool {
        matches!(self, SubkeyIndexError::KeyExists { .. })
    }

    /// True if this is the map-entry-already-exists condition.
    pub fn is_element_exists(&self) -> bool {
        matches!(self, SubkeyIndexError::ElementExists { .. })
    }

    /// True if this is a failed generation check.
    pub fn is_generation_mismatch(&self) -> bool {
        matches!(self, SubkeyIndexError::GenerationMismatch { .. })
    }
}
