//! Error types for tripwatch.
//!
//! This module defines the crate-wide error type. Component-local failures
//! (validation, decryption, sink, notification, trip collaborator) have their
//! own enums next to the component and convert into [`Error`] when they have
//! to cross a component boundary.

use std::path::PathBuf;
use thiserror::Error;

use crate::checkin::TripError;
use crate::crypto::CryptoError;
use crate::position::{PositionError, ValidationError};
use crate::upload::SinkError;

/// The main error type for tripwatch operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Storage Errors ===
    /// Failed to open or create the database.
    #[error("failed to open database at {path}: {source}")]
    DatabaseOpen {
        /// Path to the database file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: rusqlite::Error,
    },

    /// A database query failed.
    #[error("database query failed: {0}")]
    DatabaseQuery(#[from] rusqlite::Error),

    /// Failed to run database migrations.
    #[error("database migration failed: {message}")]
    DatabaseMigration {
        /// Description of what went wrong.
        message: String,
    },

    /// The fallback key/value store could not be read or written.
    #[error("key/value store at {path} failed: {message}")]
    KeyValueStore {
        /// Path to the store file.
        path: PathBuf,
        /// Description of what went wrong.
        message: String,
    },

    /// Neither the preferred nor the fallback backend could be opened.
    #[error("no storage backend available: {message}")]
    StorageUnavailable {
        /// Summary of the backend failures.
        message: String,
    },

    // === Configuration Errors ===
    /// Failed to load configuration.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    // === Sampling Errors ===
    /// Location permission was not granted.
    #[error("location permission denied: {message}")]
    PermissionDenied {
        /// Description returned by the position source.
        message: String,
    },

    /// A position fix failed validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The position source failed.
    #[error(transparent)]
    Position(#[from] PositionError),

    // === Crypto Errors ===
    /// Encrypting or decrypting a record failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    // === Collaborator Errors ===
    /// The upload sink rejected or failed a batch.
    #[error(transparent)]
    Sink(#[from] SinkError),

    /// The trip collaborator failed.
    #[error(transparent)]
    Trip(#[from] TripError),

    // === I/O Errors ===
    /// File system operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to create a required directory.
    #[error("failed to create directory {path}: {source}")]
    DirectoryCreate {
        /// Path that couldn't be created.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    // === Serialization Errors ===
    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Generic Errors ===
    /// An operation timed out.
    #[error("operation timed out: {operation}")]
    Timeout {
        /// Description of the operation that timed out.
        operation: String,
    },

    /// An internal error occurred (bug).
    #[error("internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for tripwatch operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl Error {
    /// Create a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Create a permission denied error.
    #[must_use]
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::PermissionDenied {
            message: message.into(),
        }
    }

    /// Create a configuration validation error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }

    /// Create a key/value store error.
    #[must_use]
    pub fn key_value(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::KeyValueStore {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Check if this error is a permission issue.
    #[must_use]
    pub fn is_permission_error(&self) -> bool {
        matches!(self, Self::PermissionDenied { .. })
    }

    /// Check if this error came from a storage backend.
    #[must_use]
    pub fn is_storage_error(&self) -> bool {
        matches!(
            self,
            Self::DatabaseOpen { .. }
                | Self::DatabaseQuery(_)
                | Self::DatabaseMigration { .. }
                | Self::KeyValueStore { .. }
                | Self::StorageUnavailable { .. }
                | Self::DirectoryCreate { .. }
        )
    }
}
