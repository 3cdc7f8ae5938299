//! Error types for the Retrace library
//!
//! This module defines every error that can occur while mirroring a tree.
//! Errors fall into a small taxonomy ([`ErrorClass`]) that decides how the
//! pipeline reacts to them:
//!
//! - **Per-file** errors (`TransientIo`, `CorruptMetadata`, `PermissionDenied`
//!   and a few entry-local refusals) are caught at the diff/write boundary
//!   and downgraded to a skip with a recorded cause.
//! - **Fatal** errors (`SecurityViolation`, `FatalConnection`, and anything
//!   that threatens the journal or metadata log) abort the run. The next run's
//!   recovery pass resolves whatever was in flight.

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the Retrace library
pub type Result<T> = std::result::Result<T, RetraceError>;

/// Main error type for all Retrace operations
#[derive(Debug, Error)]
pub enum RetraceError {
    /// I/O errors outside of a per-file comparison
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors during bincode serialization/deserialization
    #[error("Bincode error: {0}")]
    Bincode(String),

    /// I/O error while reading either side of a comparison
    #[error("Transient I/O error on {path:?}: {source}")]
    TransientIo {
        /// Path that failed
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// A metadata record could not be parsed
    #[error("Corrupt metadata record at line {line}: {reason}")]
    CorruptMetadata {
        /// 1-based line number in the log
        line: usize,
        /// What was wrong with it
        reason: String,
    },

    /// Permission denied for a file operation
    #[error("Permission denied: {path:?}")]
    PermissionDenied {
        /// Path where permission was denied
        path: PathBuf,
    },

    /// The access policy refused an operation
    #[error("Security violation: {op} on {path:?} is not allowed")]
    SecurityViolation {
        /// Operation that was attempted
        op: String,
        /// Path it targeted
        path: PathBuf,
    },

    /// The transport to the other side is gone
    #[error("Fatal connection error: {0}")]
    FatalConnection(String),

    /// The journal or metadata log could not be made durable
    #[error("Durability failure: {0}")]
    Durability(String),

    /// Tried to commit over an existing increment
    #[error("Increment already exists: {0:?}")]
    IncrementExists(PathBuf),

    /// A mirror directory still has children where it has to go away
    #[error("Directory not empty: {0:?}")]
    DirectoryNotEmpty(PathBuf),

    /// Tried to open a second journal entry for the same index
    #[error("Journal entry already pending for {0}")]
    JournalConflict(String),

    /// A delta could not be applied to its basis
    #[error("Invalid delta: {0}")]
    InvalidDelta(String),

    /// Session with this id does not exist
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Path has no recoverable state at the requested time
    #[error("Nothing to restore for {0} at the requested time")]
    NothingToRestore(String),

    /// Mirror directory does not carry a backup-data directory
    #[error("Not a mirror: {0:?}")]
    NotAMirror(PathBuf),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Pattern parsing error
    #[error("Invalid selection pattern: {0}")]
    InvalidPattern(String),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error")]
    WalkDir(#[from] walkdir::Error),

    /// Unsupported file type for the requested operation
    #[error("Unsupported file type: {path:?}")]
    UnsupportedFileType {
        /// Path to the unsupported file
        path: PathBuf,
    },

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<bincode::error::DecodeError> for RetraceError {
    fn from(err: bincode::error::DecodeError) -> Self {
        RetraceError::Bincode(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for RetraceError {
    fn from(err: bincode::error::EncodeError) -> Self {
        RetraceError::Bincode(err.to_string())
    }
}

impl From<globset::Error> for RetraceError {
    fn from(err: globset::Error) -> Self {
        RetraceError::InvalidPattern(err.to_string())
    }
}

/// Coarse classification of an error, used by the pipeline to decide between
/// skip-and-report and abort
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry at whole-file granularity, else skip
    TransientIo,
    /// Skip the single record, continue the session
    CorruptMetadata,
    /// Optionally retry with relaxed permissions, else skip
    PermissionDenied,
    /// Abort immediately
    SecurityViolation,
    /// Abort the run
    FatalConnection,
    /// Anything else; treated as fatal
    Other,
}

impl RetraceError {
    /// Create a durability error with a custom message
    pub fn durability(msg: impl Into<String>) -> Self {
        RetraceError::Durability(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        RetraceError::Internal(msg.into())
    }

    /// Create a corrupt metadata error for a log line
    pub fn corrupt(line: usize, reason: impl Into<String>) -> Self {
        RetraceError::CorruptMetadata {
            line,
            reason: reason.into(),
        }
    }

    /// Wrap an I/O error raised while reading one side of a comparison.
    ///
    /// Permission problems keep their own class so the caller can decide
    /// whether to retry with relaxed permissions.
    pub fn transient(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::PermissionDenied {
            RetraceError::PermissionDenied { path }
        } else {
            RetraceError::TransientIo { path, source }
        }
    }

    /// Taxonomy class of this error
    pub fn class(&self) -> ErrorClass {
        match self {
            RetraceError::TransientIo { .. } => ErrorClass::TransientIo,
            RetraceError::CorruptMetadata { .. } => ErrorClass::CorruptMetadata,
            RetraceError::PermissionDenied { .. } => ErrorClass::PermissionDenied,
            RetraceError::SecurityViolation { .. } => ErrorClass::SecurityViolation,
            RetraceError::FatalConnection(_) => ErrorClass::FatalConnection,
            RetraceError::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                ErrorClass::PermissionDenied
            }
            _ => ErrorClass::Other,
        }
    }

    /// Whether the pipeline may downgrade this error to a per-file skip
    pub fn is_per_file(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::TransientIo | ErrorClass::CorruptMetadata | ErrorClass::PermissionDenied
        ) || matches!(
            self,
            RetraceError::UnsupportedFileType { .. }
                | RetraceError::IncrementExists(_)
                | RetraceError::DirectoryNotEmpty(_)
        )
    }

    /// Whether this error must abort the whole run
    pub fn is_fatal(&self) -> bool {
        !self.is_per_file()
    }
}
