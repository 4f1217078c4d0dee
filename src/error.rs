//! Error types for the docseal library
//!
//! The taxonomy separates outcomes a caller is expected to handle
//! (integrity mismatches, lock contention, transient I/O) from the two
//! critical conditions that need an operator: a tampered chain and a
//! rollback that could not complete.

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the docseal library
pub type Result<T> = std::result::Result<T, DocsealError>;

/// Main error type for all docseal operations
#[derive(Debug, Error)]
pub enum DocsealError {
    /// A tracked file no longer matches its stored checksum record
    #[error("Integrity violation at {path:?}: expected {expected}, found {actual}")]
    IntegrityViolation {
        /// Canonical path of the file
        path: PathBuf,
        /// Combined digest stored in the checksum record
        expected: String,
        /// Combined digest of the current file bytes
        actual: String,
    },

    /// A lease could not be acquired before the deadline
    #[error("Lock acquisition timeout on {resource_key} after {waited_ms} ms")]
    LockTimeout {
        /// Resource the caller tried to lease
        resource_key: String,
        /// How long the caller waited
        waited_ms: u64,
    },

    /// Walking the integrity chain found broken links or rewritten blocks
    #[error("Chain tamper detected: {violations} violation(s), first: {first}")]
    ChainTamperDetected {
        /// Number of violations found
        violations: usize,
        /// Description of the first violation
        first: String,
    },

    /// A rollback failed partway; protected files are in a mixed state
    #[error(
        "Irrecoverable state in checkpoint {checkpoint_id}: restored {restored:?}, not restored {not_restored:?}: {reason}"
    )]
    IrrecoverableState {
        /// Checkpoint whose rollback failed
        checkpoint_id: String,
        /// Paths that were restored before the failure
        restored: Vec<PathBuf>,
        /// Paths that still hold post-mutation (or partial) content
        not_restored: Vec<PathBuf>,
        /// The restoration error
        reason: String,
    },

    /// A lease lapsed and was taken over while its operation was in flight
    ///
    /// Nothing was committed or restored: another holder may already own the
    /// files.
    #[error("Lease on {resource_key} was lost before the operation finished{}", checkpoint_id.as_deref().map(|id| format!(" (checkpoint {})", id)).unwrap_or_default())]
    LeaseLost {
        /// Resource whose lease was lost
        resource_key: String,
        /// Checkpoint left behind, if an atomic operation was running
        checkpoint_id: Option<String>,
    },

    /// Underlying storage I/O failed
    #[error("Resource unavailable ({context}): {source}")]
    ResourceUnavailable {
        /// What was being accessed
        context: String,
        /// The I/O error
        #[source]
        source: std::io::Error,
    },

    /// Caller misuse
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The wrapped mutation failed and every fenced file was rolled back
    #[error("Mutation failed in checkpoint {checkpoint_id} (rolled back): {source}")]
    MutationFailed {
        /// Checkpoint that was rolled back
        checkpoint_id: String,
        /// The caller's original error
        #[source]
        source: anyhow::Error,
    },

    /// The path has no checksum record
    #[error("Path is not tracked: {0:?}")]
    NotTracked(PathBuf),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A persisted record or pre-image failed its own consistency check
    #[error("Corrupt record: {0}")]
    CorruptRecord(String),

    /// Storage is not initialized
    #[error("Storage not initialized at path: {0:?}")]
    StorageNotInitialized(PathBuf),

    /// Storage already exists
    #[error("Storage already exists at path: {0:?}")]
    StorageAlreadyExists(PathBuf),

    /// Checkpoint not found in storage
    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for DocsealError {
    fn from(err: std::io::Error) -> Self {
        DocsealError::ResourceUnavailable {
            context: "I/O".to_string(),
            source: err,
        }
    }
}

impl DocsealError {
    /// Wrap an I/O error with the path or resource being accessed
    pub fn unavailable(context: impl Into<String>, source: std::io::Error) -> Self {
        DocsealError::ResourceUnavailable {
            context: context.into(),
            source,
        }
    }

    /// Create an invalid argument error with a custom message
    pub fn invalid(msg: impl Into<String>) -> Self {
        DocsealError::InvalidArgument(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        DocsealError::Internal(msg.into())
    }

    /// Check if the caller may reasonably retry
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DocsealError::IntegrityViolation { .. }
                | DocsealError::LockTimeout { .. }
                | DocsealError::ResourceUnavailable { .. }
        )
    }

    /// Check if this error needs operator intervention
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            DocsealError::ChainTamperDetected { .. }
                | DocsealError::IrrecoverableState { .. }
                | DocsealError::LeaseLost { .. }
        )
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            DocsealError::LockTimeout { resource_key, .. } => format!(
                "Timed out waiting for {}. Another operation may be in progress. Try again later.",
                resource_key
            ),
            DocsealError::NotTracked(path) => format!(
                "{:?} is not tracked. Use 'docseal track' to record its checksum first.",
                path
            ),
            DocsealError::StorageNotInitialized(path) => {
                format!("Storage not initialized at {:?}. Run 'docseal init' first.", path)
            }
            DocsealError::ChainTamperDetected { .. } => format!(
                "{} Restore the chain from a known-good export; docseal will not repair it.",
                self
            ),
            DocsealError::IrrecoverableState { checkpoint_id, .. } => format!(
                "{} Pre-images are retained; run 'docseal recover' once the cause is fixed (checkpoint {}).",
                self, checkpoint_id
            ),
            DocsealError::LeaseLost { .. } => format!(
                "{} Files were left as found; check them with 'docseal verify'. Raise --lease-ttl if operations run long.",
                self
            ),
            _ => self.to_string(),
        }
    }
}
