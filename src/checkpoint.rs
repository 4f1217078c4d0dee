//! Checkpoint records and pre-image encoding
//!
//! A checkpoint is the unit of atomicity: the set of files one mutation may
//! touch, the bytes those files held before the mutation ran, and the
//! outcome.
//!
//! ## Lifecycle
//!
//! ```text
//!             ┌──────────► COMMITTED
//!  PENDING ───┼──────────► ROLLED_BACK
//!             └──────────► FAILED_ROLLBACK ──(recover)──► ROLLED_BACK
//! ```
//!
//! Pre-images are persisted before the mutation runs so that a process that
//! dies mid-mutation leaves enough on disk to roll back on restart. They are
//! LZ4-compressed and carry their own SHA-256 so a damaged pre-image is
//! never written back over a protected file.

use crate::error::{DocsealError, Result};
use crate::types::{ChecksumRecord, LockGranularity};
use crate::utils;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Where a checkpoint is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckpointStatus {
    /// Pre-images captured; mutation in flight (or its process died)
    Pending,
    /// Mutation succeeded and post-state was recorded
    Committed,
    /// Mutation failed and every file was restored
    RolledBack,
    /// Restoration failed partway; needs an operator
    FailedRollback,
}

impl CheckpointStatus {
    /// Whether no further transition is expected without operator action
    pub fn is_terminal(self) -> bool {
        matches!(self, CheckpointStatus::Committed | CheckpointStatus::RolledBack)
    }

    /// Whether `recover` should pick this checkpoint up
    pub fn needs_recovery(self) -> bool {
        matches!(self, CheckpointStatus::Pending | CheckpointStatus::FailedRollback)
    }
}

impl std::fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            CheckpointStatus::Pending => "PENDING",
            CheckpointStatus::Committed => "COMMITTED",
            CheckpointStatus::RolledBack => "ROLLED_BACK",
            CheckpointStatus::FailedRollback => "FAILED_ROLLBACK",
        };
        f.write_str(label)
    }
}

/// What a fenced file looked like before the mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreImage {
    /// Canonical path
    pub path: PathBuf,
    /// SHA-256 of the original bytes; `None` if the file did not exist
    pub content_hash: Option<String>,
    /// Original size in bytes
    pub size_bytes: u64,
    /// Checksum record in force before the mutation
    pub record: Option<ChecksumRecord>,
    /// Unix mode bits of the original file
    #[serde(default)]
    pub mode: Option<u32>,
}

impl PreImage {
    /// Whether the file existed before the mutation
    pub fn existed(&self) -> bool {
        self.content_hash.is_some()
    }
}

/// Persistent record of one atomic operation attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Unique identifier
    pub checkpoint_id: String,
    /// Caller-supplied description
    pub description: Option<String>,
    /// Who ran the operation
    pub holder_id: String,
    /// The fence, in canonical sorted order
    pub file_paths: Vec<PathBuf>,
    /// How the fence was leased
    #[serde(default)]
    pub granularity: LockGranularity,
    /// One entry per fenced path, same order as `file_paths`
    pub pre_images: Vec<PreImage>,
    /// Lifecycle state
    pub status: CheckpointStatus,
    /// When the operation began
    pub started_at: DateTime<Utc>,
    /// When the operation reached its current status
    pub finished_at: Option<DateTime<Utc>>,
    /// Failure message, for rolled back or failed checkpoints
    pub error: Option<String>,
}

impl Checkpoint {
    /// Create a pending checkpoint
    ///
    /// # Examples
    ///
    /// ```rust
    /// use docseal::checkpoint::{Checkpoint, CheckpointStatus};
    /// use std::path::PathBuf;
    ///
    /// let cp = Checkpoint::new(
    ///     vec![PathBuf::from("/srv/docs/a.md")],
    ///     Some("Accept proposal".to_string()),
    ///     "editor-1".to_string(),
    /// );
    /// assert_eq!(cp.status, CheckpointStatus::Pending);
    /// assert_eq!(cp.short_id().len(), 8);
    /// ```
    pub fn new(file_paths: Vec<PathBuf>, description: Option<String>, holder_id: String) -> Self {
        Self {
            checkpoint_id: uuid::Uuid::new_v4().to_string(),
            description,
            holder_id,
            file_paths,
            granularity: LockGranularity::default(),
            pre_images: Vec::new(),
            status: CheckpointStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }

    /// Get a short version of the checkpoint ID (first 8 characters)
    pub fn short_id(&self) -> &str {
        &self.checkpoint_id[..8.min(self.checkpoint_id.len())]
    }

    /// Move to a new status, stamping the finish time
    pub fn transition(&mut self, status: CheckpointStatus, error: Option<String>) {
        self.status = status;
        self.finished_at = Some(Utc::now());
        if error.is_some() {
            self.error = error;
        }
    }
}

/// Compress a pre-image for storage
pub fn encode_pre_image(content: &[u8]) -> Vec<u8> {
    lz4_flex::compress_prepend_size(content)
}

/// Decompress a stored pre-image and check it against its recorded hash
pub fn decode_pre_image(stored: &[u8], expected_hash: &str) -> Result<Vec<u8>> {
    let content = lz4_flex::decompress_size_prepended(stored)
        .map_err(|e| DocsealError::CorruptRecord(format!("pre-image decompression: {}", e)))?;
    let actual = utils::hash_data(&content);
    if actual != expected_hash {
        return Err(DocsealError::CorruptRecord(format!(
            "pre-image hash mismatch: expected {}, got {}",
            expected_hash, actual
        )));
    }
    Ok(content)
}
