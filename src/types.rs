//! Core data types used throughout the docseal library
//!
//! ## Overview
//!
//! - **Integrity state**: [`DigestPair`], [`ChecksumRecord`], [`VerifyOutcome`]
//! - **Evidence**: [`ViolationRecord`], [`SnapshotSummary`]
//! - **Configuration**: [`DocsealConfig`], [`LockStrategy`], [`StorageMetadata`]
//! - **Atomic operations**: [`AtomicOptions`], [`LockGranularity`], [`AtomicOutcome`]
//!
//! ## Examples
//!
//! ```rust
//! use docseal::types::{AtomicOptions, LockGranularity};
//! use std::time::Duration;
//!
//! let options = AtomicOptions::new(["drafts/chapter1.md", "drafts/chapter2.md"])
//!     .description("Accept merge proposal #12")
//!     .timeout(Duration::from_secs(2))
//!     .granularity(LockGranularity::Combined);
//! assert_eq!(options.file_paths.len(), 2);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Independent digests of one byte string
///
/// `digest_a` is SHA-256, `digest_b` is BLAKE3, and `combined` is SHA-256
/// over the raw bytes of both. All three are lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestPair {
    /// SHA-256 of the content
    pub digest_a: String,
    /// BLAKE3 of the content
    pub digest_b: String,
    /// SHA-256(digest_a ‖ digest_b)
    pub combined: String,
}

/// Stored checksum of one tracked file
///
/// # Examples
///
/// ```rust
/// # use docseal::types::{ChecksumRecord, DigestPair};
/// # use std::path::PathBuf;
/// # use chrono::Utc;
/// let record = ChecksumRecord {
///     path: PathBuf::from("/srv/docs/doc.txt"),
///     digests: DigestPair {
///         digest_a: "ab".repeat(32),
///         digest_b: "cd".repeat(32),
///         combined: "ef".repeat(32),
///     },
///     size_bytes: 2,
///     modified_at: Utc::now(),
///     created_at: Utc::now(),
/// };
/// assert_eq!(record.combined_digest(), "ef".repeat(32));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumRecord {
    /// Canonical absolute path
    pub path: PathBuf,
    /// Digests of the file bytes at recording time
    #[serde(flatten)]
    pub digests: DigestPair,
    /// File size in bytes
    pub size_bytes: u64,
    /// File modification time when hashed
    pub modified_at: DateTime<Utc>,
    /// When this record was written
    pub created_at: DateTime<Utc>,
}

impl ChecksumRecord {
    /// The combined digest
    pub fn combined_digest(&self) -> &str {
        &self.digests.combined
    }
}

/// Result of comparing a file's live bytes with its stored record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyOutcome {
    /// Canonical path that was verified
    pub path: PathBuf,
    /// Whether all three digests match
    pub valid: bool,
    /// The stored record
    pub record: ChecksumRecord,
    /// Digests of the current bytes
    pub live: DigestPair,
}

impl VerifyOutcome {
    /// Describe the mismatch, if any
    pub fn mismatch_detail(&self) -> Option<String> {
        if self.valid {
            return None;
        }
        let stored = &self.record.digests;
        let mut parts = Vec::new();
        if stored.digest_a != self.live.digest_a {
            parts.push("digest_a");
        }
        if stored.digest_b != self.live.digest_b {
            parts.push("digest_b");
        }
        if stored.combined != self.live.combined {
            parts.push("combined");
        }
        Some(format!("{} differ", parts.join(", ")))
    }
}

/// Category of a recorded violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationKind {
    /// A tracked file no longer matches its record
    FileMismatch,
    /// The chain walk found broken links or rewritten blocks
    ChainTamper,
}

/// Evidence appended to the chain when something does not check out
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationRecord {
    /// What kind of violation
    pub kind: ViolationKind,
    /// Affected path, for file mismatches
    pub path: Option<PathBuf>,
    /// Expected digest or state
    pub expected: Option<String>,
    /// Observed digest or state
    pub actual: Option<String>,
    /// Human-readable details
    pub detail: String,
}

/// Summary of a full pass over every tracked file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    /// Unique snapshot identifier
    pub snapshot_id: String,
    /// Number of tracked files examined
    pub tracked: usize,
    /// Whether every tracked file matched its record
    pub all_valid: bool,
    /// Number of files that did not match (or could not be read)
    pub invalid_count: usize,
    /// The files that did not match
    pub invalid_paths: Vec<PathBuf>,
    /// Merkle root over the live combined digests, in path order
    pub merkle_root: String,
    /// Whether the chain walk at snapshot time was clean
    pub chain_valid: bool,
}

/// Snapshot summary plus the id of the SNAPSHOT block that records it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotReport {
    /// The summary written into the chain
    pub summary: SnapshotSummary,
    /// Id of the SNAPSHOT block
    pub block_id: u64,
}

/// Mutual-exclusion mechanism backing leases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LockStrategy {
    /// Exclusive creation of a uniquely named marker file plus a lease TTL
    #[default]
    FileMarker,
    /// Native OS advisory lock on a per-resource lock file
    OsLock,
}

impl std::fmt::Display for LockStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockStrategy::FileMarker => write!(f, "file-marker"),
            LockStrategy::OsLock => write!(f, "os-lock"),
        }
    }
}

/// Configuration for a docseal instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocsealConfig {
    /// Directory that relative paths resolve against
    pub root_path: PathBuf,
    /// Storage location
    pub storage_path: PathBuf,
    /// How leases are implemented
    pub lock_strategy: LockStrategy,
    /// How long a lease lives without being released, in milliseconds
    pub lease_ttl_ms: u64,
    /// Default wait for lease acquisition, in milliseconds
    pub default_timeout_ms: u64,
    /// Refuse atomic operations whose fence already fails verification
    pub strict_pre_state: bool,
    /// Append a VERIFIED block for successful `verify` calls
    pub record_verifications: bool,
    /// docseal version that created this config
    pub version: String,
}

impl DocsealConfig {
    /// Default lease lifetime
    pub const DEFAULT_LEASE_TTL_MS: u64 = 30_000;
    /// Default acquisition timeout
    pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;

    /// Configuration with defaults for the given locations
    pub fn new(root_path: PathBuf, storage_path: PathBuf) -> Self {
        Self {
            root_path,
            storage_path,
            lock_strategy: LockStrategy::default(),
            lease_ttl_ms: Self::DEFAULT_LEASE_TTL_MS,
            default_timeout_ms: Self::DEFAULT_TIMEOUT_MS,
            strict_pre_state: false,
            record_verifications: false,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Lease TTL as a duration
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    /// Default timeout as a duration
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

/// Metadata stored with the storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageMetadata {
    /// Version of storage format
    pub format_version: u32,
    /// docseal version that created the storage
    pub docseal_version: String,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Configuration
    pub config: DocsealConfig,
}

/// How an atomic operation fences its files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LockGranularity {
    /// One lease per file, acquired in path order
    #[default]
    PerPath,
    /// A single lease over the sorted set of paths
    Combined,
}

/// Parameters of one atomic operation
#[derive(Debug, Clone)]
pub struct AtomicOptions {
    /// Files the mutation may touch; must be non-empty
    pub file_paths: Vec<PathBuf>,
    /// Lease wait budget; `None` uses the configured default
    pub timeout: Option<Duration>,
    /// Free-form description recorded with the checkpoint
    pub description: Option<String>,
    /// Lease granularity
    pub granularity: LockGranularity,
}

impl AtomicOptions {
    /// Options fencing the given files
    pub fn new<I, P>(file_paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            file_paths: file_paths.into_iter().map(Into::into).collect(),
            timeout: None,
            description: None,
            granularity: LockGranularity::default(),
        }
    }

    /// Set the lease wait budget
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the checkpoint description
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the lease granularity
    pub fn granularity(mut self, granularity: LockGranularity) -> Self {
        self.granularity = granularity;
        self
    }
}

/// Successful result of an atomic operation
#[derive(Debug)]
pub struct AtomicOutcome<T> {
    /// Checkpoint that committed
    pub checkpoint_id: String,
    /// Whatever the mutation returned
    pub result: T,
    /// Fenced files that were already out of sync before the mutation ran
    pub pre_state_violations: Vec<PathBuf>,
}
