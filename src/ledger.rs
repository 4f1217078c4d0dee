//! Dual-digest checksum ledger
//!
//! The ledger keeps one [`ChecksumRecord`] per tracked file. A record is a
//! pure function of the file's bytes at recording time; any later write that
//! did not go through docseal leaves the record stale, and that staleness is
//! what [`HashLedger::verify`] reports.
//!
//! Verification never mutates anything. Mismatches come back as
//! `valid: false`; only I/O failures and untracked paths are errors.

use crate::chain::{ChainEvent, IntegrityChain};
use crate::error::{DocsealError, Result};
use crate::storage::Storage;
use crate::types::{ChecksumRecord, DigestPair, VerifyOutcome};
use crate::utils;
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Compute both digests of `content` and bind them together
///
/// # Example
///
/// ```rust
/// use docseal::ledger::compute_digest_pair;
///
/// let pair = compute_digest_pair(b"v1");
/// assert_eq!(pair, compute_digest_pair(b"v1"));
/// assert_ne!(pair.combined, compute_digest_pair(b"v2").combined);
/// assert_ne!(pair.digest_a, pair.digest_b);
/// ```
pub fn compute_digest_pair(content: &[u8]) -> DigestPair {
    let a = utils::sha256_bytes(content);
    let b = utils::blake3_bytes(content);

    let mut joined = Vec::with_capacity(a.len() + b.len());
    joined.extend_from_slice(&a);
    joined.extend_from_slice(&b);

    DigestPair {
        digest_a: hex::encode(a),
        digest_b: hex::encode(b),
        combined: utils::hash_data(&joined),
    }
}

/// Checksum table plus the operations that read and write it
pub struct HashLedger {
    root_path: PathBuf,
    storage: Arc<Storage>,
    chain: Arc<IntegrityChain>,
}

impl std::fmt::Debug for HashLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashLedger")
            .field("root_path", &self.root_path)
            .finish()
    }
}

impl HashLedger {
    /// Ledger resolving relative paths against `root_path`
    pub fn new(root_path: PathBuf, storage: Arc<Storage>, chain: Arc<IntegrityChain>) -> Self {
        Self {
            root_path,
            storage,
            chain,
        }
    }

    /// Canonical form of `path`
    pub fn resolve(&self, path: &Path) -> Result<PathBuf> {
        utils::canonical_path(&self.root_path, path)
    }

    /// Hash a file's current bytes into a record without persisting it
    ///
    /// # Errors
    ///
    /// - [`DocsealError::ResourceUnavailable`] if the file is missing or unreadable
    pub fn compute_record(&self, path: &Path) -> Result<ChecksumRecord> {
        let path = self.resolve(path)?;
        let content = utils::read_file(&path)?;
        let modified_at = fs::metadata(&path)
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        Ok(ChecksumRecord {
            digests: compute_digest_pair(&content),
            size_bytes: content.len() as u64,
            modified_at,
            created_at: Utc::now(),
            path,
        })
    }

    /// Persist a record and append a `FILE_HASHED` block
    pub fn commit_record(&self, record: &ChecksumRecord) -> Result<()> {
        self.storage.store_checksum(record)?;
        self.chain.append(ChainEvent::FileHashed(record.clone()))?;
        debug!("Recorded {:?} ({})", record.path, &record.digests.combined[..12]);
        Ok(())
    }

    /// Hash a file, persist its record and append a `FILE_HASHED` block
    #[instrument(skip(self))]
    pub fn record_checksum(&self, path: &Path) -> Result<ChecksumRecord> {
        let record = self.compute_record(path)?;
        self.commit_record(&record)?;
        info!("Tracking {:?}", record.path);
        Ok(record)
    }

    /// Compare a file's current bytes with its stored record
    ///
    /// # Errors
    ///
    /// - [`DocsealError::NotTracked`] if the path has no record
    /// - [`DocsealError::ResourceUnavailable`] if the file cannot be read
    pub fn verify(&self, path: &Path) -> Result<VerifyOutcome> {
        let path = self.resolve(path)?;
        let record = self
            .storage
            .load_checksum(&path)?
            .ok_or_else(|| DocsealError::NotTracked(path.clone()))?;
        let live = compute_digest_pair(&utils::read_file(&path)?);
        let valid = live == record.digests;

        Ok(VerifyOutcome {
            path,
            valid,
            record,
            live,
        })
    }

    /// Stored record for a path, if tracked
    pub fn record(&self, path: &Path) -> Result<Option<ChecksumRecord>> {
        self.storage.load_checksum(&self.resolve(path)?)
    }

    /// Stop tracking a path; returns whether it was tracked
    pub fn forget(&self, path: &Path) -> Result<bool> {
        let path = self.resolve(path)?;
        let removed = self.storage.remove_checksum(&path)?;
        if removed {
            debug!("Forgot {:?}", path);
        }
        Ok(removed)
    }

    /// Put back the record that was in force before a mutation
    ///
    /// `None` removes any record. No chain block is appended; the rollback
    /// block that follows describes the restoration.
    pub fn restore_record(&self, path: &Path, record: Option<&ChecksumRecord>) -> Result<()> {
        match record {
            Some(record) => self.storage.store_checksum(record),
            None => self.forget(path).map(|_| ()),
        }
    }

    /// Every tracked path, sorted
    pub fn tracked_paths(&self) -> Result<Vec<PathBuf>> {
        Ok(self
            .storage
            .list_checksums()?
            .into_iter()
            .map(|r| r.path)
            .collect())
    }

    /// Every stored record, sorted by path
    pub fn records(&self) -> Result<Vec<ChecksumRecord>> {
        self.storage.list_checksums()
    }
}
