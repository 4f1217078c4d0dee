//! Append-only, hash-linked event log
//!
//! The integrity chain is the evidence trail of everything docseal has
//! hashed, verified, committed, or rolled back. Blocks are stored as an
//! arena addressed by integer id, one JSON file per block:
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ #0 INIT      │   │ #1 FILE_HASH │   │ #2 SNAPSHOT  │
//! │ prev: 000..0 │◄──│ prev: b(#0)  │◄──│ prev: b(#1)  │
//! │ a, b, merkle │   │ a, b, merkle │   │ a, b, merkle │
//! └──────────────┘   └──────────────┘   └──────────────┘
//! ```
//!
//! Each block's `digest_a` (SHA-256) and `digest_b` (BLAKE3) cover the
//! canonical JSON of `(id, timestamp, event, previous_digest)`, and its
//! `merkle_root` covers the pair. Rewriting a block without fixing its
//! digests shows up as a hash mismatch at that block; fixing its digests
//! breaks the link to the next block instead.
//!
//! ## Concurrent Appends
//!
//! A block file is published with [`utils::create_exclusive`], so when two
//! processes race for the same id exactly one wins. The loser re-reads the
//! tail and retries with the next id. Appends within one process are also
//! serialized by a mutex so they do not spin against each other.
//!
//! ## Example
//!
//! ```rust,no_run
//! use docseal::chain::{ChainEvent, IntegrityChain};
//! use docseal::storage::Storage;
//! use docseal::types::DocsealConfig;
//! use std::path::PathBuf;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DocsealConfig::new(PathBuf::from("/srv/docs"), PathBuf::from("/srv/docs/.docseal"));
//! let storage = Arc::new(Storage::init_or_open(config.storage_path.clone(), config.clone())?);
//! let chain = IntegrityChain::new(storage);
//! chain.genesis(&config.root_path)?;
//!
//! let report = chain.verify_chain()?;
//! assert!(report.valid);
//! # Ok(())
//! # }
//! ```

use crate::checkpoint::CheckpointStatus;
use crate::error::{DocsealError, Result};
use crate::merkle;
use crate::storage::{self, Storage};
use crate::types::{ChecksumRecord, SnapshotSummary, ViolationKind, ViolationRecord};
use crate::utils::{self, ZERO_DIGEST};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, trace, warn};

/// How many times an append retries after losing the id race
const MAX_APPEND_ATTEMPTS: usize = 64;

/// Post-state of one file in a committed checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedFile {
    /// Canonical path
    pub path: PathBuf,
    /// Combined digest after the mutation; `None` if the mutation deleted it
    pub combined: Option<String>,
}

/// Something worth recording, with a typed payload per kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChainEvent {
    /// Genesis
    Init {
        /// Document root the chain was created for
        root_path: PathBuf,
    },
    /// A checksum record was written
    FileHashed(ChecksumRecord),
    /// A file was verified and matched its record
    Verified {
        /// Canonical path
        path: PathBuf,
        /// Combined digest that matched
        combined: String,
    },
    /// A file mismatch or chain tampering was observed
    Violation(ViolationRecord),
    /// An integrity snapshot was taken
    Snapshot(SnapshotSummary),
    /// An atomic operation committed
    CheckpointCommit {
        /// Checkpoint that committed
        checkpoint_id: String,
        /// Caller-supplied description
        description: Option<String>,
        /// Post-state of every fenced file
        files: Vec<CommittedFile>,
    },
    /// An atomic operation was rolled back (or failed to roll back)
    CheckpointRollback {
        /// Checkpoint that was rolled back
        checkpoint_id: String,
        /// `ROLLED_BACK` or `FAILED_ROLLBACK`
        status: CheckpointStatus,
        /// Files restored to their pre-image
        restored: Vec<PathBuf>,
        /// Files that could not be restored
        not_restored: Vec<PathBuf>,
        /// Why the operation was rolled back
        error: String,
    },
}

impl ChainEvent {
    /// Short label of the event kind
    pub fn kind(&self) -> &'static str {
        match self {
            ChainEvent::Init { .. } => "INIT",
            ChainEvent::FileHashed(_) => "FILE_HASHED",
            ChainEvent::Verified { .. } => "VERIFIED",
            ChainEvent::Violation(_) => "VIOLATION",
            ChainEvent::Snapshot(_) => "SNAPSHOT",
            ChainEvent::CheckpointCommit { .. } => "CHECKPOINT_COMMIT",
            ChainEvent::CheckpointRollback { .. } => "CHECKPOINT_ROLLBACK",
        }
    }
}

/// One immutable entry of the chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainBlock {
    /// Position in the chain; 0 is genesis
    pub id: u64,
    /// When the block was sealed
    pub timestamp: DateTime<Utc>,
    /// What happened
    pub event: ChainEvent,
    /// `digest_b` of the previous block, or [`ZERO_DIGEST`] for genesis
    pub previous_digest: String,
    /// SHA-256 of the canonical content
    pub digest_a: String,
    /// BLAKE3 of the canonical content
    pub digest_b: String,
    /// Merkle root over `[digest_a, digest_b]`
    pub merkle_root: String,
}

/// The part of a block its digests cover, in serialization order
#[derive(Serialize)]
struct BlockContent<'a> {
    id: u64,
    timestamp: &'a DateTime<Utc>,
    event: &'a ChainEvent,
    previous_digest: &'a str,
}

/// Digests recomputed from a block's content
#[derive(Debug, Clone, PartialEq, Eq)]
struct Seal {
    digest_a: String,
    digest_b: String,
    merkle_root: String,
}

impl Seal {
    fn compute(
        id: u64,
        timestamp: &DateTime<Utc>,
        event: &ChainEvent,
        previous_digest: &str,
    ) -> Result<Self> {
        let content = serde_json::to_vec(&BlockContent {
            id,
            timestamp,
            event,
            previous_digest,
        })?;
        let digest_a = hex::encode(utils::sha256_bytes(&content));
        let digest_b = hex::encode(utils::blake3_bytes(&content));
        let merkle_root = merkle::merkle_root(&[digest_a.clone(), digest_b.clone()]);
        Ok(Self {
            digest_a,
            digest_b,
            merkle_root,
        })
    }
}

impl ChainBlock {
    /// Build and seal a block
    pub fn seal(id: u64, event: ChainEvent, previous_digest: String) -> Result<Self> {
        let timestamp = Utc::now();
        let seal = Seal::compute(id, &timestamp, &event, &previous_digest)?;
        Ok(Self {
            id,
            timestamp,
            event,
            previous_digest,
            digest_a: seal.digest_a,
            digest_b: seal.digest_b,
            merkle_root: seal.merkle_root,
        })
    }

    fn recompute(&self) -> Result<Seal> {
        Seal::compute(self.id, &self.timestamp, &self.event, &self.previous_digest)
    }

    /// Whether the stored digests match the block's content
    pub fn is_sealed(&self) -> bool {
        self.recompute().map_or(false, |seal| {
            seal.digest_a == self.digest_a
                && seal.digest_b == self.digest_b
                && seal.merkle_root == self.merkle_root
        })
    }
}

/// Category of a chain violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChainViolationKind {
    /// The link to the previous block is wrong or the previous block is missing
    ChainBreak,
    /// The block's stored digests do not match its content
    HashMismatch,
}

impl std::fmt::Display for ChainViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainViolationKind::ChainBreak => write!(f, "CHAIN_BREAK"),
            ChainViolationKind::HashMismatch => write!(f, "HASH_MISMATCH"),
        }
    }
}

/// One problem found by [`IntegrityChain::verify_chain`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainViolation {
    /// Block where the problem was observed
    pub block_id: u64,
    /// What kind of problem
    pub kind: ChainViolationKind,
    /// Details
    pub detail: String,
}

impl std::fmt::Display for ChainViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at block {}: {}", self.kind, self.block_id, self.detail)
    }
}

/// Result of walking the whole chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainReport {
    /// Whether no violations were found
    pub valid: bool,
    /// Number of block files examined
    pub blocks_checked: usize,
    /// Every violation, in block order
    pub violations: Vec<ChainViolation>,
}

/// Append-only, hash-linked sequence of [`ChainBlock`]s
pub struct IntegrityChain {
    storage: Arc<Storage>,
    /// Serializes appends within this process
    append_lock: Mutex<()>,
}

impl std::fmt::Debug for IntegrityChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrityChain")
            .field("storage", &self.storage)
            .finish()
    }
}

impl IntegrityChain {
    /// Chain over the block sequence in `storage`
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            append_lock: Mutex::new(()),
        }
    }

    /// Create block 0 if the chain is empty
    ///
    /// A chain that already has blocks is left alone, even if block 0 is
    /// missing; that is for [`verify_chain`](Self::verify_chain) to report.
    /// Safe to call from several processes at once: only one genesis block is
    /// ever published.
    pub fn genesis(&self, root_path: &Path) -> Result<()> {
        if !self.is_empty()? {
            return Ok(());
        }
        let block = ChainBlock::seal(
            0,
            ChainEvent::Init {
                root_path: root_path.to_path_buf(),
            },
            ZERO_DIGEST.to_string(),
        )?;
        let bytes = serde_json::to_vec_pretty(&block)?;
        if utils::create_exclusive(&self.storage.block_path(0), &bytes)? {
            info!("Created genesis block for {:?}", root_path);
        }
        Ok(())
    }

    /// Append an event as a new block
    ///
    /// # Errors
    ///
    /// - [`DocsealError::ResourceUnavailable`] if the block cannot be written,
    ///   or if the id race was lost too many times in a row
    #[instrument(skip(self, event), fields(kind = event.kind()))]
    pub fn append(&self, event: ChainEvent) -> Result<ChainBlock> {
        let _guard = self.append_lock.lock();

        for attempt in 0..MAX_APPEND_ATTEMPTS {
            let (id, previous_digest) = self.next_link()?;
            let block = ChainBlock::seal(id, event.clone(), previous_digest)?;
            let bytes = serde_json::to_vec_pretty(&block)?;

            if utils::create_exclusive(&self.storage.block_path(id), &bytes)? {
                debug!("Appended block {} ({})", id, block.event.kind());
                return Ok(block);
            }
            trace!("Lost append race for block {} (attempt {})", id, attempt + 1);
        }

        Err(DocsealError::unavailable(
            "chain append",
            std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                "too many concurrent appends",
            ),
        ))
    }

    /// Id and `previous_digest` for the next block
    ///
    /// An undecodable tail is linked by the BLAKE3 digest of its raw bytes.
    /// The damage stays reported at that block while new blocks can still be
    /// appended after it.
    fn next_link(&self) -> Result<(u64, String)> {
        let Some(&id) = self.storage.block_ids()?.last() else {
            return Ok((0, ZERO_DIGEST.to_string()));
        };
        let Some(raw) = utils::read_file_if_exists(&self.storage.block_path(id))? else {
            warn!("Tail block {} vanished while appending", id);
            return Ok((id + 1, ZERO_DIGEST.to_string()));
        };
        match serde_json::from_slice::<ChainBlock>(&raw) {
            Ok(tail) => Ok((id + 1, tail.digest_b)),
            Err(e) => {
                warn!("Tail block {} is undecodable ({}); linking to its raw bytes", id, e);
                Ok((id + 1, raw_link_digest(&raw)))
            }
        }
    }

    /// Load one block
    pub fn block(&self, id: u64) -> Result<Option<ChainBlock>> {
        storage::read_json(&self.storage.block_path(id))
    }

    /// The block with the highest id
    pub fn tail(&self) -> Result<Option<ChainBlock>> {
        match self.storage.block_ids()?.last() {
            Some(&id) => self.block(id),
            None => Ok(None),
        }
    }

    /// Number of blocks on disk
    pub fn len(&self) -> Result<usize> {
        Ok(self.storage.block_ids()?.len())
    }

    /// Whether the chain has no blocks at all
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Every readable block, in id order
    ///
    /// Undecodable blocks are skipped with a warning;
    /// [`verify_chain`](Self::verify_chain) reports them.
    pub fn blocks(&self) -> Result<Vec<ChainBlock>> {
        let mut blocks = Vec::new();
        for id in self.storage.block_ids()? {
            match self.block(id) {
                Ok(Some(block)) => blocks.push(block),
                Ok(None) => {}
                Err(DocsealError::Json(e)) => warn!("Skipping undecodable block {}: {}", id, e),
                Err(e) => return Err(e),
            }
        }
        Ok(blocks)
    }

    /// Path of a block file
    pub fn block_path(&self, id: u64) -> PathBuf {
        self.storage.block_path(id)
    }

    /// Write every block as one JSON object per line
    ///
    /// Returns the number of blocks written.
    pub fn export<W: Write>(&self, mut writer: W) -> Result<usize> {
        let blocks = self.blocks()?;
        for block in &blocks {
            serde_json::to_writer(&mut writer, block)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(blocks.len())
    }

    /// Walk every block and check digests and links
    ///
    /// Nothing is repaired; violations are only reported.
    #[instrument(skip(self))]
    pub fn verify_chain(&self) -> Result<ChainReport> {
        let ids = self.storage.block_ids()?;
        let mut violations = Vec::new();
        let mut expected_id = 0u64;
        // Recomputed digest_b of the previous block, if it could be read
        let mut previous: Option<String> = None;

        for &id in &ids {
            let gap = id != expected_id;
            if gap {
                let detail = if id == expected_id + 1 {
                    format!("block {} is missing", expected_id)
                } else {
                    format!("blocks {}..={} are missing", expected_id, id - 1)
                };
                violations.push(violation(id, ChainViolationKind::ChainBreak, detail));
            }
            expected_id = id + 1;

            let Some(raw) = utils::read_file_if_exists(&self.storage.block_path(id))? else {
                violations.push(violation(
                    id,
                    ChainViolationKind::ChainBreak,
                    "block disappeared during verification".to_string(),
                ));
                previous = None;
                continue;
            };
            let block: ChainBlock = match serde_json::from_slice(&raw) {
                Ok(block) => block,
                Err(e) => {
                    violations.push(violation(
                        id,
                        ChainViolationKind::HashMismatch,
                        format!("block is undecodable: {}", e),
                    ));
                    // Blocks appended after the damage link to the raw bytes
                    previous = Some(raw_link_digest(&raw));
                    continue;
                }
            };

            if block.id != id {
                violations.push(violation(
                    id,
                    ChainViolationKind::HashMismatch,
                    format!("block stored at position {} claims id {}", id, block.id),
                ));
            }

            let seal = block.recompute()?;
            let mut differing = Vec::new();
            if seal.digest_a != block.digest_a {
                differing.push("digest_a");
            }
            if seal.digest_b != block.digest_b {
                differing.push("digest_b");
            }
            if seal.merkle_root != block.merkle_root {
                differing.push("merkle_root");
            }
            if !differing.is_empty() {
                violations.push(violation(
                    id,
                    ChainViolationKind::HashMismatch,
                    format!("stored {} do not match content", differing.join(", ")),
                ));
            }

            if !gap {
                let expected_link = if id == 0 {
                    Some(ZERO_DIGEST)
                } else {
                    previous.as_deref()
                };
                match expected_link {
                    Some(link) if link != block.previous_digest => violations.push(violation(
                        id,
                        ChainViolationKind::ChainBreak,
                        format!(
                            "previous_digest {} does not match {}",
                            short(&block.previous_digest),
                            short(link)
                        ),
                    )),
                    Some(_) => {}
                    None => violations.push(violation(
                        id,
                        ChainViolationKind::ChainBreak,
                        "previous block is unreadable".to_string(),
                    )),
                }
            }

            previous = Some(seal.digest_b);
        }

        let report = ChainReport {
            valid: violations.is_empty(),
            blocks_checked: ids.len(),
            violations,
        };
        if report.valid {
            debug!("Chain verified: {} blocks", report.blocks_checked);
        } else {
            error!(
                "Chain verification found {} violation(s) in {} blocks",
                report.violations.len(),
                report.blocks_checked
            );
        }
        Ok(report)
    }

    /// Verify the chain and fail loudly on tampering
    ///
    /// On any violation a `VIOLATION` block is appended as evidence before
    /// [`DocsealError::ChainTamperDetected`] is returned. The tamper error is
    /// returned even if the evidence cannot be written.
    pub fn ensure_intact(&self) -> Result<ChainReport> {
        let report = self.verify_chain()?;
        let Some(first) = report.violations.first() else {
            return Ok(report);
        };

        let first = first.to_string();
        if let Err(e) = self.append(ChainEvent::Violation(ViolationRecord {
            kind: ViolationKind::ChainTamper,
            path: None,
            expected: None,
            actual: None,
            detail: format!("{} violation(s); first: {}", report.violations.len(), first),
        })) {
            error!("Could not record chain tamper evidence: {}", e);
        }

        Err(DocsealError::ChainTamperDetected {
            violations: report.violations.len(),
            first,
        })
    }
}

fn violation(block_id: u64, kind: ChainViolationKind, detail: String) -> ChainViolation {
    ChainViolation {
        block_id,
        kind,
        detail,
    }
}

/// Link digest standing in for an undecodable block
fn raw_link_digest(raw: &[u8]) -> String {
    hex::encode(utils::blake3_bytes(raw))
}

fn short(digest: &str) -> &str {
    &digest[..12.min(digest.len())]
}
