//! Main docseal implementation
//!
//! This module provides the [`Docseal`] struct, the single entry point that
//! owns the hash ledger, integrity chain, lock manager and atomic executor
//! for one document root.
//!
//! ## Overview
//!
//! Three operations make up the upstream surface:
//!
//! - [`Docseal::execute_atomic`]: run a mutation over protected files with
//!   all-or-nothing semantics
//! - [`Docseal::verify`]: check one file against its recorded checksum
//! - [`Docseal::create_integrity_snapshot`]: check every tracked file and the
//!   chain, and record the result
//!
//! Everything else (tracking, chain inspection, recovery, lease listing) is
//! there for operators and tooling.
//!
//! ## Thread Safety
//!
//! `Docseal` is `Send + Sync`. Components are shared through `Arc`s and all
//! cross-caller coordination goes through leases in the storage directory,
//! so several instances (in one process or many) can point at the same
//! storage.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use docseal::{AtomicOptions, Docseal};
//! use std::fs;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let seal = Docseal::init(PathBuf::from("./docs"), PathBuf::from("./docs/.docseal"))?;
//! seal.record_checksum("doc.txt")?;
//!
//! let outcome = seal.execute_atomic(
//!     AtomicOptions::new(["doc.txt"]).description("Apply accepted proposal"),
//!     || {
//!         fs::write("./docs/doc.txt", "v2")?;
//!         Ok(())
//!     },
//! )?;
//! println!("Committed {}", outcome.checkpoint_id);
//!
//! assert!(seal.verify("doc.txt")?.valid);
//! # Ok(())
//! # }
//! ```

use crate::chain::{ChainBlock, ChainEvent, ChainReport, IntegrityChain};
use crate::checkpoint::Checkpoint;
use crate::error::{DocsealError, Result};
use crate::executor::{AtomicExecutor, RecoveryReport};
use crate::ledger::{compute_digest_pair, HashLedger};
use crate::lock::{Lease, LockManager};
use crate::merkle;
use crate::storage::Storage;
use crate::types::*;
use crate::utils::{self, ZERO_DIGEST};
use rayon::prelude::*;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Document integrity guard for one root directory
///
/// # Examples
///
/// ```rust,no_run
/// use docseal::{Docseal, DocsealBuilder, LockStrategy};
/// use std::path::PathBuf;
/// use std::time::Duration;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// // Using direct initialization
/// let seal = Docseal::init(PathBuf::from("./docs"), PathBuf::from("./docs/.docseal"))?;
///
/// // Using builder pattern for custom configuration
/// let seal = DocsealBuilder::new()
///     .lock_strategy(LockStrategy::OsLock)
///     .default_timeout(Duration::from_secs(2))
///     .build(PathBuf::from("./docs"), PathBuf::from("./docs/.docseal"))?;
/// # Ok(())
/// # }
/// ```
pub struct Docseal {
    /// Document root; relative paths resolve against it
    root_path: PathBuf,
    /// Storage backend
    storage: Arc<Storage>,
    /// Evidence trail
    chain: Arc<IntegrityChain>,
    /// Checksum table
    ledger: Arc<HashLedger>,
    /// Lease table
    locks: Arc<LockManager>,
    /// Fenced mutation runner
    executor: AtomicExecutor,
    /// Configuration in force
    config: DocsealConfig,
}

impl std::fmt::Debug for Docseal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Docseal")
            .field("root_path", &self.root_path)
            .field("storage", &self.storage)
            .field("holder_id", &self.locks.holder_id())
            .field("config", &self.config)
            .finish()
    }
}

impl Docseal {
    /// Initialize docseal for a directory
    ///
    /// Creates the storage layout and the genesis block. Fails if the storage
    /// directory is already initialized; use [`Docseal::open`] for that.
    ///
    /// # Errors
    ///
    /// - [`DocsealError::InvalidArgument`] if the root does not exist
    /// - [`DocsealError::StorageAlreadyExists`] if storage is already set up
    #[instrument(skip(storage_path))]
    pub fn init(root_path: PathBuf, storage_path: PathBuf) -> Result<Self> {
        let root_path = canonical_root(&root_path)?;
        info!("Initializing docseal for {:?}", root_path);

        let config = DocsealConfig::new(root_path.clone(), storage_path.clone());
        let storage = Storage::init(storage_path, config)?;
        Self::assemble(root_path, storage, default_holder_id())
    }

    /// Open existing docseal storage
    ///
    /// # Errors
    ///
    /// - [`DocsealError::StorageNotInitialized`] if there is nothing to open
    #[instrument(skip(storage_path))]
    pub fn open(root_path: PathBuf, storage_path: PathBuf) -> Result<Self> {
        let root_path = canonical_root(&root_path)?;
        let storage = Storage::open(storage_path)?;
        Self::assemble(root_path, storage, default_holder_id())
    }

    fn assemble(root_path: PathBuf, storage: Storage, holder_id: String) -> Result<Self> {
        let config = storage.config();
        let storage = Arc::new(storage);

        let chain = Arc::new(IntegrityChain::new(storage.clone()));
        chain.genesis(&root_path)?;

        let ledger = Arc::new(HashLedger::new(
            root_path.clone(),
            storage.clone(),
            chain.clone(),
        ));
        let locks = Arc::new(LockManager::new(
            storage.clone(),
            config.lock_strategy,
            holder_id,
            config.lease_ttl(),
        ));
        let executor = AtomicExecutor::new(
            root_path.clone(),
            storage.clone(),
            ledger.clone(),
            chain.clone(),
            locks.clone(),
        );

        debug!(
            "docseal ready at {:?} ({} leases, holder {})",
            root_path,
            config.lock_strategy,
            locks.holder_id()
        );
        Ok(Self {
            root_path,
            storage,
            chain,
            ledger,
            locks,
            executor,
            config,
        })
    }

    /// Document root
    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    /// Configuration in force
    pub fn config(&self) -> &DocsealConfig {
        &self.config
    }

    /// Identity written into leases and checkpoints
    pub fn holder_id(&self) -> &str {
        self.locks.holder_id()
    }

    /// The hash ledger
    pub fn ledger(&self) -> &HashLedger {
        &self.ledger
    }

    /// The integrity chain
    pub fn chain(&self) -> &IntegrityChain {
        &self.chain
    }

    /// The lock manager
    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Start tracking a file by recording its current checksum
    ///
    /// The file is leased while it is hashed so the record cannot interleave
    /// with an atomic operation on the same path.
    #[instrument(skip(self, path), fields(path = ?path.as_ref()))]
    pub fn record_checksum(&self, path: impl AsRef<Path>) -> Result<ChecksumRecord> {
        let path = self.ledger.resolve(path.as_ref())?;
        let lease = self
            .locks
            .acquire(&path.to_string_lossy(), self.config.default_timeout())?;
        let result = self.ledger.record_checksum(&path);
        self.locks.release_all(std::slice::from_ref(&lease));
        result
    }

    /// Stop tracking a file
    pub fn forget(&self, path: impl AsRef<Path>) -> Result<bool> {
        self.ledger.forget(path.as_ref())
    }

    /// Every tracked path
    pub fn tracked_paths(&self) -> Result<Vec<PathBuf>> {
        self.ledger.tracked_paths()
    }

    /// Verify one file against its stored checksum
    ///
    /// The stored record is never changed. A mismatch appends a `VIOLATION`
    /// block; with `record_verifications` enabled a match appends `VERIFIED`.
    ///
    /// # Errors
    ///
    /// - [`DocsealError::NotTracked`] if the file has no record
    /// - [`DocsealError::ResourceUnavailable`] if the file cannot be read
    #[instrument(skip(self, path), fields(path = ?path.as_ref()))]
    pub fn verify(&self, path: impl AsRef<Path>) -> Result<VerifyOutcome> {
        let outcome = self.ledger.verify(path.as_ref())?;

        if !outcome.valid {
            warn!("Integrity mismatch on {:?}", outcome.path);
            self.chain.append(ChainEvent::Violation(ViolationRecord {
                kind: ViolationKind::FileMismatch,
                path: Some(outcome.path.clone()),
                expected: Some(outcome.record.digests.combined.clone()),
                actual: Some(outcome.live.combined.clone()),
                detail: outcome.mismatch_detail().unwrap_or_default(),
            }))?;
        } else if self.config.record_verifications {
            self.chain.append(ChainEvent::Verified {
                path: outcome.path.clone(),
                combined: outcome.live.combined.clone(),
            })?;
        }
        Ok(outcome)
    }

    /// Verify every tracked file and the chain, and record a `SNAPSHOT` block
    ///
    /// Files are hashed in parallel. The Merkle root covers the live combined
    /// digests in path order, so it only changes when content changes. A
    /// tracked file that cannot be read counts as invalid and contributes
    /// [`ZERO_DIGEST`] as its leaf.
    #[instrument(skip(self))]
    pub fn create_integrity_snapshot(&self) -> Result<SnapshotReport> {
        let start = Instant::now();
        let records = self.ledger.records()?;

        let live: Vec<(PathBuf, String, bool)> = records
            .par_iter()
            .map(|record| match utils::read_file(&record.path) {
                Ok(content) => {
                    let pair = compute_digest_pair(&content);
                    let valid = pair == record.digests;
                    (record.path.clone(), pair.combined, valid)
                }
                Err(e) => {
                    debug!("Snapshot could not read {:?}: {}", record.path, e);
                    (record.path.clone(), ZERO_DIGEST.to_string(), false)
                }
            })
            .collect();

        let leaves: Vec<String> = live.iter().map(|(_, combined, _)| combined.clone()).collect();
        let invalid_paths: Vec<PathBuf> = live
            .iter()
            .filter(|(_, _, valid)| !valid)
            .map(|(path, _, _)| path.clone())
            .collect();
        let chain_valid = self.chain.verify_chain()?.valid;

        let summary = SnapshotSummary {
            snapshot_id: uuid::Uuid::new_v4().to_string(),
            tracked: records.len(),
            all_valid: invalid_paths.is_empty(),
            invalid_count: invalid_paths.len(),
            invalid_paths,
            merkle_root: merkle::merkle_root(&leaves),
            chain_valid,
        };
        let block = self.chain.append(ChainEvent::Snapshot(summary.clone()))?;

        if summary.all_valid && summary.chain_valid {
            info!(
                "Snapshot {}: {} files valid in {:?}",
                &summary.snapshot_id[..8],
                summary.tracked,
                start.elapsed()
            );
        } else {
            warn!(
                "Snapshot {}: {} of {} files invalid, chain valid: {}",
                &summary.snapshot_id[..8],
                summary.invalid_count,
                summary.tracked,
                summary.chain_valid
            );
        }
        Ok(SnapshotReport {
            summary,
            block_id: block.id,
        })
    }

    /// Walk the chain and report violations
    pub fn verify_chain(&self) -> Result<ChainReport> {
        self.chain.verify_chain()
    }

    /// Walk the chain and fail with [`DocsealError::ChainTamperDetected`] on
    /// any violation (after appending evidence)
    pub fn ensure_chain_intact(&self) -> Result<ChainReport> {
        self.chain.ensure_intact()
    }

    /// Run a mutation over protected files with all-or-nothing semantics
    ///
    /// See [`AtomicExecutor::execute_atomic`].
    pub fn execute_atomic<T, F>(&self, options: AtomicOptions, mutation: F) -> Result<AtomicOutcome<T>>
    where
        F: FnOnce() -> anyhow::Result<T>,
    {
        self.executor.execute_atomic(options, mutation)
    }

    /// Roll back operations interrupted by a crash or a failed rollback
    pub fn recover_pending(&self) -> Result<RecoveryReport> {
        self.executor.recover_pending(self.config.default_timeout())
    }

    /// Every checkpoint record, oldest first
    pub fn list_checkpoints(&self) -> Result<Vec<Checkpoint>> {
        self.executor.list_checkpoints()
    }

    /// One checkpoint record
    pub fn load_checkpoint(&self, checkpoint_id: &str) -> Result<Checkpoint> {
        self.executor.load_checkpoint(checkpoint_id)
    }

    /// Every chain block, in id order
    pub fn chain_blocks(&self) -> Result<Vec<ChainBlock>> {
        self.chain.blocks()
    }

    /// Write the chain as JSON lines; returns the number of blocks
    pub fn export_chain<W: Write>(&self, writer: W) -> Result<usize> {
        self.chain.export(writer)
    }

    /// Every lease currently visible
    pub fn leases(&self) -> Result<Vec<Lease>> {
        self.locks.list_leases()
    }
}

/// Builder for configuring docseal instances
///
/// Settings left unset keep the stored configuration (or the defaults, for
/// new storage).
///
/// # Default Values
///
/// - `lock_strategy`: `LockStrategy::FileMarker`
/// - `lease_ttl`: 30 s
/// - `default_timeout`: 5 s
/// - `strict_pre_state`: false
/// - `record_verifications`: false
/// - `holder_id`: `<hostname>:<pid>:<random>`
#[derive(Debug, Default)]
pub struct DocsealBuilder {
    lock_strategy: Option<LockStrategy>,
    lease_ttl: Option<Duration>,
    default_timeout: Option<Duration>,
    strict_pre_state: Option<bool>,
    record_verifications: Option<bool>,
    holder_id: Option<String>,
}

impl DocsealBuilder {
    /// Create a new builder with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the lease mechanism
    pub fn lock_strategy(mut self, strategy: LockStrategy) -> Self {
        self.lock_strategy = Some(strategy);
        self
    }

    /// Set how long a lease lives if its holder never releases it
    pub fn lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = Some(ttl);
        self
    }

    /// Set the lease wait used when a call does not give its own timeout
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Refuse atomic operations whose fenced files are already out of sync
    pub fn strict_pre_state(mut self, strict: bool) -> Self {
        self.strict_pre_state = Some(strict);
        self
    }

    /// Record successful verifications in the chain
    pub fn record_verifications(mut self, record: bool) -> Self {
        self.record_verifications = Some(record);
        self
    }

    /// Set the identity written into leases and checkpoints
    ///
    /// This is a runtime setting and is not persisted.
    pub fn holder_id(mut self, holder_id: impl Into<String>) -> Self {
        self.holder_id = Some(holder_id.into());
        self
    }

    fn has_overrides(&self) -> bool {
        self.lock_strategy.is_some()
            || self.lease_ttl.is_some()
            || self.default_timeout.is_some()
            || self.strict_pre_state.is_some()
            || self.record_verifications.is_some()
    }

    fn apply(&self, config: &mut DocsealConfig) {
        if let Some(strategy) = self.lock_strategy {
            config.lock_strategy = strategy;
        }
        if let Some(ttl) = self.lease_ttl {
            config.lease_ttl_ms = ttl.as_millis() as u64;
        }
        if let Some(timeout) = self.default_timeout {
            config.default_timeout_ms = timeout.as_millis() as u64;
        }
        if let Some(strict) = self.strict_pre_state {
            config.strict_pre_state = strict;
        }
        if let Some(record) = self.record_verifications {
            config.record_verifications = record;
        }
    }

    /// Build a docseal instance
    ///
    /// Opens the storage if it already exists and initializes it otherwise.
    /// Explicit settings are written back to the stored configuration.
    pub fn build(self, root_path: PathBuf, storage_path: PathBuf) -> Result<Docseal> {
        let root_path = canonical_root(&root_path)?;
        let defaults = DocsealConfig::new(root_path.clone(), storage_path.clone());
        let storage = Storage::init_or_open(storage_path, defaults)?;

        if self.has_overrides() {
            storage.update_config(|config| self.apply(config))?;
        }
        let holder_id = self.holder_id.unwrap_or_else(default_holder_id);
        Docseal::assemble(root_path, storage, holder_id)
    }
}

fn canonical_root(root_path: &Path) -> Result<PathBuf> {
    if !root_path.is_dir() {
        return Err(DocsealError::invalid(format!(
            "root path {:?} is not a directory",
            root_path
        )));
    }
    root_path
        .canonicalize()
        .map_err(|e| DocsealError::unavailable(root_path.display().to_string(), e))
}

/// `<hostname>:<pid>:<random>`, unique per instance
pub fn default_holder_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    format!("{}:{}:{}", host, std::process::id(), &nonce[..8])
}
