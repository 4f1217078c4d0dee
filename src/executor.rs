//! Atomic checkpoint executor
//!
//! Runs a caller-supplied mutation over a fixed set of files so that it
//! either fully succeeds, with new checksum records and a commit block, or
//! leaves every file byte-identical to how it started.
//!
//! ## Protocol
//!
//! ```text
//! canonicalize + sort fence
//!   └─► acquire leases (path order)
//!         └─► pre-state check ──(strict + violation)──► abort
//!               └─► persist pre-images, checkpoint PENDING
//!                     └─► run mutation (panics caught)
//!                           ├─ lease lost ─► leave files ───► FAILED_ROLLBACK
//!                           ├─ ok ──► hash, record, verify ──► COMMITTED
//!                           └─ err ─► restore pre-images ────► ROLLED_BACK
//!                                          └─ restore fails ─► FAILED_ROLLBACK
//!   └─► release leases
//! ```
//!
//! Leases are renewed by a heartbeat for as long as the operation runs and
//! re-checked before anything is committed or restored.
//!
//! Pre-images are on disk before the mutation starts. A process that dies
//! mid-mutation leaves a `PENDING` checkpoint behind, which
//! [`AtomicExecutor::recover_pending`] rolls back on the next start unless a
//! later operation has already committed over the same files.

use crate::chain::{ChainEvent, CommittedFile, IntegrityChain};
use crate::checkpoint::{Checkpoint, CheckpointStatus, PreImage};
use crate::error::{DocsealError, Result};
use crate::ledger::HashLedger;
use crate::lock::{HeldLeases, LockManager};
use crate::storage::Storage;
use crate::types::{
    AtomicOptions, AtomicOutcome, ChecksumRecord, LockGranularity, ViolationKind, ViolationRecord,
};
use crate::utils;
use std::any::Any;
use std::collections::BTreeSet;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

type PanicPayload = Box<dyn Any + Send + 'static>;

/// What a recovery pass did with each interrupted checkpoint
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Checkpoints rolled back
    pub recovered: Vec<String>,
    /// Checkpoints whose files are still leased by someone
    pub skipped: Vec<String>,
    /// Checkpoints whose rollback failed, with the reason
    pub failed: Vec<(String, String)>,
}

impl RecoveryReport {
    /// Whether nothing needed attention
    pub fn is_empty(&self) -> bool {
        self.recovered.is_empty() && self.skipped.is_empty() && self.failed.is_empty()
    }
}

/// Lease keys covering a fence, in acquisition order
///
/// Per-path keys are the canonical paths themselves. A combined fence takes
/// a key for the whole set (a digest of the sorted, newline-joined paths)
/// followed by the per-path keys, so it also excludes every other fence
/// that shares a file with it.
pub fn lease_keys(paths: &[PathBuf], granularity: LockGranularity) -> Vec<String> {
    let keys: Vec<String> = paths.iter().map(|p| p.to_string_lossy().into_owned()).collect();
    match granularity {
        LockGranularity::PerPath => keys,
        LockGranularity::Combined => {
            let set_key = format!("set:{}", utils::hash_data(keys.join("\n").as_bytes()));
            std::iter::once(set_key).chain(keys).collect()
        }
    }
}

/// Runs fenced mutations against the ledger, chain and lease table
pub struct AtomicExecutor {
    root_path: PathBuf,
    storage: Arc<Storage>,
    ledger: Arc<HashLedger>,
    chain: Arc<IntegrityChain>,
    locks: Arc<LockManager>,
    default_timeout: Duration,
    strict_pre_state: bool,
}

impl std::fmt::Debug for AtomicExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomicExecutor")
            .field("root_path", &self.root_path)
            .field("locks", &self.locks)
            .field("default_timeout", &self.default_timeout)
            .field("strict_pre_state", &self.strict_pre_state)
            .finish()
    }
}

impl AtomicExecutor {
    /// Executor over shared components
    pub fn new(
        root_path: PathBuf,
        storage: Arc<Storage>,
        ledger: Arc<HashLedger>,
        chain: Arc<IntegrityChain>,
        locks: Arc<LockManager>,
    ) -> Self {
        let config = storage.config();
        Self {
            root_path,
            storage,
            ledger,
            chain,
            locks,
            default_timeout: config.default_timeout(),
            strict_pre_state: config.strict_pre_state,
        }
    }

    /// Override the default lease wait
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Refuse to run when a fenced file is already out of sync
    pub fn with_strict_pre_state(mut self, strict: bool) -> Self {
        self.strict_pre_state = strict;
        self
    }

    /// Run `mutation` with all-or-nothing semantics over `options.file_paths`
    ///
    /// # Errors
    ///
    /// - [`DocsealError::InvalidArgument`] if the fence is empty
    /// - [`DocsealError::LockTimeout`] if a lease could not be acquired
    /// - [`DocsealError::IntegrityViolation`] if strict pre-state checking
    ///   found a fenced file out of sync
    /// - [`DocsealError::MutationFailed`] if the mutation (or post-state
    ///   recording) failed and every file was restored
    /// - [`DocsealError::IrrecoverableState`] if restoration failed partway
    /// - [`DocsealError::LeaseLost`] if a lease lapsed and was taken over
    ///   mid-operation; nothing was committed or restored
    ///
    /// # Panics
    ///
    /// A panic inside `mutation` is caught, the files are rolled back, and
    /// the panic is then resumed. If the leases were lost by then, the panic
    /// is reported as [`DocsealError::LeaseLost`] instead.
    #[instrument(skip(self, options, mutation), fields(files = options.file_paths.len()))]
    pub fn execute_atomic<T, F>(&self, options: AtomicOptions, mutation: F) -> Result<AtomicOutcome<T>>
    where
        F: FnOnce() -> anyhow::Result<T>,
    {
        if options.file_paths.is_empty() {
            return Err(DocsealError::invalid("atomic operation needs at least one file path"));
        }

        let fence: BTreeSet<PathBuf> = options
            .file_paths
            .iter()
            .map(|p| utils::canonical_path(&self.root_path, p))
            .collect::<Result<_>>()?;
        let paths: Vec<PathBuf> = fence.into_iter().collect();

        let timeout = options.timeout.unwrap_or(self.default_timeout);
        let leases = self
            .locks
            .acquire_all(&lease_keys(&paths, options.granularity), timeout)?;
        debug!("Fenced {} file(s) with {} lease(s)", paths.len(), leases.len());

        let (result, panic_payload) = self
            .locks
            .hold(leases, |held| self.run_fenced(paths, &options, held, mutation));

        if let Some(payload) = panic_payload {
            if matches!(result, Err(DocsealError::MutationFailed { .. })) {
                panic::resume_unwind(payload);
            }
        }
        result
    }

    fn run_fenced<T, F>(
        &self,
        paths: Vec<PathBuf>,
        options: &AtomicOptions,
        held: &HeldLeases<'_>,
        mutation: F,
    ) -> (Result<AtomicOutcome<T>>, Option<PanicPayload>)
    where
        F: FnOnce() -> anyhow::Result<T>,
    {
        let pre_state_violations = match self.check_pre_state(&paths) {
            Ok(violations) => violations,
            Err(e) => return (Err(e), None),
        };

        let mut checkpoint = match self.begin(paths, options) {
            Ok(checkpoint) => checkpoint,
            Err(e) => return (Err(e), None),
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(mutation));

        if let Err(lost) = held.confirm() {
            let cause = match &outcome {
                Ok(Ok(_)) => "mutation finished".to_string(),
                Ok(Err(e)) => format!("{:#}", e),
                Err(payload) => format!("mutation panicked: {}", panic_message(payload.as_ref())),
            };
            return (Err(self.abandon(&mut checkpoint, lost, &cause)), None);
        }

        let (failure, panic_payload) = match outcome {
            Ok(Ok(result)) => match self.commit(&mut checkpoint) {
                Ok(()) => {
                    let outcome = AtomicOutcome {
                        checkpoint_id: checkpoint.checkpoint_id,
                        result,
                        pre_state_violations,
                    };
                    return (Ok(outcome), None);
                }
                Err(e) => {
                    warn!("Post-state recording failed for {}: {}", checkpoint.short_id(), e);
                    (anyhow::Error::new(e).context("post-state recording failed"), None)
                }
            },
            Ok(Err(e)) => (e, None),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                (anyhow::anyhow!("mutation panicked: {}", message), Some(payload))
            }
        };

        info!("Rolling back checkpoint {}: {:#}", checkpoint.short_id(), failure);
        let result = match self.rollback(&mut checkpoint, &format!("{:#}", failure)) {
            Ok(()) => Err(DocsealError::MutationFailed {
                checkpoint_id: checkpoint.checkpoint_id,
                source: failure,
            }),
            Err(e) => Err(e),
        };
        (result, panic_payload)
    }

    /// Verify every tracked path in the fence before anything is touched
    fn check_pre_state(&self, paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
        let mut violations = Vec::new();

        for path in paths {
            let Some(record) = self.ledger.record(path)? else {
                continue;
            };
            let actual = if path.exists() {
                let outcome = self.ledger.verify(path)?;
                if outcome.valid {
                    continue;
                }
                outcome.live.combined
            } else {
                "<missing>".to_string()
            };

            warn!("Pre-state violation on {:?}", path);
            self.chain.append(ChainEvent::Violation(ViolationRecord {
                kind: ViolationKind::FileMismatch,
                path: Some(path.clone()),
                expected: Some(record.digests.combined.clone()),
                actual: Some(actual.clone()),
                detail: "fenced file changed outside an atomic operation".to_string(),
            }))?;

            if self.strict_pre_state {
                return Err(DocsealError::IntegrityViolation {
                    path: path.clone(),
                    expected: record.digests.combined,
                    actual,
                });
            }
            violations.push(path.clone());
        }
        Ok(violations)
    }

    /// Capture pre-images and persist a `PENDING` checkpoint
    fn begin(&self, paths: Vec<PathBuf>, options: &AtomicOptions) -> Result<Checkpoint> {
        let mut checkpoint = Checkpoint::new(
            paths,
            options.description.clone(),
            self.locks.holder_id().to_string(),
        );
        checkpoint.granularity = options.granularity;

        let captured = self.capture_pre_images(&mut checkpoint);
        let stored = captured.and_then(|_| self.storage.store_checkpoint(&checkpoint));
        if let Err(e) = stored {
            let _ = self.storage.discard_pre_images(&checkpoint.checkpoint_id);
            return Err(e);
        }

        debug!(
            "Checkpoint {} pending over {} file(s)",
            checkpoint.short_id(),
            checkpoint.file_paths.len()
        );
        Ok(checkpoint)
    }

    fn capture_pre_images(&self, checkpoint: &mut Checkpoint) -> Result<()> {
        for (index, path) in checkpoint.file_paths.iter().enumerate() {
            let record = self.ledger.record(path)?;
            let pre_image = match utils::read_file_if_exists(path)? {
                Some(content) => {
                    self.storage
                        .store_pre_image(&checkpoint.checkpoint_id, index, &content)?;
                    PreImage {
                        path: path.clone(),
                        content_hash: Some(utils::hash_data(&content)),
                        size_bytes: content.len() as u64,
                        record,
                        mode: utils::file_mode(path),
                    }
                }
                None => PreImage {
                    path: path.clone(),
                    content_hash: None,
                    size_bytes: 0,
                    record,
                    mode: None,
                },
            };
            checkpoint.pre_images.push(pre_image);
        }
        Ok(())
    }

    /// Record post-state for every fenced file and mark the checkpoint committed
    fn commit(&self, checkpoint: &mut Checkpoint) -> Result<()> {
        // Hash everything first so a read failure leaves the table untouched
        let mut post_state: Vec<(PathBuf, Option<ChecksumRecord>)> = Vec::new();
        for path in &checkpoint.file_paths {
            let record = match fs::symlink_metadata(path) {
                Ok(_) => Some(self.ledger.compute_record(path)?),
                Err(_) => None,
            };
            post_state.push((path.clone(), record));
        }

        for (path, record) in &post_state {
            match record {
                Some(record) => self.ledger.commit_record(record)?,
                None => {
                    self.ledger.forget(path)?;
                }
            }
        }

        for (path, record) in &post_state {
            if let Some(record) = record {
                let outcome = self.ledger.verify(path)?;
                if !outcome.valid {
                    return Err(DocsealError::IntegrityViolation {
                        path: path.clone(),
                        expected: record.digests.combined.clone(),
                        actual: outcome.live.combined,
                    });
                }
            }
        }

        checkpoint.transition(CheckpointStatus::Committed, None);
        self.storage.store_checkpoint(checkpoint)?;
        self.chain.append(ChainEvent::CheckpointCommit {
            checkpoint_id: checkpoint.checkpoint_id.clone(),
            description: checkpoint.description.clone(),
            files: post_state
                .into_iter()
                .map(|(path, record)| CommittedFile {
                    path,
                    combined: record.map(|r| r.digests.combined),
                })
                .collect(),
        })?;

        if let Err(e) = self.storage.discard_pre_images(&checkpoint.checkpoint_id) {
            warn!("Could not discard pre-images of {}: {}", checkpoint.short_id(), e);
        }
        info!("Committed checkpoint {}", checkpoint.short_id());
        Ok(())
    }

    /// Restore every fenced file from its pre-image
    ///
    /// Stops at the first failure and leaves the checkpoint `FAILED_ROLLBACK`
    /// with its pre-images on disk.
    fn rollback(&self, checkpoint: &mut Checkpoint, reason: &str) -> Result<()> {
        let mut restored = Vec::new();

        for (index, pre_image) in checkpoint.pre_images.iter().enumerate() {
            if let Err(e) = self.restore_one(&checkpoint.checkpoint_id, index, pre_image) {
                let not_restored: Vec<PathBuf> = checkpoint.pre_images[index..]
                    .iter()
                    .map(|p| p.path.clone())
                    .collect();
                return Err(self.fail_rollback(checkpoint, reason, restored, not_restored, e));
            }
            restored.push(pre_image.path.clone());
        }

        checkpoint.transition(CheckpointStatus::RolledBack, Some(reason.to_string()));
        self.storage.store_checkpoint(checkpoint)?;
        self.chain.append(ChainEvent::CheckpointRollback {
            checkpoint_id: checkpoint.checkpoint_id.clone(),
            status: CheckpointStatus::RolledBack,
            restored,
            not_restored: Vec::new(),
            error: reason.to_string(),
        })?;

        if let Err(e) = self.storage.discard_pre_images(&checkpoint.checkpoint_id) {
            warn!("Could not discard pre-images of {}: {}", checkpoint.short_id(), e);
        }
        info!("Rolled back checkpoint {}", checkpoint.short_id());
        Ok(())
    }

    fn restore_one(&self, checkpoint_id: &str, index: usize, pre_image: &PreImage) -> Result<()> {
        let path = &pre_image.path;
        match &pre_image.content_hash {
            Some(hash) => {
                let content = self.storage.load_pre_image(checkpoint_id, index, hash)?;
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)
                        .map_err(|e| DocsealError::unavailable(parent.display().to_string(), e))?;
                }
                utils::atomic_write(path, &content)?;
                if let Some(mode) = pre_image.mode {
                    utils::set_file_mode(path, mode)?;
                }
            }
            None => {
                utils::remove_file_if_exists(path)?;
            }
        }
        self.ledger.restore_record(path, pre_image.record.as_ref())?;
        debug!("Restored {:?}", path);
        Ok(())
    }

    fn fail_rollback(
        &self,
        checkpoint: &mut Checkpoint,
        reason: &str,
        restored: Vec<PathBuf>,
        not_restored: Vec<PathBuf>,
        cause: DocsealError,
    ) -> DocsealError {
        error!(
            "Rollback of checkpoint {} failed at {:?}: {}",
            checkpoint.short_id(),
            not_restored.first(),
            cause
        );

        let message = format!("{}; restoration failed: {}", reason, cause);
        checkpoint.transition(CheckpointStatus::FailedRollback, Some(message.clone()));
        if let Err(e) = self.storage.store_checkpoint(checkpoint) {
            error!("Could not persist FAILED_ROLLBACK for {}: {}", checkpoint.short_id(), e);
        }
        if let Err(e) = self.chain.append(ChainEvent::CheckpointRollback {
            checkpoint_id: checkpoint.checkpoint_id.clone(),
            status: CheckpointStatus::FailedRollback,
            restored: restored.clone(),
            not_restored: not_restored.clone(),
            error: message,
        }) {
            error!("Could not record failed rollback of {}: {}", checkpoint.short_id(), e);
        }

        DocsealError::IrrecoverableState {
            checkpoint_id: checkpoint.checkpoint_id.clone(),
            restored,
            not_restored,
            reason: cause.to_string(),
        }
    }

    /// Leave the fence as found after a lease was lost
    ///
    /// Another holder may already own these files, so nothing is restored
    /// and no checksum is recorded. The checkpoint is marked
    /// `FAILED_ROLLBACK` with its pre-images kept for the operator.
    fn abandon(&self, checkpoint: &mut Checkpoint, lost: DocsealError, cause: &str) -> DocsealError {
        let resource_key = match lost {
            DocsealError::LeaseLost { resource_key, .. } => resource_key,
            other => other.to_string(),
        };
        error!(
            "Lease on {} lost during checkpoint {}; leaving files as found",
            resource_key,
            checkpoint.short_id()
        );

        let message = format!(
            "lease on {} lost before completion ({}); files left as found",
            resource_key, cause
        );
        checkpoint.transition(CheckpointStatus::FailedRollback, Some(message.clone()));
        if let Err(e) = self.storage.store_checkpoint(checkpoint) {
            error!("Could not persist FAILED_ROLLBACK for {}: {}", checkpoint.short_id(), e);
        }
        if let Err(e) = self.chain.append(ChainEvent::CheckpointRollback {
            checkpoint_id: checkpoint.checkpoint_id.clone(),
            status: CheckpointStatus::FailedRollback,
            restored: Vec::new(),
            not_restored: checkpoint.file_paths.clone(),
            error: message,
        }) {
            error!("Could not record abandoned checkpoint {}: {}", checkpoint.short_id(), e);
        }

        DocsealError::LeaseLost {
            resource_key,
            checkpoint_id: Some(checkpoint.checkpoint_id.clone()),
        }
    }

    /// Later committed checkpoint sharing a file with `checkpoint`, if any
    fn superseded_by(&self, checkpoint: &Checkpoint) -> Result<Option<String>> {
        Ok(self
            .storage
            .list_checkpoints()?
            .into_iter()
            .find(|other| {
                other.status == CheckpointStatus::Committed
                    && other.started_at > checkpoint.started_at
                    && other.file_paths.iter().any(|p| checkpoint.file_paths.contains(p))
            })
            .map(|other| other.checkpoint_id))
    }

    /// Restoring pre-images now would overwrite a later commit
    fn refuse_superseded(&self, checkpoint: &mut Checkpoint, later: &str) -> DocsealError {
        let message = format!(
            "superseded by committed checkpoint {}; pre-images kept, files left as found",
            later
        );
        warn!("Not rolling back {}: {}", checkpoint.short_id(), message);
        if checkpoint.status != CheckpointStatus::FailedRollback {
            checkpoint.transition(CheckpointStatus::FailedRollback, Some(message.clone()));
            if let Err(e) = self.storage.store_checkpoint(checkpoint) {
                error!("Could not persist FAILED_ROLLBACK for {}: {}", checkpoint.short_id(), e);
            }
        }
        DocsealError::internal(message)
    }

    /// Roll back checkpoints left `PENDING` or `FAILED_ROLLBACK`
    ///
    /// Each checkpoint is re-fenced with the leases it originally used, so a
    /// checkpoint whose operation is still running elsewhere is skipped
    /// rather than disturbed. A checkpoint whose files have since been
    /// committed by a later operation is reported as failed and left alone.
    #[instrument(skip(self))]
    pub fn recover_pending(&self, timeout: Duration) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for mut checkpoint in self.storage.list_checkpoints()? {
            if !checkpoint.status.needs_recovery() {
                continue;
            }

            let keys = lease_keys(&checkpoint.file_paths, checkpoint.granularity);
            let leases = match self.locks.acquire_all(&keys, timeout) {
                Ok(leases) => leases,
                Err(DocsealError::LockTimeout { .. }) => {
                    debug!("Checkpoint {} still leased, skipping", checkpoint.short_id());
                    report.skipped.push(checkpoint.checkpoint_id);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let outcome = self
                .locks
                .hold(leases, |held| self.recover_one(&mut checkpoint, held));

            match outcome {
                None => {}
                Some(Ok(())) => report.recovered.push(checkpoint.checkpoint_id),
                Some(Err(e)) => report.failed.push((checkpoint.checkpoint_id, e.to_string())),
            }
        }

        if !report.is_empty() {
            info!(
                "Recovery: {} rolled back, {} skipped, {} failed",
                report.recovered.len(),
                report.skipped.len(),
                report.failed.len()
            );
        }
        Ok(report)
    }

    /// Roll back one interrupted checkpoint under its leases
    ///
    /// Returns `None` if its owner finished while we waited for the leases.
    fn recover_one(&self, checkpoint: &mut Checkpoint, held: &HeldLeases<'_>) -> Option<Result<()>> {
        // Re-read under the leases; the owner may have finished meanwhile
        let current = match self.storage.load_checkpoint(&checkpoint.checkpoint_id) {
            Ok(current) if !current.status.needs_recovery() => return None,
            Ok(current) => current,
            Err(e) => return Some(Err(e)),
        };
        *checkpoint = current;

        let outcome = match self.superseded_by(checkpoint) {
            Ok(Some(later)) => Err(self.refuse_superseded(checkpoint, &later)),
            Ok(None) => held.confirm().and_then(|_| {
                let reason = format!("recovered interrupted {} operation", checkpoint.status);
                self.rollback(checkpoint, &reason)
            }),
            Err(e) => Err(e),
        };
        Some(outcome)
    }

    /// Every checkpoint record, oldest first
    pub fn list_checkpoints(&self) -> Result<Vec<Checkpoint>> {
        self.storage.list_checkpoints()
    }

    /// One checkpoint record
    pub fn load_checkpoint(&self, checkpoint_id: &str) -> Result<Checkpoint> {
        self.storage.load_checkpoint(checkpoint_id)
    }

    /// Document root
    pub fn root_path(&self) -> &Path {
        &self.root_path
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
