//! Path-scoped exclusive leases
//!
//! A lease gives one holder exclusive use of a resource (normally a canonical
//! file path) for a bounded time. Leases are the only synchronization
//! primitive shared between processes, so both implementations keep their
//! state in the storage directory:
//!
//! - [`FileMarkerStrategy`]: a JSON marker published with an exclusive
//!   create. A marker whose lease has expired can be reclaimed by anyone.
//! - [`OsLockStrategy`]: an advisory OS lock on a per-resource lock file. The
//!   kernel drops the lock if the holder dies, so expiry is informational.
//!
//! [`LockManager`] wraps either strategy with deadline-bounded exponential
//! backoff, and [`LockManager::hold`] keeps leases renewed while work runs
//! under them.
//!
//! ## Reclaiming Expired Markers
//!
//! ```text
//! marker ──rename──► tombstone ──(same expired lease?)──► delete
//!                                        │
//!                                        └─ no ──► link back, give up
//! ```
//!
//! The rename is atomic, so at most one reclaimer takes a given marker. A
//! marker renewed after the reclaimer inspected it no longer matches and is
//! linked back. If a third party publishes a marker while the original is
//! out, the link back fails and the displaced holder finds out through
//! [`HeldLeases::confirm`].

use crate::error::{DocsealError, Result};
use crate::storage::{self, Storage};
use crate::types::LockStrategy;
use crate::utils;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, instrument, trace, warn};

/// First backoff delay between acquisition attempts
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(5);
/// Upper bound on the backoff delay
pub const MAX_BACKOFF: Duration = Duration::from_millis(100);
/// Floor for the renewal interval of held leases
const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(1);

const MARKER_EXTENSION: &str = "lease";
const LOCK_EXTENSION: &str = "lock";

/// Exclusive claim on one resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Unique identifier of this claim
    pub lease_id: String,
    /// Resource being claimed
    pub resource_key: String,
    /// Opaque identity of the holder
    pub holder_id: String,
    /// When the lease was granted
    pub acquired_at: DateTime<Utc>,
    /// When the lease stops protecting the resource
    pub expires_at: DateTime<Utc>,
    /// Mechanism backing the lease
    pub strategy: LockStrategy,
}

fn expiry_after(start: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500));
    start.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl Lease {
    fn new(resource_key: &str, holder_id: &str, ttl: Duration, strategy: LockStrategy) -> Self {
        let acquired_at = Utc::now();
        Self {
            lease_id: uuid::Uuid::new_v4().to_string(),
            resource_key: resource_key.to_string(),
            holder_id: holder_id.to_string(),
            acquired_at,
            expires_at: expiry_after(acquired_at, ttl),
            strategy,
        }
    }

    /// Same claim with its expiry pushed to `ttl` from now
    fn renewed(&self, ttl: Duration) -> Self {
        Self {
            expires_at: expiry_after(Utc::now(), ttl),
            ..self.clone()
        }
    }

    /// Whether the lease has run past its expiry
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Time left before expiry (zero if expired)
    pub fn remaining(&self) -> Duration {
        (self.expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Mechanism that grants and revokes leases
///
/// Implementations never block: [`try_acquire`](LeaseStrategy::try_acquire)
/// returns `Ok(None)` when the resource is held by someone else and the
/// caller decides whether to wait.
pub trait LeaseStrategy: Send + Sync + std::fmt::Debug {
    /// Which strategy this is
    fn kind(&self) -> LockStrategy;

    /// Claim a resource if it is free
    fn try_acquire(&self, resource_key: &str, holder_id: &str, ttl: Duration) -> Result<Option<Lease>>;

    /// Give up a lease; a lease that is no longer held is not an error
    fn release(&self, lease: &Lease) -> Result<()>;

    /// Extend a lease that is still held and unexpired
    ///
    /// Returns `Ok(None)` if the lease was lost; a lost lease is never
    /// re-created.
    fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Option<Lease>>;

    /// Current holder of a resource, if any
    fn inspect(&self, resource_key: &str) -> Result<Option<Lease>>;

    /// Every lease currently visible
    fn list(&self) -> Result<Vec<Lease>>;
}

/// Leases as exclusively created marker files with a TTL
#[derive(Debug)]
pub struct FileMarkerStrategy {
    storage: Arc<Storage>,
}

impl FileMarkerStrategy {
    /// Strategy over the lease table in `storage`
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    fn marker_path(&self, resource_key: &str) -> PathBuf {
        self.storage.lease_path(resource_key, MARKER_EXTENSION)
    }

    /// Remove the marker only if it still holds a lease accepted by `is_target`
    ///
    /// Returns whether the marker was taken.
    fn take_marker(&self, marker: &Path, is_target: impl Fn(&Lease) -> bool) -> Result<bool> {
        let current: Option<Lease> = storage::read_json(marker).unwrap_or(None);
        if !current.as_ref().map_or(false, &is_target) {
            return Ok(false);
        }

        let tombstone = marker.with_extension(format!("{}.reclaim", uuid::Uuid::new_v4().simple()));
        match fs::rename(marker, &tombstone) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(DocsealError::unavailable(marker.display().to_string(), e)),
        }

        let taken: Option<Lease> = storage::read_json(&tombstone).unwrap_or(None);
        if taken.as_ref().map_or(false, &is_target) {
            utils::remove_file_if_exists(&tombstone)?;
            return Ok(true);
        }

        // Somebody else's marker: put it back untouched
        match fs::hard_link(&tombstone, marker) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => error!(
                "Lease marker {:?} was re-published while out for reclaim; holder {} is displaced",
                marker,
                taken.as_ref().map_or("<unknown>", |l| l.holder_id.as_str())
            ),
            Err(e) => warn!("Could not restore lease marker {:?}: {}", marker, e),
        }
        utils::remove_file_if_exists(&tombstone)?;
        Ok(false)
    }
}

impl LeaseStrategy for FileMarkerStrategy {
    fn kind(&self) -> LockStrategy {
        LockStrategy::FileMarker
    }

    fn try_acquire(&self, resource_key: &str, holder_id: &str, ttl: Duration) -> Result<Option<Lease>> {
        let marker = self.marker_path(resource_key);
        let lease = Lease::new(resource_key, holder_id, ttl, LockStrategy::FileMarker);
        let bytes = serde_json::to_vec_pretty(&lease)?;

        if utils::create_exclusive(&marker, &bytes)? {
            return Ok(Some(lease));
        }

        let existing: Option<Lease> = storage::read_json(&marker)?;
        let reclaimed = match existing {
            Some(current) if current.is_expired() => {
                let taken = self.take_marker(&marker, |l| *l == current)?;
                if taken {
                    warn!(
                        "Reclaimed expired lease on {} from {}",
                        resource_key, current.holder_id
                    );
                }
                taken
            }
            Some(_) => false,
            // Released between our create and read
            None => true,
        };

        if reclaimed && utils::create_exclusive(&marker, &bytes)? {
            return Ok(Some(lease));
        }
        Ok(None)
    }

    fn release(&self, lease: &Lease) -> Result<()> {
        let marker = self.marker_path(&lease.resource_key);
        if !self.take_marker(&marker, |l| l.lease_id == lease.lease_id)? {
            trace!("Lease {} on {} was no longer held", lease.lease_id, lease.resource_key);
        }
        Ok(())
    }

    fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Option<Lease>> {
        let marker = self.marker_path(&lease.resource_key);
        let current: Option<Lease> = storage::read_json(&marker)?;
        // An expired marker may already be out for reclaim
        if !current.map_or(false, |c| c.lease_id == lease.lease_id && !c.is_expired()) {
            return Ok(None);
        }
        let renewed = lease.renewed(ttl);
        storage::write_json(&marker, &renewed)?;
        Ok(Some(renewed))
    }

    fn inspect(&self, resource_key: &str) -> Result<Option<Lease>> {
        storage::read_json(&self.marker_path(resource_key))
    }

    fn list(&self) -> Result<Vec<Lease>> {
        let mut leases = Vec::new();
        for path in self.storage.lease_files(MARKER_EXTENSION)? {
            if let Some(lease) = storage::read_json::<Lease>(&path)? {
                leases.push(lease);
            }
        }
        leases.sort_by(|a, b| a.resource_key.cmp(&b.resource_key));
        Ok(leases)
    }
}

/// Leases as advisory OS locks held for as long as the handle is open
#[derive(Debug)]
pub struct OsLockStrategy {
    storage: Arc<Storage>,
    /// Open, locked handles keyed by lease id
    held: DashMap<String, File>,
}

impl OsLockStrategy {
    /// Strategy over the lease table in `storage`
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            held: DashMap::new(),
        }
    }

    fn open_lock_file(path: &Path) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| DocsealError::unavailable(path.display().to_string(), e))
    }

    /// Lease recorded in a lock file, if someone holds the lock
    ///
    /// Advisory locks conflict between separate handles even within one
    /// process, so this also sees leases held by this process.
    fn inspect_path(&self, path: &Path) -> Result<Option<Lease>> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(DocsealError::unavailable(path.display().to_string(), e)),
        };
        // A free lock means the recorded lease (if any) is stale
        if FileExt::try_lock_shared(&file).is_ok() {
            let _ = FileExt::unlock(&file);
            return Ok(None);
        }

        let mut content = Vec::new();
        file.read_to_end(&mut content)?;
        if content.is_empty() {
            return Ok(None);
        }
        Ok(serde_json::from_slice(&content).ok())
    }
}

impl LeaseStrategy for OsLockStrategy {
    fn kind(&self) -> LockStrategy {
        LockStrategy::OsLock
    }

    fn try_acquire(&self, resource_key: &str, holder_id: &str, ttl: Duration) -> Result<Option<Lease>> {
        let path = self.storage.lease_path(resource_key, LOCK_EXTENSION);
        let mut file = Self::open_lock_file(&path)?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {}
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => return Ok(None),
            Err(e) => return Err(DocsealError::unavailable(path.display().to_string(), e)),
        }

        let lease = Lease::new(resource_key, holder_id, ttl, LockStrategy::OsLock);
        let bytes = serde_json::to_vec_pretty(&lease)?;
        if let Err(e) = write_lease(&mut file, &bytes) {
            let _ = FileExt::unlock(&file);
            return Err(DocsealError::unavailable(path.display().to_string(), e));
        }

        self.held.insert(lease.lease_id.clone(), file);
        Ok(Some(lease))
    }

    fn release(&self, lease: &Lease) -> Result<()> {
        let Some((_, file)) = self.held.remove(&lease.lease_id) else {
            trace!("Lease {} on {} was no longer held", lease.lease_id, lease.resource_key);
            return Ok(());
        };
        let _ = file.set_len(0);
        FileExt::unlock(&file)?;
        Ok(())
    }

    fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Option<Lease>> {
        let Some(mut file) = self.held.get_mut(&lease.lease_id) else {
            return Ok(None);
        };
        let renewed = lease.renewed(ttl);
        let bytes = serde_json::to_vec_pretty(&renewed)?;
        write_lease(file.value_mut(), &bytes)?;
        Ok(Some(renewed))
    }

    fn inspect(&self, resource_key: &str) -> Result<Option<Lease>> {
        self.inspect_path(&self.storage.lease_path(resource_key, LOCK_EXTENSION))
    }

    fn list(&self) -> Result<Vec<Lease>> {
        let mut leases = Vec::new();
        for path in self.storage.lease_files(LOCK_EXTENSION)? {
            if let Some(lease) = self.inspect_path(&path)? {
                leases.push(lease);
            }
        }
        leases.sort_by(|a, b| a.resource_key.cmp(&b.resource_key));
        Ok(leases)
    }
}

fn write_lease(file: &mut File, bytes: &[u8]) -> std::io::Result<()> {
    file.set_len(0)?;
    file.write_all(bytes)?;
    file.sync_data()
}

/// Grants leases with bounded waiting
///
/// # Example
///
/// ```rust,no_run
/// use docseal::lock::LockManager;
/// use docseal::storage::Storage;
/// use docseal::types::{DocsealConfig, LockStrategy};
/// use std::path::PathBuf;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = DocsealConfig::new(PathBuf::from("/srv/docs"), PathBuf::from("/srv/docs/.docseal"));
/// let storage = Arc::new(Storage::init_or_open(config.storage_path.clone(), config)?);
/// let locks = LockManager::new(storage, LockStrategy::FileMarker, "editor-1".into(), Duration::from_secs(30));
///
/// let lease = locks.acquire("/srv/docs/doc.txt", Duration::from_millis(500))?;
/// // ... exclusive work ...
/// locks.release(&lease)?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct LockManager {
    strategy: Box<dyn LeaseStrategy>,
    holder_id: String,
    ttl: Duration,
}

impl LockManager {
    /// Manager using the built-in strategy selected by `strategy`
    pub fn new(storage: Arc<Storage>, strategy: LockStrategy, holder_id: String, ttl: Duration) -> Self {
        let strategy: Box<dyn LeaseStrategy> = match strategy {
            LockStrategy::FileMarker => Box::new(FileMarkerStrategy::new(storage)),
            LockStrategy::OsLock => Box::new(OsLockStrategy::new(storage)),
        };
        Self::with_strategy(strategy, holder_id, ttl)
    }

    /// Manager over a custom strategy
    pub fn with_strategy(strategy: Box<dyn LeaseStrategy>, holder_id: String, ttl: Duration) -> Self {
        Self {
            strategy,
            holder_id,
            ttl,
        }
    }

    /// Identity written into every lease
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Strategy in use
    pub fn strategy(&self) -> LockStrategy {
        self.strategy.kind()
    }

    /// Lease lifetime
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Acquire a lease, waiting up to `timeout`
    ///
    /// Retries with exponential backoff starting at 5 ms and capped at
    /// 100 ms. A zero timeout makes exactly one attempt.
    ///
    /// # Errors
    ///
    /// - [`DocsealError::LockTimeout`] if the resource stayed held
    /// - [`DocsealError::ResourceUnavailable`] if the lease table is unusable
    #[instrument(skip(self))]
    pub fn acquire(&self, resource_key: &str, timeout: Duration) -> Result<Lease> {
        let start = Instant::now();
        let deadline = start + timeout;
        let mut backoff = INITIAL_BACKOFF;

        loop {
            if let Some(lease) = self.strategy.try_acquire(resource_key, &self.holder_id, self.ttl)? {
                debug!("Acquired lease {} on {}", lease.lease_id, resource_key);
                return Ok(lease);
            }

            let now = Instant::now();
            if now >= deadline {
                let waited_ms = start.elapsed().as_millis() as u64;
                warn!("Timed out after {} ms waiting for {}", waited_ms, resource_key);
                return Err(DocsealError::LockTimeout {
                    resource_key: resource_key.to_string(),
                    waited_ms,
                });
            }

            thread::sleep(backoff.min(deadline - now));
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// Acquire several leases in order, sharing one deadline
    ///
    /// On failure every lease already acquired is released before the error
    /// is returned.
    pub fn acquire_all(&self, resource_keys: &[String], timeout: Duration) -> Result<Vec<Lease>> {
        let deadline = Instant::now() + timeout;
        let mut leases = Vec::with_capacity(resource_keys.len());

        for key in resource_keys {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.acquire(key, remaining) {
                Ok(lease) => leases.push(lease),
                Err(e) => {
                    self.release_all(&leases);
                    return Err(e);
                }
            }
        }
        Ok(leases)
    }

    /// Release a lease; releasing twice or after expiry is fine
    pub fn release(&self, lease: &Lease) -> Result<()> {
        self.strategy.release(lease)?;
        debug!("Released lease {} on {}", lease.lease_id, lease.resource_key);
        Ok(())
    }

    /// Release leases in reverse acquisition order, logging failures
    pub fn release_all(&self, leases: &[Lease]) {
        for lease in leases.iter().rev() {
            if let Err(e) = self.release(lease) {
                warn!("Failed to release lease on {}: {}", lease.resource_key, e);
            }
        }
    }

    /// Current lease on a resource, if any
    pub fn inspect(&self, resource_key: &str) -> Result<Option<Lease>> {
        self.strategy.inspect(resource_key)
    }

    /// Every lease currently visible
    pub fn list_leases(&self) -> Result<Vec<Lease>> {
        self.strategy.list()
    }

    /// Push a held lease's expiry out by the TTL
    ///
    /// Returns `Ok(None)` if the lease has been lost.
    pub fn renew(&self, lease: &Lease) -> Result<Option<Lease>> {
        self.strategy.renew(lease, self.ttl)
    }

    /// Whether `lease` is still the live claim on its resource
    ///
    /// OS locks stay exclusive past their recorded expiry, so only marker
    /// leases lapse with time.
    pub fn is_held(&self, lease: &Lease) -> Result<bool> {
        let current = self.strategy.inspect(&lease.resource_key)?;
        Ok(current.map_or(false, |c| {
            c.lease_id == lease.lease_id && (c.strategy == LockStrategy::OsLock || !c.is_expired())
        }))
    }

    /// Run `work` while the leases are renewed in the background
    ///
    /// A heartbeat renews every lease each third of the TTL, so work that
    /// outlives the TTL keeps its fence. The leases are released when `work`
    /// returns or unwinds. A lease that is lost anyway, because the process
    /// stalled past expiry and someone reclaimed it, is reported by
    /// [`HeldLeases::confirm`].
    pub fn hold<R>(&self, leases: Vec<Lease>, work: impl FnOnce(&HeldLeases<'_>) -> R) -> R {
        let held = HeldLeases {
            locks: self,
            leases: Mutex::new(leases),
            lost: Mutex::new(None),
        };
        let interval = (self.ttl / 3).max(MIN_RENEW_INTERVAL);

        thread::scope(|scope| {
            let (stop, stopped) = mpsc::channel::<()>();
            let heartbeat = &held;
            scope.spawn(move || {
                while let Err(RecvTimeoutError::Timeout) = stopped.recv_timeout(interval) {
                    heartbeat.renew_all();
                }
            });
            let result = work(&held);
            drop(stop);
            result
        })
    }
}

/// Leases kept alive by [`LockManager::hold`]
#[derive(Debug)]
pub struct HeldLeases<'a> {
    locks: &'a LockManager,
    leases: Mutex<Vec<Lease>>,
    /// First resource whose lease was found lost
    lost: Mutex<Option<String>>,
}

impl HeldLeases<'_> {
    /// The leases as last renewed
    pub fn leases(&self) -> Vec<Lease> {
        self.leases.lock().clone()
    }

    /// Check that every lease is still ours
    ///
    /// # Errors
    ///
    /// - [`DocsealError::LeaseLost`] naming the first resource whose lease
    ///   expired and was taken, or could not be checked
    pub fn confirm(&self) -> Result<()> {
        if let Some(resource_key) = self.lost.lock().clone() {
            return Err(lease_lost(resource_key));
        }
        for lease in self.leases.lock().iter() {
            let held = match self.locks.is_held(lease) {
                Ok(held) => held,
                Err(e) => {
                    warn!("Could not confirm lease on {}: {}", lease.resource_key, e);
                    false
                }
            };
            if !held {
                self.mark_lost(&lease.resource_key);
                return Err(lease_lost(lease.resource_key.clone()));
            }
        }
        Ok(())
    }

    fn renew_all(&self) {
        let mut leases = self.leases.lock();
        for lease in leases.iter_mut() {
            match self.locks.renew(lease) {
                Ok(Some(renewed)) => *lease = renewed,
                Ok(None) => self.mark_lost(&lease.resource_key),
                Err(e) => warn!("Could not renew lease on {}: {}", lease.resource_key, e),
            }
        }
        trace!("Renewed {} lease(s)", leases.len());
    }

    fn mark_lost(&self, resource_key: &str) {
        let mut lost = self.lost.lock();
        if lost.is_none() {
            error!("Lease on {} was lost while held", resource_key);
            *lost = Some(resource_key.to_string());
        }
    }
}

impl Drop for HeldLeases<'_> {
    fn drop(&mut self) {
        let leases = std::mem::take(self.leases.get_mut());
        self.locks.release_all(&leases);
    }
}

fn lease_lost(resource_key: String) -> DocsealError {
    DocsealError::LeaseLost {
        resource_key,
        checkpoint_id: None,
    }
}
