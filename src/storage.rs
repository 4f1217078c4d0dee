//! Durable storage layout for docseal
//!
//! Every piece of authoritative state lives on disk under one storage root,
//! so it survives restarts and is shared by every process pointed at the
//! same directory:
//!
//! ```text
//! storage_root/
//! ├── metadata.json              # Storage metadata and configuration
//! ├── checksums/                 # Checksum table, keyed by path
//! │   └── <sha256(path)>.json
//! ├── chain/                     # Append-only block sequence, keyed by id
//! │   └── <id:020>.json
//! ├── leases/                    # Lease table, keyed by resource
//! │   └── <sha256(key)>.lease | .lock
//! └── checkpoints/               # Atomic operation records
//!     ├── <checkpoint_id>.json
//!     └── <checkpoint_id>/<n>.pre   # LZ4 pre-images
//! ```
//!
//! Records are replaced with [`utils::atomic_write`]; anything that must be
//! created at most once (chain blocks, lease markers) goes through
//! [`utils::create_exclusive`].
//!
//! ## Thread Safety
//!
//! `Storage` holds no mutable in-memory state besides the metadata behind a
//! `RwLock`; all coordination happens on the filesystem.

use crate::checkpoint::{self, Checkpoint};
use crate::error::{DocsealError, Result};
use crate::types::{ChecksumRecord, DocsealConfig, StorageMetadata};
use crate::utils;
use chrono::Utc;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace};

const FORMAT_VERSION: u32 = 1;
const METADATA_FILE: &str = "metadata.json";
const CHECKSUMS_DIR: &str = "checksums";
const CHAIN_DIR: &str = "chain";
const LEASES_DIR: &str = "leases";
const CHECKPOINTS_DIR: &str = "checkpoints";

/// On-disk state of one docseal repository
pub struct Storage {
    /// Root directory for storage
    root: PathBuf,
    /// Storage metadata and configuration
    metadata: RwLock<StorageMetadata>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").field("root", &self.root).finish()
    }
}

impl Storage {
    /// Initialize a new storage repository
    ///
    /// # Errors
    ///
    /// - [`DocsealError::StorageAlreadyExists`] if metadata is already present
    /// - [`DocsealError::ResourceUnavailable`] if directories cannot be created
    pub fn init(root: PathBuf, config: DocsealConfig) -> Result<Self> {
        if root.join(METADATA_FILE).exists() {
            return Err(DocsealError::StorageAlreadyExists(root));
        }

        for dir in [CHECKSUMS_DIR, CHAIN_DIR, LEASES_DIR, CHECKPOINTS_DIR] {
            fs::create_dir_all(root.join(dir))
                .map_err(|e| DocsealError::unavailable(root.join(dir).display().to_string(), e))?;
        }

        let metadata = StorageMetadata {
            format_version: FORMAT_VERSION,
            docseal_version: env!("CARGO_PKG_VERSION").to_string(),
            created_at: Utc::now(),
            config,
        };
        write_json(&root.join(METADATA_FILE), &metadata)?;

        info!("Initialized storage at {:?}", root);
        Ok(Self {
            root,
            metadata: RwLock::new(metadata),
        })
    }

    /// Open an existing storage repository
    ///
    /// # Errors
    ///
    /// - [`DocsealError::StorageNotInitialized`] if no metadata is present
    pub fn open(root: PathBuf) -> Result<Self> {
        let metadata_path = root.join(METADATA_FILE);
        let metadata: StorageMetadata = match read_json(&metadata_path)? {
            Some(metadata) => metadata,
            None => return Err(DocsealError::StorageNotInitialized(root)),
        };
        if metadata.format_version != FORMAT_VERSION {
            return Err(DocsealError::CorruptRecord(format!(
                "unsupported storage format version {}",
                metadata.format_version
            )));
        }

        info!("Opened storage at {:?}", root);
        Ok(Self {
            root,
            metadata: RwLock::new(metadata),
        })
    }

    /// Initialize new storage or open existing storage
    pub fn init_or_open(root: PathBuf, config: DocsealConfig) -> Result<Self> {
        if root.join(METADATA_FILE).exists() {
            Storage::open(root)
        } else {
            Storage::init(root, config)
        }
    }

    /// Get storage root path
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get storage metadata
    pub fn metadata(&self) -> &RwLock<StorageMetadata> {
        &self.metadata
    }

    /// Current configuration
    pub fn config(&self) -> DocsealConfig {
        self.metadata.read().config.clone()
    }

    /// Replace the stored configuration
    pub fn update_config<F>(&self, updater: F) -> Result<()>
    where
        F: FnOnce(&mut DocsealConfig),
    {
        let mut metadata = self.metadata.write();
        updater(&mut metadata.config);
        write_json(&self.root.join(METADATA_FILE), &*metadata)
    }

    // --- checksum table -------------------------------------------------

    fn checksum_path(&self, path: &Path) -> PathBuf {
        let key = utils::hash_data(path.to_string_lossy().as_bytes());
        self.root.join(CHECKSUMS_DIR).join(format!("{}.json", key))
    }

    /// Load the checksum record for a canonical path
    pub fn load_checksum(&self, path: &Path) -> Result<Option<ChecksumRecord>> {
        read_json(&self.checksum_path(path))
    }

    /// Store (or replace) a checksum record
    pub fn store_checksum(&self, record: &ChecksumRecord) -> Result<()> {
        write_json(&self.checksum_path(&record.path), record)?;
        trace!("Stored checksum for {:?}", record.path);
        Ok(())
    }

    /// Remove a checksum record; returns whether one existed
    pub fn remove_checksum(&self, path: &Path) -> Result<bool> {
        utils::remove_file_if_exists(&self.checksum_path(path))
    }

    /// All checksum records, sorted by path
    pub fn list_checksums(&self) -> Result<Vec<ChecksumRecord>> {
        let mut records: Vec<ChecksumRecord> = self
            .list_json_files(CHECKSUMS_DIR)?
            .iter()
            .filter_map(|p| read_json(p).transpose())
            .collect::<Result<_>>()?;
        records.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(records)
    }

    // --- block sequence -------------------------------------------------

    /// Path of the block with the given id
    pub fn block_path(&self, id: u64) -> PathBuf {
        self.root.join(CHAIN_DIR).join(format!("{:020}.json", id))
    }

    /// Ids of all blocks on disk, ascending
    pub fn block_ids(&self) -> Result<Vec<u64>> {
        let mut ids: Vec<u64> = self
            .list_json_files(CHAIN_DIR)?
            .iter()
            .filter_map(|p| p.file_stem()?.to_str()?.parse().ok())
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    // --- lease table ----------------------------------------------------

    /// Path of the lease marker (or lock file) for a resource
    pub fn lease_path(&self, resource_key: &str, extension: &str) -> PathBuf {
        let key = utils::hash_data(resource_key.as_bytes());
        self.root.join(LEASES_DIR).join(format!("{}.{}", key, extension))
    }

    /// All files in the lease directory with the given extension
    pub fn lease_files(&self, extension: &str) -> Result<Vec<PathBuf>> {
        self.list_files(LEASES_DIR, extension)
    }

    // --- checkpoints ----------------------------------------------------

    fn checkpoint_path(&self, checkpoint_id: &str) -> PathBuf {
        self.root
            .join(CHECKPOINTS_DIR)
            .join(format!("{}.json", checkpoint_id))
    }

    fn pre_image_dir(&self, checkpoint_id: &str) -> PathBuf {
        self.root.join(CHECKPOINTS_DIR).join(checkpoint_id)
    }

    /// Store (or replace) a checkpoint record
    pub fn store_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        write_json(&self.checkpoint_path(&checkpoint.checkpoint_id), checkpoint)?;
        debug!(
            "Stored checkpoint {} ({})",
            checkpoint.short_id(),
            checkpoint.status
        );
        Ok(())
    }

    /// Load a checkpoint record
    pub fn load_checkpoint(&self, checkpoint_id: &str) -> Result<Checkpoint> {
        read_json(&self.checkpoint_path(checkpoint_id))?
            .ok_or_else(|| DocsealError::CheckpointNotFound(checkpoint_id.to_string()))
    }

    /// All checkpoint records, oldest first
    pub fn list_checkpoints(&self) -> Result<Vec<Checkpoint>> {
        let mut checkpoints: Vec<Checkpoint> = self
            .list_json_files(CHECKPOINTS_DIR)?
            .iter()
            .filter_map(|p| read_json(p).transpose())
            .collect::<Result<_>>()?;
        checkpoints.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(checkpoints)
    }

    /// Persist the pre-image of the `index`-th fenced file
    pub fn store_pre_image(&self, checkpoint_id: &str, index: usize, content: &[u8]) -> Result<()> {
        let dir = self.pre_image_dir(checkpoint_id);
        fs::create_dir_all(&dir)
            .map_err(|e| DocsealError::unavailable(dir.display().to_string(), e))?;
        utils::atomic_write(
            &dir.join(format!("{}.pre", index)),
            &checkpoint::encode_pre_image(content),
        )
    }

    /// Load and check the pre-image of the `index`-th fenced file
    pub fn load_pre_image(&self, checkpoint_id: &str, index: usize, content_hash: &str) -> Result<Vec<u8>> {
        let path = self.pre_image_dir(checkpoint_id).join(format!("{}.pre", index));
        let stored = utils::read_file(&path)?;
        checkpoint::decode_pre_image(&stored, content_hash)
    }

    /// Delete all pre-images of a checkpoint
    pub fn discard_pre_images(&self, checkpoint_id: &str) -> Result<()> {
        let dir = self.pre_image_dir(checkpoint_id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DocsealError::unavailable(dir.display().to_string(), e)),
        }
    }

    // --- helpers ----------------------------------------------------------

    fn list_json_files(&self, dir: &str) -> Result<Vec<PathBuf>> {
        self.list_files(dir, "json")
    }

    fn list_files(&self, dir: &str, extension: &str) -> Result<Vec<PathBuf>> {
        let dir_path = self.root.join(dir);
        let entries = fs::read_dir(&dir_path)
            .map_err(|e| DocsealError::unavailable(dir_path.display().to_string(), e))?;

        let mut files = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let visible = path
                .file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| !n.starts_with('.'));
            if visible && path.is_file() && path.extension().map_or(false, |e| e == extension) {
                files.push(path);
            }
        }
        Ok(files)
    }
}

/// Read and decode a JSON file, `Ok(None)` if it does not exist
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match utils::read_file_if_exists(path)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Encode and atomically write a JSON file
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    utils::atomic_write(path, &json)
}
