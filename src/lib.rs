//! # docseal - Document integrity and atomic checkpoints
//!
//! Proves that a small set of protected files have not been silently
//! altered, and guarantees that any sanctioned change to them either fully
//! succeeds or leaves no trace.
//!
//! ## Overview
//!
//! docseal sits underneath a document-editing application. The application
//! decides *what* to write; docseal makes sure that:
//! - Every protected file has a stored checksum built from two independent
//!   digests, and any write that bypassed docseal is detected
//! - Every hash, verification, commit and rollback is recorded in an
//!   append-only, hash-linked chain that exposes after-the-fact rewriting
//! - Writers to the same files are serialized by short-lived leases that
//!   work across processes
//! - A mutation that fails (or panics) is rolled back byte-for-byte
//!
//! ## Architecture
//!
//! Four components, built bottom-up:
//!
//! - **Hash Ledger** ([`ledger`]): SHA-256 and BLAKE3 per tracked file,
//!   bound together by a combined digest
//! - **Integrity Chain** ([`chain`]): one JSON block per event, each linked
//!   to the previous block's digest
//! - **Lock Manager** ([`lock`]): exclusive leases via marker files or OS
//!   advisory locks
//! - **Atomic Checkpoint Executor** ([`executor`]): leases, pre-images,
//!   mutation, verification, commit or rollback
//!
//! ```text
//! caller ─► Executor ─► LockManager.acquire ─► pre-images ─► mutation
//!                                                   │
//!          LockManager.release ◄─ Chain.append ◄─ Ledger.verify
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use docseal::{AtomicOptions, Docseal};
//! use std::fs;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let seal = Docseal::init(
//!     PathBuf::from("./manuscript"),          // Document root
//!     PathBuf::from("./manuscript/.docseal"), // Where evidence is kept
//! )?;
//!
//! // Track a file
//! seal.record_checksum("chapter1.md")?;
//!
//! // Change it atomically
//! seal.execute_atomic(AtomicOptions::new(["chapter1.md"]), || {
//!     fs::write("./manuscript/chapter1.md", "# Chapter One\n")?;
//!     Ok(())
//! })?;
//!
//! // Check everything
//! let report = seal.create_integrity_snapshot()?;
//! println!("all valid: {}, root {}", report.summary.all_valid, report.summary.merkle_root);
//! # Ok(())
//! # }
//! ```
//!
//! ## Failure Handling
//!
//! ```rust,no_run
//! # use docseal::{AtomicOptions, Docseal, DocsealError};
//! # use std::path::PathBuf;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! # let seal = Docseal::open(PathBuf::from("."), PathBuf::from(".docseal"))?;
//! let result = seal.execute_atomic(AtomicOptions::new(["doc.txt"]), || -> anyhow::Result<()> {
//!     std::fs::write("doc.txt", "half of a rewrite")?;
//!     anyhow::bail!("language model timed out")
//! });
//!
//! match result {
//!     Err(DocsealError::MutationFailed { checkpoint_id, .. }) => {
//!         println!("rolled back {}", checkpoint_id); // doc.txt is unchanged
//!     }
//!     Err(e) if e.is_critical() => eprintln!("operator needed: {}", e.user_message()),
//!     other => println!("{:?}", other.map(|o| o.checkpoint_id)),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Organization
//!
//! - [`docseal`]: the [`Docseal`] facade and [`DocsealBuilder`]
//! - [`ledger`]: checksum records and verification
//! - [`chain`]: the hash-linked event log
//! - [`lock`]: leases and lease strategies
//! - [`executor`]: fenced mutations and recovery
//! - [`checkpoint`]: checkpoint records and pre-image encoding
//! - [`storage`]: on-disk layout
//! - [`merkle`]: Merkle roots and inclusion proofs
//! - [`types`]: configuration and result types
//! - [`error`]: error types

// Public API modules
pub mod chain;
pub mod checkpoint;
pub mod docseal;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod lock;
pub mod merkle;
pub mod storage;
pub mod types;

// Internal modules (not part of public API)
mod utils;

// Re-export main types for convenience
pub use chain::{ChainBlock, ChainEvent, ChainReport, ChainViolation, ChainViolationKind, IntegrityChain};
pub use checkpoint::{Checkpoint, CheckpointStatus};
pub use docseal::{Docseal, DocsealBuilder};
pub use error::{DocsealError, Result};
pub use executor::{AtomicExecutor, RecoveryReport};
pub use ledger::{compute_digest_pair, HashLedger};
pub use lock::{Lease, LeaseStrategy, LockManager};
pub use storage::Storage;
pub use types::*;
pub use utils::{format_bytes, ZERO_DIGEST};
