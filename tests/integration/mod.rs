//! Integration tests for docseal
//!
//! Scenarios that cross component boundaries: several handles sharing one
//! storage directory, crash images, tampered chain files.

use ::docseal::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use walkdir::WalkDir;

/// Test harness owning a document root and a storage directory
pub struct TestEnvironment {
    pub root_dir: TempDir,
    pub storage_dir: TempDir,
}

impl TestEnvironment {
    pub fn new() -> Self {
        Self {
            root_dir: TempDir::new().unwrap(),
            storage_dir: TempDir::new().unwrap(),
        }
    }

    pub fn root(&self) -> PathBuf {
        self.root_dir.path().canonicalize().unwrap()
    }

    pub fn storage(&self) -> PathBuf {
        self.storage_dir.path().join("seal")
    }

    /// A handle with its own holder identity
    pub fn handle(&self, holder: &str) -> Docseal {
        self.builder(holder)
            .build(self.root(), self.storage())
            .unwrap()
    }

    pub fn builder(&self, holder: &str) -> DocsealBuilder {
        DocsealBuilder::new()
            .holder_id(holder)
            .default_timeout(Duration::from_millis(500))
    }

    pub fn write(&self, name: &str, content: &str) -> PathBuf {
        let path = self.root().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        path
    }

    pub fn read(&self, name: &str) -> String {
        fs::read_to_string(self.root().join(name)).unwrap()
    }
}

fn copy_dir(from: &Path, to: &Path) {
    for entry in WalkDir::new(from) {
        let entry = entry.unwrap();
        let target = to.join(entry.path().strip_prefix(from).unwrap());
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).unwrap();
        } else if let Err(e) = fs::copy(entry.path(), &target) {
            // Temp files from a lease renewal can vanish mid-walk
            assert_eq!(e.kind(), std::io::ErrorKind::NotFound, "copy failed: {}", e);
        }
    }
}

#[test]
fn test_two_handles_share_evidence() {
    let env = TestEnvironment::new();
    let alice = env.handle("alice");
    let bob = env.handle("bob");
    let doc = env.write("doc.txt", "v1");

    alice.record_checksum(&doc).unwrap();
    assert!(bob.verify(&doc).unwrap().valid);

    bob.execute_atomic(AtomicOptions::new([&doc]), || Ok(fs::write(&doc, "v2")?))
        .unwrap();
    assert!(alice.verify(&doc).unwrap().valid);

    let checkpoints = alice.list_checkpoints().unwrap();
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(checkpoints[0].holder_id, "bob");
    assert!(alice.verify_chain().unwrap().valid);
}

#[test]
fn test_lease_held_by_other_handle_blocks_writer() {
    let env = TestEnvironment::new();
    let alice = env.handle("alice");
    let bob = env.handle("bob");
    let doc = env.write("doc.txt", "v1");

    let key = doc.to_string_lossy().into_owned();
    let lease = alice.locks().acquire(&key, Duration::ZERO).unwrap();

    let err = bob
        .execute_atomic(
            AtomicOptions::new([&doc]).timeout(Duration::from_millis(50)),
            || Ok(fs::write(&doc, "bob was here")?),
        )
        .unwrap_err();
    assert!(matches!(err, DocsealError::LockTimeout { .. }));
    assert!(err.is_recoverable());
    assert_eq!(env.read("doc.txt"), "v1");

    let visible = bob.leases().unwrap();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].holder_id, "alice");

    alice.locks().release(&lease).unwrap();
    bob.execute_atomic(AtomicOptions::new([&doc]), || Ok(fs::write(&doc, "bob was here")?))
        .unwrap();
    assert_eq!(env.read("doc.txt"), "bob was here");
    assert!(bob.leases().unwrap().is_empty());
}

#[test]
fn test_crash_mid_mutation_is_recovered() {
    let env = TestEnvironment::new();
    let crash_image = TempDir::new().unwrap();
    let doc = env.write("doc.txt", "v1");
    let before;

    {
        let seal = env
            .builder("crashing")
            .lease_ttl(Duration::from_millis(100))
            .build(env.root(), env.storage())
            .unwrap();
        before = seal.record_checksum(&doc).unwrap();

        // Capture storage as it looks while the mutation is in flight
        seal.execute_atomic(AtomicOptions::new([&doc]), || {
            fs::write(&doc, "half of v2")?;
            copy_dir(&env.storage(), crash_image.path());
            Ok(())
        })
        .unwrap();
    }

    // Put the crash image back: file holds partial content, checkpoint is PENDING
    fs::remove_dir_all(env.storage()).unwrap();
    copy_dir(crash_image.path(), &env.storage());
    std::thread::sleep(Duration::from_millis(200));

    let seal = env.handle("restarted");
    let pending: Vec<Checkpoint> = seal
        .list_checkpoints()
        .unwrap()
        .into_iter()
        .filter(|c| c.status == CheckpointStatus::Pending)
        .collect();
    assert_eq!(pending.len(), 1);

    let report = seal.recover_pending().unwrap();
    assert_eq!(report.recovered, vec![pending[0].checkpoint_id.clone()]);
    assert!(report.failed.is_empty());

    assert_eq!(env.read("doc.txt"), "v1");
    assert_eq!(seal.ledger().record(&doc).unwrap(), Some(before));
    assert!(seal.verify(&doc).unwrap().valid);
    assert_eq!(
        seal.load_checkpoint(&pending[0].checkpoint_id).unwrap().status,
        CheckpointStatus::RolledBack
    );
    assert!(seal.verify_chain().unwrap().valid);

    // Nothing left to do on a second pass
    assert!(seal.recover_pending().unwrap().is_empty());
}

#[test]
fn test_tampered_chain_block_is_located() {
    let env = TestEnvironment::new();
    let seal = env.handle("auditor");
    for name in ["a.txt", "b.txt", "c.txt"] {
        let path = env.write(name, name);
        seal.record_checksum(&path).unwrap();
    }
    // 0 INIT, 1..=3 FILE_HASHED
    assert_eq!(seal.chain().len().unwrap(), 4);

    let block_path = seal.chain().block_path(2);
    let mut block: serde_json::Value =
        serde_json::from_slice(&fs::read(&block_path).unwrap()).unwrap();
    block["payload"]["size_bytes"] = serde_json::json!(999);
    fs::write(&block_path, serde_json::to_vec_pretty(&block).unwrap()).unwrap();

    let report = seal.verify_chain().unwrap();
    assert!(!report.valid);
    assert_eq!(report.blocks_checked, 4);
    let located: Vec<(u64, ChainViolationKind)> = report
        .violations
        .iter()
        .map(|v| (v.block_id, v.kind))
        .collect();
    assert_eq!(
        located,
        vec![
            (2, ChainViolationKind::HashMismatch),
            (3, ChainViolationKind::ChainBreak),
        ]
    );

    let err = seal.ensure_chain_intact().unwrap_err();
    assert!(matches!(err, DocsealError::ChainTamperDetected { violations: 2, .. }));
    assert!(err.is_critical());

    let snapshot = seal.create_integrity_snapshot().unwrap();
    assert!(snapshot.summary.all_valid);
    assert!(!snapshot.summary.chain_valid);
}

#[test]
fn test_export_chain_as_json_lines() {
    let env = TestEnvironment::new();
    let seal = env.handle("exporter");
    let doc = env.write("doc.txt", "v1");
    seal.record_checksum(&doc).unwrap();
    seal.create_integrity_snapshot().unwrap();

    let mut exported = Vec::new();
    let count = seal.export_chain(&mut exported).unwrap();
    let text = String::from_utf8(exported).unwrap();

    assert_eq!(count, 3);
    let blocks: Vec<ChainBlock> = text
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(blocks, seal.chain_blocks().unwrap());
    assert_eq!(blocks[2].event.kind(), "SNAPSHOT");
}

#[test]
fn test_record_verifications_appends_verified_blocks() {
    let env = TestEnvironment::new();
    let seal = env
        .builder("auditor")
        .record_verifications(true)
        .build(env.root(), env.storage())
        .unwrap();
    let doc = env.write("doc.txt", "v1");
    seal.record_checksum(&doc).unwrap();

    seal.verify(&doc).unwrap();
    let tail = seal.chain().tail().unwrap().unwrap();
    assert_eq!(tail.event.kind(), "VERIFIED");

    fs::write(&doc, "edited elsewhere").unwrap();
    seal.verify(&doc).unwrap();
    let tail = seal.chain().tail().unwrap().unwrap();
    assert_eq!(tail.event.kind(), "VIOLATION");
}

#[test]
fn test_strict_pre_state_refuses_out_of_sync_files() {
    let env = TestEnvironment::new();
    let seal = env
        .builder("strict")
        .strict_pre_state(true)
        .build(env.root(), env.storage())
        .unwrap();
    let doc = env.write("doc.txt", "v1");
    seal.record_checksum(&doc).unwrap();
    fs::write(&doc, "edited elsewhere").unwrap();

    let err = seal
        .execute_atomic(AtomicOptions::new([&doc]), || Ok(fs::write(&doc, "v2")?))
        .unwrap_err();

    assert!(matches!(err, DocsealError::IntegrityViolation { .. }));
    assert_eq!(env.read("doc.txt"), "edited elsewhere");
    assert!(seal.list_checkpoints().unwrap().is_empty());
    assert_eq!(seal.chain().tail().unwrap().unwrap().event.kind(), "VIOLATION");
    assert!(seal.leases().unwrap().is_empty());
}

#[test]
fn test_lenient_pre_state_reports_and_proceeds() {
    let env = TestEnvironment::new();
    let seal = env.handle("lenient");
    let doc = env.write("doc.txt", "v1");
    seal.record_checksum(&doc).unwrap();
    fs::write(&doc, "edited elsewhere").unwrap();

    let outcome = seal
        .execute_atomic(AtomicOptions::new([&doc]), || Ok(fs::write(&doc, "v2")?))
        .unwrap();

    assert_eq!(outcome.pre_state_violations, vec![seal.ledger().resolve(&doc).unwrap()]);
    assert!(seal.verify(&doc).unwrap().valid);
}

#[test]
fn test_os_lock_strategy_end_to_end() {
    let env = TestEnvironment::new();
    let seal = env
        .builder("os")
        .lock_strategy(LockStrategy::OsLock)
        .build(env.root(), env.storage())
        .unwrap();
    let a = env.write("a.txt", "a1");
    let b = env.write("nested/b.txt", "b1");
    seal.record_checksum(&a).unwrap();
    seal.record_checksum(&b).unwrap();

    let result = seal.execute_atomic(
        AtomicOptions::new([&a, &b]).granularity(LockGranularity::Combined),
        || -> anyhow::Result<()> {
            fs::write(&a, "a2")?;
            fs::write(&b, "b2")?;
            anyhow::bail!("abandoned")
        },
    );
    assert!(matches!(result, Err(DocsealError::MutationFailed { .. })));
    assert_eq!(env.read("a.txt"), "a1");
    assert_eq!(env.read("nested/b.txt"), "b1");

    seal.execute_atomic(AtomicOptions::new([&a, &b]), || {
        fs::write(&a, "a3")?;
        fs::write(&b, "b3")?;
        Ok(())
    })
    .unwrap();

    assert!(seal.leases().unwrap().is_empty());
    let snapshot = seal.create_integrity_snapshot().unwrap();
    assert!(snapshot.summary.all_valid);
    assert!(snapshot.summary.chain_valid);
}

#[test]
fn test_snapshot_root_tracks_content_only() {
    let env = TestEnvironment::new();
    let seal = env.handle("snapshots");
    let doc = env.write("doc.txt", "v1");
    seal.record_checksum(&doc).unwrap();

    let first = seal.create_integrity_snapshot().unwrap();
    let second = seal.create_integrity_snapshot().unwrap();
    assert_eq!(first.summary.merkle_root, second.summary.merkle_root);
    assert_ne!(first.summary.snapshot_id, second.summary.snapshot_id);
    assert_eq!(second.block_id, first.block_id + 1);

    fs::write(&doc, "v2").unwrap();
    let third = seal.create_integrity_snapshot().unwrap();
    assert_ne!(third.summary.merkle_root, first.summary.merkle_root);
}

#[test]
fn test_slow_writer_keeps_fence_past_ttl() {
    let env = TestEnvironment::new();
    let doc = env.write("doc.txt", "v1");
    let ttl = Duration::from_millis(100);
    let slow = env.builder("slow").lease_ttl(ttl).build(env.root(), env.storage()).unwrap();
    let fast = env.builder("fast").lease_ttl(ttl).build(env.root(), env.storage()).unwrap();
    slow.record_checksum(&doc).unwrap();

    let slow_finished = Arc::new(Mutex::new(None::<Instant>));
    let slow_writer = {
        let doc = doc.clone();
        let slow_finished = slow_finished.clone();
        thread::spawn(move || {
            slow.execute_atomic(AtomicOptions::new([&doc]), || -> anyhow::Result<()> {
                fs::write(&doc, "A-partial")?;
                thread::sleep(Duration::from_millis(400));
                *slow_finished.lock().unwrap() = Some(Instant::now());
                anyhow::bail!("slow writer gave up")
            })
        })
    };

    // Start well after the first lease would have expired without renewal
    thread::sleep(Duration::from_millis(200));
    let fast_started = Mutex::new(None::<Instant>);
    fast.execute_atomic(
        AtomicOptions::new([&doc]).timeout(Duration::from_secs(5)),
        || {
            *fast_started.lock().unwrap() = Some(Instant::now());
            Ok(fs::write(&doc, "B-committed")?)
        },
    )
    .unwrap();

    let slow_result = slow_writer.join().unwrap();
    assert!(matches!(slow_result, Err(DocsealError::MutationFailed { .. })));

    let slow_finished = slow_finished.lock().unwrap().unwrap();
    let fast_started = fast_started.lock().unwrap().unwrap();
    assert!(fast_started > slow_finished, "fences overlapped in flight");

    assert_eq!(env.read("doc.txt"), "B-committed");
    assert!(fast.verify(&doc).unwrap().valid);
    assert!(fast.recover_pending().unwrap().is_empty());
}

#[test]
fn test_overlapping_combined_fences_never_share_a_file() {
    let env = TestEnvironment::new();
    for name in ["a.txt", "b.txt", "c.txt"] {
        env.write(name, "0");
    }

    let inside_b = Arc::new(AtomicUsize::new(0));
    let max_inside_b = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = [["a.txt", "b.txt"], ["b.txt", "c.txt"]]
        .into_iter()
        .enumerate()
        .map(|(n, fence)| {
            let seal = env.handle(&format!("combined-{}", n));
            let root = env.root();
            let (inside_b, max_inside_b) = (inside_b.clone(), max_inside_b.clone());
            thread::spawn(move || {
                for _ in 0..5 {
                    seal.execute_atomic(
                        AtomicOptions::new(fence)
                            .granularity(LockGranularity::Combined)
                            .timeout(Duration::from_secs(10)),
                        || {
                            let now = inside_b.fetch_add(1, Ordering::SeqCst) + 1;
                            max_inside_b.fetch_max(now, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(20));
                            fs::write(root.join("b.txt"), n.to_string())?;
                            inside_b.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        },
                    )
                    .unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(max_inside_b.load(Ordering::SeqCst), 1);
    let seal = env.handle("auditor");
    assert_eq!(seal.list_checkpoints().unwrap().len(), 10);
    assert!(seal.leases().unwrap().is_empty());
}

#[test]
fn test_damaged_tail_block_does_not_stop_commits() {
    let env = TestEnvironment::new();
    let seal = env.handle("editor");
    let doc = env.write("doc.txt", "v1");
    seal.record_checksum(&doc).unwrap();

    let tail = seal.chain().len().unwrap() as u64 - 1;
    fs::write(seal.chain().block_path(tail), "\0\0 not a block").unwrap();

    let err = seal.ensure_chain_intact().unwrap_err();
    assert!(matches!(err, DocsealError::ChainTamperDetected { violations: 1, .. }));

    seal.execute_atomic(AtomicOptions::new([&doc]), || Ok(fs::write(&doc, "v2")?))
        .unwrap();
    assert!(seal.verify(&doc).unwrap().valid);

    let snapshot = seal.create_integrity_snapshot().unwrap();
    assert!(snapshot.summary.all_valid);
    assert!(!snapshot.summary.chain_valid);

    // The damage stays pinned to the one block
    let report = seal.verify_chain().unwrap();
    let located: Vec<(u64, ChainViolationKind)> = report
        .violations
        .iter()
        .map(|v| (v.block_id, v.kind))
        .collect();
    assert_eq!(located, vec![(tail, ChainViolationKind::HashMismatch)]);
}
