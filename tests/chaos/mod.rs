//! Chaos testing for docseal
//!
//! Many writers racing over the same files through separate handles, random
//! failures inside mutations, and storage damaged while an operation is in
//! flight.

use ::docseal::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;
use tracing::info;

const WRITERS: usize = 4;
const OPERATIONS_PER_WRITER: usize = 10;

fn open_handle(root: &Path, storage: &Path, holder: String, strategy: LockStrategy) -> Docseal {
    DocsealBuilder::new()
        .holder_id(holder)
        .lock_strategy(strategy)
        .default_timeout(Duration::from_secs(10))
        .build(root.to_path_buf(), storage.to_path_buf())
        .unwrap()
}

/// Read-modify-write a counter from several handles at once
///
/// Lost updates would show up as a final count below the number of
/// committed operations.
fn run_counter_race(strategy: LockStrategy) {
    let root_dir = TempDir::new().unwrap();
    let storage_dir = TempDir::new().unwrap();
    let root = root_dir.path().to_path_buf();
    let storage = storage_dir.path().join("seal");

    let seal = open_handle(&root, &storage, "setup".to_string(), strategy);
    let counter = root.join("counter.txt");
    fs::write(&counter, "0").unwrap();
    seal.record_checksum(&counter).unwrap();

    let committed = Arc::new(AtomicUsize::new(0));
    let rolled_back = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..WRITERS)
        .map(|writer| {
            let root = root.clone();
            let storage = storage.clone();
            let counter = counter.clone();
            let committed = committed.clone();
            let rolled_back = rolled_back.clone();

            thread::spawn(move || {
                let seal = open_handle(&root, &storage, format!("writer-{}", writer), strategy);
                let mut rng = StdRng::seed_from_u64(0xD0C5 + writer as u64);

                for op in 0..OPERATIONS_PER_WRITER {
                    let pause = Duration::from_millis(rng.random_range(0..3));
                    let fail = rng.random_bool(0.25);

                    let result = seal.execute_atomic(
                        AtomicOptions::new([&counter]).description(format!("w{} op{}", writer, op)),
                        || -> anyhow::Result<()> {
                            let current: usize = fs::read_to_string(&counter)?.trim().parse()?;
                            thread::sleep(pause);
                            fs::write(&counter, (current + 1).to_string())?;
                            if fail {
                                anyhow::bail!("writer {} abandoned op {}", writer, op);
                            }
                            Ok(())
                        },
                    );

                    match result {
                        Ok(_) => committed.fetch_add(1, Ordering::SeqCst),
                        Err(DocsealError::MutationFailed { .. }) => rolled_back.fetch_add(1, Ordering::SeqCst),
                        Err(e) => panic!("writer {} op {} failed unexpectedly: {}", writer, op, e),
                    };
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    let committed = committed.load(Ordering::SeqCst);
    let rolled_back = rolled_back.load(Ordering::SeqCst);
    info!("{}: {} committed, {} rolled back", strategy, committed, rolled_back);

    assert_eq!(committed + rolled_back, WRITERS * OPERATIONS_PER_WRITER);
    assert_eq!(fs::read_to_string(&counter).unwrap(), committed.to_string());
    assert!(seal.verify(&counter).unwrap().valid);
    assert!(seal.leases().unwrap().is_empty());

    let report = seal.verify_chain().unwrap();
    assert!(report.valid, "chain violations: {:?}", report.violations);

    let checkpoints = seal.list_checkpoints().unwrap();
    assert_eq!(checkpoints.len(), WRITERS * OPERATIONS_PER_WRITER);
    assert!(checkpoints.iter().all(|c| c.status.is_terminal()));
}

#[test]
fn test_concurrent_writers_file_markers() {
    run_counter_race(LockStrategy::FileMarker);
}

#[test]
fn test_concurrent_writers_os_locks() {
    run_counter_race(LockStrategy::OsLock);
}

#[test]
fn test_concurrent_snapshots_and_writes() {
    let root_dir = TempDir::new().unwrap();
    let storage_dir = TempDir::new().unwrap();
    let root = root_dir.path().to_path_buf();
    let storage = storage_dir.path().join("seal");

    let seal = open_handle(&root, &storage, "setup".to_string(), LockStrategy::FileMarker);
    let docs: Vec<PathBuf> = (0..5).map(|i| root.join(format!("doc{}.txt", i))).collect();
    for doc in &docs {
        fs::write(doc, "initial").unwrap();
        seal.record_checksum(doc).unwrap();
    }

    let writer = {
        let (root, storage, docs) = (root.clone(), storage.clone(), docs.clone());
        thread::spawn(move || {
            let seal = open_handle(&root, &storage, "writer".to_string(), LockStrategy::FileMarker);
            for round in 0..10 {
                seal.execute_atomic(AtomicOptions::new(docs.clone()), || {
                    for doc in &docs {
                        fs::write(doc, format!("round {}", round))?;
                    }
                    Ok(())
                })
                .unwrap();
            }
        })
    };

    let auditor = {
        let (root, storage) = (root.clone(), storage.clone());
        thread::spawn(move || {
            let seal = open_handle(&root, &storage, "auditor".to_string(), LockStrategy::FileMarker);
            (0..10)
                .map(|_| seal.create_integrity_snapshot().unwrap().block_id)
                .collect::<Vec<u64>>()
        })
    };

    writer.join().unwrap();
    let snapshot_blocks = auditor.join().unwrap();

    // Block ids are unique and increasing per appender
    assert!(snapshot_blocks.windows(2).all(|w| w[0] < w[1]));
    assert!(seal.verify_chain().unwrap().valid);

    let last = seal.create_integrity_snapshot().unwrap();
    assert!(last.summary.all_valid);
    assert!(last.summary.chain_valid);
}

#[test]
fn test_damaged_pre_image_is_irrecoverable() {
    let root_dir = TempDir::new().unwrap();
    let storage_dir = TempDir::new().unwrap();
    let root = root_dir.path().to_path_buf();
    let storage = storage_dir.path().join("seal");
    let seal = open_handle(&root, &storage, "victim".to_string(), LockStrategy::FileMarker);

    let doc = root.join("doc.txt");
    fs::write(&doc, "v1").unwrap();
    seal.record_checksum(&doc).unwrap();

    let checkpoints_dir = storage.join("checkpoints");
    let err = seal
        .execute_atomic(AtomicOptions::new([&doc]), || -> anyhow::Result<()> {
            fs::write(&doc, "v2 partial")?;
            for entry in fs::read_dir(&checkpoints_dir)? {
                let entry = entry?;
                if entry.file_type()?.is_dir() {
                    fs::write(entry.path().join("0.pre"), [3u8])?;
                }
            }
            anyhow::bail!("disk hiccup")
        })
        .unwrap_err();

    let DocsealError::IrrecoverableState {
        checkpoint_id,
        restored,
        not_restored,
        ..
    } = &err
    else {
        panic!("expected IrrecoverableState, got {}", err);
    };
    assert!(err.is_critical());
    assert!(restored.is_empty());
    assert_eq!(not_restored.len(), 1);
    assert_eq!(fs::read_to_string(&doc).unwrap(), "v2 partial");

    let checkpoint = seal.load_checkpoint(checkpoint_id).unwrap();
    assert_eq!(checkpoint.status, CheckpointStatus::FailedRollback);
    assert!(seal.leases().unwrap().is_empty());

    // Recovery cannot invent the lost bytes; it reports the failure
    let report = seal.recover_pending().unwrap();
    assert_eq!(report.failed.len(), 1);
    assert_eq!(&report.failed[0].0, checkpoint_id);
    assert!(seal.verify_chain().unwrap().valid);
}
