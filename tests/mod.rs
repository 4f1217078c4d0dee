//! Main test module for docseal
//!
//! This module includes all test suites:
//! - Integration tests for multi-component scenarios
//! - Chaos tests for concurrent writers and damaged storage
//! - Property-based tests for integrity invariants

pub mod chaos;
pub mod integration;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use ::docseal::*;
    use filetime::{set_file_mtime, FileTime};
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    fn create_docseal() -> (Docseal, TempDir, TempDir) {
        let root_dir = TempDir::new().unwrap();
        let storage_dir = TempDir::new().unwrap();
        let seal = DocsealBuilder::new()
            .default_timeout(Duration::from_millis(500))
            .build(
                root_dir.path().to_path_buf(),
                storage_dir.path().to_path_buf(),
            )
            .unwrap();
        (seal, root_dir, storage_dir)
    }

    #[test]
    fn test_empty_file() {
        let (seal, root_dir, _storage) = create_docseal();
        fs::write(root_dir.path().join("empty.txt"), b"").unwrap();

        let record = seal.record_checksum("empty.txt").unwrap();
        assert_eq!(record.size_bytes, 0);
        assert_eq!(record.digests, compute_digest_pair(b""));
        assert!(seal.verify("empty.txt").unwrap().valid);
    }

    #[test]
    fn test_mtime_only_touch_stays_valid() {
        let (seal, root_dir, _storage) = create_docseal();
        let doc = root_dir.path().join("doc.txt");
        fs::write(&doc, "unchanged").unwrap();
        seal.record_checksum("doc.txt").unwrap();

        set_file_mtime(&doc, FileTime::from_unix_time(1_000_000_000, 0)).unwrap();

        assert!(seal.verify("doc.txt").unwrap().valid);
    }

    #[test]
    fn test_same_size_rewrite_detected() {
        let (seal, root_dir, _storage) = create_docseal();
        let doc = root_dir.path().join("doc.txt");
        fs::write(&doc, "abcd").unwrap();
        seal.record_checksum("doc.txt").unwrap();

        fs::write(&doc, "abce").unwrap();
        let outcome = seal.verify("doc.txt").unwrap();
        assert!(!outcome.valid);
        assert_eq!(outcome.record.size_bytes, 4);
        assert!(outcome.mismatch_detail().is_some());
    }

    #[test]
    fn test_special_filenames() {
        let (seal, root_dir, _storage) = create_docseal();
        let names = [
            "file with spaces.txt",
            "file-with-dashes.txt",
            "ünïcödé.md",
            "多字节.txt",
            ".hidden",
        ];

        for name in names {
            fs::write(root_dir.path().join(name), name).unwrap();
            seal.record_checksum(name).unwrap();
        }

        assert_eq!(seal.tracked_paths().unwrap().len(), names.len());
        for name in names {
            assert!(seal.verify(name).unwrap().valid, "{} should verify", name);
        }
    }

    #[test]
    fn test_relative_and_absolute_paths_agree() {
        let (seal, root_dir, _storage) = create_docseal();
        fs::create_dir(root_dir.path().join("drafts")).unwrap();
        let doc = root_dir.path().join("drafts").join("doc.txt");
        fs::write(&doc, "text").unwrap();

        seal.record_checksum("drafts/../drafts/doc.txt").unwrap();

        assert_eq!(seal.tracked_paths().unwrap().len(), 1);
        assert!(seal.verify(&doc).unwrap().valid);
    }

    #[test]
    fn test_verify_untracked_file() {
        let (seal, root_dir, _storage) = create_docseal();
        fs::write(root_dir.path().join("loose.txt"), "x").unwrap();

        let err = seal.verify("loose.txt").unwrap_err();
        assert!(matches!(err, DocsealError::NotTracked(_)));
        assert!(!err.is_critical());
    }

    #[test]
    fn test_verify_deleted_file() {
        let (seal, root_dir, _storage) = create_docseal();
        let doc = root_dir.path().join("doc.txt");
        fs::write(&doc, "x").unwrap();
        seal.record_checksum("doc.txt").unwrap();
        fs::remove_file(&doc).unwrap();

        let err = seal.verify("doc.txt").unwrap_err();
        assert!(matches!(err, DocsealError::ResourceUnavailable { .. }));
    }

    #[test]
    fn test_snapshot_with_nothing_tracked() {
        let (seal, _root, _storage) = create_docseal();

        let report = seal.create_integrity_snapshot().unwrap();
        assert_eq!(report.summary.tracked, 0);
        assert!(report.summary.all_valid);
        assert_eq!(report.summary.merkle_root, ZERO_DIGEST);
    }

    #[test]
    fn test_snapshot_counts_deleted_file_as_invalid() {
        let (seal, root_dir, _storage) = create_docseal();
        fs::write(root_dir.path().join("a.txt"), "a").unwrap();
        fs::write(root_dir.path().join("b.txt"), "b").unwrap();
        seal.record_checksum("a.txt").unwrap();
        seal.record_checksum("b.txt").unwrap();
        fs::remove_file(root_dir.path().join("b.txt")).unwrap();

        let report = seal.create_integrity_snapshot().unwrap();
        assert_eq!(report.summary.tracked, 2);
        assert_eq!(report.summary.invalid_count, 1);
        assert!(report.summary.invalid_paths[0].ends_with("b.txt"));
    }

    #[test]
    fn test_forget_untracked_is_false() {
        let (seal, _root, _storage) = create_docseal();
        assert!(!seal.forget("never.txt").unwrap());
    }

    #[test]
    fn test_duplicate_paths_in_fence() {
        let (seal, root_dir, _storage) = create_docseal();
        let doc = root_dir.path().join("doc.txt");
        fs::write(&doc, "v1").unwrap();

        let outcome = seal
            .execute_atomic(AtomicOptions::new(["doc.txt", "./doc.txt", "doc.txt"]), || {
                Ok(fs::write(&doc, "v2")?)
            })
            .unwrap();

        let checkpoint = seal.load_checkpoint(&outcome.checkpoint_id).unwrap();
        assert_eq!(checkpoint.file_paths.len(), 1);
    }

    #[test]
    fn test_reopen_keeps_configuration() {
        let root_dir = TempDir::new().unwrap();
        let storage_dir = TempDir::new().unwrap();
        let root = root_dir.path().to_path_buf();
        let storage = storage_dir.path().to_path_buf();

        DocsealBuilder::new()
            .lock_strategy(LockStrategy::OsLock)
            .strict_pre_state(true)
            .build(root.clone(), storage.clone())
            .unwrap();

        let reopened = Docseal::open(root, storage).unwrap();
        assert_eq!(reopened.config().lock_strategy, LockStrategy::OsLock);
        assert!(reopened.config().strict_pre_state);
    }

    #[test]
    fn test_init_twice_fails() {
        let root_dir = TempDir::new().unwrap();
        let storage_dir = TempDir::new().unwrap();
        let root = root_dir.path().to_path_buf();
        let storage = storage_dir.path().join("seal");

        Docseal::init(root.clone(), storage.clone()).unwrap();
        let err = Docseal::init(root, storage).unwrap_err();
        assert!(matches!(err, DocsealError::StorageAlreadyExists(_)));
    }

    #[test]
    fn test_open_missing_storage() {
        let root_dir = TempDir::new().unwrap();
        let err = Docseal::open(
            root_dir.path().to_path_buf(),
            root_dir.path().join("nowhere"),
        )
        .unwrap_err();
        assert!(matches!(err, DocsealError::StorageNotInitialized(_)));
    }

    #[test]
    fn test_root_must_be_directory() {
        let root_dir = TempDir::new().unwrap();
        let file = root_dir.path().join("file.txt");
        fs::write(&file, "x").unwrap();

        let err = Docseal::init(file, root_dir.path().join(".docseal")).unwrap_err();
        assert!(matches!(err, DocsealError::InvalidArgument(_)));
    }
}
