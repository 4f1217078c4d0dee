//! Property-based testing for docseal
//!
//! Uses proptest to check integrity invariants across randomly generated
//! contents and edits.

use ::docseal::merkle::{verify_proof, MerkleTree};
use ::docseal::*;
use proptest::prelude::*;
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

/// File contents, including empty ones
fn content_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..512)
}

/// Hex-looking leaves for Merkle trees
fn leaves_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(
        prop::collection::vec(any::<u8>(), 1..16).prop_map(|bytes| compute_digest_pair(&bytes).combined),
        1..20,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Any change to a tracked file's bytes is caught, and only a change is
    #[test]
    fn prop_any_edit_is_detected(original in content_strategy(), edited in content_strategy()) {
        let (seal, root_dir, _storage) = create_docseal();
        let doc = root_dir.path().join("doc.bin");
        fs::write(&doc, &original).unwrap();
        seal.record_checksum(&doc).unwrap();

        fs::write(&doc, &edited).unwrap();
        let outcome = seal.verify(&doc).unwrap();

        prop_assert_eq!(outcome.valid, original == edited);
    }

    /// A failed mutation over several files leaves every byte as it was
    #[test]
    fn prop_failed_mutation_is_all_or_nothing(
        contents in prop::collection::vec(content_strategy(), 3),
        writes in prop::collection::vec(content_strategy(), 3),
        fail_after in 0usize..3,
    ) {
        let (seal, root_dir, _storage) = create_docseal();
        let paths: Vec<_> = (0..3).map(|i| root_dir.path().join(format!("f{}.bin", i))).collect();
        for (path, content) in paths.iter().zip(&contents) {
            fs::write(path, content).unwrap();
            seal.record_checksum(path).unwrap();
        }

        let result = seal.execute_atomic(AtomicOptions::new(paths.clone()), || -> anyhow::Result<()> {
            for (index, (path, content)) in paths.iter().zip(&writes).enumerate() {
                fs::write(path, content)?;
                if index == fail_after {
                    anyhow::bail!("failed after file {}", index);
                }
            }
            Ok(())
        });

        let is_mutation_failed = matches!(result, Err(DocsealError::MutationFailed { .. }));
        prop_assert!(is_mutation_failed);
        for (path, content) in paths.iter().zip(&contents) {
            prop_assert_eq!(&fs::read(path).unwrap(), content);
            prop_assert!(seal.verify(path).unwrap().valid);
        }
        prop_assert!(seal.verify_chain().unwrap().valid);
    }

    /// Rewriting any single block is located at that block
    #[test]
    fn prop_chain_tamper_is_located(files in 2usize..6, target_seed in any::<u64>()) {
        let (seal, root_dir, _storage) = create_docseal();
        for i in 0..files {
            let path = root_dir.path().join(format!("f{}.txt", i));
            fs::write(&path, format!("content {}", i)).unwrap();
            seal.record_checksum(&path).unwrap();
        }

        // Blocks 1..=files are FILE_HASHED
        let target = 1 + target_seed % files as u64;
        let block_path = seal.chain().block_path(target);
        let mut block: serde_json::Value =
            serde_json::from_slice(&fs::read(&block_path).unwrap()).unwrap();
        block["payload"]["combined"] = serde_json::json!(ZERO_DIGEST);
        fs::write(&block_path, serde_json::to_vec(&block).unwrap()).unwrap();

        let report = seal.verify_chain().unwrap();
        prop_assert!(!report.valid);
        prop_assert_eq!(report.violations[0].block_id, target);
        prop_assert_eq!(report.violations[0].kind, ChainViolationKind::HashMismatch);
        if target < files as u64 {
            prop_assert_eq!(report.violations[1].block_id, target + 1);
            prop_assert_eq!(report.violations[1].kind, ChainViolationKind::ChainBreak);
        }
    }

    /// Every leaf proves its inclusion, and the root depends on leaf order
    #[test]
    fn prop_merkle_proofs_hold(leaves in leaves_strategy()) {
        let tree = MerkleTree::from_leaves(&leaves);
        let root = tree.root_hash().unwrap();

        prop_assert_eq!(&root, &merkle::merkle_root(&leaves));
        prop_assert_eq!(&root, &MerkleTree::from_leaves(&leaves).root_hash().unwrap());
        for (index, leaf) in leaves.iter().enumerate() {
            let proof = tree.proof(index).unwrap();
            prop_assert!(verify_proof(leaf, &proof, &root));
        }

        if leaves.len() > 1 && leaves[0] != leaves[1] {
            let mut swapped = leaves.clone();
            swapped.swap(0, 1);
            prop_assert_ne!(root, merkle::merkle_root(&swapped));
        }
    }

    /// The combined digest binds both halves
    #[test]
    fn prop_digest_pair_is_deterministic(content in content_strategy()) {
        let pair = compute_digest_pair(&content);
        prop_assert_eq!(&pair, &compute_digest_pair(&content));
        prop_assert_eq!(pair.digest_a.len(), 64);
        prop_assert_eq!(pair.digest_b.len(), 64);
        prop_assert_ne!(&pair.digest_a, &pair.digest_b);
        prop_assert_ne!(&pair.combined, &pair.digest_a);
    }
}
