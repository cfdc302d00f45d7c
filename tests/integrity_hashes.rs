//! Hash hierarchy and corruption detection

use pakfile::{Archive, ArchiveBuilder, FractionKey, InlineDigester, FRACTION_SIZE};
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 253) as u8).collect()
}

fn flip_byte(path: &Path, offset: u64) {
    let mut file = OpenOptions::new().read(true).write(true).open(path).unwrap();
    let mut byte = [0u8; 1];
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.read_exact(&mut byte).unwrap();
    byte[0] ^= 0x5A;
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(&byte).unwrap();
}

fn build(dir: &TempDir, name: &str) -> Archive {
    let archive = ArchiveBuilder::new()
        .path(dir.path().join(name))
        .digest_service(Arc::new(InlineDigester))
        .create()
        .unwrap();
    archive
        .add_file("data/big.bin", 0, &patterned(2 * FRACTION_SIZE as usize + 100), false, None)
        .unwrap();
    archive.add_file("data/small.bin", 0, b"small", false, None).unwrap();
    archive.hash_everything().unwrap();
    archive.write().unwrap();
    archive
}

fn reopen(dir: &TempDir, name: &str) -> Archive {
    ArchiveBuilder::new()
        .path(dir.path().join(name))
        .digest_service(Arc::new(InlineDigester))
        .open()
        .unwrap()
}

#[test]
fn test_hashes_consistent_after_reopen() {
    let dir = TempDir::new().unwrap();
    let written = build(&dir, "consistent");
    let stored = written.metadata_hashes().unwrap();
    drop(written);

    let archive = reopen(&dir, "consistent");
    assert_eq!(archive.metadata_hashes(), Some(stored));
    assert!(archive.test_directory_hash());
    assert!(archive.test_chunk_hash());
    assert_eq!(archive.compute_directory_hash(), stored.tree);
    assert_eq!(archive.compute_chunk_hash(), stored.fractions);

    // Rehashing unchanged chunks reproduces the stored hashes
    let chunk_before = archive.chunk_hash(0).unwrap();
    assert_eq!(archive.hash_chunk_file(0).unwrap(), chunk_before);
    assert_eq!(archive.hash_all_chunk_files().unwrap(), stored.fractions);
    assert!(archive.verify_chunk_file(0).unwrap().is_empty());
}

#[test]
fn test_adding_invalidates_chunk_hashes() {
    let dir = TempDir::new().unwrap();
    let archive = build(&dir, "stale");
    assert!(archive.test_chunk_hash());

    archive.add_file("data/new.bin", 0, b"more bytes", false, None).unwrap();
    assert!(archive.chunk_hash(0).is_none());
    assert!(!archive.test_chunk_hash());
    assert!(!archive.test_directory_hash());

    let hashes = archive.hash_everything().unwrap();
    assert!(archive.test_chunk_hash());
    assert!(archive.test_directory_hash());
    assert_eq!(hashes.fractions, archive.compute_chunk_hash());
    archive.write().unwrap();
}

#[test]
fn test_corrupted_chunk_detected_by_verify() {
    let dir = TempDir::new().unwrap();
    drop(build(&dir, "verify"));

    let archive = reopen(&dir, "verify");
    flip_byte(&archive.paths().chunk_file(0), FRACTION_SIZE as u64 + 7);

    let bad = archive.verify_chunk_file(0).unwrap();
    assert_eq!(bad, vec![FractionKey::new(0, 1)]);

    // The ledger still holds the trusted hashes
    assert!(archive.test_chunk_hash());
    assert!(!archive.verify_file_crc("data/big.bin").unwrap());
    assert!(archive.verify_file_crc("data/small.bin").unwrap());
}

#[test]
fn test_corrupted_fraction_caught_by_cache_and_retried() {
    let dir = TempDir::new().unwrap();
    drop(build(&dir, "cache"));

    let archive = reopen(&dir, "cache");
    let chunk = archive.paths().chunk_file(0);
    flip_byte(&chunk, 3);

    let mut file = archive.open_file("data/big.bin").unwrap();
    let mut head = [0u8; 16];
    file.read_exact(&mut head).unwrap();
    assert!(archive.wait_for_validation(Duration::from_secs(5)));

    let stats = archive.cache_stats();
    assert_eq!(stats.hash_failures, 1);
    assert_eq!(stats.hash_checks, 1);

    // Still corrupt on disk: the retry fails again
    assert_eq!(archive.retry_bad_cache_lines(), 1);
    assert!(archive.wait_for_validation(Duration::from_secs(5)));
    assert_eq!(archive.cache_stats().hash_failures, 2);

    // Repaired on disk: the retry validates and reads are correct again
    flip_byte(&chunk, 3);
    assert_eq!(archive.retry_bad_cache_lines(), 1);
    assert!(archive.wait_for_validation(Duration::from_secs(5)));
    assert_eq!(archive.cache_stats().hash_failures, 2);
    assert_eq!(archive.retry_bad_cache_lines(), 0);

    let expected = patterned(2 * FRACTION_SIZE as usize + 100);
    assert_eq!(archive.read_file("data/big.bin").unwrap(), expected);
}

#[test]
fn test_tampered_directory_warns_but_opens() {
    let dir = TempDir::new().unwrap();
    drop(build(&dir, "tamper"));

    let archive = reopen(&dir, "tamper");
    let dir_file = archive.paths().directory_file();
    drop(archive);

    // Flip a byte of the stored whole-file hash; everything else parses
    let len = std::fs::metadata(&dir_file).unwrap().len();
    flip_byte(&dir_file, len - 1);

    let archive = reopen(&dir, "tamper");
    assert!(archive.test_directory_hash());
    assert_eq!(archive.read_file("data/small.bin").unwrap(), b"small");
}
