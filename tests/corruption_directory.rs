//! Damaged directory files must fail to open

use pakfile::{Archive, PakError};
use std::fs;
use tempfile::TempDir;

fn written(dir: &TempDir) -> std::path::PathBuf {
    let archive = Archive::create(dir.path().join("pak")).unwrap();
    archive.add_file("a/one.txt", 2, b"first file", false, None).unwrap();
    archive.add_file("b/two.txt", 0, b"second file", false, None).unwrap();
    archive.hash_everything().unwrap();
    archive.write().unwrap();
    archive.paths().directory_file()
}

#[test]
fn test_truncated_directory() {
    let dir = TempDir::new().unwrap();
    let path = written(&dir);

    let bytes = fs::read(&path).unwrap();
    fs::write(&path, &bytes[..bytes.len() - 10]).unwrap();
    assert!(matches!(Archive::open(&path), Err(PakError::Corrupt(_))));

    fs::write(&path, &bytes[..20]).unwrap();
    assert!(Archive::open(&path).is_err());
}

#[test]
fn test_bad_magic() {
    let dir = TempDir::new().unwrap();
    let path = written(&dir);

    let mut bytes = fs::read(&path).unwrap();
    bytes[0] ^= 0xFF;
    fs::write(&path, &bytes).unwrap();
    assert!(matches!(Archive::open(&path), Err(PakError::InvalidMagic(_))));
}

#[test]
fn test_unsupported_version() {
    let dir = TempDir::new().unwrap();
    let path = written(&dir);

    let mut bytes = fs::read(&path).unwrap();
    bytes[4..8].copy_from_slice(&9u32.to_le_bytes());
    fs::write(&path, &bytes).unwrap();
    assert!(matches!(
        Archive::open(&path),
        Err(PakError::UnsupportedVersion(9))
    ));
}

#[test]
fn test_garbled_tree() {
    let dir = TempDir::new().unwrap();
    let path = written(&dir);

    // Zero the whole tree: it then ends after the first (empty) extension
    // level and leaves trailing bytes
    let mut bytes = fs::read(&path).unwrap();
    let tree_size = u32::from_le_bytes(bytes[8..12].try_into().unwrap()) as usize;
    for byte in &mut bytes[32..32 + tree_size] {
        *byte = 0;
    }
    fs::write(&path, &bytes).unwrap();
    assert!(matches!(Archive::open(&path), Err(PakError::Corrupt(_))));
}

#[test]
fn test_missing_directory() {
    let dir = TempDir::new().unwrap();
    assert!(matches!(
        Archive::open(dir.path().join("nothing_dir.pak")),
        Err(PakError::Io(_))
    ));
}
