//! Loading archive settings from TOML

use pakfile::{ArchiveBuilder, ArchiveConfig, PakError};
use std::fs;
use tempfile::TempDir;

#[test]
fn test_config_file_drives_builder() {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("pak.toml");
    fs::write(
        &config_path,
        "max_chunk_size = 8192\nmax_open_handles = 4\ncache_lines = 0\n",
    )
    .unwrap();

    let archive = ArchiveBuilder::new()
        .path(dir.path().join("configured"))
        .config_file(&config_path)
        .unwrap()
        .create()
        .unwrap();

    assert_eq!(archive.chunk_size(), 8192);
    assert_eq!(archive.handle_stats().capacity, 4);
    assert_eq!(archive.cache_stats().capacity, 0);
    assert_eq!(archive.config().digest_threads, ArchiveConfig::default().digest_threads);
}

#[test]
fn test_config_file_errors() {
    let dir = TempDir::new().unwrap();

    let unknown = dir.path().join("unknown.toml");
    fs::write(&unknown, "chunk_ceiling = 10\n").unwrap();
    assert!(matches!(
        ArchiveConfig::load(&unknown),
        Err(PakError::ConfigParse(_))
    ));

    let invalid = dir.path().join("invalid.toml");
    fs::write(&invalid, "max_chunk_size = 0\n").unwrap();
    assert!(matches!(ArchiveConfig::load(&invalid), Err(PakError::Config(_))));

    assert!(matches!(
        ArchiveConfig::load(dir.path().join("absent.toml")),
        Err(PakError::Io(_))
    ));
}
