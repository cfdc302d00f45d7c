//! Archive configuration
//!
//! Every field has a default, so an empty TOML document is a valid
//! configuration:
//!
//! ```toml
//! max_chunk_size = 209715200
//! max_open_handles = 512
//! cache_lines = 4
//! digest_threads = 2
//! validate_cache = true
//! ```

use crate::error::{PakError, Result};
use crate::header::DEFAULT_CHUNK_SIZE;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default ceiling on simultaneously open chunk handles
pub const DEFAULT_MAX_OPEN_HANDLES: usize = 512;

/// Default number of 1 MiB read-cache lines
pub const DEFAULT_CACHE_LINES: usize = 4;

/// Default number of background digest workers
pub const DEFAULT_DIGEST_THREADS: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ArchiveConfig {
    /// Ceiling for newly created chunk files, in bytes
    ///
    /// Only used when creating an archive; an existing archive keeps the
    /// chunk size recorded in its directory header.
    pub max_chunk_size: u32,

    /// Maximum number of chunk files held open at once
    pub max_open_handles: usize,

    /// Number of cached 1 MiB fractions (0 disables the read cache)
    pub cache_lines: usize,

    /// Worker threads for the bundled digest service
    pub digest_threads: usize,

    /// Submit cached fractions for background digest verification
    pub validate_cache: bool,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        ArchiveConfig {
            max_chunk_size: DEFAULT_CHUNK_SIZE,
            max_open_handles: DEFAULT_MAX_OPEN_HANDLES,
            cache_lines: DEFAULT_CACHE_LINES,
            digest_threads: DEFAULT_DIGEST_THREADS,
            validate_cache: true,
        }
    }
}

impl ArchiveConfig {
    /// Parse and validate a TOML configuration document
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: ArchiveConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Check that every field is usable
    pub fn validate(&self) -> Result<()> {
        if self.max_chunk_size == 0 {
            return Err(PakError::Config("max_chunk_size must be non-zero".to_string()));
        }

        if self.max_open_handles == 0 {
            return Err(PakError::Config(
                "max_open_handles must be at least 1".to_string(),
            ));
        }

        if self.validate_cache && self.cache_lines > 0 && self.digest_threads == 0 {
            return Err(PakError::Config(
                "digest_threads must be at least 1 when validate_cache is enabled".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ArchiveConfig::default();
        assert_eq!(config.max_chunk_size, 200 * 1024 * 1024);
        assert_eq!(config.max_open_handles, 512);
        assert_eq!(config.cache_lines, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_toml_is_default() {
        let config = ArchiveConfig::from_toml_str("").unwrap();
        assert_eq!(config, ArchiveConfig::default());
    }

    #[test]
    fn test_partial_toml() {
        let config = ArchiveConfig::from_toml_str("max_chunk_size = 4096\ncache_lines = 0").unwrap();
        assert_eq!(config.max_chunk_size, 4096);
        assert_eq!(config.cache_lines, 0);
        assert_eq!(config.max_open_handles, DEFAULT_MAX_OPEN_HANDLES);
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(matches!(
            ArchiveConfig::from_toml_str("max_chunk_size = 0"),
            Err(PakError::Config(_))
        ));
        assert!(matches!(
            ArchiveConfig::from_toml_str("max_open_handles = 0"),
            Err(PakError::Config(_))
        ));
        assert!(matches!(
            ArchiveConfig::from_toml_str("digest_threads = 0"),
            Err(PakError::Config(_))
        ));
    }

    #[test]
    fn test_rejects_unknown_fields() {
        assert!(matches!(
            ArchiveConfig::from_toml_str("chunk_sise = 10"),
            Err(PakError::ConfigParse(_))
        ));
    }
}
