//! # pakfile - Packed Content Archives
//!
//! `pakfile` reads and writes directory-indexed, chunked content archives:
//!
//! - **Directory file** (`{base}_dir.pak`) mapping paths to their location,
//!   with a small inline preload per file
//! - **Chunk files** (`{base}_000.pak`, ...) holding file payloads, rolled
//!   over at a configurable ceiling
//! - **Read cache** of 1 MiB fractions, validated in the background
//!   against stored hashes
//! - **Layered hashes** (fraction, chunk, whole archive) and an optional
//!   Ed25519 signature over the directory
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pakfile::{Archive, Result};
//! use std::io::Read;
//!
//! # fn main() -> Result<()> {
//! let archive = Archive::create("assets/pak01")?;
//! archive.add_file("models/a.mdl", 0, &[0xDE, 0xAD, 0xBE, 0xEF], false, None)?;
//! archive.hash_all_chunk_files()?;
//! archive.write()?;
//!
//! let archive = Archive::open("assets/pak01_dir.pak")?;
//! let mut file = archive.open_file("models/a.mdl")?;
//! let mut bytes = Vec::new();
//! file.read_to_end(&mut bytes)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Advanced Usage
//!
//! ```rust,no_run
//! use pakfile::{generate_signing_key, ArchiveBuilder, Result};
//!
//! # fn main() -> Result<()> {
//! let key = generate_signing_key();
//! let archive = ArchiveBuilder::new()
//!     .path("/data/content")
//!     .max_chunk_size(64 * 1024 * 1024)
//!     .cache_lines(16)
//!     .signing_key(key)
//!     .create()?;
//!
//! archive.add_file("maps/start.bsp", 4096, b"...", true, None)?;
//! archive.hash_everything()?;
//! archive.write()?;
//! # Ok(())
//! # }
//! ```

// Engine implementation
pub mod core;

// Re-export core modules internally so crate:: paths in core still work
#[allow(unused_imports)]
pub(crate) use crate::core::{
    archive, chunk, config, digest, directory, error, handle_pool, header, integrity, io, path,
    pattern, read_cache, signature,
};

// Re-export core types that users need
pub use crate::core::{
    archive::{Archive, FileHandle, FileList},
    chunk::MAX_CHUNK_INDEX,
    config::ArchiveConfig,
    digest::{Digest, DigestCompletion, DigestRequest, DigestService, InlineDigester, ThreadPoolDigester},
    directory::{AddFileResult, DirectoryEntry, DIRECTORY_ONLY_CHUNK},
    error::{PakError, Result},
    handle_pool::HandlePoolStats,
    header::DEFAULT_CHUNK_SIZE,
    integrity::{FractionKey, MetadataHashes, FRACTION_SIZE},
    path::{normalize_entry_path, ArchivePaths},
    pattern::Wildcard,
    read_cache::{CacheStats, LineState},
    signature::{generate_signing_key, signing_key_from_bytes, SignatureCheck, SigningKey},
};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Summary of one archived file
///
/// A serializable view of a [`DirectoryEntry`] with the path split into
/// name and parent, suitable for listings.
///
/// # Examples
///
/// ```rust,no_run
/// use pakfile::{Archive, EntryInfo};
///
/// # fn main() -> pakfile::Result<()> {
/// let archive = Archive::open("pak01_dir.pak")?;
/// for info in EntryInfo::collect(&archive, "models/**") {
///     println!("{} ({} bytes, chunk {})", info.path, info.size, info.chunk);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntryInfo {
    /// Full path in the archive (e.g., "models/props/box.mdl")
    pub path: String,

    /// Just the file name (e.g., "box.mdl")
    pub name: String,

    /// Parent directory path; empty for root-level files
    pub parent: String,

    /// File size in bytes, preload included
    pub size: u32,

    /// Bytes stored inline in the directory
    pub preload_size: usize,

    /// Chunk holding the payload, or [`DIRECTORY_ONLY_CHUNK`]
    pub chunk: u16,

    /// Payload offset within `chunk`
    pub offset: u32,

    /// CRC-32 of the content, as lowercase hex
    pub crc: String,
}

impl EntryInfo {
    pub fn from_entry(entry: &DirectoryEntry) -> Self {
        let (parent, name) = match entry.path.rfind('/') {
            Some(idx) => (&entry.path[..idx], &entry.path[idx + 1..]),
            None => ("", entry.path.as_str()),
        };

        EntryInfo {
            path: entry.path.clone(),
            name: name.to_string(),
            parent: parent.to_string(),
            size: entry.size,
            preload_size: entry.preload_size(),
            chunk: entry.chunk,
            offset: entry.offset,
            crc: format!("{:08x}", entry.crc),
        }
    }

    /// Infos for every file matching `pattern`, in path order
    pub fn collect(archive: &Archive, pattern: &str) -> Vec<EntryInfo> {
        archive
            .file_list_matching(pattern)
            .filter_map(|path| archive.entry(&path))
            .map(|entry| EntryInfo::from_entry(&entry))
            .collect()
    }
}

/// Builder for customizing Archive creation
///
/// Provides a fluent API for configuring advanced options.
///
/// # Examples
///
/// ```rust,no_run
/// use pakfile::{ArchiveBuilder, InlineDigester};
/// use std::sync::Arc;
///
/// # fn main() -> pakfile::Result<()> {
/// let archive = ArchiveBuilder::new()
///     .path("/data/pak01")
///     .max_open_handles(64)
///     .digest_service(Arc::new(InlineDigester))
///     .open()?;
/// # Ok(())
/// # }
/// ```
pub struct ArchiveBuilder {
    path: Option<PathBuf>,
    config: ArchiveConfig,
    digest_service: Option<Arc<dyn DigestService>>,
    signing_key: Option<SigningKey>,
}

impl ArchiveBuilder {
    /// Create a new ArchiveBuilder with default settings
    pub fn new() -> Self {
        ArchiveBuilder {
            path: None,
            config: ArchiveConfig::default(),
            digest_service: None,
            signing_key: None,
        }
    }

    /// Set the archive path (base name, `_dir.pak` or any chunk file)
    pub fn path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: ArchiveConfig) -> Self {
        self.config = config;
        self
    }

    /// Load the configuration from a TOML file
    pub fn config_file<P: AsRef<std::path::Path>>(mut self, path: P) -> Result<Self> {
        self.config = ArchiveConfig::load(path)?;
        Ok(self)
    }

    /// Set the chunk ceiling for a new archive
    pub fn max_chunk_size(mut self, size: u32) -> Self {
        self.config.max_chunk_size = size;
        self
    }

    /// Set the maximum number of open chunk handles
    pub fn max_open_handles(mut self, handles: usize) -> Self {
        self.config.max_open_handles = handles;
        self
    }

    /// Set the number of read-cache lines (0 disables the cache)
    pub fn cache_lines(mut self, lines: usize) -> Self {
        self.config.cache_lines = lines;
        self
    }

    /// Turn background validation of cached fractions on or off
    pub fn validate_cache(mut self, enabled: bool) -> Self {
        self.config.validate_cache = enabled;
        self
    }

    /// Use a custom digest service instead of the bundled thread pool
    pub fn digest_service(mut self, service: Arc<dyn DigestService>) -> Self {
        self.digest_service = Some(service);
        self
    }

    /// Sign the directory with this key on every write
    pub fn signing_key(mut self, key: SigningKey) -> Self {
        self.signing_key = Some(key);
        self
    }

    /// Create a new archive, replacing any existing one at the path
    pub fn create(self) -> Result<Archive> {
        let path = self.require_path()?;
        info!("Creating archive at {}", path.display());

        let archive = Archive::create_with(&path, self.config, self.digest_service)?;
        if let Some(key) = self.signing_key {
            archive.set_signing_key(key);
            debug!("Directory signing enabled");
        }
        Ok(archive)
    }

    /// Open an existing archive
    pub fn open(self) -> Result<Archive> {
        let path = self.require_path()?;
        info!("Opening archive at {}", path.display());

        let archive = Archive::open_with(&path, self.config, self.digest_service)?;
        if let Some(key) = self.signing_key {
            archive.set_signing_key(key);
            debug!("Directory signing enabled");
        }
        Ok(archive)
    }

    fn require_path(&self) -> Result<PathBuf> {
        self.path
            .clone()
            .ok_or_else(|| PakError::Config("archive path must be set".to_string()))
    }
}

impl Default for ArchiveBuilder {
    fn default() -> Self {
        Self::new()
    }
}
