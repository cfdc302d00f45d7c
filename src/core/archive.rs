//! Main Archive API
//!
//! Ties the content directory, chunk files, handle pool, read cache and
//! integrity ledger together behind one type. Every operation takes
//! `&self`; an `Archive` can be shared across threads and read from
//! concurrently while files are being added.

use crate::chunk::{locate, ChunkFileSet, MAX_CHUNK_INDEX};
use crate::config::ArchiveConfig;
use crate::digest::{Digest, DigestService, ThreadPoolDigester};
use crate::directory::{AddFileResult, ContentDirectory, DirectoryEntry, DIRECTORY_ONLY_CHUNK};
use crate::error::{PakError, Result};
use crate::handle_pool::{ChunkReader, HandlePool, HandlePoolStats};
use crate::integrity::{
    compute_directory_hash, hash_fractions, FractionKey, IntegrityLedger, MetadataHashes,
};
use crate::io::{assemble_directory, write_atomic, DirectoryImage};
use crate::path::{normalize_entry_path, ArchivePaths};
use crate::pattern::Wildcard;
use crate::read_cache::{CacheStats, ReadCache};
use crate::signature::{check_directory_signature, SignatureCheck, SigningKey};
use parking_lot::RwLock;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Packed content archive
///
/// One directory file (`{base}_dir.pak`) indexes files whose bytes live in
/// numbered chunk files (`{base}_000.pak`, ...). Changes to the index are
/// kept in memory until [`Archive::write`].
pub struct Archive {
    /// Names of the directory and chunk files
    paths: ArchivePaths,

    /// Settings the archive was opened with
    config: ArchiveConfig,

    /// Path index
    directory: RwLock<ContentDirectory>,

    /// Chunk files, append side
    chunks: ChunkFileSet,

    /// Chunk files, read side
    pool: Arc<HandlePool>,

    /// Fraction cache in front of the pool
    cache: ReadCache,

    /// Fraction, chunk and metadata hashes
    ledger: Arc<IntegrityLedger>,

    /// Key used to sign the directory on write
    signing_key: RwLock<Option<SigningKey>>,
}

impl Archive {
    /// Create a new, empty archive with default settings
    ///
    /// Nothing is written until the first file is added or
    /// [`Archive::write`] is called. Chunk files left over from an older
    /// archive with the same base name are removed.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::create_with(path, ArchiveConfig::default(), None)
    }

    /// Open an existing archive with default settings
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, ArchiveConfig::default(), None)
    }

    /// Create with explicit settings and an optional digest service
    pub fn create_with<P: AsRef<Path>>(
        path: P,
        config: ArchiveConfig,
        digests: Option<Arc<dyn DigestService>>,
    ) -> Result<Self> {
        config.validate()?;
        let paths = ArchivePaths::new(path)?;

        let mut stale = 0;
        for chunk in 0..=MAX_CHUNK_INDEX {
            let file = paths.chunk_file(chunk);
            match std::fs::remove_file(&file) {
                Ok(()) => stale += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => break,
                Err(e) => return Err(e.into()),
            }
        }
        if stale > 0 {
            tracing::info!("Removed {} stale chunk files for {}", stale, paths.base().display());
        }

        let chunks = ChunkFileSet::new(paths.clone(), config.max_chunk_size);
        let archive = Self::assemble(
            paths,
            config,
            ContentDirectory::new(),
            IntegrityLedger::new(),
            chunks,
            digests,
        );

        tracing::info!("Created archive {}", archive.paths.base().display());
        Ok(archive)
    }

    /// Open with explicit settings and an optional digest service
    ///
    /// The chunk size recorded in the directory header wins over
    /// `config.max_chunk_size`.
    pub fn open_with<P: AsRef<Path>>(
        path: P,
        config: ArchiveConfig,
        digests: Option<Arc<dyn DigestService>>,
    ) -> Result<Self> {
        config.validate()?;
        let paths = ArchivePaths::new(path)?;

        let bytes = std::fs::read(paths.directory_file())?;
        let image = DirectoryImage::parse(&bytes)?;
        let directory = ContentDirectory::parse_tree(image.tree)?;
        let ledger = IntegrityLedger::from_sections(image.fraction_section, image.metadata_section)?;

        match image.metadata_matches()? {
            Some(true) => {}
            Some(false) => tracing::warn!(
                "Metadata hashes of {} do not match its contents",
                paths.directory_file().display()
            ),
            None => tracing::debug!("{} has no metadata hashes", paths.directory_file().display()),
        }

        let chunk_size = image.header.chunk_size;
        if chunk_size != config.max_chunk_size {
            tracing::debug!(
                "Using recorded chunk size {} instead of configured {}",
                chunk_size,
                config.max_chunk_size
            );
        }
        let chunks = ChunkFileSet::discover(paths.clone(), chunk_size)?;

        let archive = Self::assemble(paths, config, directory, ledger, chunks, digests);
        tracing::info!(
            "Opened archive {} ({} files, {} chunks)",
            archive.paths.base().display(),
            archive.file_count(),
            archive.chunks.chunk_count()
        );
        Ok(archive)
    }

    fn assemble(
        paths: ArchivePaths,
        config: ArchiveConfig,
        directory: ContentDirectory,
        ledger: IntegrityLedger,
        chunks: ChunkFileSet,
        digests: Option<Arc<dyn DigestService>>,
    ) -> Self {
        let pool = Arc::new(HandlePool::new(paths.clone(), config.max_open_handles));
        let ledger = Arc::new(ledger);

        let digests = if config.validate_cache && config.cache_lines > 0 {
            Some(digests.unwrap_or_else(|| {
                Arc::new(ThreadPoolDigester::new(config.digest_threads)) as Arc<dyn DigestService>
            }))
        } else {
            None
        };
        let cache = ReadCache::new(
            Arc::clone(&pool),
            Arc::clone(&ledger),
            config.cache_lines,
            digests,
        );

        Archive {
            paths,
            config,
            directory: RwLock::new(directory),
            chunks,
            pool,
            cache,
            ledger,
            signing_key: RwLock::new(None),
        }
    }

    // ---- reading ----

    /// Open a read cursor on a file
    ///
    /// The cursor works on a snapshot of the entry; later updates or
    /// removal of the path do not affect it.
    pub fn open_file(&self, path: &str) -> Result<FileHandle<'_>> {
        let normalized = normalize_entry_path(path)?;
        let entry = self
            .directory
            .read()
            .get(&normalized)
            .cloned()
            .ok_or(PakError::FileNotFound(normalized))?;

        Ok(FileHandle {
            archive: self,
            entry,
            position: 0,
        })
    }

    /// Read a whole file into memory
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let mut handle = self.open_file(path)?;
        let mut content = Vec::with_capacity(handle.len() as usize);
        handle.read_to_end(&mut content)?;
        Ok(content)
    }

    /// Check a file's content against its recorded CRC
    pub fn verify_file_crc(&self, path: &str) -> Result<bool> {
        let mut handle = self.open_file(path)?;
        let mut hasher = crc32fast::Hasher::new();
        let mut buffer = vec![0u8; 64 * 1024];
        loop {
            let n = handle.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }
        Ok(hasher.finalize() == handle.crc())
    }

    pub fn file_exists(&self, path: &str) -> bool {
        match normalize_entry_path(path) {
            Ok(normalized) => self.directory.read().contains(&normalized),
            Err(_) => false,
        }
    }

    /// Copy of a file's directory entry
    pub fn entry(&self, path: &str) -> Option<DirectoryEntry> {
        let normalized = normalize_entry_path(path).ok()?;
        self.directory.read().get(&normalized).cloned()
    }

    pub fn file_count(&self) -> usize {
        self.directory.read().len()
    }

    /// Every file path, sorted
    pub fn file_list(&self) -> FileList {
        FileList {
            paths: self.directory.read().paths().into_iter(),
            filter: None,
        }
    }

    /// File paths matching a wildcard pattern
    ///
    /// See [`Wildcard`] for the pattern syntax.
    pub fn file_list_matching(&self, pattern: &str) -> FileList {
        FileList {
            paths: self.directory.read().paths().into_iter(),
            filter: Some(Wildcard::new(pattern)),
        }
    }

    /// Directory paths matching a wildcard pattern
    pub fn directory_list(&self, pattern: &str) -> Vec<String> {
        let filter = Wildcard::new(pattern);
        self.directory
            .read()
            .directories()
            .into_iter()
            .filter(|dir| filter.matches(dir))
            .collect()
    }

    // ---- writing ----

    /// Add or replace a file
    ///
    /// The first `preload_size` bytes (capped at the file size) are stored
    /// inline in the directory; the rest goes to the chunk files. With
    /// `allow_multi_chunk` a payload may span chunk files, otherwise it
    /// must fit within one. `crc_override` skips computing the CRC.
    ///
    /// Re-adding identical content (same CRC, size and preload size) is a
    /// no-op. Otherwise the payload is written before the index is
    /// updated, so readers see either the old file or the new one.
    pub fn add_file(
        &self,
        path: &str,
        preload_size: usize,
        data: &[u8],
        allow_multi_chunk: bool,
        crc_override: Option<u32>,
    ) -> Result<AddFileResult> {
        let normalized = normalize_entry_path(path)?;
        let size = u32::try_from(data.len()).map_err(|_| PakError::FileTooLarge {
            size: data.len() as u64,
            limit: u32::MAX as u64,
        })?;

        let preload_size = preload_size.min(data.len());
        if preload_size > u16::MAX as usize {
            return Err(PakError::PreloadTooLarge(preload_size));
        }

        let crc = crc_override.unwrap_or_else(|| crc32fast::hash(data));

        if self.directory.read().classify(&normalized, crc, size, preload_size)
            == AddFileResult::SameContentNoop
        {
            tracing::debug!("{} unchanged, skipping write", normalized);
            return Ok(AddFileResult::SameContentNoop);
        }

        let payload = &data[preload_size..];
        let (chunk, offset) = if payload.is_empty() {
            (DIRECTORY_ONLY_CHUNK, 0)
        } else {
            let (region, touched) = self.chunks.write_payload(payload, allow_multi_chunk)?;
            self.forget_written_range(region.offset as u64, payload.len() as u64, &touched);
            (region.chunk, region.offset)
        };

        let entry = DirectoryEntry {
            path: normalized,
            chunk,
            offset,
            size,
            crc,
            preload: Arc::from(&data[..preload_size]),
        };

        let mut directory = self.directory.write();
        // Another writer may have stored the same content since the check above
        if directory.classify(&entry.path, crc, size, preload_size)
            == AddFileResult::SameContentNoop
        {
            tracing::debug!("{} stored concurrently, dropping duplicate payload", entry.path);
            return Ok(AddFileResult::SameContentNoop);
        }
        let result = match directory.insert(entry) {
            Some(_) => AddFileResult::UpdatedFile,
            None => AddFileResult::NewFile,
        };
        tracing::debug!(
            "Added {} ({} bytes, chunk {}, offset {}): {:?}",
            path,
            size,
            chunk,
            offset,
            result
        );

        Ok(result)
    }

    /// Insert a prepared entry without touching chunk data
    ///
    /// Returns the entry it replaced, if any.
    pub fn add_file_to_directory(&self, mut entry: DirectoryEntry) -> Result<Option<DirectoryEntry>> {
        entry.path = normalize_entry_path(&entry.path)?;

        if entry.preload.len() > u16::MAX as usize {
            return Err(PakError::PreloadTooLarge(entry.preload.len()));
        }
        if entry.preload.len() as u64 > entry.size as u64 {
            return Err(PakError::Corrupt(format!(
                "{} has {} preload bytes but is {} bytes long",
                entry.path,
                entry.preload.len(),
                entry.size
            )));
        }

        Ok(self.directory.write().insert(entry))
    }

    /// Remove a file from the index
    ///
    /// Returns whether the path existed. Its chunk bytes are not reclaimed.
    pub fn remove_file_from_directory(&self, path: &str) -> bool {
        let Ok(normalized) = normalize_entry_path(path) else {
            return false;
        };
        let removed = self.directory.write().remove(&normalized).is_some();
        if removed {
            tracing::debug!("Removed {} from directory", normalized);
        }
        removed
    }

    /// Persist the directory file
    ///
    /// Writes the tree, the fraction hashes currently in the ledger, fresh
    /// metadata hashes and, when a signing key is set, a signature.
    pub fn write(&self) -> Result<()> {
        let mut directory = self.directory.write();
        self.chunks.sync()?;

        let tree = directory.serialize_tree();
        let fraction_section = self.ledger.serialize_fractions();
        let signing_key = self.signing_key.read();

        let (bytes, hashes) = assemble_directory(
            self.chunks.max_chunk_size(),
            &tree,
            &fraction_section,
            signing_key.as_ref(),
        )?;
        write_atomic(&self.paths.directory_file(), &bytes)?;

        self.ledger.set_metadata(hashes);
        directory.mark_clean();

        tracing::info!(
            "Wrote {} ({} files, {} bytes{})",
            self.paths.directory_file().display(),
            directory.len(),
            bytes.len(),
            if signing_key.is_some() { ", signed" } else { "" }
        );
        Ok(())
    }

    /// Unwritten changes to the index exist
    pub fn is_dirty(&self) -> bool {
        self.directory.read().is_dirty()
    }

    /// Sign the directory with `key` on every following write
    pub fn set_signing_key(&self, key: SigningKey) {
        *self.signing_key.write() = Some(key);
    }

    pub fn clear_signing_key(&self) {
        *self.signing_key.write() = None;
    }

    /// Public half of the configured signing key
    pub fn public_key(&self) -> Option<[u8; 32]> {
        self.signing_key
            .read()
            .as_ref()
            .map(|key| key.verifying_key().to_bytes())
    }

    // ---- integrity ----

    /// Check the on-disk directory signature against `public_key`
    pub fn check_signature(&self, public_key: &[u8]) -> SignatureCheck {
        match std::fs::read(self.paths.directory_file()) {
            Ok(bytes) => check_directory_signature(&bytes, public_key),
            Err(e) => {
                tracing::debug!("Cannot read directory for signature check: {}", e);
                SignatureCheck::IoFailure
            }
        }
    }

    /// Recompute the fraction hashes of one chunk from disk
    ///
    /// Returns the new chunk hash. The metadata hashes are stale until
    /// [`Archive::hash_metadata`] runs.
    pub fn hash_chunk_file(&self, chunk: u16) -> Result<Digest> {
        let handle = self.pool.acquire(chunk);
        if !handle.is_valid() {
            return Err(PakError::FileNotFound(
                self.paths.chunk_file(chunk).display().to_string(),
            ));
        }

        let fractions = hash_fractions(chunk, ChunkReader::new(handle))?;
        let count = fractions.len();
        let digest = self.ledger.record_chunk(chunk, fractions);
        tracing::debug!("Hashed chunk {} ({} fractions): {}", chunk, count, digest);
        Ok(digest)
    }

    /// Rehash every chunk file
    ///
    /// Returns the whole-archive hash over the new fraction hashes.
    pub fn hash_all_chunk_files(&self) -> Result<Digest> {
        for chunk in 0..self.chunks.chunk_count() {
            self.hash_chunk_file(chunk)?;
        }
        Ok(self.ledger.compute_chunk_hash())
    }

    /// Recompute the tree, fraction-section and whole-file hashes
    pub fn hash_metadata(&self) -> Result<MetadataHashes> {
        let tree = self.directory.read().serialize_tree();
        let fraction_section = self.ledger.serialize_fractions();
        let signing_key = self.signing_key.read();

        let (_, hashes) = assemble_directory(
            self.chunks.max_chunk_size(),
            &tree,
            &fraction_section,
            signing_key.as_ref(),
        )?;
        self.ledger.set_metadata(hashes);
        Ok(hashes)
    }

    /// Rehash all chunks, then the metadata
    pub fn hash_everything(&self) -> Result<MetadataHashes> {
        let archive_hash = self.hash_all_chunk_files()?;
        tracing::info!(
            "Hashed {} chunks of {}: {}",
            self.chunks.chunk_count(),
            self.paths.base().display(),
            archive_hash
        );
        self.hash_metadata()
    }

    /// Forget the fraction hashes of one chunk
    pub fn discard_chunk_hashes(&self, chunk: u16) -> usize {
        self.ledger.discard_chunk_hashes(chunk)
    }

    /// Fractions of a chunk whose on-disk bytes disagree with the ledger
    ///
    /// A fraction missing on either side counts as a mismatch.
    pub fn verify_chunk_file(&self, chunk: u16) -> Result<Vec<FractionKey>> {
        let handle = self.pool.acquire(chunk);
        let actual = hash_fractions(chunk, ChunkReader::new(handle))?;
        let expected = self.ledger.chunk_fractions(chunk);

        let mut bad = Vec::new();
        let longest = actual.len().max(expected.len());
        for i in 0..longest {
            let same = match (actual.get(i), expected.get(i)) {
                (Some(a), Some(e)) => a.length == e.length && a.digest == e.digest,
                _ => false,
            };
            if !same {
                bad.push(FractionKey::new(chunk, i as u32));
            }
        }

        if !bad.is_empty() {
            tracing::warn!("Chunk {} has {} mismatching fractions", chunk, bad.len());
        }
        Ok(bad)
    }

    /// Hash of the current in-memory tree
    pub fn compute_directory_hash(&self) -> Digest {
        compute_directory_hash(&self.directory.read().serialize_tree())
    }

    /// Whole-archive hash over the current fraction hashes
    pub fn compute_chunk_hash(&self) -> Digest {
        self.ledger.compute_chunk_hash()
    }

    /// Hash of one chunk from the stored fraction hashes
    pub fn chunk_hash(&self, chunk: u16) -> Option<Digest> {
        self.ledger.chunk_hash(chunk)
    }

    /// Current tree matches the stored tree hash
    pub fn test_directory_hash(&self) -> bool {
        match self.ledger.metadata() {
            Some(stored) => stored.tree == self.compute_directory_hash(),
            None => false,
        }
    }

    /// Current fraction hashes match the stored fraction-section hash
    pub fn test_chunk_hash(&self) -> bool {
        match self.ledger.metadata() {
            Some(stored) => stored.fractions == self.compute_chunk_hash(),
            None => false,
        }
    }

    pub fn metadata_hashes(&self) -> Option<MetadataHashes> {
        self.ledger.metadata()
    }

    // ---- cache and diagnostics ----

    /// Re-read cache lines that failed validation
    pub fn retry_bad_cache_lines(&self) -> usize {
        self.cache.retry_all_bad_cache_lines()
    }

    /// Wait for outstanding cache validation to finish
    pub fn wait_for_validation(&self, timeout: Duration) -> bool {
        self.cache.wait_for_validation(timeout)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn handle_stats(&self) -> HandlePoolStats {
        self.pool.stats()
    }

    pub fn chunk_count(&self) -> u16 {
        self.chunks.chunk_count()
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunks.max_chunk_size()
    }

    pub fn paths(&self) -> &ArchivePaths {
        &self.paths
    }

    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    /// Drop cached fractions and hashes covering freshly written bytes
    ///
    /// `touched` lists the chunks written, starting with the one holding
    /// `offset`.
    fn forget_written_range(&self, offset: u64, len: u64, touched: &[u16]) {
        let chunk_size = self.chunks.max_chunk_size() as u64;
        let mut remaining = len;
        let mut offset = offset;

        for (i, &written) in touched.iter().enumerate() {
            let span = if i + 1 == touched.len() {
                remaining
            } else {
                remaining.min(chunk_size.saturating_sub(offset))
            };
            self.cache.invalidate_range(written, offset, span);
            self.ledger.discard_chunk_hashes(written);
            remaining -= span;
            offset = 0;
        }
    }
}

impl std::fmt::Debug for Archive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Archive")
            .field("base", &self.paths.base())
            .field("files", &self.file_count())
            .field("chunks", &self.chunks.chunk_count())
            .field("chunk_size", &self.chunks.max_chunk_size())
            .finish()
    }
}

impl Drop for Archive {
    fn drop(&mut self) {
        if self.directory.get_mut().is_dirty() {
            tracing::warn!(
                "Archive {} dropped with unwritten directory changes",
                self.paths.base().display()
            );
        }
    }
}

/// Lazily filtered list of file paths
///
/// Built from a snapshot of the directory; later changes are not seen.
#[derive(Debug)]
pub struct FileList {
    paths: std::vec::IntoIter<String>,
    filter: Option<Wildcard>,
}

impl Iterator for FileList {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        loop {
            let path = self.paths.next()?;
            match &self.filter {
                Some(filter) if !filter.matches(&path) => continue,
                _ => return Some(path),
            }
        }
    }
}

/// Read cursor over one archived file
///
/// Implements [`Read`] and [`Seek`]. Seeking outside the file clamps to
/// its bounds.
pub struct FileHandle<'a> {
    archive: &'a Archive,
    entry: DirectoryEntry,
    position: u64,
}

impl<'a> FileHandle<'a> {
    pub fn path(&self) -> &str {
        &self.entry.path
    }

    /// File size in bytes
    pub fn len(&self) -> u64 {
        self.entry.size as u64
    }

    pub fn is_empty(&self) -> bool {
        self.entry.size == 0
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn crc(&self) -> u32 {
        self.entry.crc
    }

    /// Snapshot of the entry this cursor reads
    pub fn entry(&self) -> &DirectoryEntry {
        &self.entry
    }

    fn read_payload(&self, payload_pos: u64, buf: &mut [u8]) -> io::Result<usize> {
        let chunk_size = self.archive.chunks.max_chunk_size();
        let (chunk, offset) = locate(
            self.entry.chunk,
            self.entry.offset as u64 + payload_pos,
            chunk_size,
        );

        let left_in_file = self.entry.payload_size() as u64 - payload_pos;
        let left_in_chunk = chunk_size as u64 - offset;
        let want = (buf.len() as u64).min(left_in_file).min(left_in_chunk) as usize;

        self.archive.cache.read(chunk, offset, &mut buf[..want])
    }
}

impl Read for FileHandle<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let size = self.len();
        let preload = self.entry.preload.len() as u64;
        let mut filled = 0;

        while filled < buf.len() && self.position < size {
            let n = if self.position < preload {
                let start = self.position as usize;
                let n = (preload as usize - start).min(buf.len() - filled);
                buf[filled..filled + n].copy_from_slice(&self.entry.preload[start..start + n]);
                n
            } else {
                self.read_payload(self.position - preload, &mut buf[filled..])?
            };

            if n == 0 {
                if filled == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!(
                            "chunk data for {} ends at byte {} of {}",
                            self.entry.path, self.position, size
                        ),
                    ));
                }
                break;
            }

            filled += n;
            self.position += n as u64;
        }

        Ok(filled)
    }
}

impl Seek for FileHandle<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let size = self.len() as i128;
        let target = match pos {
            SeekFrom::Start(n) => n as i128,
            SeekFrom::End(delta) => size + delta as i128,
            SeekFrom::Current(delta) => self.position as i128 + delta as i128,
        };
        self.position = target.clamp(0, size) as u64;
        Ok(self.position)
    }
}

impl std::fmt::Debug for FileHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("path", &self.entry.path)
            .field("size", &self.entry.size)
            .field("position", &self.position)
            .finish()
    }
}
