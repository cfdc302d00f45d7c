//! Disk I/O for directory files
//!
//! A directory file is assembled in memory and written in one go: first to
//! a sibling temp file, then renamed over the old one, so readers never
//! see a half-written directory.

use crate::digest::Digest;
use crate::error::{PakError, Result};
use crate::header::{DirectoryHeader, HEADER_SIZE};
use crate::integrity::{compute_directory_hash, MetadataHashes, METADATA_HASH_SECTION_SIZE};
use crate::signature::{ArchiveSignature, SigningKey, SIGNATURE_SECTION_SIZE};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Sections of a directory file, borrowed from its raw bytes
#[derive(Debug)]
pub struct DirectoryImage<'a> {
    pub header: DirectoryHeader,
    pub tree: &'a [u8],
    pub fraction_section: &'a [u8],
    pub metadata_section: &'a [u8],
    pub signature: Option<ArchiveSignature>,
    raw: &'a [u8],
}

impl<'a> DirectoryImage<'a> {
    /// Split a directory file into its sections
    ///
    /// Fails on a bad header or when the section sizes do not add up to
    /// the file length.
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        let header = DirectoryHeader::from_bytes(bytes)?;

        if header.file_len() != bytes.len() as u64 {
            return Err(PakError::Corrupt(format!(
                "directory header describes {} bytes, file has {}",
                header.file_len(),
                bytes.len()
            )));
        }

        let metadata_size = header.metadata_hash_section_size as usize;
        if metadata_size != 0 && metadata_size != METADATA_HASH_SECTION_SIZE {
            return Err(PakError::Corrupt(format!(
                "metadata hash section is {} bytes",
                metadata_size
            )));
        }

        let tree_end = header.tree_end() as usize;
        let fractions_end = tree_end + header.fraction_section_size as usize;
        let signature_start = header.signature_offset() as usize;

        // A damaged signature section is reported by the signature check,
        // not by parsing
        let signature = if header.signature_section_size == 0 {
            None
        } else {
            ArchiveSignature::from_bytes(&bytes[signature_start..]).ok()
        };

        Ok(DirectoryImage {
            header,
            tree: &bytes[HEADER_SIZE..tree_end],
            fraction_section: &bytes[tree_end..fractions_end],
            metadata_section: &bytes[fractions_end..signature_start],
            signature,
            raw: bytes,
        })
    }

    /// Recompute the metadata hashes from the stored sections
    pub fn computed_metadata(&self) -> MetadataHashes {
        let header = self.header.to_bytes();
        metadata_hashes(&header, self.tree, self.fraction_section)
    }

    /// Compare stored metadata hashes with the file contents
    ///
    /// Returns `None` when the file carries no metadata hashes.
    pub fn metadata_matches(&self) -> Result<Option<bool>> {
        if self.metadata_section.is_empty() {
            return Ok(None);
        }
        let stored = MetadataHashes::from_bytes(self.metadata_section)?;
        Ok(Some(stored == self.computed_metadata()))
    }

    /// Bytes covered by a signature on this file
    pub fn signable_prefix(&self) -> &'a [u8] {
        &self.raw[..self.header.signature_offset() as usize]
    }
}

/// Hashes written into the metadata section
///
/// The whole-file digest covers the header, both sections and the tree
/// and fraction digests that precede it in the metadata section.
pub fn metadata_hashes(header: &[u8], tree: &[u8], fraction_section: &[u8]) -> MetadataHashes {
    let tree_digest = compute_directory_hash(tree);
    let fractions_digest = Digest::of(fraction_section);
    let whole_file = Digest::of_parts([
        header,
        tree,
        fraction_section,
        &tree_digest.as_bytes()[..],
        &fractions_digest.as_bytes()[..],
    ]);

    MetadataHashes {
        tree: tree_digest,
        fractions: fractions_digest,
        whole_file,
    }
}

/// Assemble a complete directory file
///
/// Returns the file bytes and the metadata hashes written into them. When
/// `signing_key` is given the file ends with a signature over everything
/// before the signature section.
pub fn assemble_directory(
    chunk_size: u32,
    tree: &[u8],
    fraction_section: &[u8],
    signing_key: Option<&SigningKey>,
) -> Result<(Vec<u8>, MetadataHashes)> {
    let section_size = |len: usize, what: &str| {
        u32::try_from(len).map_err(|_| PakError::Corrupt(format!("{} exceeds 4 GiB", what)))
    };

    let mut header = DirectoryHeader::new(chunk_size);
    header.tree_size = section_size(tree.len(), "directory tree")?;
    header.fraction_section_size = section_size(fraction_section.len(), "fraction section")?;
    header.metadata_hash_section_size = METADATA_HASH_SECTION_SIZE as u32;
    if signing_key.is_some() {
        header.signature_section_size = SIGNATURE_SECTION_SIZE as u32;
    }

    let header_bytes = header.to_bytes();
    let hashes = metadata_hashes(&header_bytes, tree, fraction_section);

    let mut file = Vec::with_capacity(header.file_len() as usize);
    file.extend_from_slice(&header_bytes);
    file.extend_from_slice(tree);
    file.extend_from_slice(fraction_section);
    file.extend_from_slice(&hashes.to_bytes());

    if let Some(key) = signing_key {
        let signature = ArchiveSignature::sign(key, &file)?;
        file.extend_from_slice(&signature.to_bytes());
    }

    if file.len() as u64 != header.file_len() {
        return Err(PakError::Signing(format!(
            "signature section is {} bytes, header reserved {}",
            file.len() as u64 - header.signature_offset(),
            header.signature_section_size
        )));
    }

    Ok((file, hashes))
}

/// Replace `path` with `bytes` via a temp file and rename
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let temp = temp_path(path);

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&temp)?;
    file.write_all(bytes)?;
    file.flush()?;
    file.sync_all()?;
    drop(file);

    if let Err(e) = fs::rename(&temp, path) {
        let _ = fs::remove_file(&temp);
        return Err(e.into());
    }

    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|s| s.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
