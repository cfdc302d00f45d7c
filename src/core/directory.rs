//! Content directory
//!
//! The directory maps normalized entry paths to where their bytes live.
//! On disk it is a three-level tree grouped by extension, then directory,
//! then stem. Every level ends with an empty string:
//!
//! ```text
//! "mdl\0"
//!     "models\0"
//!         "a\0"  crc u32 | preload u16 | chunk u16 | offset u32 | remaining u32 | 0xFFFF u16 | preload bytes
//!         "\0"
//!     "\0"
//! "\0"
//! ```
//!
//! Empty components are written as [`EMPTY_COMPONENT`] so they cannot be
//! confused with a level terminator.

use crate::chunk::MAX_CHUNK_INDEX;
use crate::error::{PakError, Result};
use crate::path::{join_entry_path, normalize_entry_path, split_entry_path, EMPTY_COMPONENT};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Chunk index of entries whose bytes all live in the preload
pub const DIRECTORY_ONLY_CHUNK: u16 = 0x7FFF;

/// Marker closing every fixed entry record
pub const ENTRY_TERMINATOR: u16 = 0xFFFF;

/// Size of the fixed part of an entry record
pub const ENTRY_RECORD_SIZE: usize = 18;

/// Outcome of adding a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddFileResult {
    /// No entry existed for the path
    NewFile,
    /// An entry with the same CRC and sizes already existed; nothing written
    SameContentNoop,
    /// The existing entry was replaced with new content
    UpdatedFile,
}

/// Location and inline prefix of one archived file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// Normalized entry path
    pub path: String,
    /// Chunk holding the first payload byte
    pub chunk: u16,
    /// Offset of the first payload byte within `chunk`
    pub offset: u32,
    /// Total file size, preload included
    pub size: u32,
    /// CRC-32 of the whole file
    pub crc: u32,
    /// Leading bytes stored inline in the directory
    pub preload: Arc<[u8]>,
}

impl DirectoryEntry {
    pub fn preload_size(&self) -> usize {
        self.preload.len()
    }

    /// Bytes stored in chunk files
    pub fn payload_size(&self) -> u32 {
        self.size - self.preload.len() as u32
    }

    /// True when the chunk files hold nothing for this entry
    pub fn is_directory_only(&self) -> bool {
        self.payload_size() == 0
    }

    /// Whether this entry already holds content with these properties
    pub fn same_content(&self, crc: u32, size: u32, preload_size: usize) -> bool {
        self.crc == crc && self.size == size && self.preload.len() == preload_size
    }
}

/// In-memory index of every archived file
#[derive(Debug, Default, Clone)]
pub struct ContentDirectory {
    entries: BTreeMap<String, DirectoryEntry>,
    dirty: bool,
}

impl ContentDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up an entry by normalized path
    pub fn get(&self, path: &str) -> Option<&DirectoryEntry> {
        self.entries.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    /// Insert or replace an entry, returning the previous one
    pub fn insert(&mut self, entry: DirectoryEntry) -> Option<DirectoryEntry> {
        self.dirty = true;
        self.entries.insert(entry.path.clone(), entry)
    }

    /// Remove an entry; its chunk bytes are left in place
    pub fn remove(&mut self, path: &str) -> Option<DirectoryEntry> {
        let removed = self.entries.remove(path);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    /// How adding content with these properties would resolve
    pub fn classify(&self, path: &str, crc: u32, size: u32, preload_size: usize) -> AddFileResult {
        match self.entries.get(path) {
            Some(existing) if existing.same_content(crc, size, preload_size) => {
                AddFileResult::SameContentNoop
            }
            Some(_) => AddFileResult::UpdatedFile,
            None => AddFileResult::NewFile,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in path order
    pub fn entries(&self) -> impl Iterator<Item = &DirectoryEntry> {
        self.entries.values()
    }

    /// Every entry path, sorted
    pub fn paths(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Every directory that holds at least one entry, ancestors included
    pub fn directories(&self) -> BTreeSet<String> {
        let mut dirs = BTreeSet::new();
        for path in self.entries.keys() {
            let mut rest = path.as_str();
            while let Some(idx) = rest.rfind('/') {
                rest = &rest[..idx];
                if !dirs.insert(rest.to_string()) {
                    break;
                }
            }
        }
        dirs
    }

    /// Changed since it was loaded or last written
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Serialize the tree section
    pub fn serialize_tree(&self) -> Vec<u8> {
        let mut grouped: BTreeMap<&str, BTreeMap<&str, Vec<(&str, &DirectoryEntry)>>> =
            BTreeMap::new();
        for entry in self.entries.values() {
            let (dir, stem, ext) = split_entry_path(&entry.path);
            grouped
                .entry(ext)
                .or_default()
                .entry(dir)
                .or_default()
                .push((stem, entry));
        }

        let mut out = Vec::new();
        for (ext, dirs) in &grouped {
            write_component(&mut out, ext);
            for (dir, files) in dirs {
                write_component(&mut out, dir);
                for (stem, entry) in files {
                    write_component(&mut out, stem);
                    write_entry(&mut out, entry);
                }
                out.push(0);
            }
            out.push(0);
        }
        out.push(0);
        out
    }

    /// Parse a tree section
    pub fn parse_tree(bytes: &[u8]) -> Result<Self> {
        let mut cursor = TreeCursor { bytes, pos: 0 };
        let mut entries = BTreeMap::new();

        loop {
            let ext = cursor.component()?;
            let Some(ext) = ext else { break };
            loop {
                let dir = cursor.component()?;
                let Some(dir) = dir else { break };
                loop {
                    let stem = cursor.component()?;
                    let Some(stem) = stem else { break };
                    let path = join_entry_path(dir, stem, ext);
                    match normalize_entry_path(&path) {
                        Ok(normalized) if normalized == path => {}
                        _ => {
                            return Err(PakError::Corrupt(format!(
                                "unnormalized path {:?} in tree",
                                path
                            )))
                        }
                    }
                    let entry = cursor.entry(path)?;
                    if entries.insert(entry.path.clone(), entry).is_some() {
                        return Err(PakError::Corrupt("duplicate path in tree".to_string()));
                    }
                }
            }
        }

        if cursor.pos != bytes.len() {
            return Err(PakError::Corrupt(format!(
                "{} bytes after tree terminator",
                bytes.len() - cursor.pos
            )));
        }

        Ok(ContentDirectory {
            entries,
            dirty: false,
        })
    }
}

fn write_component(out: &mut Vec<u8>, component: &str) {
    let component = if component.is_empty() {
        EMPTY_COMPONENT
    } else {
        component
    };
    out.extend_from_slice(component.as_bytes());
    out.push(0);
}

fn write_entry(out: &mut Vec<u8>, entry: &DirectoryEntry) {
    out.reserve(ENTRY_RECORD_SIZE + entry.preload.len());
    out.extend_from_slice(&entry.crc.to_le_bytes());
    out.extend_from_slice(&(entry.preload.len() as u16).to_le_bytes());
    out.extend_from_slice(&entry.chunk.to_le_bytes());
    out.extend_from_slice(&entry.offset.to_le_bytes());
    out.extend_from_slice(&entry.payload_size().to_le_bytes());
    out.extend_from_slice(&ENTRY_TERMINATOR.to_le_bytes());
    out.extend_from_slice(&entry.preload);
}

struct TreeCursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> TreeCursor<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| PakError::Corrupt(format!("tree truncated at byte {}", self.pos)))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Next NUL-terminated component; `None` at a level terminator
    fn component(&mut self) -> Result<Option<&'a str>> {
        let rest = &self.bytes[self.pos..];
        let len = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| PakError::Corrupt("unterminated tree string".to_string()))?;
        let raw = self.take(len + 1)?;
        if len == 0 {
            return Ok(None);
        }

        let text = std::str::from_utf8(&raw[..len])
            .map_err(|_| PakError::Corrupt("tree string is not UTF-8".to_string()))?;
        Ok(Some(if text == EMPTY_COMPONENT { "" } else { text }))
    }

    fn entry(&mut self, path: String) -> Result<DirectoryEntry> {
        let crc = self.u32()?;
        let preload_size = self.u16()? as usize;
        let chunk = self.u16()?;
        let offset = self.u32()?;
        let remaining = self.u32()?;
        let terminator = self.u16()?;

        if terminator != ENTRY_TERMINATOR {
            return Err(PakError::Corrupt(format!(
                "bad terminator {:#06x} after {}",
                terminator, path
            )));
        }
        if chunk > MAX_CHUNK_INDEX && !(chunk == DIRECTORY_ONLY_CHUNK && remaining == 0) {
            return Err(PakError::Corrupt(format!("{} names chunk {}", path, chunk)));
        }

        let size = (preload_size as u32)
            .checked_add(remaining)
            .ok_or_else(|| PakError::Corrupt(format!("{} overflows 4 GiB", path)))?;
        let preload: Arc<[u8]> = Arc::from(self.take(preload_size)?);

        Ok(DirectoryEntry {
            path,
            chunk,
            offset,
            size,
            crc,
            preload,
        })
    }
}
