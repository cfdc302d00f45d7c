//! Chunk file set
//!
//! Payload bytes live in numbered chunk files (`{base}_000.pak`,
//! `{base}_001.pak`, ...). New payloads are always appended to the
//! highest-numbered chunk; when it cannot take them a new chunk is
//! started. Chunk numbers are never reused.
//!
//! In multi-chunk mode a payload may run past the ceiling: the current
//! chunk is filled exactly to the ceiling and the rest continues at the
//! start of the next chunk. Because only full chunks are ever spanned, a
//! logical offset `o` past the ceiling of chunk `c` lives at
//! `(c + o / ceiling, o % ceiling)`.

use crate::error::{PakError, Result};
use crate::path::ArchivePaths;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};

/// Highest usable chunk number
pub const MAX_CHUNK_INDEX: u16 = 0x7FFE;

/// Start of a payload written to the chunk set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub chunk: u16,
    pub offset: u32,
}

/// Map a logical position to its physical chunk and offset
pub fn locate(chunk: u16, offset: u64, chunk_size: u32) -> (u16, u64) {
    let size = chunk_size as u64;
    if offset < size {
        (chunk, offset)
    } else {
        (chunk.saturating_add((offset / size) as u16), offset % size)
    }
}

struct ChunkWriter {
    /// Length of every chunk, indexed by chunk number
    lengths: Vec<u64>,
    /// Write handle for the chunk currently being appended to
    current: Option<(u16, File)>,
}

/// Set of chunk files belonging to one archive
pub struct ChunkFileSet {
    paths: ArchivePaths,
    max_chunk_size: u32,
    writer: Mutex<ChunkWriter>,
}

impl ChunkFileSet {
    /// Create an empty set; no file is touched until the first write
    pub fn new(paths: ArchivePaths, max_chunk_size: u32) -> Self {
        ChunkFileSet {
            paths,
            max_chunk_size,
            writer: Mutex::new(ChunkWriter {
                lengths: Vec::new(),
                current: None,
            }),
        }
    }

    /// Discover existing chunk files by probing consecutive numbers
    pub fn discover(paths: ArchivePaths, max_chunk_size: u32) -> Result<Self> {
        let mut lengths = Vec::new();

        for chunk in 0..=MAX_CHUNK_INDEX {
            match std::fs::metadata(paths.chunk_file(chunk)) {
                Ok(meta) => lengths.push(meta.len()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
                Err(e) => return Err(e.into()),
            }
        }

        tracing::debug!(
            "Discovered {} chunk files for {}",
            lengths.len(),
            paths.base().display()
        );

        Ok(ChunkFileSet {
            paths,
            max_chunk_size,
            writer: Mutex::new(ChunkWriter {
                lengths,
                current: None,
            }),
        })
    }

    pub fn max_chunk_size(&self) -> u32 {
        self.max_chunk_size
    }

    pub fn chunk_count(&self) -> u16 {
        self.writer.lock().lengths.len() as u16
    }

    /// Known length of `chunk` (0 if it does not exist)
    pub fn chunk_len(&self, chunk: u16) -> u64 {
        self.writer
            .lock()
            .lengths
            .get(chunk as usize)
            .copied()
            .unwrap_or(0)
    }

    /// Total payload bytes across all chunks
    pub fn total_len(&self) -> u64 {
        self.writer.lock().lengths.iter().sum()
    }

    /// Reserve space for a payload of `size` bytes
    ///
    /// Returns where the payload will start. Nothing is written.
    pub fn allocate_region(&self, size: u64, allow_multi_chunk: bool) -> Result<Region> {
        let mut writer = self.writer.lock();
        self.allocate_locked(&mut writer, size, allow_multi_chunk)
    }

    /// Append a payload and return where it starts
    ///
    /// Also returns every chunk the payload touched, so callers can
    /// invalidate cached data and hashes for them.
    pub fn write_payload(&self, data: &[u8], allow_multi_chunk: bool) -> Result<(Region, Vec<u16>)> {
        let mut writer = self.writer.lock();
        let region = self.allocate_locked(&mut writer, data.len() as u64, allow_multi_chunk)?;

        let mut touched = Vec::new();
        let mut remaining = data;
        let mut chunk = region.chunk;
        let mut offset = region.offset as u64;

        while !remaining.is_empty() {
            let room = (self.max_chunk_size as u64).saturating_sub(offset) as usize;
            let n = if allow_multi_chunk {
                room.min(remaining.len())
            } else {
                remaining.len()
            };

            self.write_at(&mut writer, chunk, offset, &remaining[..n])?;
            touched.push(chunk);
            remaining = &remaining[n..];

            if !remaining.is_empty() {
                chunk = self.start_chunk(&mut writer)?;
                offset = 0;
            }
        }

        Ok((region, touched))
    }

    /// Flush and sync the active write handle
    pub fn sync(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        if let Some((_, file)) = writer.current.as_mut() {
            file.flush()?;
            file.sync_all()?;
        }
        Ok(())
    }

    fn allocate_locked(
        &self,
        writer: &mut ChunkWriter,
        size: u64,
        allow_multi_chunk: bool,
    ) -> Result<Region> {
        let limit = self.max_chunk_size as u64;

        if !allow_multi_chunk && size > limit {
            return Err(PakError::FileTooLarge { size, limit });
        }

        if size == 0 {
            let chunk = writer.lengths.len().saturating_sub(1) as u16;
            let offset = writer.lengths.last().copied().unwrap_or(0);
            return Ok(Region {
                chunk,
                offset: offset as u32,
            });
        }

        let current = match writer.lengths.len() {
            0 => self.start_chunk(writer)?,
            n => (n - 1) as u16,
        };
        let used = writer.lengths[current as usize];

        let fits = if allow_multi_chunk {
            used < limit
        } else {
            used + size <= limit
        };

        let chunk = if fits {
            current
        } else {
            self.start_chunk(writer)?
        };

        Ok(Region {
            chunk,
            offset: writer.lengths[chunk as usize] as u32,
        })
    }

    /// Create the next chunk file and make it current
    fn start_chunk(&self, writer: &mut ChunkWriter) -> Result<u16> {
        let next = writer.lengths.len();
        if next > MAX_CHUNK_INDEX as usize {
            return Err(PakError::TooManyChunks(next as u32));
        }

        let chunk = next as u16;
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.paths.chunk_file(chunk))?;

        tracing::debug!("Started chunk {} for {}", chunk, self.paths.base().display());

        writer.lengths.push(0);
        writer.current = Some((chunk, file));
        Ok(chunk)
    }

    fn write_at(&self, writer: &mut ChunkWriter, chunk: u16, offset: u64, data: &[u8]) -> Result<()> {
        let needs_open = !matches!(&writer.current, Some((open, _)) if *open == chunk);
        if needs_open {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .open(self.paths.chunk_file(chunk))?;
            writer.current = Some((chunk, file));
        }

        if let Some((_, file)) = writer.current.as_mut() {
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(data)?;
        }

        let length = &mut writer.lengths[chunk as usize];
        *length = (*length).max(offset + data.len() as u64);
        Ok(())
    }
}

impl std::fmt::Debug for ChunkFileSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkFileSet")
            .field("base", &self.paths.base())
            .field("max_chunk_size", &self.max_chunk_size)
            .field("chunks", &self.chunk_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn chunk_set(dir: &TempDir, max: u32) -> ChunkFileSet {
        ChunkFileSet::new(ArchivePaths::new(dir.path().join("set")).unwrap(), max)
    }

    #[test]
    fn test_locate() {
        assert_eq!(locate(0, 10, 100), (0, 10));
        assert_eq!(locate(0, 100, 100), (1, 0));
        assert_eq!(locate(2, 250, 100), (4, 50));
    }

    #[test]
    fn test_appends_within_chunk() {
        let dir = TempDir::new().unwrap();
        let set = chunk_set(&dir, 1000);

        let (a, _) = set.write_payload(&[1u8; 100], false).unwrap();
        let (b, _) = set.write_payload(&[2u8; 200], false).unwrap();

        assert_eq!(a, Region { chunk: 0, offset: 0 });
        assert_eq!(b, Region { chunk: 0, offset: 100 });
        assert_eq!(set.chunk_len(0), 300);
        assert_eq!(set.chunk_count(), 1);
    }

    #[test]
    fn test_single_chunk_rollover() {
        let dir = TempDir::new().unwrap();
        let set = chunk_set(&dir, 1000);

        set.write_payload(&[1u8; 700], false).unwrap();
        let (region, touched) = set.write_payload(&[2u8; 400], false).unwrap();

        assert_eq!(region, Region { chunk: 1, offset: 0 });
        assert_eq!(touched, vec![1]);
        assert_eq!(set.chunk_len(0), 700);
        assert_eq!(set.chunk_len(1), 400);
    }

    #[test]
    fn test_single_chunk_rejects_oversized_payload() {
        let dir = TempDir::new().unwrap();
        let set = chunk_set(&dir, 1000);

        assert!(matches!(
            set.write_payload(&[0u8; 1001], false),
            Err(PakError::FileTooLarge { size: 1001, limit: 1000 })
        ));
    }

    #[test]
    fn test_multi_chunk_spans_boundary() {
        let dir = TempDir::new().unwrap();
        let set = chunk_set(&dir, 1000);

        set.write_payload(&[1u8; 700], true).unwrap();
        let payload: Vec<u8> = (0..2500u32).map(|i| i as u8).collect();
        let (region, touched) = set.write_payload(&payload, true).unwrap();

        assert_eq!(region, Region { chunk: 0, offset: 700 });
        assert_eq!(touched, vec![0, 1, 2, 3]);
        assert_eq!(set.chunk_len(0), 1000);
        assert_eq!(set.chunk_len(1), 1000);
        assert_eq!(set.chunk_len(2), 1000);
        assert_eq!(set.chunk_len(3), 200);

        let chunk2 = std::fs::read(dir.path().join("set_002.pak")).unwrap();
        let (chunk, offset) = locate(region.chunk, region.offset as u64 + 1300, 1000);
        assert_eq!((chunk, offset), (2, 0));
        assert_eq!(chunk2[0], payload[1300]);
    }

    #[test]
    fn test_multi_chunk_starts_new_chunk_when_full() {
        let dir = TempDir::new().unwrap();
        let set = chunk_set(&dir, 100);

        set.write_payload(&[1u8; 100], true).unwrap();
        let (region, _) = set.write_payload(&[2u8; 10], true).unwrap();
        assert_eq!(region, Region { chunk: 1, offset: 0 });
    }

    #[test]
    fn test_empty_payload_touches_nothing() {
        let dir = TempDir::new().unwrap();
        let set = chunk_set(&dir, 100);

        let (region, touched) = set.write_payload(&[], false).unwrap();
        assert_eq!(region, Region { chunk: 0, offset: 0 });
        assert!(touched.is_empty());
        assert_eq!(set.chunk_count(), 0);
        assert!(!dir.path().join("set_000.pak").exists());
    }

    #[test]
    fn test_discover_existing_chunks() {
        let dir = TempDir::new().unwrap();
        {
            let set = chunk_set(&dir, 100);
            set.write_payload(&[1u8; 80], false).unwrap();
            set.write_payload(&[2u8; 80], false).unwrap();
            set.sync().unwrap();
        }

        let set = ChunkFileSet::discover(ArchivePaths::new(dir.path().join("set")).unwrap(), 100)
            .unwrap();
        assert_eq!(set.chunk_count(), 2);
        assert_eq!(set.total_len(), 160);

        let (region, _) = set.write_payload(&[3u8; 10], false).unwrap();
        assert_eq!(region, Region { chunk: 1, offset: 80 });
    }
}
