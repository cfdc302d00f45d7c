//! Bounded pool of open chunk-file handles
//!
//! Handles live in an arena of slots; an `lru` index maps chunk numbers
//! to slot indices and decides which handle to close when the pool is
//! full. Every handle carries its own mutex, so reads against different
//! chunks never contend, while reads against the same chunk serialize.
//!
//! Eviction only drops the pool's reference. A reader still holding the
//! `Arc<ChunkHandle>` keeps the file open until it lets go.

use crate::path::ArchivePaths;
use lru::LruCache;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// OS handle state guarded by the per-handle mutex
#[derive(Debug)]
struct HandleState {
    file: Option<File>,
    /// Current OS-level file position
    position: u64,
}

/// One open chunk file
#[derive(Debug)]
pub struct ChunkHandle {
    chunk: u16,
    state: Mutex<HandleState>,
    seeks: AtomicU64,
}

impl ChunkHandle {
    fn open(chunk: u16, file: Option<File>) -> Self {
        ChunkHandle {
            chunk,
            state: Mutex::new(HandleState { file, position: 0 }),
            seeks: AtomicU64::new(0),
        }
    }

    pub fn chunk(&self) -> u16 {
        self.chunk
    }

    /// False when the chunk file could not be opened
    pub fn is_valid(&self) -> bool {
        self.state.lock().file.is_some()
    }

    /// Number of OS seeks issued through this handle
    pub fn seek_count(&self) -> u64 {
        self.seeks.load(Ordering::Relaxed)
    }

    /// Read up to `buf.len()` bytes starting at `offset`
    ///
    /// Returns fewer bytes only at end of file. An invalid handle reads
    /// as an empty file. The seek is skipped when the handle is already
    /// positioned at `offset`.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        let HandleState { file, position } = &mut *state;

        let Some(file) = file.as_mut() else {
            return Ok(0);
        };

        if *position != offset {
            file.seek(SeekFrom::Start(offset))?;
            *position = offset;
            self.seeks.fetch_add(1, Ordering::Relaxed);
        }

        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => {
                    filled += n;
                    *position += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // Position is unknown after a failed read
                    *position = u64::MAX;
                    return Err(e);
                }
            }
        }

        Ok(filled)
    }

    /// Current length of the chunk file (0 for an invalid handle)
    pub fn len(&self) -> io::Result<u64> {
        match &self.state.lock().file {
            Some(file) => Ok(file.metadata()?.len()),
            None => Ok(0),
        }
    }
}

/// Sequential reader over one chunk handle
pub struct ChunkReader {
    handle: Arc<ChunkHandle>,
    position: u64,
}

impl ChunkReader {
    pub fn new(handle: Arc<ChunkHandle>) -> Self {
        ChunkReader {
            handle,
            position: 0,
        }
    }
}

impl Read for ChunkReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.handle.read_at(self.position, buf)?;
        self.position += n as u64;
        Ok(n)
    }
}

/// Pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlePoolStats {
    /// Handles currently held by the pool
    pub open: usize,
    /// Maximum handles the pool will hold
    pub capacity: usize,
    /// Successful opens since creation
    pub opens: u64,
    /// Handles closed to make room
    pub evictions: u64,
    /// Opens that failed and produced an invalid handle
    pub failed_opens: u64,
}

struct PoolInner {
    slots: Vec<Arc<ChunkHandle>>,
    index: LruCache<u16, usize>,
    opens: u64,
    evictions: u64,
    failed_opens: u64,
    /// Bumped whenever pooled handles are dropped from outside `acquire`
    generation: u64,
}

/// Bounded, LRU-evicting pool of chunk handles
pub struct HandlePool {
    paths: ArchivePaths,
    capacity: usize,
    inner: Mutex<PoolInner>,
}

impl HandlePool {
    /// Create a pool holding at most `capacity` open handles
    pub fn new(paths: ArchivePaths, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        HandlePool {
            paths,
            capacity,
            inner: Mutex::new(PoolInner {
                slots: Vec::new(),
                // Unbounded: the pool enforces its own ceiling so eviction
                // can hand the freed slot to the new handle
                index: LruCache::unbounded(),
                opens: 0,
                evictions: 0,
                failed_opens: 0,
                generation: 0,
            }),
        }
    }

    /// Get the handle for `chunk`, opening it if needed
    ///
    /// When the pool is full the least recently used handle is closed
    /// first. If the file cannot be opened an invalid handle is returned
    /// and nothing is pooled, so a later call retries the open.
    ///
    /// The pool lock is not held across the open. Two threads missing on
    /// the same chunk may both open it; the first to return pools its
    /// handle and the other drops its file and shares that handle.
    pub fn acquire(&self, chunk: u16) -> Arc<ChunkHandle> {
        loop {
            let generation = {
                let mut inner = self.inner.lock();
                if let Some(&slot) = inner.index.get(&chunk) {
                    return Arc::clone(&inner.slots[slot]);
                }
                inner.generation
            };

            let path = self.paths.chunk_file(chunk);
            let opened = File::open(&path);

            let mut inner = self.inner.lock();
            if let Some(&slot) = inner.index.get(&chunk) {
                return Arc::clone(&inner.slots[slot]);
            }
            if inner.generation != generation {
                // Invalidated while opening; the file may have been replaced
                continue;
            }

            let file = match opened {
                Ok(file) => file,
                Err(e) => {
                    inner.failed_opens += 1;
                    tracing::debug!("Cannot open chunk {}: {}", path.display(), e);
                    return Arc::new(ChunkHandle::open(chunk, None));
                }
            };

            inner.opens += 1;
            let handle = Arc::new(ChunkHandle::open(chunk, Some(file)));
            self.insert(&mut inner, chunk, Arc::clone(&handle));
            return handle;
        }
    }

    fn insert(&self, inner: &mut PoolInner, chunk: u16, handle: Arc<ChunkHandle>) {
        let slot = if inner.slots.len() < self.capacity {
            inner.slots.push(handle);
            inner.slots.len() - 1
        } else {
            match inner.index.pop_lru() {
                Some((evicted, slot)) => {
                    inner.evictions += 1;
                    tracing::trace!("Closing chunk {} handle to open chunk {}", evicted, chunk);
                    inner.slots[slot] = handle;
                    slot
                }
                None => {
                    inner.slots.push(handle);
                    inner.slots.len() - 1
                }
            }
        };

        inner.index.put(chunk, slot);
    }

    /// Drop the pooled handle for `chunk`, if any
    ///
    /// Used after a chunk file is rewritten or deleted outside the pool.
    pub fn invalidate(&self, chunk: u16) -> bool {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        let Some(slot) = inner.index.pop(&chunk) else {
            return false;
        };

        let last = inner.slots.len() - 1;
        inner.slots.swap_remove(slot);
        if slot != last {
            // The handle formerly in the last slot moved into `slot`
            let moved = inner.slots[slot].chunk;
            if let Some(index) = inner.index.peek_mut(&moved) {
                *index = slot;
            }
        }
        true
    }

    /// Close every pooled handle
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        inner.slots.clear();
        inner.index.clear();
    }

    /// Whether `chunk` currently has a pooled handle
    pub fn is_open(&self, chunk: u16) -> bool {
        self.inner.lock().index.contains(&chunk)
    }

    pub fn stats(&self) -> HandlePoolStats {
        let inner = self.inner.lock();
        HandlePoolStats {
            open: inner.slots.len(),
            capacity: self.capacity,
            opens: inner.opens,
            evictions: inner.evictions,
            failed_opens: inner.failed_opens,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl std::fmt::Debug for HandlePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlePool")
            .field("base", &self.paths.base())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn pool_with_chunks(dir: &TempDir, chunks: u16, capacity: usize) -> HandlePool {
        let paths = ArchivePaths::new(dir.path().join("test")).unwrap();
        for chunk in 0..chunks {
            let data: Vec<u8> = (0..4096u32).map(|i| (i as u8).wrapping_add(chunk as u8)).collect();
            std::fs::write(paths.chunk_file(chunk), data).unwrap();
        }
        HandlePool::new(paths, capacity)
    }

    #[test]
    fn test_acquire_reuses_handle() {
        let dir = TempDir::new().unwrap();
        let pool = pool_with_chunks(&dir, 1, 4);

        let a = pool.acquire(0);
        let b = pool.acquire(0);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.stats().opens, 1);
    }

    #[test]
    fn test_capacity_is_never_exceeded() {
        let dir = TempDir::new().unwrap();
        let pool = pool_with_chunks(&dir, 10, 3);

        for chunk in 0..10 {
            let handle = pool.acquire(chunk);
            assert!(handle.is_valid());
            assert!(pool.stats().open <= 3);
        }

        let stats = pool.stats();
        assert_eq!(stats.open, 3);
        assert_eq!(stats.evictions, 7);
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let dir = TempDir::new().unwrap();
        let pool = pool_with_chunks(&dir, 4, 3);

        pool.acquire(0);
        pool.acquire(1);
        pool.acquire(2);
        pool.acquire(0); // 1 is now least recently used
        pool.acquire(3);

        assert!(pool.is_open(0));
        assert!(!pool.is_open(1));
        assert!(pool.is_open(2));
        assert!(pool.is_open(3));
    }

    #[test]
    fn test_concurrent_acquire_shares_one_handle() {
        let dir = TempDir::new().unwrap();
        let pool = pool_with_chunks(&dir, 4, 2);

        let handles: Vec<Arc<ChunkHandle>> = std::thread::scope(|s| {
            let workers: Vec<_> = (0..8).map(|_| s.spawn(|| pool.acquire(0))).collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        for handle in &handles[1..] {
            assert!(Arc::ptr_eq(&handles[0], handle));
        }
        let stats = pool.stats();
        assert_eq!(stats.open, 1);
        assert_eq!(stats.opens, 1);
        assert_eq!(stats.evictions, 0);
    }

    #[test]
    fn test_concurrent_acquire_respects_capacity() {
        let dir = TempDir::new().unwrap();
        let pool = pool_with_chunks(&dir, 6, 2);

        std::thread::scope(|s| {
            for t in 0..6u16 {
                let pool = &pool;
                s.spawn(move || {
                    for i in 0..50u16 {
                        let handle = pool.acquire((t + i) % 6);
                        assert!(handle.is_valid());
                        let mut buf = [0u8; 1];
                        handle.read_at(0, &mut buf).unwrap();
                        assert_eq!(buf[0], handle.chunk() as u8);
                    }
                });
            }
        });

        let stats = pool.stats();
        assert!(stats.open <= 2);
        assert_eq!(stats.opens, stats.evictions + stats.open as u64);
    }

    #[test]
    fn test_evicted_handle_stays_readable() {
        let dir = TempDir::new().unwrap();
        let pool = pool_with_chunks(&dir, 3, 1);

        let held = pool.acquire(0);
        pool.acquire(1);
        pool.acquire(2);

        let mut buf = [0u8; 4];
        assert_eq!(held.read_at(0, &mut buf).unwrap(), 4);
        assert_eq!(buf, [0, 1, 2, 3]);
    }

    #[test]
    fn test_missing_chunk_is_invalid_handle() {
        let dir = TempDir::new().unwrap();
        let pool = pool_with_chunks(&dir, 1, 4);

        let handle = pool.acquire(9);
        assert!(!handle.is_valid());

        let mut buf = [0u8; 16];
        assert_eq!(handle.read_at(0, &mut buf).unwrap(), 0);
        assert!(!pool.is_open(9));
        assert_eq!(pool.stats().failed_opens, 1);
    }

    #[test]
    fn test_sequential_reads_skip_seeks() {
        let dir = TempDir::new().unwrap();
        let pool = pool_with_chunks(&dir, 1, 4);
        let handle = pool.acquire(0);

        let mut buf = [0u8; 512];
        for i in 0..8 {
            assert_eq!(handle.read_at(i * 512, &mut buf).unwrap(), 512);
        }
        assert_eq!(handle.seek_count(), 0);

        handle.read_at(100, &mut buf).unwrap();
        assert_eq!(handle.seek_count(), 1);
    }

    #[test]
    fn test_short_read_at_eof() {
        let dir = TempDir::new().unwrap();
        let pool = pool_with_chunks(&dir, 1, 4);
        let handle = pool.acquire(0);

        let mut buf = [0u8; 100];
        assert_eq!(handle.read_at(4000, &mut buf).unwrap(), 96);
        assert_eq!(handle.len().unwrap(), 4096);
    }

    #[test]
    fn test_invalidate_keeps_index_consistent() {
        let dir = TempDir::new().unwrap();
        let pool = pool_with_chunks(&dir, 3, 3);

        pool.acquire(0);
        pool.acquire(1);
        pool.acquire(2);

        assert!(pool.invalidate(0));
        assert!(!pool.invalidate(0));
        assert_eq!(pool.stats().open, 2);

        // Chunk 2 moved into slot 0; it must still resolve to itself
        let handle = pool.acquire(2);
        assert_eq!(handle.chunk(), 2);
        assert_eq!(pool.stats().opens, 3);
    }

    #[test]
    fn test_chunk_reader() {
        let dir = TempDir::new().unwrap();
        let pool = pool_with_chunks(&dir, 1, 1);

        let mut data = Vec::new();
        ChunkReader::new(pool.acquire(0)).read_to_end(&mut data).unwrap();
        assert_eq!(data.len(), 4096);
        assert_eq!(data[255], 255);
    }
}
