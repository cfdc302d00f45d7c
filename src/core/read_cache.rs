//! Read cache over chunk fractions
//!
//! A small, fixed set of lines, each holding one 1 MiB-aligned fraction of
//! a chunk file. Reads are served from resident lines when every fraction
//! they touch is cached; otherwise the missing fractions are read through
//! the handle pool and inserted, evicting the least recently used line.
//!
//! Every inserted line is handed to the digest service. Completions come
//! back on a channel and are drained without blocking by later reads:
//!
//! ```text
//! insert ──submit──▶ DigestService ──completion──▶ channel
//!                                                    │
//! read / retry ◀── drain_completions ◀───────────────┘
//!          │
//!          ├─ digest matches ledger   → Verified
//!          ├─ no expected digest      → Verified (digest remembered)
//!          └─ mismatch                → Failed, queued for retry, not served
//! ```
//!
//! Mismatches never surface as read errors. They are logged and counted,
//! and `retry_all_bad_cache_lines` re-reads the affected fractions.

use crate::digest::{Digest, DigestCompletion, DigestRequest, DigestService};
use crate::handle_pool::HandlePool;
use crate::integrity::{FractionKey, IntegrityLedger, FRACTION_SIZE};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use crossbeam::queue::SegQueue;
use parking_lot::RwLock;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Validation state of a cache line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineState {
    /// Digest requested, result not yet seen; served optimistically
    Pending,
    /// Digest matched (or nothing to compare against)
    Verified,
    /// Digest disagreed with the ledger; not served until re-validated
    Failed,
}

#[derive(Debug)]
struct CacheLine {
    key: FractionKey,
    data: Arc<[u8]>,
    last_used: AtomicU64,
    /// Outstanding digest request
    ticket: Option<u64>,
    /// Cumulative digest mismatches for this fraction
    failures: u32,
    /// Last digest that was accepted
    good_digest: Option<Digest>,
    state: LineState,
}

impl CacheLine {
    fn servable(&self) -> bool {
        self.state != LineState::Failed
    }

    /// Holds every byte of `[offset, offset + len)` that falls in this fraction
    ///
    /// A short line was loaded at the end of its chunk, which may have
    /// grown since.
    fn covers(&self, offset: u64, len: usize) -> bool {
        let start = self.key.offset();
        let end = (offset + len as u64).min(start + FRACTION_SIZE as u64);
        self.data.len() as u64 >= end.saturating_sub(start)
    }
}

#[derive(Debug)]
struct CacheTable {
    lines: Vec<Option<CacheLine>>,
}

impl CacheTable {
    fn find(&self, key: FractionKey) -> Option<&CacheLine> {
        self.lines.iter().flatten().find(|line| line.key == key)
    }

    fn find_mut(&mut self, key: FractionKey) -> Option<&mut CacheLine> {
        self.lines.iter_mut().flatten().find(|line| line.key == key)
    }

    /// Slot to reuse for a new line: a free one, else the LRU line
    fn victim(&self) -> usize {
        if let Some(free) = self.lines.iter().position(Option::is_none) {
            return free;
        }

        self.lines
            .iter()
            .enumerate()
            .filter_map(|(i, line)| line.as_ref().map(|l| (i, l.last_used.load(Ordering::Relaxed))))
            .min_by_key(|&(_, used)| used)
            .map(|(i, _)| i)
            .unwrap_or(0)
    }
}

/// Read cache statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads fully served from resident lines
    pub hits: u64,
    /// Reads that needed at least one fraction from disk
    pub misses: u64,
    /// Lines replaced to make room
    pub evictions: u64,
    /// Digest completions compared against the ledger
    pub hash_checks: u64,
    /// Digest completions that disagreed with the ledger
    pub hash_failures: u64,
    /// Failed lines re-read from disk
    pub retries: u64,
    /// Lines currently resident
    pub resident: usize,
    /// Maximum resident lines
    pub capacity: usize,
}

impl CacheStats {
    /// Calculate hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

/// Fraction-granular read cache with background validation
pub struct ReadCache {
    table: RwLock<CacheTable>,
    capacity: usize,
    pool: Arc<HandlePool>,
    ledger: Arc<IntegrityLedger>,
    digests: Option<Arc<dyn DigestService>>,
    completion_tx: Sender<DigestCompletion>,
    completion_rx: Receiver<DigestCompletion>,
    retry_queue: SegQueue<FractionKey>,
    clock: AtomicU64,
    next_ticket: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    hash_checks: AtomicU64,
    hash_failures: AtomicU64,
    retries: AtomicU64,
}

impl ReadCache {
    /// Create a cache with `capacity` lines
    ///
    /// A capacity of 0 disables caching; every read goes to disk. Without
    /// a digest service lines are trusted as soon as they are read.
    pub fn new(
        pool: Arc<HandlePool>,
        ledger: Arc<IntegrityLedger>,
        capacity: usize,
        digests: Option<Arc<dyn DigestService>>,
    ) -> Self {
        let (completion_tx, completion_rx) = channel::unbounded();
        ReadCache {
            table: RwLock::new(CacheTable {
                lines: (0..capacity).map(|_| None).collect(),
            }),
            capacity,
            pool,
            ledger,
            digests,
            completion_tx,
            completion_rx,
            retry_queue: SegQueue::new(),
            clock: AtomicU64::new(0),
            next_ticket: AtomicU64::new(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            hash_checks: AtomicU64::new(0),
            hash_failures: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Serve a read entirely from resident lines
    ///
    /// Returns `(bytes copied, satisfied)`. The read is satisfied only if
    /// every fraction overlapping `[offset, offset + buf.len())` is resident,
    /// servable and long enough; otherwise nothing is copied.
    pub fn try_serve_from_cache(&self, chunk: u16, offset: u64, buf: &mut [u8]) -> (usize, bool) {
        if self.capacity == 0 {
            return (0, false);
        }
        if buf.is_empty() {
            return (0, true);
        }

        let table = self.table.read();
        let keys = fraction_keys(chunk, offset, buf.len());

        let mut lines = Vec::with_capacity(keys.len());
        for key in keys {
            match table.find(key) {
                Some(line) if line.servable() && line.covers(offset, buf.len()) => lines.push(line),
                _ => return (0, false),
            }
        }

        let now = self.tick();
        let mut copied = 0;
        for line in lines {
            line.last_used.store(now, Ordering::Relaxed);
            let n = copy_from_fraction(line.key, &line.data, offset + copied as u64, &mut buf[copied..]);
            copied += n;
            if copied == buf.len() || line.data.len() < FRACTION_SIZE as usize {
                break;
            }
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        (copied, true)
    }

    /// Read through the cache
    ///
    /// Fractions that are not resident are read from disk and inserted.
    /// Returns the number of bytes copied, short only at end of chunk.
    pub fn read(&self, chunk: u16, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.drain_completions();

        if self.capacity == 0 {
            return self.read_direct(chunk, offset, buf);
        }

        let (copied, satisfied) = self.try_serve_from_cache(chunk, offset, buf);
        if satisfied {
            return Ok(copied);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let mut copied = 0;
        for key in fraction_keys(chunk, offset, buf.len()) {
            let resident = {
                let table = self.table.read();
                table
                    .find(key)
                    .filter(|line| line.servable() && line.covers(offset, buf.len()))
                    .map(|line| {
                        line.last_used.store(self.tick(), Ordering::Relaxed);
                        Arc::clone(&line.data)
                    })
            };

            let data = match resident {
                Some(data) => data,
                None => {
                    let data = self.load_fraction(key)?;
                    if !data.is_empty() {
                        self.insert(key, Arc::clone(&data));
                    }
                    data
                }
            };

            let n = copy_from_fraction(key, &data, offset + copied as u64, &mut buf[copied..]);
            copied += n;
            if copied == buf.len() || data.len() < FRACTION_SIZE as usize {
                break;
            }
        }

        Ok(copied)
    }

    /// Read straight from the chunk file, bypassing the cache
    pub fn read_direct(&self, chunk: u16, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.pool.acquire(chunk).read_at(offset, buf)
    }

    /// Apply every digest completion that has already arrived
    ///
    /// Never blocks. Returns how many completions were processed.
    pub fn drain_completions(&self) -> usize {
        let mut processed = 0;
        while let Ok(completion) = self.completion_rx.try_recv() {
            self.check_digest_result(completion);
            processed += 1;
        }
        processed
    }

    /// Compare one digest completion with the ledger
    ///
    /// Returns `None` if the line was evicted or replaced in the meantime,
    /// otherwise whether the line was accepted.
    pub fn check_digest_result(&self, completion: DigestCompletion) -> Option<bool> {
        let mut table = self.table.write();
        let line = table
            .lines
            .iter_mut()
            .flatten()
            .find(|line| line.ticket == Some(completion.ticket))?;

        line.ticket = None;
        self.hash_checks.fetch_add(1, Ordering::Relaxed);

        match self.ledger.expected(line.key) {
            Some(expected)
                if expected.digest == completion.digest
                    && expected.length as usize == line.data.len() =>
            {
                line.state = LineState::Verified;
                line.good_digest = Some(completion.digest);
                Some(true)
            }
            Some(expected) => {
                line.state = LineState::Failed;
                line.failures += 1;
                self.hash_failures.fetch_add(1, Ordering::Relaxed);
                self.retry_queue.push(line.key);
                tracing::warn!(
                    chunk = line.key.chunk,
                    fraction = line.key.fraction,
                    failures = line.failures,
                    "Cached fraction digest {} does not match expected {}",
                    completion.digest,
                    expected.digest
                );
                Some(false)
            }
            None => {
                line.state = LineState::Verified;
                line.good_digest = Some(completion.digest);
                Some(true)
            }
        }
    }

    /// Re-read every line that failed validation
    ///
    /// Each re-read line goes back to `Pending` and is resubmitted for
    /// hashing. Lines evicted since they failed are skipped. Returns how
    /// many lines were re-read.
    pub fn retry_all_bad_cache_lines(&self) -> usize {
        self.drain_completions();

        let mut retried = 0;
        while let Some(key) = self.retry_queue.pop() {
            let still_failed = self
                .table
                .read()
                .find(key)
                .map(|line| line.state == LineState::Failed)
                .unwrap_or(false);
            if !still_failed {
                continue;
            }

            match self.load_fraction(key) {
                Ok(data) if !data.is_empty() => {
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    self.insert(key, data);
                    retried += 1;
                }
                Ok(_) => {
                    tracing::debug!("Fraction {:?} vanished before retry", key);
                    self.invalidate_fraction(key);
                }
                Err(e) => {
                    // Keep it queued for the next pass
                    tracing::debug!("Retry of fraction {:?} failed: {}", key, e);
                    self.retry_queue.push(key);
                    break;
                }
            }
        }

        retried
    }

    /// Block until no line has an outstanding digest, or `timeout` passes
    ///
    /// Returns true when every submitted digest has been processed.
    pub fn wait_for_validation(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        loop {
            self.drain_completions();
            if !self.has_pending() {
                return true;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.completion_rx.recv_timeout(remaining) {
                Ok(completion) => {
                    self.check_digest_result(completion);
                }
                Err(RecvTimeoutError::Timeout) => return !self.has_pending(),
                Err(RecvTimeoutError::Disconnected) => return false,
            }
        }
    }

    /// Drop every line overlapping `[offset, offset + len)` of `chunk`
    pub fn invalidate_range(&self, chunk: u16, offset: u64, len: u64) -> usize {
        if len == 0 {
            return 0;
        }
        let first = FractionKey::containing(chunk, offset).fraction;
        let last = FractionKey::containing(chunk, offset + len - 1).fraction;

        self.invalidate_where(|key| key.chunk == chunk && key.fraction >= first && key.fraction <= last)
    }

    /// Drop every line belonging to `chunk`
    pub fn invalidate_chunk(&self, chunk: u16) -> usize {
        self.invalidate_where(|key| key.chunk == chunk)
    }

    /// Drop every line
    pub fn clear(&self) {
        self.invalidate_where(|_| true);
    }

    /// Validation state of a resident fraction
    pub fn line_state(&self, key: FractionKey) -> Option<LineState> {
        self.table.read().find(key).map(|line| line.state)
    }

    /// Digest mismatches recorded against a resident fraction
    pub fn line_failures(&self, key: FractionKey) -> Option<u32> {
        self.table.read().find(key).map(|line| line.failures)
    }

    /// Last accepted digest of a resident fraction
    pub fn line_digest(&self, key: FractionKey) -> Option<Digest> {
        self.table.read().find(key).and_then(|line| line.good_digest)
    }

    /// Get read cache statistics
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            hash_checks: self.hash_checks.load(Ordering::Relaxed),
            hash_failures: self.hash_failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            resident: self.table.read().lines.iter().flatten().count(),
            capacity: self.capacity,
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn has_pending(&self) -> bool {
        self.table
            .read()
            .lines
            .iter()
            .flatten()
            .any(|line| line.ticket.is_some())
    }

    /// Read one whole fraction from disk
    fn load_fraction(&self, key: FractionKey) -> io::Result<Arc<[u8]>> {
        let handle = self.pool.acquire(key.chunk);
        let mut data = vec![0u8; FRACTION_SIZE as usize];
        let n = handle.read_at(key.offset(), &mut data)?;
        data.truncate(n);
        Ok(Arc::from(data))
    }

    /// Insert or replace a line and submit it for validation
    fn insert(&self, key: FractionKey, data: Arc<[u8]>) {
        let ticket = self.digests.as_ref().map(|_| self.next_ticket.fetch_add(1, Ordering::Relaxed));
        let state = if ticket.is_some() {
            LineState::Pending
        } else {
            LineState::Verified
        };
        let now = self.tick();

        {
            let mut table = self.table.write();
            if let Some(line) = table.find_mut(key) {
                line.data = Arc::clone(&data);
                line.ticket = ticket;
                line.state = state;
                line.last_used.store(now, Ordering::Relaxed);
            } else {
                let slot = table.victim();
                if let Some(evicted) = &table.lines[slot] {
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!("Evicting cached fraction {:?} for {:?}", evicted.key, key);
                }
                table.lines[slot] = Some(CacheLine {
                    key,
                    data: Arc::clone(&data),
                    last_used: AtomicU64::new(now),
                    ticket,
                    failures: 0,
                    good_digest: None,
                    state,
                });
            }
        }

        if let (Some(digests), Some(ticket)) = (&self.digests, ticket) {
            digests.submit(DigestRequest {
                ticket,
                data,
                reply: self.completion_tx.clone(),
            });
        }
    }

    fn invalidate_fraction(&self, key: FractionKey) -> usize {
        self.invalidate_where(|k| k == key)
    }

    fn invalidate_where<F: Fn(FractionKey) -> bool>(&self, predicate: F) -> usize {
        let mut table = self.table.write();
        let mut dropped = 0;
        for slot in table.lines.iter_mut() {
            if slot.as_ref().map(|line| predicate(line.key)).unwrap_or(false) {
                *slot = None;
                dropped += 1;
            }
        }
        dropped
    }
}

impl std::fmt::Debug for ReadCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadCache")
            .field("capacity", &self.capacity)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Fractions overlapping `[offset, offset + len)` of one chunk
fn fraction_keys(chunk: u16, offset: u64, len: usize) -> Vec<FractionKey> {
    if len == 0 {
        return Vec::new();
    }
    let first = FractionKey::containing(chunk, offset).fraction;
    let last = FractionKey::containing(chunk, offset + len as u64 - 1).fraction;
    (first..=last).map(|fraction| FractionKey::new(chunk, fraction)).collect()
}

/// Copy from a fraction buffer starting at chunk offset `position`
fn copy_from_fraction(key: FractionKey, data: &[u8], position: u64, out: &mut [u8]) -> usize {
    let start = (position - key.offset()) as usize;
    if start >= data.len() {
        return 0;
    }
    let n = (data.len() - start).min(out.len());
    out[..n].copy_from_slice(&data[start..start + n]);
    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::InlineDigester;
    use crate::handle_pool::ChunkReader;
    use crate::integrity::hash_fractions;
    use crate::path::ArchivePaths;
    use std::fs::OpenOptions;
    use std::io::{Seek, SeekFrom, Write};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        paths: ArchivePaths,
        pool: Arc<HandlePool>,
        ledger: Arc<IntegrityLedger>,
        data: Vec<u8>,
    }

    fn fixture(len: usize) -> Fixture {
        let dir = TempDir::new().unwrap();
        let paths = ArchivePaths::new(dir.path().join("cache")).unwrap();
        let data: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
        std::fs::write(paths.chunk_file(0), &data).unwrap();

        let pool = Arc::new(HandlePool::new(paths.clone(), 8));
        let ledger = Arc::new(IntegrityLedger::new());
        ledger.record_chunk(0, hash_fractions(0, ChunkReader::new(pool.acquire(0))).unwrap());

        Fixture {
            _dir: dir,
            paths,
            pool,
            ledger,
            data,
        }
    }

    fn cache(f: &Fixture, lines: usize) -> ReadCache {
        let digests: Arc<dyn DigestService> = Arc::new(InlineDigester);
        ReadCache::new(Arc::clone(&f.pool), Arc::clone(&f.ledger), lines, Some(digests))
    }

    fn flip_byte(paths: &ArchivePaths, offset: u64) {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(paths.chunk_file(0))
            .unwrap();
        file.seek(SeekFrom::Start(offset)).unwrap();
        let mut original = [0u8; 1];
        std::io::Read::read_exact(&mut file, &mut original).unwrap();
        file.seek(SeekFrom::Start(offset)).unwrap();
        file.write_all(&[original[0] ^ 0xFF]).unwrap();
        file.flush().unwrap();
    }

    #[test]
    fn test_miss_then_hit() {
        let f = fixture(3 * FRACTION_SIZE as usize);
        let cache = cache(&f, 4);

        let mut buf = vec![0u8; 1000];
        assert_eq!(cache.read(0, 500, &mut buf).unwrap(), 1000);
        assert_eq!(&buf[..], &f.data[500..1500]);

        let (copied, satisfied) = cache.try_serve_from_cache(0, 500, &mut buf);
        assert!(satisfied);
        assert_eq!(copied, 1000);

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.resident, 1);
    }

    #[test]
    fn test_partial_residency_is_not_satisfied() {
        let f = fixture(3 * FRACTION_SIZE as usize);
        let cache = cache(&f, 4);

        let mut small = vec![0u8; 10];
        cache.read(0, 0, &mut small).unwrap();

        // Spans fractions 0 and 1; only 0 is resident
        let mut buf = vec![0u8; 100];
        let offset = FRACTION_SIZE as u64 - 50;
        assert_eq!(cache.try_serve_from_cache(0, offset, &mut buf), (0, false));

        assert_eq!(cache.read(0, offset, &mut buf).unwrap(), 100);
        assert_eq!(&buf[..], &f.data[offset as usize..offset as usize + 100]);
        assert_eq!(cache.try_serve_from_cache(0, offset, &mut buf), (100, true));
    }

    #[test]
    fn test_lru_eviction() {
        let f = fixture(4 * FRACTION_SIZE as usize);
        let cache = cache(&f, 2);
        let mut buf = [0u8; 8];

        cache.read(0, 0, &mut buf).unwrap();
        cache.read(0, FRACTION_SIZE as u64, &mut buf).unwrap();
        cache.read(0, 0, &mut buf).unwrap(); // fraction 1 is now LRU
        cache.read(0, 2 * FRACTION_SIZE as u64, &mut buf).unwrap();

        assert!(cache.line_state(FractionKey::new(0, 0)).is_some());
        assert!(cache.line_state(FractionKey::new(0, 1)).is_none());
        assert!(cache.line_state(FractionKey::new(0, 2)).is_some());
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(cache.stats().resident, 2);
    }

    #[test]
    fn test_short_read_at_end_of_chunk() {
        let f = fixture(FRACTION_SIZE as usize + 100);
        let cache = cache(&f, 4);

        let mut buf = vec![0u8; 500];
        let offset = FRACTION_SIZE as u64 + 50;
        assert_eq!(cache.read(0, offset, &mut buf).unwrap(), 50);

        // The short tail line only serves reads it fully covers
        assert_eq!(cache.try_serve_from_cache(0, offset, &mut buf), (0, false));
        assert_eq!(cache.try_serve_from_cache(0, offset, &mut buf[..50]), (50, true));
    }

    #[test]
    fn test_grown_chunk_reloads_tail_line() {
        let f = fixture(FRACTION_SIZE as usize + 100);
        let cache = cache(&f, 4);
        let offset = FRACTION_SIZE as u64 + 50;

        let mut buf = vec![0u8; 100];
        assert_eq!(cache.read(0, offset, &mut buf).unwrap(), 50);

        let mut file = OpenOptions::new().append(true).open(f.paths.chunk_file(0)).unwrap();
        file.write_all(&[0xAB; 200]).unwrap();
        drop(file);

        assert_eq!(cache.read(0, offset, &mut buf).unwrap(), 100);
        assert_eq!(&buf[..50], &f.data[offset as usize..]);
        assert!(buf[50..].iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn test_valid_line_is_verified() {
        let f = fixture(2 * FRACTION_SIZE as usize);
        let cache = cache(&f, 4);

        let mut buf = [0u8; 16];
        cache.read(0, 0, &mut buf).unwrap();
        assert!(cache.wait_for_validation(Duration::from_secs(5)));

        let key = FractionKey::new(0, 0);
        assert_eq!(cache.line_state(key), Some(LineState::Verified));
        assert_eq!(cache.line_digest(key), f.ledger.expected(key).map(|e| e.digest));
        assert_eq!(cache.stats().hash_failures, 0);
    }

    #[test]
    fn test_corrupted_fraction_is_detected_and_retried() {
        let f = fixture(2 * FRACTION_SIZE as usize);
        let cache = cache(&f, 4);
        let key = FractionKey::new(0, 1);

        flip_byte(&f.paths, FRACTION_SIZE as u64 + 10);

        let mut buf = [0u8; 16];
        cache.read(0, FRACTION_SIZE as u64, &mut buf).unwrap();
        assert!(cache.wait_for_validation(Duration::from_secs(5)));

        assert_eq!(cache.line_state(key), Some(LineState::Failed));
        assert_eq!(cache.line_failures(key), Some(1));
        assert_eq!(cache.stats().hash_failures, 1);

        // Failed lines are not served from cache
        assert_eq!(cache.try_serve_from_cache(0, FRACTION_SIZE as u64, &mut buf), (0, false));

        // The file is still corrupt, so the retry fails again
        assert_eq!(cache.retry_all_bad_cache_lines(), 1);
        assert!(cache.wait_for_validation(Duration::from_secs(5)));
        assert_eq!(cache.line_failures(key), Some(2));
        assert_eq!(cache.stats().retries, 1);

        // Repair the byte; the next retry validates
        flip_byte(&f.paths, FRACTION_SIZE as u64 + 10);
        assert_eq!(cache.retry_all_bad_cache_lines(), 1);
        assert!(cache.wait_for_validation(Duration::from_secs(5)));
        assert_eq!(cache.line_state(key), Some(LineState::Verified));
        assert_eq!(cache.line_failures(key), Some(2));
    }

    #[test]
    fn test_unknown_fraction_is_trusted() {
        let f = fixture(FRACTION_SIZE as usize);
        f.ledger.discard_chunk_hashes(0);
        let cache = cache(&f, 4);

        let mut buf = [0u8; 4];
        cache.read(0, 0, &mut buf).unwrap();
        assert!(cache.wait_for_validation(Duration::from_secs(5)));
        assert_eq!(cache.line_state(FractionKey::new(0, 0)), Some(LineState::Verified));
        assert!(cache.line_digest(FractionKey::new(0, 0)).is_some());
    }

    #[test]
    fn test_invalidate_range() {
        let f = fixture(3 * FRACTION_SIZE as usize);
        let cache = cache(&f, 4);
        let mut buf = [0u8; 4];
        for fraction in 0..3u64 {
            cache.read(0, fraction * FRACTION_SIZE as u64, &mut buf).unwrap();
        }

        assert_eq!(cache.invalidate_range(0, FRACTION_SIZE as u64 - 1, 2), 2);
        assert!(cache.line_state(FractionKey::new(0, 0)).is_none());
        assert!(cache.line_state(FractionKey::new(0, 1)).is_none());
        assert!(cache.line_state(FractionKey::new(0, 2)).is_some());
        assert_eq!(cache.invalidate_chunk(0), 1);
    }

    #[test]
    fn test_disabled_cache_reads_direct() {
        let f = fixture(FRACTION_SIZE as usize);
        let cache = ReadCache::new(Arc::clone(&f.pool), Arc::clone(&f.ledger), 0, None);

        let mut buf = vec![0u8; 64];
        assert_eq!(cache.read(0, 100, &mut buf).unwrap(), 64);
        assert_eq!(&buf[..], &f.data[100..164]);
        assert_eq!(cache.stats().resident, 0);
    }

    #[test]
    fn test_concurrent_readers() {
        let f = fixture(6 * FRACTION_SIZE as usize);
        let cache = Arc::new(cache(&f, 4));
        let data = Arc::new(f.data.clone());

        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let cache = Arc::clone(&cache);
                let data = Arc::clone(&data);
                std::thread::spawn(move || {
                    let mut buf = vec![0u8; 4096];
                    for i in 0..50u64 {
                        let offset = (t * 7919 + i * 104_729) % (data.len() as u64 - 4096);
                        let n = cache.read(0, offset, &mut buf).unwrap();
                        assert_eq!(n, 4096);
                        assert_eq!(&buf[..], &data[offset as usize..offset as usize + 4096]);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(cache.stats().resident <= 4);
    }
}
