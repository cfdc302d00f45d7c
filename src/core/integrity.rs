//! Integrity ledger
//!
//! Hashes are kept at three granularities:
//!
//! ```text
//! fraction  (1 MiB window of a chunk)  →  SHA-256 of the window bytes
//! chunk     (one chunk file)           →  SHA-256 of its fraction digests, in order
//! archive   (every chunk)              →  SHA-256 of the serialized fraction section
//! ```
//!
//! Alongside these the ledger keeps the metadata hashes written into the
//! directory file: the tree digest, the fraction-section digest and the
//! whole-file digest. Nothing here is recomputed implicitly; the archive
//! calls in when a chunk is rehashed or the directory is written.

use crate::digest::{Digest, DIGEST_LEN};
use crate::error::{PakError, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::io::{self, Read};

/// Size of one hashing and caching window
pub const FRACTION_SIZE: u32 = 1024 * 1024;

/// Serialized size of one [`ChunkHashFraction`]
pub const FRACTION_RECORD_SIZE: usize = 12 + DIGEST_LEN;

/// Serialized size of [`MetadataHashes`]
pub const METADATA_HASH_SECTION_SIZE: usize = 3 * DIGEST_LEN;

/// Identifies one fraction of one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FractionKey {
    pub chunk: u16,
    pub fraction: u32,
}

impl FractionKey {
    pub fn new(chunk: u16, fraction: u32) -> Self {
        FractionKey { chunk, fraction }
    }

    /// Fraction containing byte `offset` of `chunk`
    pub fn containing(chunk: u16, offset: u64) -> Self {
        FractionKey {
            chunk,
            fraction: (offset / FRACTION_SIZE as u64) as u32,
        }
    }

    /// Byte offset of the fraction within its chunk
    pub fn offset(&self) -> u64 {
        self.fraction as u64 * FRACTION_SIZE as u64
    }
}

/// Hash of one fraction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHashFraction {
    pub chunk: u16,
    pub fraction: u32,
    /// Bytes covered (FRACTION_SIZE except possibly the last fraction)
    pub length: u32,
    pub digest: Digest,
}

impl ChunkHashFraction {
    pub fn key(&self) -> FractionKey {
        FractionKey::new(self.chunk, self.fraction)
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.chunk as u32).to_le_bytes());
        out.extend_from_slice(&self.fraction.to_le_bytes());
        out.extend_from_slice(&self.length.to_le_bytes());
        out.extend_from_slice(self.digest.as_bytes());
    }

    fn from_record(record: &[u8]) -> Result<Self> {
        let word = |i: usize| {
            u32::from_le_bytes([record[i], record[i + 1], record[i + 2], record[i + 3]])
        };

        let chunk = word(0);
        let chunk = u16::try_from(chunk).map_err(|_| PakError::TooManyChunks(chunk))?;
        let length = word(8);
        if length == 0 || length > FRACTION_SIZE {
            return Err(PakError::Corrupt(format!(
                "fraction hash covers {} bytes",
                length
            )));
        }

        Ok(ChunkHashFraction {
            chunk,
            fraction: word(4),
            length,
            digest: Digest::from_slice(&record[12..12 + DIGEST_LEN])
                .ok_or_else(|| PakError::Corrupt("short fraction digest".to_string()))?,
        })
    }
}

/// Hashes stored in the metadata-hash section of the directory file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataHashes {
    /// Digest of the serialized tree
    pub tree: Digest,
    /// Digest of the serialized fraction section
    pub fractions: Digest,
    /// Digest of the directory file up to (excluding) this field
    pub whole_file: Digest,
}

impl MetadataHashes {
    pub fn to_bytes(&self) -> [u8; METADATA_HASH_SECTION_SIZE] {
        let mut bytes = [0u8; METADATA_HASH_SECTION_SIZE];
        bytes[..DIGEST_LEN].copy_from_slice(self.tree.as_bytes());
        bytes[DIGEST_LEN..2 * DIGEST_LEN].copy_from_slice(self.fractions.as_bytes());
        bytes[2 * DIGEST_LEN..].copy_from_slice(self.whole_file.as_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != METADATA_HASH_SECTION_SIZE {
            return Err(PakError::Corrupt(format!(
                "metadata hash section is {} bytes, expected {}",
                bytes.len(),
                METADATA_HASH_SECTION_SIZE
            )));
        }

        let digest = |i: usize| {
            Digest::from_slice(&bytes[i * DIGEST_LEN..(i + 1) * DIGEST_LEN]).unwrap_or_default()
        };

        Ok(MetadataHashes {
            tree: digest(0),
            fractions: digest(1),
            whole_file: digest(2),
        })
    }
}

/// Hash a chunk's contents into fraction hashes
///
/// Reads `reader` to EOF in [`FRACTION_SIZE`] windows.
pub fn hash_fractions<R: Read>(chunk: u16, mut reader: R) -> io::Result<Vec<ChunkHashFraction>> {
    let mut fractions = Vec::new();
    let mut buffer = vec![0u8; FRACTION_SIZE as usize];

    loop {
        let mut filled = 0;
        while filled < buffer.len() {
            match reader.read(&mut buffer[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        if filled == 0 {
            break;
        }

        fractions.push(ChunkHashFraction {
            chunk,
            fraction: fractions.len() as u32,
            length: filled as u32,
            digest: Digest::of(&buffer[..filled]),
        });

        if filled < buffer.len() {
            break;
        }
    }

    Ok(fractions)
}

/// Fold ordered fraction hashes into a chunk hash
pub fn chunk_hash_of(fractions: &[ChunkHashFraction]) -> Digest {
    Digest::of_parts(fractions.iter().map(|f| &f.digest.as_bytes()[..]))
}

/// Hash of a serialized directory tree
pub fn compute_directory_hash(tree: &[u8]) -> Digest {
    Digest::of(tree)
}

/// Store of fraction and metadata hashes
#[derive(Debug, Default)]
pub struct IntegrityLedger {
    fractions: RwLock<BTreeMap<FractionKey, ChunkHashFraction>>,
    metadata: RwLock<Option<MetadataHashes>>,
}

impl IntegrityLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a ledger from the sections of a directory file
    pub fn from_sections(fraction_section: &[u8], metadata_section: &[u8]) -> Result<Self> {
        if fraction_section.len() % FRACTION_RECORD_SIZE != 0 {
            return Err(PakError::Corrupt(format!(
                "fraction section length {} is not a multiple of {}",
                fraction_section.len(),
                FRACTION_RECORD_SIZE
            )));
        }

        let mut fractions = BTreeMap::new();
        for record in fraction_section.chunks_exact(FRACTION_RECORD_SIZE) {
            let fraction = ChunkHashFraction::from_record(record)?;
            fractions.insert(fraction.key(), fraction);
        }

        let metadata = if metadata_section.is_empty() {
            None
        } else {
            Some(MetadataHashes::from_bytes(metadata_section)?)
        };

        Ok(IntegrityLedger {
            fractions: RwLock::new(fractions),
            metadata: RwLock::new(metadata),
        })
    }

    /// Expected hash for one fraction, if known
    pub fn expected(&self, key: FractionKey) -> Option<ChunkHashFraction> {
        self.fractions.read().get(&key).copied()
    }

    /// Replace all fraction hashes of one chunk
    ///
    /// Returns the resulting chunk hash.
    pub fn record_chunk(&self, chunk: u16, hashes: Vec<ChunkHashFraction>) -> Digest {
        let digest = chunk_hash_of(&hashes);
        let mut fractions = self.fractions.write();
        fractions.retain(|key, _| key.chunk != chunk);
        for hash in hashes {
            fractions.insert(hash.key(), hash);
        }
        digest
    }

    /// Forget the fraction hashes of one chunk, leaving the rest untouched
    ///
    /// Returns how many fraction hashes were discarded.
    pub fn discard_chunk_hashes(&self, chunk: u16) -> usize {
        let mut fractions = self.fractions.write();
        let before = fractions.len();
        fractions.retain(|key, _| key.chunk != chunk);
        before - fractions.len()
    }

    /// Fraction hashes of one chunk, ordered by fraction index
    pub fn chunk_fractions(&self, chunk: u16) -> Vec<ChunkHashFraction> {
        self.fractions
            .read()
            .range(FractionKey::new(chunk, 0)..=FractionKey::new(chunk, u32::MAX))
            .map(|(_, hash)| *hash)
            .collect()
    }

    /// Chunk hash folded from the stored fraction hashes
    pub fn chunk_hash(&self, chunk: u16) -> Option<Digest> {
        let fractions = self.chunk_fractions(chunk);
        if fractions.is_empty() {
            None
        } else {
            Some(chunk_hash_of(&fractions))
        }
    }

    /// Chunks that have at least one fraction hash
    pub fn hashed_chunks(&self) -> Vec<u16> {
        let mut chunks: Vec<u16> = self.fractions.read().keys().map(|k| k.chunk).collect();
        chunks.dedup();
        chunks
    }

    pub fn fraction_count(&self) -> usize {
        self.fractions.read().len()
    }

    /// Serialize every fraction hash in key order
    pub fn serialize_fractions(&self) -> Vec<u8> {
        let fractions = self.fractions.read();
        let mut out = Vec::with_capacity(fractions.len() * FRACTION_RECORD_SIZE);
        for fraction in fractions.values() {
            fraction.write_to(&mut out);
        }
        out
    }

    /// Whole-archive hash over all chunk hashes
    pub fn compute_chunk_hash(&self) -> Digest {
        Digest::of(&self.serialize_fractions())
    }

    pub fn metadata(&self) -> Option<MetadataHashes> {
        *self.metadata.read()
    }

    pub fn set_metadata(&self, hashes: MetadataHashes) {
        *self.metadata.write() = Some(hashes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_fraction_key_geometry() {
        let key = FractionKey::containing(3, FRACTION_SIZE as u64 * 2 + 17);
        assert_eq!(key, FractionKey::new(3, 2));
        assert_eq!(key.offset(), FRACTION_SIZE as u64 * 2);
    }

    #[test]
    fn test_hash_fractions_partitions_chunk() {
        let data = patterned(FRACTION_SIZE as usize * 2 + 100);
        let fractions = hash_fractions(5, Cursor::new(&data)).unwrap();

        assert_eq!(fractions.len(), 3);
        assert_eq!(fractions[0].length, FRACTION_SIZE);
        assert_eq!(fractions[1].length, FRACTION_SIZE);
        assert_eq!(fractions[2].length, 100);
        assert_eq!(fractions[2].fraction, 2);
        assert_eq!(
            fractions[1].digest,
            Digest::of(&data[FRACTION_SIZE as usize..2 * FRACTION_SIZE as usize])
        );
    }

    #[test]
    fn test_empty_chunk_has_no_fractions() {
        let fractions = hash_fractions(0, Cursor::new(Vec::<u8>::new())).unwrap();
        assert!(fractions.is_empty());
    }

    #[test]
    fn test_chunk_hash_from_stored_fractions() {
        let ledger = IntegrityLedger::new();
        let data = patterned(FRACTION_SIZE as usize + 10);
        let fractions = hash_fractions(1, Cursor::new(&data)).unwrap();
        let recorded = ledger.record_chunk(1, fractions.clone());

        assert_eq!(ledger.chunk_hash(1), Some(recorded));
        assert_eq!(recorded, chunk_hash_of(&fractions));
        assert_eq!(ledger.chunk_hash(2), None);
    }

    #[test]
    fn test_discard_only_touches_one_chunk() {
        let ledger = IntegrityLedger::new();
        ledger.record_chunk(0, hash_fractions(0, Cursor::new(patterned(100))).unwrap());
        ledger.record_chunk(1, hash_fractions(1, Cursor::new(patterned(200))).unwrap());

        assert_eq!(ledger.discard_chunk_hashes(0), 1);
        assert!(ledger.chunk_hash(0).is_none());
        assert!(ledger.chunk_hash(1).is_some());
        assert_eq!(ledger.hashed_chunks(), vec![1]);
    }

    #[test]
    fn test_section_round_trip() {
        let ledger = IntegrityLedger::new();
        ledger.record_chunk(0, hash_fractions(0, Cursor::new(patterned(3000))).unwrap());
        ledger.record_chunk(2, hash_fractions(2, Cursor::new(patterned(50))).unwrap());
        let metadata = MetadataHashes {
            tree: Digest::of(b"tree"),
            fractions: ledger.compute_chunk_hash(),
            whole_file: Digest::of(b"file"),
        };
        ledger.set_metadata(metadata);

        let restored =
            IntegrityLedger::from_sections(&ledger.serialize_fractions(), &metadata.to_bytes())
                .unwrap();

        assert_eq!(restored.fraction_count(), 2);
        assert_eq!(restored.chunk_hash(2), ledger.chunk_hash(2));
        assert_eq!(restored.compute_chunk_hash(), ledger.compute_chunk_hash());
        assert_eq!(restored.metadata(), Some(metadata));
    }

    #[test]
    fn test_rejects_ragged_fraction_section() {
        assert!(matches!(
            IntegrityLedger::from_sections(&[0u8; FRACTION_RECORD_SIZE + 3], &[]),
            Err(PakError::Corrupt(_))
        ));
    }
}
