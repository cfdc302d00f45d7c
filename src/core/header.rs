use crate::error::{PakError, Result};

pub const MAGIC: u32 = 0x55AA_1234;
pub const VERSION: u32 = 2;
pub const HEADER_SIZE: usize = 32;

/// Default ceiling for a single chunk file (200 MiB)
pub const DEFAULT_CHUNK_SIZE: u32 = 200 * 1024 * 1024;

/// Directory file header
///
/// Occupies the first 32 bytes of the `_dir` file and records the sizes
/// of every section that follows, so a reader can locate the fraction
/// hashes, metadata hashes and signature without parsing the tree.
///
/// # Layout
///
/// ```text
/// Offset  Field
/// 0       magic (0x55AA1234)
/// 4       version
/// 8       tree_size
/// 12      chunk_size
/// 16      fraction_section_size
/// 20      metadata_hash_section_size
/// 24      signature_section_size
/// 28      reserved (0)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryHeader {
    pub magic: u32,
    pub version: u32,
    /// Bytes of the serialized directory tree
    pub tree_size: u32,
    /// Chunk ceiling the archive was built with
    pub chunk_size: u32,
    /// Bytes of the fraction-hash section
    pub fraction_section_size: u32,
    /// Bytes of the metadata-hash section (0 or 96)
    pub metadata_hash_section_size: u32,
    /// Bytes of the signature section (0 when unsigned)
    pub signature_section_size: u32,
    pub reserved: u32,
}

impl DirectoryHeader {
    /// Create a header for an empty archive
    pub fn new(chunk_size: u32) -> Self {
        DirectoryHeader {
            magic: MAGIC,
            version: VERSION,
            tree_size: 0,
            chunk_size,
            fraction_section_size: 0,
            metadata_hash_section_size: 0,
            signature_section_size: 0,
            reserved: 0,
        }
    }

    /// Validate magic, version and geometry
    pub fn validate(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(PakError::InvalidMagic(self.magic));
        }

        if self.version != VERSION {
            return Err(PakError::UnsupportedVersion(self.version));
        }

        if self.chunk_size == 0 {
            return Err(PakError::InvalidChunkSize(self.chunk_size));
        }

        Ok(())
    }

    /// Offset of the first byte after the tree
    pub fn tree_end(&self) -> u64 {
        HEADER_SIZE as u64 + self.tree_size as u64
    }

    /// Offset where the signature section begins
    ///
    /// Everything before this offset is eligible for signing.
    pub fn signature_offset(&self) -> u64 {
        self.tree_end()
            + self.fraction_section_size as u64
            + self.metadata_hash_section_size as u64
    }

    /// Total length of a directory file described by this header
    pub fn file_len(&self) -> u64 {
        self.signature_offset() + self.signature_section_size as u64
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        let fields = [
            self.magic,
            self.version,
            self.tree_size,
            self.chunk_size,
            self.fraction_section_size,
            self.metadata_hash_section_size,
            self.signature_section_size,
            self.reserved,
        ];

        for (i, field) in fields.iter().enumerate() {
            bytes[i * 4..i * 4 + 4].copy_from_slice(&field.to_le_bytes());
        }

        bytes
    }

    /// Deserialize header from bytes and validate it
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(PakError::Corrupt(format!(
                "directory header needs {} bytes, found {}",
                HEADER_SIZE,
                bytes.len()
            )));
        }

        let field = |i: usize| {
            u32::from_le_bytes([
                bytes[i * 4],
                bytes[i * 4 + 1],
                bytes[i * 4 + 2],
                bytes[i * 4 + 3],
            ])
        };

        let header = DirectoryHeader {
            magic: field(0),
            version: field(1),
            tree_size: field(2),
            chunk_size: field(3),
            fraction_section_size: field(4),
            metadata_hash_section_size: field(5),
            signature_section_size: field(6),
            reserved: field(7),
        };

        header.validate()?;

        Ok(header)
    }
}

impl Default for DirectoryHeader {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}
