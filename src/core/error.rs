use thiserror::Error;

#[derive(Error, Debug)]
pub enum PakError {
    #[error("Invalid magic number in directory header: {0:#010x}")]
    InvalidMagic(u32),

    #[error("Unsupported directory version: {0}")]
    UnsupportedVersion(u32),

    #[error("Invalid chunk size: {0}")]
    InvalidChunkSize(u32),

    #[error("Corrupt directory: {0}")]
    Corrupt(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("File not found in archive: {0}")]
    FileNotFound(String),

    #[error("File of {size} bytes does not fit in a {limit}-byte chunk")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("Preload of {0} bytes exceeds the 65535-byte limit")]
    PreloadTooLarge(usize),

    #[error("Chunk index {0} exceeds the addressable range")]
    TooManyChunks(u32),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Signing failed: {0}")]
    Signing(String),
}

pub type Result<T> = std::result::Result<T, PakError>;
