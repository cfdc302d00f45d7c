//! Archive engine
//!
//! Leaf modules first: paths and headers, then the chunk files, handle
//! pool and read cache, then the integrity ledger and signatures, and
//! finally [`Archive`] which ties them together.

pub mod archive;
pub mod chunk;
pub mod config;
pub mod digest;
pub mod directory;
pub mod error;
pub mod handle_pool;
pub mod header;
pub mod integrity;
pub mod io;
pub mod path;
pub mod pattern;
pub mod read_cache;
pub mod signature;

pub use archive::{Archive, FileHandle, FileList};
