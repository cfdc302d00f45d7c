//! Path handling for archive entries and archive files
//!
//! Entry paths are normalized so that lookups are case-insensitive and
//! separator-agnostic. Archive file names are derived from a base name:
//! `{base}_dir.pak` for the directory and `{base}_{NNN}.pak` for chunks.

use crate::error::{PakError, Result};
use std::path::{Path, PathBuf};

/// Extension shared by the directory file and every chunk file
pub const ARCHIVE_EXTENSION: &str = "pak";

/// Suffix appended to the base name for the directory file
pub const DIRECTORY_SUFFIX: &str = "_dir";

/// Placeholder stored in the tree for an empty path component
///
/// The tree terminates each level with an empty string, so empty
/// extensions, directories and stems are written as a single space.
pub const EMPTY_COMPONENT: &str = " ";

/// Normalize a logical entry path
///
/// Lowercases the path, converts `\` to `/`, strips leading `/` and `./`
/// and drops `.` components.
///
/// # Errors
///
/// Returns `InvalidPath` for empty paths, `..` components, NUL bytes or
/// components consisting of a single space.
///
/// # Examples
///
/// ```
/// use pakfile::normalize_entry_path;
///
/// assert_eq!(normalize_entry_path("Models\\A.MDL").unwrap(), "models/a.mdl");
/// assert_eq!(normalize_entry_path("/./sound/hit.wav").unwrap(), "sound/hit.wav");
/// assert!(normalize_entry_path("../escape").is_err());
/// ```
pub fn normalize_entry_path(path: &str) -> Result<String> {
    if path.contains('\0') {
        return Err(PakError::InvalidPath(path.escape_debug().to_string()));
    }

    let lowered = path.replace('\\', "/").to_lowercase();
    let mut parts: Vec<&str> = Vec::new();

    for part in lowered.split('/') {
        match part {
            "" | "." => continue,
            ".." => return Err(PakError::InvalidPath(path.to_string())),
            EMPTY_COMPONENT => return Err(PakError::InvalidPath(path.to_string())),
            _ => parts.push(part),
        }
    }

    if parts.is_empty() {
        return Err(PakError::InvalidPath(path.to_string()));
    }

    let normalized = parts.join("/");
    let (_, stem, ext) = split_entry_path(&normalized);
    if stem == EMPTY_COMPONENT || ext == EMPTY_COMPONENT {
        return Err(PakError::InvalidPath(path.to_string()));
    }

    Ok(normalized)
}

/// Split a normalized entry path into `(directory, stem, extension)`
///
/// Empty components come back as empty strings; the tree codec replaces
/// them with [`EMPTY_COMPONENT`].
pub fn split_entry_path(path: &str) -> (&str, &str, &str) {
    let (dir, file) = match path.rfind('/') {
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => ("", path),
    };

    match file.rfind('.') {
        Some(idx) if idx + 1 < file.len() => (dir, &file[..idx], &file[idx + 1..]),
        _ => (dir, file, ""),
    }
}

/// Rebuild an entry path from the components stored in the tree
pub fn join_entry_path(dir: &str, stem: &str, ext: &str) -> String {
    let mut path = String::with_capacity(dir.len() + stem.len() + ext.len() + 2);
    if !dir.is_empty() {
        path.push_str(dir);
        path.push('/');
    }
    path.push_str(stem);
    if !ext.is_empty() {
        path.push('.');
        path.push_str(ext);
    }
    path
}

/// Names of the files that make up one archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivePaths {
    base: PathBuf,
}

impl ArchivePaths {
    /// Derive archive paths from a base name
    ///
    /// Accepts the bare base (`/data/pak01`), the directory file
    /// (`/data/pak01_dir.pak`) or a chunk file (`/data/pak01_003.pak`).
    ///
    /// # Examples
    ///
    /// ```
    /// use pakfile::ArchivePaths;
    /// use std::path::Path;
    ///
    /// let paths = ArchivePaths::new("/data/pak01_dir.pak").unwrap();
    /// assert_eq!(paths.directory_file(), Path::new("/data/pak01_dir.pak"));
    /// assert_eq!(paths.chunk_file(7), Path::new("/data/pak01_007.pak"));
    /// ```
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let parent = path.parent();

        let file_name = path
            .file_name()
            .and_then(|s| s.to_str())
            .ok_or_else(|| PakError::InvalidPath(path.display().to_string()))?;

        let without_ext = file_name
            .strip_suffix(&format!(".{}", ARCHIVE_EXTENSION))
            .unwrap_or(file_name);

        let stem = match without_ext.strip_suffix(DIRECTORY_SUFFIX) {
            Some(stem) => stem,
            None => strip_chunk_suffix(without_ext),
        };

        if stem.is_empty() {
            return Err(PakError::InvalidPath(path.display().to_string()));
        }

        let base = match parent {
            Some(parent_dir) => parent_dir.join(stem),
            None => PathBuf::from(stem),
        };

        Ok(ArchivePaths { base })
    }

    /// Base path without any suffix
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Path of the directory file
    pub fn directory_file(&self) -> PathBuf {
        self.with_suffix(DIRECTORY_SUFFIX)
    }

    /// Path of chunk file `index`
    pub fn chunk_file(&self, index: u16) -> PathBuf {
        self.with_suffix(&format!("_{:03}", index))
    }

    fn with_suffix(&self, suffix: &str) -> PathBuf {
        let mut name = self
            .base
            .file_name()
            .map(|s| s.to_os_string())
            .unwrap_or_default();
        name.push(suffix);
        name.push(".");
        name.push(ARCHIVE_EXTENSION);
        self.base.with_file_name(name)
    }
}

/// Strip a trailing `_NNN` chunk number, if present
fn strip_chunk_suffix(name: &str) -> &str {
    if let Some(idx) = name.rfind('_') {
        let digits = &name[idx + 1..];
        if digits.len() >= 3 && digits.bytes().all(|b| b.is_ascii_digit()) {
            return &name[..idx];
        }
    }
    name
}
