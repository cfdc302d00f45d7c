//! pakfile command-line tool
//!
//! Create, inspect, extract, hash, sign and verify packed content archives

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pakfile::{
    generate_signing_key, signing_key_from_bytes, AddFileResult, Archive, ArchiveBuilder,
    ArchiveConfig, EntryInfo, SignatureCheck, SigningKey,
};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

#[derive(Parser, Debug)]
#[command(name = "pakfile")]
#[command(about = "Packed content archive tool")]
struct Args {
    /// TOML configuration file
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build a new archive from a directory tree
    Create {
        /// Archive base path (e.g. out/pak01)
        archive: PathBuf,

        /// Directory whose files are packed
        input: PathBuf,

        /// Bytes of each file stored inline in the directory
        #[arg(long, default_value = "0")]
        preload: usize,

        /// Chunk ceiling in bytes
        #[arg(long)]
        chunk_size: Option<u32>,

        /// Let large files span chunk files
        #[arg(long)]
        multi_chunk: bool,

        /// Secret key file used to sign the directory
        #[arg(long)]
        key: Option<PathBuf>,
    },

    /// Add or replace one file in an existing archive
    Add {
        archive: PathBuf,

        /// File on disk
        file: PathBuf,

        /// Path inside the archive (defaults to the file name)
        #[arg(long = "as")]
        entry_path: Option<String>,

        #[arg(long, default_value = "0")]
        preload: usize,

        #[arg(long)]
        multi_chunk: bool,

        #[arg(long)]
        key: Option<PathBuf>,
    },

    /// Remove a file from the directory
    Remove {
        archive: PathBuf,
        entry_path: String,

        #[arg(long)]
        key: Option<PathBuf>,
    },

    /// List files, optionally filtered by a wildcard pattern
    List {
        archive: PathBuf,

        #[arg(default_value = "**")]
        pattern: String,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Copy one file out of the archive
    Extract {
        archive: PathBuf,
        entry_path: String,

        /// Output file (defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Rehash every chunk, print the hashes and rewrite the directory
    Hash {
        archive: PathBuf,

        #[arg(long)]
        key: Option<PathBuf>,
    },

    /// Check chunk files, stored hashes and file CRCs
    Verify {
        archive: PathBuf,

        /// Also read every file and check its CRC
        #[arg(long)]
        crc: bool,
    },

    /// Generate a signing key
    Keygen {
        /// Where to write the secret key (hex)
        output: PathBuf,
    },

    /// Sign the directory of an existing archive
    Sign {
        archive: PathBuf,

        #[arg(long)]
        key: PathBuf,
    },

    /// Check the directory signature against a public key
    CheckSignature {
        archive: PathBuf,

        /// Public key as 64 hex characters
        #[arg(long)]
        public_key: String,
    },
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => ArchiveConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ArchiveConfig::default(),
    };

    match args.command {
        Command::Create {
            archive,
            input,
            preload,
            chunk_size,
            multi_chunk,
            key,
        } => {
            let mut config = config;
            if let Some(size) = chunk_size {
                config.max_chunk_size = size;
            }
            let archive = ArchiveBuilder::new()
                .path(&archive)
                .config(config)
                .create()
                .with_context(|| format!("creating {}", archive.display()))?;
            apply_key(&archive, key.as_deref())?;

            for (entry_path, file) in input_files(&input)? {
                let data = fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
                archive
                    .add_file(&entry_path, preload, &data, multi_chunk, None)
                    .with_context(|| format!("adding {}", entry_path))?;
            }

            let hashes = archive.hash_everything()?;
            archive.write()?;
            println!(
                "Packed {} files into {} chunks",
                archive.file_count(),
                archive.chunk_count()
            );
            println!("directory hash: {}", hashes.tree);
            println!("archive hash:   {}", hashes.fractions);
        }

        Command::Add {
            archive,
            file,
            entry_path,
            preload,
            multi_chunk,
            key,
        } => {
            let archive = open(&archive, config)?;
            apply_key(&archive, key.as_deref())?;

            let entry_path = match entry_path {
                Some(path) => path,
                None => file
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .context("file has no name")?,
            };
            let data = fs::read(&file).with_context(|| format!("reading {}", file.display()))?;

            let result = archive.add_file(&entry_path, preload, &data, multi_chunk, None)?;
            if result != AddFileResult::SameContentNoop {
                archive.hash_everything()?;
                archive.write()?;
            }
            println!("{}: {:?}", entry_path, result);
        }

        Command::Remove {
            archive,
            entry_path,
            key,
        } => {
            let archive = open(&archive, config)?;
            apply_key(&archive, key.as_deref())?;

            if !archive.remove_file_from_directory(&entry_path) {
                bail!("{} is not in the archive", entry_path);
            }
            archive.hash_metadata()?;
            archive.write()?;
            println!("Removed {}", entry_path);
        }

        Command::List {
            archive,
            pattern,
            json,
        } => {
            let archive = open(&archive, config)?;
            let infos = EntryInfo::collect(&archive, &pattern);

            if json {
                println!("{}", serde_json::to_string_pretty(&infos)?);
            } else {
                for info in &infos {
                    println!(
                        "{:>10}  {:>5}  {:>10}  {}  {}",
                        info.size, info.chunk, info.offset, info.crc, info.path
                    );
                }
            }
        }

        Command::Extract {
            archive,
            entry_path,
            output,
        } => {
            let archive = open(&archive, config)?;
            let mut file = archive.open_file(&entry_path)?;
            let mut content = Vec::with_capacity(file.len() as usize);
            file.read_to_end(&mut content)?;

            match output {
                Some(path) => {
                    fs::write(&path, &content)
                        .with_context(|| format!("writing {}", path.display()))?;
                    info!("Extracted {} bytes to {}", content.len(), path.display());
                }
                None => std::io::stdout().write_all(&content)?,
            }
        }

        Command::Hash { archive, key } => {
            let archive = open(&archive, config)?;
            apply_key(&archive, key.as_deref())?;

            let hashes = archive.hash_everything()?;
            for chunk in 0..archive.chunk_count() {
                if let Some(digest) = archive.chunk_hash(chunk) {
                    println!("chunk {:03}: {}", chunk, digest);
                }
            }
            println!("directory:  {}", hashes.tree);
            println!("archive:    {}", hashes.fractions);
            println!("whole file: {}", hashes.whole_file);
            archive.write()?;
        }

        Command::Verify { archive, crc } => {
            let archive = open(&archive, config)?;
            let mut failures = 0;

            for chunk in 0..archive.chunk_count() {
                let bad = archive.verify_chunk_file(chunk)?;
                for key in &bad {
                    println!("chunk {:03} fraction {}: MISMATCH", key.chunk, key.fraction);
                }
                failures += bad.len();
            }

            if !archive.test_directory_hash() {
                println!("directory hash: MISMATCH");
                failures += 1;
            }
            if !archive.test_chunk_hash() {
                println!("fraction section hash: MISMATCH");
                failures += 1;
            }

            if crc {
                for path in archive.file_list() {
                    match archive.verify_file_crc(&path) {
                        Ok(true) => {}
                        Ok(false) => {
                            println!("{}: CRC MISMATCH", path);
                            failures += 1;
                        }
                        Err(e) => {
                            println!("{}: {}", path, e);
                            failures += 1;
                        }
                    }
                }
            }

            if failures > 0 {
                bail!("{} integrity problems found", failures);
            }
            println!("OK");
        }

        Command::Keygen { output } => {
            let key = generate_signing_key();
            fs::write(&output, hex::encode(key.to_bytes()))
                .with_context(|| format!("writing {}", output.display()))?;
            println!("public key: {}", hex::encode(key.verifying_key().to_bytes()));
        }

        Command::Sign { archive, key } => {
            let archive = open(&archive, config)?;
            apply_key(&archive, Some(key.as_path()))?;
            archive.hash_metadata()?;
            archive.write()?;
            if let Some(public) = archive.public_key() {
                println!("signed with {}", hex::encode(public));
            }
        }

        Command::CheckSignature {
            archive,
            public_key,
        } => {
            let public_key = hex::decode(public_key.trim()).context("public key is not hex")?;
            let archive = open(&archive, config)?;

            let result = archive.check_signature(&public_key);
            println!("{:?}", result);
            if result != SignatureCheck::ValidSignature {
                std::process::exit(match result {
                    SignatureCheck::NotSigned => 2,
                    _ => 1,
                });
            }
        }
    }

    Ok(())
}

fn open(path: &Path, config: ArchiveConfig) -> Result<Archive> {
    ArchiveBuilder::new()
        .path(path)
        .config(config)
        .open()
        .with_context(|| format!("opening {}", path.display()))
}

fn apply_key(archive: &Archive, key: Option<&Path>) -> Result<()> {
    if let Some(path) = key {
        archive.set_signing_key(load_key(path)?);
    }
    Ok(())
}

fn load_key(path: &Path) -> Result<SigningKey> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let secret = hex::decode(text.trim()).context("key file is not hex")?;
    Ok(signing_key_from_bytes(&secret)?)
}

/// Regular files under `root` with their archive paths, in name order
fn input_files(root: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walking {}", root.display()))?;
        if !entry.file_type().is_file() {
            if !entry.file_type().is_dir() {
                warn!("Skipping {}", entry.path().display());
            }
            continue;
        }

        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let entry_path = relative.to_string_lossy().replace('\\', "/");
        files.push((entry_path, entry.into_path()));
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_input_files_walks_nested_dirs() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("models/props")).unwrap();
        fs::create_dir_all(root.join("empty")).unwrap();
        fs::write(root.join("readme.txt"), b"hi").unwrap();
        fs::write(root.join("models/tree.mdl"), b"tree").unwrap();
        fs::write(root.join("models/props/crate.mdl"), b"crate").unwrap();

        let files = input_files(root).unwrap();
        let paths: Vec<&str> = files.iter().map(|(path, _)| path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["models/props/crate.mdl", "models/tree.mdl", "readme.txt"]
        );
        assert_eq!(files[1].1, root.join("models/tree.mdl"));
    }

    #[test]
    fn test_input_files_missing_root() {
        let dir = TempDir::new().unwrap();
        assert!(input_files(&dir.path().join("absent")).is_err());
    }
}
