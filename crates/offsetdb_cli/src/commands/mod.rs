//! CLI command implementations.

pub mod compact;
pub mod dump_fragments;
pub mod inspect;
pub mod verify;

use offsetdb_core::serialization::{self, CollectingIndexBuilder};
use offsetdb_core::DescriptorHeader;
use offsetdb_storage::{FileBackend, StorageBackend, StorageReader};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Result type shared by the commands.
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// The descriptor file for `data`, unless one was given explicitly.
pub fn descriptor_path(data: &Path, explicit: Option<PathBuf>) -> PathBuf {
    explicit.unwrap_or_else(|| {
        let mut name = OsString::from(data.as_os_str());
        name.push(".descriptor");
        PathBuf::from(name)
    })
}

/// Reads a persisted descriptor header.
pub fn load_descriptor(path: &Path) -> CliResult<DescriptorHeader> {
    if !path.exists() {
        return Err(format!("Descriptor file not found: {}", path.display()).into());
    }
    let bytes = std::fs::read(path)?;
    Ok(DescriptorHeader::from_bytes(&bytes)?)
}

/// Opens a reader over an existing data file, returning it with the file size.
pub fn open_reader(path: &Path) -> CliResult<(Box<dyn StorageReader>, u64)> {
    if !path.exists() {
        return Err(format!("Index file not found: {}", path.display()).into());
    }
    let backend = FileBackend::open(path)?;
    let size = backend.size()?;
    Ok((backend.reader()?, size))
}

/// Replays the fragment chain ending at the descriptor's tail.
pub fn replay(
    reader: &dyn StorageReader,
    header: &DescriptorHeader,
    verify_crc: bool,
) -> CliResult<(CollectingIndexBuilder, usize)> {
    let mut builder = CollectingIndexBuilder::new();
    let fragments =
        serialization::deserialize(reader, header.file_location, &mut builder, verify_crc)?;
    Ok((builder, fragments))
}

/// Human readable byte count.
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{}", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
