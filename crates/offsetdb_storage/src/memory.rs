//! In-memory storage backend for testing.

use crate::backend::{StorageBackend, StorageReader};
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::sync::Arc;

/// An in-memory storage backend.
///
/// This backend stores all data in memory and is suitable for unit tests
/// and ephemeral indexes that don't need persistence. Readers share the
/// same buffer, so they observe appends immediately.
///
/// # Example
///
/// ```rust
/// use offsetdb_storage::{StorageBackend, InMemoryBackend};
///
/// let mut backend = InMemoryBackend::new();
/// let offset = backend.append(b"test data").unwrap();
/// assert_eq!(offset, 0);
/// assert_eq!(backend.size().unwrap(), 9);
/// ```
#[derive(Debug, Default, Clone)]
pub struct InMemoryBackend {
    data: Arc<RwLock<Vec<u8>>>,
}

impl InMemoryBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new in-memory backend with pre-existing data.
    ///
    /// Useful for testing recovery scenarios.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
        }
    }

    /// Returns a copy of all data in the backend.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// Overwrites a single byte, for corruption tests.
    ///
    /// Out of range positions are ignored.
    pub fn corrupt_byte(&self, position: u64) {
        let mut data = self.data.write();
        if let Some(byte) = data.get_mut(position as usize) {
            *byte ^= 0xFF;
        }
    }
}

fn read_range(data: &[u8], offset: u64, len: usize) -> StorageResult<Vec<u8>> {
    let size = data.len() as u64;
    let start = offset as usize;
    let end = start.saturating_add(len);

    if offset > size || end > data.len() {
        return Err(StorageError::ReadPastEnd { offset, len, size });
    }

    Ok(data[start..end].to_vec())
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        read_range(&self.data.read(), offset, len)
    }

    fn append(&mut self, new_data: &[u8]) -> StorageResult<u64> {
        let mut data = self.data.write();
        let offset = data.len() as u64;
        data.extend_from_slice(new_data);
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut data = self.data.write();
        let current_size = data.len() as u64;

        if new_size > current_size {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "cannot truncate to size {} which is greater than current size {}",
                    new_size, current_size
                ),
            )));
        }

        data.truncate(new_size as usize);
        Ok(())
    }

    fn reader(&self) -> StorageResult<Box<dyn StorageReader>> {
        Ok(Box::new(MemoryReader {
            data: Arc::clone(&self.data),
        }))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

struct MemoryReader {
    data: Arc<RwLock<Vec<u8>>>,
}

impl StorageReader for MemoryReader {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        read_range(&self.data.read(), offset, len)
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }
}
