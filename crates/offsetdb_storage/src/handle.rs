//! Exclusive write handle and force-closable read handles.
//!
//! A store has exactly one [`WriteOnlyHandle`]. Every mutation runs inside
//! [`WriteOnlyHandle::check_and_execute`], which acquires the exclusive lock
//! (failing with [`StorageError::LockTimeout`] after the configured timeout),
//! evaluates a precondition and then runs the body with a [`WriteAccess`].
//!
//! Appended bytes are staged in an output buffer and handed to the backend
//! once the buffer fills up or the handle is synced. Two positions are
//! tracked:
//!
//! - `last_written_position`: end of everything appended, buffered or not
//! - `last_synced_position`: end of the durable, reader-visible prefix
//!
//! Readers must not expect bytes beyond `last_synced_position` to be present.

use crate::backend::{StorageBackend, StorageReader};
use crate::error::{StorageError, StorageResult};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct WriteState {
    backend: Box<dyn StorageBackend>,
    buffer: Vec<u8>,
}

impl WriteState {
    fn drain(&mut self) -> StorageResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.backend.append(&self.buffer)?;
        self.backend.flush()?;
        self.buffer.clear();
        Ok(())
    }
}

/// The single exclusive writer of a store.
pub struct WriteOnlyHandle {
    name: String,
    state: Mutex<WriteState>,
    lock_timeout: Duration,
    buffer_limit: usize,
    written: AtomicU64,
    synced: AtomicU64,
    closed: AtomicBool,
    next_reader_id: AtomicU64,
}

impl std::fmt::Debug for WriteOnlyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteOnlyHandle")
            .field("name", &self.name)
            .field("written", &self.last_written_position())
            .field("synced", &self.last_synced_position())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl WriteOnlyHandle {
    /// Wraps a backend. Appends continue at the backend's current size.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be determined.
    pub fn new(
        name: impl Into<String>,
        backend: Box<dyn StorageBackend>,
        buffer_limit: usize,
        lock_timeout: Duration,
    ) -> StorageResult<Self> {
        let size = backend.size()?;
        Ok(Self {
            name: name.into(),
            state: Mutex::new(WriteState {
                backend,
                buffer: Vec::with_capacity(buffer_limit.min(64 * 1024)),
            }),
            lock_timeout,
            buffer_limit,
            written: AtomicU64::new(size),
            synced: AtomicU64::new(size),
            closed: AtomicBool::new(false),
            next_reader_id: AtomicU64::new(1),
        })
    }

    /// Name of the underlying store.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// End of all appended bytes, including those still buffered.
    #[must_use]
    pub fn last_written_position(&self) -> u64 {
        self.written.load(Ordering::Acquire)
    }

    /// End of the synced prefix of the store.
    #[must_use]
    pub fn last_synced_position(&self) -> u64 {
        self.synced.load(Ordering::Acquire)
    }

    /// Returns true once [`WriteOnlyHandle::close`] completed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn lock(&self, label: &str) -> StorageResult<MutexGuard<'_, WriteState>> {
        if self.is_closed() {
            return Err(StorageError::Closed);
        }
        let guard = self
            .state
            .try_lock_for(self.lock_timeout)
            .ok_or_else(|| StorageError::LockTimeout {
                label: label.to_string(),
                timeout: self.lock_timeout,
            })?;
        if self.is_closed() {
            return Err(StorageError::Closed);
        }
        Ok(guard)
    }

    /// Runs `body` while holding the exclusive write lock.
    ///
    /// `precondition` is evaluated after the lock is acquired; when it fails
    /// the body is not run.
    ///
    /// # Errors
    ///
    /// Returns the precondition or body error, or a storage error when the
    /// lock cannot be acquired.
    pub fn check_and_execute<T, E>(
        &self,
        label: &str,
        precondition: impl FnOnce() -> Result<(), E>,
        body: impl FnOnce(&mut WriteAccess<'_>) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StorageError>,
    {
        let mut state = self.lock(label)?;
        precondition()?;
        let mut access = WriteAccess {
            state: &mut state,
            written: &self.written,
            buffer_limit: self.buffer_limit,
        };
        body(&mut access)
    }

    /// Like [`WriteOnlyHandle::check_and_execute`], then syncs the store and
    /// runs `post_sync` with the body result and the new synced position,
    /// all without releasing the lock.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by any stage.
    pub fn check_and_execute_and_sync<T, R, E>(
        &self,
        label: &str,
        precondition: impl FnOnce() -> Result<(), E>,
        body: impl FnOnce(&mut WriteAccess<'_>) -> Result<T, E>,
        post_sync: impl FnOnce(T, u64) -> Result<R, E>,
    ) -> Result<R, E>
    where
        E: From<StorageError>,
    {
        let mut state = self.lock(label)?;
        precondition()?;
        let result = {
            let mut access = WriteAccess {
                state: &mut state,
                written: &self.written,
                buffer_limit: self.buffer_limit,
            };
            body(&mut access)?
        };
        let synced = self.sync_locked(&mut state)?;
        post_sync(result, synced)
    }

    /// Hands buffered bytes to the backend and syncs it.
    ///
    /// Returns the new synced position.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be acquired or the sync fails.
    pub fn sync(&self, label: &str) -> StorageResult<u64> {
        let mut state = self.lock(label)?;
        self.sync_locked(&mut state)
    }

    fn sync_locked(&self, state: &mut WriteState) -> StorageResult<u64> {
        state.drain()?;
        state.backend.sync()?;
        let written = self.written.load(Ordering::Acquire);
        self.synced.store(written, Ordering::Release);
        Ok(written)
    }

    /// Opens a new read handle over the same store.
    ///
    /// The write lock is taken briefly, so this honours the lock timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock times out or the reader cannot be opened.
    pub fn to_read_only_handle(&self) -> StorageResult<ReadOnlyHandle> {
        let state = self.lock("Opening read handle")?;
        let reader = state.backend.reader()?;
        drop(state);
        let id = self.next_reader_id.fetch_add(1, Ordering::Relaxed);
        Ok(ReadOnlyHandle {
            id,
            name: self.name.clone(),
            reader,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Syncs outstanding data and refuses any further use.
    ///
    /// # Errors
    ///
    /// Returns an error if the final sync fails.
    pub fn close(&self) -> StorageResult<()> {
        let mut state = self.lock("Closing write handle")?;
        self.sync_locked(&mut state)?;
        self.closed.store(true, Ordering::Release);
        tracing::debug!(store = %self.name, size = self.last_synced_position(), "write handle closed");
        Ok(())
    }
}

/// Append access granted inside [`WriteOnlyHandle::check_and_execute`].
pub struct WriteAccess<'a> {
    state: &'a mut WriteState,
    written: &'a AtomicU64,
    buffer_limit: usize,
}

impl WriteAccess<'_> {
    /// Offset at which the next write lands.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.written.load(Ordering::Acquire)
    }

    /// Appends `bytes` and returns the offset they were written at.
    ///
    /// # Errors
    ///
    /// Returns an error if a full buffer cannot be handed to the backend.
    pub fn write(&mut self, bytes: &[u8]) -> StorageResult<u64> {
        let offset = self.position();
        self.state.buffer.extend_from_slice(bytes);
        self.written
            .store(offset + bytes.len() as u64, Ordering::Release);
        if self.state.buffer.len() >= self.buffer_limit {
            self.state.drain()?;
        }
        Ok(offset)
    }
}

/// Closes a [`ReadOnlyHandle`] from another thread.
#[derive(Debug, Clone)]
pub struct HandleCloser {
    id: u64,
    closed: Arc<AtomicBool>,
}

impl HandleCloser {
    /// Identifier of the handle this closer belongs to.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Marks the handle closed; subsequent reads fail with
    /// [`StorageError::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// A read-only view of a store, usually borrowed from a pool.
pub struct ReadOnlyHandle {
    id: u64,
    name: String,
    reader: Box<dyn StorageReader>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for ReadOnlyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadOnlyHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ReadOnlyHandle {
    /// Identifier unique among handles opened by the same writer.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns true once the handle was closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns a closer that can force-close this handle from elsewhere.
    #[must_use]
    pub fn closer(&self) -> HandleCloser {
        HandleCloser {
            id: self.id,
            closed: Arc::clone(&self.closed),
        }
    }

    /// Runs `body` against the reader.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Closed`] if the handle was closed, otherwise
    /// whatever `body` returns.
    pub fn execute<T, E>(
        &self,
        body: impl FnOnce(&dyn StorageReader) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StorageError>,
    {
        if self.is_closed() {
            return Err(StorageError::Closed.into());
        }
        body(self.reader.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBackend;
    use std::thread;

    fn handle(buffer_limit: usize) -> (InMemoryBackend, WriteOnlyHandle) {
        let backend = InMemoryBackend::new();
        let handle = WriteOnlyHandle::new(
            "test",
            Box::new(backend.clone()),
            buffer_limit,
            Duration::from_millis(50),
        )
        .unwrap();
        (backend, handle)
    }

    fn ok() -> Result<(), StorageError> {
        Ok(())
    }

    #[test]
    fn writes_are_buffered_until_sync() {
        let (backend, handle) = handle(1024);

        let offset = handle
            .check_and_execute("write", ok, |access| access.write(b"abc"))
            .unwrap();
        assert_eq!(offset, 0);
        assert_eq!(handle.last_written_position(), 3);
        assert_eq!(handle.last_synced_position(), 0);
        assert!(backend.data().is_empty());

        assert_eq!(handle.sync("sync").unwrap(), 3);
        assert_eq!(backend.data(), b"abc");
    }

    #[test]
    fn full_buffer_is_handed_to_backend() {
        let (backend, handle) = handle(4);

        handle
            .check_and_execute("write", ok, |access| {
                access.write(b"ab")?;
                access.write(b"cdef")
            })
            .unwrap();
        assert_eq!(backend.data(), b"abcdef");
        assert_eq!(handle.last_synced_position(), 0);
    }

    #[test]
    fn failed_precondition_skips_body() {
        let (_backend, handle) = handle(16);

        let result: Result<u64, StorageError> = handle.check_and_execute(
            "write",
            || Err(StorageError::Closed),
            |access| access.write(b"never"),
        );
        assert!(matches!(result, Err(StorageError::Closed)));
        assert_eq!(handle.last_written_position(), 0);
    }

    #[test]
    fn sync_variant_reports_synced_position() {
        let (backend, handle) = handle(1024);

        let (offset, synced) = handle
            .check_and_execute_and_sync(
                "flush",
                ok,
                |access| access.write(b"fragment"),
                |offset, synced| Ok::<_, StorageError>((offset, synced)),
            )
            .unwrap();
        assert_eq!(offset, 0);
        assert_eq!(synced, 8);
        assert_eq!(backend.data(), b"fragment");
    }

    #[test]
    fn lock_timeout_is_reported() {
        let (_backend, handle) = handle(16);
        let handle = Arc::new(handle);

        let (tx, rx) = std::sync::mpsc::channel();
        let holder = {
            let handle = Arc::clone(&handle);
            thread::spawn(move || {
                handle
                    .check_and_execute("hold", ok, |_| {
                        tx.send(()).unwrap();
                        thread::sleep(Duration::from_millis(300));
                        Ok(())
                    })
                    .unwrap();
            })
        };

        rx.recv().unwrap();
        let result = handle.check_and_execute("contend", ok, |access| access.write(b"x"));
        match result {
            Err(err @ StorageError::LockTimeout { .. }) => assert!(err.is_retryable()),
            other => panic!("expected lock timeout, got {other:?}"),
        }
        holder.join().unwrap();
    }

    #[test]
    fn closed_handle_rejects_writes_and_readers() {
        let (_backend, handle) = handle(16);
        handle
            .check_and_execute("write", ok, |access| access.write(b"x"))
            .unwrap();
        handle.close().unwrap();

        assert_eq!(handle.last_synced_position(), 1);
        assert!(matches!(handle.sync("sync"), Err(StorageError::Closed)));
        assert!(matches!(
            handle.to_read_only_handle(),
            Err(StorageError::Closed)
        ));
    }

    #[test]
    fn read_handle_force_close() {
        let (_backend, handle) = handle(1);
        handle
            .check_and_execute("write", ok, |access| access.write(b"data"))
            .unwrap();

        let reader = handle.to_read_only_handle().unwrap();
        let data: Vec<u8> = reader.execute(|r| r.read_at(0, 4)).unwrap();
        assert_eq!(data, b"data");

        let closer = reader.closer();
        assert_eq!(closer.id(), reader.id());
        closer.close();

        let result: StorageResult<Vec<u8>> = reader.execute(|r| r.read_at(0, 4));
        assert!(matches!(result, Err(StorageError::Closed)));
    }
}
