//! # OffsetDB Storage
//!
//! Storage backends and file handles for OffsetDB.
//!
//! This crate provides the lowest-level storage abstraction for OffsetDB.
//! Storage backends are **opaque byte stores** - they do not interpret
//! the data they store.
//!
//! ## Design Principles
//!
//! - Backends are simple byte stores (read, append, sync)
//! - No knowledge of the record envelope or fragment format
//! - Exactly one [`WriteOnlyHandle`] appends to a store, guarded by a lock
//!   with an acquisition timeout
//! - Any number of [`ReadOnlyHandle`]s read concurrently through their own
//!   [`StorageReader`]
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For testing and ephemeral storage
//! - [`FileBackend`] - For persistent storage using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use offsetdb_storage::{InMemoryBackend, StorageError, WriteOnlyHandle};
//! use std::time::Duration;
//!
//! let handle = WriteOnlyHandle::new(
//!     "memory",
//!     Box::new(InMemoryBackend::new()),
//!     4096,
//!     Duration::from_secs(1),
//! )
//! .unwrap();
//!
//! let offset = handle
//!     .check_and_execute_and_sync(
//!         "append",
//!         || Ok::<(), StorageError>(()),
//!         |access| access.write(b"hello world"),
//!         |offset, _synced| Ok(offset),
//!     )
//!     .unwrap();
//!
//! let reader = handle.to_read_only_handle().unwrap();
//! let data = reader.execute(|r| r.read_at(offset, 11)).unwrap();
//! assert_eq!(&data, b"hello world");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod handle;
mod memory;

pub use backend::{StorageBackend, StorageReader};
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use handle::{HandleCloser, ReadOnlyHandle, WriteAccess, WriteOnlyHandle};
pub use memory::InMemoryBackend;
