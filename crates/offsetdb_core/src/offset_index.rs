//! The offset index engine.
//!
//! An [`OffsetIndex`] maps typed keys to the location of their newest value
//! in a single append-only file. Values are written immediately; the map
//! itself becomes durable when [`OffsetIndex::flush`] appends fragments
//! describing what changed.
//!
//! ## Visibility
//!
//! Every read names a catalog version and resolves the key through three
//! layers, stopping at the first hit:
//!
//! 1. pending (non-flushed) writes of versions up to the requested one
//! 2. history recorded by later flushes, when the version is older than
//!    the last flush
//! 3. the shared map, ignoring entries produced by newer versions
//!
//! ## Write Versions
//!
//! - A put or remove may not use a version older than a pending one
//! - Once a flush closed a version greater than zero, writes must use a
//!   greater version; version zero is a warm-up generation and may repeat
//! - A flush must cover every pending version
//!
//! ## Lifecycle
//!
//! `Operative -> ShuttingDown -> Closed`. [`OffsetIndex::close`] runs once:
//! it stops new read handles, waits for borrowed ones (force-closing
//! stragglers after `wait_on_close`), flushes pending writes and releases
//! the write handle.

use crate::config::StorageOptions;
use crate::descriptor::OffsetIndexDescriptor;
use crate::error::{CoreError, CoreResult};
use crate::part::{RecordTypeRegistry, StoragePart};
use crate::pool::{Pool, Pooled};
use crate::record::{self, RecordFormat, RecordSink, StorageRecord, StreamSink};
use crate::serialization::{self, CollectingIndexBuilder, CopyProgress, FilteringIndexBuilder};
use crate::shared::SharedIndex;
use crate::stats::{IndexStats, OffsetIndexStatistics};
use crate::types::{FileLocation, RecordKey, VersionedValue};
use crate::volatile::{merge_for_flush, VolatileValues};
use offsetdb_codec::{CodecFactory, KeyCompressor, PayloadCodec, ReadOnlyKeyCompressor};
use offsetdb_storage::{
    FileBackend, HandleCloser, ReadOnlyHandle, StorageBackend, StorageError, StorageReader,
    WriteOnlyHandle,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

const OPERATIVE: u8 = 0;
const SHUTTING_DOWN: u8 = 1;
const CLOSED: u8 = 2;

/// Lifecycle state of an [`OffsetIndex`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    /// Accepting reads and writes.
    Operative,
    /// `close` is in progress.
    ShuttingDown,
    /// Closed; every operation fails.
    Closed,
}

impl IndexState {
    fn from_u8(value: u8) -> Self {
        match value {
            OPERATIVE => Self::Operative,
            SHUTTING_DOWN => Self::ShuttingDown,
            _ => Self::Closed,
        }
    }
}

#[derive(Debug, Default)]
struct WriterState {
    last_pending: Option<u64>,
    last_closed: Option<u64>,
}

impl WriterState {
    fn check(&self, version: u64) -> CoreResult<()> {
        if let Some(pending) = self.last_pending {
            if version < pending {
                return Err(CoreError::invalid_operation(format!(
                    "version {version} is older than pending version {pending}"
                )));
            }
        }
        if let Some(closed) = self.last_closed {
            if closed > 0 && version <= closed {
                return Err(CoreError::invalid_operation(format!(
                    "version {version} was already closed by a flush of version {closed}"
                )));
            }
        }
        Ok(())
    }
}

struct WriteCodec<P> {
    key_count: usize,
    codec: Box<dyn PayloadCodec<P>>,
}

fn active_share(live_bytes: u64, file_size: u64) -> f64 {
    if file_size == 0 {
        1.0
    } else {
        (live_bytes as f64 / file_size as f64).min(1.0)
    }
}

/// An append-only, versioned key-to-location index over one file.
pub struct OffsetIndex<P: StoragePart> {
    name: String,
    options: StorageOptions,
    format: RecordFormat,
    registry: RecordTypeRegistry,
    state: AtomicU8,
    write_handle: WriteOnlyHandle,
    read_handles: Pool<ReadOnlyHandle>,
    closers: Mutex<HashMap<u64, HandleCloser>>,
    codec_factory: Arc<dyn CodecFactory<P>>,
    codecs: Pool<Box<dyn PayloadCodec<P>>>,
    write_codec: Mutex<WriteCodec<P>>,
    key_compressor: Arc<KeyCompressor>,
    read_keys: RwLock<Arc<ReadOnlyKeyCompressor>>,
    descriptor: RwLock<Arc<OffsetIndexDescriptor<P>>>,
    shared: RwLock<Arc<SharedIndex>>,
    volatile: VolatileValues,
    writer: Mutex<WriterState>,
    stats: IndexStats,
}

impl<P: StoragePart> fmt::Debug for OffsetIndex<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OffsetIndex")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("descriptor", &self.descriptor.read().version)
            .field("live", &self.shared.read().count())
            .field("pending", &self.volatile.pending_versions())
            .finish()
    }
}

impl<P: StoragePart> OffsetIndex<P> {
    /// Opens an index over `backend`, replaying the fragment chain the
    /// descriptor points at.
    ///
    /// Bytes written after the descriptor's tail belong to writes that were
    /// never flushed and are discarded.
    ///
    /// # Errors
    ///
    /// Returns an error if the options are invalid, the chain is corrupted
    /// or the descriptor does not match the file.
    pub fn open(
        name: impl Into<String>,
        mut backend: Box<dyn StorageBackend>,
        descriptor: OffsetIndexDescriptor<P>,
        registry: RecordTypeRegistry,
        options: StorageOptions,
    ) -> CoreResult<Self> {
        options.validate()?;
        let name = name.into();
        let size = backend.size()?;

        let mut builder = CollectingIndexBuilder::new();
        let fragments = match descriptor.file_location {
            Some(tail) => {
                if tail.end() > size {
                    return Err(CoreError::corrupted(
                        "descriptor tail lies beyond the end of the file",
                        tail.start,
                        size as i64,
                        tail.end() as i64,
                    ));
                }
                let reader = backend.reader()?;
                let fragments = serialization::deserialize(
                    reader.as_ref(),
                    Some(tail),
                    &mut builder,
                    options.compute_crc32c,
                )?;
                if tail.end() < size {
                    tracing::warn!(
                        index = %name,
                        trailing = size - tail.end(),
                        "discarding bytes written after the last flush"
                    );
                    backend.truncate(tail.end())?;
                }
                fragments
            }
            None if size > 0 => {
                return Err(CoreError::invalid_operation(format!(
                    "{name} holds {size} bytes but the descriptor has no fragment tail"
                )));
            }
            None => 0,
        };

        let flushed_version = descriptor.file_location.map(|_| descriptor.catalog_version);
        let shared = SharedIndex::from_builder(builder, flushed_version);
        let write_handle = WriteOnlyHandle::new(
            name.clone(),
            backend,
            options.output_buffer_size,
            options.lock_timeout,
        )?;

        let key_compressor = Arc::new(KeyCompressor::from_keys(descriptor.compressed_keys.clone()));
        let read_keys = key_compressor.read_only();
        let codec_factory = Arc::clone(&descriptor.codec_factory);
        let write_codec = WriteCodec {
            key_count: key_compressor.len(),
            codec: codec_factory.create(Arc::clone(&read_keys)),
        };

        tracing::info!(
            index = %name,
            fragments,
            live = shared.count(),
            size = write_handle.last_written_position(),
            "offset index opened"
        );

        Ok(Self {
            name,
            format: RecordFormat::from_options(&options),
            read_handles: Pool::new("read handles", Some(options.max_opened_read_handles)),
            options,
            registry,
            state: AtomicU8::new(OPERATIVE),
            write_handle,
            closers: Mutex::new(HashMap::new()),
            codec_factory,
            codecs: Pool::new("codecs", None),
            write_codec: Mutex::new(write_codec),
            key_compressor,
            read_keys: RwLock::new(read_keys),
            descriptor: RwLock::new(Arc::new(descriptor)),
            shared: RwLock::new(Arc::new(shared)),
            volatile: VolatileValues::new(),
            writer: Mutex::new(WriterState {
                last_pending: None,
                last_closed: flushed_version,
            }),
            stats: IndexStats::new(),
        })
    }

    /// Creates an empty index over `backend`.
    ///
    /// # Errors
    ///
    /// Returns an error if the options are invalid or the backend is not empty.
    pub fn create(
        name: impl Into<String>,
        backend: Box<dyn StorageBackend>,
        codec_factory: Arc<dyn CodecFactory<P>>,
        registry: RecordTypeRegistry,
        options: StorageOptions,
    ) -> CoreResult<Self> {
        Self::open(
            name,
            backend,
            OffsetIndexDescriptor::empty(codec_factory),
            registry,
            options,
        )
    }

    /// Opens an index stored in the file at `path`.
    ///
    /// # Errors
    ///
    /// See [`OffsetIndex::open`].
    pub fn open_file(
        path: &Path,
        descriptor: OffsetIndexDescriptor<P>,
        registry: RecordTypeRegistry,
        options: StorageOptions,
    ) -> CoreResult<Self> {
        let backend = FileBackend::open(path)?;
        Self::open(
            path.display().to_string(),
            Box::new(backend),
            descriptor,
            registry,
            options,
        )
    }

    /// Name of the underlying store.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The options the index was opened with.
    #[must_use]
    pub fn options(&self) -> &StorageOptions {
        &self.options
    }

    /// The record kinds accepted by [`OffsetIndex::put`].
    #[must_use]
    pub fn registry(&self) -> &RecordTypeRegistry {
        &self.registry
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> IndexState {
        IndexState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Operation counters.
    #[must_use]
    pub fn stats(&self) -> &IndexStats {
        &self.stats
    }

    /// Descriptor of the last flush. Still available after close.
    #[must_use]
    pub fn descriptor(&self) -> OffsetIndexDescriptor<P> {
        OffsetIndexDescriptor::clone(&self.descriptor.read())
    }

    /// Highest version with pending writes, or the last flushed version.
    #[must_use]
    pub fn latest_version(&self) -> u64 {
        self.volatile
            .max_pending_version()
            .max(self.shared_snapshot().flushed_version)
            .unwrap_or(0)
    }

    fn ensure_operative(&self) -> CoreResult<()> {
        match self.state() {
            IndexState::Operative => Ok(()),
            IndexState::ShuttingDown => Err(CoreError::invalid_operation(format!(
                "{} is shutting down",
                self.name
            ))),
            IndexState::Closed => Err(CoreError::IndexClosed),
        }
    }

    fn shared_snapshot(&self) -> Arc<SharedIndex> {
        Arc::clone(&self.shared.read())
    }

    fn resolve(&self, version: u64, key: RecordKey) -> Option<VersionedValue> {
        if let Some(value) = self.volatile.get_non_flushed(version, key) {
            return (!value.is_removal()).then_some(value);
        }
        let shared = self.shared_snapshot();
        if shared.is_historical(version) {
            if let Some(past) = self.volatile.get_historical(version, key) {
                return past.value;
            }
        }
        shared.get(version, key)
    }

    fn open_read_handle(&self) -> CoreResult<ReadOnlyHandle> {
        let handle = self.write_handle.to_read_only_handle()?;
        self.closers.lock().insert(handle.id(), handle.closer());
        Ok(handle)
    }

    fn read_handle(&self) -> CoreResult<Pooled<'_, ReadOnlyHandle>> {
        self.read_handles.acquire(|| self.open_read_handle())
    }

    fn read_record(&self, location: FileLocation) -> CoreResult<StorageRecord> {
        let handle = self.read_handle()?;
        let verify_crc = self.options.compute_crc32c;
        handle.execute(|reader| record::read(reader, location, verify_crc))
    }

    fn refresh_codecs(&self) {
        let current = self.key_compressor.len();
        let mut keys = self.read_keys.write();
        if keys.len() != current {
            *keys = self.key_compressor.read_only();
            self.codecs.expire();
            tracing::debug!(index = %self.name, keys = current, "codec pool expired");
        }
    }

    fn codec(&self) -> CoreResult<Pooled<'_, Box<dyn PayloadCodec<P>>>> {
        if self.key_compressor.len() != self.read_keys.read().len() {
            self.refresh_codecs();
        }
        self.codecs.acquire(|| {
            let keys = Arc::clone(&*self.read_keys.read());
            Ok(self.codec_factory.create(keys))
        })
    }

    fn decode(&self, record_type: i8, payload: &[u8]) -> CoreResult<P> {
        let mut codec = self.codec()?;
        Ok(codec.decode(payload, record_type)?)
    }

    fn encode_for_write(&self, value: &P) -> CoreResult<Vec<u8>> {
        let mut write_codec = self.write_codec.lock();
        let key_count = self.key_compressor.len();
        if write_codec.key_count != key_count {
            write_codec.codec = self.codec_factory.create(self.key_compressor.read_only());
            write_codec.key_count = key_count;
        }
        Ok(write_codec.codec.encode(value)?)
    }

    fn soft_flush_if_needed(&self, location: FileLocation) -> CoreResult<bool> {
        if location.end() <= self.write_handle.last_synced_position() {
            return Ok(false);
        }
        let synced = self.write_handle.sync("Soft flush")?;
        self.stats.record_soft_flush();
        if self.key_compressor.is_dirty() {
            self.refresh_codecs();
        }
        tracing::debug!(index = %self.name, %location, synced, "soft flush before read");
        Ok(true)
    }

    fn read_value(&self, key: RecordKey, location: FileLocation) -> CoreResult<Vec<u8>> {
        let soft_flushed = self.soft_flush_if_needed(location)?;
        match self.read_record(location) {
            Ok(stored) => {
                self.stats.record_read(u64::from(location.length));
                Ok(stored.payload)
            }
            Err(err) if soft_flushed && !err.is_retryable() => Err(CoreError::RecordNotYetWritten {
                record_type: key.record_type,
                primary_key: key.primary_key,
                source: Box::new(err),
            }),
            Err(err)
                if err.is_corruption()
                    || matches!(err, CoreError::Storage(StorageError::ReadPastEnd { .. })) =>
            {
                Err(CoreError::CorruptedKeyValueRecord {
                    record_type: key.record_type,
                    primary_key: key.primary_key,
                    source: Box::new(err),
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Reads the value of `key` as visible to `version`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CorruptedKeyValueRecord`] if the stored value
    /// cannot be read back, [`CoreError::RecordNotYetWritten`] if a read
    /// raced an incomplete write, or a pool or state error.
    pub fn get(&self, version: u64, key: RecordKey) -> CoreResult<Option<P>> {
        let key = key.normalized();
        let Some(payload) = self.get_binary(version, key)? else {
            return Ok(None);
        };
        self.decode(key.record_type, &payload)
            .map(Some)
            .map_err(|err| match err {
                CoreError::Codec(_) => CoreError::CorruptedKeyValueRecord {
                    record_type: key.record_type,
                    primary_key: key.primary_key,
                    source: Box::new(err),
                },
                other => other,
            })
    }

    /// Reads the payload bytes of `key` as visible to `version`.
    ///
    /// # Errors
    ///
    /// See [`OffsetIndex::get`].
    pub fn get_binary(&self, version: u64, key: RecordKey) -> CoreResult<Option<Vec<u8>>> {
        self.ensure_operative()?;
        let key = key.normalized();
        match self.resolve(version, key) {
            Some(value) => self.read_value(key, value.location).map(Some),
            None => Ok(None),
        }
    }

    /// Whether `key` is live for `version`. Nothing is read from the file.
    ///
    /// # Errors
    ///
    /// Fails if the index is not operative.
    pub fn contains(&self, version: u64, key: RecordKey) -> CoreResult<bool> {
        self.ensure_operative()?;
        Ok(self.resolve(version, key.normalized()).is_some())
    }

    /// Writes `value` under `version` and returns its primary key.
    ///
    /// The value is appended to the file right away and becomes part of the
    /// durable map with the next flush covering `version`.
    ///
    /// # Errors
    ///
    /// Returns an error if the record type is unknown, the version breaks
    /// the write order, encoding fails or the write lock times out.
    pub fn put(&self, version: u64, mut value: P) -> CoreResult<i64> {
        self.ensure_operative()?;
        let record_type = value.record_type();
        self.registry.ensure_known(record_type)?;
        let primary_key = match value.storage_part_pk() {
            Some(pk) => pk,
            None => value.compute_unique_part_id_and_set(&self.key_compressor),
        };
        let key = RecordKey::new(record_type, primary_key);
        let payload = self.encode_for_write(&value)?;
        let format = self.format;

        let mut writer = self.writer.lock();
        let location = self.write_handle.check_and_execute(
            "Writing value",
            || writer.check(version),
            |access| record::write(access, version, false, &payload, format),
        )?;
        let is_new = self.resolve(version, key).is_none();
        self.volatile.put_value(
            version,
            key,
            VersionedValue::new(primary_key, record_type, location),
            is_new,
        );
        writer.last_pending = Some(version);
        drop(writer);

        self.stats.record_write(u64::from(location.length));
        tracing::trace!(index = %self.name, %key, version, %location, "value written");
        Ok(primary_key)
    }

    /// Removes `key` as of `version`. Returns false if it was not live.
    ///
    /// Nothing is written until the next flush records the removal.
    ///
    /// # Errors
    ///
    /// Returns an error if the version breaks the write order or the write
    /// lock times out.
    pub fn remove(&self, version: u64, key: RecordKey) -> CoreResult<bool> {
        self.ensure_operative()?;
        let key = key.normalized();
        let mut writer = self.writer.lock();
        let removed = self.write_handle.check_and_execute(
            "Removing value",
            || writer.check(version),
            |_access| {
                Ok(match self.resolve(version, key) {
                    Some(prior) => {
                        self.volatile.remove_value(version, key, prior);
                        true
                    }
                    None => false,
                })
            },
        )?;
        if removed {
            writer.last_pending = Some(version);
            self.stats.record_removal();
            tracing::trace!(index = %self.name, %key, version, "value removed");
        }
        Ok(removed)
    }

    /// Makes every pending write durable under catalog version `version`.
    ///
    /// Returns the new descriptor; with nothing pending the current one is
    /// returned unchanged. Pending writes that cancel each other out still
    /// append an empty fragment, so the descriptor covers their bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if `version` is older than a pending version or
    /// writing the fragments fails.
    pub fn flush(&self, version: u64) -> CoreResult<OffsetIndexDescriptor<P>> {
        self.ensure_operative()?;
        let mut writer = self.writer.lock();
        self.flush_locked(&mut writer, version)
    }

    fn flush_locked(
        &self,
        writer: &mut WriterState,
        version: u64,
    ) -> CoreResult<OffsetIndexDescriptor<P>> {
        let sets = self.volatile.pending_sets();
        let Some(max_pending) = sets.last().map(|set| set.catalog_version()) else {
            return Ok(self.descriptor());
        };
        if version < max_pending {
            return Err(CoreError::invalid_operation(format!(
                "flush of version {version} does not cover pending version {max_pending}"
            )));
        }

        let shared = self.shared_snapshot();
        let entries = merge_for_flush(&sets, &shared);
        let previous = self.descriptor.read().file_location;
        let format = self.format;

        let (tail, synced, summary) = self.write_handle.check_and_execute_and_sync(
            "Flushing index",
            || Ok::<(), CoreError>(()),
            |access| serialization::serialize(access, &entries, previous, version, format),
            |tail, synced| {
                let (next, summary) = self.volatile.promote(&sets, &shared, version);
                *self.shared.write() = Arc::new(next);
                self.volatile.discard_pending(version);
                Ok((tail, synced, summary))
            },
        )?;

        if self.key_compressor.reset_dirty() {
            self.refresh_codecs();
        }

        let live = self.shared_snapshot();
        let current = Arc::clone(&self.descriptor.read());
        let next = OffsetIndexDescriptor {
            version: current.version + 1,
            catalog_version: version,
            file_location: Some(tail.location),
            compressed_keys: self.key_compressor.keys(),
            codec_factory: Arc::clone(&self.codec_factory),
            active_record_share: active_share(live.total_size, synced),
            file_size: synced,
        };
        *self.descriptor.write() = Arc::new(next.clone());

        writer.last_closed = Some(version);
        self.stats.record_flush(tail.written_bytes);
        tracing::debug!(
            index = %self.name,
            version,
            entries = entries.len(),
            inserted = summary.inserted,
            updated = summary.updated,
            removed = summary.removed,
            file_size = synced,
            "index flushed"
        );
        Ok(next)
    }

    /// Marks history of versions at or below `version` as no longer needed.
    ///
    /// The memory is reclaimed by the next flush. Reads of purged versions
    /// are not supported afterwards.
    ///
    /// # Errors
    ///
    /// Fails if the index is not operative.
    pub fn purge(&self, version: u64) -> CoreResult<()> {
        self.ensure_operative()?;
        self.volatile.purge(version);
        Ok(())
    }

    /// Number of live keys visible to `version`.
    ///
    /// # Errors
    ///
    /// Fails if the index is not operative.
    pub fn count(&self, version: u64) -> CoreResult<u64> {
        self.ensure_operative()?;
        let shared = self.shared_snapshot();
        let pending = self.volatile.pending_count_delta(version, None);
        let history = self
            .volatile
            .history_count_delta(version, shared.flushed_version, None);
        self.checked_count(shared.count() as i64 + pending - history, None)
    }

    /// Number of live keys of `record_type` visible to `version`.
    ///
    /// # Errors
    ///
    /// Fails if the index is not operative.
    pub fn count_of_type(&self, version: u64, record_type: i8) -> CoreResult<u64> {
        self.ensure_operative()?;
        let record_type = record_type.wrapping_abs();
        let shared = self.shared_snapshot();
        let pending = self.volatile.pending_count_delta(version, Some(record_type));
        let history =
            self.volatile
                .history_count_delta(version, shared.flushed_version, Some(record_type));
        let count = shared.count_of_type(record_type) as i64 + pending - history;
        self.checked_count(count, Some(record_type))
    }

    fn checked_count(&self, count: i64, record_type: Option<i8>) -> CoreResult<u64> {
        u64::try_from(count).map_err(|_| {
            tracing::error!(index = %self.name, count, record_type = ?record_type, "negative record count");
            CoreError::invalid_operation(format!(
                "record histogram of {} went negative ({count})",
                self.name
            ))
        })
    }

    /// Live values of the shared map, sorted by key.
    ///
    /// # Errors
    ///
    /// Fails if the index is not operative.
    pub fn entries(&self) -> CoreResult<Vec<VersionedValue>> {
        self.ensure_operative()?;
        let mut entries: Vec<VersionedValue> = self
            .shared_snapshot()
            .locations
            .iter()
            .map(|(key, stored)| {
                VersionedValue::new(key.primary_key, key.record_type, stored.location)
            })
            .collect();
        entries.sort_by_key(VersionedValue::key);
        Ok(entries)
    }

    /// Live keys of the shared map, sorted.
    ///
    /// # Errors
    ///
    /// Fails if the index is not operative.
    pub fn keys(&self) -> CoreResult<Vec<RecordKey>> {
        self.ensure_operative()?;
        let mut keys: Vec<RecordKey> = self.shared_snapshot().locations.keys().copied().collect();
        keys.sort();
        Ok(keys)
    }

    /// Locations of the live values of the shared map, in file order.
    ///
    /// # Errors
    ///
    /// Fails if the index is not operative.
    pub fn file_locations(&self) -> CoreResult<Vec<FileLocation>> {
        self.ensure_operative()?;
        let mut locations: Vec<FileLocation> = self
            .shared_snapshot()
            .locations
            .values()
            .map(|stored| stored.location)
            .collect();
        locations.sort_by_key(|location| location.start);
        Ok(locations)
    }

    /// Pending writes and removals with their versions.
    ///
    /// # Errors
    ///
    /// Fails if the index is not operative.
    pub fn non_flushed_entries(&self) -> CoreResult<Vec<(u64, VersionedValue)>> {
        self.ensure_operative()?;
        let mut entries = Vec::new();
        for set in self.volatile.pending_sets() {
            let mut values = set.values();
            values.sort_by_key(VersionedValue::key);
            entries.extend(values.into_iter().map(|value| (set.catalog_version(), value)));
        }
        Ok(entries)
    }

    /// Catalog versions whose flush history is retained.
    #[must_use]
    pub fn historical_versions(&self) -> Vec<u64> {
        self.volatile.historical_versions()
    }

    /// Catalog versions with pending writes.
    #[must_use]
    pub fn pending_versions(&self) -> Vec<u64> {
        self.volatile.pending_versions()
    }

    /// Decodes the value stored at `location`.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read or decoded.
    pub fn get_by_location(&self, location: FileLocation, record_type: i8) -> CoreResult<P> {
        let payload = self.get_binary_by_location(location)?;
        self.decode(record_type, &payload)
    }

    /// Reads the payload stored at `location`.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read.
    pub fn get_binary_by_location(&self, location: FileLocation) -> CoreResult<Vec<u8>> {
        self.ensure_operative()?;
        self.soft_flush_if_needed(location)?;
        let stored = self.read_record(location)?;
        self.stats.record_read(u64::from(location.length));
        Ok(stored.payload)
    }

    /// Runs `body` with a pooled codec.
    ///
    /// # Errors
    ///
    /// Fails if the index is not operative.
    pub fn execute_with_codec<R>(
        &self,
        body: impl FnOnce(&mut dyn PayloadCodec<P>) -> R,
    ) -> CoreResult<R> {
        self.ensure_operative()?;
        let mut codec = self.codec()?;
        Ok(body(&mut **codec))
    }

    /// The key compressor table.
    #[must_use]
    pub fn compressed_keys(&self) -> BTreeMap<i32, String> {
        self.key_compressor.keys()
    }

    /// A snapshot of the key compressor.
    #[must_use]
    pub fn read_only_key_compressor(&self) -> Arc<ReadOnlyKeyCompressor> {
        self.key_compressor.read_only()
    }

    /// Whether the file is large enough and sparse enough to be compacted.
    #[must_use]
    pub fn should_compact(&self) -> bool {
        let file_size = self.write_handle.last_written_position();
        if file_size < self.options.file_size_compaction_threshold {
            return false;
        }
        active_share(self.shared_snapshot().total_size, file_size)
            < self.options.min_active_record_share
    }

    /// Looks up a single key in a file without building the whole index.
    ///
    /// # Errors
    ///
    /// Returns an error if the chain or the record is corrupted.
    pub fn read_single_record(
        reader: &dyn StorageReader,
        descriptor: &OffsetIndexDescriptor<P>,
        key: RecordKey,
        verify_crc: bool,
    ) -> CoreResult<Option<P>> {
        let mut builder = FilteringIndexBuilder::new(key);
        serialization::deserialize(reader, descriptor.file_location, &mut builder, verify_crc)?;
        let Some(location) = builder.location() else {
            return Ok(None);
        };
        let stored = record::read(reader, location, verify_crc)?;
        let keys = Arc::new(ReadOnlyKeyCompressor::from_keys(
            descriptor.compressed_keys.clone(),
        ));
        let mut codec = descriptor.codec_factory.create(keys);
        Ok(Some(codec.decode(&stored.payload, key.normalized().record_type)?))
    }

    /// Scans the whole file, validating every record.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CorruptedRecord`] for the first violation found.
    pub fn verify_contents(&self) -> CoreResult<OffsetIndexStatistics> {
        self.ensure_operative()?;
        let size = self.write_handle.sync("Verifying contents")?;
        let verify_crc = self.options.compute_crc32c;
        let handle = self.read_handle()?;
        let file = handle.execute(|reader| serialization::verify(reader, size, verify_crc))?;
        let shared = self.shared_snapshot();
        Ok(OffsetIndexStatistics {
            living_record_count: shared.count(),
            living_record_size: shared.total_size,
            record_count: file.record_count,
            total_size: file.total_size,
            max_record_size: file.max_record_size,
        })
    }

    fn snapshot_values(&self, shared: &SharedIndex, version: u64) -> Vec<VersionedValue> {
        let mut values: HashMap<RecordKey, VersionedValue> = shared
            .locations
            .iter()
            .filter(|(_, stored)| stored.generation <= version)
            .map(|(key, stored)| {
                (
                    *key,
                    VersionedValue::new(key.primary_key, key.record_type, stored.location),
                )
            })
            .collect();
        self.volatile.rollback(version, &mut values);
        self.volatile.apply_pending(version, &mut values);
        values.into_values().collect()
    }

    fn copy_snapshot_into(
        &self,
        sink: &mut dyn RecordSink,
        progress: &mut dyn FnMut(CopyProgress),
        version: u64,
        overrides: Vec<P>,
    ) -> CoreResult<OffsetIndexDescriptor<P>> {
        let mut replacements = Vec::with_capacity(overrides.len());
        for mut part in overrides {
            let record_type = part.record_type();
            self.registry.ensure_known(record_type)?;
            let primary_key = match part.storage_part_pk() {
                Some(pk) => pk,
                None => part.compute_unique_part_id_and_set(&self.key_compressor),
            };
            replacements.push((
                RecordKey::new(record_type, primary_key),
                self.encode_for_write(&part)?,
            ));
        }

        let (live, stamp) = {
            let _writer = self.writer.lock();
            let shared = self.shared_snapshot();
            let live = self.snapshot_values(&shared, version);
            (live, version.max(shared.flushed_version.unwrap_or(0)))
        };
        if self.write_handle.last_written_position() > self.write_handle.last_synced_position() {
            self.write_handle.sync("Copying snapshot")?;
        }

        let handle = self.read_handle()?;
        let format = self.format;
        let copy = handle.execute(|reader| {
            serialization::copy_snapshot(
                reader,
                &mut *sink,
                &live,
                &replacements,
                stamp,
                format,
                &mut *progress,
            )
        })?;
        drop(handle);

        let file_size = sink.position();
        self.stats.record_compaction();
        tracing::info!(
            index = %self.name,
            version = stamp,
            records = copy.records,
            file_size,
            "snapshot copied"
        );
        Ok(OffsetIndexDescriptor {
            version: 1,
            catalog_version: stamp,
            file_location: Some(copy.tail.location),
            compressed_keys: self.key_compressor.keys(),
            codec_factory: Arc::clone(&self.codec_factory),
            active_record_share: active_share(copy.live_bytes, file_size),
            file_size,
        })
    }

    /// Writes a self-contained copy of the values visible to `version` to
    /// `out`, replacing the values of `overrides`.
    ///
    /// Returns the descriptor of the copy.
    ///
    /// # Errors
    ///
    /// Returns an error if a source record is corrupted or writing fails.
    pub fn copy_snapshot_to(
        &self,
        out: &mut dyn Write,
        progress: &mut dyn FnMut(CopyProgress),
        version: u64,
        overrides: Vec<P>,
    ) -> CoreResult<OffsetIndexDescriptor<P>> {
        self.ensure_operative()?;
        let descriptor = {
            let mut sink = StreamSink::new(&mut *out);
            self.copy_snapshot_into(&mut sink, progress, version, overrides)?
        };
        out.flush()?;
        Ok(descriptor)
    }

    /// Writes the latest state to a new file at `path`, which must not
    /// exist yet.
    ///
    /// Returns the descriptor for opening the new file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists or copying fails.
    pub fn compact(&self, path: &Path) -> CoreResult<OffsetIndexDescriptor<P>> {
        self.ensure_operative()?;
        let version = self.latest_version();
        let backend = FileBackend::create_new(path)?;
        let target = WriteOnlyHandle::new(
            path.display().to_string(),
            Box::new(backend),
            self.options.output_buffer_size,
            self.options.lock_timeout,
        )?;
        let descriptor = target.check_and_execute_and_sync(
            "Compacting index",
            || Ok::<(), CoreError>(()),
            |access| {
                self.copy_snapshot_into(access, &mut |_: CopyProgress| {}, version, Vec::new())
            },
            |descriptor, synced| {
                Ok(OffsetIndexDescriptor {
                    file_size: synced,
                    ..descriptor
                })
            },
        )?;
        target.close()?;
        tracing::info!(
            index = %self.name,
            target = %path.display(),
            version,
            file_size = descriptor.file_size,
            "index compacted"
        );
        Ok(descriptor)
    }

    /// Closes the index, flushing pending writes.
    ///
    /// Returns the tail of the fragment chain.
    ///
    /// # Errors
    ///
    /// Fails if the index is already closing or closed, or the final flush
    /// fails. The index is closed either way.
    pub fn close(&self) -> CoreResult<Option<FileLocation>> {
        if self
            .state
            .compare_exchange(OPERATIVE, SHUTTING_DOWN, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CoreError::invalid_operation(format!(
                "{} is already closing or closed",
                self.name
            )));
        }

        let outstanding = self.read_handles.close(self.options.wait_on_close);
        if outstanding > 0 {
            tracing::warn!(index = %self.name, outstanding, "force-closing read handles still in use");
            for closer in self.closers.lock().values() {
                closer.close();
            }
        }
        self.closers.lock().clear();
        self.codecs.close(Duration::ZERO);

        let result = self.finish_close();
        self.state.store(CLOSED, Ordering::Release);
        match &result {
            Ok(tail) => tracing::info!(index = %self.name, tail = ?tail, "offset index closed"),
            Err(err) => tracing::error!(index = %self.name, error = %err, "offset index closed with error"),
        }
        result
    }

    fn finish_close(&self) -> CoreResult<Option<FileLocation>> {
        let mut writer = self.writer.lock();
        if let Some(version) = self.volatile.max_pending_version() {
            self.flush_locked(&mut writer, version)?;
        }
        self.write_handle.close()?;
        Ok(self.descriptor.read().file_location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::part::{RawCodecFactory, RawStoragePart};
    use offsetdb_storage::{InMemoryBackend, StorageResult};

    const A: RecordKey = RecordKey::new(1, 1);
    const B: RecordKey = RecordKey::new(2, 5);

    fn registry() -> RecordTypeRegistry {
        RecordTypeRegistry::new()
            .with(1, "alpha")
            .unwrap()
            .with(2, "beta")
            .unwrap()
    }

    fn empty() -> OffsetIndexDescriptor<RawStoragePart> {
        OffsetIndexDescriptor::empty(Arc::new(RawCodecFactory))
    }

    fn open(
        backend: &InMemoryBackend,
        descriptor: OffsetIndexDescriptor<RawStoragePart>,
    ) -> OffsetIndex<RawStoragePart> {
        OffsetIndex::open(
            "memory",
            Box::new(backend.clone()),
            descriptor,
            registry(),
            StorageOptions::temporary(),
        )
        .unwrap()
    }

    fn part(key: RecordKey, bytes: &[u8]) -> RawStoragePart {
        RawStoragePart::new(key.record_type, key.primary_key, bytes.to_vec())
    }

    fn read(index: &OffsetIndex<RawStoragePart>, version: u64, key: RecordKey) -> Option<Vec<u8>> {
        index.get_binary(version, key).unwrap()
    }

    fn two_versions(backend: &InMemoryBackend) -> OffsetIndex<RawStoragePart> {
        let index = open(backend, empty());
        index.put(1, part(A, b"a")).unwrap();
        index.flush(1).unwrap();
        index.put(2, part(A, b"b")).unwrap();
        index.flush(2).unwrap();
        index
    }

    #[test]
    fn each_version_sees_its_own_value() {
        let backend = InMemoryBackend::new();
        let index = two_versions(&backend);

        assert_eq!(read(&index, 1, A), Some(b"a".to_vec()));
        assert_eq!(read(&index, 2, A), Some(b"b".to_vec()));
        assert_eq!(read(&index, 0, A), None);
        assert_eq!(index.get(2, A).unwrap().unwrap().bytes, b"b");
        assert_eq!(index.historical_versions(), vec![1, 2]);
    }

    #[test]
    fn non_flushed_value_is_read_through_soft_flush() {
        let backend = InMemoryBackend::new();
        let index = open(&backend, empty());
        index.put(1, part(A, b"a")).unwrap();

        assert!(backend.data().is_empty());
        assert_eq!(read(&index, 1, A), Some(b"a".to_vec()));
        assert_eq!(index.stats().soft_flushes(), 1);
        assert_eq!(index.pending_versions(), vec![1]);

        // already synced, no second soft flush
        assert_eq!(read(&index, 1, A), Some(b"a".to_vec()));
        assert_eq!(index.stats().soft_flushes(), 1);
    }

    #[test]
    fn put_and_remove_in_one_version_leave_no_trace() {
        let backend = InMemoryBackend::new();
        let index = open(&backend, empty());

        index.put(3, part(B, b"b")).unwrap();
        assert!(index.contains(3, B).unwrap());
        assert_eq!(index.count_of_type(3, 2).unwrap(), 1);
        assert!(index.remove(3, B).unwrap());

        assert_eq!(read(&index, 3, B), None);
        assert_eq!(index.count_of_type(3, 2).unwrap(), 0);

        let descriptor = index.flush(3).unwrap();
        // an empty root fragment covers the orphaned payload
        let tail = descriptor.file_location.unwrap();
        assert_eq!(tail.end(), descriptor.file_size);
        assert_eq!(descriptor.catalog_version, 3);
        assert_eq!(read(&index, 3, B), None);
        assert_eq!(index.count_of_type(3, 2).unwrap(), 0);
        assert!(index.entries().unwrap().is_empty());
    }

    #[test]
    fn cancelled_out_flush_can_be_reopened() {
        let backend = InMemoryBackend::new();
        let index = open(&backend, empty());
        index.put(3, part(B, b"b")).unwrap();
        assert!(index.remove(3, B).unwrap());
        index.flush(3).unwrap();
        index.close().unwrap();

        let descriptor = index.descriptor();
        assert_eq!(descriptor.file_size, backend.data().len() as u64);
        let reopened = open(&backend, descriptor);
        assert_eq!(read(&reopened, 3, B), None);
        assert_eq!(reopened.count(3).unwrap(), 0);
        assert_eq!(reopened.verify_contents().unwrap().record_count, 2);

        // writes continue after the closed version
        assert!(reopened.put(3, part(B, b"c")).is_err());
        reopened.put(4, part(B, b"c")).unwrap();
        reopened.flush(4).unwrap();
        assert_eq!(read(&reopened, 4, B), Some(b"c".to_vec()));
    }

    #[test]
    fn cancelled_out_flush_chains_to_previous_tail() {
        let backend = InMemoryBackend::new();
        let index = two_versions(&backend);
        let previous = index.descriptor();

        index.put(3, part(B, b"b")).unwrap();
        assert!(index.remove(3, B).unwrap());
        let descriptor = index.flush(3).unwrap();
        assert_eq!(descriptor.version, previous.version + 1);
        assert_ne!(descriptor.file_location, previous.file_location);
        index.close().unwrap();

        let reopened = open(&backend, index.descriptor());
        assert_eq!(read(&reopened, 3, A), Some(b"b".to_vec()));
        assert_eq!(read(&reopened, 3, B), None);
    }

    #[test]
    fn removing_a_missing_key_reports_false() {
        let backend = InMemoryBackend::new();
        let index = open(&backend, empty());
        assert!(!index.remove(1, B).unwrap());
        assert_eq!(index.stats().removals(), 0);
    }

    #[test]
    fn purge_drops_history_on_next_flush() {
        let backend = InMemoryBackend::new();
        let index = two_versions(&backend);

        index.purge(1).unwrap();
        assert_eq!(index.historical_versions(), vec![1, 2]);
        index.put(3, part(B, b"x")).unwrap();
        index.flush(3).unwrap();
        assert_eq!(index.historical_versions(), vec![2, 3]);

        index.purge(2).unwrap();
        index.put(4, part(B, b"y")).unwrap();
        index.flush(4).unwrap();
        assert_eq!(index.historical_versions(), vec![3, 4]);
        // the value version 1 saw is gone with its history
        assert_eq!(read(&index, 1, A), None);
        assert_eq!(read(&index, 4, A), Some(b"b".to_vec()));
    }

    #[test]
    fn snapshot_with_override() {
        let backend = InMemoryBackend::new();
        let index = two_versions(&backend);
        index.put(3, part(B, b"pending")).unwrap();

        let mut out = Vec::new();
        let mut seen = Vec::new();
        let descriptor = index
            .copy_snapshot_to(
                &mut out,
                &mut |p: CopyProgress| seen.push(p),
                2,
                vec![part(A, b"c")],
            )
            .unwrap();
        assert_eq!(seen.last(), Some(&CopyProgress { copied: 1, total: 1 }));
        assert_eq!(descriptor.file_size, out.len() as u64);
        assert_eq!(descriptor.catalog_version, 2);

        let copy = open(&InMemoryBackend::with_data(out), descriptor);
        assert_eq!(read(&copy, 0, A), Some(b"c".to_vec()));
        assert_eq!(read(&copy, 9, A), Some(b"c".to_vec()));
        // version 3 was not part of the snapshot
        assert_eq!(read(&copy, 9, B), None);
        copy.verify_contents().unwrap();
    }

    #[test]
    fn reopen_replays_flushed_state() {
        let backend = InMemoryBackend::new();
        let index = open(&backend, empty());
        index.put(1, part(A, b"a")).unwrap();
        index.put(1, part(B, b"b")).unwrap();
        index.flush(1).unwrap();
        index.remove(2, B).unwrap();
        index.put(2, part(RecordKey::new(2, 6), b"c")).unwrap();

        let tail = index.close().unwrap();
        let descriptor = index.descriptor();
        assert_eq!(descriptor.file_location, tail);
        assert_eq!(descriptor.catalog_version, 2);
        assert_eq!(descriptor.version, 2);

        let reopened = open(&backend, descriptor);
        assert_eq!(read(&reopened, 2, A), Some(b"a".to_vec()));
        assert_eq!(read(&reopened, 2, B), None);
        assert_eq!(read(&reopened, 2, RecordKey::new(2, 6)), Some(b"c".to_vec()));
        assert_eq!(reopened.count(2).unwrap(), 2);
        assert_eq!(reopened.keys().unwrap(), vec![A, RecordKey::new(2, 6)]);
    }

    #[test]
    fn unflushed_tail_is_discarded_on_reopen() {
        let backend = InMemoryBackend::new();
        let index = open(&backend, empty());
        index.put(1, part(A, b"a")).unwrap();
        let descriptor = index.flush(1).unwrap();
        index.put(2, part(A, b"lost")).unwrap();
        index.verify_contents().unwrap();
        let flushed_size = descriptor.file_size;
        assert!(backend.data().len() as u64 > flushed_size);
        drop(index);

        let reopened = open(&backend, descriptor);
        assert_eq!(backend.data().len() as u64, flushed_size);
        assert_eq!(read(&reopened, 2, A), Some(b"a".to_vec()));
    }

    #[test]
    fn write_versions_are_ordered() {
        let backend = InMemoryBackend::new();
        let index = open(&backend, empty());
        index.put(2, part(A, b"a")).unwrap();

        let older = index.put(1, part(B, b"b"));
        assert!(matches!(older, Err(CoreError::InvalidOperation { .. })));
        assert!(index.flush(1).is_err());

        index.flush(2).unwrap();
        assert!(index.put(2, part(B, b"b")).is_err());
        assert!(index.remove(2, A).is_err());
        index.put(3, part(B, b"b")).unwrap();
    }

    #[test]
    fn warm_up_generation_may_repeat() {
        let backend = InMemoryBackend::new();
        let index = open(&backend, empty());
        index.put(0, part(A, b"a")).unwrap();
        index.flush(0).unwrap();
        index.put(0, part(A, b"b")).unwrap();
        index.flush(0).unwrap();
        assert_eq!(read(&index, 0, A), Some(b"b".to_vec()));
        index.verify_contents().unwrap();
    }

    #[test]
    fn counts_follow_versions() {
        let backend = InMemoryBackend::new();
        let index = open(&backend, empty());
        index.put(1, part(A, b"a")).unwrap();
        index.put(1, part(B, b"b")).unwrap();
        index.flush(1).unwrap();
        index.remove(2, A).unwrap();

        assert_eq!(index.count(1).unwrap(), 2);
        assert_eq!(index.count(2).unwrap(), 1);

        index.flush(2).unwrap();
        assert_eq!(index.count(1).unwrap(), 2);
        assert_eq!(index.count(2).unwrap(), 1);
        assert_eq!(index.count_of_type(1, 1).unwrap(), 1);
        assert_eq!(index.count_of_type(2, 1).unwrap(), 0);
        assert_eq!(index.count_of_type(2, -2).unwrap(), 1);
    }

    #[test]
    fn verify_contents_reports_statistics() {
        let backend = InMemoryBackend::new();
        let index = two_versions(&backend);
        let stats = index.verify_contents().unwrap();

        assert_eq!(stats.record_count, 4);
        assert_eq!(stats.living_record_count, 1);
        assert_eq!(stats.total_size, backend.data().len() as u64);
        assert!(stats.living_object_share() < 1.0);
    }

    #[test]
    fn corrupted_value_is_reported_with_its_key() {
        let backend = InMemoryBackend::new();
        let index = two_versions(&backend);
        // first payload byte of the value written at version 1
        backend.corrupt_byte(record::HEADER_SIZE as u64);

        let err = index.get_binary(1, A).unwrap_err();
        assert!(matches!(
            err,
            CoreError::CorruptedKeyValueRecord {
                record_type: 1,
                primary_key: 1,
                ..
            }
        ));
        assert!(index.verify_contents().unwrap_err().is_corruption());
        assert_eq!(read(&index, 2, A), Some(b"b".to_vec()));
    }

    /// Backend whose readers only see the bytes present when they were opened.
    struct FrozenReaders(InMemoryBackend);

    struct FrozenReader(Vec<u8>);

    impl StorageReader for FrozenReader {
        fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
            let size = self.0.len() as u64;
            let end = offset.saturating_add(len as u64);
            if end > size {
                return Err(StorageError::ReadPastEnd { offset, len, size });
            }
            Ok(self.0[offset as usize..end as usize].to_vec())
        }

        fn size(&self) -> StorageResult<u64> {
            Ok(self.0.len() as u64)
        }
    }

    impl StorageBackend for FrozenReaders {
        fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
            self.0.read_at(offset, len)
        }

        fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
            self.0.append(data)
        }

        fn flush(&mut self) -> StorageResult<()> {
            self.0.flush()
        }

        fn size(&self) -> StorageResult<u64> {
            self.0.size()
        }

        fn sync(&mut self) -> StorageResult<()> {
            self.0.sync()
        }

        fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
            self.0.truncate(new_size)
        }

        fn reader(&self) -> StorageResult<Box<dyn StorageReader>> {
            Ok(Box::new(FrozenReader(self.0.data())))
        }

        fn describe(&self) -> String {
            "frozen".to_string()
        }
    }

    #[test]
    fn read_failing_after_soft_flush_is_not_yet_written() {
        let index = OffsetIndex::open(
            "frozen",
            Box::new(FrozenReaders(InMemoryBackend::new())),
            empty(),
            registry(),
            StorageOptions::temporary(),
        )
        .unwrap();
        index.put(1, part(A, b"a")).unwrap();
        index.flush(1).unwrap();
        // opens the pooled reader over the flushed bytes
        assert_eq!(read(&index, 1, A), Some(b"a".to_vec()));

        index.put(2, part(B, b"b")).unwrap();
        let err = index.get_binary(2, B).unwrap_err();
        assert!(matches!(
            err,
            CoreError::RecordNotYetWritten {
                record_type: 2,
                primary_key: 5,
                ..
            }
        ));
        assert!(!err.is_corruption());
        assert_eq!(index.stats().soft_flushes(), 1);

        // already synced, so the same failure now reads as corruption
        let err = index.get_binary(2, B).unwrap_err();
        assert!(matches!(
            err,
            CoreError::CorruptedKeyValueRecord {
                record_type: 2,
                primary_key: 5,
                ..
            }
        ));
    }

    #[test]
    fn close_force_closes_borrowed_read_handles() {
        let backend = InMemoryBackend::new();
        let index = OffsetIndex::open(
            "memory",
            Box::new(backend.clone()),
            empty(),
            registry(),
            StorageOptions::temporary().wait_on_close(Duration::ZERO),
        )
        .unwrap();
        index.put(1, part(A, b"a")).unwrap();

        let handle = index.read_handle().unwrap();
        assert!(!handle.is_closed());
        index.close().unwrap();

        assert!(handle.is_closed());
        let err = handle
            .execute(|reader| reader.size().map_err(CoreError::from))
            .unwrap_err();
        assert!(matches!(err, CoreError::Storage(StorageError::Closed)));
        drop(handle);

        assert_eq!(index.state(), IndexState::Closed);
        assert!(index.read_handle().is_err());
        // pending write was flushed on close
        let reopened = open(&backend, index.descriptor());
        assert_eq!(read(&reopened, 1, A), Some(b"a".to_vec()));
    }

    #[test]
    fn close_waits_for_returned_read_handles() {
        let backend = InMemoryBackend::new();
        let index = open(&backend, empty());
        let handle = index.read_handle().unwrap();
        drop(handle);
        assert_eq!(index.read_handles.idle(), 1);

        index.close().unwrap();
        assert_eq!(index.read_handles.borrowed(), 0);
        assert_eq!(index.read_handles.idle(), 0);
        assert!(index.closers.lock().is_empty());
    }

    #[test]
    fn negative_histogram_is_reported() {
        let backend = InMemoryBackend::new();
        let index = open(&backend, empty());
        index.put(1, part(A, b"a")).unwrap();
        index.flush(1).unwrap();
        assert_eq!(index.count(0).unwrap(), 0);

        // a published map that lost the key the history still accounts for
        *index.shared.write() = Arc::new(SharedIndex {
            flushed_version: Some(1),
            ..SharedIndex::default()
        });

        assert!(matches!(
            index.count(0),
            Err(CoreError::InvalidOperation { .. })
        ));
        assert!(matches!(
            index.count_of_type(0, 1),
            Err(CoreError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn unknown_record_type_is_rejected() {
        let backend = InMemoryBackend::new();
        let index = open(&backend, empty());
        let result = index.put(1, part(RecordKey::new(7, 1), b"x"));
        assert!(matches!(result, Err(CoreError::UnknownRecordType { id: 7 })));
    }

    #[test]
    fn closed_index_rejects_operations() {
        let backend = InMemoryBackend::new();
        let index = open(&backend, empty());
        index.put(1, part(A, b"a")).unwrap();
        assert!(index.close().unwrap().is_some());

        assert_eq!(index.state(), IndexState::Closed);
        assert!(matches!(index.get(1, A), Err(CoreError::IndexClosed)));
        assert!(matches!(index.put(2, part(A, b"b")), Err(CoreError::IndexClosed)));
        assert!(matches!(index.close(), Err(CoreError::InvalidOperation { .. })));
    }

    #[test]
    fn location_reads_and_enumeration() {
        let backend = InMemoryBackend::new();
        let index = open(&backend, empty());
        index.put(1, part(B, b"second")).unwrap();
        index.put(1, part(A, b"first")).unwrap();
        assert_eq!(index.non_flushed_entries().unwrap().len(), 2);
        index.flush(1).unwrap();

        let entries = index.entries().unwrap();
        assert_eq!(entries.iter().map(VersionedValue::key).collect::<Vec<_>>(), vec![A, B]);
        let locations = index.file_locations().unwrap();
        assert_eq!(locations[0].start, 0);

        let first = index.get_by_location(locations[0], 2).unwrap();
        assert_eq!(first.bytes, b"second");
        assert_eq!(index.get_binary_by_location(locations[1]).unwrap(), b"first");
        assert!(index.non_flushed_entries().unwrap().is_empty());

        let encoded = index
            .execute_with_codec(|codec| codec.encode(&part(A, b"raw")))
            .unwrap()
            .unwrap();
        assert_eq!(encoded, b"raw");
    }

    #[test]
    fn single_record_lookup_uses_the_chain() {
        let backend = InMemoryBackend::new();
        let index = two_versions(&backend);
        index.put(3, part(B, b"b")).unwrap();
        let descriptor = index.flush(3).unwrap();

        let reader = backend.reader().unwrap();
        let found = OffsetIndex::read_single_record(reader.as_ref(), &descriptor, A, true)
            .unwrap()
            .unwrap();
        assert_eq!(found.bytes, b"b");
        let missing =
            OffsetIndex::read_single_record(reader.as_ref(), &descriptor, RecordKey::new(1, 99), true)
                .unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn compaction_writes_only_live_records() {
        let dir = tempfile::tempdir().unwrap();
        let backend = InMemoryBackend::new();
        let index = two_versions(&backend);
        for version in 3..8 {
            index.put(version, part(B, b"overwritten again")).unwrap();
            index.flush(version).unwrap();
        }

        let path = dir.path().join("compacted.odb");
        let descriptor = index.compact(&path).unwrap();
        assert!(descriptor.file_size < backend.data().len() as u64);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), descriptor.file_size);

        let compacted =
            OffsetIndex::open_file(&path, descriptor, registry(), StorageOptions::temporary())
                .unwrap();
        assert_eq!(read(&compacted, 7, A), Some(b"b".to_vec()));
        assert_eq!(read(&compacted, 7, B), Some(b"overwritten again".to_vec()));
        assert_eq!(compacted.verify_contents().unwrap().record_count, 3);
        assert!(index.compact(&path).is_err());
    }

    #[test]
    fn compaction_advisory_follows_thresholds() {
        let backend = InMemoryBackend::new();
        let options = StorageOptions::temporary()
            .file_size_compaction_threshold(0)
            .min_active_record_share(0.9);
        let index = OffsetIndex::open(
            "memory",
            Box::new(backend.clone()),
            empty(),
            registry(),
            options,
        )
        .unwrap();
        assert!(!index.should_compact());

        for version in 1..5 {
            index.put(version, part(A, b"value")).unwrap();
            index.flush(version).unwrap();
        }
        assert!(index.should_compact());
    }
}
