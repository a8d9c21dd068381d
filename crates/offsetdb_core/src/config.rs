//! Storage options.

use crate::error::{CoreError, CoreResult};
use crate::serialization::max_records_per_fragment;
use std::time::Duration;

/// Options governing how an offset index writes and reads its file.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageOptions {
    /// Size of the write buffer, which is also the largest physical record.
    /// Larger values are split into continuation records.
    pub output_buffer_size: usize,

    /// Whether payloads are compressed before being written.
    pub compress: bool,

    /// Whether a CRC32C checksum is written and verified for every record.
    pub compute_crc32c: bool,

    /// Upper bound of simultaneously opened read handles.
    pub max_opened_read_handles: usize,

    /// How long `close` waits for borrowed read handles to be returned.
    pub wait_on_close: Duration,

    /// How long to wait for the exclusive write lock.
    pub lock_timeout: Duration,

    /// Compaction is advised once the living share drops below this ratio.
    pub min_active_record_share: f64,

    /// Compaction is only advised for files at least this large.
    pub file_size_compaction_threshold: u64,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            output_buffer_size: 2 * 1024 * 1024, // 2 MiB
            compress: false,
            compute_crc32c: true,
            max_opened_read_handles: 12,
            wait_on_close: Duration::from_secs(5),
            lock_timeout: Duration::from_secs(5),
            min_active_record_share: 0.5,
            file_size_compaction_threshold: 100 * 1024 * 1024, // 100 MiB
        }
    }
}

impl StorageOptions {
    /// Creates options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Small buffers and short timeouts, for tests.
    #[must_use]
    pub fn temporary() -> Self {
        Self::default()
            .output_buffer_size(16 * 1024)
            .max_opened_read_handles(4)
            .wait_on_close(Duration::from_millis(200))
            .lock_timeout(Duration::from_millis(500))
    }

    /// Sets the output buffer size.
    #[must_use]
    pub const fn output_buffer_size(mut self, size: usize) -> Self {
        self.output_buffer_size = size;
        self
    }

    /// Sets whether payloads are compressed.
    #[must_use]
    pub const fn compress(mut self, value: bool) -> Self {
        self.compress = value;
        self
    }

    /// Sets whether CRC32C checksums are computed.
    #[must_use]
    pub const fn compute_crc32c(mut self, value: bool) -> Self {
        self.compute_crc32c = value;
        self
    }

    /// Sets the read handle bound.
    #[must_use]
    pub const fn max_opened_read_handles(mut self, count: usize) -> Self {
        self.max_opened_read_handles = count;
        self
    }

    /// Sets how long close waits for read handles.
    #[must_use]
    pub const fn wait_on_close(mut self, timeout: Duration) -> Self {
        self.wait_on_close = timeout;
        self
    }

    /// Sets the write lock timeout.
    #[must_use]
    pub const fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets the minimal living share before compaction is advised.
    #[must_use]
    pub const fn min_active_record_share(mut self, share: f64) -> Self {
        self.min_active_record_share = share;
        self
    }

    /// Sets the file size below which compaction is never advised.
    #[must_use]
    pub const fn file_size_compaction_threshold(mut self, size: u64) -> Self {
        self.file_size_compaction_threshold = size;
        self
    }

    /// Checks the options for consistency.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfiguration`] if the buffer cannot hold
    /// a fragment with at least one entry, exceeds the record length field,
    /// or no read handle may be opened.
    pub fn validate(&self) -> CoreResult<()> {
        if max_records_per_fragment(self.output_buffer_size) == 0 {
            return Err(CoreError::invalid_configuration(format!(
                "output buffer of {} bytes cannot hold a single fragment entry",
                self.output_buffer_size
            )));
        }
        if self.output_buffer_size > i32::MAX as usize {
            return Err(CoreError::invalid_configuration(format!(
                "output buffer of {} bytes exceeds the record length limit",
                self.output_buffer_size
            )));
        }
        if self.max_opened_read_handles == 0 {
            return Err(CoreError::invalid_configuration(
                "at least one read handle must be allowed",
            ));
        }
        if !(0.0..=1.0).contains(&self.min_active_record_share) {
            return Err(CoreError::invalid_configuration(format!(
                "active record share {} is not a ratio",
                self.min_active_record_share
            )));
        }
        Ok(())
    }
}
