//! Compact command implementation.
//!
//! The source file is only read: the live records reachable from its
//! descriptor are copied into a fresh file followed by fragments that
//! describe only them, and a matching descriptor is written next to it.

use super::{format_size, load_descriptor, open_reader, replay, CliResult};
use offsetdb_core::record::{RecordFormat, RecordSink, StreamSink};
use offsetdb_core::serialization::{self, CopyProgress};
use offsetdb_core::{DescriptorHeader, StorageOptions, VersionedValue};
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Compaction statistics.
#[derive(Debug)]
pub struct CompactStats {
    /// Live records to copy.
    pub live_records: usize,
    /// Bytes before compaction.
    pub bytes_before: u64,
    /// Bytes held by live records.
    pub live_bytes: u64,
}

/// Runs the compact command.
pub fn run(
    path: &Path,
    descriptor: &Path,
    output: &Path,
    descriptor_out: &Path,
    dry_run: bool,
) -> CliResult<()> {
    let header = load_descriptor(descriptor)?;
    let (reader, file_size) = open_reader(path)?;
    let (builder, _) = replay(reader.as_ref(), &header, true)?;

    let stats = CompactStats {
        live_records: builder.locations().len(),
        bytes_before: file_size,
        live_bytes: builder.total_size(),
    };

    println!("Compacting index at {:?}", path);
    if dry_run {
        println!("(dry run - no changes will be made)");
    }
    println!();
    println!("Compaction Analysis:");
    println!("  Live records: {}", stats.live_records);
    println!("  Size before:  {} bytes", format_size(stats.bytes_before));
    println!("  Live bytes:   {} bytes", format_size(stats.live_bytes));
    println!(
        "  Reclaimable:  {} bytes ({:.1}%)",
        format_size(stats.bytes_before.saturating_sub(stats.live_bytes)),
        if stats.bytes_before > 0 {
            (stats.bytes_before.saturating_sub(stats.live_bytes)) as f64
                / stats.bytes_before as f64
                * 100.0
        } else {
            0.0
        }
    );

    if dry_run {
        return Ok(());
    }
    if output.exists() {
        return Err(format!("Output file already exists: {}", output.display()).into());
    }

    let live: Vec<VersionedValue> = builder
        .locations()
        .iter()
        .map(|(key, location)| VersionedValue::new(key.primary_key, key.record_type, *location))
        .collect();

    println!();
    println!("Performing compaction...");

    let file = OpenOptions::new().write(true).create_new(true).open(output)?;
    let mut out = BufWriter::new(file);
    let (copy, new_size) = {
        let mut sink = StreamSink::new(&mut out);
        let copy = serialization::copy_snapshot(
            reader.as_ref(),
            &mut sink,
            &live,
            &[],
            header.catalog_version,
            RecordFormat::from_options(&StorageOptions::new()),
            &mut |progress: CopyProgress| {
                tracing::debug!(copied = progress.copied, total = progress.total, "copying");
            },
        )?;
        (copy, sink.position())
    };
    out.flush()?;
    out.get_ref().sync_all()?;

    let compacted = DescriptorHeader {
        version: 1,
        catalog_version: header.catalog_version,
        file_location: Some(copy.tail.location),
        compressed_keys: header.compressed_keys.clone(),
        codec: header.codec.clone(),
        active_record_share: if new_size == 0 {
            1.0
        } else {
            copy.live_bytes as f64 / new_size as f64
        },
        file_size: new_size,
    };
    std::fs::write(descriptor_out, compacted.to_bytes()?)?;

    tracing::info!(
        source = %path.display(),
        target = %output.display(),
        records = copy.records,
        bytes = new_size,
        "index compacted"
    );
    println!("  Size after:   {} bytes", format_size(new_size));
    println!("  Descriptor:   {:?}", descriptor_out);
    println!("✓ Compaction complete");

    Ok(())
}
