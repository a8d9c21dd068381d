//! Inspect command implementation.

use super::{format_size, load_descriptor, open_reader, replay, CliResult};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Data file path.
    pub path: String,
    /// Data file size.
    pub file_size: u64,
    /// Descriptor version counter.
    pub descriptor_version: u64,
    /// Catalog version of the last flush.
    pub catalog_version: u64,
    /// Codec that wrote the payloads.
    pub codec: String,
    /// Bytes after the descriptor's tail.
    pub unflushed_bytes: u64,
    /// Fragments in the chain.
    pub fragment_count: usize,
    /// Live keys.
    pub live_records: u64,
    /// Bytes held by live records.
    pub live_bytes: u64,
    /// Largest live record.
    pub max_record_size: u32,
    /// Share of the file occupied by live records.
    pub active_share: f64,
    /// Live keys per record type.
    pub types: BTreeMap<i8, u64>,
    /// Compressed key table size.
    pub compressed_keys: usize,
}

/// Runs the inspect command.
pub fn run(path: &Path, descriptor: &Path, format: &str) -> CliResult<()> {
    let header = load_descriptor(descriptor)?;
    let (reader, file_size) = open_reader(path)?;
    let (builder, fragment_count) = replay(reader.as_ref(), &header, true)?;

    let flushed_end = header.file_location.map_or(0, |tail| tail.end());
    let live_bytes = builder.total_size();
    let result = InspectResult {
        path: path.display().to_string(),
        file_size,
        descriptor_version: header.version,
        catalog_version: header.catalog_version,
        codec: header.codec.clone(),
        unflushed_bytes: file_size.saturating_sub(flushed_end),
        fragment_count,
        live_records: builder.locations().len() as u64,
        live_bytes,
        max_record_size: builder.max_record_size(),
        active_share: if file_size == 0 {
            1.0
        } else {
            live_bytes as f64 / file_size as f64
        },
        types: builder
            .histogram()
            .iter()
            .map(|(record_type, count)| (*record_type, *count))
            .collect(),
        compressed_keys: header.compressed_keys.len(),
    };

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text_output(&result),
    }

    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("OffsetDB Index Inspection");
    println!("=========================");
    println!();
    println!("Path: {}", result.path);
    println!();
    println!("Descriptor:");
    println!("  Version:         {}", result.descriptor_version);
    println!("  Catalog version: {}", result.catalog_version);
    println!("  Codec:           {}", result.codec);
    println!("  Compressed keys: {}", result.compressed_keys);
    println!();
    println!("Storage:");
    println!("  File size:       {} bytes", format_size(result.file_size));
    println!("  Live bytes:      {} bytes", format_size(result.live_bytes));
    println!("  Unflushed bytes: {} bytes", format_size(result.unflushed_bytes));
    println!("  Active share:    {:.1}%", result.active_share * 100.0);
    println!("  Fragments:       {}", result.fragment_count);
    println!();
    println!("Records:");
    println!("  Live records:    {}", result.live_records);
    println!("  Largest record:  {} bytes", result.max_record_size);

    if !result.types.is_empty() {
        println!();
        println!("Record types:");
        for (record_type, count) in &result.types {
            println!("  [{}] {} records", record_type, count);
        }
    }
}
