//! Verify command implementation.

use super::{load_descriptor, open_reader, replay, CliResult};
use offsetdb_core::serialization;
use std::path::Path;

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Bytes scanned.
    pub bytes_checked: u64,
    /// Physical records checked.
    pub records_checked: u64,
    /// Largest physical record.
    pub max_record_size: u32,
    /// Fragments reachable from the descriptor's tail.
    pub fragments: Option<usize>,
    /// Live keys described by the fragments.
    pub live_records: Option<usize>,
    /// Bytes after the descriptor's tail, not covered by any fragment.
    pub unflushed_bytes: u64,
    /// Errors found.
    pub errors: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs the verify command.
///
/// Without a descriptor file the whole data file is scanned and the
/// fragment chain is not checked.
pub fn run(path: &Path, descriptor: &Path, verify_crc: bool) -> CliResult<()> {
    println!("Verifying index at {:?}", path);
    if !verify_crc {
        println!("(checksums are not verified)");
    }
    println!();

    let (reader, file_size) = open_reader(path)?;
    let header = if descriptor.exists() {
        Some(load_descriptor(descriptor)?)
    } else {
        println!("Descriptor not found, scanning the whole file");
        None
    };

    let scan_end = header
        .as_ref()
        .and_then(|header| header.file_location)
        .map_or(file_size, |tail| tail.end());

    let mut result = VerifyResult {
        unflushed_bytes: file_size.saturating_sub(scan_end),
        ..VerifyResult::default()
    };

    if scan_end > file_size {
        result.errors.push(format!(
            "descriptor tail ends at {} but the file has {} bytes",
            scan_end, file_size
        ));
    } else {
        match serialization::verify(reader.as_ref(), scan_end, verify_crc) {
            Ok(stats) => {
                result.bytes_checked = stats.total_size;
                result.records_checked = stats.record_count;
                result.max_record_size = stats.max_record_size;
            }
            Err(err) => result.errors.push(err.to_string()),
        }

        if let Some(header) = &header {
            match replay(reader.as_ref(), header, verify_crc) {
                Ok((builder, fragments)) => {
                    result.fragments = Some(fragments);
                    result.live_records = Some(builder.locations().len());
                }
                Err(err) => result.errors.push(format!("fragment chain: {}", err)),
            }
        }
    }

    print_result(&result);

    println!();
    if result.is_ok() {
        println!("✓ Index verification passed");
        Ok(())
    } else {
        println!("✗ Index verification failed");
        Err("Verification failed".into())
    }
}

fn print_result(result: &VerifyResult) {
    println!("Records:");
    println!("  Bytes checked:   {}", result.bytes_checked);
    println!("  Records checked: {}", result.records_checked);
    println!("  Largest record:  {} bytes", result.max_record_size);
    if let Some(fragments) = result.fragments {
        println!("  Fragments:       {}", fragments);
    }
    if let Some(live) = result.live_records {
        println!("  Live records:    {}", live);
    }
    if result.unflushed_bytes > 0 {
        println!(
            "  Unflushed bytes: {} (dropped when the index is next opened)",
            result.unflushed_bytes
        );
    }
    for error in &result.errors {
        println!("  ERROR: {}", error);
    }
}
