//! Dump-fragments command implementation.

use super::{load_descriptor, open_reader, CliResult};
use offsetdb_core::record;
use offsetdb_core::serialization::Fragment;
use serde::Serialize;
use std::path::Path;

/// A fragment entry for display.
#[derive(Debug, Serialize)]
pub struct EntryInfo {
    /// Record type.
    pub record_type: i8,
    /// Primary key.
    pub primary_key: i64,
    /// Whether the entry removes the key.
    pub removed: bool,
    /// Offset of the value.
    pub offset: u64,
    /// Length of the value.
    pub length: u32,
}

/// A fragment for display.
#[derive(Debug, Serialize)]
pub struct FragmentInfo {
    /// Offset of the fragment.
    pub offset: u64,
    /// Length of the fragment.
    pub length: u32,
    /// Catalog version stamped on the fragment.
    pub catalog_version: i64,
    /// Whether the fragment closes its generation.
    pub closes_generation: bool,
    /// Offset of the previous fragment.
    pub previous: Option<u64>,
    /// Entries of the fragment.
    pub entries: Vec<EntryInfo>,
}

/// Runs the dump-fragments command.
///
/// Fragments are listed from the tail towards the root.
pub fn run(path: &Path, descriptor: &Path, limit: Option<usize>, format: &str) -> CliResult<()> {
    let header = load_descriptor(descriptor)?;
    let (reader, _) = open_reader(path)?;

    let mut fragments = Vec::new();
    let mut next = header.file_location;
    let max_fragments = limit.unwrap_or(usize::MAX);

    while let Some(location) = next {
        if fragments.len() >= max_fragments {
            break;
        }
        let stored = record::read(reader.as_ref(), location, true)?;
        let fragment = Fragment::decode(&stored.payload, location.start)?;
        next = fragment.previous;
        fragments.push(FragmentInfo {
            offset: location.start,
            length: location.length,
            catalog_version: stored.catalog_version,
            closes_generation: stored.closes_generation(),
            previous: fragment.previous.map(|prev| prev.start),
            entries: fragment
                .entries
                .iter()
                .map(|entry| EntryInfo {
                    record_type: entry.key().record_type,
                    primary_key: entry.primary_key,
                    removed: entry.is_removal(),
                    offset: entry.location.start,
                    length: entry.location.length,
                })
                .collect(),
        });
    }

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&fragments)?),
        _ => print_text_output(&fragments),
    }

    Ok(())
}

fn print_text_output(fragments: &[FragmentInfo]) {
    println!("Fragment Chain ({} fragments)", fragments.len());
    println!("==============================");
    for fragment in fragments {
        println!();
        println!(
            "@{} len={} version={}{} previous={}",
            fragment.offset,
            fragment.length,
            fragment.catalog_version,
            if fragment.closes_generation { " [closed]" } else { "" },
            fragment
                .previous
                .map_or_else(|| "-".to_string(), |prev| prev.to_string()),
        );
        for entry in &fragment.entries {
            println!(
                "  {} {}:{} -> {}+{}",
                if entry.removed { "DEL" } else { "PUT" },
                entry.record_type,
                entry.primary_key,
                entry.offset,
                entry.length
            );
        }
    }
}
