//! OffsetDB CLI
//!
//! Command-line tools for OffsetDB index files.
//!
//! # Commands
//!
//! - `inspect` - Display descriptor and live record statistics
//! - `verify` - Verify record framing, checksums and the fragment chain
//! - `compact` - Copy the live records into a new file
//! - `dump-fragments` - Dump the fragment chain for debugging

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// OffsetDB command-line index tools.
#[derive(Parser)]
#[command(name = "offsetdb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the index data file
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Path to the descriptor file (defaults to `<path>.descriptor`)
    #[arg(global = true, short, long)]
    descriptor: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display descriptor and live record statistics
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Verify record framing, checksums and the fragment chain
    Verify {
        /// Skip checksum verification
        #[arg(long)]
        no_crc: bool,
    },

    /// Copy the live records into a new file
    Compact {
        /// Path of the compacted data file (must not exist)
        #[arg(short, long)]
        output: PathBuf,

        /// Where to write the new descriptor (defaults to `<output>.descriptor`)
        #[arg(long)]
        descriptor_out: Option<PathBuf>,

        /// Dry run - show what would be done
        #[arg(long)]
        dry_run: bool,
    },

    /// Dump the fragment chain for debugging
    DumpFragments {
        /// Maximum number of fragments to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("Index path required for inspect")?;
            let descriptor = commands::descriptor_path(&path, cli.descriptor);
            commands::inspect::run(&path, &descriptor, &format)?;
        }
        Commands::Verify { no_crc } => {
            let path = cli.path.ok_or("Index path required for verify")?;
            let descriptor = commands::descriptor_path(&path, cli.descriptor);
            commands::verify::run(&path, &descriptor, !no_crc)?;
        }
        Commands::Compact {
            output,
            descriptor_out,
            dry_run,
        } => {
            let path = cli.path.ok_or("Index path required for compact")?;
            let descriptor = commands::descriptor_path(&path, cli.descriptor);
            let descriptor_out = commands::descriptor_path(&output, descriptor_out);
            commands::compact::run(&path, &descriptor, &output, &descriptor_out, dry_run)?;
        }
        Commands::DumpFragments { limit, format } => {
            let path = cli.path.ok_or("Index path required for dump-fragments")?;
            let descriptor = commands::descriptor_path(&path, cli.descriptor);
            commands::dump_fragments::run(&path, &descriptor, limit, &format)?;
        }
        Commands::Version => {
            println!("OffsetDB CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("OffsetDB Core v{}", offsetdb_core::VERSION);
        }
    }

    Ok(())
}
