use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::common::{DEFAULT_BLOCK_SIZE, DEFAULT_CHUNK_SIZE};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Create a new archive from specified files and directories.
    #[command(alias = "c")]
    Create {
        /// One or more input files or directories to add to the archive.
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// The path for the output archive file (e.g. tree.tar). An offset
        /// index is written alongside it as <archive>.idx.
        #[arg(short, long)]
        output: PathBuf,

        /// Working directory archive names are made relative to. Defaults to
        /// the current directory; every input must live below it.
        #[arg(short = 'C', long)]
        directory: Option<PathBuf>,

        /// Carry extended attributes and full-precision timestamps.
        #[arg(long)]
        preserve: bool,

        /// Payload slice size in bytes; the unit of parallel copy work.
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: u64,

        /// Read/write buffer size in bytes for payload streaming.
        #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
        block_size: u64,

        /// Number of parallel ranks. [0 = auto-detect based on CPU cores]
        #[arg(long, default_value_t = 0)]
        ranks: usize,
    },

    /// Extract files from an archive.
    #[command(alias = "x")]
    Extract {
        /// The archive file to extract.
        #[arg(required = true)]
        archive: PathBuf,

        /// The directory entries are materialized into. Defaults to the
        /// current directory.
        #[arg(short = 'C', long)]
        directory: Option<PathBuf>,

        /// Restore extended attributes and full-precision timestamps.
        #[arg(long)]
        preserve: bool,

        /// Read/write buffer size in bytes for payload streaming.
        #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
        block_size: u64,

        /// Number of parallel ranks. [0 = auto-detect based on CPU cores]
        #[arg(long, default_value_t = 0)]
        ranks: usize,
    },

    /// List the contents of an archive without extracting it.
    #[command(alias = "l")]
    List {
        /// The archive file to list contents of.
        #[arg(required = true)]
        archive: PathBuf,
    },
}

/// Parses command-line arguments using `clap` and returns the command to
/// execute.
pub fn run() -> Result<Commands, Box<dyn std::error::Error>> {
    let args = Args::parse();
    Ok(args.command)
}
