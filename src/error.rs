use std::path::PathBuf;

/// The primary error type for all operations in the `partar` crate.
#[derive(Debug)]
pub enum ArchiveError {
    /// An I/O error occurred, typically while reading or writing a file.
    /// Includes the path where the error happened.
    Io { source: std::io::Error, path: PathBuf },

    /// An error occurred when trying to strip a prefix from a file path.
    StripPrefix { prefix: PathBuf, path: PathBuf },

    /// A malformed or undecodable archive entry.
    Format(String),

    /// An encoded entry header did not fit in the per-rank scratch buffer.
    Layout { needed: usize, cap: usize },

    /// No usable `.idx` sidecar file was found next to the archive.
    MissingIndex,

    /// The archive cannot be processed in this mode (e.g. a compressed
    /// stream where random access was required).
    Unsupported(String),

    /// One or more ranks reported failure during a collective phase.
    Failed(&'static str),
}

pub type Result<T> = std::result::Result<T, ArchiveError>;

impl ArchiveError {
    /// Attach a path to an I/O error.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        ArchiveError::Io { source, path: path.into() }
    }
}

impl std::fmt::Display for ArchiveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArchiveError::Io { source, path } => write!(f, "I/O error on path '{}': {}", path.display(), source),
            ArchiveError::StripPrefix { prefix, path } => write!(f, "Could not strip prefix '{}' from path '{}'", prefix.display(), path.display()),
            ArchiveError::Format(msg) => write!(f, "Format error: {}", msg),
            ArchiveError::Layout { needed, cap } => write!(f, "Entry header of {} bytes exceeds {} byte scratch buffer", needed, cap),
            ArchiveError::MissingIndex => write!(f, "No index file available"),
            ArchiveError::Unsupported(msg) => write!(f, "Unsupported archive: {}", msg),
            ArchiveError::Failed(msg) => write!(f, "Operation failed: {}", msg),
        }
    }
}

impl std::error::Error for ArchiveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ArchiveError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

// Generic IO error conversion that doesn't carry a path
impl From<std::io::Error> for ArchiveError {
    fn from(err: std::io::Error) -> Self {
        ArchiveError::Io { source: err, path: PathBuf::new() }
    }
}
