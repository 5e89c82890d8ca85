use std::path::PathBuf;

use std::time::SystemTimeError;

/// The primary error type for all operations in the `wprime` crate.
///
/// Cooperative yields (time budget exhausted mid-archive) are *not* errors and
/// never appear here; they are reported through `StepOutcome::Partial`.
#[derive(Debug)]
pub enum WprimeError {
    /// An I/O error occurred, typically while reading or writing a file.
    /// Includes the path where the error happened.
    Io { source: std::io::Error, path: PathBuf },

    /// A structural problem was found in an archive. The string is a
    /// human-readable diagnostic; corrupted archives are never auto-repaired.
    Corrupted(String),

    /// No temp folder was supplied when finalizing a package configuration.
    MissingTempFolder,

    /// The caller is not entitled to write or read package metadata for this site.
    Unauthorized { blog_id: u64 },

    /// The package configuration ended up with fewer than the required keys.
    CorruptedConfiguration { found: usize },

    /// A cryptographic error, e.g. a missing key or an IV of the wrong length.
    Crypto(String),

    /// An error during serialization or deserialization of resume state or
    /// package configuration.
    SerdeJson(serde_json::Error),

    /// A system time error, which can occur when reading file metadata.
    SystemTime(SystemTimeError),

    /// A wrapper for any other error that doesn't fit the specific variants.
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl WprimeError {
    /// Attach a path to a raw I/O error.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        WprimeError::Io { source, path: path.into() }
    }
}

impl std::fmt::Display for WprimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WprimeError::Io { source, path } => write!(f, "I/O error on path '{}': {}", path.display(), source),
            WprimeError::Corrupted(msg) => write!(f, "Corrupted archive: {}", msg),
            WprimeError::MissingTempFolder => write!(f, "No temp folder supplied for package finalization"),
            WprimeError::Unauthorized { blog_id } => write!(f, "Not authorized to manage packages for site {}", blog_id),
            WprimeError::CorruptedConfiguration { found } => write!(f, "Package configuration has only {} keys; it is unrestorable", found),
            WprimeError::Crypto(msg) => write!(f, "Crypto error: {}", msg),
            WprimeError::SerdeJson(e) => write!(f, "Serialization error: {}", e),
            WprimeError::SystemTime(e) => write!(f, "System time error: {}", e),
            WprimeError::Other(e) => write!(f, "An unexpected error occurred: {}", e),
        }
    }
}

impl std::error::Error for WprimeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WprimeError::Io { source, .. } => Some(source),
            WprimeError::SerdeJson(e) => Some(e),
            WprimeError::SystemTime(e) => Some(e),
            WprimeError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for WprimeError {
    fn from(err: serde_json::Error) -> Self {
        WprimeError::SerdeJson(err)
    }
}

impl From<SystemTimeError> for WprimeError {
    fn from(err: SystemTimeError) -> Self {
        WprimeError::SystemTime(err)
    }
}

// Generic IO error conversion that doesn't require a path
impl From<std::io::Error> for WprimeError {
    fn from(err: std::io::Error) -> Self {
        WprimeError::Io { source: err, path: PathBuf::new() }
    }
}
