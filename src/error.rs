//! Error types for the hosts file synchronizer.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while replacing the managed region of the hosts file.
#[derive(Debug, Error)]
pub enum HostsError {
    /// The target file could not be read.
    #[error("failed to read hosts file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The replacement could not be written to a temporary file.
    #[error("failed to write temporary hosts file next to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The temporary file could not be moved over the target.
    #[error("failed to replace hosts file {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl HostsError {
    /// An unreadable target leaves the unmanaged content unknown, so the
    /// daemon must stop instead of guessing.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Read { .. })
    }
}
