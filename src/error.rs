//! Error types shared by every part of the engine.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Everything that can go wrong while tailing.
#[derive(Debug, Error)]
pub enum Error {
    /// The path does not exist.
    #[error("file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("permission denied: {}", .0.display())]
    PermissionDenied(PathBuf),
    /// Any other I/O failure on `path`. Usually transient.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The root of a directory watch was removed or stopped being a
    /// directory.
    #[error("watched directory disappeared: {}", .0.display())]
    DirectoryGone(PathBuf),
    /// Filesystem events for a directory are unavailable. The directory is
    /// still rescanned every `poll_interval`.
    #[error("failed to register watch: {0}")]
    Watch(#[from] notify::Error),
    /// The task working on this path panicked.
    #[error("task for {} panicked", .0.display())]
    Panicked(PathBuf),
    /// Rejected by [`TailConfig::validate`](crate::TailConfig::validate).
    #[error("invalid configuration: {0}")]
    Config(String),
    /// The coordinator has shut down and takes no more requests.
    #[error("tailor is no longer running")]
    Closed,
}

impl Error {
    /// Classifies an `io::Error` raised while touching `path`.
    pub fn from_io(path: impl AsRef<Path>, err: io::Error) -> Self {
        let path = path.as_ref().to_path_buf();
        match err.kind() {
            io::ErrorKind::NotFound => Error::NotFound(path),
            io::ErrorKind::PermissionDenied => Error::PermissionDenied(path),
            _ => Error::Io { path, source: err },
        }
    }

    /// `true` for [`Error::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

/// A failure observed for a single origin, delivered on the error side channel.
#[derive(Debug)]
pub struct ErrorEvent {
    /// The file (or watched directory root) the failure belongs to.
    pub origin: PathBuf,
    pub error: Error,
    /// `true` when the watcher for `origin` has stopped because of it.
    pub fatal: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_io_kinds() {
        let path = Path::new("/some/file.log");

        let err = Error::from_io(path, io::Error::from(io::ErrorKind::NotFound));
        assert!(err.is_not_found());

        let err = Error::from_io(path, io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(err, Error::PermissionDenied(p) if p == path));

        let err = Error::from_io(path, io::Error::from(io::ErrorKind::UnexpectedEof));
        assert!(matches!(err, Error::Io { .. }));
        assert!(err.to_string().contains("/some/file.log"));
    }
}
