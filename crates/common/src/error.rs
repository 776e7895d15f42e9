//! Shared error type used across the dxfuse crates.

use thiserror::Error;

/// Result alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the metadata and I/O engine.
///
/// Kernel-visible operations map each kind to an errno at the dispatch
/// boundary; see [`Error::errno`].
#[derive(Debug, Error, Clone)]
pub enum Error {
    /// Path or inode does not exist.
    #[error("no such file or directory")]
    NotFound,

    /// A namespace entry with the same (parent, name) already exists.
    #[error("file already exists")]
    Exists,

    /// Read-only mount, or a project the credentials cannot upload to.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Operation outside the supported surface, including random writes
    /// to a newly created file.
    #[error("operation not supported: {0}")]
    NotSupported(String),

    /// Transient remote or local I/O failure that survived retries.
    #[error("I/O error: {0}")]
    IO(String),

    /// Expired or missing credentials.
    #[error("authorization failed: {0}")]
    Auth(String),

    /// A metadata invariant was violated. Fatal: indicates a bug, not a
    /// user error.
    #[error("metadata store corrupt: {0}")]
    Corrupt(String),

    /// A remote call exceeded its deadline after retries.
    #[error("timed out: {0}")]
    Timeout(String),
}

impl Error {
    /// The errno equivalent reported to the kernel.
    pub fn errno(&self) -> libc::c_int {
        match self {
            Error::NotFound => libc::ENOENT,
            Error::Exists => libc::EEXIST,
            Error::PermissionDenied(_) => libc::EPERM,
            Error::NotSupported(_) => libc::ENOTSUP,
            Error::IO(_) => libc::EIO,
            Error::Auth(_) => libc::EACCES,
            Error::Corrupt(_) => libc::EIO,
            Error::Timeout(_) => libc::ETIMEDOUT,
        }
    }

    /// Whether the process must terminate after draining uploads.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Corrupt(_))
    }

    /// Wrap any displayable error as an I/O failure.
    pub fn io(err: impl std::fmt::Display) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(Error::NotFound.errno(), libc::ENOENT);
        assert_eq!(Error::Exists.errno(), libc::EEXIST);
        assert_eq!(Error::PermissionDenied("ro".into()).errno(), libc::EPERM);
        assert_eq!(Error::NotSupported("rename".into()).errno(), libc::ENOTSUP);
        assert_eq!(Error::IO("net".into()).errno(), libc::EIO);
        assert_eq!(Error::Auth("expired".into()).errno(), libc::EACCES);
        assert_eq!(Error::Timeout("describe".into()).errno(), libc::ETIMEDOUT);
    }

    #[test]
    fn test_only_corruption_is_fatal() {
        assert!(Error::Corrupt("two rows for inode 7".into()).is_fatal());
        assert!(!Error::IO("connection reset".into()).is_fatal());
        assert!(!Error::Timeout("describe".into()).is_fatal());
    }
}
