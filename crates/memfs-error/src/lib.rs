#![forbid(unsafe_code)]
//! Error types for MemFS.
//!
//! Defines `MemfsError` and a `Result<T>` alias used throughout the
//! workspace, with errno mappings for the host-driver boundary.

use memfs_types::LayoutError;
use thiserror::Error;

/// Unified error type for all MemFS operations.
#[derive(Debug, Error)]
pub enum MemfsError {
    #[error("image in bad state: {0}")]
    BadImage(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("file exists")]
    Exists,

    #[error("is a directory")]
    IsDirectory,

    #[error("not a directory")]
    NotDirectory,

    #[error("directory not empty")]
    NotEmpty,

    #[error("name too long")]
    NameTooLong,

    #[error("no space left in image")]
    NoSpace,

    #[error("invalid argument: {0}")]
    Invalid(String),
}

impl MemfsError {
    /// Convert this error into a POSIX errno suitable for the host driver.
    ///
    /// `NoSpace` maps to `ENOMEM` rather than `ENOSPC`: the host API treats
    /// image exhaustion the same as failed host scratch allocation.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::BadImage(_) => libc::EFAULT,
            Self::NotFound(_) => libc::ENOENT,
            Self::Exists => libc::EEXIST,
            Self::IsDirectory => libc::EISDIR,
            Self::NotDirectory => libc::ENOTDIR,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::NoSpace => libc::ENOMEM,
            Self::Invalid(_) => libc::EINVAL,
        }
    }
}

impl From<LayoutError> for MemfsError {
    fn from(err: LayoutError) -> Self {
        Self::BadImage(err.to_string())
    }
}

/// Result alias using `MemfsError`.
pub type Result<T> = std::result::Result<T, MemfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_matches_spec() {
        assert_eq!(MemfsError::BadImage("x".into()).to_errno(), libc::EFAULT);
        assert_eq!(MemfsError::NotFound("/a".into()).to_errno(), libc::ENOENT);
        assert_eq!(MemfsError::Exists.to_errno(), libc::EEXIST);
        assert_eq!(MemfsError::IsDirectory.to_errno(), libc::EISDIR);
        assert_eq!(MemfsError::NotDirectory.to_errno(), libc::ENOTDIR);
        assert_eq!(MemfsError::NotEmpty.to_errno(), libc::ENOTEMPTY);
        assert_eq!(MemfsError::NameTooLong.to_errno(), libc::ENAMETOOLONG);
        assert_eq!(MemfsError::NoSpace.to_errno(), libc::ENOMEM);
        assert_eq!(MemfsError::Invalid("x".into()).to_errno(), libc::EINVAL);
    }

    #[test]
    fn layout_errors_become_bad_image() {
        let layout = LayoutError::InvalidField {
            field: "offset",
            reason: "overflow",
        };
        let err: MemfsError = layout.into();
        assert_eq!(err.to_errno(), libc::EFAULT);
    }
}
