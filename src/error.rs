use crate::winsys::tiling::Tiling;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WinsysError {
    #[error("I/O Error: {0}")]
    Io(#[from] io::Error),

    #[error("Buffer manager initialization failed: {0}")]
    Init(String),

    #[error("Required capability missing: {0}")]
    MissingCapability(&'static str),

    #[error("Failed to allocate {size} bytes for '{name}': {source}")]
    AllocFailed {
        name: String,
        size: u64,
        #[source]
        source: io::Error,
    },

    #[error("Import failed: {0}")]
    Import(String),

    #[error("Unsupported handle type for this operation: {0}")]
    UnsupportedHandle(&'static str),

    #[error("Pitch {pitch} is not aligned for {tiling:?} tiling")]
    InvalidPitch { tiling: Tiling, pitch: u64 },

    #[error("Tiling mismatch: requested {requested:?}, kernel applied {applied:?}")]
    TilingMismatch { requested: Tiling, applied: Tiling },

    #[error("Relocation at offset {offset} does not fit in a {size}-byte buffer")]
    RelocOutOfBounds { offset: u64, size: u64 },

    #[error("Relocation from '{owner}' to '{target}' would form a reference cycle")]
    RelocCycle { owner: String, target: String },

    #[error("Relocation limit of {0} entries reached")]
    TooManyRelocations(usize),

    #[error("Range {offset}+{len} is outside a {size}-byte buffer")]
    OutOfBounds { offset: u64, len: u64, size: u64 },

    #[error("Buffer '{0}' is not mapped")]
    NotMapped(String),

    #[error("Kernel rejected submission: {0}")]
    Submit(#[source] io::Error),

    #[error("Wait failed: {0}")]
    Wait(#[source] io::Error),

    #[error("No logical hardware context available")]
    NoContext,
}

impl WinsysError {
    /// Negative errno-style status for callers that speak C status codes.
    #[must_use]
    pub fn errno(&self) -> i32 {
        let code = match self {
            Self::Io(e) | Self::Submit(e) | Self::Wait(e) | Self::AllocFailed { source: e, .. } => {
                e.raw_os_error().unwrap_or(libc::EIO)
            }
            Self::MissingCapability(_) | Self::UnsupportedHandle(_) => libc::ENODEV,
            Self::Init(_) | Self::Import(_) | Self::TilingMismatch { .. } => libc::EIO,
            Self::InvalidPitch { .. }
            | Self::RelocOutOfBounds { .. }
            | Self::RelocCycle { .. }
            | Self::OutOfBounds { .. }
            | Self::NotMapped(_) => libc::EINVAL,
            Self::TooManyRelocations(_) => libc::ENOSPC,
            Self::NoContext => libc::ENOENT,
        };
        -code
    }
}

// A convenient alias
pub type WinsysResult<T> = Result<T, WinsysError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_is_negative() {
        let err = WinsysError::InvalidPitch {
            tiling: Tiling::X,
            pitch: 500,
        };
        assert_eq!(err.errno(), -libc::EINVAL);

        let err = WinsysError::Submit(io::Error::from_raw_os_error(libc::ENOSPC));
        assert_eq!(err.errno(), -libc::ENOSPC);
    }

    #[test]
    fn test_display_mentions_tiling() {
        let err = WinsysError::TilingMismatch {
            requested: Tiling::Y,
            applied: Tiling::None,
        };
        assert!(err.to_string().contains("Y"));
    }
}
