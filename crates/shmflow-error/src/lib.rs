use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for shmflow operations.
///
/// Only construction-time and region I/O failures surface through this type.
/// Per-segment conditions on the write path (retransmissions, sequence
/// inconsistencies, full blocks) are absorbed by the accumulator and never
/// become an `Err`.
#[derive(Error, Debug)]
pub enum ShmflowError {
    // === Region Errors ===
    /// File I/O error on a file-backed region.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Region could not be created or opened.
    #[error("unable to open shared region: '{path}'")]
    CannotOpen { path: PathBuf },

    /// Region is shorter than the layout requires.
    #[error("shared region too small: need {required} bytes, have {actual}")]
    RegionTooSmall { required: usize, actual: usize },

    /// Access past the end of the region.
    #[error("region access out of bounds: offset {offset} len {len} region {region_len}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        region_len: usize,
    },

    // === Layout Errors ===
    /// Region does not start with the store magic.
    #[error("shared region has bad magic")]
    BadMagic,

    /// Region was formatted by an incompatible layout version.
    #[error("store layout version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    /// Immutable header fields do not match their checksum.
    #[error("store header checksum mismatch")]
    ChecksumMismatch,

    /// Header fields are self-consistent but describe an impossible layout.
    #[error("store layout mismatch: {detail}")]
    LayoutMismatch { detail: String },

    // === Store Errors ===
    /// No free block slot or index entry left.
    #[error("store is full: {max_blocks} blocks in use")]
    StoreFull { max_blocks: u32 },

    // === Runtime Errors ===
    /// Operation observed a cancellation request.
    #[error("operation cancelled")]
    Cancelled,

    /// Worker thread could not be spawned or joined.
    #[error("worker thread failure: {0}")]
    Worker(String),

    // === Configuration Errors ===
    /// Configuration values are out of range.
    #[error("invalid configuration: {detail}")]
    InvalidConfig { detail: String },

    /// Configuration text could not be parsed.
    #[error("configuration parse error: {0}")]
    Config(#[from] serde_json::Error),
}

impl ShmflowError {
    /// Create a layout mismatch error.
    pub fn layout(detail: impl Into<String>) -> Self {
        Self::LayoutMismatch {
            detail: detail.into(),
        }
    }

    /// Create an invalid configuration error.
    pub fn invalid_config(detail: impl Into<String>) -> Self {
        Self::InvalidConfig {
            detail: detail.into(),
        }
    }

    /// Whether this error means the backing region cannot be trusted.
    ///
    /// These are the fatal startup failures: a process that hits one must not
    /// attach to the region.
    pub const fn is_layout_error(&self) -> bool {
        matches!(
            self,
            Self::RegionTooSmall { .. }
                | Self::BadMagic
                | Self::VersionMismatch { .. }
                | Self::ChecksumMismatch
                | Self::LayoutMismatch { .. }
        )
    }

    /// Whether the operation may succeed if retried later.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::StoreFull { .. })
    }
}

/// Result type alias using `ShmflowError`.
pub type Result<T> = std::result::Result<T, ShmflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ShmflowError::RegionTooSmall {
            required: 4096,
            actual: 128,
        };
        assert_eq!(
            err.to_string(),
            "shared region too small: need 4096 bytes, have 128"
        );
    }

    #[test]
    fn layout_errors_are_fatal() {
        assert!(ShmflowError::BadMagic.is_layout_error());
        assert!(ShmflowError::ChecksumMismatch.is_layout_error());
        assert!(ShmflowError::layout("slab overlaps index").is_layout_error());
        assert!(!ShmflowError::StoreFull { max_blocks: 8 }.is_layout_error());
        assert!(!ShmflowError::Cancelled.is_layout_error());
    }

    #[test]
    fn store_full_is_transient() {
        assert!(ShmflowError::StoreFull { max_blocks: 8 }.is_transient());
        assert!(!ShmflowError::BadMagic.is_transient());
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: ShmflowError = io.into();
        assert!(matches!(err, ShmflowError::Io(_)));
    }

    #[test]
    fn json_error_converts() {
        let parse = serde_json::from_str::<u32>("not json").unwrap_err();
        let err: ShmflowError = parse.into();
        assert!(err.to_string().starts_with("configuration parse error"));
    }
}
