//! Error types for seqlock_shm

use std::io;
use thiserror::Error;

/// Result type for shared memory operations
pub type ShmResult<T> = std::result::Result<T, ShmError>;

/// Errors that can occur while creating, attaching or releasing shared memory
///
/// The lock primitives themselves never fail; only segment management does.
#[derive(Debug, Error)]
pub enum ShmError {
    /// Segment name is empty, too long or not of the form `/name`
    #[error("Invalid shared memory name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    /// Requested size is zero
    #[error("Invalid shared memory size: {size} bytes")]
    InvalidSize { size: usize },

    /// Rounding the size up to the page size overflows `usize`
    #[error("Size {size} exceeds allowable limits when rounded to page size {page_size}")]
    SizeOverflow { size: usize, page_size: usize },

    /// Payload alignment cannot be honoured by a page-aligned mapping
    #[error("Payload alignment {align} exceeds page size {page_size}")]
    Alignment { align: usize, page_size: usize },

    /// Failed to create shared memory
    #[error("Failed to create shared memory '{name}': {source}")]
    Create {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to open existing shared memory
    #[error("Failed to open shared memory '{name}': {source}")]
    Open {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to truncate shared memory
    #[error("Failed to set size of shared memory '{name}': {source}")]
    Truncate {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to read back the size of shared memory
    #[error("Failed to stat shared memory '{name}': {source}")]
    Stat {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to map memory
    #[error("Failed to map shared memory '{name}': {source}")]
    Map {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to unmap memory
    #[error("Failed to unmap shared memory '{name}': {source}")]
    Unmap {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to remove the name from the shared memory namespace
    #[error("Failed to unlink shared memory '{name}': {source}")]
    Unlink {
        name: String,
        #[source]
        source: io::Error,
    },

    /// An existing segment has a different size than requested
    #[error("Size mismatch for shared memory '{name}': expected {expected} bytes, found {actual} bytes")]
    SizeMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    /// Mapping is too small for the payload placed into it
    #[error("Payload needs {required} bytes but the mapping holds {available} bytes")]
    CapacityTooSmall { required: usize, available: usize },
}

impl ShmError {
    /// The underlying OS error, if this error wraps one
    pub fn os_error(&self) -> Option<&io::Error> {
        match self {
            ShmError::Create { source, .. }
            | ShmError::Open { source, .. }
            | ShmError::Truncate { source, .. }
            | ShmError::Stat { source, .. }
            | ShmError::Map { source, .. }
            | ShmError::Unmap { source, .. }
            | ShmError::Unlink { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Whether the error comes from invalid caller-supplied configuration
    pub fn is_invalid_config(&self) -> bool {
        matches!(
            self,
            ShmError::InvalidName { .. }
                | ShmError::InvalidSize { .. }
                | ShmError::SizeOverflow { .. }
                | ShmError::Alignment { .. }
        )
    }
}
