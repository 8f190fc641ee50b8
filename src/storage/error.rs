//! Storage layer error types.

use crate::storage::{PageId, PartitionId};
use thiserror::Error;

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Page {0} is not allocated")]
    NotAllocated(PageId),

    #[error("Page {0} is already allocated")]
    AlreadyAllocated(PageId),

    #[error("Partition {0} is already in use")]
    AlreadyInUse(PartitionId),

    #[error("Partition {0} not found")]
    NotFound(PartitionId),

    #[error("Partition {0} is full")]
    PartitionFull(PartitionId),

    #[error("Local page {local} is out of range (max: {max})")]
    OutOfRange { local: u64, max: u64 },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("All frames are pinned: cannot evict")]
    AllPinned,

    #[error("Page directory mismatch: expected {expected}, found {found}")]
    DirectoryMismatch { expected: u32, found: u32 },

    #[error("Cannot unpin page {0}: pin count is zero")]
    UnpinViolation(PageId),

    #[error("Frame for page {0} has been invalidated")]
    InvalidatedFrame(PageId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
