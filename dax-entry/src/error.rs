//! Error types for the entry engine.
//!
//! Callers see exactly one error type, [`EntryError`]. Transient conditions
//! that the engine retries internally (index growth, lock waits) never reach
//! it unless a configured bound is exceeded.

use std::io;

use thiserror::Error;

use crate::entry::Pfn;

/// Errors surfaced by entry operations.
#[derive(Debug, Error)]
pub enum EntryError {
    /// A smaller-order entry already occupies part of the requested range.
    ///
    /// Not a failure: the caller is expected to retry at a finer order.
    #[error("fallback: a smaller entry occupies the requested range")]
    Fallback,

    /// Growing the sparse index failed and the retry budget is exhausted.
    #[error("out of memory growing the entry index")]
    OutOfMemory,

    /// A value found in the index does not decode as a region entry.
    #[error("I/O error: invalid entry at index {index}")]
    Corrupted {
        /// Index at which the bad value was found.
        index: u64,
    },

    /// A frame was claimed by two owners at once.
    #[error("bus error: frame {frame} is already owned")]
    Sigbus {
        /// The contended frame.
        frame: Pfn,
    },

    /// A bounded wait expired before the entry or frame became available.
    #[error("timed out waiting for an entry or frame")]
    TimedOut,

    /// Flushing a region to stable media failed.
    #[error("flush of frame {frame} failed: {source}")]
    Flush {
        /// First frame of the region being flushed.
        frame: Pfn,
        /// Underlying device error.
        #[source]
        source: io::Error,
    },
}

impl EntryError {
    /// Whether this is the order negotiation outcome rather than a failure.
    pub fn is_fallback(&self) -> bool {
        matches!(self, EntryError::Fallback)
    }
}

/// Result alias for entry operations.
pub type Result<T> = std::result::Result<T, EntryError>;

/// Errors reported by a [`SparseIndex`](crate::index::SparseIndex).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IndexError {
    /// New index storage could not be allocated.
    #[error("index storage allocation failed")]
    NoMemory,
}

impl From<IndexError> for EntryError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::NoMemory => EntryError::OutOfMemory,
        }
    }
}
