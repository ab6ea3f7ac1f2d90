// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Error taxonomy for the communication runtime.
//
// Recoverable conditions (`Full`, `Empty`, `LockNotAcquired`) are returned
// without side effects so the caller can poll and retry. Everything else is
// either a programmer error (`InvalidArgument`, `DuplicateKey`, `OutOfRange`)
// or a transport-level failure (`BackendFailure`), both of which leave the
// affected operation un-applied.

use std::io;

use thiserror::Error;

use crate::{GlobalKey, Tag};

/// Result alias used across the crate.
pub type HcrResult<T> = Result<T, HcrError>;

#[derive(Debug, Error)]
pub enum HcrError {
    /// Zero sizes, null pointers, out-of-range peek/pop indices, mismatched
    /// slot kinds — the call itself is malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A transfer would run past the bounds of one of its slots. The slot is
    /// left unchanged.
    #[error("offset {offset} + size {size} exceeds slot bounds ({slot_size} bytes)")]
    OutOfRange {
        offset: usize,
        size: usize,
        slot_size: usize,
    },

    /// No global memory slot was exchanged under this `(tag, key)` pair.
    #[error("no global memory slot registered under tag {tag}, key {key}")]
    NotFound { tag: Tag, key: GlobalKey },

    /// Two exchange participants contributed the same `(tag, key)` pair.
    #[error("duplicate global key {key} under tag {tag}")]
    DuplicateKey { tag: Tag, key: GlobalKey },

    /// The bound backend does not implement the requested operation.
    #[error("operation not supported by this backend: {0}")]
    Unsupported(&'static str),

    /// Channel cannot accept the push right now; retry after the consumer
    /// pops.
    #[error("channel is full")]
    Full,

    /// Channel has fewer messages than the peek/pop asked for; retry after
    /// the next depth update.
    #[error("channel is empty")]
    Empty,

    /// Try-lock semantics: the distributed lock was not obtained.
    #[error("global lock not acquired")]
    LockNotAcquired,

    /// The underlying transport reported an unrecoverable error.
    #[error("backend failure: {0}")]
    BackendFailure(String),
}

impl From<io::Error> for HcrError {
    fn from(e: io::Error) -> Self {
        HcrError::BackendFailure(e.to_string())
    }
}

impl HcrError {
    /// Whether the caller may retry the same call after polling for
    /// progress.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HcrError::Full | HcrError::Empty | HcrError::LockNotAcquired
        )
    }
}
