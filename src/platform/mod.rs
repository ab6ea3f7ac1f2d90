// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Per-OS shared memory plumbing. Both implementations lay the same
// bookkeeping block at the base of every mapping, mirroring how slot
// segments carry their counter block at the payload base: a cross-process
// count of live mappings, an initialization latch, and the payload size
// the creator recorded. Opening a segment therefore never needs its size
// passed out of band, and the last unmapper can retire the backing object.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::spin_lock::adaptive_yield;

#[cfg(unix)]
pub mod posix;

#[cfg(windows)]
pub mod windows;

#[cfg(unix)]
pub use posix::OsSegment;

#[cfg(windows)]
pub use windows::OsSegment;

/// Bookkeeping block at the base of every mapping. All-zero (a fresh
/// object) means "not yet published".
#[repr(C)]
pub(crate) struct SegmentHeader {
    /// Live mappings across all processes.
    maps: AtomicU32,
    /// Flips to 1 once the creator has recorded the payload size.
    ready: AtomicU32,
    /// Payload bytes, as recorded by the creator.
    user_size: AtomicU64,
}

pub(crate) const SEGMENT_HEADER_SIZE: usize = std::mem::size_of::<SegmentHeader>();
const _: () = assert!(SEGMENT_HEADER_SIZE == 16);

impl SegmentHeader {
    /// Creator side: record the payload size and open the latch. The
    /// creator counts as the first mapping.
    pub(crate) fn publish(&self, user_size: usize) {
        self.user_size.store(user_size as u64, Ordering::Relaxed);
        self.maps.store(1, Ordering::Relaxed);
        self.ready.store(1, Ordering::Release);
    }

    /// Opener side: wait out the creator's publish (it follows its mapping
    /// immediately), join the mapping count, and return the recorded
    /// payload size.
    pub(crate) fn join(&self) -> usize {
        let mut k = 0u32;
        while self.ready.load(Ordering::Acquire) == 0 {
            adaptive_yield(&mut k);
        }
        self.maps.fetch_add(1, Ordering::AcqRel);
        self.user_size.load(Ordering::Relaxed) as usize
    }

    /// Drop one mapping; returns how many remain.
    pub(crate) fn leave(&self) -> u32 {
        self.maps.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub(crate) fn mappings(&self) -> u32 {
        self.maps.load(Ordering::Acquire)
    }

    pub(crate) fn recorded_size(&self) -> usize {
        self.user_size.load(Ordering::Relaxed) as usize
    }
}
