// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Circular-buffer arithmetic over a coordination buffer.
//
// A coordination buffer is a 16-byte record of two 64-bit counters,
// `[head_advance_count, tail_advance_count]`, both monotone. The buffer it
// coordinates stores no state of its own: depth and positions are derived
// on every read, so the view stays correct when a remote peer overwrites
// either counter word through a one-sided put. All accesses are whole-word
// atomics; no locking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{HcrError, HcrResult};
use crate::slot::LocalMemorySlot;

/// Size of a coordination buffer in bytes: two 64-bit counters.
pub const COORDINATION_BUFFER_SIZE: usize = 16;

/// Byte offset of the head advance counter within a coordination buffer.
pub const HEAD_ADVANCE_OFFSET: usize = 0;

/// Byte offset of the tail advance counter within a coordination buffer.
pub const TAIL_ADVANCE_OFFSET: usize = 8;

/// A circular-buffer view over a coordination buffer slot.
///
/// The producer side advances the head, the consumer side advances the
/// tail; whichever side is remote mirrors its counter over with one-sided
/// word puts. Invariants: `head >= tail` and `head - tail <= capacity`.
pub struct CircularBuffer {
    capacity: usize,
    coordination: Arc<LocalMemorySlot>,
}

impl CircularBuffer {
    /// Build a view of `capacity` elements over `coordination`.
    ///
    /// The slot must hold at least [`COORDINATION_BUFFER_SIZE`] bytes at an
    /// 8-byte-aligned address and should be zeroed before first use.
    pub fn new(capacity: usize, coordination: Arc<LocalMemorySlot>) -> HcrResult<Self> {
        if capacity == 0 {
            return Err(HcrError::InvalidArgument(
                "circular buffer capacity is zero".into(),
            ));
        }
        if coordination.size() < COORDINATION_BUFFER_SIZE {
            return Err(HcrError::InvalidArgument(format!(
                "coordination buffer needs {COORDINATION_BUFFER_SIZE} bytes, slot has {}",
                coordination.size()
            )));
        }
        if (coordination.as_ptr() as usize) % 8 != 0 {
            return Err(HcrError::InvalidArgument(
                "coordination buffer is not 8-byte aligned".into(),
            ));
        }
        Ok(Self {
            capacity,
            coordination,
        })
    }

    fn head_cell(&self) -> &AtomicU64 {
        unsafe { &*(self.coordination.as_ptr().add(HEAD_ADVANCE_OFFSET) as *const AtomicU64) }
    }

    fn tail_cell(&self) -> &AtomicU64 {
        unsafe { &*(self.coordination.as_ptr().add(TAIL_ADVANCE_OFFSET) as *const AtomicU64) }
    }

    /// The coordination slot backing this view.
    pub fn coordination_buffer(&self) -> &Arc<LocalMemorySlot> {
        &self.coordination
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Absolute head advance count.
    pub fn head(&self) -> u64 {
        self.head_cell().load(Ordering::Acquire)
    }

    /// Absolute tail advance count.
    pub fn tail(&self) -> u64 {
        self.tail_cell().load(Ordering::Acquire)
    }

    /// Number of elements currently in the buffer.
    pub fn depth(&self) -> usize {
        let head = self.head();
        let tail = self.tail();
        head.saturating_sub(tail) as usize
    }

    /// Ring index one past the newest element: `(tail + depth) mod capacity`.
    pub fn head_position(&self) -> usize {
        let tail = self.tail();
        let depth = self.depth() as u64;
        ((tail + depth) % self.capacity as u64) as usize
    }

    /// Ring index of the oldest element: `tail mod capacity`.
    pub fn tail_position(&self) -> usize {
        (self.tail() % self.capacity as u64) as usize
    }

    /// Producer-side advance. Fails if the buffer cannot hold `n` more
    /// elements; the counters are untouched on failure.
    pub fn advance_head(&self, n: usize) -> HcrResult<()> {
        if self.depth() + n > self.capacity {
            return Err(HcrError::InvalidArgument(format!(
                "head advance by {n} overflows capacity {} at depth {}",
                self.capacity,
                self.depth()
            )));
        }
        self.head_cell().fetch_add(n as u64, Ordering::AcqRel);
        Ok(())
    }

    /// Consumer-side advance. Fails if fewer than `n` elements are present.
    pub fn advance_tail(&self, n: usize) -> HcrResult<()> {
        if n > self.depth() {
            return Err(HcrError::InvalidArgument(format!(
                "tail advance by {n} exceeds depth {}",
                self.depth()
            )));
        }
        self.tail_cell().fetch_add(n as u64, Ordering::AcqRel);
        Ok(())
    }

    /// Overwrite the head counter with an absolute value observed from a
    /// remote peer.
    pub fn set_head(&self, value: u64) {
        self.head_cell().store(value, Ordering::Release);
    }

    /// Overwrite the tail counter with an absolute value observed from a
    /// remote peer.
    pub fn set_tail(&self, value: u64) {
        self.tail_cell().store(value, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::MemorySpace;

    fn coordination_slot() -> (Arc<LocalMemorySlot>, Box<[u64; 2]>) {
        let mut backing = Box::new([0u64; 2]);
        let slot = LocalMemorySlot::new_registered(
            MemorySpace::new(0, "host", 0),
            backing.as_mut_ptr() as *mut u8,
            COORDINATION_BUFFER_SIZE,
        );
        (slot, backing)
    }

    #[test]
    fn empty_buffer() {
        let (slot, _backing) = coordination_slot();
        let cb = CircularBuffer::new(4, slot).unwrap();
        assert_eq!(cb.depth(), 0);
        assert_eq!(cb.head_position(), 0);
        assert_eq!(cb.tail_position(), 0);
    }

    #[test]
    fn zero_capacity_rejected() {
        let (slot, _backing) = coordination_slot();
        assert!(CircularBuffer::new(0, slot).is_err());
    }

    #[test]
    fn advance_and_wrap() {
        let (slot, _backing) = coordination_slot();
        let cb = CircularBuffer::new(4, slot).unwrap();

        cb.advance_head(3).unwrap();
        assert_eq!(cb.depth(), 3);
        assert_eq!(cb.head_position(), 3);

        cb.advance_tail(2).unwrap();
        assert_eq!(cb.depth(), 1);
        assert_eq!(cb.tail_position(), 2);

        // Wrap: head crosses the capacity boundary.
        cb.advance_head(3).unwrap();
        assert_eq!(cb.depth(), 4);
        assert_eq!(cb.head_position(), 2);
        assert_eq!(cb.tail_position(), 2);
    }

    #[test]
    fn overflow_and_underflow_rejected() {
        let (slot, _backing) = coordination_slot();
        let cb = CircularBuffer::new(2, slot).unwrap();

        cb.advance_head(2).unwrap();
        assert!(cb.advance_head(1).is_err());
        assert_eq!(cb.depth(), 2);

        cb.advance_tail(2).unwrap();
        assert!(cb.advance_tail(1).is_err());
        assert_eq!(cb.depth(), 0);
    }

    #[test]
    fn remote_mirroring_via_setters() {
        let (slot, _backing) = coordination_slot();
        let cb = CircularBuffer::new(8, slot).unwrap();

        // Peer pushed five elements and consumed two.
        cb.set_head(5);
        cb.set_tail(2);
        assert_eq!(cb.depth(), 3);
        assert_eq!(cb.tail_position(), 2);
        assert_eq!(cb.head_position(), 5);

        // Counters are monotone across further local advances.
        cb.advance_head(1).unwrap();
        assert_eq!(cb.head(), 6);
    }
}
