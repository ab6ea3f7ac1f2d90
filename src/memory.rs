// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Memory manager capability interface: local slot lifecycle within one
// memory space. Backends stay strongly encapsulated behind this trait —
// what "allocate" means (zeroed heap pages, a named segment with a counter
// header, device memory) is entirely the backend's business.

use std::sync::Arc;

use crate::error::{HcrError, HcrResult};
use crate::slot::LocalMemorySlot;
use crate::topology::MemorySpace;

/// Placement policy for host allocations. A per-manager policy, never a
/// per-slot flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BindingPolicy {
    /// Pages bind to the NUMA node of the first writer.
    #[default]
    FirstTouch,
    /// Pages must come from the space's own node.
    Strict,
}

/// Local-slot lifecycle operations.
pub trait MemoryManager: Send + Sync {
    /// Allocate a fresh region of `size` bytes in `space` and register it.
    /// The slot owns the memory and releases it when the last handle drops.
    fn allocate_local_memory_slot(
        &self,
        space: &MemorySpace,
        size: usize,
    ) -> HcrResult<Arc<LocalMemorySlot>>;

    /// Register caller-provided memory. The slot borrows the pointer; the
    /// caller guarantees the region stays mapped for the slot's lifetime.
    fn register_local_memory_slot(
        &self,
        space: &MemorySpace,
        ptr: *mut u8,
        size: usize,
    ) -> HcrResult<Arc<LocalMemorySlot>>;

    /// Release a slot created by `allocate_local_memory_slot`.
    fn free_local_memory_slot(&self, slot: Arc<LocalMemorySlot>) -> HcrResult<()> {
        if !slot.is_allocated() {
            return Err(HcrError::InvalidArgument(
                "free called on a registered slot; use deregister".into(),
            ));
        }
        // The actual release happens when the final handle drops.
        drop(slot);
        Ok(())
    }

    /// Release a slot created by `register_local_memory_slot`.
    fn deregister_local_memory_slot(&self, slot: Arc<LocalMemorySlot>) -> HcrResult<()> {
        if !slot.is_registered() {
            return Err(HcrError::InvalidArgument(
                "deregister called on an allocated slot; use free".into(),
            ));
        }
        drop(slot);
        Ok(())
    }

    /// Fill the first `size` bytes of `slot` with `value`. Used to zero
    /// coordination buffers before first use.
    fn memset(&self, slot: &Arc<LocalMemorySlot>, value: u8, size: usize) -> HcrResult<()> {
        if size > slot.size() {
            return Err(HcrError::OutOfRange {
                offset: 0,
                size,
                slot_size: slot.size(),
            });
        }
        unsafe { std::ptr::write_bytes(slot.as_ptr(), value, size) };
        Ok(())
    }
}
