// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Communication manager capability interface: one-sided transfers and
// cluster-wide slot coordination. One backend is bound at startup; no
// runtime rebinding. Every method must be callable from multiple threads
// of the owning instance.
//
// The three transfer shapes (local↔local, local→global "put", global→local
// "get") share one contract: bounds are checked against both slots, exactly
// one source `messages_sent` and one destination `messages_received`
// increment becomes visible per call, transfers between the same slot pair
// complete in posting order, and payloads are never torn.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{HcrError, HcrResult};
use crate::slot::{GlobalMemorySlot, LocalMemorySlot, GLOBAL_SLOT_WIRE_SIZE};
use crate::spin_lock::adaptive_yield;
use crate::{GlobalKey, InstanceId, Tag};

/// One-sided communication and slot coordination operations.
pub trait CommunicationManager: Send + Sync {
    /// This participant's id within the group.
    fn instance_id(&self) -> InstanceId;

    /// Number of participants in the group.
    fn instance_count(&self) -> usize;

    /// Collective all-gather of `(key, slot)` contributions under `tag`.
    /// On return every participant can look up one global slot per
    /// contributed `(key, owner)` pair. Two participants contributing the
    /// same `(tag, key)` fail everywhere with `DuplicateKey`.
    fn exchange_global_memory_slots(
        &self,
        tag: Tag,
        slots: &[(GlobalKey, Arc<LocalMemorySlot>)],
    ) -> HcrResult<()>;

    /// Post-exchange lookup of a global slot.
    fn get_global_memory_slot(&self, tag: Tag, key: GlobalKey)
        -> HcrResult<Arc<GlobalMemorySlot>>;

    /// Copy between two local slots.
    fn memcpy(
        &self,
        dst: &Arc<LocalMemorySlot>,
        dst_offset: usize,
        src: &Arc<LocalMemorySlot>,
        src_offset: usize,
        size: usize,
    ) -> HcrResult<()>;

    /// One-sided write into a global slot's window.
    fn put(
        &self,
        dst: &Arc<GlobalMemorySlot>,
        dst_offset: usize,
        src: &Arc<LocalMemorySlot>,
        src_offset: usize,
        size: usize,
    ) -> HcrResult<()>;

    /// One-sided read from a global slot's window.
    fn get(
        &self,
        dst: &Arc<LocalMemorySlot>,
        dst_offset: usize,
        src: &Arc<GlobalMemorySlot>,
        src_offset: usize,
        size: usize,
    ) -> HcrResult<()>;

    /// Collective completion of everything posted under `tag`: on return,
    /// source buffers are reusable and destination memory reflects all
    /// transfers posted before the fence on any participant.
    fn fence(&self, tag: Tag) -> HcrResult<()>;

    /// One-sided completion for a single slot: returns once the slot's
    /// counters have advanced by at least the expected amounts beyond what
    /// earlier slot fences already consumed.
    fn fence_slot(
        &self,
        slot: &Arc<LocalMemorySlot>,
        expected_sent: u64,
        expected_recv: u64,
    ) -> HcrResult<()>;

    /// Non-blocking poke refreshing the slot's counter state.
    fn query_memory_slot_updates(&self, slot: &Arc<LocalMemorySlot>) -> HcrResult<()>;

    /// Acquire the cluster-wide exclusive lock tied to `slot`. Blocks until
    /// held (returns `Ok(true)`); backends with pure try-lock semantics may
    /// return `Ok(false)` instead.
    fn acquire_global_lock(&self, slot: &Arc<GlobalMemorySlot>) -> HcrResult<bool>;

    /// Release the cluster-wide lock tied to `slot`.
    fn release_global_lock(&self, slot: &Arc<GlobalMemorySlot>) -> HcrResult<()>;

    /// Non-collective promotion of a local slot to a global slot under
    /// `tag`. Promoted slots are disseminated by handle passing, not via
    /// `get_global_memory_slot`.
    fn promote_local_memory_slot(
        &self,
        slot: &Arc<LocalMemorySlot>,
        tag: Tag,
    ) -> HcrResult<Arc<GlobalMemorySlot>>;

    /// Tear down a slot created by `promote_local_memory_slot`.
    fn destroy_promoted_global_memory_slot(
        &self,
        slot: &Arc<GlobalMemorySlot>,
    ) -> HcrResult<()>;

    /// Opaque fixed-size wire form for peer-to-peer handle passing.
    fn serialize_global_memory_slot(
        &self,
        slot: &Arc<GlobalMemorySlot>,
    ) -> HcrResult<[u8; GLOBAL_SLOT_WIRE_SIZE]>;

    /// Rebuild a global slot from its wire form under `tag`.
    fn deserialize_global_memory_slot(
        &self,
        bytes: &[u8],
        tag: Tag,
    ) -> HcrResult<Arc<GlobalMemorySlot>>;

    /// Drop this participant's view of an exchanged slot.
    fn deregister_global_memory_slot(&self, slot: &Arc<GlobalMemorySlot>) -> HcrResult<()>;

    /// Cooperative destruction of an exchanged slot. The application must
    /// fence the slot's tag first; every participant calls this.
    fn destroy_global_memory_slot(&self, slot: &Arc<GlobalMemorySlot>) -> HcrResult<()>;
}

// ---------------------------------------------------------------------------
// Slot registry — tag → key → global slot
// ---------------------------------------------------------------------------

/// Two-level global-slot registry kept by each manager. Identity is the
/// `(tag, key, owner)` triple, never pointer identity.
#[derive(Default)]
pub(crate) struct SlotRegistry {
    inner: Mutex<HashMap<Tag, HashMap<GlobalKey, Arc<GlobalMemorySlot>>>>,
}

impl SlotRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(
        &self,
        tag: Tag,
        key: GlobalKey,
        slot: Arc<GlobalMemorySlot>,
    ) -> HcrResult<()> {
        let mut map = self.inner.lock().unwrap();
        let per_tag = map.entry(tag).or_default();
        if per_tag.contains_key(&key) {
            return Err(HcrError::DuplicateKey { tag, key });
        }
        per_tag.insert(key, slot);
        Ok(())
    }

    pub(crate) fn lookup(&self, tag: Tag, key: GlobalKey) -> HcrResult<Arc<GlobalMemorySlot>> {
        let map = self.inner.lock().unwrap();
        map.get(&tag)
            .and_then(|per_tag| per_tag.get(&key))
            .cloned()
            .ok_or(HcrError::NotFound { tag, key })
    }

    pub(crate) fn remove(&self, tag: Tag, key: GlobalKey) -> Option<Arc<GlobalMemorySlot>> {
        let mut map = self.inner.lock().unwrap();
        let per_tag = map.get_mut(&tag)?;
        let slot = per_tag.remove(&key);
        if per_tag.is_empty() {
            map.remove(&tag);
        }
        slot
    }
}

// ---------------------------------------------------------------------------
// Shared transfer plumbing
// ---------------------------------------------------------------------------

/// Bounds check shared by every transfer shape.
pub(crate) fn check_bounds(offset: usize, size: usize, slot_size: usize) -> HcrResult<()> {
    if offset.checked_add(size).map_or(true, |end| end > slot_size) {
        return Err(HcrError::OutOfRange {
            offset,
            size,
            slot_size,
        });
    }
    Ok(())
}

/// Copy `size` bytes between registered regions.
///
/// Whole-word fast path: an aligned 8-byte transfer is a single atomic
/// load/store pair, which is what keeps coordination-counter updates
/// untearable while a remote reader polls them.
///
/// # Safety
/// Both pointers must be valid for `size` bytes; the regions belong to
/// registered slots whose bounds were already checked.
pub(crate) unsafe fn transfer(dst: *mut u8, src: *const u8, size: usize) {
    use std::sync::atomic::{AtomicU64, Ordering};

    if size == 8 && (dst as usize) % 8 == 0 && (src as usize) % 8 == 0 {
        let value = (*(src as *const AtomicU64)).load(Ordering::Acquire);
        (*(dst as *const AtomicU64)).store(value, Ordering::Release);
        return;
    }
    std::ptr::copy(src, dst, size);
}

/// local↔local transfer body shared by both backends: every registered
/// region is load/store reachable here, so the shapes differ only in where
/// the destination's counter block lives.
pub(crate) fn copy_local_local(
    dst: &Arc<LocalMemorySlot>,
    dst_offset: usize,
    src: &Arc<LocalMemorySlot>,
    src_offset: usize,
    size: usize,
) -> HcrResult<()> {
    if size == 0 {
        return Err(HcrError::InvalidArgument("transfer of size zero".into()));
    }
    check_bounds(src_offset, size, src.size())?;
    check_bounds(dst_offset, size, dst.size())?;
    unsafe {
        transfer(
            dst.as_ptr().add(dst_offset),
            src.as_ptr().add(src_offset),
            size,
        )
    };
    src.counters().record_send();
    dst.counters().record_receive();
    Ok(())
}

/// One-sided put body: local source into a global slot's window.
pub(crate) fn copy_local_global(
    dst: &Arc<GlobalMemorySlot>,
    dst_offset: usize,
    src: &Arc<LocalMemorySlot>,
    src_offset: usize,
    size: usize,
) -> HcrResult<()> {
    if size == 0 {
        return Err(HcrError::InvalidArgument("transfer of size zero".into()));
    }
    check_bounds(src_offset, size, src.size())?;
    check_bounds(dst_offset, size, dst.size())?;
    unsafe {
        transfer(
            dst.window_ptr().add(dst_offset),
            src.as_ptr().add(src_offset),
            size,
        )
    };
    src.counters().record_send();
    dst.window_counters().record_receive();
    Ok(())
}

/// One-sided get body: global slot's window into a local destination.
pub(crate) fn copy_global_local(
    dst: &Arc<LocalMemorySlot>,
    dst_offset: usize,
    src: &Arc<GlobalMemorySlot>,
    src_offset: usize,
    size: usize,
) -> HcrResult<()> {
    if size == 0 {
        return Err(HcrError::InvalidArgument("transfer of size zero".into()));
    }
    check_bounds(src_offset, size, src.size())?;
    check_bounds(dst_offset, size, dst.size())?;
    unsafe {
        transfer(
            dst.as_ptr().add(dst_offset),
            src.window_ptr().add(src_offset),
            size,
        )
    };
    src.window_counters().record_send();
    dst.counters().record_receive();
    Ok(())
}

/// Wait until `slot`'s counters have advanced by the expected amounts over
/// the baselines consumed by previous slot fences, then consume them.
///
/// Baseline tracking keeps repeated `fence_slot(slot, 1, 0)` calls correct
/// even when the transfer completed before the fence was entered. Callers
/// are expected to fence a given slot from one thread at a time (channel
/// endpoints are single-threaded per role).
pub(crate) fn fence_slot_wait(
    slot: &Arc<LocalMemorySlot>,
    expected_sent: u64,
    expected_recv: u64,
) {
    let (base_sent, base_recv) = slot.fence_baselines();
    let mut k = 0u32;
    loop {
        let sent = slot.messages_sent();
        let recv = slot.messages_received();
        if sent.wrapping_sub(base_sent) >= expected_sent
            && recv.wrapping_sub(base_recv) >= expected_recv
        {
            break;
        }
        adaptive_yield(&mut k);
    }
    slot.consume_fenced(expected_sent, expected_recv);
}
