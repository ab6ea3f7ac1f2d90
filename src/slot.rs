// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Memory slots, the unit of registration for one-sided communication.
//
// A LocalMemorySlot is a registered region owned by one instance. Its
// counter block (messages sent/received plus the exclusive-lock word) is
// shared mutable state: peers increment the counters through one-sided
// transfers, so the block is all atomics and, for segment-backed slots,
// lives in the segment header where every mapper can reach it.
//
// A GlobalMemorySlot is a `(tag, key, owner)`-identified view of a slot
// reachable from any participant. An owned global slot holds a strong
// reference back to its source local slot; the local slot never references
// upward, so there is no cycle. Non-owner views carry no back-reference.

use std::alloc::Layout;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::error::{HcrError, HcrResult};
use crate::shm::ShmSegment;
use crate::spin_lock::adaptive_yield;
use crate::topology::MemorySpace;
use crate::{GlobalKey, InstanceId, Tag};

// ---------------------------------------------------------------------------
// SlotCounters — the shared counter block
// ---------------------------------------------------------------------------

/// Per-slot message counters and exclusive-lock word.
///
/// Padded to one cache line. A zero-filled block is valid initial state,
/// which lets segment-backed slots rely on the OS zeroing fresh segments.
#[repr(C)]
pub struct SlotCounters {
    sent: AtomicU64,
    recv: AtomicU64,
    lock: AtomicU32,
    _pad: [u8; 64 - 20],
}

const _: () = assert!(std::mem::size_of::<SlotCounters>() == 64);

/// Bytes reserved ahead of the payload in a segment-backed slot.
pub const SLOT_HEADER_SIZE: usize = std::mem::size_of::<SlotCounters>();

impl SlotCounters {
    pub(crate) fn new() -> Self {
        Self {
            sent: AtomicU64::new(0),
            recv: AtomicU64::new(0),
            lock: AtomicU32::new(0),
            _pad: [0; 64 - 20],
        }
    }

    /// Total messages sent from this slot (monotone).
    pub fn messages_sent(&self) -> u64 {
        self.sent.load(Ordering::Acquire)
    }

    /// Total messages received into this slot (monotone).
    pub fn messages_received(&self) -> u64 {
        self.recv.load(Ordering::Acquire)
    }

    pub(crate) fn record_send(&self) {
        self.sent.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn record_receive(&self) {
        self.recv.fetch_add(1, Ordering::AcqRel);
    }

    /// Acquire the slot's exclusive-lock word, spinning with backoff.
    /// Works across processes when the block lives in a mapped segment.
    pub(crate) fn lock_acquire(&self) {
        let mut k = 0u32;
        while self.lock.swap(1, Ordering::Acquire) != 0 {
            adaptive_yield(&mut k);
        }
    }

    pub(crate) fn lock_release(&self) {
        self.lock.store(0, Ordering::Release);
    }
}

/// Where a local slot's counter block lives.
enum CountersRef {
    /// Heap block owned by the slot (host-backend and registered slots).
    Inline(Box<SlotCounters>),
    /// Block at the head of the slot's shared segment.
    Mapped(*const SlotCounters),
}

/// How the slot's payload memory came to be.
enum Backing {
    /// Allocated by a memory manager; the slot owns and frees the memory.
    Owned { layout: Layout },
    /// Registered over caller-provided memory; the caller guarantees the
    /// pointer outlives the slot.
    Registered,
    /// Payload inside a named shared segment, after the counter header.
    Segment { segment: Arc<ShmSegment>, uid: u64 },
}

// ---------------------------------------------------------------------------
// LocalMemorySlot
// ---------------------------------------------------------------------------

/// A registered memory region owned by this instance.
pub struct LocalMemorySlot {
    ptr: *mut u8,
    size: usize,
    space: MemorySpace,
    counters: CountersRef,
    // Counter amounts already consumed by slot-scoped fences.
    fenced_sent: AtomicU64,
    fenced_recv: AtomicU64,
    backing: Backing,
}

// Safety: the region is shared across threads by design; payload access is
// coordinated by the runtime's counter/fence protocol, and the counter block
// itself is all atomics.
unsafe impl Send for LocalMemorySlot {}
unsafe impl Sync for LocalMemorySlot {}

impl LocalMemorySlot {
    pub(crate) fn new_owned(space: MemorySpace, ptr: *mut u8, layout: Layout) -> Arc<Self> {
        Arc::new(Self {
            ptr,
            size: layout.size(),
            space,
            counters: CountersRef::Inline(Box::new(SlotCounters::new())),
            fenced_sent: AtomicU64::new(0),
            fenced_recv: AtomicU64::new(0),
            backing: Backing::Owned { layout },
        })
    }

    pub(crate) fn new_registered(space: MemorySpace, ptr: *mut u8, size: usize) -> Arc<Self> {
        Arc::new(Self {
            ptr,
            size,
            space,
            counters: CountersRef::Inline(Box::new(SlotCounters::new())),
            fenced_sent: AtomicU64::new(0),
            fenced_recv: AtomicU64::new(0),
            backing: Backing::Registered,
        })
    }

    pub(crate) fn new_segment(space: MemorySpace, segment: Arc<ShmSegment>, uid: u64) -> Arc<Self> {
        let base = segment.as_mut_ptr();
        let size = segment.user_size() - SLOT_HEADER_SIZE;
        Arc::new(Self {
            ptr: unsafe { base.add(SLOT_HEADER_SIZE) },
            size,
            space,
            counters: CountersRef::Mapped(base as *const SlotCounters),
            fenced_sent: AtomicU64::new(0),
            fenced_recv: AtomicU64::new(0),
            backing: Backing::Segment { segment, uid },
        })
    }

    /// Base pointer of the registered region.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Size of the registered region in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The memory space this slot was created in.
    pub fn memory_space(&self) -> &MemorySpace {
        &self.space
    }

    /// The slot's counter block.
    pub fn counters(&self) -> &SlotCounters {
        match &self.counters {
            CountersRef::Inline(b) => b,
            CountersRef::Mapped(p) => unsafe { &**p },
        }
    }

    /// Messages sent from this slot, as visible now.
    pub fn messages_sent(&self) -> u64 {
        self.counters().messages_sent()
    }

    /// Messages received into this slot, as visible now.
    pub fn messages_received(&self) -> u64 {
        self.counters().messages_received()
    }

    /// Read an aligned 64-bit word from the slot's memory (local access, not
    /// a one-sided transfer). Used for coordination counters and size tokens.
    pub fn read_u64(&self, offset: usize) -> HcrResult<u64> {
        self.check_word(offset)?;
        let cell = unsafe { &*(self.ptr.add(offset) as *const AtomicU64) };
        Ok(cell.load(Ordering::Acquire))
    }

    /// Write an aligned 64-bit word into the slot's memory (local access).
    pub fn write_u64(&self, offset: usize, value: u64) -> HcrResult<()> {
        self.check_word(offset)?;
        let cell = unsafe { &*(self.ptr.add(offset) as *const AtomicU64) };
        cell.store(value, Ordering::Release);
        Ok(())
    }

    fn check_word(&self, offset: usize) -> HcrResult<()> {
        if offset + 8 > self.size {
            return Err(HcrError::OutOfRange {
                offset,
                size: 8,
                slot_size: self.size,
            });
        }
        if (self.ptr as usize + offset) % 8 != 0 {
            return Err(HcrError::InvalidArgument(format!(
                "word access at offset {offset} is not 8-byte aligned"
            )));
        }
        Ok(())
    }

    pub(crate) fn fence_baselines(&self) -> (u64, u64) {
        (
            self.fenced_sent.load(Ordering::Acquire),
            self.fenced_recv.load(Ordering::Acquire),
        )
    }

    pub(crate) fn consume_fenced(&self, sent: u64, recv: u64) {
        self.fenced_sent.fetch_add(sent, Ordering::AcqRel);
        self.fenced_recv.fetch_add(recv, Ordering::AcqRel);
    }

    /// Whether the slot owns its memory (created by `allocate`).
    pub(crate) fn is_allocated(&self) -> bool {
        matches!(
            self.backing,
            Backing::Owned { .. } | Backing::Segment { .. }
        )
    }

    /// Whether the slot borrows caller memory (created by `register`).
    pub(crate) fn is_registered(&self) -> bool {
        matches!(self.backing, Backing::Registered)
    }

    /// Segment backing, when this slot lives in a named shared segment.
    pub(crate) fn segment_backing(&self) -> Option<(&Arc<ShmSegment>, u64)> {
        match &self.backing {
            Backing::Segment { segment, uid } => Some((segment, *uid)),
            _ => None,
        }
    }
}

impl Drop for LocalMemorySlot {
    fn drop(&mut self) {
        if let Backing::Owned { layout } = &self.backing {
            unsafe { std::alloc::dealloc(self.ptr, *layout) };
        }
        // Registered memory belongs to the caller; segment memory is
        // released by the ShmSegment's own ref-counted drop.
    }
}

impl std::fmt::Debug for LocalMemorySlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMemorySlot")
            .field("size", &self.size)
            .field("space", &self.space.kind())
            .field("sent", &self.messages_sent())
            .field("recv", &self.messages_received())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// GlobalMemorySlot
// ---------------------------------------------------------------------------

/// Backend-private view of the remote (or owned) memory behind a global
/// slot.
pub(crate) enum Window {
    /// Same address space: the owner's local slot, shared directly.
    Host {
        slot: Arc<LocalMemorySlot>,
        token: u64,
    },
    /// Mapped named segment; payload follows the counter header.
    Segment { segment: Arc<ShmSegment>, uid: u64 },
}

/// A tagged, key-identified, cluster-visible view of a memory region.
pub struct GlobalMemorySlot {
    owner: InstanceId,
    tag: Tag,
    key: GlobalKey,
    size: usize,
    local: Option<Arc<LocalMemorySlot>>,
    window: Window,
}

unsafe impl Send for GlobalMemorySlot {}
unsafe impl Sync for GlobalMemorySlot {}

impl GlobalMemorySlot {
    pub(crate) fn new(
        owner: InstanceId,
        tag: Tag,
        key: GlobalKey,
        size: usize,
        local: Option<Arc<LocalMemorySlot>>,
        window: Window,
    ) -> Arc<Self> {
        Arc::new(Self {
            owner,
            tag,
            key,
            size,
            local,
            window,
        })
    }

    /// Instance that contributed the underlying memory.
    pub fn owner(&self) -> InstanceId {
        self.owner
    }

    /// Exchange tag (immutable for the slot's lifetime).
    pub fn tag(&self) -> Tag {
        self.tag
    }

    /// Global key within the tag (immutable).
    pub fn key(&self) -> GlobalKey {
        self.key
    }

    /// Size of the viewed region in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The originating local slot; `Some` iff this instance is the owner.
    pub fn source_local_memory_slot(&self) -> Option<&Arc<LocalMemorySlot>> {
        self.local.as_ref()
    }

    pub(crate) fn window(&self) -> &Window {
        &self.window
    }

    /// Base pointer of the viewed payload.
    pub(crate) fn window_ptr(&self) -> *mut u8 {
        match &self.window {
            Window::Host { slot, .. } => slot.as_ptr(),
            Window::Segment { segment, .. } => unsafe {
                segment.as_mut_ptr().add(SLOT_HEADER_SIZE)
            },
        }
    }

    /// The counter block every participant's transfers update.
    pub(crate) fn window_counters(&self) -> &SlotCounters {
        match &self.window {
            Window::Host { slot, .. } => slot.counters(),
            Window::Segment { segment, .. } => unsafe {
                &*(segment.as_mut_ptr() as *const SlotCounters)
            },
        }
    }
}

impl std::fmt::Debug for GlobalMemorySlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalMemorySlot")
            .field("owner", &self.owner)
            .field("tag", &self.tag)
            .field("key", &self.key)
            .field("size", &self.size)
            .field("owned", &self.local.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Wire form
// ---------------------------------------------------------------------------

/// Size of a serialized global-slot descriptor.
pub const GLOBAL_SLOT_WIRE_SIZE: usize = 48;

pub(crate) const BACKEND_HOST: u64 = 0;
pub(crate) const BACKEND_SHM: u64 = 1;

/// Fixed-size wire form of a global slot, safe to memcpy through any
/// channel. `token` is backend-private: the host backend's fabric registry
/// key, or the shm backend's slot uid from which the segment name is
/// rebuilt.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub(crate) struct SlotWire {
    pub backend: u64,
    pub owner: u64,
    pub tag: u64,
    pub key: u64,
    pub size: u64,
    pub token: u64,
}

const _: () = assert!(std::mem::size_of::<SlotWire>() == GLOBAL_SLOT_WIRE_SIZE);

impl SlotWire {
    pub(crate) fn to_bytes(self) -> [u8; GLOBAL_SLOT_WIRE_SIZE] {
        let mut out = [0u8; GLOBAL_SLOT_WIRE_SIZE];
        out.copy_from_slice(bytemuck::bytes_of(&self));
        out
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> HcrResult<Self> {
        if bytes.len() != GLOBAL_SLOT_WIRE_SIZE {
            return Err(HcrError::InvalidArgument(format!(
                "serialized global slot must be {GLOBAL_SLOT_WIRE_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        let mut wire = SlotWire::zeroed();
        bytemuck::bytes_of_mut(&mut wire).copy_from_slice(bytes);
        Ok(wire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let c = SlotCounters::new();
        assert_eq!(c.messages_sent(), 0);
        assert_eq!(c.messages_received(), 0);
        c.record_send();
        c.record_receive();
        c.record_receive();
        assert_eq!(c.messages_sent(), 1);
        assert_eq!(c.messages_received(), 2);
    }

    #[test]
    fn wire_round_trip() {
        let w = SlotWire {
            backend: BACKEND_SHM,
            owner: 3,
            tag: 7,
            key: 42,
            size: 4096,
            token: 19,
        };
        let bytes = w.to_bytes();
        let back = SlotWire::from_bytes(&bytes).unwrap();
        assert_eq!(back, w);
        assert_eq!(back.to_bytes(), bytes);
    }

    #[test]
    fn wire_rejects_short_input() {
        assert!(SlotWire::from_bytes(&[0u8; 12]).is_err());
    }
}
