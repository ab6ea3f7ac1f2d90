// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Shared-memory backend: participants may be separate processes (or
// threads) identified by `(prefix, instance_id)`. Every allocated slot is
// its own named segment with a counter header ahead of the payload, so any
// peer that maps the segment can transfer into it and bump its counters.
//
// Collectives go through one registry segment per tag:
//
//   [ XchgHeader: lock word, poison flag, entry count, barrier words ]
//   [ XchgEntry ] × XCHG_MAX_ENTRIES
//
// Depositors append `(owner, key, size, uid)` entries under the header
// lock; a sense-reversing barrier separates the deposit and build phases;
// builders map each peer segment by its reconstructed name. The segment
// is zero-filled at creation, which is a valid empty table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, trace};

use crate::communication::{
    copy_global_local, copy_local_global, copy_local_local, fence_slot_wait,
    CommunicationManager, SlotRegistry,
};
use crate::error::{HcrError, HcrResult};
use crate::memory::MemoryManager;
use crate::shm::{SegmentMode, ShmSegment};
use crate::slot::{
    GlobalMemorySlot, LocalMemorySlot, SlotWire, Window, BACKEND_SHM, GLOBAL_SLOT_WIRE_SIZE,
    SLOT_HEADER_SIZE,
};
use crate::spin_lock::{adaptive_yield, SpinLock};
use crate::topology::MemorySpace;
use crate::{GlobalKey, InstanceId, Tag};

// ---------------------------------------------------------------------------
// Segment naming
// ---------------------------------------------------------------------------

fn slot_segment_name(prefix: &str, owner: InstanceId, uid: u64) -> String {
    format!("{prefix}_s{owner:x}_{uid:x}")
}

fn registry_segment_name(prefix: &str, tag: Tag) -> String {
    format!("{prefix}_x{tag:x}")
}

// ---------------------------------------------------------------------------
// Exchange registry segment layout
// ---------------------------------------------------------------------------

/// Fixed capacity of a tag's exchange table.
const XCHG_MAX_ENTRIES: usize = 64;

#[repr(C)]
#[derive(Clone, Copy)]
struct XchgEntry {
    owner: u64,
    key: u64,
    size: u64,
    uid: u64,
}

#[repr(C)]
struct XchgHeader {
    /// Protects `entry_count` and the entry table during deposits.
    lock: SpinLock,
    /// Non-zero once a duplicate key or table overflow was detected; the
    /// whole tag is then failed on every participant.
    poisoned: AtomicU32,
    entry_count: AtomicU32,
    barrier_arrived: AtomicU32,
    barrier_sense: AtomicU32,
    poisoned_key: AtomicU64,
}

const _: () = assert!(std::mem::size_of::<XchgHeader>() == 32);

/// Total user size of a registry segment.
const REGISTRY_SEGMENT_SIZE: usize =
    std::mem::size_of::<XchgHeader>() + XCHG_MAX_ENTRIES * std::mem::size_of::<XchgEntry>();

fn registry_header(segment: &ShmSegment) -> &XchgHeader {
    unsafe { &*(segment.as_mut_ptr() as *const XchgHeader) }
}

unsafe fn registry_entry(segment: &ShmSegment, index: usize) -> *mut XchgEntry {
    let base = segment.as_mut_ptr().add(std::mem::size_of::<XchgHeader>());
    (base as *mut XchgEntry).add(index)
}

// ---------------------------------------------------------------------------
// ShmMemoryManager
// ---------------------------------------------------------------------------

/// Memory manager placing every allocated slot in its own named segment.
pub struct ShmMemoryManager {
    prefix: String,
    instance: InstanceId,
    next_uid: AtomicU64,
}

impl ShmMemoryManager {
    pub fn new(prefix: &str, instance_id: InstanceId) -> Self {
        // Uids embed the process id so restarted instances never collide
        // with segments a previous run left behind.
        let seed = (std::process::id() as u64) << 32;
        Self {
            prefix: prefix.to_string(),
            instance: instance_id,
            next_uid: AtomicU64::new(seed),
        }
    }
}

impl MemoryManager for ShmMemoryManager {
    fn allocate_local_memory_slot(
        &self,
        space: &MemorySpace,
        size: usize,
    ) -> HcrResult<Arc<LocalMemorySlot>> {
        if size == 0 {
            return Err(HcrError::InvalidArgument("allocation of size zero".into()));
        }
        if space.kind() != "shm" {
            return Err(HcrError::InvalidArgument(format!(
                "shm memory manager cannot allocate in a '{}' space",
                space.kind()
            )));
        }
        let uid = self.next_uid.fetch_add(1, Ordering::Relaxed);
        let name = slot_segment_name(&self.prefix, self.instance, uid);
        let segment = ShmSegment::acquire(&name, SLOT_HEADER_SIZE + size, SegmentMode::Create)?;
        trace!("shm[{}]: allocated slot segment {name} ({size} bytes)", self.instance);
        Ok(LocalMemorySlot::new_segment(space.clone(), segment, uid))
    }

    fn register_local_memory_slot(
        &self,
        space: &MemorySpace,
        ptr: *mut u8,
        size: usize,
    ) -> HcrResult<Arc<LocalMemorySlot>> {
        if ptr.is_null() {
            return Err(HcrError::InvalidArgument("null pointer".into()));
        }
        if size == 0 {
            return Err(HcrError::InvalidArgument("registration of size zero".into()));
        }
        // Registered memory lives outside any named segment; peers cannot
        // reach it, so such slots are local-transfer only (exchange and
        // promotion refuse them).
        Ok(LocalMemorySlot::new_registered(space.clone(), ptr, size))
    }
}

// ---------------------------------------------------------------------------
// ShmCommunicationManager
// ---------------------------------------------------------------------------

/// One participant's communication manager over named shared memory.
pub struct ShmCommunicationManager {
    prefix: String,
    instance: InstanceId,
    instance_count: usize,
    registry: SlotRegistry,
    /// Mapped registry segments, one per tag touched so far.
    tag_segments: Mutex<HashMap<Tag, Arc<ShmSegment>>>,
    /// Local barrier sense per tag (sense-reversing barrier).
    senses: Mutex<HashMap<Tag, bool>>,
    /// Entries already materialized per tag, so repeated exchanges on one
    /// tag only build the new rows.
    built: Mutex<HashMap<Tag, usize>>,
}

impl ShmCommunicationManager {
    pub fn new(prefix: &str, instance_id: InstanceId, instance_count: usize) -> HcrResult<Self> {
        if instance_count == 0 {
            return Err(HcrError::InvalidArgument(
                "a group needs at least one participant".into(),
            ));
        }
        if instance_id as usize >= instance_count {
            return Err(HcrError::InvalidArgument(format!(
                "instance id {instance_id} out of range for {instance_count} participants"
            )));
        }
        if prefix.is_empty() {
            return Err(HcrError::InvalidArgument("empty segment prefix".into()));
        }
        Ok(Self {
            prefix: prefix.to_string(),
            instance: instance_id,
            instance_count,
            registry: SlotRegistry::new(),
            tag_segments: Mutex::new(HashMap::new()),
            senses: Mutex::new(HashMap::new()),
            built: Mutex::new(HashMap::new()),
        })
    }

    fn tag_segment(&self, tag: Tag) -> HcrResult<Arc<ShmSegment>> {
        let mut segments = self.tag_segments.lock().unwrap();
        if let Some(seg) = segments.get(&tag) {
            return Ok(Arc::clone(seg));
        }
        let name = registry_segment_name(&self.prefix, tag);
        let seg = ShmSegment::acquire(&name, REGISTRY_SEGMENT_SIZE, SegmentMode::CreateOrOpen)?;
        segments.insert(tag, Arc::clone(&seg));
        Ok(seg)
    }

    /// Sense-reversing barrier over the tag's registry segment. Works for
    /// threads and processes alike; all participants must have joined the
    /// group before the first barrier on a tag.
    fn barrier(&self, tag: Tag) -> HcrResult<()> {
        let segment = self.tag_segment(tag)?;
        let hdr = registry_header(&segment);

        let target = {
            let mut senses = self.senses.lock().unwrap();
            let sense = senses.entry(tag).or_insert(false);
            *sense = !*sense;
            *sense as u32
        };

        let arrived = hdr.barrier_arrived.fetch_add(1, Ordering::AcqRel) + 1;
        if arrived == self.instance_count as u32 {
            hdr.barrier_arrived.store(0, Ordering::Relaxed);
            hdr.barrier_sense.store(target, Ordering::Release);
        } else {
            let mut k = 0u32;
            while hdr.barrier_sense.load(Ordering::Acquire) != target {
                adaptive_yield(&mut k);
            }
        }
        Ok(())
    }
}

impl CommunicationManager for ShmCommunicationManager {
    fn instance_id(&self) -> InstanceId {
        self.instance
    }

    fn instance_count(&self) -> usize {
        self.instance_count
    }

    fn exchange_global_memory_slots(
        &self,
        tag: Tag,
        slots: &[(GlobalKey, Arc<LocalMemorySlot>)],
    ) -> HcrResult<()> {
        let segment = self.tag_segment(tag)?;
        let hdr = registry_header(&segment);
        debug!(
            "shm[{}]: exchange tag {tag}, {} contributions",
            self.instance,
            slots.len()
        );

        // Keep local slot handles so owned rows can reuse the same mapping.
        let mut contributed: HashMap<u64, Arc<LocalMemorySlot>> = HashMap::new();
        let mut local_error: Option<HcrError> = None;

        // Deposit phase, under the table lock. Errors poison the tag (or
        // are remembered locally) but never skip the barrier, so no peer is
        // left waiting.
        hdr.lock.lock();
        for (key, slot) in slots {
            let Some((_, uid)) = slot.segment_backing() else {
                local_error = Some(HcrError::Unsupported(
                    "shm backend cannot exchange registered (non-segment) memory",
                ));
                continue;
            };
            let count = hdr.entry_count.load(Ordering::Relaxed) as usize;
            let duplicate = (0..count)
                .any(|i| unsafe { (*registry_entry(&segment, i)).key == *key });
            if duplicate {
                hdr.poisoned_key.store(*key, Ordering::Relaxed);
                hdr.poisoned.store(1, Ordering::Release);
                continue;
            }
            if count == XCHG_MAX_ENTRIES {
                hdr.poisoned_key.store(*key, Ordering::Relaxed);
                hdr.poisoned.store(2, Ordering::Release);
                continue;
            }
            unsafe {
                *registry_entry(&segment, count) = XchgEntry {
                    owner: self.instance,
                    key: *key,
                    size: slot.size() as u64,
                    uid,
                };
            }
            hdr.entry_count.store(count as u32 + 1, Ordering::Release);
            contributed.insert(uid, Arc::clone(slot));
        }
        hdr.lock.unlock();

        // The implicit internal fence of the exchange.
        self.barrier(tag)?;

        if let Some(e) = local_error {
            return Err(e);
        }
        match hdr.poisoned.load(Ordering::Acquire) {
            0 => {}
            1 => {
                return Err(HcrError::DuplicateKey {
                    tag,
                    key: hdr.poisoned_key.load(Ordering::Relaxed),
                })
            }
            _ => {
                return Err(HcrError::BackendFailure(format!(
                    "exchange table for tag {tag} overflowed ({XCHG_MAX_ENTRIES} entries)"
                )))
            }
        }

        // Build phase: materialize the rows added since our last exchange
        // on this tag.
        let count = hdr.entry_count.load(Ordering::Acquire) as usize;
        let start = {
            let built = self.built.lock().unwrap();
            built.get(&tag).copied().unwrap_or(0)
        };
        for i in start..count {
            let entry = unsafe { *registry_entry(&segment, i) };
            let (local, window_segment) = match contributed.get(&entry.uid) {
                Some(slot) if entry.owner == self.instance => {
                    let (seg, _) = slot.segment_backing().ok_or_else(|| {
                        HcrError::BackendFailure("contributed slot lost its segment".into())
                    })?;
                    (Some(Arc::clone(slot)), Arc::clone(seg))
                }
                _ => {
                    let name = slot_segment_name(&self.prefix, entry.owner, entry.uid);
                    let seg = ShmSegment::acquire(
                        &name,
                        SLOT_HEADER_SIZE + entry.size as usize,
                        SegmentMode::Open,
                    )?;
                    (None, seg)
                }
            };
            let global = GlobalMemorySlot::new(
                entry.owner,
                tag,
                entry.key,
                entry.size as usize,
                local,
                Window::Segment {
                    segment: window_segment,
                    uid: entry.uid,
                },
            );
            self.registry.insert(tag, entry.key, global)?;
        }
        self.built.lock().unwrap().insert(tag, count);
        Ok(())
    }

    fn get_global_memory_slot(
        &self,
        tag: Tag,
        key: GlobalKey,
    ) -> HcrResult<Arc<GlobalMemorySlot>> {
        self.registry.lookup(tag, key)
    }

    fn memcpy(
        &self,
        dst: &Arc<LocalMemorySlot>,
        dst_offset: usize,
        src: &Arc<LocalMemorySlot>,
        src_offset: usize,
        size: usize,
    ) -> HcrResult<()> {
        copy_local_local(dst, dst_offset, src, src_offset, size)
    }

    fn put(
        &self,
        dst: &Arc<GlobalMemorySlot>,
        dst_offset: usize,
        src: &Arc<LocalMemorySlot>,
        src_offset: usize,
        size: usize,
    ) -> HcrResult<()> {
        copy_local_global(dst, dst_offset, src, src_offset, size)
    }

    fn get(
        &self,
        dst: &Arc<LocalMemorySlot>,
        dst_offset: usize,
        src: &Arc<GlobalMemorySlot>,
        src_offset: usize,
        size: usize,
    ) -> HcrResult<()> {
        copy_global_local(dst, dst_offset, src, src_offset, size)
    }

    fn fence(&self, tag: Tag) -> HcrResult<()> {
        trace!("shm[{}]: fence tag {tag}", self.instance);
        self.barrier(tag)
    }

    fn fence_slot(
        &self,
        slot: &Arc<LocalMemorySlot>,
        expected_sent: u64,
        expected_recv: u64,
    ) -> HcrResult<()> {
        fence_slot_wait(slot, expected_sent, expected_recv);
        Ok(())
    }

    fn query_memory_slot_updates(&self, _slot: &Arc<LocalMemorySlot>) -> HcrResult<()> {
        // Counters live in the mapped segment header; reads are current.
        Ok(())
    }

    fn acquire_global_lock(&self, slot: &Arc<GlobalMemorySlot>) -> HcrResult<bool> {
        slot.window_counters().lock_acquire();
        trace!("shm[{}]: lock {}:{}", self.instance, slot.tag(), slot.key());
        Ok(true)
    }

    fn release_global_lock(&self, slot: &Arc<GlobalMemorySlot>) -> HcrResult<()> {
        slot.window_counters().lock_release();
        Ok(())
    }

    fn promote_local_memory_slot(
        &self,
        slot: &Arc<LocalMemorySlot>,
        tag: Tag,
    ) -> HcrResult<Arc<GlobalMemorySlot>> {
        let Some((segment, uid)) = slot.segment_backing() else {
            return Err(HcrError::Unsupported(
                "shm backend cannot promote registered (non-segment) memory",
            ));
        };
        Ok(GlobalMemorySlot::new(
            self.instance,
            tag,
            uid,
            slot.size(),
            Some(Arc::clone(slot)),
            Window::Segment {
                segment: Arc::clone(segment),
                uid,
            },
        ))
    }

    fn destroy_promoted_global_memory_slot(
        &self,
        _slot: &Arc<GlobalMemorySlot>,
    ) -> HcrResult<()> {
        // Dropping the view releases the mapping; the segment itself is
        // unlinked by its last mapper's ref-counted drop.
        Ok(())
    }

    fn serialize_global_memory_slot(
        &self,
        slot: &Arc<GlobalMemorySlot>,
    ) -> HcrResult<[u8; GLOBAL_SLOT_WIRE_SIZE]> {
        match slot.window() {
            Window::Segment { uid, .. } => Ok(SlotWire {
                backend: BACKEND_SHM,
                owner: slot.owner(),
                tag: slot.tag(),
                key: slot.key(),
                size: slot.size() as u64,
                token: *uid,
            }
            .to_bytes()),
            Window::Host { .. } => Err(HcrError::Unsupported(
                "shm backend cannot serialize a host-window slot",
            )),
        }
    }

    fn deserialize_global_memory_slot(
        &self,
        bytes: &[u8],
        tag: Tag,
    ) -> HcrResult<Arc<GlobalMemorySlot>> {
        let wire = SlotWire::from_bytes(bytes)?;
        if wire.backend != BACKEND_SHM {
            return Err(HcrError::InvalidArgument(
                "serialized slot comes from a different backend".into(),
            ));
        }
        let name = slot_segment_name(&self.prefix, wire.owner, wire.token);
        let segment = ShmSegment::acquire(
            &name,
            SLOT_HEADER_SIZE + wire.size as usize,
            SegmentMode::Open,
        )?;
        // A deserialized slot is a non-owning reconstruction: no local
        // back-reference even on the owning instance.
        Ok(GlobalMemorySlot::new(
            wire.owner,
            tag,
            wire.key,
            wire.size as usize,
            None,
            Window::Segment {
                segment,
                uid: wire.token,
            },
        ))
    }

    fn deregister_global_memory_slot(&self, slot: &Arc<GlobalMemorySlot>) -> HcrResult<()> {
        self.registry.remove(slot.tag(), slot.key());
        Ok(())
    }

    fn destroy_global_memory_slot(&self, slot: &Arc<GlobalMemorySlot>) -> HcrResult<()> {
        self.registry.remove(slot.tag(), slot.key());
        Ok(())
    }
}
