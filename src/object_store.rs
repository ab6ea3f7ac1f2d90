// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Distributed object store: content-addressed data objects whose handles
// travel through channels as small PODs. An owner registers a block,
// publishes it (non-collective promotion to a global slot), and sends the
// serialized handle to whoever should read it. Readers deserialize, `get`
// (a lazy one-sided fetch into a local cache slot) and fence before
// touching the bytes. Deliberately message-passing: no collective ever
// runs under the store's tag except the optional store-wide fence.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytemuck::{Pod, Zeroable};
use log::{debug, trace};

use crate::communication::CommunicationManager;
use crate::error::{HcrError, HcrResult};
use crate::memory::MemoryManager;
use crate::slot::{GlobalMemorySlot, LocalMemorySlot, GLOBAL_SLOT_WIRE_SIZE};
use crate::topology::MemorySpace;
use crate::{InstanceId, Tag};

// ---------------------------------------------------------------------------
// Handle — the wire form
// ---------------------------------------------------------------------------

/// Serialized data-object descriptor: trivially copyable, fixed size, safe
/// to push through any channel or memcpy.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct Handle {
    pub instance_id: u64,
    pub block_id: u32,
    reserved: u32,
    pub size: u64,
    pub slot_wire: [u8; GLOBAL_SLOT_WIRE_SIZE],
}

/// Size of a serialized handle in bytes.
pub const HANDLE_SIZE: usize = std::mem::size_of::<Handle>();

const _: () = assert!(HANDLE_SIZE == 72);

impl Handle {
    pub fn to_bytes(self) -> [u8; HANDLE_SIZE] {
        let mut out = [0u8; HANDLE_SIZE];
        out.copy_from_slice(bytemuck::bytes_of(&self));
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> HcrResult<Self> {
        if bytes.len() != HANDLE_SIZE {
            return Err(HcrError::InvalidArgument(format!(
                "handle must be {HANDLE_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(bytemuck::pod_read_unaligned(bytes))
    }
}

// ---------------------------------------------------------------------------
// DataObject
// ---------------------------------------------------------------------------

/// Compound object key: `(instance_id << 32) | block_id`, unique across
/// the cluster.
pub fn object_id(owner: InstanceId, block_id: u32) -> u64 {
    (owner << 32) | block_id as u64
}

struct ObjectState {
    local: Option<Arc<LocalMemorySlot>>,
    global: Option<Arc<GlobalMemorySlot>>,
    fetch_in_flight: bool,
}

/// A block registered with (or deserialized into) an object store.
pub struct DataObject {
    owner: InstanceId,
    block_id: u32,
    size: usize,
    state: Mutex<ObjectState>,
}

impl DataObject {
    fn new(
        owner: InstanceId,
        block_id: u32,
        size: usize,
        local: Option<Arc<LocalMemorySlot>>,
        global: Option<Arc<GlobalMemorySlot>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            owner,
            block_id,
            size,
            state: Mutex::new(ObjectState {
                local,
                global,
                fetch_in_flight: false,
            }),
        })
    }

    pub fn owner(&self) -> InstanceId {
        self.owner
    }

    pub fn block_id(&self) -> u32 {
        self.block_id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// The compound cluster-unique key.
    pub fn object_id(&self) -> u64 {
        object_id(self.owner, self.block_id)
    }

    /// The object's local slot: the registered block on the owner, the
    /// cache slot (after the first `get`) elsewhere.
    pub fn local_memory_slot(&self) -> Option<Arc<LocalMemorySlot>> {
        self.state.lock().unwrap().local.clone()
    }

    /// The object's global slot, present once published or deserialized.
    pub fn global_memory_slot(&self) -> Option<Arc<GlobalMemorySlot>> {
        self.state.lock().unwrap().global.clone()
    }
}

// ---------------------------------------------------------------------------
// ObjectStore
// ---------------------------------------------------------------------------

/// Per-instance object store over one communication manager and tag.
pub struct ObjectStore {
    comm: Arc<dyn CommunicationManager>,
    memory: Arc<dyn MemoryManager>,
    space: MemorySpace,
    tag: Tag,
    instance: InstanceId,
    objects: Mutex<HashMap<u64, Arc<DataObject>>>,
}

impl ObjectStore {
    pub fn new(
        comm: Arc<dyn CommunicationManager>,
        memory: Arc<dyn MemoryManager>,
        space: MemorySpace,
        tag: Tag,
    ) -> Self {
        let instance = comm.instance_id();
        Self {
            comm,
            memory,
            space,
            tag,
            instance,
            objects: Mutex::new(HashMap::new()),
        }
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance
    }

    /// Register caller-owned memory as a block of this instance. No RMA
    /// state yet; `publish` creates it.
    pub fn create_object(
        &self,
        ptr: *mut u8,
        size: usize,
        block_id: u32,
    ) -> HcrResult<Arc<DataObject>> {
        let slot = self.memory.register_local_memory_slot(&self.space, ptr, size)?;
        self.adopt(slot, block_id)
    }

    /// Adopt an existing local slot as a block of this instance. On
    /// backends where peers can only reach allocated (segment) memory,
    /// this is the publishable path.
    pub fn create_object_from_slot(
        &self,
        slot: Arc<LocalMemorySlot>,
        block_id: u32,
    ) -> HcrResult<Arc<DataObject>> {
        self.adopt(slot, block_id)
    }

    fn adopt(&self, slot: Arc<LocalMemorySlot>, block_id: u32) -> HcrResult<Arc<DataObject>> {
        let size = slot.size();
        let object = DataObject::new(self.instance, block_id, size, Some(slot), None);
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(&object.object_id()) {
            return Err(HcrError::InvalidArgument(format!(
                "block {block_id} already exists in this store"
            )));
        }
        objects.insert(object.object_id(), Arc::clone(&object));
        Ok(object)
    }

    /// Promote the object's block to a global slot under the store's tag.
    pub fn publish(&self, object: &Arc<DataObject>) -> HcrResult<()> {
        if object.owner != self.instance {
            return Err(HcrError::InvalidArgument(
                "only the owning instance can publish an object".into(),
            ));
        }
        let mut state = object.state.lock().unwrap();
        if state.global.is_some() {
            return Err(HcrError::InvalidArgument(format!(
                "block {} is already published",
                object.block_id
            )));
        }
        let local = state.local.clone().ok_or_else(|| {
            HcrError::InvalidArgument("object has no local slot to publish".into())
        })?;
        let global = self.comm.promote_local_memory_slot(&local, self.tag)?;
        debug!(
            "store[{}]: published block {} ({} bytes)",
            self.instance,
            object.block_id,
            object.size
        );
        state.global = Some(global);
        Ok(())
    }

    /// Produce the trivially copyable wire descriptor of a published
    /// object.
    pub fn serialize(&self, object: &Arc<DataObject>) -> HcrResult<Handle> {
        let state = object.state.lock().unwrap();
        let global = state.global.as_ref().ok_or_else(|| {
            HcrError::InvalidArgument("object must be published before serialization".into())
        })?;
        let slot_wire = self.comm.serialize_global_memory_slot(global)?;
        Ok(Handle {
            instance_id: object.owner,
            block_id: object.block_id,
            reserved: 0,
            size: object.size as u64,
            slot_wire,
        })
    }

    /// Reconstruct a non-owning object from a peer's handle. The local
    /// slot stays empty until the first `get`.
    pub fn deserialize(&self, handle: &Handle) -> HcrResult<Arc<DataObject>> {
        let global = self
            .comm
            .deserialize_global_memory_slot(&handle.slot_wire, self.tag)?;
        let object = DataObject::new(
            handle.instance_id,
            handle.block_id,
            handle.size as usize,
            None,
            Some(global),
        );
        self.objects
            .lock()
            .unwrap()
            .insert(object.object_id(), Arc::clone(&object));
        Ok(object)
    }

    /// Access the object's bytes.
    ///
    /// The owner gets its registered block directly. A reader lazily
    /// allocates a cache slot on the first call and posts at most one
    /// one-sided fetch per fence interval; concurrent calls coalesce onto
    /// the same slot and transfer. The returned slot's contents are
    /// undefined until a following [`fence_object`] or [`fence`].
    ///
    /// [`fence_object`]: ObjectStore::fence_object
    /// [`fence`]: ObjectStore::fence
    pub fn get(&self, object: &Arc<DataObject>) -> HcrResult<Arc<LocalMemorySlot>> {
        let mut state = object.state.lock().unwrap();

        if object.owner == self.instance {
            return state.local.clone().ok_or_else(|| {
                HcrError::InvalidArgument("owned object has no local slot".into())
            });
        }

        if state.local.is_none() {
            let cache = self
                .memory
                .allocate_local_memory_slot(&self.space, object.size)?;
            state.local = Some(cache);
        }
        let cache = state.local.clone().ok_or_else(|| {
            HcrError::BackendFailure("cache slot vanished".into())
        })?;

        if !state.fetch_in_flight {
            let global = state.global.clone().ok_or_else(|| {
                HcrError::InvalidArgument(
                    "object has no global slot; deserialize a published handle first".into(),
                )
            })?;
            trace!(
                "store[{}]: fetching block {}:{} ({} bytes)",
                self.instance,
                object.owner,
                object.block_id,
                object.size
            );
            self.comm.get(&cache, 0, &global, 0, object.size)?;
            state.fetch_in_flight = true;
        }
        Ok(cache)
    }

    /// One-sided completion: wait until the object's cache slot has seen
    /// its fetch arrive. A no-op on the owner or when no fetch is pending.
    pub fn fence_object(&self, object: &Arc<DataObject>) -> HcrResult<()> {
        let cache = {
            let mut state = object.state.lock().unwrap();
            if object.owner == self.instance || !state.fetch_in_flight {
                return Ok(());
            }
            state.fetch_in_flight = false;
            state.local.clone()
        };
        match cache {
            Some(cache) => self.comm.fence_slot(&cache, 0, 1),
            None => Ok(()),
        }
    }

    /// Collective completion of every outstanding transfer under the
    /// store's tag.
    pub fn fence(&self) -> HcrResult<()> {
        self.comm.fence(self.tag)?;
        let objects = self.objects.lock().unwrap();
        for object in objects.values() {
            object.state.lock().unwrap().fetch_in_flight = false;
        }
        Ok(())
    }

    /// Tear the object down: release the reader cache, destroy the global
    /// slot, drop the store entry. The application fences the tag first
    /// when peers may still be reading.
    pub fn destroy(&self, object: &Arc<DataObject>) -> HcrResult<()> {
        let (local, global) = {
            let mut state = object.state.lock().unwrap();
            (state.local.take(), state.global.take())
        };
        if let Some(global) = global {
            self.comm.destroy_promoted_global_memory_slot(&global)?;
        }
        if let Some(local) = local {
            if object.owner != self.instance {
                // Reader cache slots were allocated by the store.
                self.memory.free_local_memory_slot(local)?;
            }
        }
        self.objects.lock().unwrap().remove(&object.object_id());
        Ok(())
    }
}
