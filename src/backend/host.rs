// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Host backend: the participants are threads of a single process, one
// communication manager each, all sharing a `HostFabric`. A global slot's
// window is simply a shared handle to the owner's local slot, transfers
// are direct copies with the word-atomic fast path, and collectives meet
// at in-process generation barriers.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use log::{debug, trace};
use slab::Slab;

use crate::communication::{
    copy_global_local, copy_local_global, copy_local_local, fence_slot_wait,
    CommunicationManager, SlotRegistry,
};
use crate::error::{HcrError, HcrResult};
use crate::memory::{BindingPolicy, MemoryManager};
use crate::slot::{
    GlobalMemorySlot, LocalMemorySlot, SlotWire, Window, BACKEND_HOST, GLOBAL_SLOT_WIRE_SIZE,
};
use crate::topology::MemorySpace;
use crate::{GlobalKey, InstanceId, Tag};

// ---------------------------------------------------------------------------
// Generation barrier
// ---------------------------------------------------------------------------

/// Reusable barrier: the generation counter lets successive collectives on
/// the same tag reuse one instance without a reset race.
struct GenerationBarrier {
    participants: usize,
    state: Mutex<BarrierState>,
    cv: Condvar,
}

struct BarrierState {
    arrived: usize,
    generation: u64,
}

impl GenerationBarrier {
    fn new(participants: usize) -> Self {
        Self {
            participants,
            state: Mutex::new(BarrierState {
                arrived: 0,
                generation: 0,
            }),
            cv: Condvar::new(),
        }
    }

    fn wait(&self) {
        let mut s = self.state.lock().unwrap();
        let generation = s.generation;
        s.arrived += 1;
        if s.arrived == self.participants {
            s.arrived = 0;
            s.generation += 1;
            self.cv.notify_all();
        } else {
            while s.generation == generation {
                s = self.cv.wait(s).unwrap();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// HostFabric — state shared by all participants
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct ExchangeEntry {
    key: GlobalKey,
    owner: InstanceId,
    slot: Arc<LocalMemorySlot>,
    token: u64,
}

struct ExchangeRound {
    entries: Vec<ExchangeEntry>,
    built: usize,
    poisoned: Option<GlobalKey>,
}

impl ExchangeRound {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            built: 0,
            poisoned: None,
        }
    }
}

/// Gather area, barriers and the slot-token registry shared by every
/// participant thread of one host-backend group.
pub struct HostFabric {
    instance_count: usize,
    tokens: Mutex<Slab<Arc<LocalMemorySlot>>>,
    exchanges: Mutex<HashMap<(Tag, u64), ExchangeRound>>,
    barriers: Mutex<HashMap<Tag, Arc<GenerationBarrier>>>,
}

impl HostFabric {
    /// Create a fabric for `instance_count` participant threads.
    pub fn new(instance_count: usize) -> HcrResult<Arc<Self>> {
        if instance_count == 0 {
            return Err(HcrError::InvalidArgument(
                "a fabric needs at least one participant".into(),
            ));
        }
        Ok(Arc::new(Self {
            instance_count,
            tokens: Mutex::new(Slab::new()),
            exchanges: Mutex::new(HashMap::new()),
            barriers: Mutex::new(HashMap::new()),
        }))
    }

    pub fn instance_count(&self) -> usize {
        self.instance_count
    }

    /// Build the communication manager for participant `instance_id`.
    pub fn manager(self: &Arc<Self>, instance_id: InstanceId) -> HcrResult<HostCommunicationManager> {
        if instance_id as usize >= self.instance_count {
            return Err(HcrError::InvalidArgument(format!(
                "instance id {instance_id} out of range for {} participants",
                self.instance_count
            )));
        }
        Ok(HostCommunicationManager {
            fabric: Arc::clone(self),
            instance: instance_id,
            registry: SlotRegistry::new(),
            exchange_rounds: Mutex::new(HashMap::new()),
        })
    }

    fn barrier(&self, tag: Tag) -> Arc<GenerationBarrier> {
        let mut barriers = self.barriers.lock().unwrap();
        Arc::clone(
            barriers
                .entry(tag)
                .or_insert_with(|| Arc::new(GenerationBarrier::new(self.instance_count))),
        )
    }

    fn register_token(&self, slot: Arc<LocalMemorySlot>) -> u64 {
        self.tokens.lock().unwrap().insert(slot) as u64
    }

    fn release_token(&self, token: u64) {
        let mut tokens = self.tokens.lock().unwrap();
        if tokens.contains(token as usize) {
            tokens.remove(token as usize);
        }
    }

    fn lookup_token(&self, token: u64) -> Option<Arc<LocalMemorySlot>> {
        self.tokens.lock().unwrap().get(token as usize).cloned()
    }
}

// ---------------------------------------------------------------------------
// HostMemoryManager
// ---------------------------------------------------------------------------

/// Host memory manager: zeroed, cache-line-aligned heap allocations.
pub struct HostMemoryManager {
    policy: BindingPolicy,
}

impl HostMemoryManager {
    pub fn new(policy: BindingPolicy) -> Self {
        Self { policy }
    }

    pub fn binding_policy(&self) -> BindingPolicy {
        self.policy
    }
}

impl Default for HostMemoryManager {
    fn default() -> Self {
        Self::new(BindingPolicy::FirstTouch)
    }
}

impl MemoryManager for HostMemoryManager {
    fn allocate_local_memory_slot(
        &self,
        space: &MemorySpace,
        size: usize,
    ) -> HcrResult<Arc<LocalMemorySlot>> {
        if size == 0 {
            return Err(HcrError::InvalidArgument("allocation of size zero".into()));
        }
        if space.kind() != "host" {
            return Err(HcrError::InvalidArgument(format!(
                "host memory manager cannot allocate in a '{}' space",
                space.kind()
            )));
        }
        let layout = std::alloc::Layout::from_size_align(size, 64)
            .map_err(|e| HcrError::InvalidArgument(e.to_string()))?;
        // Zeroing doubles as first-touch placement.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(HcrError::BackendFailure(format!(
                "host allocation of {size} bytes failed"
            )));
        }
        trace!("host: allocated {size} byte slot ({:?})", self.policy);
        Ok(LocalMemorySlot::new_owned(space.clone(), ptr, layout))
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
        Ok(LocalMemorySlot::new_registered(space.clone(), ptr, size))
    }
}

// ---------------------------------------------------------------------------
// HostCommunicationManager
// ---------------------------------------------------------------------------

/// One participant's communication manager over a shared [`HostFabric`].
pub struct HostCommunicationManager {
    fabric: Arc<HostFabric>,
    instance: InstanceId,
    registry: SlotRegistry,
    // Per-tag count of exchanges this participant completed; collectives on
    // one tag are totally ordered, so all participants agree on the round.
    exchange_rounds: Mutex<HashMap<Tag, u64>>,
}

impl HostCommunicationManager {
    fn next_exchange_round(&self, tag: Tag) -> u64 {
        let mut rounds = self.exchange_rounds.lock().unwrap();
        let counter = rounds.entry(tag).or_insert(0);
        let round = *counter;
        *counter += 1;
        round
    }
}

impl CommunicationManager for HostCommunicationManager {
    fn instance_id(&self) -> InstanceId {
        self.instance
    }

    fn instance_count(&self) -> usize {
        self.fabric.instance_count
    }

    fn exchange_global_memory_slots(
        &self,
        tag: Tag,
        slots: &[(GlobalKey, Arc<LocalMemorySlot>)],
    ) -> HcrResult<()> {
        let round_id = self.next_exchange_round(tag);
        debug!(
            "host[{}]: exchange tag {tag} round {round_id}, {} contributions",
            self.instance,
            slots.len()
        );

        // Deposit phase. A duplicate key poisons the round instead of
        // returning early, so every participant still reaches the barrier
        // and the failure is observed everywhere.
        {
            let mut rounds = self.fabric.exchanges.lock().unwrap();
            let round = rounds
                .entry((tag, round_id))
                .or_insert_with(ExchangeRound::new);
            for (key, slot) in slots {
                if round.entries.iter().any(|e| e.key == *key) {
                    round.poisoned = Some(*key);
                    continue;
                }
                let token = self.fabric.register_token(Arc::clone(slot));
                round.entries.push(ExchangeEntry {
                    key: *key,
                    owner: self.instance,
                    slot: Arc::clone(slot),
                    token,
                });
            }
        }

        // The implicit internal fence of the exchange.
        self.fabric.barrier(tag).wait();

        // Build phase: materialize one global slot per gathered entry.
        let (entries, poisoned) = {
            let rounds = self.fabric.exchanges.lock().unwrap();
            let round = rounds
                .get(&(tag, round_id))
                .ok_or_else(|| HcrError::BackendFailure("exchange round vanished".into()))?;
            (round.entries.clone(), round.poisoned)
        };

        let result = match poisoned {
            Some(key) => Err(HcrError::DuplicateKey { tag, key }),
            None => entries.iter().try_for_each(|entry| {
                let local = (entry.owner == self.instance).then(|| Arc::clone(&entry.slot));
                let global = GlobalMemorySlot::new(
                    entry.owner,
                    tag,
                    entry.key,
                    entry.slot.size(),
                    local,
                    Window::Host {
                        slot: Arc::clone(&entry.slot),
                        token: entry.token,
                    },
                );
                self.registry.insert(tag, entry.key, global)
            }),
        };

        // Retire the round once every participant has built from it.
        {
            let mut rounds = self.fabric.exchanges.lock().unwrap();
            if let Some(round) = rounds.get_mut(&(tag, round_id)) {
                round.built += 1;
                if round.built == self.fabric.instance_count {
                    rounds.remove(&(tag, round_id));
                }
            }
        }

        result
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
        trace!("host[{}]: fence tag {tag}", self.instance);
        self.fabric.barrier(tag).wait();
        Ok(())
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
        // Counters are shared atomics; every read already observes the
        // latest completed transfers.
        Ok(())
    }

    fn acquire_global_lock(&self, slot: &Arc<GlobalMemorySlot>) -> HcrResult<bool> {
        slot.window_counters().lock_acquire();
        trace!("host[{}]: lock {}:{}", self.instance, slot.tag(), slot.key());
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
        let token = self.fabric.register_token(Arc::clone(slot));
        Ok(GlobalMemorySlot::new(
            self.instance,
            tag,
            token,
            slot.size(),
            Some(Arc::clone(slot)),
            Window::Host {
                slot: Arc::clone(slot),
                token,
            },
        ))
    }

    fn destroy_promoted_global_memory_slot(
        &self,
        slot: &Arc<GlobalMemorySlot>,
    ) -> HcrResult<()> {
        // Only the owner retires the token; a non-owner just drops its view.
        if slot.source_local_memory_slot().is_some() {
            if let Window::Host { token, .. } = slot.window() {
                self.fabric.release_token(*token);
            }
        }
        Ok(())
    }

    fn serialize_global_memory_slot(
        &self,
        slot: &Arc<GlobalMemorySlot>,
    ) -> HcrResult<[u8; GLOBAL_SLOT_WIRE_SIZE]> {
        match slot.window() {
            Window::Host { token, .. } => Ok(SlotWire {
                backend: BACKEND_HOST,
                owner: slot.owner(),
                tag: slot.tag(),
                key: slot.key(),
                size: slot.size() as u64,
                token: *token,
            }
            .to_bytes()),
            Window::Segment { .. } => Err(HcrError::Unsupported(
                "host backend cannot serialize a segment-window slot",
            )),
        }
    }

    fn deserialize_global_memory_slot(
        &self,
        bytes: &[u8],
        tag: Tag,
    ) -> HcrResult<Arc<GlobalMemorySlot>> {
        let wire = SlotWire::from_bytes(bytes)?;
        if wire.backend != BACKEND_HOST {
            return Err(HcrError::InvalidArgument(
                "serialized slot comes from a different backend".into(),
            ));
        }
        let slot = self
            .fabric
            .lookup_token(wire.token)
            .ok_or_else(|| HcrError::InvalidArgument("stale global slot token".into()))?;
        // A deserialized slot is a non-owning reconstruction: no local
        // back-reference even on the owning instance.
        Ok(GlobalMemorySlot::new(
            wire.owner,
            tag,
            wire.key,
            wire.size as usize,
            None,
            Window::Host {
                slot,
                token: wire.token,
            },
        ))
    }

    fn deregister_global_memory_slot(&self, slot: &Arc<GlobalMemorySlot>) -> HcrResult<()> {
        self.registry.remove(slot.tag(), slot.key());
        Ok(())
    }

    fn destroy_global_memory_slot(&self, slot: &Arc<GlobalMemorySlot>) -> HcrResult<()> {
        self.registry.remove(slot.tag(), slot.key());
        if slot.source_local_memory_slot().is_some() {
            if let Window::Host { token, .. } = slot.window() {
                self.fabric.release_token(*token);
            }
        }
        Ok(())
    }
}
