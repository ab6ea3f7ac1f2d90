// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Shared-memory backend: slot segments, exchange through per-tag registry
// segments, one-sided transfers with header counters, handle
// serialization via segment reopening, and the in-segment distributed
// lock. Groups here are threads of one process; the segment layer is the
// same one separate processes would map.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use hcr::backend::shm::{ShmCommunicationManager, ShmMemoryManager};
use hcr::{CommunicationManager, HcrError, MemoryManager, MemorySpace};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_prefix(stem: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("hcrshm_{stem}_{}_{n}", std::process::id())
}

fn shm_space() -> MemorySpace {
    MemorySpace::new(0, "shm", 0)
}

#[test]
fn exchange_put_and_read_back() {
    const TAG: u64 = 1;
    let prefix = unique_prefix("xchg");

    std::thread::scope(|s| {
        let prefix0 = prefix.clone();
        s.spawn(move || {
            let comm = ShmCommunicationManager::new(&prefix0, 0, 2).unwrap();
            let mm = ShmMemoryManager::new(&prefix0, 0);
            let slot = mm.allocate_local_memory_slot(&shm_space(), 64).unwrap();

            comm.exchange_global_memory_slots(TAG, &[(0, Arc::clone(&slot))])
                .unwrap();
            let own_view = comm.get_global_memory_slot(TAG, 0).unwrap();
            assert_eq!(own_view.owner(), 0);
            assert!(own_view.source_local_memory_slot().is_some());

            comm.fence(TAG).unwrap();
            // The peer's put is complete and counted.
            assert_eq!(slot.read_u64(0).unwrap(), 0xC0FFEE);
            assert_eq!(slot.messages_received(), 1);
        });

        let prefix1 = prefix.clone();
        s.spawn(move || {
            let comm = ShmCommunicationManager::new(&prefix1, 1, 2).unwrap();
            let mm = ShmMemoryManager::new(&prefix1, 1);
            comm.exchange_global_memory_slots(TAG, &[]).unwrap();

            let remote = comm.get_global_memory_slot(TAG, 0).unwrap();
            assert_eq!(remote.owner(), 0);
            assert!(remote.source_local_memory_slot().is_none());

            let scratch = mm.allocate_local_memory_slot(&shm_space(), 8).unwrap();
            scratch.write_u64(0, 0xC0FFEE).unwrap();
            comm.put(&remote, 0, &scratch, 0, 8).unwrap();
            comm.fence_slot(&scratch, 1, 0).unwrap();
            comm.fence(TAG).unwrap();
        });
    });
}

#[test]
fn registered_memory_cannot_be_exchanged() {
    const TAG: u64 = 2;
    let prefix = unique_prefix("reg");

    let comm = ShmCommunicationManager::new(&prefix, 0, 1).unwrap();
    let mm = ShmMemoryManager::new(&prefix, 0);

    let mut backing = [0u8; 64];
    let registered = mm
        .register_local_memory_slot(&shm_space(), backing.as_mut_ptr(), 64)
        .unwrap();

    let err = comm
        .exchange_global_memory_slots(TAG, &[(0, Arc::clone(&registered))])
        .unwrap_err();
    assert!(matches!(err, HcrError::Unsupported(_)));

    let err = comm.promote_local_memory_slot(&registered, TAG).unwrap_err();
    assert!(matches!(err, HcrError::Unsupported(_)));

    // Registered slots still work for local transfers.
    let other = mm.allocate_local_memory_slot(&shm_space(), 64).unwrap();
    comm.memcpy(&other, 0, &registered, 0, 32).unwrap();
}

#[test]
fn duplicate_key_fails_everywhere() {
    const TAG: u64 = 3;
    let prefix = unique_prefix("dup");

    std::thread::scope(|s| {
        for i in 0..2u64 {
            let prefix = prefix.clone();
            s.spawn(move || {
                let comm = ShmCommunicationManager::new(&prefix, i, 2).unwrap();
                let mm = ShmMemoryManager::new(&prefix, i);
                let slot = mm.allocate_local_memory_slot(&shm_space(), 32).unwrap();
                let err = comm
                    .exchange_global_memory_slots(TAG, &[(7, slot)])
                    .unwrap_err();
                assert!(matches!(err, HcrError::DuplicateKey { tag: TAG, key: 7 }));
            });
        }
    });
}

#[test]
fn promote_serialize_reopen() {
    const TAG: u64 = 4;
    let prefix = unique_prefix("wire");

    let comm = ShmCommunicationManager::new(&prefix, 0, 1).unwrap();
    let mm = ShmMemoryManager::new(&prefix, 0);

    let slot = mm.allocate_local_memory_slot(&shm_space(), 128).unwrap();
    slot.write_u64(0, 31337).unwrap();

    let promoted = comm.promote_local_memory_slot(&slot, TAG).unwrap();
    let wire = comm.serialize_global_memory_slot(&promoted).unwrap();

    // The wire form reopens the slot's segment by name.
    let rebuilt = comm.deserialize_global_memory_slot(&wire, TAG).unwrap();
    assert_eq!(rebuilt.owner(), 0);
    assert_eq!(rebuilt.size(), 128);
    assert!(rebuilt.source_local_memory_slot().is_none());
    assert_eq!(comm.serialize_global_memory_slot(&rebuilt).unwrap(), wire);

    let probe = mm.allocate_local_memory_slot(&shm_space(), 8).unwrap();
    comm.get(&probe, 0, &rebuilt, 0, 8).unwrap();
    comm.fence_slot(&probe, 0, 1).unwrap();
    assert_eq!(probe.read_u64(0).unwrap(), 31337);

    comm.destroy_promoted_global_memory_slot(&promoted).unwrap();
}

// Two participants increment a shared word under the segment-header lock.
#[test]
fn lock_mutual_exclusion() {
    const TAG: u64 = 5;
    const ITERATIONS: u64 = 50;
    let prefix = unique_prefix("lock");

    let result = Arc::new(std::sync::Mutex::new(0u64));

    std::thread::scope(|s| {
        for i in 0..2u64 {
            let prefix = prefix.clone();
            let result = Arc::clone(&result);
            s.spawn(move || {
                let comm = ShmCommunicationManager::new(&prefix, i, 2).unwrap();
                let mm = ShmMemoryManager::new(&prefix, i);
                let contribution: Vec<_> = (i == 0)
                    .then(|| mm.allocate_local_memory_slot(&shm_space(), 8).unwrap())
                    .into_iter()
                    .map(|slot| (0u64, slot))
                    .collect();
                comm.exchange_global_memory_slots(TAG, &contribution).unwrap();

                let counter = comm.get_global_memory_slot(TAG, 0).unwrap();
                let scratch = mm.allocate_local_memory_slot(&shm_space(), 8).unwrap();
                for _ in 0..ITERATIONS {
                    assert!(comm.acquire_global_lock(&counter).unwrap());
                    comm.get(&scratch, 0, &counter, 0, 8).unwrap();
                    comm.fence_slot(&scratch, 0, 1).unwrap();
                    let value = scratch.read_u64(0).unwrap();
                    scratch.write_u64(0, value + 1).unwrap();
                    comm.put(&counter, 0, &scratch, 0, 8).unwrap();
                    comm.fence_slot(&scratch, 1, 0).unwrap();
                    comm.release_global_lock(&counter).unwrap();
                }
                comm.fence(TAG).unwrap();

                if i == 0 {
                    let final_slot = counter.source_local_memory_slot().unwrap();
                    *result.lock().unwrap() = final_slot.read_u64(0).unwrap();
                }
            });
        }
    });

    assert_eq!(*result.lock().unwrap(), 2 * ITERATIONS);
}

#[test]
fn counters_visible_through_both_views() {
    const TAG: u64 = 6;
    let prefix = unique_prefix("ctr");

    let comm = ShmCommunicationManager::new(&prefix, 0, 1).unwrap();
    let mm = ShmMemoryManager::new(&prefix, 0);

    let slot = mm.allocate_local_memory_slot(&shm_space(), 64).unwrap();
    comm.exchange_global_memory_slots(TAG, &[(0, Arc::clone(&slot))])
        .unwrap();
    let global = comm.get_global_memory_slot(TAG, 0).unwrap();

    let scratch = mm.allocate_local_memory_slot(&shm_space(), 8).unwrap();
    scratch.write_u64(0, 1).unwrap();
    comm.put(&global, 0, &scratch, 0, 8).unwrap();

    // The local slot and its global view share one counter block in the
    // segment header.
    comm.query_memory_slot_updates(&slot).unwrap();
    assert_eq!(slot.messages_received(), 1);
    assert_eq!(scratch.messages_sent(), 1);
}
