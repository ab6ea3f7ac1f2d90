// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Channel-core throughput benchmarks.
//
// Run with:
//   cargo bench --bench channel
//
// Groups:
//   variable_spsc — push + pop round trip through the two-phase protocol
//   fixed_spsc    — 8-byte token round trip
//
// Both endpoints live on a single-participant host fabric, so the numbers
// measure the protocol cost (puts, slot fences, counter mirrors), not
// thread wakeups.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use hcr::backend::host::{HostCommunicationManager, HostFabric, HostMemoryManager};
use hcr::channel::{fixed_spsc, variable_spsc, SIZE_TOKEN_BYTES};
use hcr::{CommunicationManager, MemoryManager, MemorySpace, COORDINATION_BUFFER_SIZE};

const SIZES: &[(&str, usize)] = &[("small_48", 48), ("medium_256", 256), ("large_1024", 1024)];

fn host_space() -> MemorySpace {
    MemorySpace::new(0, "host", 0)
}

fn solo_comm() -> Arc<HostCommunicationManager> {
    let fabric = HostFabric::new(1).unwrap();
    Arc::new(fabric.manager(0).unwrap())
}

struct VariableLoop {
    producer: variable_spsc::Producer,
    consumer: variable_spsc::Consumer,
    source: Arc<hcr::LocalMemorySlot>,
}

fn variable_loop(tag: u64, capacity: usize, payload_capacity: usize) -> VariableLoop {
    let comm = solo_comm();
    let mm = HostMemoryManager::default();
    let space = host_space();

    let token_buffer = mm
        .allocate_local_memory_slot(&space, capacity * SIZE_TOKEN_BYTES)
        .unwrap();
    let payload_buffer = mm
        .allocate_local_memory_slot(&space, payload_capacity)
        .unwrap();
    let consumer_counts = mm
        .allocate_local_memory_slot(&space, COORDINATION_BUFFER_SIZE)
        .unwrap();
    let consumer_payload = mm
        .allocate_local_memory_slot(&space, COORDINATION_BUFFER_SIZE)
        .unwrap();
    let producer_counts = mm
        .allocate_local_memory_slot(&space, COORDINATION_BUFFER_SIZE)
        .unwrap();
    let producer_payload = mm
        .allocate_local_memory_slot(&space, COORDINATION_BUFFER_SIZE)
        .unwrap();
    let size_info = mm
        .allocate_local_memory_slot(&space, SIZE_TOKEN_BYTES)
        .unwrap();

    comm.exchange_global_memory_slots(
        tag,
        &[
            (0, Arc::clone(&token_buffer)),
            (1, Arc::clone(&payload_buffer)),
            (2, Arc::clone(&consumer_counts)),
            (3, Arc::clone(&consumer_payload)),
            (4, Arc::clone(&producer_counts)),
            (5, Arc::clone(&producer_payload)),
        ],
    )
    .unwrap();

    let producer = variable_spsc::Producer::new(
        Arc::clone(&comm) as Arc<dyn CommunicationManager>,
        producer_counts,
        producer_payload,
        comm.get_global_memory_slot(tag, 2).unwrap(),
        comm.get_global_memory_slot(tag, 3).unwrap(),
        comm.get_global_memory_slot(tag, 0).unwrap(),
        comm.get_global_memory_slot(tag, 1).unwrap(),
        size_info,
        capacity,
        payload_capacity,
    )
    .unwrap();
    let consumer = variable_spsc::Consumer::new(
        Arc::clone(&comm) as Arc<dyn CommunicationManager>,
        token_buffer,
        payload_buffer,
        consumer_counts,
        consumer_payload,
        comm.get_global_memory_slot(tag, 4).unwrap(),
        comm.get_global_memory_slot(tag, 5).unwrap(),
        capacity,
        payload_capacity,
    )
    .unwrap();

    let source = mm.allocate_local_memory_slot(&space, 4096).unwrap();
    VariableLoop {
        producer,
        consumer,
        source,
    }
}

fn bench_variable_spsc(c: &mut Criterion) {
    let mut group = c.benchmark_group("variable_spsc");
    for &(label, size) in SIZES {
        let lap = variable_loop(1, 16, 8192);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(label), &size, |b, &size| {
            b.iter(|| {
                lap.producer.push(&lap.source, size).unwrap();
                lap.consumer.update_depth().unwrap();
                black_box(lap.consumer.peek(0).unwrap());
                lap.consumer.pop(1).unwrap();
            });
        });
    }
    group.finish();
}

fn bench_fixed_spsc(c: &mut Criterion) {
    const CAPACITY: usize = 64;
    const TOKEN_SIZE: usize = 8;

    let comm = solo_comm();
    let mm = HostMemoryManager::default();
    let space = host_space();

    let token_buffer = mm
        .allocate_local_memory_slot(&space, CAPACITY * TOKEN_SIZE)
        .unwrap();
    let consumer_coordination = mm
        .allocate_local_memory_slot(&space, COORDINATION_BUFFER_SIZE)
        .unwrap();
    let producer_coordination = mm
        .allocate_local_memory_slot(&space, COORDINATION_BUFFER_SIZE)
        .unwrap();
    comm.exchange_global_memory_slots(
        2,
        &[
            (0, Arc::clone(&token_buffer)),
            (1, Arc::clone(&consumer_coordination)),
            (2, Arc::clone(&producer_coordination)),
        ],
    )
    .unwrap();

    let producer = fixed_spsc::Producer::new(
        Arc::clone(&comm) as Arc<dyn CommunicationManager>,
        producer_coordination,
        comm.get_global_memory_slot(2, 0).unwrap(),
        comm.get_global_memory_slot(2, 1).unwrap(),
        TOKEN_SIZE,
        CAPACITY,
    )
    .unwrap();
    let consumer = fixed_spsc::Consumer::new(
        Arc::clone(&comm) as Arc<dyn CommunicationManager>,
        token_buffer,
        consumer_coordination,
        comm.get_global_memory_slot(2, 2).unwrap(),
        TOKEN_SIZE,
        CAPACITY,
    )
    .unwrap();

    let source = mm.allocate_local_memory_slot(&space, TOKEN_SIZE).unwrap();
    source.write_u64(0, 42).unwrap();

    let mut group = c.benchmark_group("fixed_spsc");
    group.throughput(Throughput::Bytes(TOKEN_SIZE as u64));
    group.bench_function("token_roundtrip", |b| {
        b.iter(|| {
            producer.push(&source, 1).unwrap();
            consumer.update_depth().unwrap();
            black_box(consumer.peek(0).unwrap());
            consumer.pop(1).unwrap();
        });
    });
    group.finish();
}

criterion_group!(benches, bench_variable_spsc, bench_fixed_spsc);
criterion_main!(benches);
