// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Variable-size multi-producer single-consumer channels, in two flavours.
//
// Locking: every producer serializes on the distributed lock tied to the
// consumer's counts-coordination slot. Under the lock the producer pulls
// the consumer's authoritative head/tail words into its own mirrors,
// decides fit, and runs the ordinary two-phase publish. The consumer's pop
// takes the same lock and advances its tails in place — producers pull, so
// no tail mirror travels.
//
// Non-locking: the consumer owns one SPSC channel per producer plus a FIFO
// of producer indices recording arrival order as observed by update_depth
// polls. Per-producer order is the SPSC order; cross-producer order is
// whatever the polls observed. The consumer is single-threaded by
// contract, which the &mut receivers make structural.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::channel::variable_spsc;
use crate::circular_buffer::{HEAD_ADVANCE_OFFSET, TAIL_ADVANCE_OFFSET};
use crate::communication::CommunicationManager;
use crate::error::{HcrError, HcrResult};
use crate::slot::{GlobalMemorySlot, LocalMemorySlot};

// ---------------------------------------------------------------------------
// Locking producer
// ---------------------------------------------------------------------------

/// Producer endpoint of a locking MPSC channel.
pub struct LockingProducer {
    inner: variable_spsc::Producer,
}

impl LockingProducer {
    /// Same slot set as the SPSC producer; the consumer's
    /// counts-coordination global slot doubles as the channel's lock.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        comm: Arc<dyn CommunicationManager>,
        counts_coordination: Arc<LocalMemorySlot>,
        payload_coordination: Arc<LocalMemorySlot>,
        consumer_counts_coordination: Arc<GlobalMemorySlot>,
        consumer_payload_coordination: Arc<GlobalMemorySlot>,
        token_buffer: Arc<GlobalMemorySlot>,
        payload_buffer: Arc<GlobalMemorySlot>,
        size_info: Arc<LocalMemorySlot>,
        capacity: usize,
        payload_capacity: usize,
    ) -> HcrResult<Self> {
        Ok(Self {
            inner: variable_spsc::Producer::new(
                comm,
                counts_coordination,
                payload_coordination,
                consumer_counts_coordination,
                consumer_payload_coordination,
                token_buffer,
                payload_buffer,
                size_info,
                capacity,
                payload_capacity,
            )?,
        })
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    pub fn payload_capacity(&self) -> usize {
        self.inner.payload_capacity()
    }

    /// Push one message under the channel lock.
    ///
    /// Returns `Full` (lock released) when the message does not fit; the
    /// caller retries, which is how blocking on a full channel is spelled
    /// here — never while holding the lock.
    pub fn push(&self, source: &Arc<LocalMemorySlot>, len: usize) -> HcrResult<()> {
        self.inner.validate_push(source, len)?;
        let comm = self.inner.comm();
        if !comm.acquire_global_lock(self.inner.consumer_counts_coordination())? {
            return Err(HcrError::LockNotAcquired);
        }
        let result = self.push_locked(source, len);
        comm.release_global_lock(self.inner.consumer_counts_coordination())?;
        result
    }

    fn push_locked(&self, source: &Arc<LocalMemorySlot>, len: usize) -> HcrResult<()> {
        // Another producer may have advanced the heads since our mirrors
        // were last current: pull the consumer's authoritative words first.
        self.pull(
            self.inner.consumer_counts_coordination(),
            self.inner.counts_coordination(),
        )?;
        self.pull(
            self.inner.consumer_payload_coordination(),
            self.inner.payload_coordination(),
        )?;
        self.inner.fit_check(len)?;
        self.inner.transmit(source, len)
    }

    /// One-sided pull of a head/tail pair, word by word so neither counter
    /// can tear.
    fn pull(
        &self,
        remote: &Arc<GlobalMemorySlot>,
        local: &Arc<LocalMemorySlot>,
    ) -> HcrResult<()> {
        let comm = self.inner.comm();
        comm.get(local, HEAD_ADVANCE_OFFSET, remote, HEAD_ADVANCE_OFFSET, 8)?;
        comm.get(local, TAIL_ADVANCE_OFFSET, remote, TAIL_ADVANCE_OFFSET, 8)?;
        comm.fence_slot(local, 0, 2)
    }
}

// ---------------------------------------------------------------------------
// Locking consumer
// ---------------------------------------------------------------------------

/// The single consumer of a locking MPSC channel.
pub struct LockingConsumer {
    inner: variable_spsc::Consumer,
    /// Global view of this side's counts-coordination slot; its lock word
    /// is the channel lock the producers contend on.
    coordination_lock: Arc<GlobalMemorySlot>,
}

impl LockingConsumer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        comm: Arc<dyn CommunicationManager>,
        token_buffer: Arc<LocalMemorySlot>,
        payload_buffer: Arc<LocalMemorySlot>,
        counts_coordination: Arc<LocalMemorySlot>,
        payload_coordination: Arc<LocalMemorySlot>,
        coordination_lock: Arc<GlobalMemorySlot>,
        capacity: usize,
        payload_capacity: usize,
    ) -> HcrResult<Self> {
        Ok(Self {
            inner: variable_spsc::Consumer::without_producer(
                comm,
                token_buffer,
                payload_buffer,
                counts_coordination,
                payload_coordination,
                capacity,
                payload_capacity,
            )?,
            coordination_lock,
        })
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    pub fn payload_capacity(&self) -> usize {
        self.inner.payload_capacity()
    }

    pub fn update_depth(&self) -> HcrResult<()> {
        self.inner.update_depth()
    }

    pub fn depth(&self) -> usize {
        self.inner.depth()
    }

    pub fn peek(&self, index: usize) -> HcrResult<(usize, usize)> {
        self.inner.peek(index)
    }

    pub fn peek_bytes(&self, index: usize) -> HcrResult<Vec<u8>> {
        self.inner.peek_bytes(index)
    }

    pub fn payload_buffer(&self) -> &Arc<LocalMemorySlot> {
        self.inner.payload_buffer()
    }

    /// Consume the `count` oldest messages under the channel lock. The
    /// tails are authoritative here; producers pull them on their next
    /// push.
    pub fn pop(&self, count: usize) -> HcrResult<()> {
        let comm = self.inner.comm();
        if !comm.acquire_global_lock(&self.coordination_lock)? {
            return Err(HcrError::LockNotAcquired);
        }
        let result = self.inner.pop_local(count);
        comm.release_global_lock(&self.coordination_lock)?;
        result
    }
}

// ---------------------------------------------------------------------------
// Non-locking consumer
// ---------------------------------------------------------------------------

/// The single consumer of a non-locking MPSC channel: one SPSC consumer
/// per producer plus an arrival-order FIFO.
pub struct NonLockingConsumer {
    channels: Vec<variable_spsc::Consumer>,
    fifo: VecDeque<usize>,
    /// Messages ever enqueued into the FIFO, per producer.
    seen: Vec<u64>,
    /// Messages popped, per producer.
    consumed: Vec<u64>,
}

impl NonLockingConsumer {
    /// Build over one SPSC consumer per producer, indexed by producer.
    pub fn new(channels: Vec<variable_spsc::Consumer>) -> HcrResult<Self> {
        if channels.is_empty() {
            return Err(HcrError::InvalidArgument(
                "non-locking consumer needs at least one producer channel".into(),
            ));
        }
        let n = channels.len();
        Ok(Self {
            channels,
            fifo: VecDeque::new(),
            seen: vec![0; n],
            consumed: vec![0; n],
        })
    }

    pub fn producer_count(&self) -> usize {
        self.channels.len()
    }

    /// Poll every producer channel and append freshly observed messages to
    /// the FIFO in poll order.
    pub fn update_depth(&mut self) -> HcrResult<()> {
        for index in 0..self.channels.len() {
            self.channels[index].update_depth()?;
            let available = self.channels[index].depth() as u64;
            let pending = self.seen[index] - self.consumed[index];
            for _ in pending..available {
                self.fifo.push_back(index);
                self.seen[index] += 1;
            }
        }
        Ok(())
    }

    /// Messages pending across all producers, as of the last poll.
    pub fn depth(&self) -> usize {
        self.fifo.len()
    }

    /// `(producer index, payload position, size)` of the `index`-th oldest
    /// pending message.
    pub fn peek(&self, index: usize) -> HcrResult<(usize, usize, usize)> {
        if index >= self.fifo.len() {
            return Err(HcrError::Empty);
        }
        let producer = self.fifo[index];
        // Its position within that producer's channel is the number of
        // older FIFO entries naming the same producer.
        let nth = self
            .fifo
            .iter()
            .take(index)
            .filter(|&&c| c == producer)
            .count();
        let (pos, size) = self.channels[producer].peek(nth)?;
        Ok((producer, pos, size))
    }

    /// Copy of the `index`-th oldest pending message's bytes.
    pub fn peek_bytes(&self, index: usize) -> HcrResult<Vec<u8>> {
        if index >= self.fifo.len() {
            return Err(HcrError::Empty);
        }
        let producer = self.fifo[index];
        let nth = self
            .fifo
            .iter()
            .take(index)
            .filter(|&&c| c == producer)
            .count();
        self.channels[producer].peek_bytes(nth)
    }

    /// The payload slot of one producer's channel (for in-place reads).
    pub fn payload_buffer(&self, producer: usize) -> HcrResult<&Arc<LocalMemorySlot>> {
        self.channels
            .get(producer)
            .map(|c| c.payload_buffer())
            .ok_or_else(|| {
                HcrError::InvalidArgument(format!("no producer channel {producer}"))
            })
    }

    /// Consume the `count` oldest pending messages in FIFO order.
    pub fn pop(&mut self, count: usize) -> HcrResult<()> {
        if count == 0 {
            return Err(HcrError::InvalidArgument("pop of zero messages".into()));
        }
        if count > self.fifo.len() {
            return Err(HcrError::Empty);
        }
        for _ in 0..count {
            let Some(producer) = self.fifo.pop_front() else {
                break;
            };
            self.channels[producer].pop(1)?;
            self.consumed[producer] += 1;
        }
        Ok(())
    }
}
