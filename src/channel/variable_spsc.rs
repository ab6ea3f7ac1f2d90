// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Variable-size single-producer single-consumer channel.
//
// Two circular buffers share the work: a counts buffer of per-message size
// tokens and a payload buffer of raw bytes, each with its own coordination
// buffer. A push publishes in two strictly ordered phases — payload bytes
// first (fenced), size token second — so a consumer that observes a size
// has, by transitivity, already received the bytes it describes. The
// consumer's observable depth is the minimum of the counts depth and the
// number of messages whose payload bytes have fully landed.
//
// A payload that would run past the end of the buffer is split into two
// puts; the size token records the logical length, so the wrap is invisible
// to the consumer.

use std::sync::Arc;

use crate::channel::{propagate_counter, SIZE_TOKEN_BYTES};
use crate::circular_buffer::{
    CircularBuffer, COORDINATION_BUFFER_SIZE, HEAD_ADVANCE_OFFSET, TAIL_ADVANCE_OFFSET,
};
use crate::communication::CommunicationManager;
use crate::error::{HcrError, HcrResult};
use crate::slot::{GlobalMemorySlot, LocalMemorySlot};

fn check_capacities(capacity: usize, payload_capacity: usize) -> HcrResult<()> {
    if capacity == 0 {
        return Err(HcrError::InvalidArgument("channel capacity is zero".into()));
    }
    if payload_capacity == 0 {
        return Err(HcrError::InvalidArgument(
            "payload capacity is zero".into(),
        ));
    }
    Ok(())
}

fn check_coordination(slot: &Arc<LocalMemorySlot>) -> HcrResult<()> {
    if slot.size() < COORDINATION_BUFFER_SIZE {
        return Err(HcrError::InvalidArgument(format!(
            "coordination buffer needs {COORDINATION_BUFFER_SIZE} bytes, slot has {}",
            slot.size()
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Producer
// ---------------------------------------------------------------------------

/// Producer endpoint of a variable-size SPSC channel.
pub struct Producer {
    comm: Arc<dyn CommunicationManager>,
    counts: CircularBuffer,
    payloads: CircularBuffer,
    counts_coordination: Arc<LocalMemorySlot>,
    payload_coordination: Arc<LocalMemorySlot>,
    consumer_counts_coordination: Arc<GlobalMemorySlot>,
    consumer_payload_coordination: Arc<GlobalMemorySlot>,
    token_buffer: Arc<GlobalMemorySlot>,
    payload_buffer: Arc<GlobalMemorySlot>,
    size_info: Arc<LocalMemorySlot>,
    capacity: usize,
    payload_capacity: usize,
}

impl Producer {
    /// Build the producer endpoint.
    ///
    /// The two coordination slots are this side's (zeroed) mirrors; the
    /// four global slots are the consumer's exchanged buffers; `size_info`
    /// is an 8-byte scratch slot the size token is staged in.
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
        check_capacities(capacity, payload_capacity)?;
        check_coordination(&counts_coordination)?;
        check_coordination(&payload_coordination)?;
        if token_buffer.size() < capacity * SIZE_TOKEN_BYTES {
            return Err(HcrError::InvalidArgument(format!(
                "size-token buffer holds {} bytes, channel needs {}",
                token_buffer.size(),
                capacity * SIZE_TOKEN_BYTES
            )));
        }
        if payload_buffer.size() < payload_capacity {
            return Err(HcrError::InvalidArgument(format!(
                "payload buffer holds {} bytes, channel needs {payload_capacity}",
                payload_buffer.size()
            )));
        }
        if size_info.size() < SIZE_TOKEN_BYTES {
            return Err(HcrError::InvalidArgument(
                "size-info slot smaller than one size token".into(),
            ));
        }
        let counts = CircularBuffer::new(capacity, Arc::clone(&counts_coordination))?;
        let payloads = CircularBuffer::new(payload_capacity, Arc::clone(&payload_coordination))?;
        Ok(Self {
            comm,
            counts,
            payloads,
            counts_coordination,
            payload_coordination,
            consumer_counts_coordination,
            consumer_payload_coordination,
            token_buffer,
            payload_buffer,
            size_info,
            capacity,
            payload_capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn payload_capacity(&self) -> usize {
        self.payload_capacity
    }

    /// Messages currently unconsumed, as of the latest counter mirror.
    pub fn depth(&self) -> usize {
        self.counts.depth()
    }

    /// Payload bytes currently in flight or unconsumed.
    pub fn payload_depth(&self) -> usize {
        self.payloads.depth()
    }

    /// Push the first `len` bytes of `source` as one message.
    ///
    /// Returns `Full` without side effects when either the message count or
    /// the payload bytes would not fit.
    pub fn push(&self, source: &Arc<LocalMemorySlot>, len: usize) -> HcrResult<()> {
        self.validate_push(source, len)?;
        self.comm.query_memory_slot_updates(&self.counts_coordination)?;
        self.comm.query_memory_slot_updates(&self.payload_coordination)?;
        self.fit_check(len)?;
        self.transmit(source, len)
    }

    pub(crate) fn validate_push(&self, source: &Arc<LocalMemorySlot>, len: usize) -> HcrResult<()> {
        if len == 0 {
            return Err(HcrError::InvalidArgument("push of zero bytes".into()));
        }
        if len > source.size() {
            return Err(HcrError::InvalidArgument(format!(
                "source slot holds {} bytes, push wants {len}",
                source.size()
            )));
        }
        Ok(())
    }

    pub(crate) fn fit_check(&self, len: usize) -> HcrResult<()> {
        if self.counts.depth() + 1 > self.capacity {
            return Err(HcrError::Full);
        }
        if self.payloads.depth() + len > self.payload_capacity {
            return Err(HcrError::Full);
        }
        Ok(())
    }

    /// Both publish phases. The caller has already validated the arguments
    /// and established that the message fits.
    pub(crate) fn transmit(&self, source: &Arc<LocalMemorySlot>, len: usize) -> HcrResult<()> {
        // Phase 1: payload bytes, fenced before anything else becomes
        // visible. A wrap splits the message into two puts; the size token
        // will carry the logical length.
        let head_pos = self.payloads.head_position();
        if head_pos + len <= self.payload_capacity {
            self.comm
                .put(&self.payload_buffer, head_pos, source, 0, len)?;
            self.comm.fence_slot(source, 1, 0)?;
        } else {
            let first = self.payload_capacity - head_pos;
            self.comm
                .put(&self.payload_buffer, head_pos, source, 0, first)?;
            self.comm
                .put(&self.payload_buffer, 0, source, first, len - first)?;
            self.comm.fence_slot(source, 2, 0)?;
        }
        self.payloads.advance_head(len)?;
        propagate_counter(
            &self.comm,
            &self.consumer_payload_coordination,
            &self.payload_coordination,
            HEAD_ADVANCE_OFFSET,
        )?;

        // Phase 2: the size token, only now that the payload is fenced.
        self.size_info.write_u64(0, len as u64)?;
        let counts_pos = (self.counts.head() as usize) % self.capacity;
        self.comm.put(
            &self.token_buffer,
            counts_pos * SIZE_TOKEN_BYTES,
            &self.size_info,
            0,
            SIZE_TOKEN_BYTES,
        )?;
        self.comm.fence_slot(&self.size_info, 1, 0)?;
        self.counts.advance_head(1)?;
        propagate_counter(
            &self.comm,
            &self.consumer_counts_coordination,
            &self.counts_coordination,
            HEAD_ADVANCE_OFFSET,
        )
    }

    pub(crate) fn comm(&self) -> &Arc<dyn CommunicationManager> {
        &self.comm
    }

    pub(crate) fn counts_coordination(&self) -> &Arc<LocalMemorySlot> {
        &self.counts_coordination
    }

    pub(crate) fn payload_coordination(&self) -> &Arc<LocalMemorySlot> {
        &self.payload_coordination
    }

    pub(crate) fn consumer_counts_coordination(&self) -> &Arc<GlobalMemorySlot> {
        &self.consumer_counts_coordination
    }

    pub(crate) fn consumer_payload_coordination(&self) -> &Arc<GlobalMemorySlot> {
        &self.consumer_payload_coordination
    }
}

// ---------------------------------------------------------------------------
// Consumer
// ---------------------------------------------------------------------------

/// Consumer endpoint of a variable-size SPSC channel.
pub struct Consumer {
    comm: Arc<dyn CommunicationManager>,
    counts: CircularBuffer,
    payloads: CircularBuffer,
    token_buffer: Arc<LocalMemorySlot>,
    payload_buffer: Arc<LocalMemorySlot>,
    counts_coordination: Arc<LocalMemorySlot>,
    payload_coordination: Arc<LocalMemorySlot>,
    // Absent on the shared consumer of a locking MPSC channel, where
    // producers pull the tail state instead of having it pushed.
    producer_counts_coordination: Option<Arc<GlobalMemorySlot>>,
    producer_payload_coordination: Option<Arc<GlobalMemorySlot>>,
    capacity: usize,
    payload_capacity: usize,
}

impl Consumer {
    /// Build the consumer endpoint of a point-to-point channel.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        comm: Arc<dyn CommunicationManager>,
        token_buffer: Arc<LocalMemorySlot>,
        payload_buffer: Arc<LocalMemorySlot>,
        counts_coordination: Arc<LocalMemorySlot>,
        payload_coordination: Arc<LocalMemorySlot>,
        producer_counts_coordination: Arc<GlobalMemorySlot>,
        producer_payload_coordination: Arc<GlobalMemorySlot>,
        capacity: usize,
        payload_capacity: usize,
    ) -> HcrResult<Self> {
        Self::build(
            comm,
            token_buffer,
            payload_buffer,
            counts_coordination,
            payload_coordination,
            Some(producer_counts_coordination),
            Some(producer_payload_coordination),
            capacity,
            payload_capacity,
        )
    }

    /// Build a shared consumer whose producers pull tail state themselves
    /// (locking MPSC).
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn without_producer(
        comm: Arc<dyn CommunicationManager>,
        token_buffer: Arc<LocalMemorySlot>,
        payload_buffer: Arc<LocalMemorySlot>,
        counts_coordination: Arc<LocalMemorySlot>,
        payload_coordination: Arc<LocalMemorySlot>,
        capacity: usize,
        payload_capacity: usize,
    ) -> HcrResult<Self> {
        Self::build(
            comm,
            token_buffer,
            payload_buffer,
            counts_coordination,
            payload_coordination,
            None,
            None,
            capacity,
            payload_capacity,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        comm: Arc<dyn CommunicationManager>,
        token_buffer: Arc<LocalMemorySlot>,
        payload_buffer: Arc<LocalMemorySlot>,
        counts_coordination: Arc<LocalMemorySlot>,
        payload_coordination: Arc<LocalMemorySlot>,
        producer_counts_coordination: Option<Arc<GlobalMemorySlot>>,
        producer_payload_coordination: Option<Arc<GlobalMemorySlot>>,
        capacity: usize,
        payload_capacity: usize,
    ) -> HcrResult<Self> {
        check_capacities(capacity, payload_capacity)?;
        check_coordination(&counts_coordination)?;
        check_coordination(&payload_coordination)?;
        if token_buffer.size() < capacity * SIZE_TOKEN_BYTES {
            return Err(HcrError::InvalidArgument(format!(
                "size-token buffer holds {} bytes, channel needs {}",
                token_buffer.size(),
                capacity * SIZE_TOKEN_BYTES
            )));
        }
        if (token_buffer.as_ptr() as usize) % 8 != 0 {
            return Err(HcrError::InvalidArgument(
                "size-token buffer is not 8-byte aligned".into(),
            ));
        }
        if payload_buffer.size() < payload_capacity {
            return Err(HcrError::InvalidArgument(format!(
                "payload buffer holds {} bytes, channel needs {payload_capacity}",
                payload_buffer.size()
            )));
        }
        let counts = CircularBuffer::new(capacity, Arc::clone(&counts_coordination))?;
        let payloads = CircularBuffer::new(payload_capacity, Arc::clone(&payload_coordination))?;
        Ok(Self {
            comm,
            counts,
            payloads,
            token_buffer,
            payload_buffer,
            counts_coordination,
            payload_coordination,
            producer_counts_coordination,
            producer_payload_coordination,
            capacity,
            payload_capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn payload_capacity(&self) -> usize {
        self.payload_capacity
    }

    /// Poll for head advances the producer mirrored over.
    pub fn update_depth(&self) -> HcrResult<()> {
        self.comm.query_memory_slot_updates(&self.counts_coordination)?;
        self.comm.query_memory_slot_updates(&self.payload_coordination)
    }

    /// Size token of the `index`-th oldest message. The constructor
    /// verified the token buffer's bounds and alignment.
    fn size_at(&self, index: usize) -> usize {
        let pos = ((self.counts.tail() as usize) + index) % self.capacity;
        let cell = unsafe {
            &*(self
                .token_buffer
                .as_ptr()
                .add(pos * SIZE_TOKEN_BYTES) as *const std::sync::atomic::AtomicU64)
        };
        cell.load(std::sync::atomic::Ordering::Acquire) as usize
    }

    /// Observable depth: `min(counts depth, payload-complete messages)`.
    /// A size token published ahead of its bytes (impossible under the
    /// two-phase protocol, but tolerated) is not counted.
    pub fn depth(&self) -> usize {
        let count_depth = self.counts.depth();
        let payload_bytes = self.payloads.depth();
        let mut sum = 0usize;
        let mut complete = 0usize;
        while complete < count_depth {
            let size = self.size_at(complete);
            if sum + size > payload_bytes {
                break;
            }
            sum += size;
            complete += 1;
        }
        complete
    }

    /// `(payload position, size)` of the `index`-th oldest message.
    pub fn peek(&self, index: usize) -> HcrResult<(usize, usize)> {
        if index >= self.capacity {
            return Err(HcrError::InvalidArgument(format!(
                "peek index {index} out of range for capacity {}",
                self.capacity
            )));
        }
        if index >= self.depth() {
            return Err(HcrError::Empty);
        }
        let mut offset = 0usize;
        for i in 0..index {
            offset += self.size_at(i);
        }
        let pos = ((self.payloads.tail() as usize) + offset) % self.payload_capacity;
        Ok((pos, self.size_at(index)))
    }

    /// Copy of the `index`-th oldest message's bytes, rejoining a wrapped
    /// payload.
    pub fn peek_bytes(&self, index: usize) -> HcrResult<Vec<u8>> {
        let (pos, size) = self.peek(index)?;
        let mut out = vec![0u8; size];
        let first = size.min(self.payload_capacity - pos);
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.payload_buffer.as_ptr().add(pos),
                out.as_mut_ptr(),
                first,
            );
            if first < size {
                std::ptr::copy_nonoverlapping(
                    self.payload_buffer.as_ptr(),
                    out.as_mut_ptr().add(first),
                    size - first,
                );
            }
        }
        Ok(out)
    }

    /// The local slot holding the channel's payload bytes.
    pub fn payload_buffer(&self) -> &Arc<LocalMemorySlot> {
        &self.payload_buffer
    }

    pub(crate) fn comm(&self) -> &Arc<dyn CommunicationManager> {
        &self.comm
    }

    /// Advance both tails past the `count` oldest messages without
    /// mirroring anything. Shared-consumer path; also the first half of
    /// [`pop`].
    pub(crate) fn pop_local(&self, count: usize) -> HcrResult<()> {
        if count == 0 || count > self.capacity {
            return Err(HcrError::InvalidArgument(format!(
                "pop of {count} messages out of range for capacity {}",
                self.capacity
            )));
        }
        if count > self.depth() {
            return Err(HcrError::Empty);
        }
        let mut bytes = 0usize;
        for i in 0..count {
            bytes += self.size_at(i);
        }
        self.counts.advance_tail(count)?;
        self.payloads.advance_tail(bytes)?;
        Ok(())
    }

    /// Consume the `count` oldest messages and mirror both tail advances to
    /// the producer.
    pub fn pop(&self, count: usize) -> HcrResult<()> {
        let (counts_peer, payload_peer) = match (
            &self.producer_counts_coordination,
            &self.producer_payload_coordination,
        ) {
            (Some(c), Some(p)) => (c, p),
            _ => {
                return Err(HcrError::InvalidArgument(
                    "shared consumer: producers pull tail state, use the MPSC consumer".into(),
                ))
            }
        };
        self.pop_local(count)?;
        propagate_counter(
            &self.comm,
            counts_peer,
            &self.counts_coordination,
            TAIL_ADVANCE_OFFSET,
        )?;
        propagate_counter(
            &self.comm,
            payload_peer,
            &self.payload_coordination,
            TAIL_ADVANCE_OFFSET,
        )
    }
}
