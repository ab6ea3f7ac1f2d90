// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Fixed-size single-producer single-consumer channel.
//
// The consumer owns the token buffer and a coordination buffer; the
// producer owns its own coordination buffer. Each side holds the global
// view of the other side's buffers. A push lands the token with a one-sided
// put, fences it, then mirrors the producer's head counter into the
// consumer's coordination buffer; a pop mirrors the consumer's tail counter
// back. Only the tail word travels on pop — the producer never reads the
// consumer's head copy.

use std::sync::Arc;

use crate::channel::propagate_counter;
use crate::circular_buffer::{
    CircularBuffer, COORDINATION_BUFFER_SIZE, HEAD_ADVANCE_OFFSET, TAIL_ADVANCE_OFFSET,
};
use crate::communication::CommunicationManager;
use crate::error::{HcrError, HcrResult};
use crate::slot::{GlobalMemorySlot, LocalMemorySlot};

fn check_geometry(token_size: usize, capacity: usize) -> HcrResult<()> {
    if token_size == 0 {
        return Err(HcrError::InvalidArgument("token size is zero".into()));
    }
    if capacity == 0 {
        return Err(HcrError::InvalidArgument("channel capacity is zero".into()));
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

/// Producer endpoint of a fixed-size SPSC channel.
pub struct Producer {
    comm: Arc<dyn CommunicationManager>,
    circ: CircularBuffer,
    coordination: Arc<LocalMemorySlot>,
    token_buffer: Arc<GlobalMemorySlot>,
    consumer_coordination: Arc<GlobalMemorySlot>,
    token_size: usize,
    capacity: usize,
}

impl Producer {
    /// Build the producer endpoint.
    ///
    /// `coordination` is this side's zeroed coordination buffer (the
    /// consumer mirrors tail advances into it); `token_buffer` and
    /// `consumer_coordination` are the consumer's exchanged slots.
    pub fn new(
        comm: Arc<dyn CommunicationManager>,
        coordination: Arc<LocalMemorySlot>,
        token_buffer: Arc<GlobalMemorySlot>,
        consumer_coordination: Arc<GlobalMemorySlot>,
        token_size: usize,
        capacity: usize,
    ) -> HcrResult<Self> {
        check_geometry(token_size, capacity)?;
        check_coordination(&coordination)?;
        if token_buffer.size() < token_size * capacity {
            return Err(HcrError::InvalidArgument(format!(
                "token buffer holds {} bytes, channel needs {}",
                token_buffer.size(),
                token_size * capacity
            )));
        }
        let circ = CircularBuffer::new(capacity, Arc::clone(&coordination))?;
        Ok(Self {
            comm,
            circ,
            coordination,
            token_buffer,
            consumer_coordination,
            token_size,
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn token_size(&self) -> usize {
        self.token_size
    }

    /// Tokens currently unconsumed, as of the latest counter mirror.
    pub fn depth(&self) -> usize {
        self.circ.depth()
    }

    /// Push `count` tokens read from the start of `source`.
    ///
    /// Returns `Full` without side effects when the channel cannot hold
    /// them; never blocks beyond the internal slot fences.
    pub fn push(&self, source: &Arc<LocalMemorySlot>, count: usize) -> HcrResult<()> {
        if count == 0 {
            return Err(HcrError::InvalidArgument("push of zero tokens".into()));
        }
        if count * self.token_size > source.size() {
            return Err(HcrError::InvalidArgument(format!(
                "source slot holds {} bytes, push needs {}",
                source.size(),
                count * self.token_size
            )));
        }
        self.comm.query_memory_slot_updates(&self.coordination)?;
        if self.circ.depth() + count > self.capacity {
            return Err(HcrError::Full);
        }

        // Land the payload first, fence it, then publish the head advance.
        let head = self.circ.head() as usize;
        for i in 0..count {
            let pos = (head + i) % self.capacity;
            self.comm.put(
                &self.token_buffer,
                pos * self.token_size,
                source,
                i * self.token_size,
                self.token_size,
            )?;
        }
        self.comm.fence_slot(source, count as u64, 0)?;

        self.circ.advance_head(count)?;
        propagate_counter(
            &self.comm,
            &self.consumer_coordination,
            &self.coordination,
            HEAD_ADVANCE_OFFSET,
        )
    }
}

// ---------------------------------------------------------------------------
// Consumer
// ---------------------------------------------------------------------------

/// Consumer endpoint of a fixed-size SPSC channel.
pub struct Consumer {
    comm: Arc<dyn CommunicationManager>,
    circ: CircularBuffer,
    token_buffer: Arc<LocalMemorySlot>,
    coordination: Arc<LocalMemorySlot>,
    producer_coordination: Arc<GlobalMemorySlot>,
    token_size: usize,
    capacity: usize,
}

impl Consumer {
    /// Build the consumer endpoint over its own token and coordination
    /// slots plus the global view of the producer's coordination buffer.
    pub fn new(
        comm: Arc<dyn CommunicationManager>,
        token_buffer: Arc<LocalMemorySlot>,
        coordination: Arc<LocalMemorySlot>,
        producer_coordination: Arc<GlobalMemorySlot>,
        token_size: usize,
        capacity: usize,
    ) -> HcrResult<Self> {
        check_geometry(token_size, capacity)?;
        check_coordination(&coordination)?;
        if token_buffer.size() < token_size * capacity {
            return Err(HcrError::InvalidArgument(format!(
                "token buffer holds {} bytes, channel needs {}",
                token_buffer.size(),
                token_size * capacity
            )));
        }
        let circ = CircularBuffer::new(capacity, Arc::clone(&coordination))?;
        Ok(Self {
            comm,
            circ,
            token_buffer,
            coordination,
            producer_coordination,
            token_size,
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn token_size(&self) -> usize {
        self.token_size
    }

    /// Poll for head advances the producer mirrored over.
    pub fn update_depth(&self) -> HcrResult<()> {
        self.comm.query_memory_slot_updates(&self.coordination)
    }

    /// Tokens currently available.
    pub fn depth(&self) -> usize {
        self.circ.depth()
    }

    /// Ring position of the `index`-th oldest token.
    pub fn peek(&self, index: usize) -> HcrResult<usize> {
        if index >= self.capacity {
            return Err(HcrError::InvalidArgument(format!(
                "peek index {index} out of range for capacity {}",
                self.capacity
            )));
        }
        if index >= self.circ.depth() {
            return Err(HcrError::Empty);
        }
        Ok((self.circ.tail_position() + index) % self.capacity)
    }

    /// Copy of the `index`-th oldest token's bytes.
    pub fn peek_bytes(&self, index: usize) -> HcrResult<Vec<u8>> {
        let pos = self.peek(index)?;
        let mut out = vec![0u8; self.token_size];
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.token_buffer.as_ptr().add(pos * self.token_size),
                out.as_mut_ptr(),
                self.token_size,
            );
        }
        Ok(out)
    }

    /// The local slot holding the channel's tokens.
    pub fn token_buffer(&self) -> &Arc<LocalMemorySlot> {
        &self.token_buffer
    }

    /// Consume the `count` oldest tokens and mirror the tail advance to the
    /// producer.
    pub fn pop(&self, count: usize) -> HcrResult<()> {
        if count == 0 || count > self.capacity {
            return Err(HcrError::InvalidArgument(format!(
                "pop of {count} tokens out of range for capacity {}",
                self.capacity
            )));
        }
        if count > self.circ.depth() {
            return Err(HcrError::Empty);
        }
        self.circ.advance_tail(count)?;
        propagate_counter(
            &self.comm,
            &self.producer_coordination,
            &self.coordination,
            TAIL_ADVANCE_OFFSET,
        )
    }
}
