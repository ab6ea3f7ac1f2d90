// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Channels are stateless recipes over the communication core: the
// application allocates token/payload/coordination slots, exchanges them
// under a tag of its choosing, and hands the resulting slots to the
// endpoint constructors. The channel layer itself never performs a
// collective; everything is one-sided puts, slot fences and polling.
//
// One SPSC channel has exactly one producer thread and one consumer
// thread. Multi-producer setups either serialize producers through the
// consumer's distributed lock (`variable_mpsc::LockingProducer`) or give
// each producer its own SPSC channel and track arrival order on the
// consumer (`variable_mpsc::NonLockingConsumer`).

pub mod fixed_spsc;
pub mod variable_mpsc;
pub mod variable_spsc;

use std::sync::Arc;

use crate::communication::CommunicationManager;
use crate::error::HcrResult;
use crate::slot::{GlobalMemorySlot, LocalMemorySlot};

/// Size of the per-message size token in variable-size channels.
pub const SIZE_TOKEN_BYTES: usize = 8;

/// Mirror one coordination counter word to the peer: an 8-byte put (kept
/// whole-word by the transfer layer) followed by a slot fence on the
/// source.
pub(crate) fn propagate_counter(
    comm: &Arc<dyn CommunicationManager>,
    dst: &Arc<GlobalMemorySlot>,
    src: &Arc<LocalMemorySlot>,
    offset: usize,
) -> HcrResult<()> {
    comm.put(dst, offset, src, offset, 8)?;
    comm.fence_slot(src, 1, 0)
}
