// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// RPC seam for tasking runtimes: fixed POD request/response descriptors
// submitted through a shared MPSC channel and answered over per-client
// SPSC reply channels. Strictly poll-driven — a scheduler parks work on
// "server has requests" / "client has a response" predicates and re-polls;
// no callback crosses the transport.

use std::collections::HashMap;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use log::trace;

use crate::channel::fixed_spsc;
use crate::channel::variable_mpsc::{LockingConsumer, LockingProducer};
use crate::error::{HcrError, HcrResult};
use crate::slot::LocalMemorySlot;
use crate::spin_lock::adaptive_yield;
use crate::InstanceId;

/// Request descriptor submitted to an [`RpcServer`].
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct RpcRequest {
    pub request_id: u64,
    pub function_id: u64,
    pub argument: u64,
    pub reply_instance: u64,
}

/// Response descriptor returned to the submitter.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct RpcResponse {
    pub request_id: u64,
    pub status: u64,
    pub value: u64,
    reserved: u64,
}

pub const RPC_REQUEST_SIZE: usize = std::mem::size_of::<RpcRequest>();
pub const RPC_RESPONSE_SIZE: usize = std::mem::size_of::<RpcResponse>();

pub const RPC_STATUS_OK: u64 = 0;
pub const RPC_STATUS_NO_HANDLER: u64 = 1;

/// Handler bound to one function id.
pub type RpcHandler = Box<dyn FnMut(&RpcRequest) -> u64 + Send>;

/// Copy a POD's bytes into a staging slot.
fn stage(slot: &Arc<LocalMemorySlot>, bytes: &[u8]) -> HcrResult<()> {
    if bytes.len() > slot.size() {
        return Err(HcrError::OutOfRange {
            offset: 0,
            size: bytes.len(),
            slot_size: slot.size(),
        });
    }
    unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), slot.as_ptr(), bytes.len()) };
    Ok(())
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Serves requests arriving on a shared MPSC channel; replies go out on
/// one fixed-size SPSC channel per client, keyed by instance id.
pub struct RpcServer {
    requests: LockingConsumer,
    replies: HashMap<InstanceId, fixed_spsc::Producer>,
    scratch: Arc<LocalMemorySlot>,
    handlers: HashMap<u64, RpcHandler>,
}

impl RpcServer {
    /// `scratch` stages outgoing responses; it needs [`RPC_RESPONSE_SIZE`]
    /// bytes.
    pub fn new(
        requests: LockingConsumer,
        replies: HashMap<InstanceId, fixed_spsc::Producer>,
        scratch: Arc<LocalMemorySlot>,
    ) -> HcrResult<Self> {
        if scratch.size() < RPC_RESPONSE_SIZE {
            return Err(HcrError::InvalidArgument(format!(
                "response scratch slot needs {RPC_RESPONSE_SIZE} bytes"
            )));
        }
        Ok(Self {
            requests,
            replies,
            scratch,
            handlers: HashMap::new(),
        })
    }

    /// Bind `handler` to `function_id`, replacing any previous binding.
    pub fn register_handler(&mut self, function_id: u64, handler: RpcHandler) {
        self.handlers.insert(function_id, handler);
    }

    /// Serve every pending request. Returns how many were handled.
    pub fn poll(&mut self) -> HcrResult<usize> {
        self.requests.update_depth()?;
        let mut served = 0usize;
        while self.requests.depth() > 0 {
            let bytes = self.requests.peek_bytes(0)?;
            if bytes.len() != RPC_REQUEST_SIZE {
                return Err(HcrError::InvalidArgument(format!(
                    "malformed request of {} bytes",
                    bytes.len()
                )));
            }
            let request: RpcRequest = bytemuck::pod_read_unaligned(&bytes);
            self.requests.pop(1)?;
            trace!(
                "rpc: request {} fn {} from instance {}",
                request.request_id,
                request.function_id,
                request.reply_instance
            );

            let (status, value) = match self.handlers.get_mut(&request.function_id) {
                Some(handler) => (RPC_STATUS_OK, handler(&request)),
                None => (RPC_STATUS_NO_HANDLER, 0),
            };
            let response = RpcResponse {
                request_id: request.request_id,
                status,
                value,
                reserved: 0,
            };

            let producer = self.replies.get(&request.reply_instance).ok_or_else(|| {
                HcrError::InvalidArgument(format!(
                    "no reply channel for instance {}",
                    request.reply_instance
                ))
            })?;
            stage(&self.scratch, bytemuck::bytes_of(&response))?;
            // The reply ring drains as the client polls; wait out a full
            // window rather than dropping a handled request.
            let mut k = 0u32;
            loop {
                match producer.push(&self.scratch, 1) {
                    Err(HcrError::Full) => adaptive_yield(&mut k),
                    other => break other?,
                }
            }
            served += 1;
        }
        Ok(served)
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Submits requests and polls for their responses.
pub struct RpcClient {
    requests: LockingProducer,
    replies: fixed_spsc::Consumer,
    scratch: Arc<LocalMemorySlot>,
    instance: InstanceId,
    next_request: u64,
}

impl RpcClient {
    /// `scratch` stages outgoing requests; it needs [`RPC_REQUEST_SIZE`]
    /// bytes.
    pub fn new(
        instance: InstanceId,
        requests: LockingProducer,
        replies: fixed_spsc::Consumer,
        scratch: Arc<LocalMemorySlot>,
    ) -> HcrResult<Self> {
        if scratch.size() < RPC_REQUEST_SIZE {
            return Err(HcrError::InvalidArgument(format!(
                "request scratch slot needs {RPC_REQUEST_SIZE} bytes"
            )));
        }
        Ok(Self {
            requests,
            replies,
            scratch,
            instance,
            next_request: 0,
        })
    }

    /// Submit a request; returns its id. `Full` is retryable and does not
    /// burn an id.
    pub fn submit(&mut self, function_id: u64, argument: u64) -> HcrResult<u64> {
        let request = RpcRequest {
            request_id: self.next_request,
            function_id,
            argument,
            reply_instance: self.instance,
        };
        stage(&self.scratch, bytemuck::bytes_of(&request))?;
        self.requests.push(&self.scratch, RPC_REQUEST_SIZE)?;
        self.next_request += 1;
        Ok(request.request_id)
    }

    /// Take the next pending response, if any arrived.
    pub fn poll_response(&mut self) -> HcrResult<Option<RpcResponse>> {
        self.replies.update_depth()?;
        if self.replies.depth() == 0 {
            return Ok(None);
        }
        let bytes = self.replies.peek_bytes(0)?;
        if bytes.len() != RPC_RESPONSE_SIZE {
            return Err(HcrError::InvalidArgument(format!(
                "malformed response of {} bytes",
                bytes.len()
            )));
        }
        let response: RpcResponse = bytemuck::pod_read_unaligned(&bytes);
        self.replies.pop(1)?;
        Ok(Some(response))
    }
}
