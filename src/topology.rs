// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Topology tree consumed by the runtime: devices expose compute resources
// and memory spaces; the communication core only ever holds MemorySpace
// handles and uses them as allocation targets. The tree serializes to a
// fixed JSON shape so instances can exchange what they see.

use serde::{Deserialize, Serialize};

use crate::error::HcrResult;
use crate::HcrError;

/// Opaque handle to a backend-specific allocation domain (host RAM, a NUMA
/// node, device DRAM). Cheap to clone; identity is `(kind, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemorySpace {
    #[serde(rename = "Id")]
    id: u64,
    #[serde(rename = "Type")]
    kind: String,
    #[serde(rename = "Size")]
    size: usize,
}

impl MemorySpace {
    pub fn new(id: u64, kind: impl Into<String>, size: usize) -> Self {
        Self {
            id,
            kind: kind.into(),
            size,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Backend identifier string ("host", "shm", ...).
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Capacity of the allocation domain in bytes (0 when unknown).
    pub fn size(&self) -> usize {
        self.size
    }
}

/// A processing element within a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeResource {
    #[serde(rename = "Type")]
    kind: String,
    #[serde(rename = "Index")]
    index: usize,
}

impl ComputeResource {
    pub fn new(kind: impl Into<String>, index: usize) -> Self {
        Self {
            kind: kind.into(),
            index,
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

/// A device groups the compute resources and memory spaces it exposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    #[serde(rename = "Type")]
    kind: String,
    #[serde(rename = "Compute Resources")]
    compute_resources: Vec<ComputeResource>,
    #[serde(rename = "Memory Spaces")]
    memory_spaces: Vec<MemorySpace>,
}

impl Device {
    pub fn new(
        kind: impl Into<String>,
        compute_resources: Vec<ComputeResource>,
        memory_spaces: Vec<MemorySpace>,
    ) -> Self {
        Self {
            kind: kind.into(),
            compute_resources,
            memory_spaces,
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn compute_resources(&self) -> &[ComputeResource] {
        &self.compute_resources
    }

    pub fn memory_spaces(&self) -> &[MemorySpace] {
        &self.memory_spaces
    }
}

/// The topology tree an instance observes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    #[serde(rename = "Devices")]
    devices: Vec<Device>,
    #[serde(rename = "Metadata", default)]
    metadata: serde_json::Map<String, serde_json::Value>,
}

impl Topology {
    pub fn new(devices: Vec<Device>) -> Self {
        Self {
            devices,
            metadata: serde_json::Map::new(),
        }
    }

    /// Enumerate the host: one device with one compute resource per logical
    /// CPU and a single RAM memory space.
    pub fn host() -> Self {
        let cpus = (0..num_cpus::get())
            .map(|i| ComputeResource::new("cpu", i))
            .collect();
        let memory_spaces = vec![MemorySpace::new(0, "host", host_ram_bytes())];
        let mut metadata = serde_json::Map::new();
        metadata.insert(
            "Platform".to_string(),
            serde_json::Value::String(std::env::consts::OS.to_string()),
        );
        Self {
            devices: vec![Device::new("host", cpus, memory_spaces)],
            metadata,
        }
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn metadata(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut serde_json::Map<String, serde_json::Value> {
        &mut self.metadata
    }

    /// First memory space of the first device, the common single-space case.
    pub fn first_memory_space(&self) -> Option<&MemorySpace> {
        self.devices.first().and_then(|d| d.memory_spaces.first())
    }

    pub fn to_json(&self) -> HcrResult<String> {
        serde_json::to_string(self).map_err(|e| HcrError::BackendFailure(e.to_string()))
    }

    pub fn from_json(json: &str) -> HcrResult<Self> {
        serde_json::from_str(json).map_err(|e| HcrError::InvalidArgument(e.to_string()))
    }
}

/// Physical RAM in bytes, 0 when the platform gives no answer.
fn host_ram_bytes() -> usize {
    #[cfg(unix)]
    {
        let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) };
        if pages > 0 && page_size > 0 {
            return (pages as usize).saturating_mul(page_size as usize);
        }
        0
    }
    #[cfg(not(unix))]
    {
        0
    }
}
