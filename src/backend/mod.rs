// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Transport backends. A process binds one backend at startup and keeps it:
//
// - `host` — participants are threads of one process sharing an address
//   space; transfers are direct copies, the exchange gather area is an
//   in-process fabric.
// - `shm`  — participants may be separate processes; every slot is a named
//   shared memory segment and exchanges go through per-tag registry
//   segments.
//
// Both implement the same `MemoryManager` / `CommunicationManager`
// capability traits; a backend that cannot express an operation reports
// `Unsupported` rather than approximating it.

pub mod host;
pub mod shm;
