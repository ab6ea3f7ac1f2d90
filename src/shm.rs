// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Cross-platform named shared memory segment handle, including the naming
// scheme. Application-facing names (prefix + numeric ids) are sanitized
// to an OS-safe form here; the platform layer only ever sees final names.
//
// Segment lifetime is tracked by the bookkeeping header the platform layer
// lays at every mapping base: the last unmapper retires the backing
// object, and the creator-recorded payload size makes reopening
// self-describing.

use std::io;
use std::sync::Arc;

use crate::platform::OsSegment;

/// Open mode for named segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentMode {
    /// Create exclusively — fail if the segment already exists.
    Create,
    /// Open existing — fail if it does not exist.
    Open,
    /// Create if missing, open if it already exists.
    CreateOrOpen,
}

/// Longest OS-level segment name this crate will produce. macOS caps shm
/// names at 31 bytes; elsewhere 255 is safe.
#[cfg(target_os = "macos")]
const NAME_LIMIT: usize = 31;

#[cfg(not(target_os = "macos"))]
const NAME_LIMIT: usize = 255;

/// Fold a byte run into a 32-bit digest (multiply/xor-shift mixing). Only
/// used to stand in for name bytes that had to be dropped, so it needs to
/// be deterministic across processes, not cryptographic.
fn fold_bytes(bytes: &[u8]) -> u32 {
    let mut h = bytes.len() as u64 ^ 0x9e37_79b9_7f4a_7c15;
    for &b in bytes {
        h = (h ^ b as u64).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        h ^= h >> 29;
    }
    (h ^ (h >> 32)) as u32
}

/// Derive the OS-level name for a segment.
///
/// The name is sanitized to `[A-Za-z0-9_]` with a leading '/'. Names that
/// would exceed the platform limit keep their tail — the discriminating
/// parts (instance, uid, tag) are suffixes — and replace the dropped head
/// with a fixed-width digest of it.
fn os_segment_name(name: &str) -> String {
    let body: String = name
        .trim_start_matches('/')
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();

    if body.len() + 1 <= NAME_LIMIT {
        return format!("/{body}");
    }

    // '/' + 8 hex digits + '_' + kept tail == NAME_LIMIT
    let keep = NAME_LIMIT - 10;
    let cut = body.len() - keep;
    let digest = fold_bytes(body[..cut].as_bytes());
    format!("/{digest:08x}_{}", &body[cut..])
}

/// A named, inter-process shared memory segment.
///
/// Fresh payloads come up zero-filled; the headers this crate places at
/// payload starts (slot counters, exchange tables) are all valid in their
/// zeroed state. The last handle to unmap a segment removes its backing
/// object.
pub struct ShmSegment {
    inner: OsSegment,
}

impl ShmSegment {
    /// Acquire a named segment with `size` payload bytes.
    pub fn acquire(name: &str, size: usize, mode: SegmentMode) -> io::Result<Arc<Self>> {
        if name.trim_start_matches('/').is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "name is empty"));
        }
        if size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "size is 0"));
        }
        let os_name = os_segment_name(name);
        let inner = OsSegment::acquire(&os_name, size, mode)?;
        Ok(Arc::new(Self { inner }))
    }

    /// Pointer to the start of the payload.
    pub fn as_ptr(&self) -> *const u8 {
        self.inner.payload_ptr()
    }

    /// Mutable pointer to the start of the payload.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.inner.payload_ptr()
    }

    /// Payload size (the usable portion).
    pub fn user_size(&self) -> usize {
        self.inner.user_size()
    }

    /// Total mapped size (bookkeeping header included).
    pub fn mapped_size(&self) -> usize {
        self.inner.mapped_size()
    }

    /// The OS-level name used to open the segment.
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Whether this handle created the segment.
    pub fn created(&self) -> bool {
        self.inner.created()
    }

    /// Current cross-process count of live mappings.
    pub fn ref_count(&self) -> i32 {
        self.inner.ref_count()
    }

    /// Remove the backing object for a named segment without opening it.
    pub fn remove_by_name(name: &str) {
        OsSegment::unlink_by_name(&os_segment_name(name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_names_pass_through_sanitized() {
        assert_eq!(os_segment_name("cluster_s0_1"), "/cluster_s0_1");
        assert_eq!(os_segment_name("/already"), "/already");
        assert_eq!(os_segment_name("a.b:c"), "/a_b_c");
    }

    #[test]
    fn long_names_keep_their_tail() {
        let long = format!("{}_s3_7f", "p".repeat(300));
        let folded = os_segment_name(&long);
        assert!(folded.len() <= NAME_LIMIT);
        assert!(folded.starts_with('/'));
        // The discriminating suffix survives the fold.
        assert!(folded.ends_with("_s3_7f"));
    }

    #[test]
    fn folding_is_deterministic_and_discriminating() {
        let a = format!("{}_x1", "a".repeat(300));
        let b = format!("{}_x1", "b".repeat(300));
        assert_eq!(os_segment_name(&a), os_segment_name(&a));
        // Same kept tail, different dropped head: digests must differ.
        assert_ne!(os_segment_name(&a), os_segment_name(&b));
    }

    #[test]
    fn fold_mixes_lengths() {
        assert_ne!(fold_bytes(b""), fold_bytes(b"\0"));
        assert_ne!(fold_bytes(b"ab"), fold_bytes(b"ba"));
    }
}
