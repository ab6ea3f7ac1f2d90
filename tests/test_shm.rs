// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Named segment lifecycle underneath the shm backend: open modes,
// zero-fill on creation, data visibility between handles, and the
// cross-handle reference counter.

use std::sync::atomic::{AtomicUsize, Ordering};

use hcr::{SegmentMode, ShmSegment};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(stem: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("hcrseg_{stem}_{}_{n}", std::process::id())
}

#[test]
fn create_exclusive() {
    let name = unique_name("create");
    ShmSegment::remove_by_name(&name);

    let seg = ShmSegment::acquire(&name, 1024, SegmentMode::Create).expect("create");
    assert!(seg.user_size() >= 1024);
    assert!(seg.mapped_size() > seg.user_size());
    assert!(!seg.as_ptr().is_null());
    assert!(seg.created());

    // A second exclusive create must fail while the segment exists.
    assert!(ShmSegment::acquire(&name, 1024, SegmentMode::Create).is_err());
}

#[test]
fn open_nonexistent_fails() {
    let name = unique_name("absent");
    ShmSegment::remove_by_name(&name);
    assert!(ShmSegment::acquire(&name, 1024, SegmentMode::Open).is_err());
}

#[test]
fn create_or_open_both_ways() {
    let name = unique_name("both");
    ShmSegment::remove_by_name(&name);

    let first = ShmSegment::acquire(&name, 2048, SegmentMode::CreateOrOpen).expect("create");
    assert!(first.created());
    let second = ShmSegment::acquire(&name, 2048, SegmentMode::CreateOrOpen).expect("open");
    assert!(!second.created());
}

#[test]
fn fresh_segments_are_zeroed() {
    let name = unique_name("zero");
    ShmSegment::remove_by_name(&name);

    let seg = ShmSegment::acquire(&name, 512, SegmentMode::Create).unwrap();
    let bytes = unsafe { std::slice::from_raw_parts(seg.as_ptr(), 512) };
    assert!(bytes.iter().all(|&b| b == 0));
}

#[test]
fn data_visible_across_handles() {
    let name = unique_name("share");
    ShmSegment::remove_by_name(&name);

    let writer = ShmSegment::acquire(&name, 256, SegmentMode::Create).unwrap();
    let reader = ShmSegment::acquire(&name, 256, SegmentMode::Open).unwrap();

    let payload = b"segment shared data";
    unsafe {
        std::ptr::copy_nonoverlapping(payload.as_ptr(), writer.as_mut_ptr(), payload.len());
    }
    let read_back = unsafe { std::slice::from_raw_parts(reader.as_ptr(), payload.len()) };
    assert_eq!(read_back, payload);
}

#[test]
fn reference_count_tracks_handles() {
    let name = unique_name("refs");
    ShmSegment::remove_by_name(&name);

    let first = ShmSegment::acquire(&name, 128, SegmentMode::Create).unwrap();
    assert_eq!(first.ref_count(), 1);

    let second = ShmSegment::acquire(&name, 128, SegmentMode::Open).unwrap();
    assert_eq!(first.ref_count(), 2);
    assert_eq!(second.ref_count(), 2);

    drop(second);
    assert_eq!(first.ref_count(), 1);
}

// The last handle to drop unlinks the backing object, so a later open
// starts from nothing.
#[test]
fn last_drop_unlinks() {
    let name = unique_name("unlink");
    ShmSegment::remove_by_name(&name);

    {
        let seg = ShmSegment::acquire(&name, 128, SegmentMode::Create).unwrap();
        unsafe { seg.as_mut_ptr().write(0xAB) };
    }
    assert!(ShmSegment::acquire(&name, 128, SegmentMode::Open).is_err());
}
