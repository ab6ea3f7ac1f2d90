// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Windows shared memory segments (named, pagefile-backed file mappings),
// carrying the shared bookkeeping header at the mapping base. The recorded
// payload size makes opening self-describing, so no address-space query is
// needed to learn an existing mapping's extent; the kernel reclaims named
// mappings once the last handle closes, so retiring a segment is implicit.

use std::io;
use std::ptr;

use crate::platform::{SegmentHeader, SEGMENT_HEADER_SIZE};
use crate::shm::SegmentMode;

pub struct OsSegment {
    handle: windows_sys::Win32::Foundation::HANDLE,
    base: *mut u8,
    total: usize,
    name: String,
    created: bool,
}

unsafe impl Send for OsSegment {}
unsafe impl Sync for OsSegment {}

/// Null-terminated UTF-16 form of a mapping name, placed in the
/// session-local kernel namespace.
fn wide_name(name: &str) -> Vec<u16> {
    let mut wide: Vec<u16> = format!("Local\\{}", name.trim_start_matches('/'))
        .encode_utf16()
        .collect();
    wide.push(0);
    wide
}

impl OsSegment {
    pub fn acquire(name: &str, user_size: usize, mode: SegmentMode) -> io::Result<Self> {
        use windows_sys::Win32::Foundation::*;
        use windows_sys::Win32::System::Memory::*;

        let wide = wide_name(name);

        // Strict open goes through OpenFileMappingW; the create modes share
        // one CreateFileMappingW call and disambiguate with the
        // already-exists flag the kernel reports.
        let (handle, opened_existing) = match mode {
            SegmentMode::Open => {
                let h = unsafe { OpenFileMappingW(FILE_MAP_ALL_ACCESS, FALSE, wide.as_ptr()) };
                if h == 0 {
                    return Err(io::Error::last_os_error());
                }
                (h, true)
            }
            SegmentMode::Create | SegmentMode::CreateOrOpen => {
                let total = SEGMENT_HEADER_SIZE + user_size;
                let h = unsafe {
                    CreateFileMappingW(
                        INVALID_HANDLE_VALUE,
                        ptr::null(),
                        PAGE_READWRITE | SEC_COMMIT,
                        (total as u64 >> 32) as u32,
                        total as u32,
                        wide.as_ptr(),
                    )
                };
                let existed = unsafe { GetLastError() } == ERROR_ALREADY_EXISTS;
                if h == 0 {
                    return Err(io::Error::last_os_error());
                }
                if existed && mode == SegmentMode::Create {
                    unsafe { CloseHandle(h) };
                    return Err(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        "segment already exists",
                    ));
                }
                (h, existed)
            }
        };

        let base = unsafe { MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, 0) };
        if base.is_null() {
            let err = io::Error::last_os_error();
            unsafe { CloseHandle(handle) };
            return Err(err);
        }
        let base = base as *mut u8;
        let header = unsafe { &*(base as *const SegmentHeader) };

        let recorded = if opened_existing {
            let recorded = header.join();
            if recorded < user_size {
                header.leave();
                unsafe {
                    UnmapViewOfFile(base as *const _);
                    CloseHandle(handle);
                }
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("segment holds {recorded} bytes, caller expected {user_size}"),
                ));
            }
            recorded
        } else {
            // Fresh mapping, zero-filled by SEC_COMMIT.
            header.publish(user_size);
            user_size
        };

        Ok(Self {
            handle,
            base,
            total: SEGMENT_HEADER_SIZE + recorded,
            name: name.to_string(),
            created: !opened_existing,
        })
    }

    fn header(&self) -> &SegmentHeader {
        unsafe { &*(self.base as *const SegmentHeader) }
    }

    /// Pointer to the payload, past the bookkeeping header.
    pub fn payload_ptr(&self) -> *mut u8 {
        unsafe { self.base.add(SEGMENT_HEADER_SIZE) }
    }

    /// Payload size recorded by the creator.
    pub fn user_size(&self) -> usize {
        self.header().recorded_size()
    }

    /// Total tracked bytes (header + payload).
    pub fn mapped_size(&self) -> usize {
        self.total
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created(&self) -> bool {
        self.created
    }

    pub fn ref_count(&self) -> i32 {
        self.header().mappings() as i32
    }

    pub fn unlink_by_name(_name: &str) {
        // Named mappings vanish with their last handle; nothing to remove.
    }
}

impl Drop for OsSegment {
    fn drop(&mut self) {
        use windows_sys::Win32::Foundation::CloseHandle;
        use windows_sys::Win32::System::Memory::UnmapViewOfFile;

        if !self.base.is_null() {
            self.header().leave();
            unsafe { UnmapViewOfFile(self.base as *const _) };
        }
        if self.handle != 0 {
            unsafe { CloseHandle(self.handle) };
        }
    }
}
