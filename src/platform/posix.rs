// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// POSIX shared memory segments (shm_open + mmap), carrying the shared
// bookkeeping header at the mapping base.
//
// Create truncates only objects this process made exclusively, so an
// already-sized object is never re-truncated (macOS zeroes contents on
// such calls). Open discovers the mapping size from the object itself via
// fstat and the recorded payload size from the header.

use std::ffi::CString;
use std::io;
use std::ptr;

use crate::platform::{SegmentHeader, SEGMENT_HEADER_SIZE};
use crate::shm::SegmentMode;

pub struct OsSegment {
    base: *mut u8,
    total: usize,
    name: String,
    created: bool,
}

// Safety: the mapped region is process-shared by design; the header is all
// atomics and payload access is coordinated above this layer.
unsafe impl Send for OsSegment {}
unsafe impl Sync for OsSegment {}

fn c_name(name: &str) -> io::Result<CString> {
    CString::new(name.as_bytes()).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// Map the whole object and close the descriptor; the mapping keeps the
/// object alive.
fn map_whole(fd: i32, total: usize) -> io::Result<*mut u8> {
    let mem = unsafe {
        libc::mmap(
            ptr::null_mut(),
            total,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    unsafe { libc::close(fd) };
    if mem == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(mem as *mut u8)
}

impl OsSegment {
    /// Acquire a named segment whose payload holds `user_size` bytes. The
    /// name has already been folded to an OS-safe form.
    pub fn acquire(name: &str, user_size: usize, mode: SegmentMode) -> io::Result<Self> {
        match mode {
            SegmentMode::Create => Self::create(name, user_size),
            SegmentMode::Open => Self::open(name, user_size),
            // Open first; fall back to creating, and if another process
            // wins that race, go around and open what it made.
            SegmentMode::CreateOrOpen => loop {
                match Self::open(name, user_size) {
                    Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {}
                    other => break other,
                }
                match Self::create(name, user_size) {
                    Err(e) if e.raw_os_error() == Some(libc::EEXIST) => continue,
                    other => break other,
                }
            },
        }
    }

    fn create(name: &str, user_size: usize) -> io::Result<Self> {
        let cname = c_name(name)?;
        let fd = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                0o666 as libc::c_uint,
            )
        };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }

        let total = SEGMENT_HEADER_SIZE + user_size;
        if unsafe { libc::ftruncate(fd, total as libc::off_t) } != 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(fd);
                libc::shm_unlink(cname.as_ptr());
            }
            return Err(err);
        }

        let base = match map_whole(fd, total) {
            Ok(base) => base,
            Err(e) => {
                unsafe { libc::shm_unlink(cname.as_ptr()) };
                return Err(e);
            }
        };

        // The object came up zero-filled; publish the header over it.
        unsafe { &*(base as *const SegmentHeader) }.publish(user_size);
        Ok(Self {
            base,
            total,
            name: name.to_string(),
            created: true,
        })
    }

    fn open(name: &str, user_size: usize) -> io::Result<Self> {
        let cname = c_name(name)?;
        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0o666 as libc::c_uint) };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }

        // The object itself knows how big it is.
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut st) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        let total = st.st_size as usize;
        if total < SEGMENT_HEADER_SIZE {
            unsafe { libc::close(fd) };
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "segment smaller than its header",
            ));
        }

        let base = map_whole(fd, total)?;
        let recorded = unsafe { &*(base as *const SegmentHeader) }.join();
        if recorded < user_size {
            unsafe { &*(base as *const SegmentHeader) }.leave();
            unsafe { libc::munmap(base as *mut libc::c_void, total) };
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("segment holds {recorded} bytes, caller expected {user_size}"),
            ));
        }

        Ok(Self {
            base,
            total,
            name: name.to_string(),
            created: false,
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

    /// Total mapped bytes (header + payload).
    pub fn mapped_size(&self) -> usize {
        self.total
    }

    /// OS-level name (with leading '/').
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this handle created the object.
    pub fn created(&self) -> bool {
        self.created
    }

    /// Current number of live mappings.
    pub fn ref_count(&self) -> i32 {
        self.header().mappings() as i32
    }

    /// Remove a named segment's backing object without opening it.
    pub fn unlink_by_name(name: &str) {
        if let Ok(cname) = c_name(name) {
            unsafe { libc::shm_unlink(cname.as_ptr()) };
        }
    }
}

impl Drop for OsSegment {
    fn drop(&mut self) {
        if self.base.is_null() {
            return;
        }
        // Last mapping out retires the object, then everyone unmaps.
        if self.header().leave() == 0 {
            Self::unlink_by_name(&self.name);
        }
        unsafe { libc::munmap(self.base as *mut libc::c_void, self.total) };
    }
}
