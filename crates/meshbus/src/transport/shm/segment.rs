// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! POSIX shared memory segment management.
//!
//! Safe wrappers around `shm_open`, `ftruncate` and `mmap`. Unlike a
//! fixed-size ring, memfiles grow with the payload, so the segment keeps
//! its descriptor open to resize (owner) or remap (readers).
//!
//! # Segment Lifecycle
//!
//! 1. Publisher creates the segment with `ShmSegment::create()`
//! 2. Observers open it with `ShmSegment::open()`
//! 3. Publisher grows it with `resize()`; observers follow with `remap()`
//! 4. Publisher calls `ShmSegment::unlink()` when it goes away
//!
//! # Naming Convention
//!
//! Segment names must start with `/` and contain no other `/`.
//! Example: `/mb_4242_1f3a_0`

use super::{Result, ShmError};
use std::ffi::CString;
use std::io;
use std::ptr;

/// Mapped POSIX shared memory segment.
///
/// Unmaps and closes its descriptor on drop. Does NOT unlink.
pub struct ShmSegment {
    ptr: *mut u8,
    size: usize,
    fd: libc::c_int,
    name: String,
}

// SAFETY: the mapping is shared memory designed for concurrent access;
// every shared field inside it is an atomic or guarded by the memfile lock.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

impl ShmSegment {
    /// Create (or replace) a segment of `size` bytes, zero-filled.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        Self::validate_name(name)?;
        let c_name = CString::new(name).map_err(|_| ShmError::InvalidName(name.to_string()))?;

        // SAFETY:
        // - c_name is a valid NUL-terminated string
        // - a stale segment with the same name is removed first (errors ignored)
        // - O_CREAT|O_EXCL either creates a fresh object or fails
        let fd = unsafe {
            libc::shm_unlink(c_name.as_ptr());
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                0o600,
            )
        };
        if fd < 0 {
            return Err(ShmError::SegmentCreate(io::Error::last_os_error()));
        }

        // SAFETY: fd is valid from the successful shm_open above
        if unsafe { libc::ftruncate(fd, size as libc::off_t) } < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is valid and not used after close
            unsafe { libc::close(fd) };
            return Err(ShmError::SegmentCreate(err));
        }

        let ptr = match map(fd, size) {
            Ok(p) => p,
            Err(e) => {
                // SAFETY: fd is valid and not used after close
                unsafe { libc::close(fd) };
                return Err(e);
            }
        };

        // SAFETY: ptr maps exactly `size` writable bytes, no other users yet
        unsafe { ptr::write_bytes(ptr, 0, size) };

        Ok(Self {
            ptr,
            size,
            fd,
            name: name.to_string(),
        })
    }

    /// Open an existing segment, mapping its current full size.
    pub fn open(name: &str) -> Result<Self> {
        Self::validate_name(name)?;
        let c_name = CString::new(name).map_err(|_| ShmError::InvalidName(name.to_string()))?;

        // SAFETY: c_name is valid; mode is ignored without O_CREAT
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::NotFound {
                return Err(ShmError::NotFound(name.to_string()));
            }
            return Err(ShmError::SegmentOpen(err));
        }

        let size = match fd_size(fd) {
            Ok(s) if s > 0 => s,
            Ok(_) => {
                // SAFETY: fd is valid and not used after close
                unsafe { libc::close(fd) };
                return Err(ShmError::NotFound(name.to_string()));
            }
            Err(e) => {
                // SAFETY: fd is valid and not used after close
                unsafe { libc::close(fd) };
                return Err(ShmError::SegmentOpen(e));
            }
        };

        let ptr = match map(fd, size) {
            Ok(p) => p,
            Err(e) => {
                // SAFETY: fd is valid and not used after close
                unsafe { libc::close(fd) };
                return Err(e);
            }
        };

        Ok(Self {
            ptr,
            size,
            fd,
            name: name.to_string(),
        })
    }

    /// Grow the underlying object and remap it (owner side).
    ///
    /// Existing bytes are preserved. All pointers previously obtained from
    /// this segment are invalidated.
    pub fn resize(&mut self, new_size: usize) -> Result<()> {
        if new_size <= self.size {
            return Ok(());
        }
        // SAFETY: self.fd is the descriptor opened in create()/open()
        if unsafe { libc::ftruncate(self.fd, new_size as libc::off_t) } < 0 {
            return Err(ShmError::SegmentCreate(io::Error::last_os_error()));
        }
        self.remap(new_size)
    }

    /// Replace the mapping with one of `new_size` bytes (reader side).
    pub fn remap(&mut self, new_size: usize) -> Result<()> {
        let new_ptr = map(self.fd, new_size)?;
        // SAFETY: old mapping came from mmap with exactly self.size bytes and
        // the &mut receiver guarantees no borrowed slices outlive it
        unsafe { libc::munmap(self.ptr as *mut libc::c_void, self.size) };
        self.ptr = new_ptr;
        self.size = new_size;
        Ok(())
    }

    /// Current size of the shared object (may exceed the mapping).
    pub fn object_size(&self) -> Result<usize> {
        fd_size(self.fd).map_err(ShmError::SegmentOpen)
    }

    fn validate_name(name: &str) -> Result<()> {
        if !name.starts_with('/') {
            return Err(ShmError::InvalidName(format!(
                "Segment name must start with '/': {name}"
            )));
        }
        if name.len() > 1 && name[1..].contains('/') {
            return Err(ShmError::InvalidName(format!(
                "Segment name cannot contain '/' after prefix: {name}"
            )));
        }
        if name.len() > 255 {
            return Err(ShmError::InvalidName(format!(
                "Segment name too long (max 255): {name}"
            )));
        }
        Ok(())
    }

    /// Remove a segment name. Missing segments are not an error.
    pub fn unlink(name: &str) -> Result<()> {
        let c_name = CString::new(name).map_err(|_| ShmError::InvalidName(name.to_string()))?;
        // SAFETY: c_name is valid; only the filesystem namespace is affected
        let ret = unsafe { libc::shm_unlink(c_name.as_ptr()) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::NotFound {
                return Err(ShmError::SegmentOpen(err));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn exists(name: &str) -> bool {
        let Ok(c_name) = CString::new(name) else {
            return false;
        };
        // SAFETY: c_name is valid; the fd is closed right away
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0) };
        if fd >= 0 {
            // SAFETY: fd is valid and not used after close
            unsafe { libc::close(fd) };
            true
        } else {
            false
        }
    }

    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        // SAFETY: ptr/size come from the last successful mmap, fd from
        // shm_open; neither is used after drop
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
            libc::close(self.fd);
        }
    }
}

fn map(fd: libc::c_int, size: usize) -> Result<*mut u8> {
    // SAFETY:
    // - null hint lets the kernel choose the address
    // - fd is a valid shared memory descriptor sized to at least `size`
    // - MAP_FAILED is checked below
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(ShmError::Mmap(io::Error::last_os_error()));
    }
    Ok(ptr as *mut u8)
}

fn fd_size(fd: libc::c_int) -> io::Result<usize> {
    // SAFETY: zeroed stat is a valid out-parameter for fstat
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    // SAFETY: fd is valid and st is writable
    if unsafe { libc::fstat(fd, &mut st) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(st.st_size as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("/mb_test_{}_{}_{}", tag, std::process::id(), fastrand::u32(..))
    }

    #[test]
    fn test_create_open_share_bytes() {
        let name = unique_name("share");
        let writer = ShmSegment::create(&name, 4096).expect("Failed to create segment");
        let reader = ShmSegment::open(&name).expect("Failed to open segment");
        assert_eq!(reader.size(), 4096);

        // SAFETY: both mappings cover 4096 bytes of the same object
        unsafe {
            *writer.as_ptr().add(100) = 0xAB;
            assert_eq!(*reader.as_ptr().add(100), 0xAB);
        }

        ShmSegment::unlink(&name).expect("Failed to unlink");
        assert!(!ShmSegment::exists(&name));
    }

    #[test]
    fn test_resize_preserves_content_and_reader_remaps() {
        let name = unique_name("grow");
        let mut writer = ShmSegment::create(&name, 4096).expect("Failed to create segment");
        // SAFETY: offset 10 is inside the mapping
        unsafe { *writer.as_ptr().add(10) = 7 };

        let mut reader = ShmSegment::open(&name).expect("Failed to open segment");
        writer.resize(16384).expect("Failed to resize");
        assert_eq!(writer.size(), 16384);
        assert_eq!(reader.object_size().expect("Failed to stat"), 16384);

        reader.remap(16384).expect("Failed to remap");
        // SAFETY: both offsets are inside the new 16 KiB mappings
        unsafe {
            assert_eq!(*reader.as_ptr().add(10), 7);
            *writer.as_ptr().add(16000) = 9;
            assert_eq!(*reader.as_ptr().add(16000), 9);
        }
        ShmSegment::unlink(&name).expect("Failed to unlink");
    }

    #[test]
    fn test_open_missing_is_not_found() {
        let err = ShmSegment::open(&unique_name("missing")).err();
        assert!(matches!(err, Some(ShmError::NotFound(_))));
    }

    #[test]
    fn test_invalid_names() {
        assert!(ShmSegment::create("no_slash", 64).is_err());
        assert!(ShmSegment::create("/a/b", 64).is_err());
        assert!(ShmSegment::unlink("/mb_never_created_segment").is_ok());
    }
}
