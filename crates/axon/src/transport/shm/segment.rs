// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 axon contributors

//! POSIX shared-memory segment with RAII unmapping.
//!
//! Wraps `shm_open` + `ftruncate` + `mmap`. The mapping is released on
//! every exit path (including panics) through `Drop`; unlinking the name
//! is the creator's explicit responsibility because readers may still
//! hold their own mappings.

use super::{Result, ShmError};
use std::ffi::CString;
use std::io;
use std::ptr;

/// A mapped POSIX shared-memory segment.
///
/// Created read-write by the owning writer, opened (also `MAP_SHARED`)
/// by readers. Readers only ever store to the synchronization words in
/// the header area; payload bytes are written by the single writer.
pub struct ShmSegment {
    ptr: *mut u8,
    size: usize,
    name: String,
}

// SAFETY: the pointer targets a MAP_SHARED region designed for
// cross-process access; all concurrent mutation goes through atomics
// embedded in the mapped structures.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

impl ShmSegment {
    /// Create a fresh segment of `size` bytes, zero-initialized.
    ///
    /// If the name is already taken (orphan of a crashed process: our
    /// names carry a per-run random suffix, so a live collision cannot
    /// happen), the orphan is unlinked and creation retried once.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        Self::validate_name(name)?;
        let c_name = CString::new(name).map_err(|_| ShmError::InvalidName(name.to_string()))?;

        let mut fd = Self::shm_open_excl(&c_name);
        if fd < 0 && io::Error::last_os_error().kind() == io::ErrorKind::AlreadyExists {
            log::debug!("[SHM] unlinking orphaned segment {name}");
            // SAFETY: c_name is a valid NUL-terminated string; unlink on a
            // nonexistent name is harmless.
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
            fd = Self::shm_open_excl(&c_name);
        }
        if fd < 0 {
            return Err(ShmError::SegmentCreate(io::Error::last_os_error()));
        }

        // SAFETY: fd is the valid descriptor returned above; size is the
        // caller-requested mapping length.
        let rc = unsafe { libc::ftruncate(fd, size as libc::off_t) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is valid and not used past this error path.
            unsafe { libc::close(fd) };
            return Err(ShmError::SegmentCreate(err));
        }

        let ptr = Self::map(fd, size)?;

        // SAFETY: ptr covers exactly `size` writable bytes just mapped;
        // nothing else references the region yet.
        unsafe { ptr::write_bytes(ptr, 0, size) };

        Ok(Self {
            ptr,
            size,
            name: name.to_string(),
        })
    }

    /// Map an existing segment.
    pub fn open(name: &str, size: usize) -> Result<Self> {
        Self::validate_name(name)?;
        let c_name = CString::new(name).map_err(|_| ShmError::InvalidName(name.to_string()))?;

        // SAFETY: c_name is a valid NUL-terminated string; flags are a
        // plain read-write open of an existing object.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::NotFound {
                return Err(ShmError::NotFound(name.to_string()));
            }
            return Err(ShmError::SegmentOpen(err));
        }

        let ptr = Self::map(fd, size)?;
        Ok(Self {
            ptr,
            size,
            name: name.to_string(),
        })
    }

    /// Open the segment if it exists, otherwise create it atomically.
    ///
    /// Used by the discovery bus, where any process may be first. Unlike
    /// [`Self::create`], an existing segment is adopted, never replaced.
    /// Returns the mapping and whether this call created it.
    pub fn open_or_create(name: &str, size: usize) -> Result<(Self, bool)> {
        loop {
            match Self::open(name, size) {
                Ok(segment) => return Ok((segment, false)),
                Err(ShmError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }

            Self::validate_name(name)?;
            let c_name =
                CString::new(name).map_err(|_| ShmError::InvalidName(name.to_string()))?;
            let fd = Self::shm_open_excl(&c_name);
            if fd < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::AlreadyExists {
                    // Lost the creation race; loop back to open.
                    continue;
                }
                return Err(ShmError::SegmentCreate(err));
            }

            // SAFETY: fd is the valid descriptor from shm_open above.
            let rc = unsafe { libc::ftruncate(fd, size as libc::off_t) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                // SAFETY: fd is valid and unused after this point.
                unsafe { libc::close(fd) };
                return Err(ShmError::SegmentCreate(err));
            }

            let ptr = Self::map(fd, size)?;
            // SAFETY: freshly created mapping of exactly `size` bytes.
            unsafe { ptr::write_bytes(ptr, 0, size) };

            return Ok((
                Self {
                    ptr,
                    size,
                    name: name.to_string(),
                },
                true,
            ));
        }
    }

    fn shm_open_excl(c_name: &CString) -> i32 {
        // SAFETY: c_name is a valid NUL-terminated string; O_EXCL makes
        // creation fail instead of silently adopting an existing object.
        unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                0o600,
            )
        }
    }

    fn map(fd: i32, size: usize) -> Result<*mut u8> {
        // SAFETY: fd is valid; MAP_SHARED + PROT_READ|PROT_WRITE is the
        // standard cross-process mapping. The fd can be closed right after
        // mapping because the mapping holds its own reference.
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
        // SAFETY: fd is valid exactly once here.
        unsafe { libc::close(fd) };

        if ptr == libc::MAP_FAILED {
            return Err(ShmError::Mmap(io::Error::last_os_error()));
        }
        Ok(ptr.cast())
    }

    fn validate_name(name: &str) -> Result<()> {
        let valid = name.starts_with('/') && !name[1..].contains('/') && name.len() <= 255;
        if valid {
            Ok(())
        } else {
            Err(ShmError::InvalidName(name.to_string()))
        }
    }

    /// Remove the name from the namespace. Existing mappings stay valid
    /// until their owners unmap. Missing names are not an error.
    pub fn unlink(name: &str) -> Result<()> {
        let c_name = CString::new(name).map_err(|_| ShmError::InvalidName(name.to_string()))?;
        // SAFETY: c_name is a valid NUL-terminated string.
        let rc = unsafe { libc::shm_unlink(c_name.as_ptr()) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::NotFound {
                return Err(ShmError::SegmentOpen(err));
            }
        }
        Ok(())
    }

    /// Whether a segment with this name currently exists.
    #[must_use]
    pub fn exists(name: &str) -> bool {
        let Ok(c_name) = CString::new(name) else {
            return false;
        };
        // SAFETY: c_name is a valid NUL-terminated string; read-only probe.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0) };
        if fd >= 0 {
            // SAFETY: fd is valid exactly once here.
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
        // SAFETY: ptr/size are exactly the values returned by mmap and
        // Drop runs at most once.
        unsafe {
            libc::munmap(self.ptr.cast(), self.size);
        }
    }
}
