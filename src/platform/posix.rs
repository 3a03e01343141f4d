// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// POSIX plumbing: process/thread identity, flock(2) advisory locks and
// MAP_SHARED file mappings.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::ptr;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Session id of the calling process, used to name session-scoped directories.
pub fn session_id() -> u32 {
    let sid = unsafe { libc::getsid(0) };
    if sid < 0 {
        // Only fails for pid != 0; fall back to our own pid so the scope is
        // at least process-consistent.
        return std::process::id();
    }
    sid as u32
}

pub fn current_process_id() -> u32 {
    std::process::id()
}

/// OS-level id of the calling thread. Recorded in shared state for
/// diagnostics only; in-process ownership uses `std::thread::ThreadId`.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn current_thread_id() -> u64 {
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn current_thread_id() -> u64 {
    unsafe { libc::pthread_self() as usize as u64 }
}

// ---------------------------------------------------------------------------
// Advisory file locks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileLockKind {
    Shared,
    Exclusive,
}

/// Apply `flock(2)` to `file`.
///
/// Returns `Ok(false)` only for a non-blocking attempt that found the lock
/// held elsewhere. A lock already held through the same open file is
/// converted in place (shared ↔ exclusive).
pub fn lock_file(file: &File, kind: FileLockKind, blocking: bool) -> io::Result<bool> {
    let mut operation = match kind {
        FileLockKind::Shared => libc::LOCK_SH,
        FileLockKind::Exclusive => libc::LOCK_EX,
    };
    if !blocking {
        operation |= libc::LOCK_NB;
    }

    loop {
        if unsafe { libc::flock(file.as_raw_fd(), operation) } == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EWOULDBLOCK) if !blocking => return Ok(false),
            _ => return Err(err),
        }
    }
}

pub fn unlock_file(file: &File) -> io::Result<()> {
    if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Holds an `flock` until dropped.
#[derive(Debug)]
pub struct FileLockGuard {
    file: File,
}

impl FileLockGuard {
    /// Wrap a file whose lock has already been acquired.
    pub fn new(file: File) -> Self {
        Self { file }
    }

    pub fn file(&self) -> &File {
        &self.file
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        let _ = unlock_file(&self.file);
    }
}

// ---------------------------------------------------------------------------
// SharedMapping: MAP_SHARED view of a file
// ---------------------------------------------------------------------------

pub struct SharedMapping {
    mem: *mut u8,
    len: usize,
}

// Safety: all access to the mapped contents goes through atomics or the
// locks stored inside them.
unsafe impl Send for SharedMapping {}
unsafe impl Sync for SharedMapping {}

impl SharedMapping {
    /// Map the first `len` bytes of `file` read/write and shared.
    pub fn map(file: &File, len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "size is 0"));
        }
        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if mem == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            mem: mem as *mut u8,
            len,
        })
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.mem
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.mem
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for SharedMapping {
    fn drop(&mut self) {
        if !self.mem.is_null() {
            unsafe { libc::munmap(self.mem as *mut libc::c_void, self.len) };
        }
    }
}
