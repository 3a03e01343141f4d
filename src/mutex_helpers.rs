// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Stateless operations on a process-shared robust pthread mutex stored in a
// shared file. This is the only module that calls pthread_mutex_* directly.

use std::io;

use crate::mutex::MutexTryAcquireLockResult;

/// Timeout value meaning "wait forever".
pub const INFINITE: u32 = u32::MAX;

// ---------------------------------------------------------------------------
// Robust mutex symbols: declared here rather than relying on the `libc`
// crate exposing them for every target.
// ---------------------------------------------------------------------------

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
mod ffi {
    extern "C" {
        pub fn pthread_mutexattr_setrobust(
            attr: *mut libc::pthread_mutexattr_t,
            robustness: libc::c_int,
        ) -> libc::c_int;
        pub fn pthread_mutex_consistent(mutex: *mut libc::pthread_mutex_t) -> libc::c_int;
        pub fn pthread_mutex_timedlock(
            mutex: *mut libc::pthread_mutex_t,
            abstime: *const libc::timespec,
        ) -> libc::c_int;
    }

    pub const PTHREAD_MUTEX_ROBUST: libc::c_int = 1;
}

/// Initialize `mtx` as a process-shared, robust, recursive mutex.
///
/// Called once, by the process that created the shared file, while it still
/// holds the creation lock.
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
pub fn initialize(mtx: *mut libc::pthread_mutex_t) -> io::Result<()> {
    unsafe {
        std::ptr::write_bytes(mtx, 0, 1);

        let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
        let mut eno = libc::pthread_mutexattr_init(&mut attr);
        if eno != 0 {
            return Err(io::Error::from_raw_os_error(eno));
        }

        eno = libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
        if eno == 0 {
            eno = ffi::pthread_mutexattr_setrobust(&mut attr, ffi::PTHREAD_MUTEX_ROBUST);
        }
        if eno == 0 {
            eno = libc::pthread_mutexattr_settype(&mut attr, libc::PTHREAD_MUTEX_RECURSIVE);
        }
        if eno == 0 {
            eno = libc::pthread_mutex_init(mtx, &attr);
        }
        libc::pthread_mutexattr_destroy(&mut attr);
        if eno != 0 {
            return Err(io::Error::from_raw_os_error(eno));
        }
    }
    Ok(())
}

/// Destroy `mtx`. Only the last process attached to the shared file may
/// call this, and only while the mutex is unlocked.
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
pub fn destroy(mtx: *mut libc::pthread_mutex_t) {
    let eno = unsafe { libc::pthread_mutex_destroy(mtx) };
    if eno != 0 {
        tracing::warn!(error = %io::Error::from_raw_os_error(eno), "pthread_mutex_destroy failed");
    }
}

/// Try to lock `mtx` within `timeout_ms` (0 = no wait, [`INFINITE`] = block).
///
/// `EOWNERDEAD` means the previous owner died holding the lock: the mutex is
/// marked consistent again and the caller owns it, reported as
/// `AcquiredLockButAbandoned`.
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
pub fn try_acquire_lock(
    mtx: *mut libc::pthread_mutex_t,
    timeout_ms: u32,
) -> io::Result<MutexTryAcquireLockResult> {
    let deadline = (timeout_ms != 0 && timeout_ms != INFINITE).then(|| abs_deadline(timeout_ms));

    loop {
        let eno = unsafe {
            match (timeout_ms, &deadline) {
                (0, _) => libc::pthread_mutex_trylock(mtx),
                (_, Some(ts)) => ffi::pthread_mutex_timedlock(mtx, ts),
                (_, None) => libc::pthread_mutex_lock(mtx),
            }
        };
        match eno {
            0 => return Ok(MutexTryAcquireLockResult::AcquiredLock),
            libc::EBUSY | libc::ETIMEDOUT => return Ok(MutexTryAcquireLockResult::TimedOut),
            libc::EOWNERDEAD => {
                let eno2 = unsafe { ffi::pthread_mutex_consistent(mtx) };
                if eno2 != 0 {
                    return Err(io::Error::from_raw_os_error(eno2));
                }
                return Ok(MutexTryAcquireLockResult::AcquiredLockButAbandoned);
            }
            libc::EINTR => continue,
            _ => return Err(io::Error::from_raw_os_error(eno)),
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
fn abs_deadline(timeout_ms: u32) -> libc::timespec {
    let timeout_ms = timeout_ms as u64;
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
    let ns_total = ts.tv_nsec as u64 + (timeout_ms % 1000) * 1_000_000;
    ts.tv_sec += (timeout_ms / 1000) as libc::time_t + (ns_total / 1_000_000_000) as libc::time_t;
    ts.tv_nsec = (ns_total % 1_000_000_000) as libc::c_long;
    ts
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
pub fn release_lock(mtx: *mut libc::pthread_mutex_t) -> io::Result<()> {
    let eno = unsafe { libc::pthread_mutex_unlock(mtx) };
    if eno != 0 {
        return Err(io::Error::from_raw_os_error(eno));
    }
    Ok(())
}

// Targets without robust mutexes always resolve to the file lock strategy,
// so these are never reached.

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
fn unsupported() -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        "robust process-shared mutexes are not available on this target",
    )
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
pub fn initialize(_mtx: *mut libc::pthread_mutex_t) -> io::Result<()> {
    Err(unsupported())
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
pub fn destroy(_mtx: *mut libc::pthread_mutex_t) {}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
pub fn try_acquire_lock(
    _mtx: *mut libc::pthread_mutex_t,
    _timeout_ms: u32,
) -> io::Result<MutexTryAcquireLockResult> {
    Err(unsupported())
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
pub fn release_lock(_mtx: *mut libc::pthread_mutex_t) -> io::Result<()> {
    Err(unsupported())
}
