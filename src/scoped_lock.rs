// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// RAII guard that holds a named mutex for the lifetime of the guard.

use crate::error::Result;
use crate::mutex::{MutexTryAcquireLockResult, NamedMutex};
use crate::mutex_helpers::INFINITE;

/// RAII guard: acquires the mutex on construction, releases it on drop.
pub struct ScopedLock<'a> {
    mutex: &'a NamedMutex,
    abandoned: bool,
}

impl<'a> ScopedLock<'a> {
    /// Acquire `mutex`, waiting as long as it takes.
    pub fn new(mutex: &'a NamedMutex) -> Result<Self> {
        let result = mutex.try_acquire_lock(INFINITE)?;
        Ok(Self {
            mutex,
            abandoned: result == MutexTryAcquireLockResult::AcquiredLockButAbandoned,
        })
    }

    /// Acquire `mutex` within `timeout_ms`; `Ok(None)` on timeout.
    pub fn with_timeout(mutex: &'a NamedMutex, timeout_ms: u32) -> Result<Option<Self>> {
        let abandoned = match mutex.try_acquire_lock(timeout_ms)? {
            MutexTryAcquireLockResult::TimedOut => return Ok(None),
            MutexTryAcquireLockResult::AcquiredLock => false,
            MutexTryAcquireLockResult::AcquiredLockButAbandoned => true,
        };
        Ok(Some(Self { mutex, abandoned }))
    }

    /// Whether the previous owner died while holding the mutex.
    pub fn was_abandoned(&self) -> bool {
        self.abandoned
    }

    pub fn mutex(&self) -> &NamedMutex {
        self.mutex
    }
}

impl Drop for ScopedLock<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.mutex.release_lock() {
            tracing::warn!(name = %self.mutex.id(), error = %err, "Failed to release scoped lock");
        }
    }
}
