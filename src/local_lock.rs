// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// In-process lock for the file lock strategy.
//
// flock(2) locks belong to the open file, not to a thread, so two threads of
// one process sharing the lock file descriptor would both "own" it. This
// lock makes sure only one thread per process holds (or polls for) the file
// lock at a time. Unlike `std::sync::Mutex`, it can be held across calls and
// released by a later, separate call.

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub(crate) struct ProcessLocalLock {
    locked: Mutex<bool>,
    released: Condvar,
}

impl ProcessLocalLock {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Acquire, waiting at most `timeout` (`None` waits forever).
    /// Returns `false` on timeout.
    pub(crate) fn try_acquire(&self, timeout: Option<Duration>) -> bool {
        let mut locked = self.locked.lock().unwrap_or_else(PoisonError::into_inner);
        match timeout {
            None => {
                while *locked {
                    locked = self
                        .released
                        .wait(locked)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while *locked {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    locked = self
                        .released
                        .wait_timeout(locked, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
        *locked = true;
        true
    }

    pub(crate) fn release(&self) {
        let mut locked = self.locked.lock().unwrap_or_else(PoisonError::into_inner);
        debug_assert!(*locked, "releasing an unlocked process-local lock");
        *locked = false;
        self.released.notify_one();
    }

    pub(crate) fn is_locked(&self) -> bool {
        *self.locked.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
