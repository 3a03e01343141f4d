// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Per-thread list of named mutexes the thread currently holds.
//
// The list is a thread-local whose destructor runs when the thread exits:
// anything still on it is abandoned, so other threads and processes observe
// `AcquiredLockButAbandoned` instead of waiting forever. Each entry is also
// the mutex's implicit reference, keeping it alive until then.

use std::cell::RefCell;
use std::sync::Arc;

use crate::mutex::NamedMutexProcessData;

#[derive(Default)]
struct OwnedNamedMutexes {
    held: Vec<Arc<NamedMutexProcessData>>,
}

impl Drop for OwnedNamedMutexes {
    fn drop(&mut self) {
        while let Some(data) = self.held.pop() {
            data.abandon();
        }
    }
}

thread_local! {
    static OWNED: RefCell<OwnedNamedMutexes> = RefCell::new(OwnedNamedMutexes::default());
}

/// Whether the calling thread's list still exists; `false` once its
/// destructor has started.
pub(crate) fn is_tracking_available() -> bool {
    OWNED.try_with(|_| ()).is_ok()
}

pub(crate) fn add(data: Arc<NamedMutexProcessData>) {
    if OWNED
        .try_with(|owned| owned.borrow_mut().held.push(Arc::clone(&data)))
        .is_err()
    {
        tracing::warn!(name = %data.id(), "Held mutex not tracked; thread is exiting");
    }
}

/// Unlink `data`; a no-op while the list itself is being torn down.
pub(crate) fn remove(data: &NamedMutexProcessData) {
    let _ = OWNED.try_with(|owned| {
        let mut owned = owned.borrow_mut();
        if let Some(pos) = owned
            .held
            .iter()
            .position(|held| std::ptr::eq(Arc::as_ptr(held), data))
        {
            owned.held.swap_remove(pos);
        }
    });
}

/// Number of named mutexes the calling thread holds.
pub fn owned_count() -> usize {
    OWNED
        .try_with(|owned| owned.borrow().held.len())
        .unwrap_or(0)
}
