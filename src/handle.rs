// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Integer-handle facade over `NamedMutex`, for callers that pass mutexes
// around as plain values (FFI shims, handle-based APIs).
//
// - handles are slab keys, reused after `close_handle`
// - a wait clones the entry out of the table, so one thread blocking on a
//   mutex never stalls other threads' handle operations

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use slab::Slab;

use crate::error::{Error, Result};
use crate::manager::SharedMemoryManager;
use crate::mutex::{MutexAttributes, MutexTryAcquireLockResult, NamedMutex};

/// An opaque reference to an open named mutex in a [`HandleTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(usize);

impl Handle {
    pub fn as_raw(self) -> usize {
        self.0
    }

    pub fn from_raw(raw: usize) -> Self {
        Self(raw)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub struct HandleTable {
    manager: Arc<SharedMemoryManager>,
    slots: Mutex<Slab<Arc<NamedMutex>>>,
}

impl HandleTable {
    pub fn new(manager: Arc<SharedMemoryManager>) -> Self {
        Self {
            manager,
            slots: Mutex::new(Slab::new()),
        }
    }

    /// The table behind the free functions of this module.
    pub fn global() -> &'static HandleTable {
        static GLOBAL: OnceLock<HandleTable> = OnceLock::new();
        GLOBAL.get_or_init(|| HandleTable::new(SharedMemoryManager::global()))
    }

    fn lock_slots(&self) -> MutexGuard<'_, Slab<Arc<NamedMutex>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, mutex: NamedMutex) -> Handle {
        Handle(self.lock_slots().insert(Arc::new(mutex)))
    }

    /// The mutex behind `handle`.
    pub fn get(&self, handle: Handle) -> Result<Arc<NamedMutex>> {
        self.lock_slots()
            .get(handle.0)
            .cloned()
            .ok_or(Error::InvalidHandle(handle.0))
    }

    /// Number of open handles.
    pub fn len(&self) -> usize {
        self.lock_slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_slots().is_empty()
    }

    /// Create or open `name`. Returns the handle and whether the mutex was
    /// newly created.
    pub fn create_mutex(
        &self,
        attributes: MutexAttributes,
        initial_owner: bool,
        name: &str,
    ) -> Result<(Handle, bool)> {
        let mutex = NamedMutex::create_in(&self.manager, name, attributes, initial_owner)?;
        let created = mutex.created_new();
        Ok((self.insert(mutex), created))
    }

    pub fn open_mutex(&self, name: &str) -> Result<Handle> {
        let mutex = NamedMutex::open_in(&self.manager, name, MutexAttributes::default())?;
        Ok(self.insert(mutex))
    }

    pub fn wait_for_mutex(
        &self,
        handle: Handle,
        timeout_ms: u32,
    ) -> Result<MutexTryAcquireLockResult> {
        self.get(handle)?.try_acquire_lock(timeout_ms)
    }

    pub fn release_mutex(&self, handle: Handle) -> Result<()> {
        self.get(handle)?.release_lock()
    }

    /// Invalidate `handle`. The mutex itself goes away with its last handle,
    /// unless the calling thread still owns it.
    pub fn close_handle(&self, handle: Handle) -> Result<()> {
        let mutex = self
            .lock_slots()
            .try_remove(handle.0)
            .ok_or(Error::InvalidHandle(handle.0))?;
        tracing::debug!(handle = %handle, name = %mutex.id(), "Closed handle");
        // Dropped outside the table lock: the last drop takes the manager's
        // creation/deletion lock.
        drop(mutex);
        Ok(())
    }
}

pub fn create_mutex(
    attributes: MutexAttributes,
    initial_owner: bool,
    name: &str,
) -> Result<(Handle, bool)> {
    HandleTable::global().create_mutex(attributes, initial_owner, name)
}

pub fn open_mutex(name: &str) -> Result<Handle> {
    HandleTable::global().open_mutex(name)
}

pub fn wait_for_mutex(handle: Handle, timeout_ms: u32) -> Result<MutexTryAcquireLockResult> {
    HandleTable::global().wait_for_mutex(handle, timeout_ms)
}

pub fn release_mutex(handle: Handle) -> Result<()> {
    HandleTable::global().release_mutex(handle)
}

pub fn close_handle(handle: Handle) -> Result<()> {
    HandleTable::global().close_handle(handle)
}
