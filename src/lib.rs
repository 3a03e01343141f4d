// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Cross-process named mutexes for POSIX systems, with Windows semantics:
// recursive ownership, timed waits, and abandonment detection when an owner
// thread or process dies. Each mutex lives in a small shared file under a
// runtime directory; see `paths` for the layout.

pub mod config;
pub use config::{Config, LockStrategy};

pub mod error;
pub use error::{Error, NamedMutexError, Result, SharedMemoryError, SystemCallErrors};

pub mod resource_id;
pub use resource_id::ResourceId;

pub mod paths;

mod platform;

mod shm;
pub use shm::{SharedHeader, SharedMemoryType};

mod manager;
pub use manager::SharedMemoryManager;

mod backoff;
mod local_lock;
mod owned;
pub use owned::owned_count;

mod mutex_helpers;
pub use mutex_helpers::INFINITE;

mod mutex;
pub use mutex::{MutexAttributes, MutexTryAcquireLockResult, NamedMutex};

mod scoped_lock;
pub use scoped_lock::ScopedLock;

pub mod handle;
pub use handle::{Handle, HandleTable};
